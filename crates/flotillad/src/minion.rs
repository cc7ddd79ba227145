//! Minion mode — one instance on every cluster node.
//!
//! Inserts the node's own row, serves the config RPC the controller
//! pushes into, and runs the leader-only loops (blueprint updater,
//! container scheduler). The loops gate themselves on the Etcd row, so
//! running them everywhere is safe; they only act on the elected
//! leader.

use std::net::SocketAddr;

use tokio::sync::watch;
use tracing::info;

use flotilla_state::{Conn, StoreError, TableType};

/// Run a cluster node.
pub async fn run_minion(listen: SocketAddr) -> anyhow::Result<()> {
    info!("flotilla daemon starting in minion mode");

    let conn = Conn::new();

    // The node's own row; the controller fills it in over the RPC.
    conn.txn(&[TableType::Minion])
        .run(|view| -> Result<(), StoreError> {
            if view.minion_self().is_err() {
                let mut minion = view.insert_minion();
                minion.is_self = true;
                view.commit_minion(minion);
            }
            Ok(())
        })?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let updater_handle = tokio::spawn(flotilla_minion::updater::run(
        conn.clone(),
        shutdown_rx.clone(),
    ));
    info!("blueprint updater started");

    let scheduler_handle = tokio::spawn(flotilla_scheduler::run(conn.clone(), shutdown_rx));
    info!("scheduler started");

    tokio::select! {
        result = flotilla_minion::server::serve(conn, listen) => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    }

    let _ = updater_handle.await;
    let _ = scheduler_handle.await;

    info!("minion stopped");
    Ok(())
}
