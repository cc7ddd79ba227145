//! Controller mode — the node that owns the cluster.
//!
//! Opens a fresh in-memory store and runs:
//! 1. The engine, deriving desired machines from the blueprint
//! 2. The foreman, pushing minion configs and polling roles
//! 3. One cloud reconciler per (provider, region, namespace)
//! 4. The query/deploy API over a UNIX socket or TCP

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

use flotilla_cloud::{run_clouds, Foreman, RoleSource};
use flotilla_engine::Engine;
use flotilla_state::Conn;

/// Run the controller node.
pub async fn run_controller(listen: String, admin_key_file: Option<PathBuf>) -> anyhow::Result<()> {
    info!("flotilla daemon starting in controller mode");

    let conn = Conn::new();

    let admin_key = match admin_key_file {
        Some(path) => {
            let key = std::fs::read_to_string(&path)?.trim().to_string();
            info!(path = ?path, "admin SSH key loaded");
            Some(key)
        }
        None => None,
    };

    // ── Shutdown signal ────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Background workers ─────────────────────────────────────────
    let engine = Engine::new(conn.clone(), admin_key);
    let engine_handle = tokio::spawn(engine.run(shutdown_rx.clone()));
    info!("engine started");

    let foreman = Arc::new(Foreman::new(conn.clone()));
    let foreman_handle = tokio::spawn(Arc::clone(&foreman).run(shutdown_rx.clone()));
    info!("foreman started");

    let roles: Arc<dyn RoleSource> = foreman;
    let clouds_handle = tokio::spawn(run_clouds(conn.clone(), roles, shutdown_rx));
    info!("cloud reconcilers started");

    // ── API server ─────────────────────────────────────────────────
    let router = flotilla_api::build_router(conn);
    serve_api(router, &listen, shutdown_tx).await?;

    let _ = engine_handle.await;
    let _ = foreman_handle.await;
    let _ = clouds_handle.await;

    info!("controller stopped");
    Ok(())
}

/// Serve the API until ctrl-c, then fan the shutdown out to every
/// worker.
async fn serve_api(
    router: axum::Router,
    listen: &str,
    shutdown_tx: watch::Sender<bool>,
) -> anyhow::Result<()> {
    let shutdown = async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install CTRL+C handler");
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    };

    if let Some(path) = listen.strip_prefix("unix://") {
        // A previous run may have left its socket behind.
        let _ = std::fs::remove_file(path);
        let listener = tokio::net::UnixListener::bind(path)?;
        info!(%listen, "API server starting");
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;
    } else {
        let addr = listen.strip_prefix("tcp://").unwrap_or(listen);
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!(%listen, "API server starting");
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;
    }

    Ok(())
}
