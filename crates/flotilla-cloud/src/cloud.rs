//! The cloud reconciler — one instance per (provider, region,
//! namespace).
//!
//! Each cycle lists the provider's machines, attaches the roles the
//! foreman has polled, diffs against the desired rows, issues
//! stop/boot/floating-IP calls, and refreshes the firewall. The diff
//! runs twice per cycle: the first pass issues the operations, the
//! second records the cloud IDs the provider assigned so the next diff
//! starts from reality. Observed fields written back to the store are
//! how identity survives blueprint edits and controller restarts.

use std::collections::BTreeSet;
use std::net::UdpSocket;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::acl::{self, Acl};
use crate::foreman::RoleSource;
use crate::provider::{new_provider, valid_regions, Provider, ProviderError, ALL_PROVIDERS};
use crate::sync::sync_machines;
use flotilla_state::{Conn, StoreError, TableType};

/// Errors that abort a reconciliation cycle.
#[derive(Debug, Error)]
pub enum CloudError {
    #[error("list {location}: {source}")]
    List {
        location: String,
        source: ProviderError,
    },
}

/// Reconciler for one (provider, region, namespace).
pub struct Cloud {
    conn: Conn,
    provider_name: String,
    region: String,
    namespace: String,
    provider: Box<dyn Provider>,
    roles: Arc<dyn RoleSource>,
    /// Resolves the controller's own IP for the `local` ACL sentinel.
    /// Swappable so tests pin it.
    local_ip: fn() -> Option<String>,
}

impl Cloud {
    pub fn new(
        conn: Conn,
        provider_name: &str,
        region: &str,
        namespace: &str,
        roles: Arc<dyn RoleSource>,
    ) -> Result<Self, ProviderError> {
        let provider = new_provider(provider_name, region, namespace)?;
        Ok(Self {
            conn,
            provider_name: provider_name.to_string(),
            region: region.to_string(),
            namespace: namespace.to_string(),
            provider,
            roles,
            local_ip: default_local_ip,
        })
    }

    /// Run the reconciliation loop until shutdown.
    pub async fn run(mut self, mut stop: watch::Receiver<bool>) {
        info!(location = %self.location(), "cloud reconciler starting");
        let mut trigg = self.conn.trigger_tick(
            Duration::from_secs(30),
            &[TableType::Machine, TableType::Blueprint, TableType::Etcd],
        );

        loop {
            tokio::select! {
                _ = trigg.wait() => self.run_once().await,
                _ = stop.changed() => break,
            }
        }
        info!(location = %self.location(), "cloud reconciler stopped");
    }

    /// One reconciliation cycle.
    pub async fn run_once(&mut self) {
        // Two passes: the first issues the boots and stops, the second
        // records the cloud IDs the provider assigned.
        for _ in 0..2 {
            if let Err(e) = self.sync().await {
                warn!(error = %e, "cloud sync failed");
                return;
            }
        }
        self.sync_acls().await;
    }

    async fn sync(&mut self) -> Result<(), CloudError> {
        let cloud_machines = self.get().await?;

        let mut result = crate::sync::SyncResult::default();
        let _ = self
            .conn
            .txn(&[TableType::Blueprint, TableType::Machine])
            .run(|view| -> Result<(), StoreError> {
                let db_machines = view
                    .machines(|m| m.provider == self.provider_name && m.region == self.region);
                let sync = sync_machines(cloud_machines.clone(), db_machines);

                // Record observed identity on the paired rows.
                for (dbm, cm) in &sync.pairs {
                    let mut updated = dbm.clone();
                    updated.cloud_id = cm.cloud_id.clone();
                    updated.public_ip = cm.public_ip.clone();
                    updated.private_ip = cm.private_ip.clone();
                    view.commit_machine(updated);
                }

                result = sync;
                Ok(())
            });

        // Freed cloud IDs must precede new attachments.
        if !result.stop.is_empty() {
            info!(count = result.stop.len(), location = %self.location(), "stopping machines");
            if let Err(e) = self.provider.stop(result.stop).await {
                warn!(error = %e, "stop failed; will retry");
            }
        }
        if !result.boot.is_empty() {
            info!(count = result.boot.len(), location = %self.location(), "booting machines");
            if let Err(e) = self.provider.boot(result.boot).await {
                warn!(error = %e, "boot failed; will retry");
            }
        }
        if !result.update_ips.is_empty() {
            info!(count = result.update_ips.len(), "updating floating IPs");
            if let Err(e) = self.provider.update_floating_ips(result.update_ips).await {
                warn!(error = %e, "floating IP update failed; will retry");
            }
        }

        Ok(())
    }

    /// List the provider's machines with the foreman's role answers
    /// attached.
    async fn get(&self) -> Result<Vec<flotilla_state::Machine>, CloudError> {
        let mut machines = self.provider.list().await.map_err(|e| CloudError::List {
            location: self.location(),
            source: e,
        })?;
        for machine in &mut machines {
            machine.role = self.roles.machine_role(&machine.public_ip);
        }
        Ok(machines)
    }

    async fn sync_acls(&self) {
        let bp = self
            .conn
            .blueprint()
            .map(|row| row.blueprint)
            .unwrap_or_default();
        let machines = self
            .conn
            .machines(|m| m.provider == self.provider_name && m.region == self.region);
        self.push_acls(acl::get_acls(&bp, &machines)).await;
    }

    async fn push_acls(&self, acls: BTreeSet<Acl>) {
        let resolved = match (self.local_ip)() {
            Some(ip) => acl::resolve_local(acls, &ip),
            None => {
                warn!("could not determine the local IP; dropping the local ACL");
                acls.into_iter().filter(|a| a.cidr_ip != acl::LOCAL).collect()
            }
        };

        if let Err(e) = self.provider.set_acls(resolved).await {
            warn!(error = %e, "ACL sync failed; will retry");
        }
    }

    fn location(&self) -> String {
        format!("{}-{}-{}", self.provider_name, self.region, self.namespace)
    }
}

/// Spawn one reconciler per provider × region for the blueprint's
/// namespace, restarting the set whenever the namespace changes.
pub async fn run_clouds(conn: Conn, roles: Arc<dyn RoleSource>, mut stop: watch::Receiver<bool>) {
    let mut trigg = conn.trigger_tick(Duration::from_secs(30), &[TableType::Blueprint]);
    let mut namespace = String::new();
    let mut running: Vec<watch::Sender<bool>> = Vec::new();

    loop {
        let current = conn
            .blueprint()
            .map(|row| row.namespace().to_string())
            .unwrap_or_default();

        if current != namespace {
            info!(old = %namespace, new = %current, "namespace changed; restarting clouds");
            for tx in running.drain(..) {
                let _ = tx.send(true);
            }
            namespace = current;

            if !namespace.is_empty() {
                for &provider in ALL_PROVIDERS {
                    for &region in valid_regions(provider) {
                        match Cloud::new(
                            conn.clone(),
                            provider,
                            region,
                            &namespace,
                            Arc::clone(&roles),
                        ) {
                            Ok(cloud) => {
                                let (tx, rx) = watch::channel(false);
                                running.push(tx);
                                tokio::spawn(cloud.run(rx));
                            }
                            Err(e) => {
                                warn!(provider, region, error = %e, "provider unavailable")
                            }
                        }
                    }
                }
            }
        }

        tokio::select! {
            _ = trigg.wait() => {}
            _ = stop.changed() => break,
        }
    }

    for tx in running.drain(..) {
        let _ = tx.send(true);
    }
}

/// Discover the address the host routes external traffic from. Works
/// without sending a packet; UDP connect only fixes the route.
fn default_local_ip() -> Option<String> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    Some(socket.local_addr().ok()?.ip().to_string())
}
