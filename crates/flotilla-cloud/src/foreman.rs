//! Foreman — controller-side minion configuration.
//!
//! For every machine with a live cloud resource, the foreman keeps a
//! gRPC client to its minion, pushes the node's desired configuration
//! (role, blueprint text, etcd membership), and polls the applied
//! configuration back. The polled roles feed the cloud reconcilers:
//! a listed machine stays `Role::None` until its minion answers here.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, warn};

use flotilla_minion::{proto, role_from_proto, role_to_proto, MinionClient};
use flotilla_state::{Conn, Machine, Role, TableType};

/// Where the reconcilers learn machine roles from. The foreman is the
/// production implementation; tests substitute a map.
pub trait RoleSource: Send + Sync {
    fn machine_role(&self, public_ip: &str) -> Role;
}

/// Pushes minion configs and caches the roles minions report.
pub struct Foreman {
    conn: Conn,
    roles: parking_lot::Mutex<HashMap<String, Role>>,
    clients: tokio::sync::Mutex<HashMap<String, MinionClient>>,
}

impl RoleSource for Foreman {
    fn machine_role(&self, public_ip: &str) -> Role {
        self.roles
            .lock()
            .get(public_ip)
            .copied()
            .unwrap_or(Role::None)
    }
}

impl Foreman {
    pub fn new(conn: Conn) -> Self {
        Self {
            conn,
            roles: parking_lot::Mutex::new(HashMap::new()),
            clients: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Run the push/poll loop until shutdown.
    pub async fn run(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let mut trigg = self.conn.trigger_tick(
            Duration::from_secs(5),
            &[TableType::Machine, TableType::Blueprint, TableType::Etcd],
        );

        loop {
            tokio::select! {
                _ = trigg.wait() => self.run_once().await,
                _ = stop.changed() => break,
            }
        }
    }

    /// One push/poll cycle over every reachable machine.
    pub async fn run_once(&self) {
        let machines = self
            .conn
            .machines(|m| !m.public_ip.is_empty() && !m.cloud_id.is_empty());
        let blueprint_text = self
            .conn
            .blueprint()
            .map(|row| row.blueprint.to_string())
            .unwrap_or_default();
        let etcd_members: Vec<String> = machines
            .iter()
            .filter(|m| m.role == Role::Master && !m.private_ip.is_empty())
            .map(|m| m.private_ip.clone())
            .collect();

        let mut clients = self.clients.lock().await;

        // Forget machines the store no longer knows.
        clients.retain(|ip, _| machines.iter().any(|m| &m.public_ip == ip));
        self.roles
            .lock()
            .retain(|ip, _| machines.iter().any(|m| &m.public_ip == ip));

        for machine in &machines {
            if !clients.contains_key(&machine.public_ip) {
                match MinionClient::connect(&machine.public_ip).await {
                    Ok(client) => {
                        clients.insert(machine.public_ip.clone(), client);
                    }
                    Err(e) => {
                        debug!(ip = %machine.public_ip, error = %e, "minion not reachable yet");
                        continue;
                    }
                }
            }
            let Some(client) = clients.get_mut(&machine.public_ip) else {
                continue;
            };

            let mut failed = false;
            match client.get_config().await {
                Ok(config) => {
                    self.roles
                        .lock()
                        .insert(machine.public_ip.clone(), role_from_proto(config.role));
                }
                Err(e) => {
                    warn!(ip = %machine.public_ip, error = %e, "minion config poll failed");
                    failed = true;
                }
            }

            if !failed {
                let config = desired_config(machine, &blueprint_text, &etcd_members);
                if let Err(e) = client.set_config(config).await {
                    warn!(ip = %machine.public_ip, error = %e, "minion config push failed");
                    failed = true;
                }
            }

            if failed {
                // Rebuild the channel next cycle.
                clients.remove(&machine.public_ip);
            }
        }
    }
}

/// The configuration a machine's minion should be running.
fn desired_config(
    machine: &Machine,
    blueprint: &str,
    etcd_members: &[String],
) -> proto::MinionConfig {
    proto::MinionConfig {
        role: role_to_proto(machine.role) as i32,
        private_ip: machine.private_ip.clone(),
        blueprint: blueprint.to_string(),
        provider: machine.provider.clone(),
        size: machine.size.clone(),
        region: machine.region.clone(),
        floating_ip: machine.floating_ip.clone(),
        authorized_keys: machine.ssh_keys.clone(),
        etcd_members: etcd_members.to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn desired_config_mirrors_machine() {
        let machine = Machine {
            role: Role::Worker,
            private_ip: "10.0.0.9".into(),
            provider: "mock".into(),
            size: "small".into(),
            region: "alpha".into(),
            floating_ip: "8.8.8.8".into(),
            ssh_keys: vec!["ssh-rsa app".into()],
            ..Default::default()
        };
        let members = vec!["10.0.0.1".to_string()];

        let config = desired_config(&machine, "{}", &members);
        assert_eq!(config.role, proto::Role::Worker as i32);
        assert_eq!(config.private_ip, "10.0.0.9");
        assert_eq!(config.blueprint, "{}");
        assert_eq!(config.provider, "mock");
        assert_eq!(config.size, "small");
        assert_eq!(config.region, "alpha");
        assert_eq!(config.floating_ip, "8.8.8.8");
        assert_eq!(config.authorized_keys, vec!["ssh-rsa app"]);
        assert_eq!(config.etcd_members, members);
    }

    #[test]
    fn unknown_machines_report_no_role() {
        let foreman = Foreman::new(Conn::new());
        assert_eq!(foreman.machine_role("203.0.113.9"), Role::None);
    }
}
