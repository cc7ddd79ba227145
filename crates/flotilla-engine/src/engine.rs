//! The desired-machine synthesizer.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, warn};

use flotilla_blueprint as bp;
use flotilla_cloud::machine::{choose_best_size, descriptions};
use flotilla_join::score_join;
use flotilla_state::{Conn, Machine, Role, StoreError, TableType, View};

/// Default root disk when the blueprint does not say, in GB.
const DEFAULT_DISK_SIZE_GB: u32 = 32;

/// Runs on the controller; wakes on blueprint changes.
pub struct Engine {
    conn: Conn,
    /// Extra SSH key granted to every machine, typically the
    /// administrator's.
    admin_key: Option<String>,
}

impl Engine {
    pub fn new(conn: Conn, admin_key: Option<String>) -> Self {
        Self { conn, admin_key }
    }

    /// Run the engine loop until shutdown.
    pub async fn run(self, mut stop: watch::Receiver<bool>) {
        let mut trigg = self
            .conn
            .trigger_tick(Duration::from_secs(30), &[TableType::Blueprint]);

        loop {
            tokio::select! {
                _ = trigg.wait() => self.run_once(),
                _ = stop.changed() => break,
            }
        }
    }

    pub fn run_once(&self) {
        let _ = self
            .conn
            .txn(&[TableType::Blueprint, TableType::Machine])
            .run(|view| -> Result<(), StoreError> {
                update_machines(view, self.admin_key.as_deref());
                Ok(())
            });
    }
}

/// Converge the Machine table onto the blueprint's machine set. The
/// transaction must hold the Blueprint and Machine tables.
pub fn update_machines(view: &mut View, admin_key: Option<&str>) {
    let Ok(row) = view.blueprint() else { return };
    let desired = desired_machines(&row.blueprint, admin_key);

    // When the blueprint shrinks, rows that never booted are the ones
    // to give up: sort booted rows first so the greedy join keeps them.
    let mut current = view.machines(|_| true);
    current.sort_by_key(|m| (m.public_ip.is_empty() && m.private_ip.is_empty(), m.id));

    let joined = score_join(desired, current, |want, have| {
        let exact = want.provider == have.provider
            && want.region == have.region
            && want.size == have.size
            && want.role == have.role
            && want.preemptible == have.preemptible
            && want.disk_size == have.disk_size;
        if exact {
            0
        } else {
            -1
        }
    });

    for (want, mut have) in joined.pairs {
        // Everything observed from the cloud survives, the floating IP
        // included: the row's value is authoritative once inserted.
        // Only the SSH keys and blueprint ID follow the blueprint.
        have.blueprint_id = want.blueprint_id;
        have.ssh_keys = want.ssh_keys;
        view.commit_machine(have);
    }
    for want in joined.left_only {
        debug!(role = %want.role, size = %want.size, "new machine desired");
        let fresh = view.insert_machine();
        view.commit_machine(Machine {
            id: fresh.id,
            ..want
        });
    }
    for gone in joined.right_only {
        debug!(cloud_id = %gone.cloud_id, "machine no longer desired");
        view.remove_machine(&gone);
    }
}

/// Translate the blueprint machines into store rows. A cluster needs
/// at least one master and one worker to function; anything less
/// desires no machines at all.
fn desired_machines(blueprint: &bp::Blueprint, admin_key: Option<&str>) -> Vec<Machine> {
    let machines: Vec<Machine> = blueprint
        .machines
        .iter()
        .filter_map(|m| desired_machine(m, admin_key))
        .collect();

    let has_master = machines.iter().any(|m| m.role == Role::Master);
    let has_worker = machines.iter().any(|m| m.role == Role::Worker);
    if !has_master || !has_worker {
        if !machines.is_empty() {
            warn!("blueprint needs at least one master and one worker; desiring no machines");
        }
        return Vec::new();
    }
    machines
}

fn desired_machine(machine: &bp::Machine, admin_key: Option<&str>) -> Option<Machine> {
    let role = match Role::parse(&machine.role) {
        Some(Role::None) | None => {
            warn!(id = %machine.id, role = %machine.role, "skipping machine with bad role");
            return None;
        }
        Some(role) => role,
    };

    let mut size = machine.size.clone();
    if size.is_empty() {
        size = choose_best_size(
            &descriptions(&machine.provider),
            machine.ram,
            machine.cpu,
            machine.max_price,
        );
        if size.is_empty() {
            warn!(
                id = %machine.id,
                provider = %machine.provider,
                "no size satisfies the resource constraints; skipping machine"
            );
            return None;
        }
    }

    let mut ssh_keys = machine.ssh_keys.clone();
    if let Some(key) = admin_key {
        if !key.is_empty() {
            ssh_keys.push(key.to_string());
        }
    }

    let disk_size = if machine.disk_size == 0 {
        DEFAULT_DISK_SIZE_GB
    } else {
        machine.disk_size
    };

    Some(Machine {
        blueprint_id: machine.id.clone(),
        role,
        provider: machine.provider.clone(),
        region: machine.region.clone(),
        size,
        disk_size,
        ssh_keys,
        floating_ip: machine.floating_ip.clone(),
        preemptible: machine.preemptible,
        ..Default::default()
    })
}
