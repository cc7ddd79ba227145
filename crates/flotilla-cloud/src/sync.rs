//! SyncDB — the diff between desired machines and cloud reality.
//!
//! Two passes. Machines whose cloud ID is recorded on both sides pair
//! by hash join: their identity is settled and they are only candidates
//! for floating-IP updates. The rest pair by score join on the hard
//! attributes (provider, region, size, preemptibility, disk), with a
//! matching public IP preferred so identities stay stable through
//! partial failures. A cloud machine reporting no role matches any
//! desired role; its minion has not checked in yet. Leftover desired
//! machines boot, leftover cloud machines stop.

use std::collections::HashMap;

use flotilla_join::score_join;
use flotilla_state::{Machine, Role};

/// The operations that converge the cloud onto the desired set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncResult {
    pub boot: Vec<Machine>,
    pub stop: Vec<Machine>,
    pub update_ips: Vec<Machine>,
    /// Matched (desired, cloud) pairs, for writing observed fields back
    /// to the store.
    pub pairs: Vec<(Machine, Machine)>,
}

/// Diff the machines a provider reports against the machines the store
/// wants in this (provider, region).
pub fn sync_machines(cloud_machines: Vec<Machine>, db_machines: Vec<Machine>) -> SyncResult {
    // Pass 1: pair on recorded cloud IDs.
    let mut cloud: Vec<Option<Machine>> = cloud_machines.into_iter().map(Some).collect();
    let mut index: HashMap<String, usize> = HashMap::new();
    for (i, slot) in cloud.iter().enumerate() {
        if let Some(m) = slot {
            if !m.cloud_id.is_empty() {
                index.insert(m.cloud_id.clone(), i);
            }
        }
    }

    let mut pairs = Vec::new();
    let mut unmatched_db = Vec::new();
    for dbm in db_machines {
        if !dbm.cloud_id.is_empty() {
            if let Some(i) = index.remove(&dbm.cloud_id) {
                if let Some(cm) = cloud[i].take() {
                    pairs.push((dbm, cm));
                    continue;
                }
            }
        }
        unmatched_db.push(dbm);
    }
    let remaining_cloud: Vec<Machine> = cloud.into_iter().flatten().collect();

    // Pass 2: pair the rest on attributes.
    let scored = score_join(unmatched_db, remaining_cloud, score);
    pairs.extend(scored.pairs);

    let mut result = SyncResult {
        boot: scored.left_only,
        stop: scored.right_only,
        update_ips: Vec::new(),
        pairs,
    };

    // A floating IP moves only once the desired row has recorded the
    // pairing (its cloud ID matches the live machine's); until then the
    // update is deferred to a later cycle.
    for (dbm, cm) in &result.pairs {
        if dbm.cloud_id == cm.cloud_id && dbm.floating_ip != cm.floating_ip {
            let mut update = cm.clone();
            update.floating_ip = dbm.floating_ip.clone();
            result.update_ips.push(update);
        }
    }

    result
}

fn score(dbm: &Machine, cm: &Machine) -> i32 {
    if dbm.provider != cm.provider
        || dbm.region != cm.region
        || dbm.preemptible != cm.preemptible
    {
        return -1;
    }
    // An empty desired size or disk is a wildcard: the provider picked.
    if !dbm.size.is_empty() && dbm.size != cm.size {
        return -1;
    }
    if dbm.disk_size != 0 && cm.disk_size != 0 && dbm.disk_size != cm.disk_size {
        return -1;
    }
    if cm.role != Role::None && dbm.role != cm.role {
        return -1;
    }
    if dbm.public_ip == cm.public_ip {
        0
    } else {
        1
    }
}
