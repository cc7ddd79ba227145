//! Row types for the state store.
//!
//! Rows are plain value types retrieved by copy and written back
//! through a transactional view. Each row carries a store-assigned
//! integer ID, monotonically increasing and unique across all tables
//! of one store. Timestamps are epoch seconds.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use flotilla_blueprint::Blueprint;

/// Store-assigned row identifier.
pub type RowId = u32;

/// The tables of the store. The declaration order here is the global
/// lock order for transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TableType {
    Blueprint,
    Machine,
    Container,
    Minion,
    Connection,
    LoadBalancer,
    Etcd,
    Placement,
    Image,
    Hostname,
}

/// Every table, in lock order. Handy for transactions that touch
/// most of the store, and for tests.
pub const ALL_TABLES: [TableType; 10] = [
    TableType::Blueprint,
    TableType::Machine,
    TableType::Container,
    TableType::Minion,
    TableType::Connection,
    TableType::LoadBalancer,
    TableType::Etcd,
    TableType::Placement,
    TableType::Image,
    TableType::Hostname,
];

impl TableType {
    pub(crate) const COUNT: usize = 10;

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

/// The role a machine (and its minion) plays in the cluster.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Not yet reported by a minion.
    #[default]
    None,
    Worker,
    Master,
}

impl Role {
    /// Parse a blueprint role string.
    pub fn parse(s: &str) -> Option<Role> {
        match s {
            "Master" => Some(Role::Master),
            "Worker" => Some(Role::Worker),
            "" | "None" => Some(Role::None),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::None => f.write_str("None"),
            Role::Worker => f.write_str("Worker"),
            Role::Master => f.write_str("Master"),
        }
    }
}

/// Build state of an image the cluster builds itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImageStatus {
    #[default]
    None,
    Building,
    Built,
}

// ── Blueprint ─────────────────────────────────────────────────────

/// Singleton row holding the currently deployed blueprint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlueprintRow {
    pub id: RowId,
    pub blueprint: Blueprint,
}

impl BlueprintRow {
    pub fn namespace(&self) -> &str {
        &self.blueprint.namespace
    }
}

// ── Machine ───────────────────────────────────────────────────────

/// A desired or realized VM. A row with a non-empty `cloud_id`
/// corresponds to a live cloud resource.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Machine {
    pub id: RowId,
    /// ID of the blueprint machine this row realizes.
    pub blueprint_id: String,
    pub role: Role,
    pub provider: String,
    pub region: String,
    pub size: String,
    /// Disk size in GB.
    pub disk_size: u32,
    pub ssh_keys: Vec<String>,
    pub floating_ip: String,
    pub preemptible: bool,
    /// Provider-assigned opaque VM identifier.
    pub cloud_id: String,
    pub public_ip: String,
    pub private_ip: String,
}

// ── Container ─────────────────────────────────────────────────────

/// A workload container. `minion` is set iff the scheduler has placed
/// the container on a worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Container {
    pub id: RowId,
    /// Stable content-hash ID from the blueprint.
    pub blueprint_id: String,
    /// IP inside the overlay network, allocated by the leader.
    pub ip: String,
    /// Private IP of the worker minion hosting this container.
    pub minion: String,
    pub image: String,
    pub dockerfile: String,
    pub docker_id: String,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub hostname: String,
    /// Epoch seconds when the worker started the container; 0 if not
    /// yet running.
    pub created: u64,
}

// ── Minion ────────────────────────────────────────────────────────

/// One row per node. The locally running minion marks its own row with
/// `is_self`; at most one row per store may carry it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Minion {
    pub id: RowId,
    pub is_self: bool,
    /// Blueprint text pushed by the controller.
    pub blueprint: String,
    pub authorized_keys: Vec<String>,
    pub role: Role,
    pub private_ip: String,
    pub provider: String,
    pub size: String,
    pub region: String,
    pub floating_ip: String,
    pub host_subnets: Vec<String>,
}

// ── Connection ────────────────────────────────────────────────────

/// An allowed connection between hostnames (or the `public` sentinel).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub id: RowId,
    pub from: String,
    pub to: String,
    pub min_port: u16,
    pub max_port: u16,
}

// ── LoadBalancer ──────────────────────────────────────────────────

/// A load balancer fronting a set of container hostnames.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadBalancer {
    pub id: RowId,
    pub name: String,
    pub hostnames: Vec<String>,
    /// Allocated virtual IP; preserved across blueprint updates.
    pub ip: String,
}

// ── Etcd ──────────────────────────────────────────────────────────

/// Singleton row describing etcd membership and the elected leader.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Etcd {
    pub id: RowId,
    /// Private IPs of the etcd members, sorted.
    pub etcd_ips: Vec<String>,
    /// Whether the local minion is the elected leader.
    pub leader: bool,
    pub leader_ip: String,
}

// ── Placement ─────────────────────────────────────────────────────

/// A scheduling constraint. Either `other_container` is set
/// (co/anti-locality, unordered pair) or one of the machine attributes
/// is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Placement {
    pub id: RowId,
    /// Blueprint ID of the constrained container.
    pub target_container: String,
    pub exclusive: bool,
    /// Blueprint ID of the other container for container-container
    /// rules. The pair is unordered for matching.
    pub other_container: String,
    pub provider: String,
    pub size: String,
    pub region: String,
    pub floating_ip: String,
}

// ── Image ─────────────────────────────────────────────────────────

/// An image the cluster builds from a Dockerfile.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Image {
    pub id: RowId,
    pub name: String,
    pub dockerfile: String,
    /// Docker ID of the built image.
    pub docker_id: String,
    pub status: ImageStatus,
}

// ── Hostname ──────────────────────────────────────────────────────

/// Hostname to overlay-IP mapping maintained by the leader.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Hostname {
    pub id: RowId,
    pub hostname: String,
    pub ip: String,
}
