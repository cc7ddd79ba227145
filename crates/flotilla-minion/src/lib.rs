//! flotilla-minion — per-node agent pieces.
//!
//! Two halves live here:
//!
//! - The **config RPC**: a gRPC service every minion serves on TCP
//!   9999. The controller pushes the node's desired configuration
//!   (role, blueprint text, etcd membership) and polls the applied one
//!   back. [`ConfigServer`] is the serving side, [`MinionClient`] the
//!   controller side.
//! - The **blueprint updater**: on the etcd leader, derives the
//!   container / connection / placement / load-balancer / image tables
//!   from the blueprint text pushed into the local minion row.

pub mod client;
pub mod server;
pub mod updater;

use flotilla_state::Role;

/// Generated protobuf types and gRPC service stubs.
pub mod proto {
    tonic::include_proto!("flotilla.minion");
}

/// TCP port every minion serves the config RPC on.
pub const MINION_PORT: u16 = 9999;

pub use client::MinionClient;
pub use server::ConfigServer;

/// Convert a store role to its wire representation.
pub fn role_to_proto(role: Role) -> proto::Role {
    match role {
        Role::None => proto::Role::None,
        Role::Worker => proto::Role::Worker,
        Role::Master => proto::Role::Master,
    }
}

/// Convert a wire role to the store representation. Unknown values
/// (a newer peer) degrade to `None`.
pub fn role_from_proto(role: i32) -> Role {
    match proto::Role::try_from(role) {
        Ok(proto::Role::Worker) => Role::Worker,
        Ok(proto::Role::Master) => Role::Master,
        _ => Role::None,
    }
}
