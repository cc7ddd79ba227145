//! flotilla-cloud — the cloud half of the orchestrator.
//!
//! Turns desired `Machine` rows into real VMs and back:
//!
//! - [`provider`] defines the uniform backend interface
//!   (boot/stop/list/ACLs/floating IPs) plus the registry of compiled-in
//!   backends; [`mock`] is the in-process backend used for development
//!   and tests.
//! - [`sync`] is the diff at the heart of the reconciler: given the
//!   machines a provider reports and the machines the store wants, it
//!   produces the boot, stop, and floating-IP operations that converge
//!   them.
//! - [`cloud`] runs one reconciler loop per (provider, region,
//!   namespace), and [`foreman`] pushes per-node configuration to the
//!   minions and polls their roles back.

pub mod acl;
pub mod cloud;
pub mod foreman;
pub mod machine;
pub mod mock;
pub mod provider;
pub mod sync;

pub use acl::Acl;
pub use cloud::{run_clouds, Cloud, CloudError};
pub use foreman::{Foreman, RoleSource};
pub use provider::{new_provider, valid_regions, Provider, ProviderError, ALL_PROVIDERS};
pub use sync::{sync_machines, SyncResult};
