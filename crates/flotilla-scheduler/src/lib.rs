//! flotilla-scheduler — container placement on the etcd leader.
//!
//! Each cycle takes an atomic snapshot of the worker minions,
//! placement constraints, containers, and images, evicts containers
//! whose constraints no longer hold, places the unassigned ones onto
//! the least-loaded worker that satisfies every constraint, and writes
//! the changed assignments back in one transaction.

mod schedule;

pub use schedule::{
    cleanup_placements, place_containers, place_unassigned, run, run_once, valid_placement,
    Context, MinionSlot,
};
