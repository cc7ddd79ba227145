//! flotilla-state — the in-memory relational store every component
//! coordinates through.
//!
//! The store is a set of typed tables holding copyable rows. All reads
//! and writes go through transactions that lock their tables in a fixed
//! global order, so transactions over disjoint tables run in parallel
//! and deadlock is impossible. Components never talk to each other
//! directly: one writes rows, the other wakes up on a table trigger and
//! re-reads the full state.
//!
//! # Architecture
//!
//! ```text
//! Conn (cheaply cloneable handle)
//!   ├── txn(&[TableType]) → Txn::run(|view| …)
//!   │     ├── locks tables in declaration order
//!   │     ├── body works on row copies
//!   │     └── Ok → copies committed, modified tables alert once
//!   │        Err → every change discarded
//!   └── trigger(&[TableType]) → Trigger
//!         └── single-slot channel; alerts coalesce while unread
//! ```

mod error;
mod store;
mod trigger;
mod types;

pub use error::StoreError;
pub use store::{Conn, Txn, View};
pub use trigger::Trigger;
pub use types::*;

pub use flotilla_blueprint::Blueprint;
