//! flotilla-engine — translates the blueprint into desired `Machine`
//! rows.
//!
//! The engine is the only writer of the desired-machine set. On every
//! blueprint change it joins the blueprint's logical machines against
//! the existing rows on their hard attributes, inserting and removing
//! to converge. Matched rows keep everything the reconcilers observed
//! (cloud ID, addresses) and only get their SSH keys and blueprint ID
//! rewritten, which is how externally-observed state survives
//! blueprint edits.

mod engine;

pub use engine::{update_machines, Engine};
