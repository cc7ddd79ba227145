//! Error types for the state store.

use thiserror::Error;

/// Errors surfaced by store lookups.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    /// A singleton lookup found no row (e.g. no blueprint deployed yet).
    /// Callers treat this as transient and retry on the next trigger.
    #[error("no {0} row")]
    RowNotFound(&'static str),
}
