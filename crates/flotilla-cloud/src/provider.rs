//! The uniform cloud backend interface and the provider registry.
//!
//! All backends implement [`Provider`]; everything the reconciler knows
//! about a cloud goes through these five calls. Real SDK backends plug
//! in through [`new_provider`]; the tree ships the in-process `mock`
//! backend, and unknown names surface as validation errors at deploy
//! time.

use async_trait::async_trait;
use thiserror::Error;

use crate::acl::Acl;
use flotilla_state::Machine;

/// Names of the compiled-in providers.
pub const ALL_PROVIDERS: &[&str] = &["mock"];

/// Errors from provider operations.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("unknown provider {0:?}")]
    UnknownProvider(String),

    #[error("unknown region {region:?} for provider {provider}")]
    UnknownRegion { provider: String, region: String },

    /// The backend does not implement this capability (e.g. floating
    /// IPs). A well-formed error rather than a panic so the reconciler
    /// can log and move on.
    #[error("{0} is not supported by this provider")]
    Unsupported(&'static str),

    #[error("provider API error: {0}")]
    Api(String),

    /// Per-machine failures within one batch, collapsed.
    #[error("{n} operations failed: {errors}", n = .0.len(), errors = .0.join("; "))]
    Aggregate(Vec<String>),
}

/// A cloud backend scoped to one (region, namespace).
#[async_trait]
pub trait Provider: Send + Sync + std::fmt::Debug {
    /// Enumerate the machines currently live in this region and
    /// namespace.
    async fn list(&self) -> Result<Vec<Machine>, ProviderError>;

    /// Bring up the given machines. Providers may assign IDs and IPs
    /// that only `list` reflects later.
    async fn boot(&self, machines: Vec<Machine>) -> Result<(), ProviderError>;

    /// Destroy machines by cloud ID.
    async fn stop(&self, machines: Vec<Machine>) -> Result<(), ProviderError>;

    /// Idempotently reconcile the firewall against exactly this rule
    /// set.
    async fn set_acls(&self, acls: Vec<Acl>) -> Result<(), ProviderError>;

    /// Reattach floating IPs to the given cloud IDs.
    async fn update_floating_ips(&self, machines: Vec<Machine>) -> Result<(), ProviderError>;
}

/// The regions a provider accepts machines in; empty for unknown
/// providers.
pub fn valid_regions(provider: &str) -> &'static [&'static str] {
    match provider {
        "mock" => crate::mock::REGIONS,
        _ => &[],
    }
}

/// Instantiate a backend for one (provider, region, namespace).
pub fn new_provider(
    provider: &str,
    region: &str,
    namespace: &str,
) -> Result<Box<dyn Provider>, ProviderError> {
    if !valid_regions(provider).contains(&region) {
        if !ALL_PROVIDERS.contains(&provider) {
            return Err(ProviderError::UnknownProvider(provider.to_string()));
        }
        return Err(ProviderError::UnknownRegion {
            provider: provider.to_string(),
            region: region.to_string(),
        });
    }

    match provider {
        "mock" => Ok(Box::new(crate::mock::MockProvider::new(region, namespace))),
        _ => Err(ProviderError::UnknownProvider(provider.to_string())),
    }
}
