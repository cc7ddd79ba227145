//! The in-process mock backend.
//!
//! Simulates a cloud well enough to run the whole control loop on one
//! machine: boot assigns cloud IDs and addresses that `list` reflects,
//! stop destroys by ID, and floating IPs reattach like the real thing.
//! Freshly booted machines report no role, exactly like a VM whose
//! minion has not checked in yet.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::info;

use crate::acl::Acl;
use crate::machine::Description;
use crate::provider::{Provider, ProviderError};
use flotilla_state::{Machine, Role};

/// Regions the mock provider accepts machines in.
pub const REGIONS: &[&str] = &["alpha", "beta"];

/// The mock instance-size catalog.
pub fn descriptions() -> Vec<Description> {
    vec![
        Description {
            size: "small".into(),
            price: 0.05,
            ram: 2.0,
            cpu: 1.0,
        },
        Description {
            size: "medium".into(),
            price: 0.1,
            ram: 4.0,
            cpu: 2.0,
        },
        Description {
            size: "large".into(),
            price: 0.2,
            ram: 8.0,
            cpu: 4.0,
        },
    ]
}

#[derive(Default, Debug)]
struct Inner {
    machines: BTreeMap<String, Machine>,
    next_id: u32,
    acls: Vec<Acl>,
}

/// An in-memory cloud scoped to one (region, namespace).
#[derive(Clone, Debug)]
pub struct MockProvider {
    region: String,
    namespace: String,
    inner: Arc<Mutex<Inner>>,
}

impl MockProvider {
    pub fn new(region: &str, namespace: &str) -> Self {
        Self {
            region: region.to_string(),
            namespace: namespace.to_string(),
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    /// The ACL set last reconciled, for inspection.
    pub fn acls(&self) -> Vec<Acl> {
        self.inner.lock().acls.clone()
    }
}

#[async_trait]
impl Provider for MockProvider {
    async fn list(&self) -> Result<Vec<Machine>, ProviderError> {
        Ok(self.inner.lock().machines.values().cloned().collect())
    }

    async fn boot(&self, machines: Vec<Machine>) -> Result<(), ProviderError> {
        let mut inner = self.inner.lock();
        for mut machine in machines {
            inner.next_id += 1;
            let n = inner.next_id;

            machine.cloud_id = format!("{}-{}-{n}", self.namespace, self.region);
            machine.public_ip = format!("203.0.113.{n}");
            machine.private_ip = format!("10.0.0.{n}");
            if machine.size.is_empty() {
                // Real clouds refuse sizeless requests; the mock just
                // picks the smallest.
                machine.size = "small".into();
            }
            // No minion has reported in yet.
            machine.role = Role::None;

            info!(cloud_id = %machine.cloud_id, size = %machine.size, "mock machine booted");
            inner.machines.insert(machine.cloud_id.clone(), machine);
        }
        Ok(())
    }

    async fn stop(&self, machines: Vec<Machine>) -> Result<(), ProviderError> {
        let mut inner = self.inner.lock();
        let mut errors = Vec::new();
        for machine in machines {
            if inner.machines.remove(&machine.cloud_id).is_none() {
                errors.push(format!("{}: no such machine", machine.cloud_id));
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProviderError::Aggregate(errors))
        }
    }

    async fn set_acls(&self, acls: Vec<Acl>) -> Result<(), ProviderError> {
        self.inner.lock().acls = acls;
        Ok(())
    }

    async fn update_floating_ips(&self, machines: Vec<Machine>) -> Result<(), ProviderError> {
        let mut inner = self.inner.lock();
        let mut errors = Vec::new();
        for machine in machines {
            match inner.machines.get_mut(&machine.cloud_id) {
                Some(current) => current.floating_ip = machine.floating_ip,
                None => errors.push(format!("{}: no such machine", machine.cloud_id)),
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProviderError::Aggregate(errors))
        }
    }
}
