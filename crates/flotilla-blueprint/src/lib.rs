//! Blueprint types — the declarative deployment spec fed to the controller.
//!
//! A blueprint is a single JSON object describing the machines,
//! containers, connections, placements, and load balancers a deployment
//! wants. The controller stores the parsed blueprint in its state store;
//! every other component derives its desired state from there. Keys use
//! the external PascalCase convention (`Namespace`, `AdminACL`, …).

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Hostname sentinel for the public internet in `Connection` endpoints.
pub const PUBLIC_INTERNET: &str = "public";

/// Errors from parsing or validating a blueprint.
#[derive(Debug, Error)]
pub enum BlueprintError {
    #[error("invalid blueprint JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("machine {id:?} has unknown role {role:?}")]
    UnknownRole { id: String, role: String },

    #[error("machine {0:?} has neither a size nor a resource range")]
    MissingSize(String),

    #[error("connection {from:?} -> {to:?}: MinPort {min} exceeds MaxPort {max}")]
    BadPortRange {
        from: String,
        to: String,
        min: u16,
        max: u16,
    },

    #[error("placement references unknown container {0:?}")]
    UnknownPlacementTarget(String),

    #[error("load balancer {lb:?} references unknown hostname {hostname:?}")]
    UnknownLoadBalancerMember { lb: String, hostname: String },
}

/// The top-level blueprint object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct Blueprint {
    pub namespace: String,
    /// CIDR blocks (or the `local` sentinel) allowed to reach the
    /// machines on every port.
    #[serde(rename = "AdminACL")]
    pub admin_acl: Vec<String>,
    pub machines: Vec<Machine>,
    pub containers: Vec<Container>,
    pub load_balancers: Vec<LoadBalancer>,
    pub connections: Vec<Connection>,
    pub placements: Vec<Placement>,
}

/// A logical machine the deployment wants booted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct Machine {
    #[serde(rename = "ID")]
    pub id: String,
    pub provider: String,
    pub role: String,
    pub size: String,
    pub region: String,
    pub disk_size: u32,
    pub preemptible: bool,
    #[serde(rename = "SSHKeys")]
    pub ssh_keys: Vec<String>,
    #[serde(rename = "FloatingIP")]
    pub floating_ip: String,
    /// Memory requirement in GiB, used to pick a size when `Size` is empty.
    #[serde(rename = "RAM")]
    pub ram: Range,
    /// Core count requirement, used to pick a size when `Size` is empty.
    #[serde(rename = "CPU")]
    pub cpu: Range,
    /// Hourly price cap for size selection; 0 means no cap.
    pub max_price: f64,
}

/// A closed numeric range; 0 means unset on either end.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct Range {
    pub min: f64,
    pub max: f64,
}

impl Range {
    /// Whether `value` falls inside the range, treating 0 as unbounded.
    pub fn accepts(&self, value: f64) -> bool {
        (self.min == 0.0 || value >= self.min) && (self.max == 0.0 || value <= self.max)
    }
}

/// A workload container.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct Container {
    /// Stable content-hash identifier. Derived from the container's
    /// fields when the deployer omits it.
    #[serde(rename = "ID")]
    pub id: String,
    pub hostname: String,
    pub image: Image,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
}

/// A container image; a non-empty Dockerfile means the cluster builds it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct Image {
    pub name: String,
    pub dockerfile: String,
}

/// A load balancer fronting a set of container hostnames.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct LoadBalancer {
    pub name: String,
    pub hostnames: Vec<String>,
}

/// An allowed network connection between hostnames (or `public`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct Connection {
    pub from: String,
    pub to: String,
    pub min_port: u16,
    pub max_port: u16,
}

/// A scheduling constraint on a container.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct Placement {
    /// Blueprint ID of the constrained container.
    pub target_container: String,
    pub exclusive: bool,
    /// Blueprint ID of the other container for co/anti-locality rules.
    pub other_container: String,
    pub provider: String,
    pub size: String,
    pub region: String,
    #[serde(rename = "FloatingIP")]
    pub floating_ip: String,
}

impl Blueprint {
    /// Parse and validate a blueprint from its JSON text.
    ///
    /// Containers without an explicit ID get a stable content hash so
    /// the rest of the system can track them across deploys.
    pub fn from_json(text: &str) -> Result<Self, BlueprintError> {
        let mut bp: Blueprint = serde_json::from_str(text)?;
        for c in &mut bp.containers {
            if c.id.is_empty() {
                c.id = derive_container_id(c);
            }
        }
        bp.validate()?;
        Ok(bp)
    }

    fn validate(&self) -> Result<(), BlueprintError> {
        for m in &self.machines {
            if m.role != "Master" && m.role != "Worker" {
                return Err(BlueprintError::UnknownRole {
                    id: m.id.clone(),
                    role: m.role.clone(),
                });
            }
            // Without a size there must be at least one resource range
            // for the engine to pick a size from.
            if m.size.is_empty() && m.ram == Range::default() && m.cpu == Range::default() {
                return Err(BlueprintError::MissingSize(m.id.clone()));
            }
        }

        for c in &self.connections {
            if c.min_port > c.max_port {
                return Err(BlueprintError::BadPortRange {
                    from: c.from.clone(),
                    to: c.to.clone(),
                    min: c.min_port,
                    max: c.max_port,
                });
            }
        }

        for p in &self.placements {
            if !self.containers.iter().any(|c| c.id == p.target_container) {
                return Err(BlueprintError::UnknownPlacementTarget(
                    p.target_container.clone(),
                ));
            }
        }

        for lb in &self.load_balancers {
            for hostname in &lb.hostnames {
                if !self.containers.iter().any(|c| &c.hostname == hostname) {
                    return Err(BlueprintError::UnknownLoadBalancerMember {
                        lb: lb.name.clone(),
                        hostname: hostname.clone(),
                    });
                }
            }
        }

        Ok(())
    }
}

impl fmt::Display for Blueprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = serde_json::to_string(self).map_err(|_| fmt::Error)?;
        f.write_str(&text)
    }
}

/// Stable content hash for a container missing an explicit ID.
fn derive_container_id(c: &Container) -> String {
    let mut hasher = Sha256::new();
    hasher.update(c.image.name.as_bytes());
    hasher.update([0]);
    hasher.update(c.image.dockerfile.as_bytes());
    hasher.update([0]);
    hasher.update(c.hostname.as_bytes());
    for arg in &c.command {
        hasher.update([0]);
        hasher.update(arg.as_bytes());
    }
    for (k, v) in &c.env {
        hasher.update([0]);
        hasher.update(k.as_bytes());
        hasher.update([1]);
        hasher.update(v.as_bytes());
    }
    let digest = hasher.finalize();
    let mut id = String::with_capacity(40);
    for byte in &digest[..20] {
        id.push_str(&format!("{byte:02x}"));
    }
    id
}
