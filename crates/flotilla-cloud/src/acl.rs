//! Firewall ACL model.
//!
//! Every provider reconciles its firewall against the full rule set on
//! each cycle: the blueprint's admin CIDRs, a hole for the controller
//! itself (the `local` sentinel, resolved to its IP at sync time), one
//! hole per machine public IP so the cluster can talk to itself, and
//! one rule per public-internet connection.

use std::collections::BTreeSet;

use flotilla_blueprint::{Blueprint, PUBLIC_INTERNET};
use flotilla_state::Machine;

/// Sentinel CIDR meaning "the controller's own public IP".
pub const LOCAL: &str = "local";

/// One firewall rule: a CIDR block and an allowed port range.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Acl {
    pub cidr_ip: String,
    pub min_port: u16,
    pub max_port: u16,
}

/// Compute the full ACL set for one provider from the blueprint and the
/// machines it is responsible for.
pub fn get_acls(bp: &Blueprint, machines: &[Machine]) -> BTreeSet<Acl> {
    let mut acls = BTreeSet::new();

    // The controller must always be able to reach its machines.
    acls.insert(Acl {
        cidr_ip: LOCAL.to_string(),
        min_port: 1,
        max_port: 65535,
    });

    for cidr in &bp.admin_acl {
        acls.insert(Acl {
            cidr_ip: cidr.clone(),
            min_port: 1,
            max_port: 65535,
        });
    }

    for conn in &bp.connections {
        if conn.from == PUBLIC_INTERNET {
            acls.insert(Acl {
                cidr_ip: "0.0.0.0/0".to_string(),
                min_port: conn.min_port,
                max_port: conn.max_port,
            });
        }
    }

    for machine in machines {
        if !machine.public_ip.is_empty() {
            acls.insert(Acl {
                cidr_ip: format!("{}/32", machine.public_ip),
                min_port: 1,
                max_port: 65535,
            });
        }
    }

    acls
}

/// Replace the `local` sentinel with the controller's IP, keeping the
/// port ranges of each sentinel entry.
pub fn resolve_local(acls: BTreeSet<Acl>, my_ip: &str) -> Vec<Acl> {
    acls.into_iter()
        .map(|acl| {
            if acl.cidr_ip == LOCAL {
                Acl {
                    cidr_ip: format!("{my_ip}/32"),
                    ..acl
                }
            } else {
                acl
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_blueprint::Connection;

    fn acl(cidr: &str, min: u16, max: u16) -> Acl {
        Acl {
            cidr_ip: cidr.into(),
            min_port: min,
            max_port: max,
        }
    }

    #[test]
    fn empty_blueprint_gets_local() {
        let acls = get_acls(&Blueprint::default(), &[]);
        assert_eq!(acls, BTreeSet::from([acl(LOCAL, 1, 65535)]));
    }

    #[test]
    fn admin_local_not_duplicated() {
        let bp = Blueprint {
            admin_acl: vec![LOCAL.into()],
            ..Default::default()
        };
        let acls = get_acls(&bp, &[]);
        assert_eq!(acls, BTreeSet::from([acl(LOCAL, 1, 65535)]));
    }

    #[test]
    fn private_connections_do_not_open_holes() {
        let bp = Blueprint {
            connections: vec![Connection {
                from: "foo".into(),
                to: "bar".into(),
                min_port: 5,
                max_port: 6,
            }],
            ..Default::default()
        };
        let acls = get_acls(&bp, &[]);
        assert_eq!(acls, BTreeSet::from([acl(LOCAL, 1, 65535)]));
    }

    #[test]
    fn public_connections_open_holes() {
        let bp = Blueprint {
            connections: vec![Connection {
                from: PUBLIC_INTERNET.into(),
                to: "bar".into(),
                min_port: 1,
                max_port: 2,
            }],
            ..Default::default()
        };
        let acls = get_acls(&bp, &[]);
        assert_eq!(
            acls,
            BTreeSet::from([acl(LOCAL, 1, 65535), acl("0.0.0.0/0", 1, 2)])
        );
    }

    #[test]
    fn machines_get_full_range_holes() {
        let machines = vec![Machine {
            public_ip: "1.2.3.4".into(),
            ..Default::default()
        }];
        let acls = get_acls(&Blueprint::default(), &machines);
        assert_eq!(
            acls,
            BTreeSet::from([acl(LOCAL, 1, 65535), acl("1.2.3.4/32", 1, 65535)])
        );
    }

    #[test]
    fn resolve_local_rewrites_sentinel() {
        let acls = BTreeSet::from([acl(LOCAL, 80, 80), acl("1.2.3.4/32", 1, 65535)]);
        let mut resolved = resolve_local(acls, "5.6.7.8");
        resolved.sort();
        assert_eq!(
            resolved,
            vec![acl("1.2.3.4/32", 1, 65535), acl("5.6.7.8/32", 80, 80)]
        );
    }
}
