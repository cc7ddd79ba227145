//! The placement passes.
//!
//! Containers live in one arena; the per-minion hosting lists, the
//! unassigned queue, and the changed set hold indices into it. Three
//! steps per cycle:
//!
//! 1. **Context build** — collect worker minions, find each
//!    container's current host, and pull aside everything that cannot
//!    or should not stay where it is (unknown minion, image not built,
//!    image rebuilt under it).
//! 2. **Cleanup** — re-validate every hosted container against the
//!    containers already accepted on its minion, evicting violators.
//! 3. **Placement** — assign each unassigned container, in a
//!    deterministic order, to the least-loaded minion satisfying all
//!    of its constraints. Containers with no satisfiable constraint
//!    stay unassigned and are not reported as changed.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info};

use flotilla_state::{
    Conn, Container, Image, ImageStatus, Minion, Placement, Role, StoreError, TableType, View,
};

/// A worker minion plus the containers assigned to it, by arena index.
#[derive(Debug, PartialEq)]
pub struct MinionSlot {
    pub minion: Minion,
    pub containers: Vec<usize>,
}

/// One scheduling cycle's working state.
#[derive(Debug, Default, PartialEq)]
pub struct Context {
    pub minions: Vec<MinionSlot>,
    pub constraints: Vec<Placement>,
    /// Arena of every container in the cycle.
    pub containers: Vec<Container>,
    /// Indices of containers awaiting placement.
    pub unassigned: Vec<usize>,
    /// Indices of containers whose row must be rewritten.
    pub changed: Vec<usize>,
}

impl Context {
    /// Build the cycle state from a store snapshot.
    pub fn build(
        minions: Vec<Minion>,
        placements: Vec<Placement>,
        containers: Vec<Container>,
        images: Vec<Image>,
    ) -> Self {
        let mut ctx = Context {
            minions: minions
                .into_iter()
                .filter(|m| m.role == Role::Worker)
                .map(|minion| MinionSlot {
                    minion,
                    containers: Vec::new(),
                })
                .collect(),
            constraints: placements,
            containers,
            ..Default::default()
        };

        let built: HashMap<(String, String), Image> = images
            .into_iter()
            .map(|img| ((img.name.clone(), img.dockerfile.clone()), img))
            .collect();

        for idx in 0..ctx.containers.len() {
            let c = &mut ctx.containers[idx];

            if !c.dockerfile.is_empty() {
                let image = built.get(&(c.image.clone(), c.dockerfile.clone()));
                match image {
                    Some(img) if img.status == ImageStatus::Built => {
                        if c.docker_id != img.docker_id {
                            // The image was rebuilt under this
                            // container; reschedule it with the new ID.
                            c.docker_id = img.docker_id.clone();
                            c.minion.clear();
                            ctx.unassigned.push(idx);
                            ctx.changed.push(idx);
                            continue;
                        }
                    }
                    // Nothing to schedule until the build finishes.
                    _ => continue,
                }
            }

            if c.minion.is_empty() {
                ctx.unassigned.push(idx);
                continue;
            }

            let host = ctx
                .minions
                .iter()
                .position(|slot| slot.minion.private_ip == c.minion);
            match host {
                Some(slot) => ctx.minions[slot].containers.push(idx),
                None => {
                    // Its worker is gone.
                    c.minion.clear();
                    ctx.unassigned.push(idx);
                    ctx.changed.push(idx);
                }
            }
        }

        ctx
    }
}

/// Whether minion `m`, currently hosting `hosted`, satisfies every
/// constraint that applies to container `c`.
pub fn valid_placement(
    constraints: &[Placement],
    m: &Minion,
    hosted: &[&Container],
    c: &Container,
) -> bool {
    for p in constraints {
        if !p.other_container.is_empty() {
            // Container-container rules are unordered: a rule with
            // target T also forbids placing O next to T. Non-exclusive
            // co-location is not enforced.
            if !p.exclusive {
                continue;
            }
            if c.blueprint_id == p.target_container
                && hosted
                    .iter()
                    .any(|h| h.blueprint_id == p.other_container && h.id != c.id)
            {
                return false;
            }
            if c.blueprint_id == p.other_container
                && hosted
                    .iter()
                    .any(|h| h.blueprint_id == p.target_container && h.id != c.id)
            {
                return false;
            }
            continue;
        }

        if p.target_container != c.blueprint_id {
            continue;
        }

        // Machine-attribute rule: every attribute the constraint sets
        // must agree with the exclusivity flag.
        let checks = [
            (&m.provider, &p.provider),
            (&m.size, &p.size),
            (&m.region, &p.region),
            (&m.floating_ip, &p.floating_ip),
        ];
        for (have, want) in checks {
            if want.is_empty() {
                continue;
            }
            let matches = have == want;
            if matches == p.exclusive {
                return false;
            }
        }
    }
    true
}

/// Evict assigned containers whose constraints no longer hold.
///
/// Each minion's containers are re-validated in order against the set
/// already accepted, so of a conflicting pair the earlier container
/// stays put.
pub fn cleanup_placements(ctx: &mut Context) {
    for slot_idx in 0..ctx.minions.len() {
        let assigned = std::mem::take(&mut ctx.minions[slot_idx].containers);
        let mut kept: Vec<usize> = Vec::new();

        for c_idx in assigned {
            let hosted: Vec<&Container> = kept.iter().map(|&i| &ctx.containers[i]).collect();
            let ok = valid_placement(
                &ctx.constraints,
                &ctx.minions[slot_idx].minion,
                &hosted,
                &ctx.containers[c_idx],
            );
            if ok {
                kept.push(c_idx);
            } else {
                debug!(
                    container = %ctx.containers[c_idx].blueprint_id,
                    minion = %ctx.minions[slot_idx].minion.private_ip,
                    "evicting container; placement violated"
                );
                ctx.containers[c_idx].minion.clear();
                ctx.unassigned.push(c_idx);
                if !ctx.changed.contains(&c_idx) {
                    ctx.changed.push(c_idx);
                }
            }
        }

        ctx.minions[slot_idx].containers = kept;
    }
}

/// Assign every unassigned container to the least-loaded worker that
/// satisfies all of its constraints.
pub fn place_unassigned(ctx: &mut Context) {
    let mut queue = std::mem::take(&mut ctx.unassigned);
    queue.sort_by(|&a, &b| {
        let (ca, cb) = (&ctx.containers[a], &ctx.containers[b]);
        (&ca.image, &ca.command, &ca.blueprint_id).cmp(&(&cb.image, &cb.command, &cb.blueprint_id))
    });

    let mut leftover = Vec::new();
    for c_idx in queue {
        // Stable by load, so equally loaded minions keep their order.
        ctx.minions.sort_by_key(|slot| slot.containers.len());

        let mut target = None;
        for (slot_idx, slot) in ctx.minions.iter().enumerate() {
            let hosted: Vec<&Container> = slot
                .containers
                .iter()
                .map(|&i| &ctx.containers[i])
                .collect();
            if valid_placement(&ctx.constraints, &slot.minion, &hosted, &ctx.containers[c_idx]) {
                target = Some(slot_idx);
                break;
            }
        }

        match target {
            Some(slot_idx) => {
                let ip = ctx.minions[slot_idx].minion.private_ip.clone();
                debug!(container = %ctx.containers[c_idx].blueprint_id, minion = %ip, "placed");
                ctx.containers[c_idx].minion = ip;
                ctx.minions[slot_idx].containers.push(c_idx);
                if !ctx.changed.contains(&c_idx) {
                    ctx.changed.push(c_idx);
                }
            }
            None => leftover.push(c_idx),
        }
    }

    ctx.unassigned = leftover;
}

/// One full scheduling cycle over a store view holding the Minion,
/// Placement, Container, and Image tables.
pub fn place_containers(view: &mut View) {
    let mut ctx = Context::build(
        view.minions(|_| true),
        view.placements(|_| true),
        view.containers(|_| true),
        view.images(|_| true),
    );

    cleanup_placements(&mut ctx);
    place_unassigned(&mut ctx);

    if !ctx.changed.is_empty() {
        info!(count = ctx.changed.len(), "container assignments changed");
    }
    for &idx in &ctx.changed {
        view.commit_container(ctx.containers[idx].clone());
    }
}

/// Run the scheduler loop until shutdown; cycles only run while the
/// local Etcd row says this node is the leader.
pub async fn run(conn: Conn, mut stop: watch::Receiver<bool>) {
    let mut trigg = conn.trigger_tick(
        Duration::from_secs(30),
        &[
            TableType::Container,
            TableType::Minion,
            TableType::Etcd,
            TableType::Placement,
            TableType::Image,
        ],
    );

    loop {
        tokio::select! {
            _ = trigg.wait() => run_once(&conn),
            _ = stop.changed() => break,
        }
    }
}

/// One leader-gated scheduling transaction.
pub fn run_once(conn: &Conn) {
    match conn.etcd() {
        Ok(etcd) if etcd.leader => {}
        _ => return,
    }

    let _ = conn
        .txn(&[
            TableType::Container,
            TableType::Minion,
            TableType::Placement,
            TableType::Image,
        ])
        .run(|view| -> Result<(), StoreError> {
            place_containers(view);
            Ok(())
        });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker(private_ip: &str, region: &str) -> Minion {
        Minion {
            private_ip: private_ip.into(),
            region: region.into(),
            role: Role::Worker,
            ..Default::default()
        }
    }

    fn container(id: u32, blueprint_id: &str, minion: &str) -> Container {
        Container {
            id,
            blueprint_id: blueprint_id.into(),
            minion: minion.into(),
            ..Default::default()
        }
    }

    fn exclusive_pair(target: &str, other: &str) -> Placement {
        Placement {
            exclusive: true,
            target_container: target.into(),
            other_container: other.into(),
            ..Default::default()
        }
    }

    #[test]
    fn context_build_classifies_containers() {
        let minions = vec![
            Minion {
                id: 1,
                ..worker("1", "")
            },
            Minion {
                id: 2,
                ..worker("2", "")
            },
            // Not a worker; invisible to the scheduler.
            Minion {
                id: 3,
                private_ip: "3".into(),
                region: "Region3".into(),
                ..Default::default()
            },
        ];
        let images = vec![
            Image {
                name: "foo".into(),
                dockerfile: "bar".into(),
                docker_id: "baz".into(),
                status: ImageStatus::Built,
                ..Default::default()
            },
            Image {
                name: "qux".into(),
                dockerfile: "quuz".into(),
                status: ImageStatus::Building,
                ..Default::default()
            },
        ];
        let containers = vec![
            container(1, "", ""),
            container(2, "", "1"),
            container(3, "", "3"),
            // Scheduled with a stale docker ID.
            Container {
                image: "foo".into(),
                dockerfile: "bar".into(),
                docker_id: "change".into(),
                ..container(4, "", "")
            },
            // No image row for this dockerfile yet.
            Container {
                image: "foo".into(),
                dockerfile: "baz".into(),
                docker_id: "baz".into(),
                ..container(5, "", "")
            },
            // Image still building.
            Container {
                image: "qux".into(),
                dockerfile: "quuz".into(),
                ..container(6, "", "")
            },
        ];
        let placements = vec![Placement {
            exclusive: true,
            target_container: "1".into(),
            region: "Region1".into(),
            ..Default::default()
        }];

        let ctx = Context::build(minions, placements.clone(), containers, images);

        assert_eq!(ctx.constraints, placements);
        assert_eq!(ctx.minions.len(), 2);
        assert_eq!(ctx.minions[0].containers, vec![1]); // row id 2
        assert!(ctx.minions[1].containers.is_empty());

        // Unassigned: the idle one, the one on the vanished minion,
        // and the stale-docker-ID one. The unbuilt ones are skipped.
        assert_eq!(ctx.unassigned, vec![0, 2, 3]);
        // Changed: the vanished-minion eviction and the docker ID
        // rewrite.
        assert_eq!(ctx.changed, vec![2, 3]);
        assert_eq!(ctx.containers[2].minion, "");
        assert_eq!(ctx.containers[3].docker_id, "baz");
    }

    #[test]
    fn cleanup_evicts_machine_attribute_violations() {
        let minions = vec![worker("1", "Region1")];
        let containers = vec![container(1, "1", "1"), container(2, "2", "1")];
        let placements = vec![Placement {
            exclusive: true,
            target_container: "1".into(),
            region: "Region1".into(),
            floating_ip: "xxx.xxx.xxx.xxx".into(),
            ..Default::default()
        }];

        let mut ctx = Context::build(minions, placements, containers, vec![]);
        cleanup_placements(&mut ctx);

        // Container "1" violates the exclusive region rule and is
        // evicted; container "2" stays.
        assert_eq!(ctx.minions[0].containers, vec![1]);
        assert_eq!(ctx.unassigned, vec![0]);
        assert_eq!(ctx.changed, vec![0]);
        assert_eq!(ctx.containers[0].minion, "");
        assert_eq!(ctx.containers[1].minion, "1");
    }

    #[test]
    fn cleanup_keeps_the_earlier_of_a_conflicting_pair() {
        let minions = vec![worker("1", ""), worker("2", "")];
        let containers = vec![
            container(1, "1", "1"),
            container(2, "2", "1"),
            container(3, "3", "2"),
        ];
        let placements = vec![exclusive_pair("1", "2"), exclusive_pair("1", "3")];

        let mut ctx = Context::build(minions, placements, containers, vec![]);
        cleanup_placements(&mut ctx);

        // On minion 1, container "1" is accepted first, so "2" is the
        // one evicted. Container "3" sits alone on minion 2.
        assert_eq!(ctx.minions[0].containers, vec![0]);
        assert_eq!(ctx.minions[1].containers, vec![2]);
        assert_eq!(ctx.unassigned, vec![1]);
        assert_eq!(ctx.changed, vec![1]);
    }

    #[test]
    fn place_unassigned_balances_load() {
        // No minions, no changes.
        let mut empty = Context::build(vec![], vec![], vec![], vec![]);
        place_unassigned(&mut empty);
        assert!(empty.changed.is_empty());

        let minions = vec![
            Minion {
                floating_ip: "xxx.xxx.xxx.xxx".into(),
                ..worker("1", "Region1")
            },
            worker("2", "Region2"),
            worker("3", "Region3"),
        ];
        let containers = vec![
            container(1, "1", ""),
            container(2, "2", ""),
            container(3, "3", ""),
        ];
        let placements = vec![Placement {
            exclusive: true,
            target_container: "1".into(),
            region: "Region1".into(),
            ..Default::default()
        }];

        let mut ctx = Context::build(minions.clone(), placements.clone(), containers, vec![]);
        place_unassigned(&mut ctx);

        let by_blueprint: HashMap<String, String> = ctx
            .containers
            .iter()
            .map(|c| (c.blueprint_id.clone(), c.minion.clone()))
            .collect();
        // "1" is barred from Region1; the others spread across the
        // remaining capacity.
        assert_eq!(by_blueprint["1"], "2");
        assert_eq!(by_blueprint["2"], "1");
        assert_eq!(by_blueprint["3"], "3");
        assert_eq!(ctx.changed.len(), 3);

        // Re-building from the now-assigned containers changes
        // nothing.
        let assigned = ctx.containers.clone();
        let mut again = Context::build(minions.clone(), placements, assigned, vec![]);
        cleanup_placements(&mut again);
        place_unassigned(&mut again);
        assert!(again.changed.is_empty());

        // An unsatisfiable constraint leaves the container unassigned
        // and unreported.
        let placements = vec![Placement {
            exclusive: false,
            target_container: "1".into(),
            region: "Nowhere".into(),
            ..Default::default()
        }];
        let containers = vec![container(1, "1", "")];
        let mut stuck = Context::build(minions, placements, containers, vec![]);
        place_unassigned(&mut stuck);
        assert!(stuck.changed.is_empty());
        assert_eq!(stuck.unassigned.len(), 1);
    }

    #[test]
    fn container_rules_apply_in_both_directions() {
        let constraints = vec![exclusive_pair("blue", "red")];

        // red cannot land next to blue…
        let red = container(1, "red", "");
        let hosting_blue = container(2, "blue", "1.2.3.4");
        let m = worker("1.2.3.4", "Region");
        assert!(!valid_placement(
            &constraints,
            &m,
            &[&hosting_blue],
            &red
        ));

        // …and blue cannot land next to red.
        let blue = container(4, "blue", "");
        let hosting_red = container(3, "red", "1.2.3.4");
        assert!(!valid_placement(&constraints, &m, &[&hosting_red], &blue));
    }

    #[test]
    fn container_rule_evaluation() {
        let red = container(1, "red", "");
        let blue = container(2, "blue", "");
        let yellow = container(3, "yellow", "");
        let m = worker("1.2.3.4", "Region");
        let hosted: Vec<&Container> = vec![&red, &blue, &yellow];

        // Wrong target: no objection.
        assert!(valid_placement(
            &[exclusive_pair("blue", "orange")],
            &m,
            &hosted,
            &red
        ));

        // The other container is here: rejected.
        assert!(!valid_placement(
            &[exclusive_pair("red", "blue")],
            &m,
            &hosted,
            &red
        ));

        // Empty minion: fine.
        assert!(valid_placement(&[exclusive_pair("red", "blue")], &m, &[], &red));

        assert!(!valid_placement(
            &[exclusive_pair("red", "yellow")],
            &m,
            &hosted,
            &red
        ));

        // The other container is nowhere on this minion.
        assert!(valid_placement(
            &[exclusive_pair("red", "magenta")],
            &m,
            &hosted,
            &red
        ));

        // Non-exclusive container rules are not enforced.
        assert!(valid_placement(
            &[Placement {
                exclusive: false,
                target_container: "red".into(),
                other_container: "yellow".into(),
                ..Default::default()
            }],
            &m,
            &hosted,
            &red
        ));
    }

    #[test]
    fn machine_attribute_rule_evaluation() {
        let red = container(1, "red", "");
        let m = Minion {
            provider: "Provider".into(),
            size: "Size".into(),
            ..worker("1.2.3.4", "Region")
        };

        let rule = |exclusive: bool, field: &str, value: &str| {
            let mut p = Placement {
                exclusive,
                target_container: "red".into(),
                ..Default::default()
            };
            match field {
                "provider" => p.provider = value.into(),
                "size" => p.size = value.into(),
                "region" => p.region = value.into(),
                _ => unreachable!(),
            }
            p
        };

        // No constraints at all.
        assert!(valid_placement(&[], &m, &[], &red));

        for (field, matching, other) in [
            ("provider", "Provider", "NotProvider"),
            ("region", "Region", "NoRegion"),
            ("size", "Size", "NoSize"),
        ] {
            // Inclusive + match: allowed.
            assert!(valid_placement(&[rule(false, field, matching)], &m, &[], &red));
            // Exclusive + match: rejected.
            assert!(!valid_placement(&[rule(true, field, matching)], &m, &[], &red));
            // Inclusive + mismatch: rejected.
            assert!(!valid_placement(&[rule(false, field, other)], &m, &[], &red));
        }

        // Conjunction of all-inclusive matches holds…
        let all = [
            rule(false, "size", "Size"),
            rule(false, "region", "Region"),
            rule(false, "provider", "Provider"),
        ];
        assert!(valid_placement(&all, &m, &[], &red));

        // …until one of them flips exclusive.
        let mixed = [
            rule(false, "size", "Size"),
            rule(true, "region", "Region"),
            rule(false, "provider", "Provider"),
        ];
        assert!(!valid_placement(&mixed, &m, &[], &red));
    }

    #[test]
    fn unassigned_sorts_by_image_then_command_then_id() {
        let a = Container {
            image: "1".into(),
            blueprint_id: "1".into(),
            ..container(1, "1", "")
        };
        let b = Container {
            image: "1".into(),
            ..container(2, "2", "")
        };
        let c = Container {
            image: "2".into(),
            command: vec!["1".into(), "2".into()],
            ..container(3, "", "")
        };
        let d = Container {
            image: "2".into(),
            command: vec!["3".into(), "4".into()],
            ..container(4, "", "")
        };

        // Feed them in reverse and watch placement order through the
        // changed list: one worker, so assignment order is changed
        // order.
        let minions = vec![worker("1", "")];
        let mut ctx = Context::build(
            minions,
            vec![],
            vec![d.clone(), c.clone(), b.clone(), a.clone()],
            vec![],
        );
        place_unassigned(&mut ctx);

        let order: Vec<String> = ctx
            .changed
            .iter()
            .map(|&i| ctx.containers[i].blueprint_id.clone())
            .collect();
        assert_eq!(order, vec!["1", "2", "", ""]);
        // The two command-distinguished containers placed c before d.
        assert_eq!(ctx.changed[2], 1); // c was fed at index 1
        assert_eq!(ctx.changed[3], 0); // d was fed at index 0
    }

    #[tokio::test]
    async fn run_once_places_on_the_leader() {
        let conn = Conn::new();
        conn.txn(&[TableType::Minion, TableType::Etcd, TableType::Container])
            .run(|view| -> Result<(), StoreError> {
                let mut m = view.insert_minion();
                m.private_ip = "1".into();
                m.role = Role::Worker;
                view.commit_minion(m);

                let mut etcd = view.insert_etcd();
                etcd.leader = true;
                view.commit_etcd(etcd);

                view.insert_container();
                Ok(())
            })
            .unwrap();

        run_once(&conn);

        let containers = conn.containers(|_| true);
        assert_eq!(containers.len(), 1);
        assert_eq!(containers[0].minion, "1");
    }

    #[tokio::test]
    async fn run_once_is_inert_off_leader() {
        let conn = Conn::new();
        conn.txn(&[TableType::Minion, TableType::Etcd, TableType::Container])
            .run(|view| -> Result<(), StoreError> {
                let mut m = view.insert_minion();
                m.private_ip = "1".into();
                m.role = Role::Worker;
                view.commit_minion(m);

                view.insert_etcd();
                view.insert_container();
                Ok(())
            })
            .unwrap();

        run_once(&conn);
        assert_eq!(conn.containers(|_| true)[0].minion, "");
    }
}
