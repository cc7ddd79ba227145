//! Blueprint→store updater — leader-side table derivation.
//!
//! The controller pushes the raw blueprint text into every minion's
//! local row. On the elected etcd leader, this module parses it and
//! converges the container, connection, placement, load-balancer,
//! image, and hostname tables onto what the blueprint wants, always
//! preserving the runtime fields other components own (a container's
//! assigned minion, a load balancer's allocated IP, an image's build
//! state).

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, warn};

use flotilla_blueprint::{Blueprint, PUBLIC_INTERNET};
use flotilla_join::hash_join;
use flotilla_state::{
    Conn, Connection, Container, Hostname, Image, Placement, StoreError, TableType, View,
    ALL_TABLES,
};

/// Run the updater loop until shutdown. Does nothing on nodes that are
/// not the etcd leader.
pub async fn run(conn: Conn, mut stop: watch::Receiver<bool>) {
    let mut trigg = conn.trigger_tick(
        Duration::from_secs(30),
        &[TableType::Minion, TableType::Etcd],
    );

    loop {
        tokio::select! {
            _ = trigg.wait() => run_once(&conn),
            _ = stop.changed() => break,
        }
    }
}

/// One convergence cycle: leader check, parse, derive.
pub fn run_once(conn: &Conn) {
    match conn.etcd() {
        Ok(etcd) if etcd.leader => {}
        _ => return,
    }

    let Ok(minion) = conn.minion_self() else { return };
    if minion.blueprint.is_empty() {
        return;
    }

    let bp = match Blueprint::from_json(&minion.blueprint) {
        Ok(bp) => bp,
        Err(e) => {
            warn!(error = %e, "ignoring unparsable blueprint");
            return;
        }
    };

    let result = conn
        .txn(&ALL_TABLES)
        .run(|view| -> Result<(), StoreError> {
            update_policy(view, &bp);
            Ok(())
        });
    if result.is_ok() {
        debug!("blueprint tables converged");
    }
}

/// Converge every blueprint-derived table inside one transaction.
pub fn update_policy(view: &mut View, bp: &Blueprint) {
    update_containers(view, bp);
    update_connections(view, bp);
    update_placements(view, bp);
    update_load_balancers(view, bp);
    update_images(view, bp);
    update_hostnames(view);
}

fn update_containers(view: &mut View, bp: &Blueprint) {
    let desired: Vec<Container> = bp
        .containers
        .iter()
        .map(|c| Container {
            blueprint_id: c.id.clone(),
            image: c.image.name.clone(),
            dockerfile: c.image.dockerfile.clone(),
            command: c.command.clone(),
            env: c.env.clone(),
            hostname: c.hostname.clone(),
            ..Default::default()
        })
        .collect();
    let current = view.containers(|_| true);

    let joined = hash_join(
        desired,
        current,
        |c: &Container| c.blueprint_id.clone(),
        |c: &Container| c.blueprint_id.clone(),
    );

    for (want, mut have) in joined.pairs {
        // The blueprint ID is a content hash, so these normally match
        // already; `minion`, `docker_id`, `ip`, and `created` stay
        // untouched either way.
        have.image = want.image;
        have.dockerfile = want.dockerfile;
        have.command = want.command;
        have.env = want.env;
        have.hostname = want.hostname;
        view.commit_container(have);
    }
    for want in joined.left_only {
        let fresh = view.insert_container();
        view.commit_container(Container {
            id: fresh.id,
            ..want
        });
    }
    for gone in joined.right_only {
        view.remove_container(&gone);
    }
}

fn connection_key(c: &Connection) -> (String, String, u16, u16) {
    (c.from.clone(), c.to.clone(), c.min_port, c.max_port)
}

fn update_connections(view: &mut View, bp: &Blueprint) {
    let desired: Vec<Connection> = bp
        .connections
        .iter()
        .map(|c| Connection {
            from: c.from.clone(),
            to: c.to.clone(),
            min_port: c.min_port,
            max_port: c.max_port,
            ..Default::default()
        })
        .collect();
    let current = view.connections(|_| true);

    let joined = hash_join(desired, current, connection_key, connection_key);
    for want in joined.left_only {
        let fresh = view.insert_connection();
        view.commit_connection(Connection {
            id: fresh.id,
            ..want
        });
    }
    for gone in joined.right_only {
        view.remove_connection(&gone);
    }
}

/// Join key for placements. The container pair of a co/anti-locality
/// rule is unordered, so it is normalized before comparison.
fn placement_key(p: &Placement) -> (String, String, bool, String, String, String, String) {
    let (first, second) =
        if !p.other_container.is_empty() && p.other_container < p.target_container {
            (p.other_container.clone(), p.target_container.clone())
        } else {
            (p.target_container.clone(), p.other_container.clone())
        };
    (
        first,
        second,
        p.exclusive,
        p.provider.clone(),
        p.size.clone(),
        p.region.clone(),
        p.floating_ip.clone(),
    )
}

fn update_placements(view: &mut View, bp: &Blueprint) {
    let mut desired: Vec<Placement> = bp
        .placements
        .iter()
        .map(|p| Placement {
            target_container: p.target_container.clone(),
            exclusive: p.exclusive,
            other_container: p.other_container.clone(),
            provider: p.provider.clone(),
            size: p.size.clone(),
            region: p.region.clone(),
            floating_ip: p.floating_ip.clone(),
            ..Default::default()
        })
        .collect();
    desired.extend(derive_port_conflicts(bp));

    let current = view.placements(|_| true);
    let joined = hash_join(desired, current, placement_key, placement_key);
    for want in joined.left_only {
        let fresh = view.insert_placement();
        view.commit_placement(Placement {
            id: fresh.id,
            ..want
        });
    }
    for gone in joined.right_only {
        view.remove_placement(&gone);
    }
}

/// Two containers that both accept public-internet traffic on the same
/// starting port cannot share a machine: each worker has one public IP
/// to map the port on. Emit an exclusive placement per conflicting
/// pair. Only exact MinPort equality counts as a conflict; overlapping
/// ranges with different starts do not.
fn derive_port_conflicts(bp: &Blueprint) -> Vec<Placement> {
    let id_by_hostname: HashMap<&str, &str> = bp
        .containers
        .iter()
        .map(|c| (c.hostname.as_str(), c.id.as_str()))
        .collect();

    let public: Vec<(&str, u16)> = bp
        .connections
        .iter()
        .filter(|c| c.from == PUBLIC_INTERNET)
        .filter_map(|c| {
            id_by_hostname
                .get(c.to.as_str())
                .map(|id| (*id, c.min_port))
        })
        .collect();

    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for (i, &(a, port_a)) in public.iter().enumerate() {
        for &(b, port_b) in &public[i + 1..] {
            if a == b || port_a != port_b {
                continue;
            }
            let (first, second) = if a < b { (a, b) } else { (b, a) };
            if seen.insert((first, second)) {
                out.push(Placement {
                    target_container: first.to_string(),
                    other_container: second.to_string(),
                    exclusive: true,
                    ..Default::default()
                });
            }
        }
    }
    out
}

fn update_load_balancers(view: &mut View, bp: &Blueprint) {
    let desired: Vec<flotilla_state::LoadBalancer> = bp
        .load_balancers
        .iter()
        .map(|lb| flotilla_state::LoadBalancer {
            name: lb.name.clone(),
            hostnames: lb.hostnames.clone(),
            ..Default::default()
        })
        .collect();
    let current = view.load_balancers(|_| true);

    let joined = hash_join(
        desired,
        current,
        |lb: &flotilla_state::LoadBalancer| lb.name.clone(),
        |lb: &flotilla_state::LoadBalancer| lb.name.clone(),
    );
    for (want, mut have) in joined.pairs {
        // The allocated IP survives hostname membership changes.
        have.hostnames = want.hostnames;
        view.commit_load_balancer(have);
    }
    for want in joined.left_only {
        let fresh = view.insert_load_balancer();
        view.commit_load_balancer(flotilla_state::LoadBalancer {
            id: fresh.id,
            ..want
        });
    }
    for gone in joined.right_only {
        view.remove_load_balancer(&gone);
    }
}

fn update_images(view: &mut View, bp: &Blueprint) {
    // Only images the cluster builds itself get a row.
    let mut desired: Vec<Image> = Vec::new();
    for c in &bp.containers {
        if c.image.dockerfile.is_empty() {
            continue;
        }
        let duplicate = desired
            .iter()
            .any(|i| i.name == c.image.name && i.dockerfile == c.image.dockerfile);
        if !duplicate {
            desired.push(Image {
                name: c.image.name.clone(),
                dockerfile: c.image.dockerfile.clone(),
                ..Default::default()
            });
        }
    }
    let current = view.images(|_| true);

    let joined = hash_join(
        desired,
        current,
        |i: &Image| (i.name.clone(), i.dockerfile.clone()),
        |i: &Image| (i.name.clone(), i.dockerfile.clone()),
    );
    // Matched images keep their build status and docker ID.
    for want in joined.left_only {
        let fresh = view.insert_image();
        view.commit_image(Image {
            id: fresh.id,
            ..want
        });
    }
    for gone in joined.right_only {
        view.remove_image(&gone);
    }
}

fn hostname_key(h: &Hostname) -> (String, String) {
    (h.hostname.clone(), h.ip.clone())
}

/// Hostname rows mirror the containers and load balancers currently in
/// the store, carrying whatever IP has been allocated so far.
fn update_hostnames(view: &mut View) {
    let mut desired: Vec<Hostname> = Vec::new();
    for c in view.containers(|c| !c.hostname.is_empty()) {
        desired.push(Hostname {
            hostname: c.hostname,
            ip: c.ip,
            ..Default::default()
        });
    }
    for lb in view.load_balancers(|_| true) {
        desired.push(Hostname {
            hostname: lb.name,
            ip: lb.ip,
            ..Default::default()
        });
    }
    let current = view.hostnames(|_| true);

    let joined = hash_join(desired, current, hostname_key, hostname_key);
    for want in joined.left_only {
        let fresh = view.insert_hostname();
        view.commit_hostname(Hostname {
            id: fresh.id,
            ..want
        });
    }
    for gone in joined.right_only {
        view.remove_hostname(&gone);
    }
}
