//! Transactions and typed table access.
//!
//! A [`Conn`] is a cheap handle on a shared store. `conn.txn(tables)`
//! locks the named tables in declaration order and hands the body a
//! [`View`] over copies of their rows; the copies replace the live
//! rows only when the body returns `Ok`, and each modified table then
//! alerts its trigger subscribers exactly once.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::trace;

use crate::error::StoreError;
use crate::types::*;

/// A row of any table. Tables are homogeneous; the enum exists so the
/// storage layer stays monomorphic.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Row {
    Blueprint(BlueprintRow),
    Machine(Machine),
    Container(Container),
    Minion(Minion),
    Connection(Connection),
    LoadBalancer(LoadBalancer),
    Etcd(Etcd),
    Placement(Placement),
    Image(Image),
    Hostname(Hostname),
}

pub(crate) struct Table {
    pub(crate) rows: BTreeMap<RowId, Row>,
    pub(crate) triggers: Vec<mpsc::Sender<()>>,
}

impl Table {
    fn new() -> Self {
        Self {
            rows: BTreeMap::new(),
            triggers: Vec::new(),
        }
    }

    /// Signal every subscriber, dropping the ones whose receiver is
    /// gone. A full slot means an unread alert is already pending, so
    /// the new one coalesces into it.
    fn alert(&mut self) {
        self.triggers.retain(|tx| match tx.try_send(()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(())) => true,
            Err(mpsc::error::TrySendError::Closed(())) => false,
        });
        trace!(subscribers = self.triggers.len(), "table alerted");
    }
}

pub(crate) struct Shared {
    pub(crate) tables: [Mutex<Table>; TableType::COUNT],
    next_id: AtomicU32,
}

/// Handle on a shared store. Clones refer to the same store.
#[derive(Clone)]
pub struct Conn {
    pub(crate) shared: Arc<Shared>,
}

impl Conn {
    /// Create a fresh, empty store.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                tables: std::array::from_fn(|_| Mutex::new(Table::new())),
                next_id: AtomicU32::new(0),
            }),
        }
    }

    /// Start a transaction over the given tables. The table list is
    /// sorted into the global lock order; listing a table twice is
    /// harmless.
    pub fn txn(&self, tables: &[TableType]) -> Txn<'_> {
        let mut tables = tables.to_vec();
        tables.sort();
        tables.dedup();
        Txn {
            shared: &self.shared,
            tables,
        }
    }

    /// The unique `is_self` minion row.
    ///
    /// Returns `RowNotFound` while the local row has not been inserted
    /// yet. More than one such row is a store contract violation and
    /// panics.
    pub fn minion_self(&self) -> Result<Minion, StoreError> {
        let mut out = Err(StoreError::RowNotFound("self minion"));
        let _ = self
            .txn(&[TableType::Minion])
            .run(|view| -> Result<(), StoreError> {
                out = view.minion_self();
                Ok(())
            });
        out
    }
}

impl Default for Conn {
    fn default() -> Self {
        Self::new()
    }
}

/// A pending transaction; consumed by [`Txn::run`].
pub struct Txn<'a> {
    shared: &'a Shared,
    tables: Vec<TableType>,
}

impl Txn<'_> {
    /// Lock the tables, run the body on row copies, and commit on
    /// `Ok`. On `Err` every change the body made is discarded. Each
    /// table the body modified alerts its subscribers once, however
    /// many rows changed.
    pub fn run<E, F>(self, body: F) -> Result<(), E>
    where
        F: FnOnce(&mut View<'_>) -> Result<(), E>,
    {
        let mut guards: Vec<(TableType, MutexGuard<'_, Table>)> = self
            .tables
            .iter()
            .map(|&t| (t, self.shared.tables[t.index()].lock()))
            .collect();

        let mut view = View {
            shared: self.shared,
            tables: guards
                .iter()
                .map(|(t, guard)| (*t, guard.rows.clone()))
                .collect(),
            modified: BTreeSet::new(),
        };

        let result = body(&mut view);

        if result.is_ok() {
            let View {
                mut tables,
                modified,
                ..
            } = view;
            for (t, guard) in &mut guards {
                if modified.contains(t) {
                    if let Some(rows) = tables.remove(t) {
                        guard.rows = rows;
                    }
                    guard.alert();
                }
            }
        }

        result
    }
}

/// Transactional view over the locked tables.
///
/// All typed accessors panic when used on a table the transaction did
/// not lock; that is a contract violation, not a runtime condition.
pub struct View<'a> {
    shared: &'a Shared,
    tables: BTreeMap<TableType, BTreeMap<RowId, Row>>,
    modified: BTreeSet<TableType>,
}

impl View<'_> {
    fn alloc_id(&self) -> RowId {
        self.shared.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn rows(&self, t: TableType) -> &BTreeMap<RowId, Row> {
        self.tables
            .get(&t)
            .unwrap_or_else(|| panic!("table {t:?} is not locked by this transaction"))
    }

    fn rows_mut(&mut self, t: TableType) -> &mut BTreeMap<RowId, Row> {
        self.tables
            .get_mut(&t)
            .unwrap_or_else(|| panic!("table {t:?} is not locked by this transaction"))
    }

    fn insert_row(&mut self, t: TableType, id: RowId, row: Row) {
        self.rows_mut(t).insert(id, row);
        self.modified.insert(t);
    }

    /// Write a row back. Committing a row identical to the stored one
    /// neither modifies the table nor alerts.
    fn commit_row(&mut self, t: TableType, id: RowId, row: Row) {
        match self.rows(t).get(&id) {
            Some(existing) if *existing == row => return,
            Some(_) => {}
            None => panic!("commit of a row not in the store (table {t:?}, id {id})"),
        }
        self.rows_mut(t).insert(id, row);
        self.modified.insert(t);
    }

    fn remove_row(&mut self, t: TableType, id: RowId) {
        if self.rows_mut(t).remove(&id).is_some() {
            self.modified.insert(t);
        }
    }

    /// The unique `is_self` minion row; see [`Conn::minion_self`].
    pub fn minion_self(&self) -> Result<Minion, StoreError> {
        let mut minions = self.minions(|m| m.is_self);
        match minions.len() {
            0 => Err(StoreError::RowNotFound("self minion")),
            1 => Ok(minions.remove(0)),
            _ => panic!("multiple minion rows marked self"),
        }
    }
}

/// Typed insert/select/commit/remove for one multi-row table, on both
/// `View` (transactional) and `Conn` (single-table convenience reads).
macro_rules! row_ops {
    ($variant:ident, $row:ty, $table:expr,
     $insert:ident, $select:ident, $commit:ident, $remove:ident) => {
        impl View<'_> {
            /// Insert a fresh default row and return it for mutation
            /// and a later commit.
            pub fn $insert(&mut self) -> $row {
                let mut row = <$row>::default();
                row.id = self.alloc_id();
                self.insert_row($table, row.id, Row::$variant(row.clone()));
                row
            }

            /// All rows satisfying the predicate, in ID order.
            pub fn $select<F>(&self, pred: F) -> Vec<$row>
            where
                F: Fn(&$row) -> bool,
            {
                self.rows($table)
                    .values()
                    .filter_map(|row| match row {
                        Row::$variant(row) if pred(row) => Some(row.clone()),
                        _ => None,
                    })
                    .collect()
            }

            pub fn $commit(&mut self, row: $row) {
                self.commit_row($table, row.id, Row::$variant(row));
            }

            pub fn $remove(&mut self, row: &$row) {
                self.remove_row($table, row.id);
            }
        }

        impl Conn {
            /// All rows satisfying the predicate, via a single-table
            /// transaction.
            pub fn $select<F>(&self, pred: F) -> Vec<$row>
            where
                F: Fn(&$row) -> bool,
            {
                let mut out = Vec::new();
                let _ = self.txn(&[$table]).run(|view| -> Result<(), StoreError> {
                    out = view.$select(&pred);
                    Ok(())
                });
                out
            }
        }
    };
}

row_ops!(
    Machine,
    Machine,
    TableType::Machine,
    insert_machine,
    machines,
    commit_machine,
    remove_machine
);
row_ops!(
    Container,
    Container,
    TableType::Container,
    insert_container,
    containers,
    commit_container,
    remove_container
);
row_ops!(
    Minion,
    Minion,
    TableType::Minion,
    insert_minion,
    minions,
    commit_minion,
    remove_minion
);
row_ops!(
    Connection,
    Connection,
    TableType::Connection,
    insert_connection,
    connections,
    commit_connection,
    remove_connection
);
row_ops!(
    LoadBalancer,
    LoadBalancer,
    TableType::LoadBalancer,
    insert_load_balancer,
    load_balancers,
    commit_load_balancer,
    remove_load_balancer
);
row_ops!(
    Placement,
    Placement,
    TableType::Placement,
    insert_placement,
    placements,
    commit_placement,
    remove_placement
);
row_ops!(
    Image,
    Image,
    TableType::Image,
    insert_image,
    images,
    commit_image,
    remove_image
);
row_ops!(
    Hostname,
    Hostname,
    TableType::Hostname,
    insert_hostname,
    hostnames,
    commit_hostname,
    remove_hostname
);

/// Typed access for a singleton table: `get` errors while the row is
/// absent and panics on duplicates.
macro_rules! singleton_ops {
    ($variant:ident, $row:ty, $table:expr, $name:literal,
     $get:ident, $insert:ident, $commit:ident) => {
        impl View<'_> {
            pub fn $get(&self) -> Result<$row, StoreError> {
                let mut rows = self.rows($table).values();
                match (rows.next(), rows.next()) {
                    (Some(Row::$variant(row)), None) => Ok(row.clone()),
                    (None, _) => Err(StoreError::RowNotFound($name)),
                    _ => panic!(concat!("multiple ", $name, " rows")),
                }
            }

            pub fn $insert(&mut self) -> $row {
                let mut row = <$row>::default();
                row.id = self.alloc_id();
                self.insert_row($table, row.id, Row::$variant(row.clone()));
                row
            }

            pub fn $commit(&mut self, row: $row) {
                self.commit_row($table, row.id, Row::$variant(row));
            }
        }

        impl Conn {
            pub fn $get(&self) -> Result<$row, StoreError> {
                let mut out = Err(StoreError::RowNotFound($name));
                let _ = self.txn(&[$table]).run(|view| -> Result<(), StoreError> {
                    out = view.$get();
                    Ok(())
                });
                out
            }
        }
    };
}

singleton_ops!(
    Blueprint,
    BlueprintRow,
    TableType::Blueprint,
    "blueprint",
    blueprint,
    insert_blueprint,
    commit_blueprint
);
singleton_ops!(
    Etcd,
    Etcd,
    TableType::Etcd,
    "etcd",
    etcd,
    insert_etcd,
    commit_etcd
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_select_commit_remove() {
        let conn = Conn::new();

        conn.txn(&[TableType::Machine])
            .run(|view| -> Result<(), StoreError> {
                let mut m = view.insert_machine();
                m.provider = "mock".into();
                m.size = "small".into();
                view.commit_machine(m);
                Ok(())
            })
            .unwrap();

        let machines = conn.machines(|_| true);
        assert_eq!(machines.len(), 1);
        assert_eq!(machines[0].provider, "mock");
        assert_eq!(machines[0].size, "small");

        conn.txn(&[TableType::Machine])
            .run(|view| -> Result<(), StoreError> {
                let m = view.machines(|_| true).remove(0);
                view.remove_machine(&m);
                Ok(())
            })
            .unwrap();
        assert!(conn.machines(|_| true).is_empty());
    }

    #[test]
    fn select_applies_predicate() {
        let conn = Conn::new();
        conn.txn(&[TableType::Machine])
            .run(|view| -> Result<(), StoreError> {
                for region in ["alpha", "alpha", "beta"] {
                    let mut m = view.insert_machine();
                    m.region = region.into();
                    view.commit_machine(m);
                }
                Ok(())
            })
            .unwrap();

        assert_eq!(conn.machines(|m| m.region == "alpha").len(), 2);
        assert_eq!(conn.machines(|m| m.region == "beta").len(), 1);
    }

    #[test]
    fn ids_are_unique_across_tables() {
        let conn = Conn::new();
        let mut ids = Vec::new();
        conn.txn(&[TableType::Machine, TableType::Container])
            .run(|view| -> Result<(), StoreError> {
                ids.push(view.insert_machine().id);
                ids.push(view.insert_container().id);
                ids.push(view.insert_machine().id);
                Ok(())
            })
            .unwrap();

        let mut sorted = ids.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), 3);
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn failed_transaction_discards_changes() {
        let conn = Conn::new();
        let result = conn
            .txn(&[TableType::Machine])
            .run(|view| -> Result<(), StoreError> {
                view.insert_machine();
                Err(StoreError::RowNotFound("forced"))
            });

        assert!(result.is_err());
        assert!(conn.machines(|_| true).is_empty());
    }

    #[test]
    fn singleton_get_insert() {
        let conn = Conn::new();
        assert_eq!(conn.etcd(), Err(StoreError::RowNotFound("etcd")));

        conn.txn(&[TableType::Etcd])
            .run(|view| -> Result<(), StoreError> {
                let mut etcd = view.insert_etcd();
                etcd.leader = true;
                view.commit_etcd(etcd);
                Ok(())
            })
            .unwrap();

        assert!(conn.etcd().unwrap().leader);
    }

    #[test]
    #[should_panic(expected = "multiple etcd rows")]
    fn duplicate_singleton_panics() {
        let conn = Conn::new();
        conn.txn(&[TableType::Etcd])
            .run(|view| -> Result<(), StoreError> {
                view.insert_etcd();
                view.insert_etcd();
                view.etcd().ok();
                Ok(())
            })
            .ok();
    }

    #[test]
    #[should_panic(expected = "not locked by this transaction")]
    fn unlocked_table_access_panics() {
        let conn = Conn::new();
        conn.txn(&[TableType::Machine])
            .run(|view| -> Result<(), StoreError> {
                view.containers(|_| true);
                Ok(())
            })
            .ok();
    }

    #[test]
    #[should_panic(expected = "commit of a row not in the store")]
    fn commit_without_insert_panics() {
        let conn = Conn::new();
        conn.txn(&[TableType::Machine])
            .run(|view| -> Result<(), StoreError> {
                view.commit_machine(Machine::default());
                Ok(())
            })
            .ok();
    }

    #[test]
    fn minion_self_lookup() {
        let conn = Conn::new();
        assert_eq!(
            conn.minion_self(),
            Err(StoreError::RowNotFound("self minion"))
        );

        conn.txn(&[TableType::Minion])
            .run(|view| -> Result<(), StoreError> {
                let mut m = view.insert_minion();
                m.is_self = true;
                m.private_ip = "10.0.0.1".into();
                view.commit_minion(m);

                // A second, non-self row must not interfere.
                view.insert_minion();
                Ok(())
            })
            .unwrap();

        assert_eq!(conn.minion_self().unwrap().private_ip, "10.0.0.1");
    }

    #[test]
    fn disjoint_transactions_run_in_parallel() {
        let conn = Conn::new();
        let (holding_tx, holding_rx) = std::sync::mpsc::channel::<()>();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();

        let conn2 = conn.clone();
        let holder = std::thread::spawn(move || {
            conn2
                .txn(&[TableType::Machine])
                .run(|view| -> Result<(), StoreError> {
                    view.insert_machine();
                    holding_tx.send(()).unwrap();
                    // Hold the Machine lock until released.
                    release_rx.recv().unwrap();
                    Ok(())
                })
                .unwrap();
        });

        // While the Machine table is held, a Container transaction
        // must still complete.
        holding_rx.recv().unwrap();
        conn.txn(&[TableType::Container])
            .run(|view| -> Result<(), StoreError> {
                view.insert_container();
                Ok(())
            })
            .unwrap();

        release_tx.send(()).unwrap();
        holder.join().unwrap();

        assert_eq!(conn.machines(|_| true).len(), 1);
        assert_eq!(conn.containers(|_| true).len(), 1);
    }

    #[test]
    fn blueprint_singleton_round_trip() {
        let conn = Conn::new();
        conn.txn(&[TableType::Blueprint])
            .run(|view| -> Result<(), StoreError> {
                let mut bp = view.insert_blueprint();
                bp.blueprint.namespace = "ns".into();
                view.commit_blueprint(bp);
                Ok(())
            })
            .unwrap();

        assert_eq!(conn.blueprint().unwrap().namespace(), "ns");
    }
}
