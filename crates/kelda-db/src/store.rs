//! The in-memory relational store.
//!
//! All process state lives in typed tables behind one write lock. A
//! transaction names its write set up front, runs a closure against a
//! working copy of the tables, and either swaps the copy in (bumping the
//! version counter of every table it touched, which wakes triggers) or
//! discards it wholesale when the closure errors.
//!
//! Rows are stamped with the author that inserted them; committing a row
//! stamped by a different author fails the transaction. Removal is exempt:
//! reconcilers delete rows whose external counterpart disappeared even when
//! another author created them.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;

use crate::error::StoreError;
use crate::trigger::{spawn_trigger, Trigger};
use crate::types::*;

/// The subsystem that owns a row. Desired-state rows belong to the engine;
/// observed-state rows belong to the reconciler that wrote them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Author {
    /// No ownership enforcement (tests, the CLI, fresh connections).
    #[default]
    Unowned,
    Engine,
    Cluster,
    Foreman,
    Minion,
}

/// A row together with its author stamp.
#[doc(hidden)]
#[derive(Debug, Clone)]
pub struct Stored<R> {
    pub row: R,
    pub author: Author,
}

/// Backing storage for every table.
#[doc(hidden)]
#[derive(Debug, Clone, Default)]
pub struct Tables {
    machines: BTreeMap<RowId, Stored<Machine>>,
    minions: BTreeMap<RowId, Stored<Minion>>,
    etcds: BTreeMap<RowId, Stored<Etcd>>,
    containers: BTreeMap<RowId, Stored<Container>>,
    hostnames: BTreeMap<RowId, Stored<Hostname>>,
    load_balancers: BTreeMap<RowId, Stored<LoadBalancer>>,
    connections: BTreeMap<RowId, Stored<Connection>>,
    placements: BTreeMap<RowId, Stored<Placement>>,
    blueprints: BTreeMap<RowId, Stored<Blueprint>>,
    images: BTreeMap<RowId, Stored<Image>>,
}

/// A row type stored in one of the tables.
pub trait Record: Clone + Default + std::fmt::Debug + Send + 'static {
    /// The table this row type belongs to.
    const TABLE: Table;
    fn id(&self) -> RowId;
    #[doc(hidden)]
    fn set_id(&mut self, id: RowId);
    #[doc(hidden)]
    fn slot(tables: &Tables) -> &BTreeMap<RowId, Stored<Self>>;
    #[doc(hidden)]
    fn slot_mut(tables: &mut Tables) -> &mut BTreeMap<RowId, Stored<Self>>;
}

macro_rules! impl_record {
    ($ty:ident, $table:expr, $field:ident) => {
        impl Record for $ty {
            const TABLE: Table = $table;
            fn id(&self) -> RowId {
                self.id
            }
            fn set_id(&mut self, id: RowId) {
                self.id = id;
            }
            fn slot(tables: &Tables) -> &BTreeMap<RowId, Stored<Self>> {
                &tables.$field
            }
            fn slot_mut(tables: &mut Tables) -> &mut BTreeMap<RowId, Stored<Self>> {
                &mut tables.$field
            }
        }
    };
}

impl_record!(Machine, Table::Machine, machines);
impl_record!(Minion, Table::Minion, minions);
impl_record!(Etcd, Table::Etcd, etcds);
impl_record!(Container, Table::Container, containers);
impl_record!(Hostname, Table::Hostname, hostnames);
impl_record!(LoadBalancer, Table::LoadBalancer, load_balancers);
impl_record!(Connection, Table::Connection, connections);
impl_record!(Placement, Table::Placement, placements);
impl_record!(Blueprint, Table::Blueprint, blueprints);
impl_record!(Image, Table::Image, images);

pub(crate) struct Shared {
    tables: Mutex<Tables>,
    next_id: AtomicU64,
    versions: BTreeMap<Table, watch::Sender<u64>>,
}

impl Shared {
    fn bump(&self, table: Table) {
        if let Some(tx) = self.versions.get(&table) {
            tx.send_modify(|v| *v += 1);
        }
    }

    pub(crate) fn subscribe(&self, table: Table) -> watch::Receiver<u64> {
        self.versions[&table].subscribe()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        // The master copy is never mutated mid-transaction, so a panic in a
        // transaction body leaves it intact; recover the guard.
        match self.tables.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// A handle on the store. Cheap to clone; all clones share the same tables.
#[derive(Clone)]
pub struct Conn {
    shared: Arc<Shared>,
    author: Author,
}

impl Default for Conn {
    fn default() -> Self {
        Self::new()
    }
}

impl Conn {
    /// Create a fresh, empty store.
    pub fn new() -> Conn {
        let versions = Table::all()
            .iter()
            .map(|t| (*t, watch::channel(0).0))
            .collect();
        Conn {
            shared: Arc::new(Shared {
                tables: Mutex::new(Tables::default()),
                next_id: AtomicU64::new(1),
                versions,
            }),
            author: Author::Unowned,
        }
    }

    /// A connection whose transactions are stamped with `author`.
    pub fn scoped(&self, author: Author) -> Conn {
        Conn {
            shared: Arc::clone(&self.shared),
            author,
        }
    }

    /// Begin a transaction whose write set is `tables`. Reads may touch any
    /// table; writes outside the set panic.
    pub fn txn(&self, tables: &[Table]) -> Txn {
        Txn {
            conn: self.clone(),
            write_set: tables.iter().copied().collect(),
        }
    }

    /// A transaction over every table.
    pub fn txn_all(&self) -> Txn {
        self.txn(Table::all())
    }

    /// The `Minion` row describing this host.
    pub fn minion_self(&self) -> Result<Minion, StoreError> {
        self.txn(&[]).run(|view| {
            view.select_from::<Minion>(|m| m.is_self)
                .into_iter()
                .next()
                .ok_or(StoreError::NoMinionSelf)
        })
    }

    /// True when this host is the etcd leader.
    pub fn etcd_leader(&self) -> bool {
        self.txn(&[])
            .run(|view| Ok::<_, StoreError>(view.etcd().map(|e| e.leader).unwrap_or(false)))
            .unwrap_or(false)
    }

    /// A trigger that fires when any of `tables` changes.
    pub fn trigger(&self, tables: &[Table]) -> Trigger {
        spawn_trigger(&self.shared, None, tables)
    }

    /// A trigger that fires on changes to `tables` and at least every
    /// `floor_secs` seconds when nothing else fired.
    pub fn trigger_tick(&self, floor_secs: u64, tables: &[Table]) -> Trigger {
        spawn_trigger(
            &self.shared,
            Some(std::time::Duration::from_secs(floor_secs)),
            tables,
        )
    }
}

/// A transaction factory bound to one write set.
pub struct Txn {
    conn: Conn,
    write_set: BTreeSet<Table>,
}

impl Txn {
    /// Run `f` against the store under the global write lock.
    ///
    /// `f` operates on a working copy; an `Err` discards every write, `Ok`
    /// publishes them atomically and wakes triggers on the dirty tables.
    /// User errors are returned verbatim.
    pub fn run<T, E>(&self, f: impl FnOnce(&mut Database<'_>) -> Result<T, E>) -> Result<T, E>
    where
        E: From<StoreError>,
    {
        let shared = &self.conn.shared;
        let mut guard = shared.lock();
        let mut work = guard.clone();
        let mut dirty = BTreeSet::new();
        let result = {
            let mut view = Database {
                tables: &mut work,
                write_set: &self.write_set,
                author: self.conn.author,
                dirty: &mut dirty,
                next_id: &shared.next_id,
            };
            f(&mut view)
        };
        match result {
            Ok(value) => {
                *guard = work;
                drop(guard);
                for table in dirty {
                    shared.bump(table);
                }
                Ok(value)
            }
            Err(err) => Err(err),
        }
    }
}

/// The view a transaction body operates on.
pub struct Database<'txn> {
    tables: &'txn mut Tables,
    write_set: &'txn BTreeSet<Table>,
    author: Author,
    dirty: &'txn mut BTreeSet<Table>,
    next_id: &'txn AtomicU64,
}

impl Database<'_> {
    fn check_write(&self, table: Table) {
        assert!(
            self.write_set.contains(&table),
            "table {table:?} is not in the transaction's write set"
        );
    }

    /// Insert a fresh row with a newly assigned id, stamped with the
    /// transaction's author. Mutate the returned row and `commit` it.
    pub fn insert<R: Record>(&mut self) -> R {
        self.check_write(R::TABLE);
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut row = R::default();
        row.set_id(id);
        R::slot_mut(self.tables).insert(
            id,
            Stored {
                row: row.clone(),
                author: self.author,
            },
        );
        self.dirty.insert(R::TABLE);
        row
    }

    /// Rows of `R` matching `pred`.
    pub fn select_from<R: Record>(&self, pred: impl Fn(&R) -> bool) -> Vec<R> {
        R::slot(self.tables)
            .values()
            .filter(|stored| pred(&stored.row))
            .map(|stored| stored.row.clone())
            .collect()
    }

    /// Every row of `R`.
    pub fn all<R: Record>(&self) -> Vec<R> {
        self.select_from::<R>(|_| true)
    }

    /// Persist mutations to a row previously returned by `insert` or
    /// `select_from`. Uncommitted mutations are invisible to other
    /// transactions.
    pub fn commit<R: Record>(&mut self, row: R) -> Result<(), StoreError> {
        self.check_write(R::TABLE);
        let stored = R::slot_mut(self.tables)
            .get_mut(&row.id())
            .ok_or(StoreError::UnknownRow {
                table: R::TABLE,
                id: row.id(),
            })?;
        if stored.author != Author::Unowned
            && self.author != Author::Unowned
            && stored.author != self.author
        {
            return Err(StoreError::AuthorMismatch {
                table: R::TABLE,
                id: row.id(),
                owner: stored.author,
                author: self.author,
            });
        }
        stored.row = row;
        self.dirty.insert(R::TABLE);
        Ok(())
    }

    /// Delete a row. Missing rows are not an error.
    pub fn remove<R: Record>(&mut self, row: &R) {
        self.check_write(R::TABLE);
        if R::slot_mut(self.tables).remove(&row.id()).is_some() {
            self.dirty.insert(R::TABLE);
        }
    }

    /// The `Etcd` singleton, if it has been created.
    pub fn etcd(&self) -> Option<Etcd> {
        self.all::<Etcd>().into_iter().next()
    }

    /// The `Minion` row describing this host.
    pub fn minion_self(&self) -> Option<Minion> {
        self.select_from::<Minion>(|m| m.is_self).into_iter().next()
    }

    /// The hostname → IP map, from rows whose IP is assigned.
    pub fn hostname_mappings(&self) -> HashMap<String, String> {
        self.all::<Hostname>()
            .into_iter()
            .filter(|h| !h.ip.is_empty())
            .map(|h| (h.hostname, h.ip))
            .collect()
    }
}
