//! kelda-db — the in-memory relational store.
//!
//! Every subsystem reads rows out of this store, diffs them against the
//! outside world, and writes observed state back. The store offers typed
//! tables, serializable transactions under a single write lock, monotonic
//! row ids, author stamps on rows, and trigger channels that coalesce
//! bursts of writes.
//!
//! ```no_run
//! use kelda_db::{Conn, Machine, StoreError, Table};
//!
//! let conn = Conn::new();
//! conn.txn(&[Table::Machine]).run(|view| {
//!     let mut m = view.insert::<Machine>();
//!     m.size = "m3.medium".to_string();
//!     view.commit(m)
//! })?;
//! # Ok::<(), StoreError>(())
//! ```

mod error;
mod store;
mod trigger;
mod types;

pub use error::StoreError;
pub use store::{Author, Conn, Database, Record, Txn};
#[doc(hidden)]
pub use store::{Stored, Tables};
pub use trigger::{Ticker, Trigger};
pub use types::{
    Blueprint, Connection, Container, Etcd, Hostname, Image, LoadBalancer, Machine, Minion,
    Placement, ProviderName, Role, RowId, Table, UnknownProvider, UnknownRole,
};
