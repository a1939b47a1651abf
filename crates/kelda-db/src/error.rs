//! Error types for the store.

use thiserror::Error;

use crate::store::Author;
use crate::types::{RowId, Table};

/// Errors surfaced by store transactions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// A `commit` referenced a row that was never inserted or was removed.
    #[error("{table:?} row {id} does not exist")]
    UnknownRow { table: Table, id: RowId },

    /// A `commit` tried to mutate a row stamped by a different author.
    #[error("{table:?} row {id} is owned by {owner:?}, not {author:?}")]
    AuthorMismatch {
        table: Table,
        id: RowId,
        owner: Author,
        author: Author,
    },

    /// No row has `is_self` set; this host's minion has not reported yet.
    #[error("no self minion row")]
    NoMinionSelf,
}
