use crate::{DatabaseError, Table};
use std::ops::RangeBounds;

/// Read-only view of the database at a single point in time.
///
/// Implementations provide snapshot isolation: a reader never observes
/// writes committed after it was opened, and never blocks writers.
pub trait DbTx: Send + Sync {
    /// Point read.
    fn get<T: Table>(&self, key: &T::Key) -> Result<Option<T::Value>, DatabaseError>;

    /// First entry with key greater than or equal to `key`.
    fn seek<T: Table>(&self, key: &T::Key) -> Result<Option<(T::Key, T::Value)>, DatabaseError>;

    /// First entry with key strictly greater than `key`.
    fn next_above<T: Table>(
        &self,
        key: &T::Key,
    ) -> Result<Option<(T::Key, T::Value)>, DatabaseError>;

    /// First entry of the table.
    fn first<T: Table>(&self) -> Result<Option<(T::Key, T::Value)>, DatabaseError>;

    /// Last entry of the table.
    fn last<T: Table>(&self) -> Result<Option<(T::Key, T::Value)>, DatabaseError>;

    /// All entries within `range`, in key order.
    fn walk_range<T: Table>(
        &self,
        range: impl RangeBounds<T::Key>,
    ) -> Result<Vec<(T::Key, T::Value)>, DatabaseError>;
}

/// A read-write transaction. Writes become visible to readers only after
/// [`commit`](Self::commit); dropping the transaction discards them.
pub trait DbTxMut: DbTx {
    /// Inserts or overwrites an entry.
    fn put<T: Table>(&mut self, key: T::Key, value: T::Value) -> Result<(), DatabaseError>;

    /// Removes an entry if present.
    fn delete<T: Table>(&mut self, key: &T::Key) -> Result<(), DatabaseError>;

    /// Removes every entry within `range`.
    fn delete_range<T: Table>(
        &mut self,
        range: impl RangeBounds<T::Key>,
    ) -> Result<(), DatabaseError>;

    /// Atomically publishes all writes.
    fn commit(self) -> Result<(), DatabaseError>;
}

/// A database that can open transactions.
pub trait Database: Send + Sync {
    /// Read-only transaction type.
    type Tx: DbTx;
    /// Read-write transaction type.
    type TxMut: DbTxMut;

    /// Opens a snapshot-isolated read transaction.
    fn tx(&self) -> Result<Self::Tx, DatabaseError>;

    /// Opens a write transaction. The caller is responsible for running at
    /// most one write transaction at a time; the execution pipeline and the
    /// forkchoice engine serialize writers by construction.
    fn tx_mut(&self) -> Result<Self::TxMut, DatabaseError>;
}
