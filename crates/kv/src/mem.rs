//! In-memory database backend: one ordered map per table, copy-on-open
//! snapshots for readers, buffered writes published atomically on commit.

use crate::{Database, DatabaseError, DbTx, DbTxMut, Table};
use parking_lot::RwLock;
use std::{
    any::Any,
    collections::{BTreeMap, HashMap},
    ops::RangeBounds,
    sync::Arc,
};

/// Type-erased table storage.
trait AnyTable: Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn clone_box(&self) -> Box<dyn AnyTable>;
}

/// Ordered storage of a single table.
struct TableStore<T: Table>(BTreeMap<T::Key, T::Value>);

impl<T: Table> Default for TableStore<T> {
    fn default() -> Self {
        Self(BTreeMap::new())
    }
}

impl<T: Table> AnyTable for TableStore<T> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn clone_box(&self) -> Box<dyn AnyTable> {
        Box::new(Self(self.0.clone()))
    }
}

/// The full set of tables at one version.
#[derive(Default)]
struct TableSet {
    tables: HashMap<&'static str, Box<dyn AnyTable>>,
}

impl Clone for TableSet {
    fn clone(&self) -> Self {
        Self {
            tables: self.tables.iter().map(|(name, t)| (*name, t.clone_box())).collect(),
        }
    }
}

impl TableSet {
    fn table<T: Table>(&self) -> Result<Option<&BTreeMap<T::Key, T::Value>>, DatabaseError> {
        self.tables
            .get(T::NAME)
            .map(|t| {
                t.as_any()
                    .downcast_ref::<TableStore<T>>()
                    .map(|store| &store.0)
                    .ok_or(DatabaseError::TableType(T::NAME))
            })
            .transpose()
    }

    fn table_mut<T: Table>(&mut self) -> Result<&mut BTreeMap<T::Key, T::Value>, DatabaseError> {
        self.tables
            .entry(T::NAME)
            .or_insert_with(|| Box::<TableStore<T>>::default())
            .as_any_mut()
            .downcast_mut::<TableStore<T>>()
            .map(|store| &mut store.0)
            .ok_or(DatabaseError::TableType(T::NAME))
    }
}

/// In-memory [`Database`].
#[derive(Clone, Default)]
pub struct MemDb {
    inner: Arc<RwLock<TableSet>>,
}

impl std::fmt::Debug for MemDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemDb").finish_non_exhaustive()
    }
}

impl MemDb {
    /// Creates an empty database.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Database for MemDb {
    type Tx = MemTx;
    type TxMut = MemTxMut;

    fn tx(&self) -> Result<Self::Tx, DatabaseError> {
        Ok(MemTx { snapshot: self.inner.read().clone() })
    }

    fn tx_mut(&self) -> Result<Self::TxMut, DatabaseError> {
        Ok(MemTxMut { db: Arc::clone(&self.inner), working: self.inner.read().clone() })
    }
}

/// Snapshot-isolated read transaction.
pub struct MemTx {
    snapshot: TableSet,
}

impl std::fmt::Debug for MemTx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemTx").finish_non_exhaustive()
    }
}

/// Buffered write transaction; `commit` publishes the working set.
pub struct MemTxMut {
    db: Arc<RwLock<TableSet>>,
    working: TableSet,
}

impl std::fmt::Debug for MemTxMut {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemTxMut").finish_non_exhaustive()
    }
}

fn read_table<T: Table, R>(
    set: &TableSet,
    f: impl FnOnce(&BTreeMap<T::Key, T::Value>) -> R,
    empty: R,
) -> Result<R, DatabaseError> {
    Ok(match set.table::<T>()? {
        Some(map) => f(map),
        None => empty,
    })
}

macro_rules! impl_db_tx {
    ($ty:ty, $set:ident) => {
        impl DbTx for $ty {
            fn get<T: Table>(&self, key: &T::Key) -> Result<Option<T::Value>, DatabaseError> {
                read_table::<T, _>(&self.$set, |map| map.get(key).cloned(), None)
            }

            fn seek<T: Table>(
                &self,
                key: &T::Key,
            ) -> Result<Option<(T::Key, T::Value)>, DatabaseError> {
                read_table::<T, _>(
                    &self.$set,
                    |map| map.range(key.clone()..).next().map(|(k, v)| (k.clone(), v.clone())),
                    None,
                )
            }

            fn next_above<T: Table>(
                &self,
                key: &T::Key,
            ) -> Result<Option<(T::Key, T::Value)>, DatabaseError> {
                read_table::<T, _>(
                    &self.$set,
                    |map| {
                        map.range((std::ops::Bound::Excluded(key.clone()), std::ops::Bound::Unbounded))
                            .next()
                            .map(|(k, v)| (k.clone(), v.clone()))
                    },
                    None,
                )
            }

            fn first<T: Table>(&self) -> Result<Option<(T::Key, T::Value)>, DatabaseError> {
                read_table::<T, _>(
                    &self.$set,
                    |map| map.iter().next().map(|(k, v)| (k.clone(), v.clone())),
                    None,
                )
            }

            fn last<T: Table>(&self) -> Result<Option<(T::Key, T::Value)>, DatabaseError> {
                read_table::<T, _>(
                    &self.$set,
                    |map| map.iter().next_back().map(|(k, v)| (k.clone(), v.clone())),
                    None,
                )
            }

            fn walk_range<T: Table>(
                &self,
                range: impl RangeBounds<T::Key>,
            ) -> Result<Vec<(T::Key, T::Value)>, DatabaseError> {
                read_table::<T, _>(
                    &self.$set,
                    |map| map.range(range).map(|(k, v)| (k.clone(), v.clone())).collect(),
                    Vec::new(),
                )
            }
        }
    };
}

impl_db_tx!(MemTx, snapshot);
impl_db_tx!(MemTxMut, working);

impl DbTxMut for MemTxMut {
    fn put<T: Table>(&mut self, key: T::Key, value: T::Value) -> Result<(), DatabaseError> {
        self.working.table_mut::<T>()?.insert(key, value);
        Ok(())
    }

    fn delete<T: Table>(&mut self, key: &T::Key) -> Result<(), DatabaseError> {
        if self.working.tables.contains_key(T::NAME) {
            self.working.table_mut::<T>()?.remove(key);
        }
        Ok(())
    }

    fn delete_range<T: Table>(
        &mut self,
        range: impl RangeBounds<T::Key>,
    ) -> Result<(), DatabaseError> {
        let keys: Vec<T::Key> = self.walk_range::<T>(range)?.into_iter().map(|(k, _)| k).collect();
        let map = self.working.table_mut::<T>()?;
        for key in keys {
            map.remove(&key);
        }
        Ok(())
    }

    fn commit(self) -> Result<(), DatabaseError> {
        *self.db.write() = self.working;
        Ok(())
    }
}
