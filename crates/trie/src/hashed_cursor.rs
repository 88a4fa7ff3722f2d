//! Cursors over the keccak-keyed state tables consumed by root computation.

use alloy_primitives::{B256, U256};
use stele_kv::{
    tables::{HashedAccounts, HashedStorage},
    DatabaseError, DbTx,
};
use stele_primitives::Account;

/// Ordered iteration over hashed accounts.
#[derive(Debug)]
pub struct HashedAccountCursor<'a, TX> {
    tx: &'a TX,
    last: Option<B256>,
}

impl<'a, TX: DbTx> HashedAccountCursor<'a, TX> {
    /// Creates a new cursor.
    pub fn new(tx: &'a TX) -> Self {
        Self { tx, last: None }
    }

    /// First account at or after `key`.
    pub fn seek(&mut self, key: B256) -> Result<Option<(B256, Account)>, DatabaseError> {
        let entry = self.tx.seek::<HashedAccounts>(&key)?;
        self.last = entry.as_ref().map(|(key, _)| *key);
        Ok(entry)
    }

    /// The account after the last yielded one.
    pub fn next(&mut self) -> Result<Option<(B256, Account)>, DatabaseError> {
        let Some(last) = self.last else { return Ok(None) };
        let entry = self.tx.next_above::<HashedAccounts>(&last)?;
        self.last = entry.as_ref().map(|(key, _)| *key);
        Ok(entry)
    }
}

/// Ordered iteration over one account's hashed storage.
#[derive(Debug)]
pub struct HashedStorageCursor<'a, TX> {
    tx: &'a TX,
    hashed_address: B256,
    last: Option<B256>,
}

impl<'a, TX: DbTx> HashedStorageCursor<'a, TX> {
    /// Creates a cursor scoped to `hashed_address`.
    pub fn new(tx: &'a TX, hashed_address: B256) -> Self {
        Self { tx, hashed_address, last: None }
    }

    /// Whether the account has no storage at all.
    pub fn is_empty(&self) -> Result<bool, DatabaseError> {
        let entry = self
            .tx
            .seek::<HashedStorage>(&(self.hashed_address, B256::ZERO))?
            .filter(|((address, _), _)| *address == self.hashed_address);
        Ok(entry.is_none())
    }

    /// First slot at or after `key`.
    pub fn seek(&mut self, key: B256) -> Result<Option<(B256, U256)>, DatabaseError> {
        let entry = self
            .tx
            .seek::<HashedStorage>(&(self.hashed_address, key))?
            .filter(|((address, _), _)| *address == self.hashed_address)
            .map(|((_, slot), value)| (slot, value));
        self.last = entry.as_ref().map(|(slot, _)| *slot);
        Ok(entry)
    }

    /// The slot after the last yielded one.
    pub fn next(&mut self) -> Result<Option<(B256, U256)>, DatabaseError> {
        let Some(last) = self.last else { return Ok(None) };
        let entry = self
            .tx
            .next_above::<HashedStorage>(&(self.hashed_address, last))?
            .filter(|((address, _), _)| *address == self.hashed_address)
            .map(|((_, slot), value)| (slot, value));
        self.last = entry.as_ref().map(|(slot, _)| *slot);
        Ok(entry)
    }
}
