//! Cursors over the stored branch-node tables and the walker's per-level
//! stack entry.

use crate::{
    mask::{BranchNodeCompact, TrieKey},
    nibbles::Nibbles,
    updates::{AccountsTrie, StoragesTrie},
};
use alloy_primitives::B256;
use stele_kv::{DatabaseError, DbTx};

/// Navigation over one trie's stored branch nodes.
pub trait TrieCursor {
    /// The entry at exactly `key`.
    fn seek_exact(
        &mut self,
        key: &Nibbles,
    ) -> Result<Option<(Nibbles, BranchNodeCompact)>, DatabaseError>;

    /// The first entry at or after `key`.
    fn seek(
        &mut self,
        key: &Nibbles,
    ) -> Result<Option<(Nibbles, BranchNodeCompact)>, DatabaseError>;

    /// The table key of the entry the cursor last yielded, for delete
    /// scheduling.
    fn current(&self) -> Option<TrieKey>;
}

/// Cursor over the account trie.
#[derive(Debug)]
pub struct AccountTrieCursor<'a, TX> {
    tx: &'a TX,
    last: Option<Nibbles>,
}

impl<'a, TX> AccountTrieCursor<'a, TX> {
    /// Creates a new account trie cursor.
    pub fn new(tx: &'a TX) -> Self {
        Self { tx, last: None }
    }
}

impl<TX: DbTx> TrieCursor for AccountTrieCursor<'_, TX> {
    fn seek_exact(
        &mut self,
        key: &Nibbles,
    ) -> Result<Option<(Nibbles, BranchNodeCompact)>, DatabaseError> {
        let entry = self.tx.get::<AccountsTrie>(&key.as_slice().to_vec())?;
        self.last = entry.is_some().then(|| key.clone());
        Ok(entry.map(|node| (key.clone(), node)))
    }

    fn seek(
        &mut self,
        key: &Nibbles,
    ) -> Result<Option<(Nibbles, BranchNodeCompact)>, DatabaseError> {
        let entry = self.tx.seek::<AccountsTrie>(&key.as_slice().to_vec())?;
        let entry = entry.map(|(key, node)| (Nibbles::from(key), node));
        self.last = entry.as_ref().map(|(key, _)| key.clone());
        Ok(entry)
    }

    fn current(&self) -> Option<TrieKey> {
        self.last.clone().map(TrieKey::AccountNode)
    }
}

/// Cursor over one account's storage trie.
#[derive(Debug)]
pub struct StorageTrieCursor<'a, TX> {
    tx: &'a TX,
    hashed_address: B256,
    last: Option<Nibbles>,
}

impl<'a, TX> StorageTrieCursor<'a, TX> {
    /// Creates a cursor scoped to `hashed_address`'s storage trie.
    pub fn new(tx: &'a TX, hashed_address: B256) -> Self {
        Self { tx, hashed_address, last: None }
    }
}

impl<TX: DbTx> TrieCursor for StorageTrieCursor<'_, TX> {
    fn seek_exact(
        &mut self,
        key: &Nibbles,
    ) -> Result<Option<(Nibbles, BranchNodeCompact)>, DatabaseError> {
        let entry =
            self.tx.get::<StoragesTrie>(&(self.hashed_address, key.as_slice().to_vec()))?;
        self.last = entry.is_some().then(|| key.clone());
        Ok(entry.map(|node| (key.clone(), node)))
    }

    fn seek(
        &mut self,
        key: &Nibbles,
    ) -> Result<Option<(Nibbles, BranchNodeCompact)>, DatabaseError> {
        let entry = self
            .tx
            .seek::<StoragesTrie>(&(self.hashed_address, key.as_slice().to_vec()))?
            .filter(|((address, _), _)| *address == self.hashed_address)
            .map(|((_, key), node)| (Nibbles::from(key), node));
        self.last = entry.as_ref().map(|(key, _)| key.clone());
        Ok(entry)
    }

    fn current(&self) -> Option<TrieKey> {
        self.last.clone().map(|key| TrieKey::StorageNode(self.hashed_address, key))
    }
}

/// One level of the walker's traversal stack: a stored branch node plus the
/// child nibble currently being visited. `nibble == -1` addresses the node
/// itself rather than any child.
#[derive(Clone, Debug)]
pub struct CursorSubNode {
    /// Path of the node.
    pub key: Nibbles,
    /// The stored node, absent for levels synthesized from the root.
    pub node: Option<BranchNodeCompact>,
    /// Child position under the node, `-1` for the node itself.
    pub nibble: i8,
}

impl Default for CursorSubNode {
    fn default() -> Self {
        Self { key: Nibbles::default(), node: None, nibble: -1 }
    }
}

impl CursorSubNode {
    /// Creates a sub-node. Nodes with a recorded root hash are positioned on
    /// the node itself (`-1`) so the hash can be reused; others start at
    /// their first child with state.
    pub fn new(key: Nibbles, node: Option<BranchNodeCompact>) -> Self {
        let nibble = match &node {
            Some(node) if node.root_hash.is_none() => {
                (0i8..16).find(|i| node.state_mask.is_bit_set(*i as u8)).expect("state mask empty")
            }
            _ => -1,
        };
        Self { key, node, nibble }
    }

    /// The full path including the current child nibble.
    pub fn full_key(&self) -> Nibbles {
        let mut key = self.key.clone();
        if self.nibble >= 0 {
            key.push(self.nibble as u8);
        }
        key
    }

    /// Whether the current position has state below it.
    pub fn state_flag(&self) -> bool {
        match &self.node {
            Some(node) if self.nibble >= 0 => node.state_mask.is_bit_set(self.nibble as u8),
            _ => true,
        }
    }

    /// Whether the current position has a stored subtree below it.
    pub fn tree_flag(&self) -> bool {
        match &self.node {
            Some(node) if self.nibble >= 0 => node.tree_mask.is_bit_set(self.nibble as u8),
            _ => true,
        }
    }

    /// Whether the current position has a recorded hash.
    pub fn hash_flag(&self) -> bool {
        match &self.node {
            Some(node) if self.nibble >= 0 => node.hash_mask.is_bit_set(self.nibble as u8),
            Some(node) => node.root_hash.is_some(),
            None => false,
        }
    }

    /// The recorded hash at the current position, if any.
    pub fn hash(&self) -> Option<B256> {
        let node = self.node.as_ref()?;
        if self.nibble >= 0 {
            node.hash_mask
                .is_bit_set(self.nibble as u8)
                .then(|| node.hash_for_nibble(self.nibble as u8))
        } else {
            node.root_hash
        }
    }
}
