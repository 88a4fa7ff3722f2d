//! Retained trie updates and the stored-node tables they flush into.

use crate::{
    mask::{BranchNodeCompact, TrieKey},
    nibbles::Nibbles,
};
use alloy_primitives::B256;
use std::collections::HashMap;
use stele_kv::{DatabaseError, DbTx, DbTxMut};

stele_kv::tables! {
    /// Stored branch nodes of the account trie, keyed by nibble path.
    table AccountsTrie<Key = Vec<u8>, Value = BranchNodeCompact>;

    /// Stored branch nodes of per-account storage tries, keyed by hashed
    /// owner address and nibble path.
    table StoragesTrie<Key = (B256, Vec<u8>), Value = BranchNodeCompact>;
}

/// The operation to perform on a stored trie node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TrieOp {
    /// Remove the entry.
    Delete,
    /// Insert or replace the entry.
    Update(BranchNodeCompact),
}

impl TrieOp {
    /// Returns `true` for updates.
    pub fn is_update(&self) -> bool {
        matches!(self, Self::Update(..))
    }
}

/// Aggregated stored-trie mutations produced by a root computation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TrieUpdates {
    operations: HashMap<TrieKey, TrieOp>,
}

impl IntoIterator for TrieUpdates {
    type Item = (TrieKey, TrieOp);
    type IntoIter = std::collections::hash_map::IntoIter<TrieKey, TrieOp>;

    fn into_iter(self) -> Self::IntoIter {
        self.operations.into_iter()
    }
}

impl TrieUpdates {
    /// Number of pending operations.
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Whether there are no pending operations.
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Iterates the pending operations.
    pub fn iter(&self) -> impl Iterator<Item = (&TrieKey, &TrieOp)> {
        self.operations.iter()
    }

    /// Schedules removal of a stale node consumed by the walker.
    ///
    /// # Panics
    ///
    /// If the node was already scheduled as an update; deleting a freshly
    /// computed node is a traversal bug.
    pub fn schedule_delete(&mut self, key: TrieKey) {
        let existing = self.operations.insert(key, TrieOp::Delete);
        if let Some(op) = existing {
            assert!(!op.is_update(), "tried to delete a node that was already updated");
        }
    }

    /// Merges another update set into this one.
    pub fn extend(&mut self, updates: impl IntoIterator<Item = (TrieKey, TrieOp)>) {
        self.operations.extend(updates);
    }

    /// Adds account-trie branch updates.
    pub fn extend_with_account_updates(
        &mut self,
        updates: HashMap<Nibbles, BranchNodeCompact>,
    ) {
        self.extend(
            updates
                .into_iter()
                .map(|(nibbles, node)| (TrieKey::AccountNode(nibbles), TrieOp::Update(node))),
        );
    }

    /// Adds storage-trie branch updates for one account.
    pub fn extend_with_storage_updates(
        &mut self,
        hashed_address: B256,
        updates: HashMap<Nibbles, BranchNodeCompact>,
    ) {
        self.extend(updates.into_iter().map(|(nibbles, node)| {
            (TrieKey::StorageNode(hashed_address, nibbles), TrieOp::Update(node))
        }));
    }

    /// Schedules the wipe of an account's entire stored storage trie.
    pub fn schedule_storage_wipe(&mut self, hashed_address: B256) {
        self.operations.insert(TrieKey::StorageTrie(hashed_address), TrieOp::Delete);
    }

    /// Writes all aggregated operations into the stored-node tables.
    pub fn flush(self, tx: &mut impl DbTxMut) -> Result<(), DatabaseError> {
        if self.operations.is_empty() {
            return Ok(());
        }

        let mut operations: Vec<_> = self.operations.into_iter().collect();
        operations.sort_unstable_by(|a, b| a.0.cmp(&b.0));

        for (key, operation) in operations {
            match key {
                TrieKey::AccountNode(nibbles) => match operation {
                    TrieOp::Delete => tx.delete::<AccountsTrie>(&nibbles.as_slice().to_vec())?,
                    TrieOp::Update(node) => {
                        // Root nodes are rebuilt on every pass and never
                        // persisted.
                        if !nibbles.is_empty() {
                            tx.put::<AccountsTrie>(nibbles.as_slice().to_vec(), node)?
                        }
                    }
                },
                TrieKey::StorageTrie(hashed_address) => match operation {
                    TrieOp::Delete => tx.delete_range::<StoragesTrie>(
                        (hashed_address, Vec::new())..(next_address(hashed_address), Vec::new()),
                    )?,
                    TrieOp::Update(..) => unreachable!("cannot update a whole storage trie"),
                },
                TrieKey::StorageNode(hashed_address, nibbles) => match operation {
                    TrieOp::Delete => tx
                        .delete::<StoragesTrie>(&(hashed_address, nibbles.as_slice().to_vec()))?,
                    TrieOp::Update(node) => {
                        if !nibbles.is_empty() {
                            tx.put::<StoragesTrie>(
                                (hashed_address, nibbles.as_slice().to_vec()),
                                node,
                            )?
                        }
                    }
                },
            }
        }

        Ok(())
    }
}

/// Smallest address strictly greater than `address`, for range bounds.
/// Saturates at the all-ones address, which cannot collide with a real
/// keccak image in practice.
fn next_address(address: B256) -> B256 {
    let mut bytes = address.0;
    for byte in bytes.iter_mut().rev() {
        let (incremented, overflow) = byte.overflowing_add(1);
        *byte = incremented;
        if !overflow {
            break;
        }
    }
    B256::from(bytes)
}

/// Reads a stored account-trie node.
pub fn read_account_node(
    tx: &impl DbTx,
    nibbles: &Nibbles,
) -> Result<Option<BranchNodeCompact>, DatabaseError> {
    tx.get::<AccountsTrie>(&nibbles.as_slice().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use stele_kv::{mem::MemDb, Database};

    #[test]
    fn flush_applies_updates_and_deletes() {
        let db = MemDb::new();
        let mut tx = db.tx_mut().unwrap();

        let node = BranchNodeCompact::new(0b11u16, 0u16, 0u16, vec![], None);
        let mut updates = TrieUpdates::default();
        updates.extend_with_account_updates(HashMap::from([(
            Nibbles::from_nibbles(vec![0x1]),
            node.clone(),
        )]));
        updates.flush(&mut tx).unwrap();

        assert_eq!(
            read_account_node(&tx, &Nibbles::from_nibbles(vec![0x1])).unwrap(),
            Some(node),
        );

        let mut updates = TrieUpdates::default();
        updates.schedule_delete(TrieKey::AccountNode(Nibbles::from_nibbles(vec![0x1])));
        updates.flush(&mut tx).unwrap();
        assert_eq!(read_account_node(&tx, &Nibbles::from_nibbles(vec![0x1])).unwrap(), None);
    }

    #[test]
    fn storage_wipe_clears_only_that_account() {
        let db = MemDb::new();
        let mut tx = db.tx_mut().unwrap();

        let node = BranchNodeCompact::new(0b11u16, 0u16, 0u16, vec![], None);
        let victim = B256::repeat_byte(0x11);
        let survivor = B256::repeat_byte(0x22);
        for address in [victim, survivor] {
            tx.put::<StoragesTrie>((address, vec![0x1]), node.clone()).unwrap();
        }

        let mut updates = TrieUpdates::default();
        updates.schedule_storage_wipe(victim);
        updates.flush(&mut tx).unwrap();

        assert_eq!(tx.get::<StoragesTrie>(&(victim, vec![0x1])).unwrap(), None);
        assert!(tx.get::<StoragesTrie>(&(survivor, vec![0x1])).unwrap().is_some());
    }

    #[test]
    #[should_panic(expected = "already updated")]
    fn delete_after_update_panics() {
        let mut updates = TrieUpdates::default();
        let key = TrieKey::AccountNode(Nibbles::from_nibbles(vec![0x1]));
        updates.extend([(
            key.clone(),
            TrieOp::Update(BranchNodeCompact::new(0b1u16, 0u16, 0u16, vec![], None)),
        )]);
        updates.schedule_delete(key);
    }
}
