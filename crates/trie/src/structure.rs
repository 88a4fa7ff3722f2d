//! Derives trie structure from a sorted key stream.
//!
//! [`TrieBuilder`] accepts leaves, account leaves and precomputed subtree
//! hashes in strictly increasing key order, derives the shared-prefix
//! grouping, and emits the corresponding operation stream into the
//! [`HashBuilder`] stack machine. When update retention is enabled it also
//! collects the [`BranchNodeCompact`] records that let the next incremental
//! pass skip unchanged subtrees.

use crate::{
    hash_builder::{field, HashBuilder},
    mask::{BranchNodeCompact, TrieMask},
    nibbles::Nibbles,
};
use alloy_primitives::B256;
use std::collections::HashMap;
use stele_primitives::{TrieAccount, EMPTY_ROOT, KECCAK_EMPTY};

/// The value waiting to be emitted once the next key reveals where the
/// current key's node closes.
#[derive(Clone, Debug)]
enum PendingValue {
    None,
    /// Raw leaf payload.
    Leaf(Vec<u8>),
    /// An account leaf with its freshly computed storage root.
    Account(TrieAccount, u64),
    /// The hash of a subtree that is not being re-expanded.
    Hash(B256),
}

/// Sorted-stream structure builder, see module docs.
#[derive(Debug)]
pub struct TrieBuilder {
    key: Nibbles,
    value: PendingValue,
    groups: Vec<TrieMask>,
    tree_masks: Vec<TrieMask>,
    hash_masks: Vec<TrieMask>,
    stored_in_database: bool,
    hb: HashBuilder,
    updated_branch_nodes: Option<HashMap<Nibbles, BranchNodeCompact>>,
}

impl Default for TrieBuilder {
    fn default() -> Self {
        Self {
            key: Nibbles::default(),
            value: PendingValue::None,
            groups: Vec::new(),
            tree_masks: Vec::new(),
            hash_masks: Vec::new(),
            stored_in_database: false,
            hb: HashBuilder::new(),
            updated_branch_nodes: None,
        }
    }
}

impl TrieBuilder {
    /// Creates a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables or disables collection of branch-node updates.
    pub fn with_updates(mut self, retain_updates: bool) -> Self {
        self.set_updates(retain_updates);
        self
    }

    /// Enables or disables collection of branch-node updates.
    pub fn set_updates(&mut self, retain_updates: bool) {
        if retain_updates {
            self.updated_branch_nodes = Some(HashMap::new());
        }
    }

    /// Adds a value leaf. Keys must arrive in strictly increasing order.
    pub fn add_leaf(&mut self, key: Nibbles, value: &[u8]) {
        assert!(key > self.key, "leaf keys must be strictly increasing");
        self.add(key, PendingValue::Leaf(value.to_vec()));
    }

    /// Adds an account leaf with its computed storage root.
    pub fn add_account(
        &mut self,
        key: Nibbles,
        account: TrieAccount,
        incarnation: u64,
    ) {
        assert!(key > self.key, "account keys must be strictly increasing");
        self.add(key, PendingValue::Account(account, incarnation));
    }

    /// Adds the precomputed hash of an unchanged subtree rooted at `key`.
    /// `stored_in_database` marks subtrees that have their own stored branch
    /// nodes, which keeps the tree masks accurate for future walks.
    pub fn add_branch(&mut self, key: Nibbles, hash: B256, stored_in_database: bool) {
        assert!(
            key > self.key || (self.key.is_empty() && key.is_empty()),
            "branch keys must be strictly increasing",
        );
        if self.key.is_empty() && !key.is_empty() {
            // No-op: the pending-value flush will push the hash.
        } else if key.is_empty() {
            // The whole trie is a single unchanged subtree.
            self.hb.hash(hash);
        }
        self.stored_in_database = stored_in_database;
        self.add(key, PendingValue::Hash(hash));
    }

    /// Finishes the stream and returns the root hash.
    pub fn root(&mut self) -> B256 {
        if !self.key.is_empty() {
            self.update(&Nibbles::default());
            self.key = Nibbles::default();
            self.value = PendingValue::None;
        }
        if self.hb.depth() == 0 {
            self.hb.empty_root();
        }
        let root = self.hb.root();
        if let Some(nodes) = self.updated_branch_nodes.as_mut() {
            if root == EMPTY_ROOT {
                nodes.clear();
            } else if let Some(node) = nodes.get_mut(&Nibbles::default()) {
                node.root_hash = Some(root);
            }
        }
        root
    }

    /// Number of retained branch-node updates so far.
    pub fn updates_len(&self) -> usize {
        self.updated_branch_nodes.as_ref().map_or(0, |nodes| nodes.len())
    }

    /// Consumes the builder, returning the retained branch-node updates.
    pub fn take_updates(&mut self) -> HashMap<Nibbles, BranchNodeCompact> {
        self.updated_branch_nodes.take().unwrap_or_default()
    }

    fn add(&mut self, key: Nibbles, value: PendingValue) {
        if !self.key.is_empty() {
            self.update(&key);
        }
        self.key = key;
        self.value = value;
    }

    /// Closes every node between the current key and `succeeding`, emitting
    /// operations bottom-up. `succeeding` is empty on the final flush.
    fn update(&mut self, succeeding: &Nibbles) {
        let mut build_extensions = false;
        let mut current = self.key.clone();
        debug_assert!(!current.is_empty());
        let value = std::mem::replace(&mut self.value, PendingValue::None);

        loop {
            let preceding_exists = !self.groups.is_empty();
            let preceding_len = self.groups.len().saturating_sub(1);

            let common_prefix_len = succeeding.common_prefix_length(&current);
            let len = preceding_len.max(common_prefix_len);
            assert!(len < current.len(), "structure builder: group deeper than key");

            let extra_digit = current[len];
            if self.groups.len() <= len {
                self.groups.resize(len + 1, TrieMask::default());
            }
            self.groups[len] |= TrieMask::from_nibble(extra_digit);

            if self.tree_masks.len() < current.len() {
                self.resize_masks(current.len());
            }

            let mut len_from = len;
            if !succeeding.is_empty() || preceding_exists {
                len_from += 1;
            }

            let short_node_key = current.offset(len_from);

            if !build_extensions {
                match &value {
                    PendingValue::Leaf(bytes) => self.hb.leaf(&short_node_key, bytes),
                    PendingValue::Account(account, incarnation) => {
                        // Hashes are pushed code-first so the account leaf
                        // pops the storage root off the top.
                        let mut field_set = 0;
                        if account.code_hash != KECCAK_EMPTY {
                            self.hb.hash(account.code_hash);
                            field_set |= field::CODE;
                        }
                        if account.storage_root != EMPTY_ROOT {
                            self.hb.hash(account.storage_root);
                            field_set |= field::STORAGE;
                        }
                        self.hb.account_leaf(
                            &short_node_key,
                            account.nonce,
                            account.balance,
                            *incarnation,
                            field_set,
                        );
                    }
                    PendingValue::Hash(hash) => {
                        self.hb.hash(*hash);
                        let last = current.last().expect("current is non-empty");
                        if self.stored_in_database {
                            self.tree_masks[current.len() - 1] |= TrieMask::from_nibble(last);
                        }
                        self.hash_masks[current.len() - 1] |= TrieMask::from_nibble(last);
                        build_extensions = true;
                    }
                    PendingValue::None => unreachable!("update without a pending value"),
                }
            }

            if build_extensions && !short_node_key.is_empty() {
                self.update_masks(&current, len_from);
                self.hb.extension(&short_node_key);
                self.resize_masks(len_from);
            }

            if preceding_len <= common_prefix_len && !succeeding.is_empty() {
                return;
            }

            if !succeeding.is_empty() || preceding_exists {
                let children = self.hb.branch(self.groups[len]);
                self.store_branch_node(&current, len, &children);
            }

            self.groups.resize(len, TrieMask::default());
            self.resize_masks(len);

            if preceding_len == 0 {
                return;
            }

            current.truncate(preceding_len);
            while let Some(last) = self.groups.last() {
                if last.is_empty() {
                    self.groups.pop();
                } else {
                    break;
                }
            }

            build_extensions = true;
        }
    }

    /// An extension node wraps the child at `len_from - 1`: the child's own
    /// hash flag moves out of the parent and its stored-subtree flag is
    /// propagated.
    fn update_masks(&mut self, current: &Nibbles, len_from: usize) {
        if len_from > 0 {
            let flag = TrieMask::from_nibble(current[len_from - 1]);
            self.hash_masks[len_from - 1] &= !flag;
            if !self.tree_masks[current.len() - 1].is_empty() {
                self.tree_masks[len_from - 1] |= flag;
            }
        }
    }

    /// Records the just-closed branch at depth `len` and propagates its
    /// flags into the parent level.
    fn store_branch_node(&mut self, current: &Nibbles, len: usize, children: &[Option<B256>]) {
        if len > 0 {
            self.hash_masks[len - 1] |= TrieMask::from_nibble(current[len - 1]);
        }

        let store_in_db_trie =
            !self.tree_masks[len].is_empty() || !self.hash_masks[len].is_empty();
        if store_in_db_trie {
            if len > 0 {
                self.tree_masks[len - 1] |= TrieMask::from_nibble(current[len - 1]);
            }

            if self.updated_branch_nodes.is_some() {
                // Only children that were actually committed as hashes can
                // be recorded; embedded children are re-derived on walk.
                let mut hash_mask = TrieMask::default();
                let mut hashes = Vec::new();
                let mut child = 0usize;
                for digit in 0..16u8 {
                    if self.groups[len].is_bit_set(digit) {
                        if self.hash_masks[len].is_bit_set(digit) {
                            if let Some(hash) = children[child] {
                                hash_mask |= TrieMask::from_nibble(digit);
                                hashes.push(hash);
                            }
                        }
                        child += 1;
                    }
                }
                let node = BranchNodeCompact::new(
                    self.groups[len],
                    self.tree_masks[len],
                    hash_mask,
                    hashes,
                    None,
                );
                tracing::trace!(target: "trie::structure", key = ?current.slice_to(len), ?node, "storing branch node");
                self.updated_branch_nodes
                    .as_mut()
                    .expect("checked above")
                    .insert(current.slice_to(len), node);
            }
        }
    }

    fn resize_masks(&mut self, new_len: usize) {
        self.tree_masks.resize(new_len, TrieMask::default());
        self.hash_masks.resize(new_len, TrieMask::default());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{trie_root_prehashed, KeccakHasher};
    use alloy_primitives::{keccak256, U256};
    use hex_literal::hex;
    use stele_primitives::Account;

    #[test]
    fn sorted_leaves_match_reference() {
        let data = vec![
            (hex!("646f").to_vec(), hex!("76657262").to_vec()),
            (hex!("676f6f64").to_vec(), hex!("7075707079").to_vec()),
        ];

        let mut builder = TrieBuilder::new();
        for (key, value) in &data {
            builder.add_leaf(Nibbles::unpack(key), value);
        }
        assert_eq!(builder.root(), trie_root_prehashed(data));
    }

    #[test]
    fn empty_builder_yields_empty_root() {
        assert_eq!(TrieBuilder::new().root(), EMPTY_ROOT);
    }

    #[test]
    fn single_branch_hash_is_the_root() {
        let hash = B256::repeat_byte(0x42);
        let mut builder = TrieBuilder::new();
        builder.add_branch(Nibbles::default(), hash, false);
        assert_eq!(builder.root(), hash);
    }

    #[test]
    fn wide_key_set_matches_reference() {
        // 64-nibble keys exercising extensions, deep branches and embedded
        // sibling order.
        let keys = [
            hex!("30af561000000000000000000000000000000000000000000000000000000000"),
            hex!("30af569000000000000000000000000000000000000000000000000000000000"),
            hex!("30af650000000000000000000000000000000000000000000000000000000000"),
            hex!("30af6f0000000000000000000000000000000000000000000000000000000000"),
            hex!("30af8f0000000000000000000000000000000000000000000000000000000000"),
            hex!("3100000000000000000000000000000000000000000000000000000000000000"),
        ];
        let value = alloy_rlp::encode(U256::from(1u64));

        let mut builder = TrieBuilder::new().with_updates(true);
        for key in keys {
            builder.add_leaf(Nibbles::unpack(key), &value);
        }
        let root = builder.root();
        assert_eq!(
            root,
            trie_root_prehashed(keys.iter().map(|k| (k.to_vec(), value.clone()))),
        );

        let updates = builder.take_updates();
        assert_eq!(updates.len(), 2);

        let node = &updates[&Nibbles::from_nibbles(vec![0x3])];
        assert_eq!(*node, BranchNodeCompact::new(0b0011u16, 0b0001u16, 0u16, vec![], None));

        let node = &updates[&Nibbles::from_nibbles(vec![0x3, 0x0, 0xa, 0xf])];
        assert_eq!(node.state_mask, TrieMask::new(0b101100000));
        assert_eq!(node.tree_mask, TrieMask::new(0b000000000));
        assert_eq!(node.hash_mask, TrieMask::new(0b001000000));
        assert_eq!(node.root_hash, None);
        assert_eq!(node.hashes.len(), 1);
    }

    #[test]
    fn account_leaves_match_reference() {
        let accounts = [
            (B256::repeat_byte(0x11), Account { nonce: 1, balance: U256::from(7u64), ..Default::default() }),
            (B256::repeat_byte(0x22), Account { nonce: 0, balance: U256::from(1u64 << 40), ..Default::default() }),
            (keccak256(b"somebody"), Account { nonce: 3, balance: U256::ZERO, ..Default::default() }),
        ];

        let mut builder = TrieBuilder::new();
        let mut sorted = accounts.to_vec();
        sorted.sort_by_key(|(key, _)| *key);
        for (key, account) in &sorted {
            builder.add_account(Nibbles::unpack(key), TrieAccount::from(account), 0);
        }

        let expected = triehash::trie_root::<KeccakHasher, _, _, _>(
            sorted
                .iter()
                .map(|(key, account)| (key.to_vec(), alloy_rlp::encode(TrieAccount::from(account)))),
        );
        assert_eq!(builder.root(), expected);
    }
}
