//! Depth-first traversal of a stored trie that skips subtrees which are
//! unchanged and carry a recorded hash.

use crate::{
    nibbles::Nibbles,
    prefix_set::PrefixSet,
    trie_cursor::{CursorSubNode, TrieCursor},
    updates::TrieUpdates,
};
use alloy_primitives::B256;
use stele_kv::DatabaseError;

/// Walks the stored branch nodes of one trie in depth-first order.
///
/// A position can be skipped (`can_skip_current_node`) when its prefix is
/// not in the change [`PrefixSet`] and a hash is recorded for it; the caller
/// then feeds that hash to the structure builder instead of re-expanding the
/// subtree. This is what makes root recomputation proportional to the
/// change-set size rather than the state size.
#[derive(Debug)]
pub struct TrieWalker<'a, C> {
    /// Cursor over the stored nodes.
    pub cursor: &'a mut C,
    /// Traversal stack.
    pub stack: Vec<CursorSubNode>,
    /// Whether the current node can be skipped.
    pub can_skip_current_node: bool,
    /// Prefixes touched by the change set.
    pub changes: PrefixSet,
    trie_updates: Option<TrieUpdates>,
}

impl<'a, C: TrieCursor> TrieWalker<'a, C> {
    /// Creates a walker positioned on the trie root.
    pub fn new(cursor: &'a mut C, changes: PrefixSet) -> Result<Self, DatabaseError> {
        let mut this = Self {
            cursor,
            changes,
            stack: vec![CursorSubNode::default()],
            can_skip_current_node: false,
            trie_updates: None,
        };

        // Position the root node on the stack, if one is stored.
        if let Some((key, node)) = this.node(true)? {
            this.stack[0] = CursorSubNode::new(key, Some(node));
        }
        this.update_skip_node();
        Ok(this)
    }

    /// Enables collection of delete operations for consumed nodes.
    pub fn with_updates(mut self, retain_updates: bool) -> Self {
        if retain_updates {
            self.trie_updates = Some(TrieUpdates::default());
        }
        self
    }

    /// Takes the scheduled deletes.
    pub fn take_updates(&mut self) -> TrieUpdates {
        self.trie_updates.take().unwrap_or_default()
    }

    /// The key of the current position, `None` once the walk is done.
    pub fn key(&self) -> Option<Nibbles> {
        self.stack.last().map(|node| node.full_key())
    }

    /// The recorded hash at the current position, if any.
    pub fn hash(&self) -> Option<B256> {
        self.stack.last().and_then(|node| node.hash())
    }

    /// Whether the current position's children live in the stored trie.
    pub fn children_are_in_trie(&self) -> bool {
        self.stack.last().is_some_and(|node| node.tree_flag())
    }

    /// First hashed-state key not yet covered by the walk: the packed
    /// current key, or the next sibling path when the current node is being
    /// skipped. `None` once the walk is exhausted.
    pub fn next_unprocessed_key(&self) -> Option<B256> {
        let key = self.key()?;
        let packed = if self.can_skip_current_node {
            key.increment()?.pack()
        } else {
            key.pack()
        };
        let mut padded = [0u8; 32];
        padded[..packed.len()].copy_from_slice(&packed);
        Some(B256::from(padded))
    }

    /// Advances to the next position in depth-first order.
    pub fn advance(&mut self) -> Result<Option<Nibbles>, DatabaseError> {
        if let Some(last) = self.stack.last() {
            if !self.can_skip_current_node && self.children_are_in_trie() {
                // Descend into the stored subtree, or start the node's
                // children if we are positioned on the node itself.
                match last.nibble {
                    -1 => self.move_to_next_sibling(true)?,
                    _ => self.consume_node()?,
                }
            } else {
                self.move_to_next_sibling(false)?;
            }
            self.update_skip_node();
        }
        Ok(self.key())
    }

    fn node(
        &mut self,
        exact: bool,
    ) -> Result<Option<(Nibbles, crate::mask::BranchNodeCompact)>, DatabaseError> {
        let key = self.key().expect("key must exist");
        let entry =
            if exact { self.cursor.seek_exact(&key)? } else { self.cursor.seek(&key)? };

        if let Some((_, node)) = &entry {
            assert!(!node.state_mask.is_empty(), "stored branch node with empty state mask");
        }
        Ok(entry)
    }

    fn consume_node(&mut self) -> Result<(), DatabaseError> {
        let Some((key, node)) = self.node(false)? else {
            // No more stored nodes: the walk is complete.
            self.stack.clear();
            return Ok(());
        };

        // Keep the synthesized root level in sync with the node we jumped
        // to, so full keys compose correctly.
        if !key.is_empty() && !self.stack.is_empty() {
            self.stack[0].nibble = key[0] as i8;
        }

        let subnode = CursorSubNode::new(key, Some(node));
        let nibble = subnode.nibble;
        self.stack.push(subnode);
        self.update_skip_node();

        // A consumed node is stale unless the walk proves it can be kept.
        if !self.can_skip_current_node || nibble != -1 {
            if let Some((updates, key)) =
                self.trie_updates.as_mut().zip(self.cursor.current())
            {
                updates.schedule_delete(key);
            }
        }
        Ok(())
    }

    fn move_to_next_sibling(
        &mut self,
        allow_root_to_child_nibble: bool,
    ) -> Result<(), DatabaseError> {
        let Some(subnode) = self.stack.last_mut() else {
            return Ok(());
        };

        // Backtrack when the node's children are exhausted.
        if subnode.nibble >= 15 || (subnode.nibble < 0 && !allow_root_to_child_nibble) {
            self.stack.pop();
            self.move_to_next_sibling(false)?;
            return Ok(());
        }

        subnode.nibble += 1;

        if subnode.node.is_none() {
            return self.consume_node();
        }

        // Find the next child with state.
        while subnode.nibble < 16 {
            if subnode.state_flag() {
                return Ok(());
            }
            subnode.nibble += 1;
        }

        self.stack.pop();
        self.move_to_next_sibling(false)?;
        Ok(())
    }

    fn update_skip_node(&mut self) {
        self.can_skip_current_node = if let Some(key) = self.key() {
            let contains_prefix = self.changes.contains(&key);
            let hash_flag = self.stack.last().expect("not empty").hash_flag();
            !contains_prefix && hash_flag
        } else {
            false
        };
    }
}
