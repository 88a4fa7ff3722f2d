//! Stack machine that folds an ordered stream of structural trie operations
//! into the root hash.
//!
//! The builder never learns *why* a key changed; it only consumes the
//! structure: `leaf`, `account_leaf`, `extension`, `branch`, `hash` and
//! `empty_root` operations in bottom-up order. Unchanged subtrees enter the
//! stream as a single precomputed `hash`, which is what makes incremental
//! root recomputation proportional to the change-set size.

use crate::{mask::TrieMask, nibbles::Nibbles};
use alloy_primitives::{keccak256, B256, U256};
use alloy_rlp::Header;
use stele_primitives::{TrieAccount, EMPTY_ROOT, KECCAK_EMPTY};

/// Width of one hash-stack slot: 1 RLP prefix byte plus up to 32 bytes of
/// hash, or the raw node RLP when its encoding is shorter than 32 bytes.
pub const HASH_STACK_STRIDE: usize = 33;

/// RLP prefix byte of a 32-byte string.
const HASH_PREFIX: u8 = 0x80 + 32;

/// Account fields whose values are popped off the hash stack by
/// [`HashBuilder::account_leaf`].
pub mod field {
    /// Storage root is on the stack (top).
    pub const STORAGE: u32 = 4;
    /// Code hash is on the stack (below the storage root when both are set).
    pub const CODE: u32 = 8;
}

/// Structural mirror of a hash-stack entry, kept for debugging and proof
/// reconstruction. `None` marks a subtree known only by hash.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Node {
    /// A value leaf.
    Leaf {
        /// Key suffix below the enclosing branch.
        key: Nibbles,
    },
    /// An extension over a shared key fragment.
    Extension {
        /// The shared fragment.
        key: Nibbles,
    },
    /// A 16-ary branch.
    Branch {
        /// Children present.
        state_mask: TrieMask,
    },
}

/// The stack machine. See module docs.
#[derive(Debug, Default)]
pub struct HashBuilder {
    /// 33-byte strides, see [`HASH_STACK_STRIDE`].
    hash_stack: Vec<u8>,
    /// Structural mirror, always exactly one entry per hash-stack stride.
    node_stack: Vec<Option<Node>>,
    /// Scratch buffer for node RLP.
    rlp_buf: Vec<u8>,
}

impl HashBuilder {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the builder suitable for reuse.
    pub fn reset(&mut self) {
        self.hash_stack.clear();
        self.node_stack.clear();
    }

    /// Current stack depth.
    pub fn depth(&self) -> usize {
        self.node_stack.len()
    }

    /// A value leaf: RLP of `(compact key, value)`, where `value` is wrapped
    /// as an RLP string (it is usually itself RLP).
    pub fn leaf(&mut self, key: &Nibbles, value: &[u8]) {
        tracing::trace!(target: "trie::hash_builder", ?key, value_len = value.len(), "LEAF");
        let compact = key.encode_compact(true);
        self.rlp_buf.clear();
        encode_short_node(&compact, value, &mut self.rlp_buf);
        let rlp = std::mem::take(&mut self.rlp_buf);
        self.push_node_rlp(&rlp);
        self.rlp_buf = rlp;
        self.node_stack.push(Some(Node::Leaf { key: key.clone() }));
    }

    /// An account leaf. The storage root and code hash are popped off the
    /// hash stack according to `field_set` ([`field::STORAGE`] on top,
    /// [`field::CODE`] below it); absent fields default to the empty-trie
    /// root and the empty code hash.
    pub fn account_leaf(
        &mut self,
        key: &Nibbles,
        nonce: u64,
        balance: U256,
        incarnation: u64,
        field_set: u32,
    ) {
        tracing::trace!(target: "trie::hash_builder", ?key, field_set, incarnation, "ACCOUNTLEAF");
        let mut popped = 0usize;
        let mut storage_root = EMPTY_ROOT;
        if field_set & field::STORAGE != 0 {
            storage_root = self.stack_hash_at(popped);
            popped += 1;
        }
        let mut code_hash = KECCAK_EMPTY;
        if field_set & field::CODE != 0 {
            code_hash = self.stack_hash_at(popped);
            popped += 1;
        }
        self.pop(popped);

        // Incarnation is tracked by the state layer only; the trie encoding
        // is the canonical four-field account.
        let _ = incarnation;
        let account = TrieAccount { nonce, balance, storage_root, code_hash };
        let value = alloy_rlp::encode(account);

        let compact = key.encode_compact(true);
        self.rlp_buf.clear();
        encode_short_node(&compact, &value, &mut self.rlp_buf);
        let rlp = std::mem::take(&mut self.rlp_buf);
        self.push_node_rlp(&rlp);
        self.rlp_buf = rlp;
        self.node_stack.push(Some(Node::Leaf { key: key.clone() }));
    }

    /// An extension node over the single entry on top of the stack.
    pub fn extension(&mut self, key: &Nibbles) {
        tracing::trace!(target: "trie::hash_builder", ?key, "EXTENSION");
        assert!(!self.node_stack.is_empty(), "extension with empty stack");
        let child_start = self.hash_stack.len() - HASH_STACK_STRIDE;
        let child_len = slot_len(&self.hash_stack[child_start..]);
        let child = self.hash_stack[child_start..child_start + child_len].to_vec();

        let compact = key.encode_compact(false);
        self.rlp_buf.clear();
        let payload_length = string_length(&compact) + child.len();
        Header { list: true, payload_length }.encode(&mut self.rlp_buf);
        encode_string(&compact, &mut self.rlp_buf);
        // A hashed child is already a valid RLP string, an embedded child is
        // inlined as a raw list.
        self.rlp_buf.extend_from_slice(&child);

        let rlp = std::mem::take(&mut self.rlp_buf);
        self.pop(1);
        self.push_node_rlp(&rlp);
        self.rlp_buf = rlp;
        self.node_stack.push(Some(Node::Extension { key: key.clone() }));
    }

    /// A branch node. Pops exactly `state_mask.count_ones()` entries, pushes
    /// one. Returns, per set bit in nibble order, the child's hash, or
    /// `None` when the child was embedded.
    pub fn branch(&mut self, state_mask: TrieMask) -> Vec<Option<B256>> {
        tracing::trace!(target: "trie::hash_builder", ?state_mask, "BRANCH");
        let digits = state_mask.count_ones() as usize;
        assert!(
            self.node_stack.len() >= digits,
            "trie construction bug: branch needs {digits} children, stack has {}",
            self.node_stack.len(),
        );
        let child_start = self.hash_stack.len() - digits * HASH_STACK_STRIDE;

        let mut children = Vec::with_capacity(digits);
        let mut payload_length = 17 - digits; // empty children and the value slot
        for i in 0..digits {
            let slot = &self.hash_stack[child_start + i * HASH_STACK_STRIDE..];
            payload_length += slot_len(slot);
            children.push((slot[0] == HASH_PREFIX).then(|| B256::from_slice(&slot[1..33])));
        }

        self.rlp_buf.clear();
        Header { list: true, payload_length }.encode(&mut self.rlp_buf);
        let mut child = 0usize;
        for digit in 0..16u8 {
            if state_mask.is_bit_set(digit) {
                let slot = &self.hash_stack[child_start + child * HASH_STACK_STRIDE..];
                let len = slot_len(slot);
                let slot = slot[..len].to_vec();
                self.rlp_buf.extend_from_slice(&slot);
                child += 1;
            } else {
                self.rlp_buf.push(alloy_rlp::EMPTY_STRING_CODE);
            }
        }
        // Branch nodes in the account and storage tries never carry a value.
        self.rlp_buf.push(alloy_rlp::EMPTY_STRING_CODE);

        let rlp = std::mem::take(&mut self.rlp_buf);
        self.pop(digits);
        self.push_node_rlp(&rlp);
        self.rlp_buf = rlp;
        self.node_stack.push(Some(Node::Branch { state_mask }));
        children
    }

    /// A subtree known only by its precomputed hash.
    pub fn hash(&mut self, hash: B256) {
        tracing::trace!(target: "trie::hash_builder", ?hash, "HASH");
        self.push_hash_slot(hash);
        self.node_stack.push(None);
    }

    /// The empty trie.
    pub fn empty_root(&mut self) {
        tracing::trace!(target: "trie::hash_builder", "EMPTYROOT");
        self.push_hash_slot(EMPTY_ROOT);
        self.node_stack.push(None);
    }

    /// Finishes the stream and returns the root hash.
    ///
    /// # Panics
    ///
    /// If the stack depth is not exactly one: that is a trie construction
    /// bug, and continuing would persist a corrupt state root.
    pub fn root(&self) -> B256 {
        if self.node_stack.is_empty() {
            return EMPTY_ROOT;
        }
        assert_eq!(
            self.node_stack.len(),
            1,
            "trie construction bug: stack depth {} after full operation stream",
            self.node_stack.len(),
        );
        let slot = &self.hash_stack[..];
        if slot[0] == HASH_PREFIX {
            B256::from_slice(&slot[1..33])
        } else {
            // An embedded top-level node is still hashed to form the root.
            keccak256(&slot[..slot_len(slot)])
        }
    }

    fn stack_hash_at(&self, popped: usize) -> B256 {
        let end = self.hash_stack.len() - popped * HASH_STACK_STRIDE;
        let slot = &self.hash_stack[end - HASH_STACK_STRIDE..end];
        assert_eq!(slot[0], HASH_PREFIX, "expected a hash on the stack, found an embedded node");
        B256::from_slice(&slot[1..33])
    }

    fn pop(&mut self, count: usize) {
        assert!(self.node_stack.len() >= count, "trie construction bug: stack underflow");
        self.hash_stack.truncate(self.hash_stack.len() - count * HASH_STACK_STRIDE);
        self.node_stack.truncate(self.node_stack.len() - count);
    }

    /// Pushes a node encoding: hashed when 32 bytes or longer, embedded
    /// verbatim otherwise. Sub-32-byte embedding is mandated by the trie's
    /// canonical encoding, the enclosing node must inline these rather than
    /// hash them.
    fn push_node_rlp(&mut self, rlp: &[u8]) {
        let mut slot = [0u8; HASH_STACK_STRIDE];
        if rlp.len() < 32 {
            slot[..rlp.len()].copy_from_slice(rlp);
        } else {
            slot[0] = HASH_PREFIX;
            slot[1..].copy_from_slice(keccak256(rlp).as_slice());
        }
        self.hash_stack.extend_from_slice(&slot);
    }

    fn push_hash_slot(&mut self, hash: B256) {
        let mut slot = [0u8; HASH_STACK_STRIDE];
        slot[0] = HASH_PREFIX;
        slot[1..].copy_from_slice(hash.as_slice());
        self.hash_stack.extend_from_slice(&slot);
    }
}

/// Number of meaningful bytes in a hash-stack slot.
fn slot_len(slot: &[u8]) -> usize {
    if slot[0] == HASH_PREFIX {
        HASH_STACK_STRIDE
    } else {
        // Embedded node: a short RLP list, length recovered from the prefix.
        debug_assert!((0xc0..0xf8).contains(&slot[0]), "malformed stack slot");
        (slot[0] - 0xc0) as usize + 1
    }
}

/// RLP length of `bytes` encoded as a string.
fn string_length(bytes: &[u8]) -> usize {
    if bytes.len() == 1 && bytes[0] < 0x80 {
        1
    } else {
        Header { list: false, payload_length: bytes.len() }.length() + bytes.len()
    }
}

/// Encodes `bytes` as an RLP string.
fn encode_string(bytes: &[u8], out: &mut Vec<u8>) {
    if bytes.len() == 1 && bytes[0] < 0x80 {
        out.push(bytes[0]);
    } else {
        Header { list: false, payload_length: bytes.len() }.encode(out);
        out.extend_from_slice(bytes);
    }
}

/// Encodes a leaf or extension payload: `rlp([compact_key, value])`.
fn encode_short_node(compact: &[u8], value: &[u8], out: &mut Vec<u8>) {
    let payload_length = string_length(compact) + string_length(value);
    Header { list: true, payload_length }.encode(out);
    encode_string(compact, out);
    encode_string(value, out);
}
