//! Merkle-Patricia-Trie commitment over the hashed state.
//!
//! The crate is split the way the data flows:
//!
//! - [`hash_builder`]: a stack machine consuming structural operations
//!   (`leaf`, `extension`, `branch`, `hash`, …) and producing node hashes
//!   bottom-up.
//! - [`structure`]: derives those operations from a strictly sorted key
//!   stream, retaining stored-branch-node updates for future incremental
//!   walks.
//! - [`walker`] and the cursors: traverse the previously stored trie,
//!   skipping unchanged subtrees so that recomputation cost is proportional
//!   to the change-set size.
//! - [`root`]: the [`StateRoot`]/[`StorageRoot`] jobs tying it together.

pub mod hash_builder;
pub mod hashed_cursor;
mod mask;
mod nibbles;
pub mod prefix_set;
pub mod proofs;
mod root;
mod structure;
pub mod trie_cursor;
pub mod updates;
pub mod walker;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use hash_builder::HashBuilder;
pub use mask::{BranchNodeCompact, TrieKey, TrieMask};
pub use nibbles::Nibbles;
pub use prefix_set::{PrefixSet, PrefixSetMut, TriePrefixSets};
pub use root::{load_prefix_sets, StateRoot, StateRootError, StorageRoot, StorageRootError};
pub use structure::TrieBuilder;
pub use updates::{AccountsTrie, StoragesTrie, TrieOp, TrieUpdates};
