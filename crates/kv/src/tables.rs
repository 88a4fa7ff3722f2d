//! Chain and state table declarations.
//!
//! Trie node tables live in `stele-trie` next to the types they store.

use alloy_primitives::{Address, B256, U256};
use stele_primitives::{Account, BlockBody, BlockHash, BlockNumber, Header};

/// Pre-image of an account before a block's execution. `None` means the
/// account did not exist.
pub type AccountBefore = Option<Account>;

/// Pre-image of a storage slot before a block's execution: the incarnation
/// it was written under and its prior value (zero if unset).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StorageBefore {
    /// Incarnation the slot belongs to.
    pub incarnation: u64,
    /// Value before the block.
    pub value: U256,
}

crate::tables! {
    /// Block number to canonical block hash.
    table CanonicalHeaders<Key = BlockNumber, Value = BlockHash>;

    /// Block hash to header.
    table Headers<Key = BlockHash, Value = Header>;

    /// Block hash to block number.
    table HeaderNumbers<Key = BlockHash, Value = BlockNumber>;

    /// Block hash to body, for canonical and candidate blocks alike.
    table BlockBodies<Key = BlockHash, Value = BlockBody>;

    /// Current state of all accounts.
    table PlainAccounts<Key = Address, Value = Account>;

    /// Current contract storage, keyed by owner, incarnation and slot.
    table PlainStorage<Key = (Address, u64, B256), Value = U256>;

    /// Contract bytecode by code hash.
    table Bytecodes<Key = B256, Value = Vec<u8>>;

    /// Keccak-keyed account state consumed by the trie.
    table HashedAccounts<Key = B256, Value = Account>;

    /// Keccak-keyed contract storage consumed by the trie, keyed by hashed
    /// owner address and hashed slot.
    table HashedStorage<Key = (B256, B256), Value = U256>;

    /// Account pre-images per block, first touch wins within a block.
    table AccountChangeSets<Key = (BlockNumber, Address), Value = AccountBefore>;

    /// Storage pre-images per block.
    table StorageChangeSets<Key = (BlockNumber, Address, B256), Value = StorageBefore>;

    /// Storage-encoded receipts by block number and transaction index.
    table Receipts<Key = (BlockNumber, u64), Value = Vec<u8>>;

    /// Last incarnation of self-destructed contracts, consulted when an
    /// address is re-created so stale storage stays unreachable.
    table IncarnationMap<Key = Address, Value = u64>;

    /// Progress of each pipeline stage.
    table StageCheckpoints<Key = &'static str, Value = BlockNumber>;
}
