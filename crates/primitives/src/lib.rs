//! Core value types shared by every stele crate: accounts, headers, blocks,
//! transactions, receipts, logs and the log bloom filter.
//!
//! These are deliberately protocol-reduced: consensus rule sets, gas
//! schedules and signature recovery live behind external capabilities, so
//! the types here only carry what the execution, trie and forkchoice
//! machinery actually consumes.

mod account;
mod bloom;
mod constants;
mod header;
mod log;
mod receipt;
mod transaction;

pub use account::{Account, TrieAccount};
pub use bloom::{logs_bloom, Bloom, BLOOM_SIZE_BYTES};
pub use constants::{EMPTY_ROOT, FIRST_INCARNATION, KECCAK_EMPTY};
pub use header::{Block, BlockBody, Header, SealedBlock, SealedHeader, Withdrawal};
pub use log::Log;
pub use receipt::{Receipt, ReceiptDecodeError, RECEIPT_STORAGE_V1};
pub use transaction::{create2_address, create_address, Transaction, TxKind};

pub use alloy_primitives::{keccak256, Address, Bytes, B256, U256};

/// A block number.
pub type BlockNumber = u64;
/// A block hash.
pub type BlockHash = B256;
/// A monotonic transaction sequence number within the chain.
pub type TxNumber = u64;
