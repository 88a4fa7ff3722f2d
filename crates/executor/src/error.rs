use crate::evm::EvmError;
use alloy_primitives::{Address, B256};
use stele_kv::DatabaseError;

/// The block violates protocol rules; its execution attempt is rejected as
/// a whole and the chain segment it belongs to is invalid.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BlockValidationError {
    /// A transaction's nonce does not match its sender's.
    #[error("nonce mismatch for sender {address}: expected {expected}, got {got}")]
    NonceMismatch {
        /// Sender address.
        address: Address,
        /// Account nonce.
        expected: u64,
        /// Transaction nonce.
        got: u64,
    },
    /// The sender cannot cover the transferred value.
    #[error("insufficient funds for sender {address}")]
    InsufficientFunds {
        /// Sender address.
        address: Address,
    },
    /// The block's gas pool cannot cover a transaction's gas limit.
    #[error("transaction gas limit {requested} exceeds remaining block gas {available}")]
    GasPoolExceeded {
        /// Gas requested by the transaction.
        requested: u64,
        /// Gas left in the block.
        available: u64,
    },
    /// Total gas used does not match the header.
    #[error("block gas used mismatch: header {header}, executed {executed}")]
    GasUsedMismatch {
        /// Gas used declared in the header.
        header: u64,
        /// Gas used observed during execution.
        executed: u64,
    },
    /// The recomputed state root does not match the header.
    #[error("state root mismatch: header {header}, computed {computed}")]
    StateRootMismatch {
        /// Root declared in the header.
        header: B256,
        /// Root computed from execution.
        computed: B256,
    },
    /// The recomputed receipts root does not match the header.
    #[error("receipts root mismatch: header {header}, computed {computed}")]
    ReceiptsRootMismatch {
        /// Root declared in the header.
        header: B256,
        /// Root computed from receipts.
        computed: B256,
    },
    /// Block numbers are not consecutive.
    #[error("block {number} does not follow parent {parent}")]
    NonSequentialBlock {
        /// Parent number.
        parent: u64,
        /// Child number.
        number: u64,
    },
    /// Parent hash does not match the parent header.
    #[error("parent hash mismatch: expected {expected}, got {got}")]
    ParentHashMismatch {
        /// Hash of the known parent.
        expected: B256,
        /// Parent hash declared by the child.
        got: B256,
    },
    /// Timestamp is not strictly increasing.
    #[error("timestamp is not after the parent's")]
    TimestampNotIncreasing,
}

/// Execution of a block failed.
#[derive(Debug, thiserror::Error)]
pub enum BlockExecutionError {
    /// The block is consensus-invalid; fatal for the block, recoverable for
    /// the node (unwind and reject).
    #[error(transparent)]
    Validation(#[from] BlockValidationError),
    /// The EVM capability failed.
    #[error(transparent)]
    Evm(#[from] EvmError),
    /// The state store failed.
    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl BlockExecutionError {
    /// Whether this error marks the block itself as invalid, as opposed to
    /// an environmental failure.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}
