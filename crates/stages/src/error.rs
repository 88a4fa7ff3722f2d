use stele_executor::{BlockExecutionError, BlockValidationError, EvmError};
use stele_kv::DatabaseError;
use stele_primitives::{BlockHash, BlockNumber};
use stele_trie::StateRootError;

/// Data expected to be present in the database was not.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DatabaseIntegrityError {
    /// No canonical hash for a block number.
    #[error("no canonical hash for block #{number}")]
    CanonicalHash {
        /// The missing block number.
        number: BlockNumber,
    },
    /// No header for a block hash.
    #[error("no header for block {hash}")]
    Header {
        /// The missing block hash.
        hash: BlockHash,
    },
    /// No body for a block hash.
    #[error("no body for block {hash}")]
    BlockBody {
        /// The missing block hash.
        hash: BlockHash,
    },
}

/// A stage failed.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    /// A block violated consensus rules; the containing chain segment is
    /// invalid and must be unwound and rejected.
    #[error("stage encountered invalid block #{block}: {error}")]
    Validation {
        /// The offending block.
        block: BlockNumber,
        /// What was violated.
        error: BlockValidationError,
    },
    /// Required data is missing; recoverable once the sync layer fetches it.
    #[error(transparent)]
    Integrity(#[from] DatabaseIntegrityError),
    /// The storage layer failed.
    #[error(transparent)]
    Database(#[from] DatabaseError),
    /// The EVM capability failed outside consensus rules.
    #[error(transparent)]
    Evm(#[from] EvmError),
}

impl StageError {
    /// Whether the error marks a block as consensus-invalid.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation { .. })
    }
}

impl From<StateRootError> for StageError {
    fn from(error: StateRootError) -> Self {
        match error {
            StateRootError::Database(error) => Self::Database(error),
        }
    }
}

/// Maps a block execution failure onto the stage error taxonomy.
pub(crate) fn map_execution_error(block: BlockNumber, error: BlockExecutionError) -> StageError {
    match error {
        BlockExecutionError::Validation(error) => StageError::Validation { block, error },
        BlockExecutionError::Database(error) => StageError::Database(error),
        BlockExecutionError::Evm(error) => StageError::Evm(error),
    }
}
