//! External capabilities consumed by the execution stage: the EVM itself,
//! the gas-unmetered system-call entry point used by consensus hooks, and
//! the consensus engine hook set.
//!
//! The interpreter is deliberately opaque: it receives a message and a view
//! of the state, and returns gas, logs and a list of absolute state
//! changes. Everything protocol-specific (gas schedules, precompiles, fork
//! activations) lives behind these traits.

use alloy_primitives::{Address, Bytes, B256, U256};
use stele_kv::DatabaseError;
use stele_primitives::{Account, Header, Log, SealedBlock, SealedHeader, Transaction};

/// Read-only view of the state given to the EVM.
#[auto_impl::auto_impl(&, &mut)]
pub trait StateReader {
    /// Reads an account; `None` reads as the empty account.
    fn account(&self, address: Address) -> Result<Option<Account>, DatabaseError>;

    /// Reads a storage slot of the account's given incarnation; absent
    /// slots read as zero.
    fn storage(&self, address: Address, incarnation: u64, slot: B256)
        -> Result<U256, DatabaseError>;

    /// Reads contract code by hash.
    fn code(&self, code_hash: B256) -> Result<Option<Vec<u8>>, DatabaseError>;
}

/// Block-level environment passed to every transaction of a block.
#[derive(Clone, Debug, Default)]
pub struct BlockEnv {
    /// Block height.
    pub number: u64,
    /// Block timestamp.
    pub timestamp: u64,
    /// Fee recipient.
    pub beneficiary: Address,
    /// Block gas limit.
    pub gas_limit: u64,
}

impl From<&Header> for BlockEnv {
    fn from(header: &Header) -> Self {
        Self {
            number: header.number,
            timestamp: header.timestamp,
            beneficiary: header.beneficiary,
            gas_limit: header.gas_limit,
        }
    }
}

/// An absolute state mutation produced by transaction execution. Values are
/// post-states, not deltas, so application is idempotent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StateChange {
    /// Sets an account's nonce and balance, creating it if absent. Code,
    /// incarnation and storage root are left untouched.
    Account {
        /// Affected address.
        address: Address,
        /// New nonce.
        nonce: u64,
        /// New balance.
        balance: U256,
    },
    /// Deploys contract code at an address, bumping its incarnation.
    DeployContract {
        /// Deployment address.
        address: Address,
        /// Runtime code.
        code: Vec<u8>,
    },
    /// Writes a storage slot of the account's current incarnation.
    Storage {
        /// Owning account.
        address: Address,
        /// Slot key.
        slot: B256,
        /// New value; zero clears the slot.
        value: U256,
    },
    /// Removes the account and wipes its storage.
    SelfDestruct {
        /// Destroyed address.
        address: Address,
    },
    /// The account was touched without observable change; subject to
    /// empty-account pruning.
    Touch {
        /// Touched address.
        address: Address,
    },
}

impl StateChange {
    /// The address this change touches.
    pub fn address(&self) -> Address {
        match self {
            Self::Account { address, .. } |
            Self::DeployContract { address, .. } |
            Self::Storage { address, .. } |
            Self::SelfDestruct { address } |
            Self::Touch { address } => *address,
        }
    }
}

/// Outcome of executing a single transaction.
#[derive(Clone, Debug, Default)]
pub struct ExecutionResult {
    /// Gas consumed by the transaction.
    pub gas_used: u64,
    /// `false` if execution reverted.
    pub success: bool,
    /// Return data.
    pub output: Bytes,
    /// Emitted logs.
    pub logs: Vec<Log>,
    /// State mutations to apply, in order.
    pub changes: Vec<StateChange>,
}

/// The EVM failed in a way that is not a normal revert.
#[derive(Debug, thiserror::Error)]
pub enum EvmError {
    /// Interpreter-internal failure.
    #[error("evm failure: {0}")]
    Internal(String),
    /// State read failed beneath the interpreter.
    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// The opaque "execute one transaction" capability.
pub trait Evm {
    /// Executes `tx` against `state`, returning gas, logs and state diffs.
    /// Deterministic: no hidden state beyond the arguments.
    fn transact(
        &mut self,
        tx: &Transaction,
        env: &BlockEnv,
        state: &dyn StateReader,
    ) -> Result<ExecutionResult, EvmError>;
}

/// Builds per-worker EVM instances for speculative execution.
pub trait EvmFactory: Send + Sync {
    /// The EVM type produced.
    type Evm: Evm + Send;

    /// Creates a fresh interpreter.
    fn create(&self) -> Self::Evm;
}

/// Gas-unmetered call used by consensus-engine hooks (beacon roots,
/// withdrawal processing and similar).
pub trait SystemCall {
    /// Executes the call, returning output data and state diffs.
    fn call(
        &mut self,
        contract: Address,
        input: &[u8],
        state: &dyn StateReader,
    ) -> Result<(Bytes, Vec<StateChange>), EvmError>;
}

/// System call that rejects every invocation; for configurations with no
/// system contracts.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoSystemCall;

impl SystemCall for NoSystemCall {
    fn call(
        &mut self,
        contract: Address,
        _input: &[u8],
        _state: &dyn StateReader,
    ) -> Result<(Bytes, Vec<StateChange>), EvmError> {
        Err(EvmError::Internal(format!("no system contract configured at {contract}")))
    }
}

/// Mutation surface handed to consensus-engine hooks during block
/// initialization and finalization. Calls are not gas metered.
pub trait BlockHookContext {
    /// Reads an account.
    fn account(&self, address: Address) -> Result<Option<Account>, DatabaseError>;

    /// Adds `amount` to an account's balance, creating the account if
    /// needed.
    fn credit(&mut self, address: Address, amount: U256) -> Result<(), DatabaseError>;

    /// Invokes the system-call capability and applies its state diffs.
    fn sys_call(&mut self, contract: Address, input: &[u8]) -> Result<Bytes, EvmError>;
}

/// The consensus-engine hook set, selected once at node configuration.
pub trait ConsensusEngine: Send + Sync + core::fmt::Debug {
    /// Validates a header against its parent.
    fn validate_header(
        &self,
        header: &SealedHeader,
        parent: &SealedHeader,
    ) -> Result<(), crate::error::BlockValidationError>;

    /// Pre-execution hook, run before the block's first transaction.
    fn initialize(
        &self,
        block: &SealedBlock,
        ctx: &mut dyn BlockHookContext,
    ) -> Result<(), crate::error::BlockExecutionError>;

    /// Post-execution hook: rewards, withdrawals.
    fn finalize(
        &self,
        block: &SealedBlock,
        ctx: &mut dyn BlockHookContext,
    ) -> Result<(), crate::error::BlockExecutionError>;
}

/// Post-merge consensus hooks: header ancestry checks, an optional
/// beacon-roots system call at block start and withdrawal processing at
/// finalization.
#[derive(Clone, Debug, Default)]
pub struct BeaconConsensus {
    /// System contract invoked with the parent hash at block start.
    pub beacon_roots_contract: Option<Address>,
}

impl ConsensusEngine for BeaconConsensus {
    fn validate_header(
        &self,
        header: &SealedHeader,
        parent: &SealedHeader,
    ) -> Result<(), crate::error::BlockValidationError> {
        if header.number != parent.number() + 1 {
            return Err(crate::error::BlockValidationError::NonSequentialBlock {
                parent: parent.number(),
                number: header.number,
            });
        }
        if header.parent_hash != parent.hash {
            return Err(crate::error::BlockValidationError::ParentHashMismatch {
                expected: parent.hash,
                got: header.parent_hash,
            });
        }
        if header.timestamp <= parent.timestamp {
            return Err(crate::error::BlockValidationError::TimestampNotIncreasing);
        }
        Ok(())
    }

    fn initialize(
        &self,
        block: &SealedBlock,
        ctx: &mut dyn BlockHookContext,
    ) -> Result<(), crate::error::BlockExecutionError> {
        if let Some(contract) = self.beacon_roots_contract {
            ctx.sys_call(contract, block.header.parent_hash.as_slice())?;
        }
        Ok(())
    }

    fn finalize(
        &self,
        block: &SealedBlock,
        ctx: &mut dyn BlockHookContext,
    ) -> Result<(), crate::error::BlockExecutionError> {
        for withdrawal in &block.body.withdrawals {
            let amount = U256::from(withdrawal.amount_gwei) * U256::from(1_000_000_000u64);
            ctx.credit(withdrawal.address, amount)?;
        }
        Ok(())
    }
}

/// Decides when a touched account is pruned from state. The exact
/// transition table between "non-existent", "empty" and "has-code" is
/// protocol-specific and supplied by this capability.
pub trait EmptyAccountRule: Send + Sync + core::fmt::Debug {
    /// Whether a touched account in this state must be removed.
    fn should_prune(&self, account: &Account) -> bool;
}

/// EIP-161 touch-delete: prune accounts with zero nonce, zero balance, no
/// code and empty storage.
#[derive(Clone, Copy, Debug, Default)]
pub struct SpuriousDragonRule;

impl EmptyAccountRule for SpuriousDragonRule {
    fn should_prune(&self, account: &Account) -> bool {
        account.is_empty()
    }
}
