//! Block execution against the versioned state store.
//!
//! The EVM interpreter, the gas-unmetered system-call entry point and the
//! consensus-engine hooks are consumed as opaque capabilities ([`evm`]);
//! this crate owns the per-block state machine ([`execute`]) that turns
//! transactions into receipts and state mutations, and the speculative
//! parallel scheduler ([`parallel`]).

pub mod error;
pub mod evm;
pub mod execute;
pub mod parallel;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use error::{BlockExecutionError, BlockValidationError};
pub use evm::{
    BeaconConsensus, BlockEnv, BlockHookContext, ConsensusEngine, EmptyAccountRule, Evm,
    EvmError, EvmFactory, ExecutionResult, NoSystemCall, SpuriousDragonRule, StateChange,
    StateReader, SystemCall,
};
pub use execute::{BlockExecutor, GasPool, TxStateReader};
pub use parallel::{execute_speculative, StateKey};
