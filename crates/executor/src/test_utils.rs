//! Scripted EVM and system-call implementations for tests.

use crate::evm::{
    BlockEnv, Evm, EvmError, EvmFactory, ExecutionResult, StateChange, StateReader, SystemCall,
};
use alloy_primitives::{Address, Bytes, B256, U256};
use std::{collections::HashMap, sync::Arc};
use stele_primitives::{Log, Transaction, TxKind};

/// Base gas charged per message by [`TestEvm`].
pub const TEST_TX_GAS: u64 = 21_000;

/// A toy interpreter for tests: value transfers, deployments and
/// self-destructs, with optional per-transaction scripted overrides.
///
/// Conventions for unscripted transactions:
/// - plain calls move `value` and bump the sender nonce;
/// - creations additionally deploy `input` as the runtime code;
/// - a call with input `b"selfdestruct"` destroys the callee;
/// - a call with input starting with `b"log:"` emits one log with the rest
///   of the input as data.
#[derive(Clone, Debug, Default)]
pub struct TestEvm {
    gas_overrides: Arc<HashMap<B256, u64>>,
    scripted: Arc<HashMap<B256, ExecutionResult>>,
}

impl TestEvm {
    /// Creates the default interpreter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the gas used of one transaction.
    pub fn with_gas(mut self, tx_hash: B256, gas_used: u64) -> Self {
        Arc::make_mut(&mut self.gas_overrides).insert(tx_hash, gas_used);
        self
    }

    /// Fully scripts the result of one transaction.
    pub fn with_result(mut self, tx_hash: B256, result: ExecutionResult) -> Self {
        Arc::make_mut(&mut self.scripted).insert(tx_hash, result);
        self
    }
}

impl Evm for TestEvm {
    fn transact(
        &mut self,
        tx: &Transaction,
        _env: &BlockEnv,
        state: &dyn StateReader,
    ) -> Result<ExecutionResult, EvmError> {
        let hash = tx.hash();
        if let Some(result) = self.scripted.get(&hash) {
            return Ok(result.clone());
        }

        let gas_used = self.gas_overrides.get(&hash).copied().unwrap_or(TEST_TX_GAS);
        let sender = state.account(tx.from)?.unwrap_or_default();

        // Saturating: a stale speculative view may show too little balance;
        // the scheduler's read-set validation discards such results.
        let mut changes = vec![StateChange::Account {
            address: tx.from,
            nonce: sender.nonce + 1,
            balance: sender.balance.saturating_sub(tx.value),
        }];
        let mut logs = Vec::new();

        match tx.to {
            TxKind::Call(callee) => {
                if tx.input.as_ref() == b"selfdestruct" {
                    changes.push(StateChange::SelfDestruct { address: callee });
                } else {
                    let target = state.account(callee)?.unwrap_or_default();
                    changes.push(StateChange::Account {
                        address: callee,
                        nonce: target.nonce,
                        balance: target.balance.saturating_add(tx.value),
                    });
                    if let Some(data) = tx.input.strip_prefix(b"log:") {
                        logs.push(Log::new(
                            callee,
                            vec![B256::with_last_byte(1)],
                            Bytes::copy_from_slice(data),
                        ));
                    }
                }
            }
            TxKind::Create | TxKind::Create2(_) => {
                let address = tx.created_address().expect("creation has an address");
                changes.push(StateChange::Account {
                    address,
                    nonce: 0,
                    balance: tx.value,
                });
                changes.push(StateChange::DeployContract {
                    address,
                    code: tx.input.to_vec(),
                });
            }
        }

        Ok(ExecutionResult {
            gas_used,
            success: true,
            output: Bytes::new(),
            logs,
            changes,
        })
    }
}

impl EvmFactory for TestEvm {
    type Evm = Self;

    fn create(&self) -> Self::Evm {
        self.clone()
    }
}

/// System call that writes its input into slot zero of the target contract,
/// mimicking a beacon-roots style ring buffer of depth one.
#[derive(Clone, Copy, Debug, Default)]
pub struct RecordingSystemCall;

impl SystemCall for RecordingSystemCall {
    fn call(
        &mut self,
        contract: Address,
        input: &[u8],
        _state: &dyn StateReader,
    ) -> Result<(Bytes, Vec<StateChange>), EvmError> {
        let mut word = [0u8; 32];
        let len = input.len().min(32);
        word[32 - len..].copy_from_slice(&input[..len]);
        Ok((
            Bytes::new(),
            vec![StateChange::Storage {
                address: contract,
                slot: B256::ZERO,
                value: U256::from_be_bytes(word),
            }],
        ))
    }
}
