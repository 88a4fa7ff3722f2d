//! Per-block execution: `BlockStart -> PerTxApply xN -> BlockFinalize`.

use crate::{
    error::{BlockExecutionError, BlockValidationError},
    evm::{
        BlockEnv, BlockHookContext, ConsensusEngine, EmptyAccountRule, Evm, EvmError,
        ExecutionResult, StateChange, StateReader, SystemCall,
    },
};
use alloy_primitives::{Address, Bytes, B256, U256};
use std::collections::BTreeSet;
use stele_kv::{DatabaseError, DbTxMut};
use stele_primitives::{logs_bloom, Account, Receipt, SealedBlock, Transaction, FIRST_INCARNATION};
use stele_state::StateStore;

/// Tracks gas available to the remaining transactions of a block.
#[derive(Clone, Copy, Debug)]
pub struct GasPool {
    gas: u64,
}

impl GasPool {
    /// Creates a pool holding the block gas limit.
    pub fn new(gas: u64) -> Self {
        Self { gas }
    }

    /// Remaining gas.
    pub fn gas(&self) -> u64 {
        self.gas
    }

    /// Reserves gas for a transaction.
    pub fn subtract(&mut self, amount: u64) -> Result<(), BlockValidationError> {
        if self.gas < amount {
            return Err(BlockValidationError::GasPoolExceeded {
                requested: amount,
                available: self.gas,
            });
        }
        self.gas -= amount;
        Ok(())
    }

    /// Returns unused gas to the pool.
    pub fn add(&mut self, amount: u64) {
        self.gas += amount;
    }
}

/// Read-only state view over a raw key-value transaction, the base view
/// for speculative execution.
#[derive(Debug)]
pub struct TxStateReader<'a, TX>(pub &'a TX);

impl<TX: stele_kv::DbTx> StateReader for TxStateReader<'_, TX> {
    fn account(&self, address: Address) -> Result<Option<Account>, DatabaseError> {
        self.0.get::<stele_kv::tables::PlainAccounts>(&address)
    }

    fn storage(
        &self,
        address: Address,
        incarnation: u64,
        slot: B256,
    ) -> Result<U256, DatabaseError> {
        Ok(self
            .0
            .get::<stele_kv::tables::PlainStorage>(&(address, incarnation, slot))?
            .unwrap_or_default())
    }

    fn code(&self, code_hash: B256) -> Result<Option<Vec<u8>>, DatabaseError> {
        self.0.get::<stele_kv::tables::Bytecodes>(&code_hash)
    }
}

impl<TX: DbTxMut> StateReader for StateStore<'_, TX> {
    fn account(&self, address: Address) -> Result<Option<Account>, DatabaseError> {
        self.read_account(address)
    }

    fn storage(
        &self,
        address: Address,
        incarnation: u64,
        slot: B256,
    ) -> Result<U256, DatabaseError> {
        self.read_storage(address, incarnation, slot)
    }

    fn code(&self, code_hash: B256) -> Result<Option<Vec<u8>>, DatabaseError> {
        self.read_code(code_hash)
    }
}

/// Applies state diffs through the store, tracking touched addresses for
/// empty-account pruning.
fn apply_changes<TX: DbTxMut>(
    store: &mut StateStore<'_, TX>,
    changes: &[StateChange],
    touched: &mut BTreeSet<Address>,
) -> Result<(), BlockExecutionError> {
    for change in changes {
        touched.insert(change.address());
        match change {
            StateChange::Account { address, nonce, balance } => {
                let mut account = store.read_account(*address)?.unwrap_or_default();
                account.nonce = *nonce;
                account.balance = *balance;
                store.write_account(*address, account)?;
            }
            StateChange::DeployContract { address, code } => {
                let mut account = store.read_account(*address)?.unwrap_or_default();
                account.incarnation = store.next_incarnation(*address)?;
                account.code_hash = store.write_code(code.clone())?;
                store.write_account(*address, account)?;
            }
            StateChange::Storage { address, slot, value } => {
                let incarnation = store
                    .read_account(*address)?
                    .map(|account| account.incarnation)
                    .unwrap_or(FIRST_INCARNATION);
                store.write_storage(*address, incarnation, *slot, *value)?;
            }
            StateChange::SelfDestruct { address } => {
                store.delete_account(*address)?;
            }
            StateChange::Touch { .. } => {}
        }
    }
    Ok(())
}

/// Removes touched accounts that the protocol's empty-account rule prunes.
fn prune_touched<TX: DbTxMut>(
    store: &mut StateStore<'_, TX>,
    rule: &dyn EmptyAccountRule,
    touched: &BTreeSet<Address>,
) -> Result<(), BlockExecutionError> {
    for address in touched {
        if let Some(account) = store.read_account(*address)? {
            if rule.should_prune(&account) {
                tracing::trace!(target: "executor", %address, "pruning empty account");
                store.delete_account(*address)?;
            }
        }
    }
    Ok(())
}

/// Hook context giving consensus engines unmetered state access.
struct HookCtx<'x, 'a, TX, S> {
    store: &'x mut StateStore<'a, TX>,
    syscall: &'x mut S,
    touched: &'x mut BTreeSet<Address>,
}

impl<TX: DbTxMut, S: SystemCall> BlockHookContext for HookCtx<'_, '_, TX, S> {
    fn account(&self, address: Address) -> Result<Option<Account>, DatabaseError> {
        self.store.read_account(address)
    }

    fn credit(&mut self, address: Address, amount: U256) -> Result<(), DatabaseError> {
        let mut account = self.store.read_account(address)?.unwrap_or_default();
        account.balance += amount;
        self.touched.insert(address);
        self.store.write_account(address, account)
    }

    fn sys_call(&mut self, contract: Address, input: &[u8]) -> Result<Bytes, EvmError> {
        let (output, changes) = self.syscall.call(contract, input, &*self.store)?;
        apply_changes(self.store, &changes, self.touched).map_err(|err| match err {
            BlockExecutionError::Database(err) => EvmError::Database(err),
            other => EvmError::Internal(other.to_string()),
        })?;
        Ok(output)
    }
}

/// Executes one block's transactions against the state store, producing
/// receipts.
///
/// Any consensus-invalid transaction aborts the whole block with a
/// [`BlockValidationError`]; a block is applied entirely or not at all (the
/// caller unwinds the partial writes via the change set).
#[derive(Debug)]
pub struct BlockExecutor<'a, TX, E, S> {
    store: StateStore<'a, TX>,
    evm: E,
    syscall: S,
    engine: &'a dyn ConsensusEngine,
    empty_rule: &'a dyn EmptyAccountRule,
}

impl<'a, TX, E, S> BlockExecutor<'a, TX, E, S>
where
    TX: DbTxMut,
    E: Evm,
    S: SystemCall,
{
    /// Creates an executor for one block.
    pub fn new(
        store: StateStore<'a, TX>,
        evm: E,
        syscall: S,
        engine: &'a dyn ConsensusEngine,
        empty_rule: &'a dyn EmptyAccountRule,
    ) -> Self {
        Self { store, evm, syscall, engine, empty_rule }
    }

    /// Runs the full block state machine, invoking the EVM per transaction.
    pub fn execute_block(
        &mut self,
        block: &SealedBlock,
    ) -> Result<Vec<Receipt>, BlockExecutionError> {
        let env = BlockEnv::from(&block.header.header);
        self.run(block, &env, None)
    }

    /// Runs the block state machine over speculatively produced results,
    /// committing strictly in transaction order.
    pub fn apply_results(
        &mut self,
        block: &SealedBlock,
        results: Vec<ExecutionResult>,
    ) -> Result<Vec<Receipt>, BlockExecutionError> {
        let env = BlockEnv::from(&block.header.header);
        self.run(block, &env, Some(results))
    }

    /// Finishes the block, persisting the recorded change set.
    pub fn finish(self) -> Result<(), DatabaseError> {
        self.store.finish()
    }

    fn run(
        &mut self,
        block: &SealedBlock,
        env: &BlockEnv,
        mut precomputed: Option<Vec<ExecutionResult>>,
    ) -> Result<Vec<Receipt>, BlockExecutionError> {
        if let Some(results) = &precomputed {
            debug_assert_eq!(results.len(), block.body.transactions.len());
        }
        tracing::debug!(
            target: "executor",
            number = block.number(),
            txs = block.body.transactions.len(),
            "executing block",
        );

        // BlockStart.
        let mut touched = BTreeSet::new();
        self.engine.initialize(
            block,
            &mut HookCtx {
                store: &mut self.store,
                syscall: &mut self.syscall,
                touched: &mut touched,
            },
        )?;
        prune_touched(&mut self.store, self.empty_rule, &touched)?;

        // PerTxApply.
        let mut gas_pool = GasPool::new(block.header.gas_limit);
        let mut cumulative_gas_used = 0u64;
        let mut receipts = Vec::with_capacity(block.body.transactions.len());
        for (index, tx) in block.body.transactions.iter().enumerate() {
            self.validate_transaction(tx, &mut gas_pool)?;

            let result = match precomputed.as_mut() {
                Some(results) => std::mem::take(&mut results[index]),
                None => self.evm.transact(tx, env, &self.store)?,
            };

            let mut touched = BTreeSet::new();
            apply_changes(&mut self.store, &result.changes, &mut touched)?;
            prune_touched(&mut self.store, self.empty_rule, &touched)?;

            gas_pool.add(tx.gas_limit - result.gas_used);
            cumulative_gas_used += result.gas_used;

            receipts.push(Receipt {
                tx_type: tx.tx_type,
                success: result.success,
                cumulative_gas_used,
                bloom: logs_bloom(&result.logs),
                logs: result.logs,
                tx_hash: tx.hash(),
                contract_address: tx.created_address(),
                gas_used: result.gas_used,
                block_hash: block.hash(),
                block_number: block.number(),
                transaction_index: index as u64,
            });
        }

        // BlockFinalize.
        let mut touched = BTreeSet::new();
        self.engine.finalize(
            block,
            &mut HookCtx {
                store: &mut self.store,
                syscall: &mut self.syscall,
                touched: &mut touched,
            },
        )?;
        prune_touched(&mut self.store, self.empty_rule, &touched)?;

        if cumulative_gas_used != block.header.gas_used {
            return Err(BlockValidationError::GasUsedMismatch {
                header: block.header.gas_used,
                executed: cumulative_gas_used,
            }
            .into());
        }

        Ok(receipts)
    }

    /// Rejects transactions the sender cannot have issued. Failure here is
    /// fatal to the whole block, never silently skipped.
    fn validate_transaction(
        &self,
        tx: &Transaction,
        gas_pool: &mut GasPool,
    ) -> Result<(), BlockExecutionError> {
        let sender = self.store.read_account(tx.from)?.unwrap_or_default();
        if sender.nonce != tx.nonce {
            return Err(BlockValidationError::NonceMismatch {
                address: tx.from,
                expected: sender.nonce,
                got: tx.nonce,
            }
            .into());
        }
        if sender.balance < tx.value {
            return Err(BlockValidationError::InsufficientFunds { address: tx.from }.into());
        }
        gas_pool.subtract(tx.gas_limit)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        evm::{BeaconConsensus, SpuriousDragonRule, StateChange},
        test_utils::{RecordingSystemCall, TestEvm, TEST_TX_GAS},
        NoSystemCall,
    };
    use alloy_primitives::keccak256;
    use assert_matches::assert_matches;
    use stele_kv::{
        mem::MemDb,
        tables::{IncarnationMap, PlainAccounts},
        Database, DbTx,
    };
    use stele_primitives::{
        create_address, Block, BlockBody, Header, SealedBlock, TxKind, Withdrawal,
        KECCAK_EMPTY,
    };

    fn seed(db: &MemDb, accounts: &[(Address, u64)]) {
        let mut tx = db.tx_mut().unwrap();
        for (address, balance) in accounts {
            tx.put::<PlainAccounts>(
                *address,
                Account { balance: U256::from(*balance), ..Default::default() },
            )
            .unwrap();
        }
        tx.commit().unwrap();
    }

    fn block(number: u64, transactions: Vec<Transaction>, gas_used: u64) -> SealedBlock {
        Block {
            header: Header {
                number,
                timestamp: number,
                gas_limit: 1_000_000,
                gas_used,
                ..Default::default()
            },
            body: BlockBody { transactions, withdrawals: vec![] },
        }
        .seal_slow()
    }

    fn execute(
        db: &MemDb,
        evm: TestEvm,
        block: &SealedBlock,
    ) -> Result<Vec<Receipt>, BlockExecutionError> {
        let mut tx = db.tx_mut().unwrap();
        let engine = BeaconConsensus::default();
        let mut executor = BlockExecutor::new(
            StateStore::with_changeset(&mut tx, block.number()),
            evm,
            NoSystemCall,
            &engine,
            &SpuriousDragonRule,
        );
        let receipts = executor.execute_block(block)?;
        executor.finish()?;
        tx.commit().unwrap();
        Ok(receipts)
    }

    fn call(from: Address, nonce: u64, to: Address, value: u64, input: &'static [u8]) -> Transaction {
        Transaction {
            tx_type: 0,
            from,
            to: TxKind::Call(to),
            nonce,
            gas_limit: TEST_TX_GAS,
            value: U256::from(value),
            input: Bytes::from_static(input),
        }
    }

    #[test]
    fn cumulative_gas_follows_transaction_order() {
        let alice = Address::repeat_byte(0xa1);
        let bob = Address::repeat_byte(0xb0);
        let db = MemDb::new();
        seed(&db, &[(alice, 1_000)]);

        let tx0 = call(alice, 0, bob, 1, b"");
        let tx1 = call(alice, 1, bob, 1, b"");
        let evm = TestEvm::new().with_gas(tx0.hash(), 21_000).with_gas(tx1.hash(), 30_000);

        let receipts = execute(&db, evm, &block(1, vec![tx0, tx1], 51_000)).unwrap();

        assert_eq!(receipts[0].cumulative_gas_used, 21_000);
        assert_eq!(receipts[1].cumulative_gas_used, 51_000);
        assert_eq!(receipts[1].gas_used, 30_000);
        // sum(gas_used) == last cumulative, and cumulative never decreases.
        assert_eq!(
            receipts.iter().map(|r| r.gas_used).sum::<u64>(),
            receipts.last().unwrap().cumulative_gas_used,
        );
        assert!(receipts.windows(2).all(|w| w[0].cumulative_gas_used <= w[1].cumulative_gas_used));
    }

    #[test]
    fn nonce_mismatch_aborts_the_whole_block() {
        let alice = Address::repeat_byte(0xa1);
        let db = MemDb::new();
        seed(&db, &[(alice, 1_000)]);

        // Second transaction replays nonce 0.
        let txs = vec![
            call(alice, 0, Address::repeat_byte(0xb0), 1, b""),
            call(alice, 0, Address::repeat_byte(0xb0), 1, b""),
        ];
        let err = execute(&db, TestEvm::new(), &block(1, txs, 42_000)).unwrap_err();
        assert_matches!(
            err,
            BlockExecutionError::Validation(BlockValidationError::NonceMismatch { .. })
        );
        assert!(err.is_validation());
    }

    #[test]
    fn value_above_balance_aborts_the_whole_block() {
        let alice = Address::repeat_byte(0xa1);
        let db = MemDb::new();
        seed(&db, &[(alice, 10)]);

        let txs = vec![call(alice, 0, Address::repeat_byte(0xb0), 100, b"")];
        let err = execute(&db, TestEvm::new(), &block(1, txs, 21_000)).unwrap_err();
        assert_matches!(
            err,
            BlockExecutionError::Validation(BlockValidationError::InsufficientFunds { .. })
        );
    }

    #[test]
    fn gas_pool_is_bounded_by_the_block_limit() {
        let alice = Address::repeat_byte(0xa1);
        let db = MemDb::new();
        seed(&db, &[(alice, 1_000)]);

        let mut tx = call(alice, 0, Address::repeat_byte(0xb0), 1, b"");
        tx.gas_limit = 2_000_000; // above the block limit
        let err = execute(&db, TestEvm::new(), &block(1, vec![tx], 21_000)).unwrap_err();
        assert_matches!(
            err,
            BlockExecutionError::Validation(BlockValidationError::GasPoolExceeded { .. })
        );
    }

    #[test]
    fn header_gas_used_is_enforced() {
        let alice = Address::repeat_byte(0xa1);
        let db = MemDb::new();
        seed(&db, &[(alice, 1_000)]);

        let txs = vec![call(alice, 0, Address::repeat_byte(0xb0), 1, b"")];
        // Header claims more gas than execution uses.
        let err = execute(&db, TestEvm::new(), &block(1, txs, 99_000)).unwrap_err();
        assert_matches!(
            err,
            BlockExecutionError::Validation(BlockValidationError::GasUsedMismatch {
                header: 99_000,
                executed: 21_000,
            })
        );
    }

    #[test]
    fn receipt_bloom_has_no_false_negatives() {
        let alice = Address::repeat_byte(0xa1);
        let emitter = Address::repeat_byte(0xee);
        let db = MemDb::new();
        seed(&db, &[(alice, 1_000)]);

        let txs = vec![call(alice, 0, emitter, 0, b"log:ping")];
        let receipts = execute(&db, TestEvm::new(), &block(1, txs, 21_000)).unwrap();

        let receipt = &receipts[0];
        assert_eq!(receipt.logs.len(), 1);
        for log in &receipt.logs {
            assert!(receipt.bloom.contains_input(log.address.as_slice()));
            for topic in &log.topics {
                assert!(receipt.bloom.contains_input(topic.as_slice()));
            }
        }
    }

    #[test]
    fn withdrawals_are_credited_at_finalization() {
        let validator = Address::repeat_byte(0x77);
        let db = MemDb::new();

        let sealed = Block {
            header: Header {
                number: 1,
                timestamp: 1,
                gas_limit: 1_000_000,
                gas_used: 0,
                ..Default::default()
            },
            body: BlockBody {
                transactions: vec![],
                withdrawals: vec![Withdrawal {
                    index: 0,
                    validator_index: 9,
                    address: validator,
                    amount_gwei: 2,
                }],
            },
        }
        .seal_slow();

        execute(&db, TestEvm::new(), &sealed).unwrap();

        let tx = db.tx().unwrap();
        let account = tx.get::<PlainAccounts>(&validator).unwrap().unwrap();
        assert_eq!(account.balance, U256::from(2_000_000_000u64));
    }

    #[test]
    fn system_call_runs_unmetered_at_block_start() {
        let contract = Address::repeat_byte(0xbe);
        let db = MemDb::new();

        let sealed = Block {
            header: Header {
                number: 1,
                timestamp: 1,
                gas_limit: 1_000_000,
                parent_hash: B256::repeat_byte(0x42),
                ..Default::default()
            },
            body: BlockBody::default(),
        }
        .seal_slow();

        let mut tx = db.tx_mut().unwrap();
        let engine = BeaconConsensus { beacon_roots_contract: Some(contract) };
        let mut executor = BlockExecutor::new(
            StateStore::new(&mut tx),
            TestEvm::new(),
            RecordingSystemCall,
            &engine,
            &SpuriousDragonRule,
        );
        executor.execute_block(&sealed).unwrap();
        executor.finish().unwrap();

        // The hook recorded the parent hash into slot zero, with no gas
        // accounting anywhere.
        let store = StateStore::new(&mut tx);
        let recorded = store.read_storage(contract, FIRST_INCARNATION, B256::ZERO).unwrap();
        assert_eq!(recorded, U256::from_be_bytes(B256::repeat_byte(0x42).0));
    }

    #[test]
    fn self_destruct_removes_account_within_the_block() {
        let alice = Address::repeat_byte(0xa1);
        let db = MemDb::new();
        seed(&db, &[(alice, 1_000)]);
        let contract = create_address(alice, 0);

        let deploy = Transaction {
            tx_type: 0,
            from: alice,
            to: TxKind::Create,
            nonce: 0,
            gas_limit: TEST_TX_GAS,
            value: U256::ZERO,
            input: Bytes::from_static(b"\x60\x01\x60\x01"),
        };
        let destroy = call(alice, 1, contract, 0, b"selfdestruct");
        execute(&db, TestEvm::new(), &block(1, vec![deploy, destroy], 42_000)).unwrap();

        let tx = db.tx().unwrap();
        assert_eq!(tx.get::<PlainAccounts>(&contract).unwrap(), None);
        // The incarnation is retired so a re-creation cannot see old storage.
        assert_eq!(tx.get::<IncarnationMap>(&contract).unwrap(), Some(FIRST_INCARNATION));
    }

    /// Deploy, self-destruct and re-fund a contract address within one
    /// block; after a reload from durable storage the address holds a plain
    /// value-bearing account with no code, and the old contract storage is
    /// unreachable.
    #[test]
    fn self_destruct_then_fund_then_reload() {
        let alice = Address::repeat_byte(0xa1);
        let db = MemDb::new();
        seed(&db, &[(alice, 1_000)]);
        let contract = create_address(alice, 0);
        let slot = B256::with_last_byte(0x04);

        let deploy = Transaction {
            tx_type: 0,
            from: alice,
            to: TxKind::Create,
            nonce: 0,
            gas_limit: TEST_TX_GAS,
            value: U256::ZERO,
            input: Bytes::from_static(b"\x60\x01"),
        };
        // Script the deployment to also write a storage slot, so the wipe
        // across incarnations is observable.
        let deploy_result = ExecutionResult {
            gas_used: TEST_TX_GAS,
            success: true,
            output: Bytes::new(),
            logs: vec![],
            changes: vec![
                StateChange::Account { address: alice, nonce: 1, balance: U256::from(1_000) },
                StateChange::Account { address: contract, nonce: 0, balance: U256::ZERO },
                StateChange::DeployContract { address: contract, code: b"\x60\x01".to_vec() },
                StateChange::Storage { address: contract, slot, value: U256::from(7) },
            ],
        };
        let destroy = call(alice, 1, contract, 0, b"selfdestruct");
        let fund = call(alice, 2, contract, 1, b"");

        let evm = TestEvm::new().with_result(deploy.hash(), deploy_result);
        let receipts =
            execute(&db, evm.clone(), &block(1, vec![deploy.clone(), destroy, fund], 63_000))
                .unwrap();
        assert_eq!(receipts[0].contract_address, Some(contract));

        // Block 2 is empty and executes against a fresh transaction,
        // forcing a reload from what was durably committed.
        execute(&db, evm, &block(2, vec![], 0)).unwrap();

        let tx = db.tx().unwrap();
        let account = tx.get::<PlainAccounts>(&contract).unwrap().expect("account exists");
        // Re-created as a plain value-bearing account: one wei, no code.
        assert_eq!(account.balance, U256::from(1));
        assert_eq!(account.code_hash, KECCAK_EMPTY);

        // The old incarnation's storage is gone for the new lifetime.
        let mut tx = db.tx_mut().unwrap();
        let store = StateStore::new(&mut tx);
        let next = store.next_incarnation(contract).unwrap();
        assert_eq!(next, FIRST_INCARNATION + 1);
        assert_eq!(store.read_storage(contract, next, slot).unwrap(), U256::ZERO);

        let sender = store.read_account(alice).unwrap().unwrap();
        assert_eq!(sender.nonce, 3);
        assert_eq!(sender.balance, U256::from(999));
    }
}
