//! Speculative parallel transaction execution.
//!
//! A fixed worker pool executes transactions out of order against immutable
//! snapshots of a versioned overlay, recording every `(key, version)` read.
//! The scheduler commits strictly in transaction-index order: an outcome
//! whose read set no longer matches the committed overlay is rolled back
//! and rescheduled against a fresh snapshot. Commit order, not completion
//! order, defines the semantics, so the produced results are identical to
//! sequential execution.

use crate::evm::{
    BlockEnv, EmptyAccountRule, Evm, EvmError, EvmFactory, ExecutionResult, StateChange,
    StateReader,
};
use alloy_primitives::{keccak256, Address, B256, U256};
use std::{
    cell::RefCell,
    collections::HashMap,
    sync::Arc,
};
use stele_kv::DatabaseError;
use stele_primitives::{Account, Transaction, FIRST_INCARNATION};

/// A state location observed by a speculated transaction.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum StateKey {
    /// An account record.
    Account(Address),
    /// A storage slot.
    Storage(Address, B256),
}

/// Speculative writes committed so far, versioned by committing transaction
/// index plus one; version zero is the pre-block base state.
#[derive(Clone, Debug, Default)]
struct Overlay {
    accounts: HashMap<Address, (u64, Option<Account>)>,
    storage: HashMap<(Address, B256), (u64, U256)>,
    /// Self-destruct epochs: storage below this version reads as zero.
    wiped: HashMap<Address, u64>,
    code: HashMap<B256, Vec<u8>>,
}

impl Overlay {
    fn account_version(&self, address: Address) -> u64 {
        self.accounts.get(&address).map(|(version, _)| *version).unwrap_or(0)
    }

    fn storage_version(&self, address: Address, slot: B256) -> u64 {
        let wiped = self.wiped.get(&address).copied().unwrap_or(0);
        let written =
            self.storage.get(&(address, slot)).map(|(version, _)| *version).unwrap_or(0);
        wiped.max(written)
    }

    fn version_of(&self, key: &StateKey) -> u64 {
        match key {
            StateKey::Account(address) => self.account_version(*address),
            StateKey::Storage(address, slot) => self.storage_version(*address, *slot),
        }
    }

    fn read_account<V: StateReader>(
        &self,
        base: &V,
        address: Address,
    ) -> Result<Option<Account>, DatabaseError> {
        match self.accounts.get(&address) {
            Some((_, account)) => Ok(*account),
            None => base.account(address),
        }
    }

    fn read_storage<V: StateReader>(
        &self,
        base: &V,
        address: Address,
        incarnation: u64,
        slot: B256,
    ) -> Result<U256, DatabaseError> {
        let wiped = self.wiped.get(&address).copied().unwrap_or(0);
        match self.storage.get(&(address, slot)) {
            Some((version, value)) if *version >= wiped => Ok(*value),
            Some(_) => Ok(U256::ZERO),
            None if wiped > 0 => Ok(U256::ZERO),
            None => base.storage(address, incarnation, slot),
        }
    }

    /// Applies one committed transaction's changes at `version`, mirroring
    /// the sequential apply path including empty-account pruning.
    fn apply<V: StateReader>(
        &mut self,
        version: u64,
        changes: &[StateChange],
        base: &V,
        empty_rule: &dyn EmptyAccountRule,
    ) -> Result<(), EvmError> {
        let mut touched = Vec::new();
        for change in changes {
            touched.push(change.address());
            match change {
                StateChange::Account { address, nonce, balance } => {
                    let mut account = self.read_account(base, *address)?.unwrap_or_default();
                    account.nonce = *nonce;
                    account.balance = *balance;
                    self.accounts.insert(*address, (version, Some(account)));
                }
                StateChange::DeployContract { address, code } => {
                    let mut account = self.read_account(base, *address)?.unwrap_or_default();
                    account.incarnation = (account.incarnation + 1).max(FIRST_INCARNATION);
                    account.code_hash = keccak256(code);
                    self.code.insert(account.code_hash, code.clone());
                    self.accounts.insert(*address, (version, Some(account)));
                }
                StateChange::Storage { address, slot, value } => {
                    self.storage.insert((*address, *slot), (version, *value));
                }
                StateChange::SelfDestruct { address } => {
                    self.accounts.insert(*address, (version, None));
                    self.wiped.insert(*address, version);
                }
                StateChange::Touch { .. } => {}
            }
        }
        for address in touched {
            if let Some(account) = self.read_account(base, address)? {
                if empty_rule.should_prune(&account) {
                    self.accounts.insert(address, (version, None));
                    self.wiped.insert(address, version);
                }
            }
        }
        Ok(())
    }
}

/// Worker-local read view: an immutable overlay snapshot over the base
/// state, recording every read with the version it observed.
struct SpeculativeView<'a, V> {
    base: &'a V,
    overlay: Arc<Overlay>,
    reads: RefCell<Vec<(StateKey, u64)>>,
}

impl<'a, V: StateReader> SpeculativeView<'a, V> {
    fn new(base: &'a V, overlay: Arc<Overlay>) -> Self {
        Self { base, overlay, reads: RefCell::new(Vec::new()) }
    }

    fn into_reads(self) -> Vec<(StateKey, u64)> {
        self.reads.into_inner()
    }
}

impl<V: StateReader> StateReader for SpeculativeView<'_, V> {
    fn account(&self, address: Address) -> Result<Option<Account>, DatabaseError> {
        let account = self.overlay.read_account(self.base, address)?;
        self.reads
            .borrow_mut()
            .push((StateKey::Account(address), self.overlay.account_version(address)));
        Ok(account)
    }

    fn storage(
        &self,
        address: Address,
        incarnation: u64,
        slot: B256,
    ) -> Result<U256, DatabaseError> {
        let value = self.overlay.read_storage(self.base, address, incarnation, slot)?;
        self.reads
            .borrow_mut()
            .push((StateKey::Storage(address, slot), self.overlay.storage_version(address, slot)));
        Ok(value)
    }

    fn code(&self, code_hash: B256) -> Result<Option<Vec<u8>>, DatabaseError> {
        // Code is content-addressed, so reads can never be invalidated.
        if let Some(code) = self.overlay.code.get(&code_hash) {
            return Ok(Some(code.clone()));
        }
        self.base.code(code_hash)
    }
}

struct Job {
    index: usize,
    attempt: u64,
    overlay: Arc<Overlay>,
}

struct Outcome {
    index: usize,
    attempt: u64,
    reads: Vec<(StateKey, u64)>,
    result: Result<ExecutionResult, EvmError>,
}

/// Executes `transactions` speculatively on `workers` threads, returning
/// results in transaction order, identical to sequential execution.
pub fn execute_speculative<V, F>(
    transactions: &[Transaction],
    env: &BlockEnv,
    base: &V,
    factory: &F,
    workers: usize,
    empty_rule: &dyn EmptyAccountRule,
) -> Result<Vec<ExecutionResult>, EvmError>
where
    V: StateReader + Sync,
    F: EvmFactory,
{
    if transactions.is_empty() {
        return Ok(Vec::new());
    }
    let workers = workers.clamp(1, transactions.len());
    tracing::debug!(target: "executor::parallel", txs = transactions.len(), workers, "speculative execution");

    std::thread::scope(|scope| {
        let (job_tx, job_rx) = crossbeam_channel::unbounded::<Job>();
        let (outcome_tx, outcome_rx) = crossbeam_channel::unbounded::<Outcome>();

        for _ in 0..workers {
            let job_rx = job_rx.clone();
            let outcome_tx = outcome_tx.clone();
            let mut evm = factory.create();
            scope.spawn(move || {
                while let Ok(job) = job_rx.recv() {
                    let view = SpeculativeView::new(base, job.overlay);
                    let result = evm.transact(&transactions[job.index], env, &view);
                    let outcome = Outcome {
                        index: job.index,
                        attempt: job.attempt,
                        reads: view.into_reads(),
                        result,
                    };
                    if outcome_tx.send(outcome).is_err() {
                        break;
                    }
                }
            });
        }
        drop(outcome_tx);

        // Queue everything up front; workers drain lowest index first.
        let empty_overlay = Arc::new(Overlay::default());
        for index in 0..transactions.len() {
            job_tx
                .send(Job { index, attempt: 0, overlay: Arc::clone(&empty_overlay) })
                .expect("workers alive");
        }

        let mut overlay = Overlay::default();
        let mut attempts = vec![0u64; transactions.len()];
        let mut pending: HashMap<usize, Outcome> = HashMap::new();
        let mut committed: Vec<ExecutionResult> = Vec::with_capacity(transactions.len());

        while committed.len() < transactions.len() {
            let next = committed.len();
            if let Some(outcome) = pending.remove(&next) {
                let result = outcome.result?;
                let valid = outcome.attempt == attempts[next] &&
                    outcome
                        .reads
                        .iter()
                        .all(|(key, observed)| overlay.version_of(key) == *observed);
                if valid {
                    overlay.apply(next as u64 + 1, &result.changes, base, empty_rule)?;
                    committed.push(result);
                    continue;
                }
                // Conflict: an earlier commit invalidated this speculation.
                // Roll it back and reschedule against the current overlay.
                tracing::trace!(target: "executor::parallel", index = next, "rescheduling conflicting speculation");
                attempts[next] += 1;
                job_tx
                    .send(Job {
                        index: next,
                        attempt: attempts[next],
                        overlay: Arc::new(overlay.clone()),
                    })
                    .expect("workers alive");
            }

            let outcome = outcome_rx.recv().expect("a job is outstanding");
            if outcome.index >= committed.len() && outcome.attempt == attempts[outcome.index] {
                pending.insert(outcome.index, outcome);
            }
        }

        drop(job_tx);
        Ok(committed)
    })
}
