//! The execution stage: replays transactions block by block, persisting
//! receipts and change sets.

use crate::{
    error::{map_execution_error, DatabaseIntegrityError, StageError},
    id::{StageId, EXECUTION},
    stage::{ExecInput, ExecOutput, Stage, UnwindInput, UnwindOutput},
};
use async_trait::async_trait;
use std::sync::Arc;
use stele_executor::{
    execute_speculative, BlockEnv, BlockExecutor, ConsensusEngine, EmptyAccountRule, EvmFactory,
    SystemCall, TxStateReader,
};
use stele_kv::{
    tables::{BlockBodies, CanonicalHeaders, Headers, Receipts},
    DbTxMut,
};
use stele_primitives::{BlockBody, BlockNumber, SealedBlock, SealedHeader};
use stele_state::{unwind_state, StateStore};

/// Replays every canonical block in the input range through the block
/// executor.
///
/// Inputs: [`CanonicalHeaders`], [`Headers`], [`BlockBodies`].
/// Outputs: plain/hashed state, change sets, [`Receipts`].
///
/// Unwind replays the recorded change sets in reverse and truncates the
/// receipts beyond the unwind point.
#[derive(Debug)]
pub struct ExecutionStage<EF, S> {
    factory: EF,
    syscall: S,
    engine: Arc<dyn ConsensusEngine>,
    empty_rule: Arc<dyn EmptyAccountRule>,
    /// Worker count for speculative parallel execution; `None` runs
    /// sequentially.
    parallel_workers: Option<usize>,
}

impl<EF, S> ExecutionStage<EF, S> {
    /// Creates a sequential execution stage.
    pub fn new(
        factory: EF,
        syscall: S,
        engine: Arc<dyn ConsensusEngine>,
        empty_rule: Arc<dyn EmptyAccountRule>,
    ) -> Self {
        Self { factory, syscall, engine, empty_rule, parallel_workers: None }
    }

    /// Enables speculative parallel execution on `workers` threads.
    pub fn with_parallel_workers(mut self, workers: usize) -> Self {
        self.parallel_workers = Some(workers);
        self
    }
}

/// Reads one sealed block from the database tables.
pub(crate) fn read_block<TX: DbTxMut>(
    tx: &TX,
    number: BlockNumber,
) -> Result<SealedBlock, StageError> {
    let hash = tx
        .get::<CanonicalHeaders>(&number)?
        .ok_or(DatabaseIntegrityError::CanonicalHash { number })?;
    let header = tx.get::<Headers>(&hash)?.ok_or(DatabaseIntegrityError::Header { hash })?;
    let body: BlockBody =
        tx.get::<BlockBodies>(&hash)?.ok_or(DatabaseIntegrityError::BlockBody { hash })?;
    Ok(SealedBlock { header: SealedHeader { header, hash }, body })
}

#[async_trait]
impl<TX, EF, S> Stage<TX> for ExecutionStage<EF, S>
where
    TX: DbTxMut + Sync,
    EF: EvmFactory,
    S: SystemCall + Clone + Send + Sync,
{
    fn id(&self) -> StageId {
        EXECUTION
    }

    async fn execute(&mut self, tx: &mut TX, input: ExecInput) -> Result<ExecOutput, StageError> {
        let last_block = input.stage_progress.unwrap_or_default();
        let target = input.previous_stage_progress();
        if last_block >= target {
            return Ok(ExecOutput { stage_progress: last_block, done: true });
        }

        for number in last_block + 1..=target {
            let block = read_block(tx, number)?;
            tracing::debug!(
                target: "stages::execution",
                number,
                txs = block.body.transactions.len(),
                "executing block",
            );

            // Speculate first when configured: workers read the pre-block
            // state through an immutable view of the same transaction.
            let results = match self.parallel_workers {
                Some(workers) if block.body.transactions.len() > 1 => Some(execute_speculative(
                    &block.body.transactions,
                    &BlockEnv::from(&block.header.header),
                    &TxStateReader(&*tx),
                    &self.factory,
                    workers,
                    &*self.empty_rule,
                )?),
                _ => None,
            };

            let mut executor = BlockExecutor::new(
                StateStore::with_changeset(tx, number),
                self.factory.create(),
                self.syscall.clone(),
                &*self.engine,
                &*self.empty_rule,
            );
            let outcome = match results {
                Some(results) => executor.apply_results(&block, results),
                None => executor.execute_block(&block),
            };
            let receipts = outcome.map_err(|error| map_execution_error(number, error))?;
            executor.finish()?;

            for (index, receipt) in receipts.iter().enumerate() {
                let mut buf = Vec::new();
                receipt.encode_storage(&mut buf);
                tx.put::<Receipts>((number, index as u64), buf)?;
            }
        }

        Ok(ExecOutput { stage_progress: target, done: true })
    }

    async fn unwind(
        &mut self,
        tx: &mut TX,
        input: UnwindInput,
    ) -> Result<UnwindOutput, StageError> {
        tracing::info!(
            target: "stages::execution",
            from = input.stage_progress,
            to = input.unwind_to,
            bad_block = ?input.bad_block,
            "unwinding execution",
        );
        unwind_state(tx, input.stage_progress, input.unwind_to)?;
        tx.delete_range::<Receipts>(
            (input.unwind_to + 1, 0)..=(input.stage_progress, u64::MAX),
        )?;
        Ok(UnwindOutput { stage_progress: input.unwind_to })
    }
}
