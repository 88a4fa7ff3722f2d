//! The forkchoice update: designate a new canonical head, unwinding and
//! replaying the execution pipeline across the reorganization.

use crate::canonical::{read_pointers, CanonicalChain, ForkchoiceState};
use std::{sync::Arc, time::Duration};
use stele_executor::ConsensusEngine;
use stele_kv::{Database, DatabaseError, DbTxMut};
use stele_primitives::{BlockHash, BlockNumber, SealedHeader, B256};
use stele_stages::{Pipeline, StageError};
use tokio::sync::{oneshot, Mutex, Semaphore};

/// Externally visible status of a forkchoice update.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ForkchoiceStatus {
    /// The requested head is canonical and fully executed.
    Success,
    /// Another update is in flight, or this one is still processing in the
    /// background; retry and observe the outcome on the next query.
    Busy,
    /// Safe or finalized hash is not an ancestor of the requested head.
    InvalidForkchoice,
    /// The candidate chain failed execution or validation.
    BadBlock,
    /// A referenced block is not locally available.
    MissingSegment,
}

/// Outcome of a forkchoice update.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ForkchoiceReceipt {
    /// Status code, see [`ForkchoiceStatus`].
    pub status: ForkchoiceStatus,
    /// Hash of the latest valid block, when known.
    pub latest_valid_hash: Option<BlockHash>,
    /// Free-text diagnostic for invalid chains.
    pub validation_error: Option<String>,
}

impl ForkchoiceReceipt {
    fn success(hash: BlockHash) -> Self {
        Self { status: ForkchoiceStatus::Success, latest_valid_hash: Some(hash), validation_error: None }
    }

    fn busy() -> Self {
        Self { status: ForkchoiceStatus::Busy, latest_valid_hash: None, validation_error: None }
    }

    fn processing() -> Self {
        Self {
            status: ForkchoiceStatus::Busy,
            latest_valid_hash: None,
            validation_error: Some("processing asynchronously".to_owned()),
        }
    }

    fn invalid_forkchoice() -> Self {
        Self {
            status: ForkchoiceStatus::InvalidForkchoice,
            latest_valid_hash: None,
            validation_error: None,
        }
    }

    fn missing_segment() -> Self {
        Self {
            status: ForkchoiceStatus::MissingSegment,
            latest_valid_hash: None,
            validation_error: None,
        }
    }

    fn bad_block(latest_valid: Option<BlockHash>, error: String) -> Self {
        Self {
            status: ForkchoiceStatus::BadBlock,
            latest_valid_hash: latest_valid,
            validation_error: Some(error),
        }
    }
}

/// The engine failed outside the enumerated statuses; corruption-class,
/// decided on by the node driver rather than the forkchoice caller.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Storage failure.
    #[error(transparent)]
    Database(#[from] DatabaseError),
    /// A stage failed in a non-consensus way.
    #[error(transparent)]
    Stage(StageError),
    /// The background update task disappeared.
    #[error("forkchoice task aborted")]
    TaskAborted,
}

struct Inner<DB: Database> {
    db: DB,
    pipeline: Mutex<Pipeline<DB::TxMut>>,
    consensus: Arc<dyn ConsensusEngine>,
    /// One update in flight at a time; contenders get `Busy` immediately
    /// instead of queueing.
    update_permit: Arc<Semaphore>,
}

/// Drives canonical-chain changes: resolves the reorganization range,
/// unwinds, replays and atomically publishes the new pointers.
pub struct ForkchoiceEngine<DB: Database> {
    inner: Arc<Inner<DB>>,
}

impl<DB: Database> Clone for ForkchoiceEngine<DB> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<DB: Database> std::fmt::Debug for ForkchoiceEngine<DB> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForkchoiceEngine").finish_non_exhaustive()
    }
}

impl<DB> ForkchoiceEngine<DB>
where
    DB: Database + Send + Sync + 'static,
    DB::TxMut: Send + Sync,
{
    /// Creates the engine over a database, pipeline and consensus hook set.
    pub fn new(db: DB, pipeline: Pipeline<DB::TxMut>, consensus: Arc<dyn ConsensusEngine>) -> Self {
        Self {
            inner: Arc::new(Inner {
                db,
                pipeline: Mutex::new(pipeline),
                consensus,
                update_permit: Arc::new(Semaphore::new(1)),
            }),
        }
    }

    /// The currently persisted pointer triple.
    pub fn current_state(&self) -> Result<ForkchoiceState, EngineError> {
        let tx = self.inner.db.tx()?;
        Ok(read_pointers(&tx)?)
    }

    /// Applies a forkchoice update.
    ///
    /// At most one update runs at a time; a concurrent request returns
    /// [`ForkchoiceStatus::Busy`] immediately. With a timeout, the caller
    /// gets `Busy` ("processing") once it elapses while the underlying
    /// unwind/replay runs to completion in the background; partially
    /// applied state is never published, so interrupting mid-flight is
    /// never observable.
    pub async fn update_forkchoice(
        &self,
        state: ForkchoiceState,
        timeout: Option<Duration>,
    ) -> Result<ForkchoiceReceipt, EngineError> {
        let Ok(permit) = Arc::clone(&self.inner.update_permit).try_acquire_owned() else {
            tracing::debug!(target: "engine::forkchoice", "rejecting concurrent forkchoice update");
            return Ok(ForkchoiceReceipt::busy());
        };

        let (done_tx, done_rx) = oneshot::channel();
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let _permit = permit;
            let outcome = Self::try_update(&inner, state).await;
            if let Err(err) = &outcome {
                tracing::error!(target: "engine::forkchoice", %err, "forkchoice update failed");
            }
            let _ = done_tx.send(outcome);
        });

        match timeout {
            None => done_rx.await.map_err(|_| EngineError::TaskAborted)?,
            Some(duration) => match tokio::time::timeout(duration, done_rx).await {
                Ok(outcome) => outcome.map_err(|_| EngineError::TaskAborted)?,
                Err(_) => {
                    tracing::debug!(
                        target: "engine::forkchoice",
                        "treating forkchoice update as asynchronous; it is taking too long",
                    );
                    Ok(ForkchoiceReceipt::processing())
                }
            },
        }
    }

    async fn try_update(
        inner: &Inner<DB>,
        state: ForkchoiceState,
    ) -> Result<ForkchoiceReceipt, EngineError> {
        let mut pipeline = inner.pipeline.lock().await;
        let mut tx = inner.db.tx_mut()?;

        // Step one: resolve the requested head.
        let chain = CanonicalChain::new(&mut tx);
        let Some(head_header) = chain.header(state.head)? else {
            tracing::debug!(target: "engine::forkchoice", head = ?state.head, "unknown head");
            return Ok(ForkchoiceReceipt::missing_segment());
        };
        let head_number = head_header.number;

        // Already canonical: record pointers only, after checking ancestry.
        if chain.is_canonical(state.head, head_number)? {
            if !verify_pointers(&chain, state, head_number)? {
                return Ok(ForkchoiceReceipt::invalid_forkchoice());
            }
            let mut chain = CanonicalChain::new(&mut tx);
            chain.write_pointers(state)?;
            tx.commit()?;
            return Ok(ForkchoiceReceipt::success(state.head));
        }
        if head_number == 0 {
            // A non-canonical genesis cannot connect to anything.
            return Ok(ForkchoiceReceipt::missing_segment());
        }

        // Step two: walk back to the canonical join point, queueing the new
        // canonical segment.
        let mut new_canonicals: Vec<(BlockHash, BlockNumber)> = vec![(state.head, head_number)];
        let mut current_hash = head_header.parent_hash;
        let mut current_number = head_number - 1;
        loop {
            let chain = CanonicalChain::new(&mut tx);
            if chain.is_canonical(current_hash, current_number)? {
                break;
            }
            let Some(header) = chain.header(current_hash)? else {
                tracing::debug!(target: "engine::forkchoice", hash = ?current_hash, "missing segment during walk-back");
                return Ok(ForkchoiceReceipt::missing_segment());
            };
            new_canonicals.push((current_hash, current_number));
            if current_number == 0 {
                return Ok(ForkchoiceReceipt::missing_segment());
            }
            current_hash = header.parent_hash;
            current_number -= 1;
        }
        let unwind_to = current_number;
        let previous_head = CanonicalChain::new(&mut tx).head()?;
        tracing::info!(
            target: "engine::forkchoice",
            head = ?state.head,
            head_number,
            unwind_to,
            reorged_blocks = new_canonicals.len(),
            "applying forkchoice with reorg",
        );

        // Verify the headers of the new segment, oldest first, before doing
        // any work.
        new_canonicals.reverse();
        for (hash, _) in &new_canonicals {
            let chain = CanonicalChain::new(&mut tx);
            let header = chain.header(*hash)?.expect("resolved during walk-back");
            let parent_hash = header.parent_hash;
            let parent =
                chain.header(parent_hash)?.expect("parent resolved during walk-back");
            let sealed = SealedHeader { header, hash: *hash };
            let parent = SealedHeader { header: parent, hash: parent_hash };
            if let Err(error) = inner.consensus.validate_header(&sealed, &parent) {
                return Ok(ForkchoiceReceipt::bad_block(previous_head, error.to_string()));
            }
        }

        // Step three: unwind to the join point.
        if let Err(error) = pipeline.unwind(&mut tx, unwind_to, None).await {
            return Err(map_stage_error(error));
        }

        // Step four: adopt the new canonical segment.
        {
            let mut chain = CanonicalChain::new(&mut tx);
            chain.truncate_above(unwind_to)?;
            for (hash, number) in &new_canonicals {
                chain.mark_canonical(*number, *hash)?;
            }
        }

        // Step five: replay forward. Failure leaves the transaction
        // uncommitted, so the previously canonical state stays untouched.
        match pipeline.run(&mut tx, head_number).await {
            Ok(()) => {}
            Err(StageError::Validation { block, error }) => {
                tracing::warn!(target: "engine::forkchoice", block, %error, "bad block during replay");
                return Ok(ForkchoiceReceipt::bad_block(previous_head, error.to_string()));
            }
            Err(StageError::Integrity(error)) => {
                return Ok(ForkchoiceReceipt {
                    validation_error: Some(error.to_string()),
                    ..ForkchoiceReceipt::missing_segment()
                });
            }
            Err(error) => return Err(map_stage_error(error)),
        }

        // Step six: re-validate what was produced before publishing.
        let chain = CanonicalChain::new(&mut tx);
        if !chain.is_canonical(state.head, head_number)? {
            return Ok(ForkchoiceReceipt::bad_block(
                previous_head,
                "head hash and produced chain mismatch".to_owned(),
            ));
        }
        if !verify_pointers(&chain, state, head_number)? {
            return Ok(ForkchoiceReceipt::invalid_forkchoice());
        }

        // Step seven: publish atomically.
        let mut chain = CanonicalChain::new(&mut tx);
        chain.write_pointers(state)?;
        tx.commit()?;
        tracing::info!(target: "engine::forkchoice", head = ?state.head, head_number, "head updated");
        Ok(ForkchoiceReceipt::success(state.head))
    }
}

/// Safe and finalized hashes, when set, must be canonical strict ancestors
/// of the head.
fn verify_pointers<TX: DbTxMut>(
    chain: &CanonicalChain<'_, TX>,
    state: ForkchoiceState,
    head_number: BlockNumber,
) -> Result<bool, DatabaseError> {
    for hash in [state.safe, state.finalized] {
        if hash == B256::ZERO || hash == state.head {
            continue;
        }
        let Some(number) = chain.header_number(hash)? else { return Ok(false) };
        if number >= head_number || !chain.is_canonical(hash, number)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn map_stage_error(error: StageError) -> EngineError {
    match error {
        StageError::Database(error) => EngineError::Database(error),
        other => EngineError::Stage(other),
    }
}
