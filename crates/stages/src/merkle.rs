//! The merkle stage: recomputes the state root incrementally after
//! execution and validates it, together with the receipts root, against
//! every block header in the range.

use crate::{
    error::StageError,
    execution::read_block,
    id::{StageId, MERKLE},
    stage::{ExecInput, ExecOutput, Stage, UnwindInput, UnwindOutput},
};
use alloy_primitives::B256;
use async_trait::async_trait;
use stele_executor::BlockValidationError;
use stele_kv::{tables::Receipts, DbTxMut};
use stele_primitives::Receipt;
use stele_trie::{proofs::calculate_receipts_root, AccountsTrie, StateRoot, StoragesTrie};

/// Validates each executed block by recomputing its state root from the
/// block's change set and its receipts root from the persisted receipts.
///
/// A mismatch is consensus-invalid: the stage reports the offending block
/// so the caller can unwind and reject the chain segment.
#[derive(Debug, Default)]
pub struct MerkleStage;

#[async_trait]
impl<TX: DbTxMut + Sync> Stage<TX> for MerkleStage {
    fn id(&self) -> StageId {
        MERKLE
    }

    async fn execute(&mut self, tx: &mut TX, input: ExecInput) -> Result<ExecOutput, StageError> {
        let last_block = input.stage_progress.unwrap_or_default();
        let target = input.previous_stage_progress();
        if last_block >= target {
            return Ok(ExecOutput { stage_progress: last_block, done: true });
        }

        // Receipts commit per block; the state only exists at the range
        // end, so the state root is validated for the target block.
        for number in last_block + 1..=target {
            let block = read_block(tx, number)?;
            let receipts_root = stored_receipts_root(tx, &block)?;
            if receipts_root != block.header.receipts_root {
                return Err(StageError::Validation {
                    block: number,
                    error: BlockValidationError::ReceiptsRootMismatch {
                        header: block.header.receipts_root,
                        computed: receipts_root,
                    },
                });
            }
        }

        let block = read_block(tx, target)?;
        let (root, updates) =
            StateRoot::incremental_root_with_updates(tx, last_block + 1..=target)?;
        if root != block.header.state_root {
            tracing::warn!(
                target: "stages::merkle",
                number = target,
                computed = ?root,
                header = ?block.header.state_root,
                "state root mismatch",
            );
            return Err(StageError::Validation {
                block: target,
                error: BlockValidationError::StateRootMismatch {
                    header: block.header.state_root,
                    computed: root,
                },
            });
        }
        updates.flush(tx)?;
        tracing::debug!(target: "stages::merkle", number = target, ?root, "validated state commitment");

        Ok(ExecOutput { stage_progress: target, done: true })
    }

    async fn unwind(
        &mut self,
        tx: &mut TX,
        input: UnwindInput,
    ) -> Result<UnwindOutput, StageError> {
        // Stored branch nodes are invalidated wholesale; the next forward
        // pass rebuilds them from the unwound state. Unwind order relative
        // to the execution stage therefore does not matter.
        tracing::info!(target: "stages::merkle", to = input.unwind_to, "clearing stored trie");
        tx.delete_range::<AccountsTrie>(..)?;
        tx.delete_range::<StoragesTrie>(..)?;
        Ok(UnwindOutput { stage_progress: input.unwind_to })
    }
}

/// Recomputes the receipts root of a block from its persisted receipts.
fn stored_receipts_root<TX: DbTxMut>(
    tx: &TX,
    block: &stele_primitives::SealedBlock,
) -> Result<B256, StageError> {
    let number = block.number();
    let stored = tx.walk_range::<Receipts>((number, 0)..=(number, u64::MAX))?;
    let mut receipts = Vec::with_capacity(stored.len());
    for ((_, index), encoded) in stored {
        // These records were written by the execution stage moments ago; a
        // decode failure is corruption, not a recoverable condition.
        let receipt = Receipt::decode_storage(&encoded, block.hash(), number, index)
            .expect("stored receipt must decode");
        receipts.push(receipt);
    }
    Ok(calculate_receipts_root(&receipts))
}
