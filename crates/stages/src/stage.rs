use crate::{error::StageError, id::StageId};
use async_trait::async_trait;
use stele_kv::DbTxMut;
use stele_primitives::BlockNumber;

/// Stage execution input, see [`Stage::execute`].
#[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
pub struct ExecInput {
    /// The stage that ran before this one and the block number it reached.
    pub previous_stage: Option<(StageId, BlockNumber)>,
    /// The progress of this stage the last time it was executed.
    pub stage_progress: Option<BlockNumber>,
}

impl ExecInput {
    /// The progress of the previous stage, i.e. this run's target.
    pub fn previous_stage_progress(&self) -> BlockNumber {
        self.previous_stage.as_ref().map(|(_, number)| *number).unwrap_or_default()
    }
}

/// Stage unwind input, see [`Stage::unwind`].
#[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
pub struct UnwindInput {
    /// The current highest block of the stage.
    pub stage_progress: BlockNumber,
    /// The block to unwind to.
    pub unwind_to: BlockNumber,
    /// The bad block that caused the unwind, if any.
    pub bad_block: Option<BlockNumber>,
}

/// The output of a stage execution.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct ExecOutput {
    /// How far the stage got.
    pub stage_progress: BlockNumber,
    /// Whether the stage is done for this run.
    pub done: bool,
}

/// The output of a stage unwind.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct UnwindOutput {
    /// The block the stage has unwound to.
    pub stage_progress: BlockNumber,
}

/// A segmented part of the syncing process.
///
/// Each stage owns a well-defined task, persists its results through the
/// supplied transaction, and knows how to roll itself forward
/// ([`execute`](Self::execute)) and back ([`unwind`](Self::unwind)). Stages
/// run serially as part of a [`Pipeline`](crate::Pipeline).
#[async_trait]
pub trait Stage<TX: DbTxMut>: Send + Sync {
    /// The unique id of the stage.
    fn id(&self) -> StageId;

    /// Rolls the stage forward to the input's target.
    async fn execute(&mut self, tx: &mut TX, input: ExecInput) -> Result<ExecOutput, StageError>;

    /// Rolls the stage back to `input.unwind_to`.
    async fn unwind(
        &mut self,
        tx: &mut TX,
        input: UnwindInput,
    ) -> Result<UnwindOutput, StageError>;
}
