//! A minimal staged-sync pipeline: stages run serially forward, and unwind
//! in reverse registration order.

use crate::{
    error::StageError,
    id::StageId,
    stage::{ExecInput, Stage, UnwindInput},
};
use stele_kv::{tables::StageCheckpoints, DbTxMut};
use stele_primitives::BlockNumber;

/// Serial runner over an ordered set of stages.
pub struct Pipeline<TX> {
    stages: Vec<Box<dyn Stage<TX>>>,
}

impl<TX> std::fmt::Debug for Pipeline<TX> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline").field("stages", &self.stages.len()).finish()
    }
}

impl<TX> Default for Pipeline<TX> {
    fn default() -> Self {
        Self { stages: Vec::new() }
    }
}

impl<TX: DbTxMut> Pipeline<TX> {
    /// Creates an empty pipeline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a stage; stages run in registration order.
    pub fn push(mut self, stage: impl Stage<TX> + 'static) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    /// The recorded progress of a stage.
    pub fn stage_progress(
        &self,
        tx: &TX,
        id: StageId,
    ) -> Result<Option<BlockNumber>, StageError> {
        Ok(tx.get::<StageCheckpoints>(&id.0)?)
    }

    /// Runs every stage forward to `target`, recording per-stage
    /// checkpoints.
    pub async fn run(&mut self, tx: &mut TX, target: BlockNumber) -> Result<(), StageError> {
        let mut previous = (StageId("Target"), target);
        for stage in &mut self.stages {
            let id = stage.id();
            let stage_progress = tx.get::<StageCheckpoints>(&id.0)?;
            tracing::debug!(target: "stages::pipeline", stage = %id, ?stage_progress, target, "running stage");

            let output = stage
                .execute(tx, ExecInput { previous_stage: Some(previous), stage_progress })
                .await?;

            tx.put::<StageCheckpoints>(id.0, output.stage_progress)?;
            previous = (id, output.stage_progress);
        }
        Ok(())
    }

    /// Unwinds every stage back to `unwind_to`, in reverse registration
    /// order.
    pub async fn unwind(
        &mut self,
        tx: &mut TX,
        unwind_to: BlockNumber,
        bad_block: Option<BlockNumber>,
    ) -> Result<(), StageError> {
        for stage in self.stages.iter_mut().rev() {
            let id = stage.id();
            let stage_progress = tx.get::<StageCheckpoints>(&id.0)?.unwrap_or_default();
            if stage_progress <= unwind_to {
                continue;
            }
            tracing::info!(target: "stages::pipeline", stage = %id, stage_progress, unwind_to, "unwinding stage");

            let output = stage
                .unwind(tx, UnwindInput { stage_progress, unwind_to, bad_block })
                .await?;
            tx.put::<StageCheckpoints>(id.0, output.stage_progress)?;
        }
        Ok(())
    }
}
