//! Forkchoice and chain-reorganization engine.
//!
//! Given a requested `{head, safe, finalized}` triple, the engine computes
//! the common ancestor with the current canonical chain, unwinds the
//! execution pipeline back to it, replays forward over the new canonical
//! segment and publishes the pointers only once everything validated.
//! Partial application is never visible: all work happens in one
//! transaction that is dropped on failure.

mod canonical;
mod forkchoice;

pub use canonical::{read_pointers, CanonicalChain, ForkchoicePointers, ForkchoiceState};
pub use forkchoice::{EngineError, ForkchoiceEngine, ForkchoiceReceipt, ForkchoiceStatus};
