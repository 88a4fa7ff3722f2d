//! Versioned world state over the key-value layer.
//!
//! [`StateStore`] serves reads and applies writes to the plain and hashed
//! state tables, recording pre-images into a per-block [`ChangeSetWriter`]
//! so a block's effects can be undone exactly. [`unwind_state`] replays
//! recorded change sets in reverse during chain reorganizations.

mod changeset;
mod store;
mod unwind;

pub use changeset::ChangeSetWriter;
pub use store::StateStore;
pub use unwind::unwind_state;
