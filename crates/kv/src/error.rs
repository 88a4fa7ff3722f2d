/// Errors surfaced by the key-value layer.
///
/// The in-memory backend is infallible in practice, but the trait surface
/// mirrors what a real storage engine reports so callers are written
/// against fallible transactions from the start.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DatabaseError {
    /// The backend rejected opening a new transaction.
    #[error("failed to open a database transaction")]
    InitTx,
    /// The backend failed to commit a write transaction.
    #[error("failed to commit database transaction")]
    Commit,
    /// A table was accessed with a mismatched type registration.
    #[error("table {0} is registered with a different type")]
    TableType(&'static str),
}
