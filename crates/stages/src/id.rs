/// The unique string id of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StageId(pub &'static str);

/// The execution stage.
pub const EXECUTION: StageId = StageId("Execution");
/// The state-root (merkle) stage.
pub const MERKLE: StageId = StageId("MerkleExecute");

impl std::fmt::Display for StageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0)
    }
}
