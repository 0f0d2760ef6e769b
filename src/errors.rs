use std::path::Path;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DBError {
    #[error("Io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Corruption: {0}")]
    Corruption(String),
    #[error("Another compaction reserved an overlapping range")]
    CompactionConflict,
    /// Admission back-pressure. Never surfaced to callers; level-0
    /// admission blocks until the stall clears instead.
    #[error("Level 0 admission is stalled")]
    Stalled,
    #[error("Cannot mutate a read-only engine")]
    ReadOnly,
    #[error("Invalid options: {0}")]
    InvalidOptions(String),
}

pub(crate) fn err_file(err: std::io::Error, path: &Path, msg: &str) -> anyhow::Error {
    anyhow::anyhow!("{}. Path={:?}. Error={}", msg, path, err)
}
