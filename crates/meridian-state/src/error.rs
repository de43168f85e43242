use std::path::PathBuf;

use meridian_core::Hash;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("I/O on {path:?} failed: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt {what}: {reason}")]
    Corrupt { what: &'static str, reason: String },

    #[error("Storage backend unavailable: {0}")]
    Unavailable(String),

    #[error("Block {0} is already stored")]
    BlockExists(u64),

    #[error("Expected block {expected} next, got {got}")]
    HeightGap { expected: u64, got: u64 },

    #[error("Commit for {commit_hash}@{commit_height} does not certify block {block_hash}@{height}")]
    CommitMismatch {
        height: u64,
        block_hash: Hash,
        commit_height: u64,
        commit_hash: Hash,
    },

    #[error(transparent)]
    Encoding(#[from] meridian_core::CoreError),
}

impl StateError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StateError::Io {
            path: path.into(),
            source,
        }
    }
}
