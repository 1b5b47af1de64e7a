use thiserror::Error;

use crate::parts::ChunkId;

/// Errors produced by type operations.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid blob id {input:?}: {reason}")]
    InvalidBlobId { input: String, reason: String },

    #[error("entry index {index} out of range (blob has {count} entries)")]
    EntryOutOfRange { index: u32, count: u32 },

    #[error("chunk {0} is not declared by this blob")]
    UnknownChunk(ChunkId),

    #[error("chunk {chunk} targets entry {actual}, declared target is {declared}")]
    ChunkTargetMismatch {
        chunk: ChunkId,
        declared: u32,
        actual: u32,
    },
}

/// Result alias for type operations.
pub type TypeResult<T> = Result<T, TypeError>;
