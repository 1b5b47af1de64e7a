use seqfetch_types::ChunkId;

/// Errors from format processors.
///
/// Format errors are fatal for the fetch that produced the bytes; the same
/// bytes are never retried.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum FormatError {
    #[error("no processor recognises data starting with {prefix}")]
    UnknownFormat { prefix: String },

    #[error("unsupported version {version} for magic {magic}")]
    UnsupportedVersion { magic: String, version: u16 },

    #[error("{processor}: data truncated ({len} bytes)")]
    Truncated { processor: &'static str, len: usize },

    #[error("{processor}: CRC mismatch: expected {expected:#010x}, got {actual:#010x}")]
    Checksum {
        processor: &'static str,
        expected: u32,
        actual: u32,
    },

    #[error("{processor}: decoded payload exceeds {limit} bytes")]
    TooLarge { processor: &'static str, limit: usize },

    #[error("{processor}: decode failed: {reason}")]
    Decode {
        processor: &'static str,
        reason: String,
    },

    #[error("{processor}: encode failed: {reason}")]
    Encode {
        processor: &'static str,
        reason: String,
    },

    #[error("unknown processor: {0}")]
    UnknownProcessor(String),

    #[error("processor {0} has no skeleton/chunk support")]
    NotSplit(String),

    #[error("chunk payload is {actual}, expected {expected}")]
    ChunkMismatch { expected: ChunkId, actual: ChunkId },

    #[error("processor name already registered: {0}")]
    DuplicateProcessor(&'static str),
}

/// Result alias for format operations.
pub type FormatResult<T> = Result<T, FormatError>;
