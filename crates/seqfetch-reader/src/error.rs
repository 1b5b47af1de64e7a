use seqfetch_types::TypeError;

/// Errors from reader backends and the reader registry.
///
/// Cloneable so a single failure can be handed to every waiter of a
/// deduplicated fetch.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ReaderError {
    /// The backend connection failed; reconnect and retry.
    #[error("reader {reader}: connection failed: {reason}")]
    Connection { reader: String, reason: String },

    /// The backend does not know the requested id, blob or chunk.
    #[error("reader {reader}: not found: {what}")]
    NotFound { reader: String, what: String },

    /// The backend answered with something it should not have. Not retried.
    #[error("reader {reader}: protocol error: {reason}")]
    Protocol { reader: String, reason: String },

    /// A selection named a reader that is not registered.
    #[error("unknown reader: {0}")]
    UnknownReader(String),

    /// A reader with this name is already registered.
    #[error("duplicate reader name: {0}")]
    DuplicateReader(String),

    /// The selection expanded to no readers at all.
    #[error("reader selection {0:?} is empty")]
    EmptySelection(String),

    /// A stored blob id could not be parsed.
    #[error(transparent)]
    InvalidKey(#[from] TypeError),
}

impl ReaderError {
    /// Returns `true` for failures worth a reconnect and retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }

    /// Returns `true` if the next reader in priority order should be tried.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub(crate) fn not_found(reader: &str, what: impl std::fmt::Display) -> Self {
        Self::NotFound {
            reader: reader.to_string(),
            what: what.to_string(),
        }
    }

    pub(crate) fn connection(reader: &str, reason: impl std::fmt::Display) -> Self {
        Self::Connection {
            reader: reader.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Result alias for reader operations.
pub type ReaderResult<T> = Result<T, ReaderError>;
