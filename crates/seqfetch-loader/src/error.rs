use std::fmt;
use std::time::Duration;

use seqfetch_format::FormatError;
use seqfetch_lock::LockError;
use seqfetch_reader::ReaderError;
use seqfetch_types::{BlobKey, BlobState, TypeError};

/// Errors surfaced by the orchestrator and cache entries.
///
/// Cloneable: a single failure is handed to every waiter of a deduplicated
/// fetch.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum LoaderError {
    /// A backend failed. `Connection` failures arrive here only after the
    /// retry budget is spent.
    #[error(transparent)]
    Reader(#[from] ReaderError),

    /// The fetched bytes could not be decoded. Never retried.
    #[error(transparent)]
    Format(#[from] FormatError),

    /// Fetched data does not fit the cached record.
    #[error(transparent)]
    Data(#[from] TypeError),

    /// No selected backend knows the id or key.
    #[error("not found at any backend: {0}")]
    NotFound(String),

    /// The reader selection is empty.
    #[error("no readers selected")]
    NoReaders,

    /// A waiter gave up before the owning fetch published.
    #[error("timed out after {waited:?} waiting for the load of {what}")]
    LockTimeout { what: String, waited: Duration },

    /// The owning fetch went away without publishing.
    #[error("load of {0} was abandoned by its owner")]
    Abandoned(String),

    /// A reload found the blob withheld.
    #[error("blob {key} is withheld ({state:?})")]
    Withheld { key: BlobKey, state: BlobState },

    /// A cache entry outlived the orchestrator that created it.
    #[error("cache entry {0} outlived its loader")]
    SourceDropped(BlobKey),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// A blocking task of the async facade failed to complete.
    #[error("background task failed: {0}")]
    Task(String),
}

impl LoaderError {
    /// Returns `true` for failures that were caused by a backend connection.
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Reader(e) if e.is_retryable())
    }

    /// Flatten the outcome of waiting on a load lock.
    pub(crate) fn from_lock(err: LockError<LoaderError>, what: impl fmt::Display) -> Self {
        match err {
            LockError::Failed(e) => e,
            LockError::Abandoned => Self::Abandoned(what.to_string()),
            LockError::Timeout(waited) => Self::LockTimeout {
                what: what.to_string(),
                waited,
            },
        }
    }
}

/// Result alias for loader operations.
pub type LoaderResult<T> = Result<T, LoaderError>;
