//! Reader backends for seqfetch.
//!
//! A reader is a pluggable source of bytes for a [`BlobKey`]. Readers are
//! registered in a [`ReaderRegistry`] under a name and a priority; callers
//! select one, several (`"cache:primary"`) or all configured (`"*"`) of them
//! and get back a [`ReaderSet`] ordered by priority.
//!
//! # Backends
//!
//! - [`MemoryReader`] -- `HashMap`-based reader/writer for tests and embedding
//! - [`DirectoryReader`] -- file-per-blob reader/writer keyed by blob-id string
//!
//! # Failure semantics
//!
//! - [`ReaderError::Connection`] -- call [`Reader::reconnect`] and retry a
//!   bounded number of times (see [`RetryPolicy`])
//! - [`ReaderError::NotFound`] -- try the next reader in priority order
//! - [`ReaderError::Protocol`] -- fatal, surfaced to the caller
//! - [`FetchOutcome::Withheld`] -- private/withdrawn, a terminal status and
//!   not an error
//!
//! # Concurrency
//!
//! Every registered reader gets a [`ConcurrencyGate`] sized from its
//! [`Reader::concurrency_hint`]. Callers enter it around each backend call,
//! so a reader that declares `1` never sees two calls at once.
//!
//! [`BlobKey`]: seqfetch_types::BlobKey

pub mod directory;
pub mod error;
pub mod gate;
pub mod memory;
pub mod registry;
pub mod retry;
pub mod traits;

pub use directory::DirectoryReader;
pub use error::{ReaderError, ReaderResult};
pub use gate::{ConcurrencyGate, GatePermit};
pub use memory::MemoryReader;
pub use registry::{ReaderRegistry, ReaderSet, RegisteredReader};
pub use retry::RetryPolicy;
pub use traits::{CacheWriter, FetchOutcome, Reader};
