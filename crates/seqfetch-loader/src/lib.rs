//! Retrieval and cache coordination for seqfetch.
//!
//! The [`Orchestrator`] turns external sequence identifiers into blob keys,
//! fetches encoded blobs from a priority-ordered set of readers, decodes them
//! with the format table and keeps the results as shared [`CacheEntry`]s.
//! Every backend call is deduplicated: concurrent requests for the same id,
//! blob container or chunk wait on one in-flight load and share its result
//! or its error.
//!
//! Entries decoded from skeletons load their heavy parts lazily. Callers
//! state which parts they need as a [`NeedUpdate`] mask and only the chunks
//! holding those parts are fetched.
//!
//! # Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use seqfetch_format::ProcessorTable;
//! use seqfetch_loader::{LoaderConfig, Orchestrator};
//! use seqfetch_reader::{MemoryReader, ReaderRegistry};
//! use seqfetch_types::{Blob, BlobKey, NeedUpdate, SeqEntry};
//!
//! let key = BlobKey::new(4, 0, 7157).with_version(6);
//! let formats = ProcessorTable::with_builtin();
//! let reader = Arc::new(MemoryReader::new("remote"));
//! reader.insert_id("NM_000546.6", key);
//! reader.insert_blob(
//!     key,
//!     formats.encode("whole", &Blob::new(key, SeqEntry::sequence("NM_000546.6"))).unwrap(),
//! );
//!
//! let mut registry = ReaderRegistry::new();
//! registry.register("remote", 1, reader).unwrap();
//! let orch = Orchestrator::new(&registry, formats, LoaderConfig::default()).unwrap();
//!
//! let entry = orch.get_blob("NM_000546.6", NeedUpdate::ALL).unwrap();
//! assert_eq!(entry.key(), key);
//! ```

pub mod config;
pub mod entry;
pub mod error;
pub mod nonblocking;
pub mod orchestrator;
pub mod stats;

// Re-exports for convenience.
pub use config::{LoaderConfig, ResolvePolicy};
pub use entry::{CacheEntry, ChunkSource, WITHHELD};
pub use error::{LoaderError, LoaderResult};
pub use nonblocking::AsyncOrchestrator;
pub use orchestrator::{GcReport, Orchestrator, ResolveCandidate};
pub use stats::{LoaderStats, StatsSnapshot};
