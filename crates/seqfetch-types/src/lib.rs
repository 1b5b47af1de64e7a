//! Foundation types for seqfetch.
//!
//! This crate provides the identity and data-model types shared by every
//! other seqfetch crate: the reader backends, the format processors, the
//! load-lock registry, the cache and the reply dashboard.
//!
//! # Key Types
//!
//! - [`BlobKey`]: identity + version of a retrievable blob, with a canonical
//!   `partition.subPartition.key[.version]` string form
//! - [`BlobContainer`]: the version-less part of a key, used for locking
//! - [`NeedUpdate`]: bitmask of independently loadable sub-parts
//! - [`ChunkId`]: identifier of an independently loadable chunk
//! - [`Blob`]: a decoded blob, a tree of [`SeqEntry`] records plus chunk
//!   placeholders
//! - [`BlobState`]: private / withdrawn / dead / suppressed flags

pub mod blob;
pub mod error;
pub mod key;
pub mod parts;

pub use blob::{
    Annotation, AssemblyComponent, Blob, BlobState, ChunkContent, ChunkInfo, ChunkTable,
    EntryIndex, Feature, Molecule, SeqEntry, SeqSegment, SeqSummary,
};
pub use error::{TypeError, TypeResult};
pub use key::{BlobContainer, BlobKey};
pub use parts::{ChunkId, NeedUpdate};
