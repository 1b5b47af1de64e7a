use bytes::Bytes;
use seqfetch_types::{BlobKey, BlobState, ChunkId};

use crate::error::ReaderResult;

/// What a reader hands back for a blob fetch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The complete encoded blob (whole record or skeleton).
    Bytes(Bytes),
    /// The blob exists but is private or withdrawn. Terminal, not an error.
    Withheld(BlobState),
}

/// A pluggable source of blob bytes.
///
/// All implementations must satisfy these invariants:
/// - A fetch is atomic: it returns the whole byte payload or an error.
/// - `NotFound` means "this backend does not know it"; the caller moves on
///   to the next backend.
/// - `Connection` means the caller may [`reconnect`](Reader::reconnect) and
///   retry.
/// - Readers never decode what they return.
pub trait Reader: Send + Sync {
    /// Short name used in logs and errors.
    fn name(&self) -> &str;

    /// Resolve an external sequence identifier to the key of the blob that
    /// holds it.
    fn resolve_id(&self, id: &str) -> ReaderResult<BlobKey>;

    /// Fetch the encoded blob for `key`.
    fn fetch_blob_bytes(&self, key: &BlobKey) -> ReaderResult<FetchOutcome>;

    /// Fetch the encoded payload of one chunk of `key`.
    fn fetch_chunk_bytes(&self, key: &BlobKey, chunk: ChunkId) -> ReaderResult<Bytes>;

    /// Fetch several chunks of the same blob.
    ///
    /// Default implementation calls `fetch_chunk_bytes()` for each id.
    /// Backends may override to batch round-trips.
    fn fetch_chunks_bytes(
        &self,
        key: &BlobKey,
        chunks: &[ChunkId],
    ) -> ReaderResult<Vec<(ChunkId, Bytes)>> {
        chunks
            .iter()
            .map(|&chunk| Ok((chunk, self.fetch_chunk_bytes(key, chunk)?)))
            .collect()
    }

    /// Re-establish the backend connection after a `Connection` failure.
    fn reconnect(&self) -> ReaderResult<()> {
        Ok(())
    }

    /// Advisory parallelism level.
    ///
    /// `0` means no synchronization is needed, `1` means the reader is not
    /// safe for concurrent use, `N` means up to `N` concurrent operations.
    fn concurrency_hint(&self) -> usize {
        0
    }

    /// Returns `true` for local caches, which are never written back to
    /// from their own fetches.
    fn is_cache(&self) -> bool {
        false
    }
}

/// A backend that can also persist what other readers fetched.
pub trait CacheWriter: Send + Sync {
    /// Store the encoded bytes of a blob under its key.
    fn store_blob_bytes(&self, key: &BlobKey, bytes: &[u8]) -> ReaderResult<()>;

    /// Store the encoded payload of one chunk.
    fn store_chunk_bytes(&self, key: &BlobKey, chunk: ChunkId, bytes: &[u8]) -> ReaderResult<()>;

    /// Remember which blob an external identifier resolved to.
    fn store_id(&self, id: &str, key: &BlobKey) -> ReaderResult<()>;
}
