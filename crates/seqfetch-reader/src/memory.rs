use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use bytes::Bytes;
use seqfetch_types::{BlobKey, BlobState, ChunkId};
use tracing::debug;

use crate::error::{ReaderError, ReaderResult};
use crate::traits::{CacheWriter, FetchOutcome, Reader};

/// In-memory, HashMap-based reader backend.
///
/// Intended for tests and embedding. Also implements [`CacheWriter`], so it
/// can serve as a write-through cache in front of slower readers.
///
/// Connection failures can be injected with
/// [`inject_connection_failures`](Self::inject_connection_failures): each
/// injected failure drops the "connection", and every call fails until
/// [`Reader::reconnect`] is invoked.
pub struct MemoryReader {
    name: String,
    ids: RwLock<HashMap<String, BlobKey>>,
    blobs: RwLock<HashMap<BlobKey, FetchOutcome>>,
    chunks: RwLock<HashMap<(BlobKey, ChunkId), Bytes>>,
    latency: RwLock<Duration>,
    concurrency_hint: usize,
    connected: AtomicBool,
    pending_failures: AtomicU32,
    resolve_calls: AtomicUsize,
    blob_fetches: AtomicUsize,
    chunk_fetches: AtomicUsize,
    reconnects: AtomicUsize,
}

impl MemoryReader {
    /// Create a new empty reader.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ids: RwLock::new(HashMap::new()),
            blobs: RwLock::new(HashMap::new()),
            chunks: RwLock::new(HashMap::new()),
            latency: RwLock::new(Duration::ZERO),
            concurrency_hint: 0,
            connected: AtomicBool::new(true),
            pending_failures: AtomicU32::new(0),
            resolve_calls: AtomicUsize::new(0),
            blob_fetches: AtomicUsize::new(0),
            chunk_fetches: AtomicUsize::new(0),
            reconnects: AtomicUsize::new(0),
        }
    }

    /// Set the advisory concurrency hint.
    pub fn with_concurrency_hint(mut self, hint: usize) -> Self {
        self.concurrency_hint = hint;
        self
    }

    /// Delay every fetch by `latency` (simulates a slow backend).
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.write().expect("lock poisoned") = latency;
    }

    /// Map an external identifier to a blob key.
    pub fn insert_id(&self, id: impl Into<String>, key: BlobKey) {
        self.ids.write().expect("lock poisoned").insert(id.into(), key);
    }

    /// Store encoded blob bytes.
    pub fn insert_blob(&self, key: BlobKey, bytes: impl Into<Bytes>) {
        self.blobs
            .write()
            .expect("lock poisoned")
            .insert(key, FetchOutcome::Bytes(bytes.into()));
    }

    /// Mark a blob as private/withdrawn.
    pub fn insert_withheld(&self, key: BlobKey, state: BlobState) {
        self.blobs
            .write()
            .expect("lock poisoned")
            .insert(key, FetchOutcome::Withheld(state));
    }

    /// Store the encoded payload of one chunk.
    pub fn insert_chunk(&self, key: BlobKey, chunk: ChunkId, bytes: impl Into<Bytes>) {
        self.chunks
            .write()
            .expect("lock poisoned")
            .insert((key, chunk), bytes.into());
    }

    /// Make the next `count` calls fail with a connection error.
    pub fn inject_connection_failures(&self, count: u32) {
        self.pending_failures.fetch_add(count, Ordering::SeqCst);
    }

    pub fn resolve_calls(&self) -> usize {
        self.resolve_calls.load(Ordering::SeqCst)
    }

    /// Number of `fetch_blob_bytes` calls that reached the data.
    pub fn blob_fetches(&self) -> usize {
        self.blob_fetches.load(Ordering::SeqCst)
    }

    pub fn chunk_fetches(&self) -> usize {
        self.chunk_fetches.load(Ordering::SeqCst)
    }

    pub fn reconnects(&self) -> usize {
        self.reconnects.load(Ordering::SeqCst)
    }

    pub fn contains_blob(&self, key: &BlobKey) -> bool {
        self.blobs.read().expect("lock poisoned").contains_key(key)
    }

    pub fn contains_chunk(&self, key: &BlobKey, chunk: ChunkId) -> bool {
        self.chunks
            .read()
            .expect("lock poisoned")
            .contains_key(&(*key, chunk))
    }

    /// Simulated round-trip: connection check, injected failure, latency.
    fn round_trip(&self) -> ReaderResult<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(ReaderError::connection(&self.name, "not connected"));
        }
        let injected = self
            .pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            self.connected.store(false, Ordering::SeqCst);
            return Err(ReaderError::connection(&self.name, "connection reset"));
        }
        let latency = *self.latency.read().expect("lock poisoned");
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }
        Ok(())
    }
}

impl Reader for MemoryReader {
    fn name(&self) -> &str {
        &self.name
    }

    fn resolve_id(&self, id: &str) -> ReaderResult<BlobKey> {
        self.round_trip()?;
        self.resolve_calls.fetch_add(1, Ordering::SeqCst);
        self.ids
            .read()
            .expect("lock poisoned")
            .get(id)
            .copied()
            .ok_or_else(|| ReaderError::not_found(&self.name, format!("id {id}")))
    }

    fn fetch_blob_bytes(&self, key: &BlobKey) -> ReaderResult<FetchOutcome> {
        self.round_trip()?;
        self.blob_fetches.fetch_add(1, Ordering::SeqCst);
        let outcome = self
            .blobs
            .read()
            .expect("lock poisoned")
            .get(key)
            .cloned()
            .ok_or_else(|| ReaderError::not_found(&self.name, format!("blob {key}")))?;
        debug!(reader = %self.name, %key, "blob served from memory");
        Ok(outcome)
    }

    fn fetch_chunk_bytes(&self, key: &BlobKey, chunk: ChunkId) -> ReaderResult<Bytes> {
        self.round_trip()?;
        self.chunk_fetches.fetch_add(1, Ordering::SeqCst);
        self.chunks
            .read()
            .expect("lock poisoned")
            .get(&(*key, chunk))
            .cloned()
            .ok_or_else(|| ReaderError::not_found(&self.name, format!("{chunk} of {key}")))
    }

    fn reconnect(&self) -> ReaderResult<()> {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn concurrency_hint(&self) -> usize {
        self.concurrency_hint
    }
}

impl CacheWriter for MemoryReader {
    fn store_blob_bytes(&self, key: &BlobKey, bytes: &[u8]) -> ReaderResult<()> {
        self.insert_blob(*key, Bytes::copy_from_slice(bytes));
        Ok(())
    }

    fn store_chunk_bytes(&self, key: &BlobKey, chunk: ChunkId, bytes: &[u8]) -> ReaderResult<()> {
        self.insert_chunk(*key, chunk, Bytes::copy_from_slice(bytes));
        Ok(())
    }

    fn store_id(&self, id: &str, key: &BlobKey) -> ReaderResult<()> {
        self.insert_id(id, *key);
        Ok(())
    }
}

impl std::fmt::Debug for MemoryReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let blob_count = self.blobs.read().expect("lock poisoned").len();
        f.debug_struct("MemoryReader")
            .field("name", &self.name)
            .field("blob_count", &blob_count)
            .finish()
    }
}
