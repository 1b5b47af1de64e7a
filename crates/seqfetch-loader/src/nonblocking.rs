//! Async facade over [`Orchestrator`].
//!
//! Backend calls block, so every operation runs on tokio's blocking pool.
//! The deduplication guarantees are those of the wrapped orchestrator: a
//! sync caller and an async caller asking for the same blob share one fetch.

use std::sync::Arc;

use seqfetch_types::{BlobKey, ChunkId, EntryIndex, NeedUpdate};

use crate::entry::CacheEntry;
use crate::error::{LoaderError, LoaderResult};
use crate::orchestrator::Orchestrator;

async fn blocking<T, F>(f: F) -> LoaderResult<T>
where
    F: FnOnce() -> LoaderResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| LoaderError::Task(e.to_string()))?
}

/// An [`Orchestrator`] usable from async code.
#[derive(Clone, Debug)]
pub struct AsyncOrchestrator {
    inner: Orchestrator,
}

impl AsyncOrchestrator {
    pub fn new(inner: Orchestrator) -> Self {
        Self { inner }
    }

    /// The wrapped orchestrator, for callers that are already on a blocking
    /// thread.
    pub fn blocking(&self) -> &Orchestrator {
        &self.inner
    }

    pub async fn resolve(&self, id: &str) -> LoaderResult<BlobKey> {
        let inner = self.inner.clone();
        let id = id.to_string();
        blocking(move || inner.resolve(&id)).await
    }

    pub async fn get_blob(&self, id: &str, choice: NeedUpdate) -> LoaderResult<Arc<CacheEntry>> {
        let inner = self.inner.clone();
        let id = id.to_string();
        blocking(move || inner.get_blob(&id, choice)).await
    }

    pub async fn get_blob_by_key(
        &self,
        key: BlobKey,
        choice: NeedUpdate,
    ) -> LoaderResult<Arc<CacheEntry>> {
        let inner = self.inner.clone();
        blocking(move || inner.get_blob_by_key(&key, choice)).await
    }

    /// [`CacheEntry::ensure_loaded`] off the async executor.
    pub async fn ensure_loaded(
        &self,
        entry: Arc<CacheEntry>,
        index: EntryIndex,
        parts: NeedUpdate,
    ) -> LoaderResult<()> {
        blocking(move || entry.ensure_loaded(index, parts)).await
    }

    /// [`CacheEntry::load_chunks`] off the async executor.
    pub async fn load_chunks(
        &self,
        entry: Arc<CacheEntry>,
        ids: Vec<ChunkId>,
    ) -> LoaderResult<usize> {
        blocking(move || entry.load_chunks(&ids)).await
    }
}

impl From<Orchestrator> for AsyncOrchestrator {
    fn from(inner: Orchestrator) -> Self {
        Self::new(inner)
    }
}
