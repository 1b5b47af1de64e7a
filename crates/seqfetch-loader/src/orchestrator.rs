use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use bytes::Bytes;
use seqfetch_format::{Decoded, ProcessorTable};
use seqfetch_lock::{Acquired, LoadLockRegistry};
use seqfetch_reader::{
    CacheWriter, FetchOutcome, Reader, ReaderError, ReaderRegistry, ReaderResult, ReaderSet,
    RegisteredReader, RetryPolicy,
};
use seqfetch_types::{BlobContainer, BlobKey, ChunkContent, ChunkId, NeedUpdate};
use tracing::{debug, info, warn};

use crate::config::{LoaderConfig, ResolvePolicy};
use crate::entry::{CacheEntry, ChunkSource};
use crate::error::{LoaderError, LoaderResult};
use crate::stats::{LoaderStats, StatsSnapshot};

/// One reader's answer when several readers are asked to resolve an id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolveCandidate {
    pub reader: String,
    pub priority: u32,
    pub key: BlobKey,
}

/// Outcome of a garbage-collection pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GcReport {
    /// Entries looked at.
    pub examined: usize,
    /// Keys of the evicted entries, sorted.
    pub evicted: Vec<BlobKey>,
}

type EntryTable = HashMap<BlobContainer, Arc<CacheEntry>>;

/// Shared state behind an [`Orchestrator`] and its clones.
struct LoaderCore {
    readers: ReaderSet,
    formats: ProcessorTable,
    config: LoaderConfig,
    retry: RetryPolicy,
    ids: RwLock<HashMap<String, BlobKey>>,
    entries: RwLock<EntryTable>,
    id_locks: LoadLockRegistry<String, BlobKey, LoaderError>,
    blob_locks: LoadLockRegistry<BlobContainer, Arc<CacheEntry>, LoaderError>,
    chunk_locks: LoadLockRegistry<(BlobKey, ChunkId), ChunkContent, LoaderError>,
    stats: LoaderStats,
}

fn lock_registry<K, T>(shards: Option<usize>, hint: usize) -> LoadLockRegistry<K, T, LoaderError>
where
    K: Eq + Hash + Clone + fmt::Debug,
    T: Clone,
{
    match shards {
        Some(n) => LoadLockRegistry::with_shards(n),
        None => LoadLockRegistry::for_concurrency(hint),
    }
}

/// Run `load` as the single owner of `key`, or wait for the current owner.
///
/// The owner re-checks the cache first: a previous owner may have finished
/// between the caller's cache miss and its acquire.
fn run_locked<K, T>(
    registry: &LoadLockRegistry<K, T, LoaderError>,
    key: K,
    timeout: Duration,
    recheck: impl FnOnce() -> Option<T>,
    load: impl FnOnce() -> LoaderResult<T>,
) -> LoaderResult<T>
where
    K: Eq + Hash + Clone + fmt::Debug,
    T: Clone,
{
    match registry.acquire(key.clone()) {
        Acquired::Owner(guard) => {
            if let Some(value) = recheck() {
                guard.publish(value.clone());
                return Ok(value);
            }
            match load() {
                Ok(value) => {
                    guard.publish(value.clone());
                    Ok(value)
                }
                Err(err) => {
                    guard.fail(err.clone());
                    Err(err)
                }
            }
        }
        Acquired::Waiter(handle) => handle
            .wait_timeout(timeout)
            .map_err(|e| LoaderError::from_lock(e, format!("{key:?}"))),
    }
}

impl LoaderCore {
    fn cached_id(&self, id: &str) -> Option<BlobKey> {
        self.ids
            .read()
            .expect("id cache lock poisoned")
            .get(id)
            .copied()
    }

    /// The cached entry for `key`'s container, unless `key` is fresher.
    fn fresh_entry(&self, key: &BlobKey) -> Option<Arc<CacheEntry>> {
        self.entries
            .read()
            .expect("entry table lock poisoned")
            .get(&key.container())
            .filter(|entry| !key.is_newer_than(&entry.key()))
            .cloned()
    }

    /// Call `op` against one reader, reconnecting after every connection
    /// failure and retrying within the retry budget.
    ///
    /// Each call and each reconnect holds a slot in the reader's gate; the
    /// backoff sleep does not.
    fn with_retries<T>(
        &self,
        reader: &RegisteredReader,
        mut op: impl FnMut(&dyn Reader) -> ReaderResult<T>,
    ) -> ReaderResult<T> {
        let mut attempt = 0;
        loop {
            let result = {
                let _permit = reader.enter();
                op(reader.reader.as_ref())
            };
            match result {
                Err(err) if err.is_retryable() => {
                    let reconnected = {
                        let _permit = reader.enter();
                        reader.reader.reconnect()
                    };
                    if let Err(e) = reconnected {
                        warn!(reader = %reader.name, error = %e, "reconnect failed");
                    }
                    if attempt >= self.retry.max_retries {
                        return Err(err);
                    }
                    attempt += 1;
                    LoaderStats::bump(&self.stats.retries);
                    warn!(reader = %reader.name, attempt, error = %err, "connection failed, retrying");
                    std::thread::sleep(self.retry.delay_for_attempt(attempt));
                }
                other => return other,
            }
        }
    }

    /// Walk the readers in priority order. `NotFound` moves on to the next
    /// reader, so does an exhausted connection failure; anything else is
    /// fatal. If no reader answers, the last connection failure wins over
    /// `not_found`.
    fn first_answer<T>(
        &self,
        not_found: impl FnOnce() -> LoaderError,
        mut op: impl FnMut(&dyn Reader) -> ReaderResult<T>,
    ) -> LoaderResult<(T, &RegisteredReader)> {
        let mut last_err = None;
        for reader in self.readers.iter() {
            match self.with_retries(reader, &mut op) {
                Ok(value) => return Ok((value, reader)),
                Err(err) if err.is_not_found() => {
                    debug!(reader = %reader.name, error = %err, "not found, trying next reader");
                }
                Err(err) if err.is_retryable() => {
                    warn!(reader = %reader.name, error = %err, "reader unavailable, trying next reader");
                    last_err = Some(err);
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(last_err.map(LoaderError::from).unwrap_or_else(not_found))
    }

    // -----------------------------------------------------------------------
    // Resolution
    // -----------------------------------------------------------------------

    fn resolve_uncached(&self, id: &str) -> LoaderResult<BlobKey> {
        LoaderStats::bump(&self.stats.resolutions);
        let (key, source) = match self.config.resolve_policy {
            ResolvePolicy::FirstFound => {
                let (key, reader) =
                    self.first_answer(|| LoaderError::NotFound(id.to_string()), |r| r.resolve_id(id))?;
                (key, reader.name.clone())
            }
            ResolvePolicy::Consensus => {
                let candidates = self.resolve_candidates(id)?;
                let winner = Orchestrator::resolve_conflict(id, &candidates)?;
                (winner.key, winner.reader)
            }
        };
        self.ids
            .write()
            .expect("id cache lock poisoned")
            .insert(id.to_string(), key);
        debug!(id, %key, reader = %source, "id resolved");
        self.store_id_through(&source, id, &key);
        Ok(key)
    }

    fn resolve_candidates(&self, id: &str) -> LoaderResult<Vec<ResolveCandidate>> {
        let mut candidates = Vec::new();
        let mut last_err = None;
        for reader in self.readers.iter() {
            match self.with_retries(reader, |r| r.resolve_id(id)) {
                Ok(key) => candidates.push(ResolveCandidate {
                    reader: reader.name.clone(),
                    priority: reader.priority,
                    key,
                }),
                Err(err) if err.is_not_found() => {}
                Err(err) if err.is_retryable() => {
                    warn!(reader = %reader.name, error = %err, "reader unavailable during consensus");
                    last_err = Some(err);
                }
                Err(err) => return Err(err.into()),
            }
        }
        match (candidates.is_empty(), last_err) {
            (true, Some(err)) => Err(err.into()),
            _ => Ok(candidates),
        }
    }

    // -----------------------------------------------------------------------
    // Fetching
    // -----------------------------------------------------------------------

    fn fetch_encoded(&self, key: &BlobKey) -> LoaderResult<(FetchOutcome, &RegisteredReader)> {
        let (outcome, reader) = self.first_answer(
            || LoaderError::NotFound(key.to_string()),
            |r| {
                LoaderStats::bump(&self.stats.backend_fetches);
                r.fetch_blob_bytes(key)
            },
        )?;
        if let FetchOutcome::Bytes(bytes) = &outcome {
            LoaderStats::add(&self.stats.bytes_fetched, bytes.len() as u64);
            info!(reader = %reader.name, %key, bytes = bytes.len(), "blob fetched");
        }
        Ok((outcome, reader))
    }

    fn build_entry(self: &Arc<Self>, key: &BlobKey) -> LoaderResult<Arc<CacheEntry>> {
        let source: Weak<dyn ChunkSource> = Arc::downgrade(self) as Weak<dyn ChunkSource>;
        let (outcome, reader) = self.fetch_encoded(key)?;
        let entry = match outcome {
            FetchOutcome::Bytes(bytes) => {
                let decoded = self.formats.decode(&bytes)?;
                if decoded.blob.key != *key {
                    debug!(requested = %key, decoded = %decoded.blob.key, "decoded blob carries a different key");
                }
                self.write_blob_through(reader, key, &bytes, &decoded);
                CacheEntry::new(*key, decoded, source)
            }
            FetchOutcome::Withheld(state) => {
                info!(reader = %reader.name, %key, ?state, "blob withheld");
                CacheEntry::withheld(*key, state, source)
            }
        };

        let entry = Arc::new(entry);
        let replaced = self
            .entries
            .write()
            .expect("entry table lock poisoned")
            .insert(key.container(), Arc::clone(&entry));
        if let Some(old) = replaced {
            info!(old = %old.key(), new = %key, "cached entry replaced by newer version");
        }
        self.maybe_gc();
        Ok(entry)
    }

    fn fetch_chunk_contents(
        &self,
        key: &BlobKey,
        processor: &'static str,
        ids: &[ChunkId],
    ) -> LoaderResult<Vec<ChunkContent>> {
        let (payloads, reader) = self.first_answer(
            || LoaderError::NotFound(format!("chunks of {key}")),
            |r| r.fetch_chunks_bytes(key, ids),
        )?;
        LoaderStats::add(&self.stats.chunk_fetches, payloads.len() as u64);

        let mut decoded = HashMap::with_capacity(payloads.len());
        for (id, bytes) in &payloads {
            LoaderStats::add(&self.stats.bytes_fetched, bytes.len() as u64);
            decoded.insert(*id, self.formats.decode_chunk(processor, bytes, *id)?);
        }
        self.write_chunks_through(reader, key, &payloads);
        debug!(reader = %reader.name, %key, chunks = ids.len(), "chunks fetched");

        ids.iter()
            .map(|id| {
                decoded
                    .remove(id)
                    .ok_or_else(|| LoaderError::NotFound(format!("{id} of {key}")))
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Write-through
    // -----------------------------------------------------------------------

    /// Writers that should receive data fetched from `source`. Nothing is
    /// written back when the source is itself a cache.
    fn writers_except<'a>(
        &'a self,
        source: &'a str,
    ) -> impl Iterator<Item = (&'a RegisteredReader, &'a Arc<dyn CacheWriter>)> + 'a {
        let from_cache = self
            .readers
            .iter()
            .any(|r| r.name == source && r.reader.is_cache());
        self.readers
            .iter()
            .filter(move |r| !from_cache && r.name != source)
            .filter_map(|r| r.writer.as_ref().map(|w| (r, w)))
    }

    fn write_failed(&self, writer: &str, what: &str, err: &ReaderError) {
        LoaderStats::bump(&self.stats.write_failures);
        warn!(writer, what, error = %err, "write-through failed");
    }

    fn store_id_through(&self, source: &str, id: &str, key: &BlobKey) {
        for (target, writer) in self.writers_except(source) {
            let _permit = target.enter();
            if let Err(e) = writer.store_id(id, key) {
                self.write_failed(&target.name, "id", &e);
            }
        }
    }

    fn write_blob_through(
        &self,
        source: &RegisteredReader,
        key: &BlobKey,
        bytes: &Bytes,
        decoded: &Decoded,
    ) {
        let mut writers = self.writers_except(&source.name).peekable();
        if writers.peek().is_none() {
            return;
        }
        // Skeletons are stored as fetched so their chunks stay loadable.
        let keep_raw = decoded.processor == self.config.write_through_format
            || self
                .formats
                .get(decoded.processor)
                .is_ok_and(|p| p.is_split());
        let payload: Cow<'_, [u8]> = if keep_raw {
            Cow::Borrowed(&bytes[..])
        } else {
            match self
                .formats
                .encode(&self.config.write_through_format, &decoded.blob)
            {
                Ok(encoded) => Cow::Owned(encoded),
                Err(e) => {
                    LoaderStats::bump(&self.stats.write_failures);
                    warn!(%key, error = %e, "re-encoding for write-through failed");
                    return;
                }
            }
        };
        for (target, writer) in writers {
            let _permit = target.enter();
            match writer.store_blob_bytes(key, &payload) {
                Ok(()) => debug!(writer = %target.name, %key, "blob written through"),
                Err(e) => self.write_failed(&target.name, "blob", &e),
            }
        }
    }

    fn write_chunks_through(&self, source: &RegisteredReader, key: &BlobKey, payloads: &[(ChunkId, Bytes)]) {
        for (target, writer) in self.writers_except(&source.name) {
            let _permit = target.enter();
            for (id, bytes) in payloads {
                if let Err(e) = writer.store_chunk_bytes(key, *id, bytes) {
                    self.write_failed(&target.name, "chunk", &e);
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Eviction
    // -----------------------------------------------------------------------

    fn maybe_gc(&self) {
        let threshold = self.config.gc_threshold;
        if threshold == 0 {
            return;
        }
        let len = self.entries.read().expect("entry table lock poisoned").len();
        if len > threshold {
            debug!(len, threshold, "entry count over threshold");
            self.gc();
        }
    }

    fn gc(&self) -> GcReport {
        let mut entries = self.entries.write().expect("entry table lock poisoned");
        let examined = entries.len();
        let mut evicted = Vec::new();
        entries.retain(|container, entry| {
            let idle = Arc::strong_count(entry) == 1
                && !entry.is_busy()
                && !self.blob_locks.is_pending(container);
            if idle {
                evicted.push(entry.key());
            }
            !idle
        });
        drop(entries);

        evicted.sort();
        LoaderStats::add(&self.stats.evictions, evicted.len() as u64);
        info!(examined, evicted = evicted.len(), "gc pass finished");
        GcReport { examined, evicted }
    }
}

impl ChunkSource for LoaderCore {
    /// Chunk loads are deduplicated per `(key, chunk)`: chunks this call
    /// owns are fetched in one batch and published before it waits on
    /// chunks owned by someone else, so two overlapping batches never wait
    /// on each other.
    fn fetch_chunks(
        &self,
        key: &BlobKey,
        processor: &'static str,
        chunks: &[ChunkId],
    ) -> LoaderResult<Vec<ChunkContent>> {
        let mut owned = Vec::new();
        let mut waiting = Vec::new();
        for &id in chunks {
            match self.chunk_locks.acquire((*key, id)) {
                Acquired::Owner(guard) => owned.push((id, guard)),
                Acquired::Waiter(handle) => waiting.push((id, handle)),
            }
        }

        let mut loaded: HashMap<ChunkId, ChunkContent> = HashMap::with_capacity(chunks.len());
        if !owned.is_empty() {
            let ids: Vec<ChunkId> = owned.iter().map(|(id, _)| *id).collect();
            match self.fetch_chunk_contents(key, processor, &ids) {
                Ok(contents) => {
                    for ((id, guard), content) in owned.into_iter().zip(contents) {
                        guard.publish(content.clone());
                        loaded.insert(id, content);
                    }
                }
                Err(err) => {
                    for (_, guard) in owned {
                        guard.fail(err.clone());
                    }
                    return Err(err);
                }
            }
        }
        for (id, handle) in waiting {
            let content = handle
                .wait_timeout(self.config.lock_wait_timeout())
                .map_err(|e| LoaderError::from_lock(e, format!("{id} of {key}")))?;
            loaded.insert(id, content);
        }

        chunks
            .iter()
            .map(|id| {
                loaded
                    .get(id)
                    .cloned()
                    .ok_or_else(|| LoaderError::NotFound(format!("{id} of {key}")))
            })
            .collect()
    }

    fn refetch(&self, key: &BlobKey) -> LoaderResult<Decoded> {
        match self.fetch_encoded(key)? {
            (FetchOutcome::Bytes(bytes), _) => Ok(self.formats.decode(&bytes)?),
            (FetchOutcome::Withheld(state), _) => Err(LoaderError::Withheld { key: *key, state }),
        }
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Single entry point for resolving identifiers and loading blobs.
///
/// Resolutions, blob fetches and chunk fetches each go through their own
/// [`LoadLockRegistry`], so at most one backend call per id, container or
/// chunk is in flight at any time. Cheap to clone; clones share one cache.
#[derive(Clone)]
pub struct Orchestrator {
    core: Arc<LoaderCore>,
}

impl Orchestrator {
    /// Select readers from `registry` according to `config` and build an
    /// orchestrator over them.
    pub fn new(
        registry: &ReaderRegistry,
        formats: ProcessorTable,
        config: LoaderConfig,
    ) -> LoaderResult<Self> {
        config.validate()?;
        let readers = registry.select(&config.readers).map_err(|e| match e {
            ReaderError::EmptySelection(_) => LoaderError::NoReaders,
            other => other.into(),
        })?;
        formats.get(&config.write_through_format)?;

        let hint = readers.concurrency_hint();
        let shards = config.lock_shards;
        info!(readers = ?readers.names(), hint, ?shards, "orchestrator ready");
        Ok(Self {
            core: Arc::new(LoaderCore {
                retry: config.retry_policy(),
                id_locks: lock_registry(shards, hint),
                blob_locks: lock_registry(shards, hint),
                chunk_locks: lock_registry(shards, hint),
                ids: RwLock::new(HashMap::new()),
                entries: RwLock::new(HashMap::new()),
                stats: LoaderStats::default(),
                readers,
                formats,
                config,
            }),
        })
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.core.config
    }

    /// Names of the selected readers, in priority order.
    pub fn reader_names(&self) -> Vec<&str> {
        self.core.readers.names()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.core.stats.snapshot()
    }

    /// Resolve an external identifier to a blob key.
    ///
    /// Results are cached; concurrent resolutions of the same id reach the
    /// backends once.
    pub fn resolve(&self, id: &str) -> LoaderResult<BlobKey> {
        let core = &self.core;
        if let Some(key) = core.cached_id(id) {
            LoaderStats::bump(&core.stats.resolve_cache_hits);
            return Ok(key);
        }
        run_locked(
            &core.id_locks,
            id.to_string(),
            core.config.lock_wait_timeout(),
            || core.cached_id(id),
            || core.resolve_uncached(id),
        )
    }

    /// Forget the cached resolution of `id`, so the next request asks the
    /// backends again and picks up newer versions.
    pub fn invalidate_id(&self, id: &str) -> bool {
        self.core
            .ids
            .write()
            .expect("id cache lock poisoned")
            .remove(id)
            .is_some()
    }

    /// Resolve `id` and return its cache entry with at least the parts in
    /// `choice` loaded.
    pub fn get_blob(&self, id: &str, choice: NeedUpdate) -> LoaderResult<Arc<CacheEntry>> {
        let key = self.resolve(id)?;
        self.get_blob_by_key(&key, choice)
    }

    /// Return the cache entry for `key` with at least the parts in `choice`
    /// loaded.
    ///
    /// A cached entry that is not dirty for `choice` is returned without
    /// any backend call. A cached entry of an older version than `key` is
    /// replaced.
    pub fn get_blob_by_key(
        &self,
        key: &BlobKey,
        choice: NeedUpdate,
    ) -> LoaderResult<Arc<CacheEntry>> {
        let core = &self.core;
        let entry = match core.fresh_entry(key) {
            Some(entry) if !entry.is_dirty_for(choice) => {
                LoaderStats::bump(&core.stats.cache_hits);
                debug!(%key, "cache hit");
                return Ok(entry);
            }
            Some(entry) => entry,
            None => run_locked(
                &core.blob_locks,
                key.container(),
                core.config.lock_wait_timeout(),
                || core.fresh_entry(key),
                || core.build_entry(key),
            )?,
        };
        if entry.is_dirty_for(choice) {
            entry.ensure_loaded(0, choice)?;
        }
        Ok(entry)
    }

    /// The cached entry for `key`'s container, without any backend call.
    pub fn peek(&self, key: &BlobKey) -> Option<Arc<CacheEntry>> {
        self.core
            .entries
            .read()
            .expect("entry table lock poisoned")
            .get(&key.container())
            .cloned()
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.core
            .entries
            .read()
            .expect("entry table lock poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evict the entry for `key`'s container. Refuses while a fetch for
    /// that container is in flight; returns whether an entry was removed.
    pub fn drop_blob(&self, key: &BlobKey) -> bool {
        let container = key.container();
        if self.core.blob_locks.is_pending(&container) {
            debug!(%key, "drop refused, load in flight");
            return false;
        }
        let removed = self
            .core
            .entries
            .write()
            .expect("entry table lock poisoned")
            .remove(&container)
            .is_some();
        if removed {
            LoaderStats::bump(&self.core.stats.evictions);
            debug!(%key, "entry dropped");
        }
        removed
    }

    /// Evict every entry nobody outside the cache holds, that has no load
    /// in progress and whose fetch lock is not pending.
    pub fn gc(&self) -> GcReport {
        self.core.gc()
    }

    /// Pick among conflicting resolutions of `id`: the candidate from the
    /// highest-priority (lowest number) reader wins, ties go to the highest
    /// version, then to the reader name.
    pub fn resolve_conflict(id: &str, candidates: &[ResolveCandidate]) -> LoaderResult<ResolveCandidate> {
        let winner = candidates
            .iter()
            .min_by(|a, b| {
                a.priority
                    .cmp(&b.priority)
                    .then_with(|| b.key.version.cmp(&a.key.version))
                    .then_with(|| a.reader.cmp(&b.reader))
            })
            .cloned()
            .ok_or_else(|| LoaderError::NotFound(id.to_string()))?;
        if candidates.iter().any(|c| c.key != winner.key) {
            warn!(id, winner = %winner.key, reader = %winner.reader, "readers disagree on id");
        }
        Ok(winner)
    }
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("readers", &self.core.readers.names())
            .field("entries", &self.len())
            .finish_non_exhaustive()
    }
}
