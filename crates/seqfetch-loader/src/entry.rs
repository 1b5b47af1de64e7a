use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};

use seqfetch_format::Decoded;
use seqfetch_types::{
    Blob, BlobKey, BlobState, ChunkContent, ChunkId, EntryIndex, NeedUpdate, TypeError,
};
use tracing::debug;

use crate::error::{LoaderError, LoaderResult};

/// Processor name recorded for entries created from a withheld outcome.
pub const WITHHELD: &str = "withheld";

/// Where a cache entry gets the pieces it does not hold yet.
pub trait ChunkSource: Send + Sync {
    /// Fetch and decode chunks of `key` with the processor that decoded
    /// its skeleton, in the order requested.
    fn fetch_chunks(
        &self,
        key: &BlobKey,
        processor: &'static str,
        chunks: &[ChunkId],
    ) -> LoaderResult<Vec<ChunkContent>>;

    /// Fetch and decode the whole blob again.
    fn refetch(&self, key: &BlobKey) -> LoaderResult<Decoded>;
}

// ---------------------------------------------------------------------------
// Entry tree state
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Default)]
struct EntryNode {
    parent: Option<EntryIndex>,
    need: NeedUpdate,
    /// Child bits received from below that still have to reach the
    /// parent. Pushed one level on the next access.
    pending_up: NeedUpdate,
    loading: NeedUpdate,
}

struct EntryState {
    blob: Blob,
    nodes: Vec<EntryNode>,
    /// Child indices per node, in pre-order.
    kids: Vec<Vec<EntryIndex>>,
    /// Own-part classes whose invalidation is signalled to the parent.
    propagate: NeedUpdate,
    dirty_index: bool,
}

impl EntryState {
    fn new(blob: Blob) -> Self {
        let mut nodes = Vec::with_capacity(blob.entry_count() as usize);
        let mut kids: Vec<Vec<EntryIndex>> = Vec::with_capacity(nodes.capacity());
        let mut annotated = false;
        blob.root.walk(&mut |index, parent, entry| {
            nodes.push(EntryNode {
                parent,
                ..Default::default()
            });
            kids.push(Vec::new());
            if let Some(parent) = parent {
                kids[parent as usize].push(index);
            }
            annotated |= !entry.annotations.is_empty();
        });

        let mut state = Self {
            blob,
            nodes,
            kids,
            propagate: NeedUpdate::ALL,
            dirty_index: annotated,
        };
        for index in 0..state.nodes.len() as EntryIndex {
            let held = state.blob.unloaded_parts(index);
            state.mark(index, held);
        }
        state
    }

    fn check(&self, index: EntryIndex) -> LoaderResult<()> {
        if (index as usize) < self.nodes.len() {
            Ok(())
        } else {
            Err(TypeError::EntryOutOfRange {
                index,
                count: self.nodes.len() as u32,
            }
            .into())
        }
    }

    /// Set own bits on `index` and, for propagating classes, the matching
    /// child bits on its parent. Never goes further than one level.
    fn mark(&mut self, index: EntryIndex, parts: NeedUpdate) {
        let own = parts.own();
        if own.is_empty() {
            return;
        }
        let node = &mut self.nodes[index as usize];
        node.need |= own;
        let parent = node.parent;

        let up = (own & self.propagate).child();
        if let (Some(parent), false) = (parent, up.is_empty()) {
            let parent = &mut self.nodes[parent as usize];
            parent.need |= up;
            parent.pending_up |= up;
        }
    }

    /// Push pending child bits up. Children have higher pre-order indices
    /// than their parents, so one descending sweep reaches the root.
    fn settle(&mut self) {
        for index in (0..self.nodes.len()).rev() {
            let up = std::mem::take(&mut self.nodes[index].pending_up);
            if up.is_empty() {
                continue;
            }
            if let Some(parent) = self.nodes[index].parent {
                let parent = &mut self.nodes[parent as usize];
                parent.need |= up;
                parent.pending_up |= up;
            }
        }
    }

    fn children(&self, index: EntryIndex) -> impl Iterator<Item = (EntryIndex, &EntryNode)> + '_ {
        self.kids[index as usize]
            .iter()
            .map(|&i| (i, &self.nodes[i as usize]))
    }

    /// Collect `(node, own parts)` pairs that are dirty for `want`, walking
    /// into children only through child bits that are set.
    fn targets(&self, index: EntryIndex, want: NeedUpdate, out: &mut Vec<(EntryIndex, NeedUpdate)>) {
        let node = &self.nodes[index as usize];
        let own = node.need & want.own();
        if !own.is_empty() {
            out.push((index, own));
        }
        let below = node.need.children() & want.children();
        if below.is_empty() {
            return;
        }
        let next = below.from_child() | below;
        for (child, _) in self.children(index) {
            self.targets(child, next, out);
        }
    }

    /// Clear child bits no child still accounts for.
    fn prune_child_bits(&mut self) {
        for index in (0..self.nodes.len()).rev() {
            let claimed = self.nodes[index].need.children();
            if claimed.is_empty() {
                continue;
            }
            let still = self
                .children(index as EntryIndex)
                .fold(NeedUpdate::NONE, |acc, (_, n)| {
                    acc | n.need.own().child() | n.need.children()
                });
            let node = &mut self.nodes[index];
            node.need = node.need.difference(claimed.difference(still));
        }
    }

    fn attach(&mut self, content: ChunkContent) -> LoaderResult<NeedUpdate> {
        let target = content.target;
        let spliced = self.blob.attach_chunk(content)?;
        if spliced.contains(NeedUpdate::ANNOTATION) {
            self.dirty_index = true;
        }
        let done = spliced.difference(self.blob.unloaded_parts(target));
        if let Some(node) = self.nodes.get_mut(target as usize) {
            node.need = node.need.difference(done.difference(node.loading));
        }
        Ok(spliced)
    }

    fn apply(
        &mut self,
        contents: Vec<ChunkContent>,
        fresh: Option<&Blob>,
        reload: &[(EntryIndex, NeedUpdate)],
    ) -> LoaderResult<()> {
        for content in contents {
            self.attach(content)?;
        }
        let Some(fresh) = fresh else {
            return Ok(());
        };
        let count = self.blob.entry_count();
        for &(index, parts) in reload {
            let source = fresh.entry(index).ok_or(TypeError::EntryOutOfRange {
                index,
                count: fresh.entry_count(),
            })?;
            let target = self
                .blob
                .root
                .get_mut(index)
                .ok_or(TypeError::EntryOutOfRange { index, count })?;
            target.replace_parts(parts, source);
            if parts.contains(NeedUpdate::ANNOTATION) {
                self.dirty_index = true;
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// CacheEntry
// ---------------------------------------------------------------------------

/// A cached blob together with its incremental loading state.
///
/// Every entry of the blob's record tree gets a node holding a
/// [`NeedUpdate`] mask. Each own bit moves independently through
/// `clean -> dirty -> loading -> clean`; child bits record that some
/// descendant needs that part. Nodes refer to their parent by index, so the
/// tree has no reference cycles.
pub struct CacheEntry {
    key: BlobKey,
    processor: &'static str,
    state: Mutex<EntryState>,
    /// Signalled whenever loading bits are released.
    settled: Condvar,
    active_loads: AtomicUsize,
    source: Weak<dyn ChunkSource>,
}

struct ActiveLoad<'a>(&'a AtomicUsize);

impl Drop for ActiveLoad<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl CacheEntry {
    /// Build an entry from a decoded blob. Parts held back in unloaded
    /// chunks start out dirty.
    pub fn new(key: BlobKey, decoded: Decoded, source: Weak<dyn ChunkSource>) -> Self {
        Self {
            key,
            processor: decoded.processor,
            state: Mutex::new(EntryState::new(decoded.blob)),
            settled: Condvar::new(),
            active_loads: AtomicUsize::new(0),
            source,
        }
    }

    /// A data-less entry for a private or withdrawn blob.
    pub fn withheld(key: BlobKey, state: BlobState, source: Weak<dyn ChunkSource>) -> Self {
        let decoded = Decoded {
            blob: Blob::withheld(key, state),
            processor: WITHHELD,
        };
        Self::new(key, decoded, source)
    }

    fn lock(&self) -> MutexGuard<'_, EntryState> {
        self.state.lock().expect("cache entry lock poisoned")
    }

    fn source(&self) -> LoaderResult<Arc<dyn ChunkSource>> {
        self.source
            .upgrade()
            .ok_or(LoaderError::SourceDropped(self.key))
    }

    fn begin_load(&self) -> ActiveLoad<'_> {
        self.active_loads.fetch_add(1, Ordering::SeqCst);
        ActiveLoad(&self.active_loads)
    }

    pub fn key(&self) -> BlobKey {
        self.key
    }

    /// Name of the processor that decoded the blob.
    pub fn processor(&self) -> &'static str {
        self.processor
    }

    pub fn blob_state(&self) -> BlobState {
        self.lock().blob.state
    }

    pub fn is_withheld(&self) -> bool {
        self.blob_state().is_withheld()
    }

    /// Run `f` against the current blob.
    pub fn with_blob<R>(&self, f: impl FnOnce(&Blob) -> R) -> R {
        f(&self.lock().blob)
    }

    /// A copy of the current blob.
    pub fn snapshot(&self) -> Blob {
        self.lock().blob.clone()
    }

    pub fn entry_count(&self) -> u32 {
        self.lock().nodes.len() as u32
    }

    /// Declared chunks that have not been loaded.
    pub fn pending_chunks(&self) -> Vec<ChunkId> {
        self.lock().blob.pending_chunks().map(|c| c.id).collect()
    }

    /// Current mask of node `index`, after pushing pending child bits up.
    pub fn need_update(&self, index: EntryIndex) -> LoaderResult<NeedUpdate> {
        let mut state = self.lock();
        state.check(index)?;
        state.settle();
        Ok(state.nodes[index as usize].need)
    }

    /// Returns `true` if the root still needs any of `choice`.
    pub fn is_dirty_for(&self, choice: NeedUpdate) -> bool {
        let mut state = self.lock();
        state.settle();
        state.nodes[0].need.intersects(choice)
    }

    /// Invalidate own parts of node `index`.
    ///
    /// Parts whose class is in the propagation mask also set the matching
    /// child bit on the parent, one level up only.
    pub fn mark_dirty(&self, index: EntryIndex, parts: NeedUpdate) -> LoaderResult<()> {
        let mut state = self.lock();
        state.check(index)?;
        state.mark(index, parts);
        debug!(key = %self.key, node = index, parts = %parts.own(), "marked dirty");
        Ok(())
    }

    /// Choose which own-part classes signal their parent when invalidated.
    pub fn set_propagate_mask(&self, mask: NeedUpdate) {
        self.lock().propagate = mask.own();
    }

    /// Load exactly the parts of node `index` (and, through child bits, of
    /// its descendants) that are dirty for `parts`, then mark them clean.
    ///
    /// Parts held back in declared chunks are loaded by fetching those
    /// chunks; parts invalidated after loading are reloaded from a fresh
    /// copy of the blob, replacing only those parts. Clean parts are never
    /// touched. A concurrent caller asking for parts already being loaded
    /// waits for that load instead of fetching again.
    pub fn ensure_loaded(&self, index: EntryIndex, parts: NeedUpdate) -> LoaderResult<()> {
        let _active = self.begin_load();
        let mut state = self.lock();
        state.check(index)?;

        let targets = loop {
            state.settle();
            let mut targets = Vec::new();
            state.targets(index, parts, &mut targets);
            let busy = targets
                .iter()
                .any(|&(i, bits)| state.nodes[i as usize].loading.intersects(bits));
            if !busy {
                break targets;
            }
            state = self
                .settled
                .wait(state)
                .expect("cache entry lock poisoned");
        };
        if targets.is_empty() {
            state.prune_child_bits();
            return Ok(());
        }

        let mut chunks = Vec::new();
        let mut reload = Vec::new();
        for &(i, bits) in &targets {
            state.nodes[i as usize].loading |= bits;
            chunks.extend(state.blob.chunks_for(i, bits));
            let uncovered = bits.difference(state.blob.unloaded_parts(i));
            if !uncovered.is_empty() {
                reload.push((i, uncovered));
            }
        }
        chunks.sort();
        chunks.dedup();
        debug!(
            key = %self.key,
            node = index,
            parts = %parts,
            chunks = chunks.len(),
            reloads = reload.len(),
            "loading dirty parts"
        );
        drop(state);

        let fetched = self.fetch_missing(&chunks, &reload);

        let mut state = self.lock();
        let result =
            fetched.and_then(|(contents, fresh)| state.apply(contents, fresh.as_ref(), &reload));
        for &(i, bits) in &targets {
            let node = &mut state.nodes[i as usize];
            node.loading = node.loading.difference(bits);
            if result.is_ok() {
                node.need = node.need.difference(bits);
            }
        }
        if result.is_ok() {
            state.prune_child_bits();
        }
        drop(state);
        self.settled.notify_all();
        result
    }

    fn fetch_missing(
        &self,
        chunks: &[ChunkId],
        reload: &[(EntryIndex, NeedUpdate)],
    ) -> LoaderResult<(Vec<ChunkContent>, Option<Blob>)> {
        let source = self.source()?;
        let contents = if chunks.is_empty() {
            Vec::new()
        } else {
            source.fetch_chunks(&self.key, self.processor, chunks)?
        };
        if reload.is_empty() {
            return Ok((contents, None));
        }

        let Decoded {
            mut blob,
            processor,
        } = source.refetch(&self.key)?;
        let mut held: Vec<ChunkId> = reload
            .iter()
            .flat_map(|&(i, bits)| blob.chunks_for(i, bits))
            .collect();
        held.sort();
        held.dedup();
        if !held.is_empty() {
            for content in source.fetch_chunks(&self.key, processor, &held)? {
                blob.attach_chunk(content)?;
            }
        }
        Ok((contents, Some(blob)))
    }

    /// Load one chunk. Returns `false` if it was already loaded.
    pub fn load_chunk(&self, id: ChunkId) -> LoaderResult<bool> {
        Ok(self.load_chunks(&[id])? > 0)
    }

    /// Load the named chunks and splice them in. Already loaded chunks are
    /// skipped; returns how many chunks were spliced by this call.
    pub fn load_chunks(&self, ids: &[ChunkId]) -> LoaderResult<usize> {
        let _active = self.begin_load();
        let wanted = {
            let state = self.lock();
            let mut wanted = Vec::with_capacity(ids.len());
            for &id in ids {
                if state.blob.chunk_info(id).is_none() {
                    return Err(TypeError::UnknownChunk(id).into());
                }
                if !state.blob.is_chunk_loaded(id) && !wanted.contains(&id) {
                    wanted.push(id);
                }
            }
            wanted
        };
        if wanted.is_empty() {
            return Ok(0);
        }

        let contents = self
            .source()?
            .fetch_chunks(&self.key, self.processor, &wanted)?;
        let mut state = self.lock();
        let mut spliced = 0;
        for content in contents {
            let id = content.id;
            let newly_loaded = !state.blob.is_chunk_loaded(id);
            state.attach(content)?;
            if newly_loaded {
                spliced += 1;
            }
        }
        state.prune_child_bits();
        drop(state);
        self.settled.notify_all();
        debug!(key = %self.key, requested = ids.len(), spliced, "chunks loaded");
        Ok(spliced)
    }

    /// Returns `true` if annotations changed since the index was last
    /// rebuilt.
    pub fn is_index_dirty(&self) -> bool {
        self.lock().dirty_index
    }

    /// Clear the dirty-index flag, returning its previous value. Called by
    /// the indexer after it has rebuilt its index.
    pub fn take_dirty_index(&self) -> bool {
        std::mem::take(&mut self.lock().dirty_index)
    }

    /// Returns `true` while any load on this entry is in progress.
    pub fn is_busy(&self) -> bool {
        self.active_loads.load(Ordering::SeqCst) > 0
    }
}

impl fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry")
            .field("key", &self.key)
            .field("processor", &self.processor)
            .field("busy", &self.is_busy())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use seqfetch_format::split_blob;
    use seqfetch_reader::ReaderError;
    use seqfetch_types::{Annotation, SeqEntry, SeqSegment};
    use std::collections::HashMap;
    use std::sync::atomic::AtomicBool;
    use std::sync::{Barrier, RwLock};
    use std::thread;
    use std::time::Duration;

    struct FakeSource {
        full: RwLock<Blob>,
        chunks: HashMap<ChunkId, ChunkContent>,
        chunk_calls: AtomicUsize,
        refetches: AtomicUsize,
        fail: AtomicBool,
        latency: Duration,
    }

    impl FakeSource {
        fn new(full: Blob, chunks: Vec<ChunkContent>) -> Arc<Self> {
            Self::with_latency(full, chunks, Duration::ZERO)
        }

        fn with_latency(full: Blob, chunks: Vec<ChunkContent>, latency: Duration) -> Arc<Self> {
            Arc::new(Self {
                full: RwLock::new(full),
                chunks: chunks.into_iter().map(|c| (c.id, c)).collect(),
                chunk_calls: AtomicUsize::new(0),
                refetches: AtomicUsize::new(0),
                fail: AtomicBool::new(false),
                latency,
            })
        }

        fn error() -> LoaderError {
            ReaderError::Connection {
                reader: "fake".into(),
                reason: "reset".into(),
            }
            .into()
        }
    }

    impl ChunkSource for FakeSource {
        fn fetch_chunks(
            &self,
            _key: &BlobKey,
            _processor: &'static str,
            chunks: &[ChunkId],
        ) -> LoaderResult<Vec<ChunkContent>> {
            self.chunk_calls.fetch_add(1, Ordering::SeqCst);
            thread::sleep(self.latency);
            if self.fail.load(Ordering::SeqCst) {
                return Err(Self::error());
            }
            chunks
                .iter()
                .map(|id| {
                    self.chunks
                        .get(id)
                        .cloned()
                        .ok_or(LoaderError::NotFound(id.to_string()))
                })
                .collect()
        }

        fn refetch(&self, _key: &BlobKey) -> LoaderResult<Decoded> {
            self.refetches.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(Self::error());
            }
            Ok(Decoded {
                blob: self.full.read().unwrap().clone(),
                processor: "whole",
            })
        }
    }

    fn key() -> BlobKey {
        BlobKey::new(4, 1, 2001).with_version(3)
    }

    fn member(acc: &str) -> SeqEntry {
        let mut entry = SeqEntry::sequence(acc);
        entry.annotations.push(Annotation {
            name: format!("{acc}-genes"),
            features: Vec::new(),
        });
        entry.seq_data.push(SeqSegment {
            start: 0,
            residues: "ACGTTGCA".into(),
        });
        entry
    }

    /// Root set (0) with members A (1) and B (2).
    fn full_blob() -> Blob {
        Blob::new(key(), SeqEntry::set(vec![member("A"), member("B")]))
    }

    fn entry_for(blob: Blob, processor: &'static str, source: &Arc<FakeSource>) -> CacheEntry {
        let dyn_source: Arc<dyn ChunkSource> = source.clone();
        CacheEntry::new(key(), Decoded { blob, processor }, Arc::downgrade(&dyn_source))
    }

    fn split_entry(parts: NeedUpdate) -> (CacheEntry, Arc<FakeSource>) {
        let (skeleton, chunks) = split_blob(&full_blob(), parts);
        let source = FakeSource::new(full_blob(), chunks);
        (entry_for(skeleton, "split", &source), source)
    }

    // -----------------------------------------------------------------------
    // NeedUpdate bookkeeping
    // -----------------------------------------------------------------------

    #[test]
    fn skeleton_marks_held_parts_dirty() {
        let (entry, _source) = split_entry(NeedUpdate::ANNOTATION);
        assert_eq!(entry.need_update(1).unwrap(), NeedUpdate::ANNOTATION);
        assert_eq!(entry.need_update(2).unwrap(), NeedUpdate::ANNOTATION);
        assert_eq!(entry.need_update(0).unwrap(), NeedUpdate::CHILD_ANNOTATION);
        assert!(!entry.is_dirty_for(NeedUpdate::ANNOTATION));
        assert!(entry.is_dirty_for(NeedUpdate::ANNOTATION.with_children()));
        assert!(!entry.is_dirty_for(NeedUpdate::SEQ_DATA.with_children()));
        assert!(!entry.is_index_dirty());
    }

    #[test]
    fn mark_dirty_reaches_one_level_then_settles_on_access() {
        let inner = SeqEntry::set(vec![member("C")]);
        let blob = Blob::new(key(), SeqEntry::set(vec![inner]));
        let source = FakeSource::new(blob.clone(), Vec::new());
        let entry = entry_for(blob, "whole", &source);

        entry.mark_dirty(2, NeedUpdate::ANNOTATION).unwrap();
        {
            let state = entry.lock();
            assert_eq!(state.nodes[2].need, NeedUpdate::ANNOTATION);
            assert_eq!(state.nodes[1].need, NeedUpdate::CHILD_ANNOTATION);
            assert!(state.nodes[0].need.is_empty());
        }
        assert_eq!(entry.need_update(0).unwrap(), NeedUpdate::CHILD_ANNOTATION);
    }

    #[test]
    fn propagate_mask_limits_signals() {
        let source = FakeSource::new(full_blob(), Vec::new());
        let entry = entry_for(full_blob(), "whole", &source);
        entry.set_propagate_mask(NeedUpdate::SEQ_DATA);
        entry.mark_dirty(1, NeedUpdate::ANNOTATION).unwrap();
        assert!(entry.need_update(0).unwrap().is_empty());
        entry.mark_dirty(1, NeedUpdate::SEQ_DATA).unwrap();
        assert_eq!(entry.need_update(0).unwrap(), NeedUpdate::CHILD_SEQ_DATA);
    }

    #[test]
    fn out_of_range_node_is_an_error() {
        let (entry, _source) = split_entry(NeedUpdate::ANNOTATION);
        assert!(matches!(
            entry.mark_dirty(7, NeedUpdate::ANNOTATION),
            Err(LoaderError::Data(TypeError::EntryOutOfRange { index: 7, count: 3 }))
        ));
        assert!(entry.need_update(3).is_err());
    }

    // -----------------------------------------------------------------------
    // EnsureLoaded
    // -----------------------------------------------------------------------

    #[test]
    fn ensure_loaded_fetches_only_held_chunks() {
        let (entry, source) = split_entry(NeedUpdate::ANNOTATION | NeedUpdate::SEQ_DATA);
        entry
            .ensure_loaded(0, NeedUpdate::ANNOTATION.with_children())
            .unwrap();

        assert_eq!(source.chunk_calls.load(Ordering::SeqCst), 1);
        assert_eq!(source.refetches.load(Ordering::SeqCst), 0);
        // Each member's chunk carried both parts, so both are now clean.
        assert!(entry.need_update(1).unwrap().is_empty());
        assert!(entry.need_update(0).unwrap().is_empty());
        assert_eq!(entry.snapshot().root, full_blob().root);
        assert!(entry.take_dirty_index());
        assert!(!entry.is_index_dirty());

        entry
            .ensure_loaded(0, NeedUpdate::ALL.with_children())
            .unwrap();
        assert_eq!(source.chunk_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn large_set_loads_every_member_chunk() {
        const MEMBERS: usize = 5_000;
        let full = Blob::new(
            key(),
            SeqEntry::set((0..MEMBERS).map(|i| member(&format!("M{i}"))).collect()),
        );
        let (skeleton, chunks) = split_blob(&full, NeedUpdate::ANNOTATION);
        assert_eq!(chunks.len(), MEMBERS);
        let source = FakeSource::new(full.clone(), chunks);
        let entry = entry_for(skeleton, "split", &source);

        assert_eq!(entry.need_update(0).unwrap(), NeedUpdate::CHILD_ANNOTATION);
        assert_eq!(entry.pending_chunks().len(), MEMBERS);

        entry
            .ensure_loaded(0, NeedUpdate::ANNOTATION.with_children())
            .unwrap();
        assert_eq!(source.chunk_calls.load(Ordering::SeqCst), 1);
        assert!(entry.pending_chunks().is_empty());
        assert!(!entry.is_dirty_for(NeedUpdate::ALL.with_children()));
        assert_eq!(entry.snapshot().root, full.root);
    }

    #[test]
    fn ensure_loaded_own_part_leaves_children_alone() {
        let (entry, source) = split_entry(NeedUpdate::ANNOTATION);
        entry.ensure_loaded(1, NeedUpdate::ANNOTATION).unwrap();
        assert_eq!(source.chunk_calls.load(Ordering::SeqCst), 1);
        assert!(entry.need_update(1).unwrap().is_empty());
        assert_eq!(entry.need_update(2).unwrap(), NeedUpdate::ANNOTATION);
        assert_eq!(entry.need_update(0).unwrap(), NeedUpdate::CHILD_ANNOTATION);
        assert_eq!(entry.pending_chunks(), vec![ChunkId(2)]);
    }

    #[test]
    fn reload_of_annotation_keeps_seq_data() {
        let source = FakeSource::new(full_blob(), Vec::new());
        let entry = entry_for(full_blob(), "whole", &source);
        let _ = entry.take_dirty_index();

        {
            let mut fresh = source.full.write().unwrap();
            let member = fresh.root.get_mut(1).unwrap();
            member.annotations[0].name = "A-genes-v2".into();
            member.seq_data[0].residues = "NNNNNNNN".into();
        }

        entry.mark_dirty(1, NeedUpdate::ANNOTATION).unwrap();
        assert_eq!(entry.need_update(1).unwrap(), NeedUpdate::ANNOTATION);
        entry.ensure_loaded(1, NeedUpdate::ANNOTATION).unwrap();

        let blob = entry.snapshot();
        let member = blob.entry(1).unwrap();
        assert_eq!(member.annotations[0].name, "A-genes-v2");
        assert_eq!(member.seq_data[0].residues, "ACGTTGCA");
        assert!(entry.need_update(1).unwrap().is_empty());
        assert!(entry.need_update(0).unwrap().is_empty());
        assert_eq!(source.refetches.load(Ordering::SeqCst), 1);
        assert!(entry.is_index_dirty());
    }

    #[test]
    fn failed_load_leaves_parts_dirty() {
        let (entry, source) = split_entry(NeedUpdate::SEQ_DATA);
        source.fail.store(true, Ordering::SeqCst);
        let err = entry
            .ensure_loaded(0, NeedUpdate::SEQ_DATA.with_children())
            .unwrap_err();
        assert!(err.is_connection());
        assert_eq!(entry.need_update(1).unwrap(), NeedUpdate::SEQ_DATA);
        assert!(!entry.is_busy());
        assert!(entry.lock().nodes.iter().all(|n| n.loading.is_empty()));

        source.fail.store(false, Ordering::SeqCst);
        entry
            .ensure_loaded(0, NeedUpdate::SEQ_DATA.with_children())
            .unwrap();
        assert!(entry.need_update(0).unwrap().is_empty());
    }

    #[test]
    fn dropped_source_is_reported() {
        let (skeleton, chunks) = split_blob(&full_blob(), NeedUpdate::ANNOTATION);
        let source = FakeSource::new(full_blob(), chunks);
        let entry = entry_for(skeleton, "split", &source);
        drop(source);
        assert_eq!(
            entry.ensure_loaded(1, NeedUpdate::ANNOTATION).unwrap_err(),
            LoaderError::SourceDropped(key())
        );
    }

    #[test]
    fn concurrent_ensure_loaded_fetches_once() {
        let (skeleton, chunks) = split_blob(&full_blob(), NeedUpdate::SEQ_DATA);
        let source = FakeSource::with_latency(full_blob(), chunks, Duration::from_millis(40));
        let entry = Arc::new(entry_for(skeleton, "split", &source));
        let barrier = Arc::new(Barrier::new(4));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let entry = Arc::clone(&entry);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    entry.ensure_loaded(0, NeedUpdate::SEQ_DATA.with_children())
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap().unwrap();
        }
        assert_eq!(source.chunk_calls.load(Ordering::SeqCst), 1);
        assert!(entry.pending_chunks().is_empty());
    }

    // -----------------------------------------------------------------------
    // Chunks
    // -----------------------------------------------------------------------

    #[test]
    fn load_chunk_twice_is_noop() {
        let (entry, source) = split_entry(NeedUpdate::ANNOTATION);
        assert!(entry.load_chunk(ChunkId(2)).unwrap());
        assert!(!entry.load_chunk(ChunkId(2)).unwrap());
        assert_eq!(source.chunk_calls.load(Ordering::SeqCst), 1);
        assert!(entry.need_update(2).unwrap().is_empty());
        assert_eq!(entry.need_update(1).unwrap(), NeedUpdate::ANNOTATION);
        assert!(entry.is_index_dirty());
    }

    #[test]
    fn load_chunks_batches_and_clears_child_bits() {
        let (entry, source) = split_entry(NeedUpdate::SEQ_DATA);
        assert_eq!(
            entry
                .load_chunks(&[ChunkId(1), ChunkId(2), ChunkId(1)])
                .unwrap(),
            2
        );
        assert_eq!(source.chunk_calls.load(Ordering::SeqCst), 1);
        assert!(entry.need_update(0).unwrap().is_empty());
    }

    #[test]
    fn unknown_chunk_is_rejected() {
        let (entry, _source) = split_entry(NeedUpdate::ANNOTATION);
        assert_eq!(
            entry.load_chunk(ChunkId(40)).unwrap_err(),
            LoaderError::Data(TypeError::UnknownChunk(ChunkId(40)))
        );
    }

    #[test]
    fn withheld_entry_has_nothing_to_load() {
        let source = FakeSource::new(full_blob(), Vec::new());
        let dyn_source: Arc<dyn ChunkSource> = source.clone();
        let entry = CacheEntry::withheld(key(), BlobState::PRIVATE, Arc::downgrade(&dyn_source));
        assert!(entry.is_withheld());
        assert_eq!(entry.processor(), WITHHELD);
        assert!(!entry.is_dirty_for(NeedUpdate::ALL.with_children()));
        entry.ensure_loaded(0, NeedUpdate::ALL).unwrap();
        assert_eq!(source.refetches.load(Ordering::SeqCst), 0);
    }
}
