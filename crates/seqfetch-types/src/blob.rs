use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::ops::Index;

use serde::{Deserialize, Serialize};

use crate::error::{TypeError, TypeResult};
use crate::key::BlobKey;
use crate::parts::{ChunkId, NeedUpdate};

/// Pre-order index of a [`SeqEntry`] inside a blob's entry tree.
///
/// The root entry is index 0; members follow depth-first in declaration
/// order.
pub type EntryIndex = u32;

// ---------------------------------------------------------------------------
// BlobState
// ---------------------------------------------------------------------------

/// Status flags carried by every blob.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlobState(u8);

impl BlobState {
    pub const LIVE: Self = Self(0);
    pub const PRIVATE: Self = Self(1 << 0);
    pub const WITHDRAWN: Self = Self(1 << 1);
    pub const DEAD: Self = Self(1 << 2);
    pub const SUPPRESSED: Self = Self(1 << 3);

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn from_bits_truncate(bits: u8) -> Self {
        Self(bits & 0x0f)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Returns `true` if the blob's data must not be served (private or
    /// withdrawn).
    pub const fn is_withheld(self) -> bool {
        self.0 & (Self::PRIVATE.0 | Self::WITHDRAWN.0) != 0
    }
}

impl fmt::Debug for BlobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut flags = Vec::new();
        for (bit, name) in [
            (Self::PRIVATE, "private"),
            (Self::WITHDRAWN, "withdrawn"),
            (Self::DEAD, "dead"),
            (Self::SUPPRESSED, "suppressed"),
        ] {
            if self.contains(bit) {
                flags.push(name);
            }
        }
        if flags.is_empty() {
            flags.push("live");
        }
        write!(f, "BlobState({})", flags.join("|"))
    }
}

// ---------------------------------------------------------------------------
// Entry contents
// ---------------------------------------------------------------------------

/// Kind of molecule a sequence describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Molecule {
    Dna,
    Rna,
    Protein,
    Other,
}

/// Core summary of a sequence.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeqSummary {
    pub length: u64,
    pub molecule: Molecule,
}

/// A single located feature.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feature {
    pub kind: String,
    pub start: u64,
    pub end: u64,
    pub label: Option<String>,
}

/// A named batch of features.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotation {
    pub name: String,
    pub features: Vec<Feature>,
}

/// A contiguous run of residues starting at `start`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeqSegment {
    pub start: u64,
    pub residues: String,
}

/// One component of an assembled sequence.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssemblyComponent {
    pub accession: String,
    pub start: u64,
    pub end: u64,
}

/// A node in a blob's record tree: one sequence or one set of members.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeqEntry {
    pub accession: Option<String>,
    pub descriptions: Vec<String>,
    pub summary: Option<SeqSummary>,
    pub annotations: Vec<Annotation>,
    pub seq_data: Vec<SeqSegment>,
    pub assembly: Vec<AssemblyComponent>,
    pub members: Vec<SeqEntry>,
}

impl SeqEntry {
    /// Create an entry for a single accession.
    pub fn sequence(accession: impl Into<String>) -> Self {
        Self {
            accession: Some(accession.into()),
            ..Default::default()
        }
    }

    /// Create a set entry holding the given members.
    pub fn set(members: Vec<SeqEntry>) -> Self {
        Self {
            members,
            ..Default::default()
        }
    }

    /// Number of entries in this subtree, including `self`.
    pub fn subtree_len(&self) -> u32 {
        1 + self.members.iter().map(SeqEntry::subtree_len).sum::<u32>()
    }

    /// Visit every entry of the subtree in pre-order together with its
    /// index and its parent's index.
    pub fn walk<'a>(&'a self, visit: &mut impl FnMut(EntryIndex, Option<EntryIndex>, &'a SeqEntry)) {
        fn go<'a>(
            entry: &'a SeqEntry,
            parent: Option<EntryIndex>,
            next: &mut EntryIndex,
            visit: &mut impl FnMut(EntryIndex, Option<EntryIndex>, &'a SeqEntry),
        ) {
            let index = *next;
            *next += 1;
            visit(index, parent, entry);
            for member in &entry.members {
                go(member, Some(index), next, visit);
            }
        }
        let mut next = 0;
        go(self, None, &mut next, visit);
    }

    /// Entry at the given pre-order index within this subtree.
    pub fn get(&self, index: EntryIndex) -> Option<&SeqEntry> {
        if index == 0 {
            return Some(self);
        }
        let mut offset = 1;
        for member in &self.members {
            let len = member.subtree_len();
            if index < offset + len {
                return member.get(index - offset);
            }
            offset += len;
        }
        None
    }

    /// Mutable entry at the given pre-order index within this subtree.
    pub fn get_mut(&mut self, index: EntryIndex) -> Option<&mut SeqEntry> {
        if index == 0 {
            return Some(self);
        }
        let mut offset = 1;
        for member in &mut self.members {
            let len = member.subtree_len();
            if index < offset + len {
                return member.get_mut(index - offset);
            }
            offset += len;
        }
        None
    }

    /// Which own parts of this entry currently hold data.
    pub fn present_parts(&self) -> NeedUpdate {
        let mut parts = NeedUpdate::NONE;
        if !self.descriptions.is_empty() {
            parts |= NeedUpdate::DESCRIPTION;
        }
        if !self.annotations.is_empty() {
            parts |= NeedUpdate::ANNOTATION;
        }
        if !self.seq_data.is_empty() {
            parts |= NeedUpdate::SEQ_DATA;
        }
        if self.summary.is_some() {
            parts |= NeedUpdate::CORE;
        }
        if !self.assembly.is_empty() {
            parts |= NeedUpdate::ASSEMBLY;
        }
        parts
    }

    /// Replace the given own parts of `self` with those of `source`,
    /// leaving every other part untouched. Members are never copied.
    pub fn replace_parts(&mut self, parts: NeedUpdate, source: &SeqEntry) {
        if parts.contains(NeedUpdate::DESCRIPTION) {
            self.descriptions = source.descriptions.clone();
        }
        if parts.contains(NeedUpdate::ANNOTATION) {
            self.annotations = source.annotations.clone();
        }
        if parts.contains(NeedUpdate::SEQ_DATA) {
            self.seq_data = source.seq_data.clone();
        }
        if parts.contains(NeedUpdate::CORE) {
            self.summary = source.summary.clone();
            self.accession = source.accession.clone();
        }
        if parts.contains(NeedUpdate::ASSEMBLY) {
            self.assembly = source.assembly.clone();
        }
    }
}

// ---------------------------------------------------------------------------
// Chunks
// ---------------------------------------------------------------------------

/// Placeholder for a known-but-unloaded chunk, declared by a skeleton.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkInfo {
    pub id: ChunkId,
    /// Entry the chunk's content belongs to.
    pub target: EntryIndex,
    /// Own parts of the target the chunk carries.
    pub parts: NeedUpdate,
}

/// Decoded contents of one chunk.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkContent {
    pub id: ChunkId,
    pub target: EntryIndex,
    pub descriptions: Vec<String>,
    pub annotations: Vec<Annotation>,
    pub seq_data: Vec<SeqSegment>,
    pub assembly: Vec<AssemblyComponent>,
}

impl ChunkContent {
    /// An empty chunk for the given target.
    pub fn empty(id: ChunkId, target: EntryIndex) -> Self {
        Self {
            id,
            target,
            descriptions: Vec::new(),
            annotations: Vec::new(),
            seq_data: Vec::new(),
            assembly: Vec::new(),
        }
    }

    /// Own parts this chunk actually carries data for.
    pub fn parts(&self) -> NeedUpdate {
        let mut parts = NeedUpdate::NONE;
        if !self.descriptions.is_empty() {
            parts |= NeedUpdate::DESCRIPTION;
        }
        if !self.annotations.is_empty() {
            parts |= NeedUpdate::ANNOTATION;
        }
        if !self.seq_data.is_empty() {
            parts |= NeedUpdate::SEQ_DATA;
        }
        if !self.assembly.is_empty() {
            parts |= NeedUpdate::ASSEMBLY;
        }
        parts
    }
}

/// The chunks a blob declares, indexed by id and by target entry.
///
/// Serializes as a plain list; the indexes are rebuilt on load.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(from = "Vec<ChunkInfo>", into = "Vec<ChunkInfo>")]
pub struct ChunkTable {
    list: Vec<ChunkInfo>,
    by_id: HashMap<ChunkId, usize>,
    by_target: HashMap<EntryIndex, Vec<ChunkId>>,
}

impl ChunkTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a chunk. Re-declaring an id replaces the earlier info.
    pub fn push(&mut self, info: ChunkInfo) {
        if let Some(&slot) = self.by_id.get(&info.id) {
            let old_target = self.list[slot].target;
            if old_target != info.target {
                if let Some(ids) = self.by_target.get_mut(&old_target) {
                    ids.retain(|id| *id != info.id);
                }
                self.by_target.entry(info.target).or_default().push(info.id);
            }
            self.list[slot] = info;
            return;
        }
        self.by_id.insert(info.id, self.list.len());
        self.by_target.entry(info.target).or_default().push(info.id);
        self.list.push(info);
    }

    pub fn get(&self, id: ChunkId) -> Option<&ChunkInfo> {
        self.by_id.get(&id).map(|&slot| &self.list[slot])
    }

    /// Chunks declared for one entry, in declaration order.
    pub fn for_target(&self, target: EntryIndex) -> impl Iterator<Item = &ChunkInfo> {
        self.by_target
            .get(&target)
            .into_iter()
            .flatten()
            .filter_map(|id| self.get(*id))
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ChunkInfo> {
        self.list.iter()
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }
}

impl PartialEq for ChunkTable {
    fn eq(&self, other: &Self) -> bool {
        self.list == other.list
    }
}

impl Eq for ChunkTable {}

impl Index<usize> for ChunkTable {
    type Output = ChunkInfo;

    fn index(&self, slot: usize) -> &ChunkInfo {
        &self.list[slot]
    }
}

impl FromIterator<ChunkInfo> for ChunkTable {
    fn from_iter<I: IntoIterator<Item = ChunkInfo>>(iter: I) -> Self {
        let mut table = Self::new();
        for info in iter {
            table.push(info);
        }
        table
    }
}

impl From<Vec<ChunkInfo>> for ChunkTable {
    fn from(list: Vec<ChunkInfo>) -> Self {
        list.into_iter().collect()
    }
}

impl From<ChunkTable> for Vec<ChunkInfo> {
    fn from(table: ChunkTable) -> Self {
        table.list
    }
}

impl<'a> IntoIterator for &'a ChunkTable {
    type Item = &'a ChunkInfo;
    type IntoIter = std::slice::Iter<'a, ChunkInfo>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

// ---------------------------------------------------------------------------
// Blob
// ---------------------------------------------------------------------------

/// A decoded, versioned unit of sequence/annotation data.
///
/// A blob decoded from a skeleton declares its heavyweight sub-parts as
/// [`ChunkInfo`] placeholders; [`Blob::attach_chunk`] splices their content
/// in later without touching anything else.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blob {
    pub key: BlobKey,
    pub state: BlobState,
    pub root: SeqEntry,
    /// Every chunk the blob declares, loaded or not.
    pub chunks: ChunkTable,
    /// Chunks whose content has been spliced in.
    pub loaded_chunks: BTreeSet<ChunkId>,
}

impl Blob {
    /// A fully loaded blob with no chunks.
    pub fn new(key: BlobKey, root: SeqEntry) -> Self {
        Self {
            key,
            state: BlobState::LIVE,
            root,
            chunks: ChunkTable::new(),
            loaded_chunks: BTreeSet::new(),
        }
    }

    /// A data-less blob carrying only a withheld state.
    pub fn withheld(key: BlobKey, state: BlobState) -> Self {
        Self {
            state,
            ..Self::new(key, SeqEntry::default())
        }
    }

    /// Number of entries in the record tree.
    pub fn entry_count(&self) -> u32 {
        self.root.subtree_len()
    }

    pub fn entry(&self, index: EntryIndex) -> Option<&SeqEntry> {
        self.root.get(index)
    }

    /// Declared chunk metadata by id.
    pub fn chunk_info(&self, id: ChunkId) -> Option<&ChunkInfo> {
        self.chunks.get(id)
    }

    pub fn is_chunk_loaded(&self, id: ChunkId) -> bool {
        self.loaded_chunks.contains(&id)
    }

    /// Declared chunks whose content has not been spliced in yet.
    pub fn pending_chunks(&self) -> impl Iterator<Item = &ChunkInfo> {
        self.chunks
            .iter()
            .filter(|c| !self.loaded_chunks.contains(&c.id))
    }

    /// Own parts of `target` that are still held back in unloaded chunks.
    pub fn unloaded_parts(&self, target: EntryIndex) -> NeedUpdate {
        self.chunks
            .for_target(target)
            .filter(|c| !self.loaded_chunks.contains(&c.id))
            .fold(NeedUpdate::NONE, |acc, c| acc | c.parts)
    }

    /// Pending chunks that target `target` and carry any of `parts`.
    pub fn chunks_for(&self, target: EntryIndex, parts: NeedUpdate) -> Vec<ChunkId> {
        self.chunks
            .for_target(target)
            .filter(|c| !self.loaded_chunks.contains(&c.id) && c.parts.intersects(parts))
            .map(|c| c.id)
            .collect()
    }

    /// Splice a chunk's content into its target entry.
    ///
    /// Returns the parts that were spliced. A chunk that is already loaded
    /// is a no-op and returns [`NeedUpdate::NONE`].
    pub fn attach_chunk(&mut self, content: ChunkContent) -> TypeResult<NeedUpdate> {
        let info = self
            .chunk_info(content.id)
            .ok_or(TypeError::UnknownChunk(content.id))?;
        if info.target != content.target {
            return Err(TypeError::ChunkTargetMismatch {
                chunk: content.id,
                declared: info.target,
                actual: content.target,
            });
        }
        if self.loaded_chunks.contains(&content.id) {
            return Ok(NeedUpdate::NONE);
        }
        let declared = info.parts;
        let Some(entry) = self.root.get_mut(content.target) else {
            return Err(TypeError::EntryOutOfRange {
                index: content.target,
                count: self.entry_count(),
            });
        };

        let spliced = content.parts();
        entry.descriptions.extend(content.descriptions);
        entry.annotations.extend(content.annotations);
        entry.seq_data.extend(content.seq_data);
        entry.seq_data.sort_by_key(|segment| segment.start);
        entry.assembly.extend(content.assembly);
        self.loaded_chunks.insert(content.id);
        Ok(declared | spliced)
    }
}
