use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use bytes::Bytes;
use seqfetch_types::{BlobKey, BlobState, ChunkId};
use tracing::{debug, warn};

use crate::error::{ReaderError, ReaderResult};
use crate::traits::{CacheWriter, FetchOutcome, Reader};

const IDS_FILE: &str = "ids.json";
const BLOB_DIR: &str = "blobs";

/// File-per-blob reader backend rooted at a directory.
///
/// On-disk layout:
/// ```text
/// <root>/ids.json                    {"<external id>": "<blob id>", ...}
/// <root>/blobs/<blob id>.blob        encoded blob bytes
/// <root>/blobs/<blob id>.chunk-<n>   encoded chunk payload
/// <root>/blobs/<blob id>.state       withheld state bits (decimal)
/// ```
///
/// `<blob id>` is the canonical [`BlobKey`] string form with `/` replaced
/// by `@` so sequence-qualified keys stay single path components. Writes
/// go to a temporary file first and are renamed into place, so readers see
/// either the whole payload or nothing.
pub struct DirectoryReader {
    name: String,
    root: PathBuf,
    ids: RwLock<HashMap<String, String>>,
}

impl DirectoryReader {
    /// Open (or create) a directory-backed reader.
    pub fn open(name: impl Into<String>, root: &Path) -> ReaderResult<Self> {
        let name = name.into();
        fs::create_dir_all(root.join(BLOB_DIR))
            .map_err(|e| ReaderError::connection(&name, e))?;
        let ids = load_ids(&name, root)?;
        debug!(reader = %name, root = %root.display(), ids = ids.len(), "directory reader opened");
        Ok(Self {
            name,
            root: root.to_path_buf(),
            ids: RwLock::new(ids),
        })
    }

    /// Root directory of this reader.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, key: &BlobKey, suffix: &str) -> PathBuf {
        let file = format!("{}.{suffix}", key.to_string().replace('/', "@"));
        self.root.join(BLOB_DIR).join(file)
    }

    fn read_file(&self, path: &Path, what: impl std::fmt::Display) -> ReaderResult<Bytes> {
        match fs::read(path) {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(ReaderError::not_found(&self.name, what))
            }
            Err(e) => Err(ReaderError::connection(&self.name, e)),
        }
    }

    fn write_file(&self, path: &Path, data: &[u8]) -> ReaderResult<()> {
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, data)
            .and_then(|_| fs::rename(&tmp, path))
            .map_err(|e| ReaderError::connection(&self.name, e))
    }

    /// Mark a stored blob as private/withdrawn.
    pub fn store_withheld(&self, key: &BlobKey, state: BlobState) -> ReaderResult<()> {
        self.write_file(
            &self.blob_path(key, "state"),
            state.bits().to_string().as_bytes(),
        )
    }
}

fn load_ids(name: &str, root: &Path) -> ReaderResult<HashMap<String, String>> {
    match fs::read(root.join(IDS_FILE)) {
        Ok(data) => serde_json::from_slice(&data).map_err(|e| ReaderError::Protocol {
            reader: name.to_string(),
            reason: format!("corrupt {IDS_FILE}: {e}"),
        }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(HashMap::new()),
        Err(e) => Err(ReaderError::connection(name, e)),
    }
}

impl Reader for DirectoryReader {
    fn name(&self) -> &str {
        &self.name
    }

    fn resolve_id(&self, id: &str) -> ReaderResult<BlobKey> {
        let ids = self.ids.read().expect("lock poisoned");
        let blob_id = ids
            .get(id)
            .ok_or_else(|| ReaderError::not_found(&self.name, format!("id {id}")))?;
        Ok(BlobKey::parse(blob_id)?)
    }

    fn fetch_blob_bytes(&self, key: &BlobKey) -> ReaderResult<FetchOutcome> {
        let state_path = self.blob_path(key, "state");
        if state_path.exists() {
            let raw = self.read_file(&state_path, format!("state of {key}"))?;
            let bits = std::str::from_utf8(&raw)
                .ok()
                .and_then(|s| s.trim().parse::<u8>().ok())
                .ok_or_else(|| ReaderError::Protocol {
                    reader: self.name.clone(),
                    reason: format!("corrupt state file for {key}"),
                })?;
            let state = BlobState::from_bits_truncate(bits);
            if state.is_withheld() {
                return Ok(FetchOutcome::Withheld(state));
            }
        }
        let bytes = self.read_file(&self.blob_path(key, "blob"), format!("blob {key}"))?;
        Ok(FetchOutcome::Bytes(bytes))
    }

    fn fetch_chunk_bytes(&self, key: &BlobKey, chunk: ChunkId) -> ReaderResult<Bytes> {
        let suffix = format!("chunk-{}", chunk.0);
        self.read_file(&self.blob_path(key, &suffix), format!("{chunk} of {key}"))
    }

    /// Reload `ids.json` from disk.
    fn reconnect(&self) -> ReaderResult<()> {
        let ids = load_ids(&self.name, &self.root)?;
        *self.ids.write().expect("lock poisoned") = ids;
        Ok(())
    }

    fn is_cache(&self) -> bool {
        true
    }
}

impl CacheWriter for DirectoryReader {
    fn store_blob_bytes(&self, key: &BlobKey, bytes: &[u8]) -> ReaderResult<()> {
        self.write_file(&self.blob_path(key, "blob"), bytes)
    }

    fn store_chunk_bytes(&self, key: &BlobKey, chunk: ChunkId, bytes: &[u8]) -> ReaderResult<()> {
        let suffix = format!("chunk-{}", chunk.0);
        self.write_file(&self.blob_path(key, &suffix), bytes)
    }

    fn store_id(&self, id: &str, key: &BlobKey) -> ReaderResult<()> {
        let mut ids = self.ids.write().expect("lock poisoned");
        ids.insert(id.to_string(), key.to_string());
        let json = serde_json::to_vec_pretty(&*ids).map_err(|e| ReaderError::Protocol {
            reader: self.name.clone(),
            reason: e.to_string(),
        })?;
        if let Err(e) = self.write_file(&self.root.join(IDS_FILE), &json) {
            warn!(reader = %self.name, error = %e, "failed to persist id map");
            return Err(e);
        }
        Ok(())
    }
}

impl std::fmt::Debug for DirectoryReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryReader")
            .field("name", &self.name)
            .field("root", &self.root)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> BlobKey {
        BlobKey::new(4, 0, 5005).with_version(3).with_sequence(42)
    }

    #[test]
    fn store_then_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let reader = DirectoryReader::open("disk", dir.path()).unwrap();

        reader.store_blob_bytes(&key(), b"encoded").unwrap();
        reader.store_chunk_bytes(&key(), ChunkId(7), b"chunk").unwrap();

        assert_eq!(
            reader.fetch_blob_bytes(&key()).unwrap(),
            FetchOutcome::Bytes(Bytes::from_static(b"encoded"))
        );
        assert_eq!(
            reader.fetch_chunk_bytes(&key(), ChunkId(7)).unwrap(),
            Bytes::from_static(b"chunk")
        );
        assert!(dir.path().join("blobs").join("4.0.5005.3@42.blob").exists());
    }

    #[test]
    fn ids_persist_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let reader = DirectoryReader::open("disk", dir.path()).unwrap();
            reader.store_id("NC_000001.11", &key()).unwrap();
        }
        let reader = DirectoryReader::open("disk", dir.path()).unwrap();
        assert_eq!(reader.resolve_id("NC_000001.11").unwrap(), key());
    }

    #[test]
    fn reconnect_reloads_ids() {
        let dir = tempfile::tempdir().unwrap();
        let a = DirectoryReader::open("a", dir.path()).unwrap();
        let b = DirectoryReader::open("b", dir.path()).unwrap();
        a.store_id("X", &key()).unwrap();

        assert!(b.resolve_id("X").unwrap_err().is_not_found());
        b.reconnect().unwrap();
        assert_eq!(b.resolve_id("X").unwrap(), key());
    }

    #[test]
    fn missing_blob_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let reader = DirectoryReader::open("disk", dir.path()).unwrap();
        assert!(reader.fetch_blob_bytes(&key()).unwrap_err().is_not_found());
        assert!(reader
            .fetch_chunk_bytes(&key(), ChunkId(1))
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn withheld_state_file() {
        let dir = tempfile::tempdir().unwrap();
        let reader = DirectoryReader::open("disk", dir.path()).unwrap();
        reader.store_blob_bytes(&key(), b"secret").unwrap();
        reader.store_withheld(&key(), BlobState::PRIVATE).unwrap();
        assert_eq!(
            reader.fetch_blob_bytes(&key()).unwrap(),
            FetchOutcome::Withheld(BlobState::PRIVATE)
        );
    }

    #[test]
    fn corrupt_id_map_is_protocol_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(IDS_FILE), b"not json").unwrap();
        let err = DirectoryReader::open("disk", dir.path()).unwrap_err();
        assert!(matches!(err, ReaderError::Protocol { .. }));
    }
}
