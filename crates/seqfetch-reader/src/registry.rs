use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::error::{ReaderError, ReaderResult};
use crate::gate::{ConcurrencyGate, GatePermit};
use crate::traits::{CacheWriter, Reader};

/// A reader as registered: name, priority and optional write-back half.
///
/// Lower `priority` values are tried first. Clones share one
/// [`ConcurrencyGate`], sized from the reader's concurrency hint at
/// registration.
#[derive(Clone)]
pub struct RegisteredReader {
    pub name: String,
    pub priority: u32,
    pub reader: Arc<dyn Reader>,
    pub writer: Option<Arc<dyn CacheWriter>>,
    gate: Arc<ConcurrencyGate>,
}

impl RegisteredReader {
    /// Take a slot in this reader's gate. Hold it around every backend
    /// call, reads and write-through alike.
    pub fn enter(&self) -> GatePermit<'_> {
        self.gate.enter()
    }

    pub fn gate(&self) -> &ConcurrencyGate {
        &self.gate
    }
}

impl fmt::Debug for RegisteredReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredReader")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("writable", &self.writer.is_some())
            .field("limit", &self.gate.limit())
            .finish()
    }
}

/// Explicit registry of reader backends.
///
/// Constructed and owned by the caller and passed to whatever needs it;
/// there is no process-wide instance.
#[derive(Debug, Default)]
pub struct ReaderRegistry {
    readers: HashMap<String, RegisteredReader>,
    /// Names `*` (or an empty selection entry) expands to. When empty,
    /// `*` expands to every registered reader.
    configured: Vec<String>,
}

impl ReaderRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a read-only backend.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        priority: u32,
        reader: Arc<dyn Reader>,
    ) -> ReaderResult<()> {
        self.insert(name.into(), priority, reader, None)
    }

    /// Register a backend that also accepts write-through data.
    pub fn register_writable<T>(
        &mut self,
        name: impl Into<String>,
        priority: u32,
        backend: Arc<T>,
    ) -> ReaderResult<()>
    where
        T: Reader + CacheWriter + 'static,
    {
        let reader: Arc<dyn Reader> = backend.clone();
        let writer: Arc<dyn CacheWriter> = backend;
        self.insert(name.into(), priority, reader, Some(writer))
    }

    fn insert(
        &mut self,
        name: String,
        priority: u32,
        reader: Arc<dyn Reader>,
        writer: Option<Arc<dyn CacheWriter>>,
    ) -> ReaderResult<()> {
        if self.readers.contains_key(&name) {
            return Err(ReaderError::DuplicateReader(name));
        }
        let limit = reader.concurrency_hint();
        debug!(reader = %name, priority, limit, "reader registered");
        self.readers.insert(
            name.clone(),
            RegisteredReader {
                name,
                priority,
                reader,
                writer,
                gate: Arc::new(ConcurrencyGate::new(limit)),
            },
        );
        Ok(())
    }

    /// Remove a backend. Returns `true` if it was registered.
    pub fn unregister(&mut self, name: &str) -> bool {
        self.configured.retain(|n| n != name);
        self.readers.remove(name).is_some()
    }

    /// Set the names `*` expands to (normally supplied by the configuration
    /// loader).
    pub fn set_configured<I, S>(&mut self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.configured = names.into_iter().map(Into::into).collect();
    }

    /// Number of registered readers.
    pub fn len(&self) -> usize {
        self.readers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readers.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredReader> {
        self.readers.get(name)
    }

    /// Resolve a colon-separated selection into readers ordered by priority.
    ///
    /// `"*"` or an empty entry expands to all configured readers. Duplicate
    /// names are kept once. Ties in priority are broken by name so the order
    /// is deterministic.
    pub fn select(&self, selection: &str) -> ReaderResult<ReaderSet> {
        let mut names: Vec<String> = Vec::new();
        for token in selection.split(':').map(str::trim) {
            if token.is_empty() || token == "*" {
                names.extend(self.configured_names());
            } else {
                names.push(token.to_string());
            }
        }

        let mut selected: Vec<RegisteredReader> = Vec::with_capacity(names.len());
        for name in names {
            if selected.iter().any(|r| r.name == name) {
                continue;
            }
            let entry = self
                .readers
                .get(&name)
                .ok_or_else(|| ReaderError::UnknownReader(name.clone()))?;
            selected.push(entry.clone());
        }

        if selected.is_empty() {
            return Err(ReaderError::EmptySelection(selection.to_string()));
        }
        selected.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name)));
        Ok(ReaderSet { readers: selected })
    }

    fn configured_names(&self) -> Vec<String> {
        if self.configured.is_empty() {
            let mut all: Vec<String> = self.readers.keys().cloned().collect();
            all.sort();
            all
        } else {
            self.configured.clone()
        }
    }
}

/// A priority-ordered selection of readers.
#[derive(Clone, Debug, Default)]
pub struct ReaderSet {
    readers: Vec<RegisteredReader>,
}

impl ReaderSet {
    /// Readers in the order they should be tried.
    pub fn iter(&self) -> impl Iterator<Item = &RegisteredReader> {
        self.readers.iter()
    }

    pub fn len(&self) -> usize {
        self.readers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readers.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.readers.iter().map(|r| r.name.as_str()).collect()
    }

    /// Priority of the named reader within this set.
    pub fn priority_of(&self, name: &str) -> Option<u32> {
        self.readers
            .iter()
            .find(|r| r.name == name)
            .map(|r| r.priority)
    }

    /// Largest concurrency hint across the set (0 if none needs any).
    pub fn concurrency_hint(&self) -> usize {
        self.readers
            .iter()
            .map(|r| r.reader.concurrency_hint())
            .max()
            .unwrap_or(0)
    }

    /// Write-back halves of the readers that have one.
    pub fn writers(&self) -> impl Iterator<Item = (&str, &Arc<dyn CacheWriter>)> {
        self.readers
            .iter()
            .filter_map(|r| r.writer.as_ref().map(|w| (r.name.as_str(), w)))
    }
}
