use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Running counters for one orchestrator.
#[derive(Debug, Default)]
pub struct LoaderStats {
    pub(crate) resolutions: AtomicU64,
    pub(crate) resolve_cache_hits: AtomicU64,
    pub(crate) cache_hits: AtomicU64,
    pub(crate) backend_fetches: AtomicU64,
    pub(crate) chunk_fetches: AtomicU64,
    pub(crate) bytes_fetched: AtomicU64,
    pub(crate) retries: AtomicU64,
    pub(crate) evictions: AtomicU64,
    pub(crate) write_failures: AtomicU64,
}

/// A point-in-time copy of [`LoaderStats`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Identifier resolutions that went to a backend.
    pub resolutions: u64,
    /// Identifier resolutions answered from the resolution cache.
    pub resolve_cache_hits: u64,
    /// `get_blob` calls answered without any backend call.
    pub cache_hits: u64,
    /// Blob fetch calls issued to backends, retries included.
    pub backend_fetches: u64,
    pub chunk_fetches: u64,
    pub bytes_fetched: u64,
    pub retries: u64,
    pub evictions: u64,
    /// Write-through stores that failed (logged, never fatal).
    pub write_failures: u64,
}

impl LoaderStats {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            resolutions: get(&self.resolutions),
            resolve_cache_hits: get(&self.resolve_cache_hits),
            cache_hits: get(&self.cache_hits),
            backend_fetches: get(&self.backend_fetches),
            chunk_fetches: get(&self.chunk_fetches),
            bytes_fetched: get(&self.bytes_fetched),
            retries: get(&self.retries),
            evictions: get(&self.evictions),
            write_failures: get(&self.write_failures),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let stats = LoaderStats::default();
        LoaderStats::bump(&stats.cache_hits);
        LoaderStats::bump(&stats.cache_hits);
        LoaderStats::add(&stats.bytes_fetched, 512);
        let snap = stats.snapshot();
        assert_eq!(snap.cache_hits, 2);
        assert_eq!(snap.bytes_fetched, 512);
        assert_eq!(snap.evictions, 0);
    }

    #[test]
    fn snapshot_serializes() {
        let snap = StatsSnapshot {
            retries: 3,
            ..Default::default()
        };
        let json = serde_json::to_string(&snap).unwrap();
        assert!(json.contains("\"retries\":3"));
        let back: StatsSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, snap);
    }
}
