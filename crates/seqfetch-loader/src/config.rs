use std::time::Duration;

use seqfetch_reader::RetryPolicy;
use serde::{Deserialize, Serialize};

use crate::error::{LoaderError, LoaderResult};

/// How an external identifier is turned into a blob key.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolvePolicy {
    /// Walk the readers in priority order; the first that knows the id wins.
    #[default]
    FirstFound,
    /// Ask every selected reader and settle disagreements with
    /// [`Orchestrator::resolve_conflict`](crate::Orchestrator::resolve_conflict).
    Consensus,
}

/// Configuration for the orchestrator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Colon-separated reader selection; `*` or an empty entry means every
    /// configured reader.
    pub readers: String,
    /// Reconnect-and-retry attempts after a connection failure.
    pub max_connection_retries: u32,
    /// Delay in milliseconds before the first retry; grows linearly per
    /// attempt.
    pub retry_backoff_ms: u64,
    /// Milliseconds a waiter blocks on someone else's fetch before giving up.
    pub lock_wait_timeout_ms: u64,
    /// Load-lock shard count. Derived from the readers' concurrency hints
    /// when unset.
    pub lock_shards: Option<usize>,
    pub resolve_policy: ResolvePolicy,
    /// Processor used to re-encode blobs for write-through caches.
    pub write_through_format: String,
    /// Entry count above which an insert triggers a GC pass; 0 disables.
    pub gc_threshold: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            readers: "*".to_string(),
            max_connection_retries: 3,
            retry_backoff_ms: 50,
            lock_wait_timeout_ms: 30_000,
            lock_shards: None,
            resolve_policy: ResolvePolicy::FirstFound,
            write_through_format: "whole".to_string(),
            gc_threshold: 1024,
        }
    }
}

impl LoaderConfig {
    /// Parse a TOML fragment. Missing keys take their defaults.
    pub fn from_toml_str(text: &str) -> LoaderResult<Self> {
        let config: Self = toml::from_str(text).map_err(|e| LoaderError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> LoaderResult<()> {
        if self.lock_shards == Some(0) {
            return Err(LoaderError::Config("lock_shards must be at least 1".into()));
        }
        if self.write_through_format.is_empty() {
            return Err(LoaderError::Config("write_through_format is empty".into()));
        }
        Ok(())
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn lock_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_wait_timeout_ms)
    }

    /// The retry policy applied to `Connection` failures.
    pub fn retry_policy(&self) -> RetryPolicy {
        let backoff = self.retry_backoff();
        RetryPolicy {
            max_retries: self.max_connection_retries,
            base_backoff: backoff,
            jitter: backoff / 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = LoaderConfig::default();
        assert_eq!(config.readers, "*");
        assert_eq!(config.max_connection_retries, 3);
        assert_eq!(config.lock_wait_timeout(), Duration::from_secs(30));
        assert_eq!(config.resolve_policy, ResolvePolicy::FirstFound);
        assert_eq!(config.gc_threshold, 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn toml_overrides_and_defaults() {
        let config = LoaderConfig::from_toml_str(
            r#"
            readers = "cache:primary"
            retry_backoff_ms = 5
            lock_wait_timeout_ms = 1500
            resolve_policy = "consensus"
            "#,
        )
        .unwrap();
        assert_eq!(config.readers, "cache:primary");
        assert_eq!(config.retry_backoff(), Duration::from_millis(5));
        assert_eq!(config.lock_wait_timeout(), Duration::from_millis(1500));
        assert_eq!(config.resolve_policy, ResolvePolicy::Consensus);
        assert_eq!(config.write_through_format, "whole");
        assert_eq!(config.lock_shards, None);
    }

    #[test]
    fn toml_errors_are_config_errors() {
        assert!(matches!(
            LoaderConfig::from_toml_str("resolve_policy = \"vote\""),
            Err(LoaderError::Config(_))
        ));
        assert!(matches!(
            LoaderConfig::from_toml_str("lock_shards = 0"),
            Err(LoaderError::Config(_))
        ));
    }

    #[test]
    fn toml_round_trip() {
        let config = LoaderConfig {
            lock_shards: Some(8),
            gc_threshold: 0,
            ..Default::default()
        };
        let text = toml::to_string(&config).unwrap();
        assert_eq!(LoaderConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn retry_policy_follows_config() {
        let config = LoaderConfig {
            max_connection_retries: 7,
            retry_backoff_ms: 100,
            ..Default::default()
        };
        let policy = config.retry_policy();
        assert_eq!(policy.max_retries, 7);
        assert_eq!(policy.base_backoff, Duration::from_millis(100));
        assert_eq!(policy.jitter, Duration::from_millis(20));
    }
}
