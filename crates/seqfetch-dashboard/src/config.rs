use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DashboardError, DashboardResult};

/// Timeouts and retry budget for a dashboard.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DashboardConfig {
    /// Milliseconds after which the driver logs a soft timeout and keeps
    /// waiting.
    pub soft_timeout_ms: u64,
    /// Milliseconds after which every open request is settled.
    pub hard_timeout_ms: u64,
    /// Retriever instances a factory may create, the first one included.
    pub default_tries: u32,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            soft_timeout_ms: 10_000,
            hard_timeout_ms: 30_000,
            default_tries: 2,
        }
    }
}

impl DashboardConfig {
    pub fn from_toml_str(text: &str) -> DashboardResult<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| DashboardError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn soft_timeout(&self) -> Duration {
        Duration::from_millis(self.soft_timeout_ms)
    }

    pub fn hard_timeout(&self) -> Duration {
        Duration::from_millis(self.hard_timeout_ms)
    }

    pub fn validate(&self) -> DashboardResult<()> {
        if self.hard_timeout_ms < self.soft_timeout_ms {
            return Err(DashboardError::Config(format!(
                "hard timeout {}ms is shorter than soft timeout {}ms",
                self.hard_timeout_ms, self.soft_timeout_ms
            )));
        }
        if self.default_tries == 0 {
            return Err(DashboardError::Config("default_tries must be at least 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = DashboardConfig::default();
        assert_eq!(config.soft_timeout(), Duration::from_secs(10));
        assert_eq!(config.hard_timeout(), Duration::from_secs(30));
        assert_eq!(config.default_tries, 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn toml_fragment() {
        let config = DashboardConfig::from_toml_str("soft_timeout_ms = 250\nhard_timeout_ms = 1000").unwrap();
        assert_eq!(config.soft_timeout(), Duration::from_millis(250));
        assert_eq!(config.hard_timeout(), Duration::from_secs(1));
        assert_eq!(config.default_tries, 2);
    }

    #[test]
    fn hard_before_soft_is_rejected() {
        assert!(matches!(
            DashboardConfig::from_toml_str("soft_timeout_ms = 500\nhard_timeout_ms = 100"),
            Err(DashboardError::Config(_))
        ));
        assert!(matches!(
            DashboardConfig::from_toml_str("default_tries = 0"),
            Err(DashboardError::Config(_))
        ));
    }
}
