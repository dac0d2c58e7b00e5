//! Engine configuration.
//!
//! Every field has a default, so an empty TOML document is a valid config.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Validation(String),
}

/// How an idle worker picks the peer it tries to steal from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum VictimPolicy {
    /// Uniform-random among live peers.
    #[default]
    Random,
    /// Same-cluster peers first, remote peers after.
    ClusterAware,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// How long a thief waits for a steal reply before giving up on the victim.
    pub steal_wait_timeout_ms: u64,
    /// Victims asked per idle round before backing off.
    pub max_steal_attempts: usize,
    pub backoff_min_ms: u64,
    pub backoff_max_ms: u64,
    pub victim_policy: VictimPolicy,
    /// Write results to the Global Result Table and recover orphans on worker death.
    pub fault_tolerance: bool,
    /// Shared-object writes buffered before a broadcast is forced.
    pub so_batch_size: usize,
    /// How long a thief waits for one shared object fetched to satisfy a guard.
    pub guard_fetch_timeout_ms: u64,
    pub stats_interval_secs: u64,
    pub log_level: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            steal_wait_timeout_ms: 2_000,
            max_steal_attempts: 3,
            backoff_min_ms: 1,
            backoff_max_ms: 50,
            victim_policy: VictimPolicy::Random,
            fault_tolerance: true,
            so_batch_size: 1,
            guard_fetch_timeout_ms: 2_000,
            stats_interval_secs: 5,
            log_level: "info".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_steal_attempts == 0 {
            return Err(ConfigError::Validation(
                "max_steal_attempts must be at least 1".to_string(),
            ));
        }
        if self.backoff_min_ms > self.backoff_max_ms {
            return Err(ConfigError::Validation(format!(
                "backoff_min_ms ({}) exceeds backoff_max_ms ({})",
                self.backoff_min_ms, self.backoff_max_ms
            )));
        }
        if self.so_batch_size == 0 {
            return Err(ConfigError::Validation(
                "so_batch_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn steal_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.steal_wait_timeout_ms)
    }

    pub fn guard_fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.guard_fetch_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_document_gives_defaults() {
        let config = EngineConfig::from_toml("").unwrap();
        assert_eq!(config.max_steal_attempts, 3);
        assert_eq!(config.victim_policy, VictimPolicy::Random);
        assert!(config.fault_tolerance);
    }

    #[test]
    fn test_partial_document_overrides() {
        let config = EngineConfig::from_toml(
            r#"
            victim_policy = "cluster_aware"
            fault_tolerance = false
            so_batch_size = 8
            "#,
        )
        .unwrap();

        assert_eq!(config.victim_policy, VictimPolicy::ClusterAware);
        assert!(!config.fault_tolerance);
        assert_eq!(config.so_batch_size, 8);
        assert_eq!(config.steal_wait_timeout_ms, 2_000);
        assert_eq!(config.guard_fetch_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn test_invalid_backoff_rejected() {
        let result = EngineConfig::from_toml("backoff_min_ms = 100\nbackoff_max_ms = 10");
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_zero_steal_attempts_rejected() {
        let result = EngineConfig::from_toml("max_steal_attempts = 0");
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "steal_wait_timeout_ms = 250").unwrap();

        let config = EngineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.steal_wait_timeout(), Duration::from_millis(250));
    }
}
