//! Engine configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::models::ProcessingParams;

/// Default heartbeat staleness before a run is considered abandoned.
pub const DEFAULT_STALENESS_SECS: u64 = 300;

/// Configuration for the processing engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Path to the SQLite database.
    pub db_path: PathBuf,
    /// Directory for immutable artifact blobs.
    pub blobs_dir: PathBuf,
    /// Secret for keyed content addressing. Backend-held; never logged.
    pub address_secret: String,
    /// Heartbeat age after which a run is eligible for orphan recovery.
    #[serde(default = "default_staleness_secs")]
    pub staleness_secs: u64,
    /// Maximum phases (and units within a phase) dispatched concurrently
    /// for one run.
    #[serde(default = "default_fanout")]
    pub max_fanout: usize,
    /// Per-analyzer-unit wall-clock timeout.
    #[serde(default = "default_unit_timeout_secs")]
    pub unit_timeout_secs: u64,
    /// Transient-failure retry budget per unit.
    #[serde(default = "default_unit_retries")]
    pub unit_retries: u32,
    /// Base delay for exponential backoff between unit retries.
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    /// Worker count for batch processing of queued runs.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Extraction parameters folded into the content address.
    #[serde(default)]
    pub params: ProcessingParams,
}

fn default_staleness_secs() -> u64 {
    DEFAULT_STALENESS_SECS
}

fn default_fanout() -> usize {
    4
}

fn default_unit_timeout_secs() -> u64 {
    120
}

fn default_unit_retries() -> u32 {
    3
}

fn default_retry_base_ms() -> u64 {
    250
}

fn default_workers() -> usize {
    4
}

impl EngineConfig {
    /// Minimal config rooted at a data directory, for embedding and tests.
    pub fn at(data_dir: &Path, address_secret: &str) -> Self {
        Self {
            db_path: data_dir.join("lexpipe.db"),
            blobs_dir: data_dir.join("blobs"),
            address_secret: address_secret.to_string(),
            staleness_secs: default_staleness_secs(),
            max_fanout: default_fanout(),
            unit_timeout_secs: default_unit_timeout_secs(),
            unit_retries: default_unit_retries(),
            retry_base_ms: default_retry_base_ms(),
            workers: default_workers(),
            params: ProcessingParams::default(),
        }
    }

    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| EngineError::FatalConfig(format!("read {}: {e}", path.display())))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| EngineError::FatalConfig(format!("parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.address_secret.is_empty() {
            return Err(EngineError::FatalConfig(
                "address_secret must not be empty".into(),
            ));
        }
        if self.max_fanout == 0 {
            return Err(EngineError::FatalConfig("max_fanout must be >= 1".into()));
        }
        if self.workers == 0 {
            return Err(EngineError::FatalConfig("workers must be >= 1".into()));
        }
        Ok(())
    }

    pub fn staleness(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.staleness_secs as i64)
    }

    pub fn unit_timeout(&self) -> Duration {
        Duration::from_secs(self.unit_timeout_secs)
    }

    /// Backoff delay before retry `attempt` (1-based), doubling each time.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.retry_base_ms.saturating_mul(factor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = EngineConfig::at(Path::new("/tmp/lex"), "s3cret");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_secret_rejected() {
        let config = EngineConfig::at(Path::new("/tmp/lex"), "");
        assert!(matches!(config.validate(), Err(EngineError::FatalConfig(_))));
    }

    #[test]
    fn test_retry_delay_doubles() {
        let config = EngineConfig::at(Path::new("/tmp/lex"), "s");
        assert_eq!(config.retry_delay(1), Duration::from_millis(250));
        assert_eq!(config.retry_delay(2), Duration::from_millis(500));
        assert_eq!(config.retry_delay(3), Duration::from_millis(1000));
    }

    #[test]
    fn test_load_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.toml");
        std::fs::write(
            &path,
            r#"
db_path = "/tmp/lex/lexpipe.db"
blobs_dir = "/tmp/lex/blobs"
address_secret = "s3cret"
max_fanout = 8
"#,
        )
        .unwrap();
        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.max_fanout, 8);
        assert_eq!(config.unit_retries, 3);
    }
}
