use crate::error::{CurateError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Explicit configuration handed to each component at construction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CurateConfig {
    pub storage: StorageConfig,
    pub retry: RetryConfig,
    pub processing: ProcessingConfig,
    pub catalog: CatalogSettings,
    pub registry: RegistryConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_root: PathBuf,
    /// A partition lock older than this is treated as abandoned and reclaimed.
    pub lock_stale_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("data"),
            lock_stale_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
            max_delay_ms: 10_000,
        }
    }
}

/// What to do with a record that fails schema validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationPolicy {
    /// Discard the record (counted, logged).
    Drop,
    /// Write the record with its error to the partition's quarantine area.
    Quarantine,
    /// Fail the whole partition.
    FailBatch,
}

/// What to do when a transform rule cannot be applied to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformPolicy {
    /// Keep the record with a null derived field.
    NullPropagate,
    /// Route the record to the partition's error sink.
    ErrorSink,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    pub partition_timeout_secs: u64,
    pub max_concurrent_partitions: usize,
    pub validation_policy: ValidationPolicy,
    pub transform_policy: TransformPolicy,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            partition_timeout_secs: 300,
            max_concurrent_partitions: 4,
            validation_policy: ValidationPolicy::Quarantine,
            transform_policy: TransformPolicy::ErrorSink,
        }
    }
}

/// Names the external query engine objects are created under.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogSettings {
    pub schema: String,
    pub data_source: String,
    pub credential: String,
    pub base_uri: String,
}

impl Default for CatalogSettings {
    fn default() -> Self {
        Self {
            schema: "curated".to_string(),
            data_source: "lake_source".to_string(),
            credential: "lake_credential".to_string(),
            base_uri: "file://data".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Directory of JSON dataset definitions layered over the built-ins.
    pub datasets_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub log_dir: PathBuf,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("logs"),
        }
    }
}

impl CurateConfig {
    /// Load configuration from a TOML file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let config_content = fs::read_to_string(path).map_err(|e| {
            CurateError::Config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        let mut config = Self::from_toml_str(&config_content)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: CurateConfig = toml::from_str(content)?;
        Ok(config)
    }

    /// `CURATOR_DATA_ROOT` takes precedence over the file's data root.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(root) = std::env::var("CURATOR_DATA_ROOT") {
            if !root.trim().is_empty() {
                self.storage.data_root = PathBuf::from(root);
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(CurateError::Config(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(CurateError::Config(
                "retry.base_delay_ms must not exceed retry.max_delay_ms".to_string(),
            ));
        }
        if self.processing.max_concurrent_partitions == 0 {
            return Err(CurateError::Config(
                "processing.max_concurrent_partitions must be at least 1".to_string(),
            ));
        }
        if self.storage.lock_stale_secs == 0 {
            return Err(CurateError::Config(
                "storage.lock_stale_secs must be at least 1".to_string(),
            ));
        }
        if self.processing.partition_timeout_secs == 0 {
            return Err(CurateError::Config(
                "processing.partition_timeout_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn lock_stale_after(&self) -> Duration {
        Duration::from_secs(self.storage.lock_stale_secs)
    }

    pub fn partition_timeout(&self) -> Duration {
        Duration::from_secs(self.processing.partition_timeout_secs)
    }

    /// Configuration rooted at `data_root`, used by tests and the `ingest` command.
    pub fn with_data_root(data_root: impl Into<PathBuf>) -> Self {
        let mut config = Self::default();
        config.storage.data_root = data_root.into();
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_partial_toml_with_defaults() {
        let config = CurateConfig::from_toml_str(
            r#"
            [storage]
            data_root = "/tmp/lake"

            [processing]
            validation_policy = "fail_batch"
            transform_policy = "null_propagate"
            "#,
        )
        .unwrap();

        assert_eq!(config.storage.data_root, PathBuf::from("/tmp/lake"));
        assert_eq!(config.processing.validation_policy, ValidationPolicy::FailBatch);
        assert_eq!(config.processing.transform_policy, TransformPolicy::NullPropagate);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.catalog.schema, "curated");
        assert_eq!(config.lock_stale_after(), Duration::from_secs(600));
    }

    #[test]
    fn test_shipped_config_is_valid() {
        let config = CurateConfig::from_toml_str(include_str!("../config.toml")).unwrap();
        config.validate().unwrap();
        assert_eq!(config.processing.validation_policy, ValidationPolicy::Quarantine);
        assert_eq!(
            config.registry.datasets_dir,
            Some(PathBuf::from("registry/datasets"))
        );
    }

    #[test]
    fn test_rejects_zero_attempts() {
        let mut config = CurateConfig::default();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_lock_staleness() {
        let mut config = CurateConfig::default();
        config.storage.lock_stale_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_inverted_backoff_bounds() {
        let mut config = CurateConfig::default();
        config.retry.base_delay_ms = 5_000;
        config.retry.max_delay_ms = 100;
        assert!(config.validate().is_err());
    }
}
