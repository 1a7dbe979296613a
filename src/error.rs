use std::fmt;
use thiserror::Error;

/// A record failed its dataset's declared schema.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("validation failed for {dataset}.{field}: {reason}")]
pub struct ValidationError {
    pub dataset: String,
    pub field: String,
    pub reason: String,
}

/// A transform rule's precondition did not hold for a record.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("transform '{rule}' failed for {dataset}.{field}: {reason}")]
pub struct TransformError {
    pub dataset: String,
    pub rule: String,
    pub field: String,
    pub reason: String,
}

#[derive(Error, Debug)]
pub enum CurateError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error("storage unavailable for {dataset}/{partition}: {message}")]
    StorageUnavailable {
        dataset: String,
        partition: String,
        message: String,
    },

    #[error("partition conflict on {dataset}/{partition}: another writer holds the partition")]
    PartitionConflict { dataset: String, partition: String },

    #[error("catalog conflict for '{name}': {message}")]
    CatalogConflict { name: String, message: String },

    #[error("partition {dataset}/{partition} timed out after {seconds}s")]
    Timeout {
        dataset: String,
        partition: String,
        seconds: u64,
    },

    #[error("run cancelled before {dataset}/{partition} was committed")]
    Cancelled { dataset: String, partition: String },

    #[error("unknown dataset: {0}")]
    UnknownDataset(String),

    #[error("invalid dataset definition '{dataset}': {message}")]
    Definition { dataset: String, message: String },

    #[error("aggregation failed for {name}: {message}")]
    Aggregate { name: String, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON deserialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML deserialization failed: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("Identity index error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl CurateError {
    /// Only transient storage failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CurateError::StorageUnavailable { .. })
    }

    pub fn storage(dataset: &str, partition: &str, err: impl fmt::Display) -> Self {
        CurateError::StorageUnavailable {
            dataset: dataset.to_string(),
            partition: partition.to_string(),
            message: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CurateError>;

/// Processing stage a failure is attributed to in run reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Read,
    Validate,
    Transform,
    Dedup,
    Commit,
    Aggregate,
    Publish,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Read => "read",
            Stage::Validate => "validate",
            Stage::Transform => "transform",
            Stage::Dedup => "dedup",
            Stage::Commit => "commit",
            Stage::Aggregate => "aggregate",
            Stage::Publish => "publish",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operator-facing failure record: where it happened and why.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct StageFailure {
    pub dataset: String,
    pub partition: String,
    pub stage: Stage,
    pub reason: String,
    pub retryable: bool,
}

impl StageFailure {
    pub fn new(dataset: &str, partition: &str, stage: Stage, err: &CurateError) -> Self {
        Self {
            dataset: dataset.to_string(),
            partition: partition.to_string(),
            stage,
            reason: err.to_string(),
            retryable: err.is_retryable(),
        }
    }
}

impl fmt::Display for StageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} [{}]: {}",
            self.dataset, self.partition, self.stage, self.reason
        )
    }
}
