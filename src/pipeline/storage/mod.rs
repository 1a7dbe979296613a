// Partition-keyed storage: trait, manifests and implementations

pub mod fs;
pub mod identity_index;
pub mod in_memory;
pub mod manifest;
pub mod parquet_io;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{FieldSpec, PartitionKey, RawRecord, RejectArea, Tier, WriteMode};
use crate::error::{Result, Stage};

pub use fs::FsPartitionStore;
pub use identity_index::IdentityIndex;
pub use in_memory::InMemoryPartitionStore;
pub use manifest::CommitManifest;

/// A raw line that could not be read as a JSON object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MalformedLine {
    pub file: String,
    pub line: usize,
    pub reason: String,
}

/// Everything acquisition deposited for one raw partition, in arrival order.
#[derive(Debug, Clone, Default)]
pub struct RawBatch {
    pub records: Vec<RawRecord>,
    pub malformed: Vec<MalformedLine>,
}

/// A record held back from the cleaned tier, with the reason.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectRow {
    pub stage: Stage,
    pub field: Option<String>,
    pub reason: String,
    pub record: serde_json::Value,
}

/// Append-only, partition-keyed storage with atomic per-partition visibility.
///
/// Readers only ever observe fully committed partitions. Transient failures
/// surface as `StorageUnavailable`; a second writer on a partition that is
/// being written gets `PartitionConflict`.
#[async_trait]
pub trait PartitionStore: Send + Sync {
    /// Commit `rows` as the new content of a cleaned/curated partition
    /// (`Overwrite`) or extend it (`Append`). Raw partitions accept `Append` only.
    ///
    /// `schema` gives the typed columns of a cleaned/curated commit; raw writes
    /// are schemaless and pass an empty slice.
    async fn write(
        &self,
        dataset: &str,
        tier: Tier,
        partition: &PartitionKey,
        schema: &[FieldSpec],
        rows: &[RawRecord],
        mode: WriteMode,
    ) -> Result<CommitManifest>;

    /// Rows of a committed partition; empty when it was never committed.
    async fn read(&self, dataset: &str, tier: Tier, partition: &PartitionKey)
        -> Result<Vec<RawRecord>>;

    /// Raw records plus lines that failed to parse.
    async fn read_raw(&self, dataset: &str, partition: &PartitionKey) -> Result<RawBatch>;

    /// Committed partitions, sorted.
    async fn partitions(&self, dataset: &str, tier: Tier) -> Result<Vec<PartitionKey>>;

    async fn manifest(
        &self,
        dataset: &str,
        tier: Tier,
        partition: &PartitionKey,
    ) -> Result<Option<CommitManifest>>;

    /// Replace the reject set of a partition (idempotent across re-runs).
    async fn write_rejects(
        &self,
        area: RejectArea,
        dataset: &str,
        partition: &PartitionKey,
        rejects: &[RejectRow],
    ) -> Result<()>;

    async fn read_rejects(
        &self,
        area: RejectArea,
        dataset: &str,
        partition: &PartitionKey,
    ) -> Result<Vec<RejectRow>>;

    /// Location of a dataset's tier relative to the storage root, e.g. `cleaned/Sales/`.
    fn location(&self, dataset: &str, tier: Tier) -> String {
        format!("{}/{}/", tier.as_str(), dataset)
    }
}
