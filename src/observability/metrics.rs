//! Metrics for the curation pipeline.
//!
//! Every metric name lives in [`MetricName`]; recording functions are grouped
//! by pipeline phase. The binary installs a Prometheus recorder with [`init`];
//! without one, recording is a no-op.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::fmt;
use std::sync::OnceLock;
use tracing::info;

/// Enum representing all metric names used in the system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricName {
    // Storage
    StoragePartitionsCommitted,
    StorageRowsCommitted,
    StorageRetries,

    // Schema enforcement
    SchemaRecordsValidated,
    SchemaRecordsRejected,
    SchemaRecordsQuarantined,

    // Transform
    TransformRecordsTransformed,
    TransformRecordsErrored,
    TransformRecordsFiltered,
    TransformNullsPropagated,

    // Dedup
    DedupRecordsDropped,

    // Aggregation
    AggregateRowsWritten,
    AggregateWindowsIncomplete,

    // Catalog
    CatalogPublishes,
    CatalogConflicts,

    // Orchestration
    PartitionsProcessed,
    PartitionsFailed,
    PartitionsSkippedUnchanged,
    PartitionDuration,
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl MetricName {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricName::StoragePartitionsCommitted => "curator_storage_partitions_committed_total",
            MetricName::StorageRowsCommitted => "curator_storage_rows_committed_total",
            MetricName::StorageRetries => "curator_storage_retries_total",
            MetricName::SchemaRecordsValidated => "curator_schema_records_validated_total",
            MetricName::SchemaRecordsRejected => "curator_schema_records_rejected_total",
            MetricName::SchemaRecordsQuarantined => "curator_schema_records_quarantined_total",
            MetricName::TransformRecordsTransformed => "curator_transform_records_transformed_total",
            MetricName::TransformRecordsErrored => "curator_transform_records_errored_total",
            MetricName::TransformRecordsFiltered => "curator_transform_records_filtered_total",
            MetricName::TransformNullsPropagated => "curator_transform_nulls_propagated_total",
            MetricName::DedupRecordsDropped => "curator_dedup_records_dropped_total",
            MetricName::AggregateRowsWritten => "curator_aggregate_rows_written_total",
            MetricName::AggregateWindowsIncomplete => "curator_aggregate_windows_incomplete_total",
            MetricName::CatalogPublishes => "curator_catalog_publishes_total",
            MetricName::CatalogConflicts => "curator_catalog_conflicts_total",
            MetricName::PartitionsProcessed => "curator_partitions_processed_total",
            MetricName::PartitionsFailed => "curator_partitions_failed_total",
            MetricName::PartitionsSkippedUnchanged => "curator_partitions_skipped_unchanged_total",
            MetricName::PartitionDuration => "curator_partition_duration_seconds",
        }
    }

    /// All metric names, for listing and tests.
    pub fn all_metrics() -> impl Iterator<Item = MetricName> {
        use MetricName::*;
        [
            StoragePartitionsCommitted,
            StorageRowsCommitted,
            StorageRetries,
            SchemaRecordsValidated,
            SchemaRecordsRejected,
            SchemaRecordsQuarantined,
            TransformRecordsTransformed,
            TransformRecordsErrored,
            TransformRecordsFiltered,
            TransformNullsPropagated,
            DedupRecordsDropped,
            AggregateRowsWritten,
            AggregateWindowsIncomplete,
            CatalogPublishes,
            CatalogConflicts,
            PartitionsProcessed,
            PartitionsFailed,
            PartitionsSkippedUnchanged,
            PartitionDuration,
        ]
        .into_iter()
    }
}

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder. Calling it twice is an error.
pub fn init() -> Result<(), Box<dyn std::error::Error>> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus recorder: {}", e))?;
    METRICS_HANDLE.set(handle).ok();
    info!("Metrics system initialized");
    Ok(())
}

/// Prometheus text snapshot, if a recorder was installed.
pub fn render() -> Option<String> {
    METRICS_HANDLE.get().map(|handle| handle.render())
}

// ============================================================================
// Storage Metrics
// ============================================================================

pub mod storage {
    use super::MetricName;

    pub fn partition_committed(tier: &'static str, rows: usize) {
        ::metrics::counter!(MetricName::StoragePartitionsCommitted.as_str(), "tier" => tier).increment(1);
        ::metrics::counter!(MetricName::StorageRowsCommitted.as_str(), "tier" => tier)
            .increment(rows as u64);
    }

    pub fn retry(dataset: &str) {
        ::metrics::counter!(MetricName::StorageRetries.as_str(), "dataset" => dataset.to_string())
            .increment(1);
    }
}

// ============================================================================
// Schema Enforcement Metrics
// ============================================================================

pub mod schema {
    use super::MetricName;

    pub fn records_validated(dataset: &str, count: usize) {
        ::metrics::counter!(MetricName::SchemaRecordsValidated.as_str(), "dataset" => dataset.to_string())
            .increment(count as u64);
    }

    pub fn records_rejected(dataset: &str, count: usize) {
        ::metrics::counter!(MetricName::SchemaRecordsRejected.as_str(), "dataset" => dataset.to_string())
            .increment(count as u64);
    }

    pub fn records_quarantined(dataset: &str, count: usize) {
        ::metrics::counter!(MetricName::SchemaRecordsQuarantined.as_str(), "dataset" => dataset.to_string())
            .increment(count as u64);
    }
}

// ============================================================================
// Transform Metrics
// ============================================================================

pub mod transform {
    use super::MetricName;

    pub fn batch_transformed(dataset: &str, transformed: usize, errored: usize, filtered: usize) {
        let ds = dataset.to_string();
        ::metrics::counter!(MetricName::TransformRecordsTransformed.as_str(), "dataset" => ds.clone())
            .increment(transformed as u64);
        ::metrics::counter!(MetricName::TransformRecordsErrored.as_str(), "dataset" => ds.clone())
            .increment(errored as u64);
        ::metrics::counter!(MetricName::TransformRecordsFiltered.as_str(), "dataset" => ds)
            .increment(filtered as u64);
    }

    pub fn nulls_propagated(dataset: &str, count: usize) {
        ::metrics::counter!(MetricName::TransformNullsPropagated.as_str(), "dataset" => dataset.to_string())
            .increment(count as u64);
    }
}

// ============================================================================
// Dedup Metrics
// ============================================================================

pub mod dedup {
    use super::MetricName;

    pub fn records_dropped(dataset: &str, count: usize) {
        ::metrics::counter!(MetricName::DedupRecordsDropped.as_str(), "dataset" => dataset.to_string())
            .increment(count as u64);
    }
}

// ============================================================================
// Aggregation Metrics
// ============================================================================

pub mod aggregate {
    use super::MetricName;

    pub fn rows_written(name: &str, rows: usize) {
        ::metrics::counter!(MetricName::AggregateRowsWritten.as_str(), "aggregate" => name.to_string())
            .increment(rows as u64);
    }

    pub fn window_incomplete(name: &str) {
        ::metrics::counter!(MetricName::AggregateWindowsIncomplete.as_str(), "aggregate" => name.to_string())
            .increment(1);
    }
}

// ============================================================================
// Catalog Metrics
// ============================================================================

pub mod catalog {
    use super::MetricName;

    pub fn published(outcome: &'static str) {
        ::metrics::counter!(MetricName::CatalogPublishes.as_str(), "outcome" => outcome).increment(1);
    }

    pub fn conflict() {
        ::metrics::counter!(MetricName::CatalogConflicts.as_str()).increment(1);
    }
}

// ============================================================================
// Orchestration Metrics
// ============================================================================

pub mod orchestrator {
    use super::MetricName;

    pub fn partition_processed(dataset: &str, secs: f64) {
        ::metrics::counter!(MetricName::PartitionsProcessed.as_str(), "dataset" => dataset.to_string())
            .increment(1);
        ::metrics::histogram!(MetricName::PartitionDuration.as_str(), "dataset" => dataset.to_string())
            .record(secs);
    }

    pub fn partition_failed(dataset: &str, stage: &'static str) {
        ::metrics::counter!(
            MetricName::PartitionsFailed.as_str(),
            "dataset" => dataset.to_string(),
            "stage" => stage
        )
        .increment(1);
    }

    pub fn partition_skipped_unchanged(dataset: &str) {
        ::metrics::counter!(MetricName::PartitionsSkippedUnchanged.as_str(), "dataset" => dataset.to_string())
            .increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_metric_names_are_unique_and_prefixed() {
        let names: Vec<&str> = MetricName::all_metrics().map(|m| m.as_str()).collect();
        let unique: HashSet<&str> = names.iter().copied().collect();
        assert_eq!(names.len(), unique.len());
        assert!(names.iter().all(|n| n.starts_with("curator_")));
    }

    #[test]
    fn test_recording_without_recorder_is_noop() {
        storage::partition_committed("cleaned", 3);
        dedup::records_dropped("Sales", 1);
        catalog::published("created");
    }
}
