use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::PartitionKey;
use crate::error::StageFailure;

/// Counters for one processed partition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PartitionReport {
    pub partition: String,
    pub read: usize,
    pub malformed: usize,
    pub valid: usize,
    pub rejected: usize,
    pub quarantined: usize,
    pub transformed: usize,
    pub errored: usize,
    pub filtered: usize,
    pub nulls_propagated: usize,
    pub deduplicated: usize,
    /// Records in the committed cleaned partition.
    pub written: usize,
    /// Records not present in the previous commit of this partition.
    pub new_records: usize,
    /// The partition already held exactly this content; nothing was written.
    pub skipped_unchanged: bool,
    pub attempts: u32,
}

impl PartitionReport {
    pub fn new(partition: &PartitionKey) -> Self {
        Self {
            partition: partition.to_string(),
            ..Default::default()
        }
    }
}

/// One curated output of a dataset run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateReport {
    pub name: String,
    pub rows: usize,
    pub window_complete: bool,
    pub expected_partitions: Vec<String>,
    pub missing_partitions: Vec<String>,
}

/// Result of running one dataset end to end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub dataset: String,
    pub partitions: Vec<PartitionReport>,
    pub aggregates: Vec<AggregateReport>,
    pub failures: Vec<StageFailure>,
    /// Catalog entries published or confirmed unchanged.
    pub published: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl RunReport {
    pub fn new(dataset: &str) -> Self {
        Self {
            dataset: dataset.to_string(),
            partitions: Vec::new(),
            aggregates: Vec::new(),
            failures: Vec::new(),
            published: Vec::new(),
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn complete(&mut self) {
        self.partitions.sort_by(|a, b| a.partition.cmp(&b.partition));
        self.completed_at = Some(Utc::now());
    }

    pub fn success(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn total_written(&self) -> usize {
        self.partitions.iter().map(|p| p.written).sum()
    }

    pub fn total_new_records(&self) -> usize {
        self.partitions.iter().map(|p| p.new_records).sum()
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        self.completed_at.map(|end| end - self.started_at)
    }

    pub fn partition(&self, key: &str) -> Option<&PartitionReport> {
        self.partitions.iter().find(|p| p.partition == key)
    }
}
