use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

use super::manifest::{content_digest, CommitManifest};
use super::{MalformedLine, PartitionStore, RawBatch, RejectRow};
use crate::domain::{FieldSpec, PartitionKey, RawRecord, RejectArea, Tier, WriteMode};
use crate::error::{CurateError, Result};

type PartitionSlot = (String, Tier, PartitionKey);

#[derive(Default)]
struct RawPartition {
    records: Vec<RawRecord>,
    malformed: Vec<MalformedLine>,
}

/// In-memory partition store for development/testing.
///
/// Supports fault injection: a number of upcoming writes or reads can be made
/// to fail with `StorageUnavailable`, and reads or writes can be slowed down.
pub struct InMemoryPartitionStore {
    raw: Arc<Mutex<HashMap<(String, PartitionKey), RawPartition>>>,
    committed: Arc<Mutex<HashMap<PartitionSlot, (CommitManifest, Vec<RawRecord>)>>>,
    rejects: Arc<Mutex<HashMap<(RejectArea, String, PartitionKey), Vec<RejectRow>>>>,
    in_flight: Arc<Mutex<HashSet<PartitionSlot>>>,
    read_delays: Arc<Mutex<HashMap<PartitionKey, Duration>>>,
    write_delay: Arc<Mutex<Option<Duration>>>,
    fail_writes: AtomicUsize,
    fail_reads: AtomicUsize,
    commits: AtomicUsize,
}

impl Default for InMemoryPartitionStore {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct InFlight {
    slots: Arc<Mutex<HashSet<PartitionSlot>>>,
    slot: PartitionSlot,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        lock(&self.slots).remove(&self.slot);
    }
}

impl InMemoryPartitionStore {
    pub fn new() -> Self {
        Self {
            raw: Arc::new(Mutex::new(HashMap::new())),
            committed: Arc::new(Mutex::new(HashMap::new())),
            rejects: Arc::new(Mutex::new(HashMap::new())),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            read_delays: Arc::new(Mutex::new(HashMap::new())),
            write_delay: Arc::new(Mutex::new(None)),
            fail_writes: AtomicUsize::new(0),
            fail_reads: AtomicUsize::new(0),
            commits: AtomicUsize::new(0),
        }
    }

    /// Make the next `n` cleaned/curated writes fail with a transient error.
    pub fn fail_next_writes(&self, n: usize) {
        self.fail_writes.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` raw reads fail with a transient error.
    pub fn fail_next_reads(&self, n: usize) {
        self.fail_reads.store(n, Ordering::SeqCst);
    }

    /// Delay every raw read of `partition`.
    pub fn delay_reads(&self, partition: &PartitionKey, delay: Duration) {
        lock(&self.read_delays).insert(partition.clone(), delay);
    }

    /// Hold every cleaned/curated write open for `delay` before committing.
    pub fn delay_writes(&self, delay: Duration) {
        *lock(&self.write_delay) = Some(delay);
    }

    /// Number of successful cleaned/curated commits so far.
    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    /// Deposit lines acquisition could not parse, as the raw reader would report them.
    pub fn add_malformed(&self, dataset: &str, partition: &PartitionKey, line: MalformedLine) {
        lock(&self.raw)
            .entry((dataset.to_string(), partition.clone()))
            .or_default()
            .malformed
            .push(line);
    }

    fn take_fault(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn begin_write(&self, slot: PartitionSlot) -> Result<InFlight> {
        let mut in_flight = lock(&self.in_flight);
        if !in_flight.insert(slot.clone()) {
            return Err(CurateError::PartitionConflict {
                dataset: slot.0,
                partition: slot.2.to_string(),
            });
        }
        Ok(InFlight {
            slots: Arc::clone(&self.in_flight),
            slot,
        })
    }
}

#[async_trait]
impl PartitionStore for InMemoryPartitionStore {
    async fn write(
        &self,
        dataset: &str,
        tier: Tier,
        partition: &PartitionKey,
        _schema: &[FieldSpec],
        rows: &[RawRecord],
        mode: WriteMode,
    ) -> Result<CommitManifest> {
        if tier == Tier::Raw {
            if mode == WriteMode::Overwrite {
                return Err(CurateError::Config("the raw tier is append-only".to_string()));
            }
            lock(&self.raw)
                .entry((dataset.to_string(), partition.clone()))
                .or_default()
                .records
                .extend_from_slice(rows);
            return Ok(CommitManifest {
                dataset: dataset.to_string(),
                tier,
                partition: partition.clone(),
                generation: 0,
                files: Vec::new(),
                record_count: rows.len(),
                digest: content_digest(rows),
                committed_at: Utc::now(),
            });
        }

        let slot = (dataset.to_string(), tier, partition.clone());
        let _guard = self.begin_write(slot.clone())?;

        let delay = *lock(&self.write_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if Self::take_fault(&self.fail_writes) {
            return Err(CurateError::storage(
                dataset,
                partition.as_str(),
                "injected write failure",
            ));
        }

        let mut committed = lock(&self.committed);
        let previous = committed.get(&slot);
        let mut all_rows = match (previous, mode) {
            (Some((_, existing)), WriteMode::Append) => existing.clone(),
            _ => Vec::new(),
        };
        all_rows.extend_from_slice(rows);
        let generation = previous.map(|(m, _)| m.generation + 1).unwrap_or(1);
        let manifest = CommitManifest {
            dataset: dataset.to_string(),
            tier,
            partition: partition.clone(),
            generation,
            files: if all_rows.is_empty() {
                Vec::new()
            } else {
                vec![format!("part-{:06}", generation)]
            },
            record_count: all_rows.len(),
            digest: content_digest(&all_rows),
            committed_at: Utc::now(),
        };
        committed.insert(slot, (manifest.clone(), all_rows));
        self.commits.fetch_add(1, Ordering::SeqCst);
        debug!("Committed {}/{}/{} in memory", tier, dataset, partition);
        Ok(manifest)
    }

    async fn read(&self, dataset: &str, tier: Tier, partition: &PartitionKey) -> Result<Vec<RawRecord>> {
        if tier == Tier::Raw {
            return Ok(self.read_raw(dataset, partition).await?.records);
        }
        let committed = lock(&self.committed);
        Ok(committed
            .get(&(dataset.to_string(), tier, partition.clone()))
            .map(|(_, rows)| rows.clone())
            .unwrap_or_default())
    }

    async fn read_raw(&self, dataset: &str, partition: &PartitionKey) -> Result<RawBatch> {
        let delay = lock(&self.read_delays).get(partition).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if Self::take_fault(&self.fail_reads) {
            return Err(CurateError::storage(
                dataset,
                partition.as_str(),
                "injected read failure",
            ));
        }
        let raw = lock(&self.raw);
        Ok(raw
            .get(&(dataset.to_string(), partition.clone()))
            .map(|p| RawBatch {
                records: p.records.clone(),
                malformed: p.malformed.clone(),
            })
            .unwrap_or_default())
    }

    async fn partitions(&self, dataset: &str, tier: Tier) -> Result<Vec<PartitionKey>> {
        let mut keys: Vec<PartitionKey> = if tier == Tier::Raw {
            lock(&self.raw)
                .iter()
                .filter(|((ds, _), p)| {
                    ds == dataset && !(p.records.is_empty() && p.malformed.is_empty())
                })
                .map(|((_, key), _)| key.clone())
                .collect()
        } else {
            lock(&self.committed)
                .keys()
                .filter(|(ds, t, _)| ds == dataset && *t == tier)
                .map(|(_, _, key)| key.clone())
                .collect()
        };
        keys.sort();
        Ok(keys)
    }

    async fn manifest(
        &self,
        dataset: &str,
        tier: Tier,
        partition: &PartitionKey,
    ) -> Result<Option<CommitManifest>> {
        Ok(lock(&self.committed)
            .get(&(dataset.to_string(), tier, partition.clone()))
            .map(|(m, _)| m.clone()))
    }

    async fn write_rejects(
        &self,
        area: RejectArea,
        dataset: &str,
        partition: &PartitionKey,
        rejects: &[RejectRow],
    ) -> Result<()> {
        let mut map = lock(&self.rejects);
        let key = (area, dataset.to_string(), partition.clone());
        if rejects.is_empty() {
            map.remove(&key);
        } else {
            map.insert(key, rejects.to_vec());
        }
        Ok(())
    }

    async fn read_rejects(
        &self,
        area: RejectArea,
        dataset: &str,
        partition: &PartitionKey,
    ) -> Result<Vec<RejectRow>> {
        Ok(lock(&self.rejects)
            .get(&(area, dataset.to_string(), partition.clone()))
            .cloned()
            .unwrap_or_default())
    }
}
