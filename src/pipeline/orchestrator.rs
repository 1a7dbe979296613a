//! Runs datasets through the tiers: raw partitions are validated, cleaned,
//! deduplicated and committed in parallel, then summarized into the curated
//! tier and registered in the catalog.
//!
//! A run has three phases. Partitions are read, validated and transformed
//! concurrently. Identity ownership is then settled once for the whole run,
//! so which partition keeps a shared identity never depends on which task
//! finished first. Finally the partitions commit concurrently. A partition
//! that fails, stalls past its timeout, or is cancelled leaves its previous
//! commit in place and never takes its siblings down with it.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::processing::catalog::render_ddl;
use super::processing::{
    AggregateState, CatalogEntry, CatalogPublisher, Deduplicator, EntryMetadata, ExternalTriple,
    PublishOutcome, SchemaEnforcer, Transformer,
};
use super::report::{AggregateReport, PartitionReport, RunReport};
use super::retry::with_retry;
use super::storage::manifest::content_digest;
use super::storage::parquet_io::{COMPRESSION_CODEC, FILE_FORMAT};
use super::storage::{FsPartitionStore, IdentityIndex, PartitionStore, RejectRow};
use crate::config::{CurateConfig, TransformPolicy, ValidationPolicy};
use crate::constants::{ALL_PARTITIONS, UNDATED_PARTITION};
use crate::domain::coerce::parse_iso_date;
use crate::domain::{
    Dataset, FieldSpec, IdentityKey, PartitionKey, RawRecord, Record, RejectArea, Tier, WriteMode,
};
use crate::error::{CurateError, Result, Stage, StageFailure};
use crate::observability::metrics;
use crate::registry::DatasetRegistry;

/// Stage a partition is currently in, so a timeout or cancellation can be attributed.
#[derive(Clone)]
struct StageTracker(Arc<Mutex<Stage>>);

impl StageTracker {
    fn new() -> Self {
        StageTracker(Arc::new(Mutex::new(Stage::Read)))
    }

    fn enter(&self, stage: Stage) {
        match self.0.lock() {
            Ok(mut current) => *current = stage,
            Err(poisoned) => *poisoned.into_inner() = stage,
        }
    }

    fn current(&self) -> Stage {
        match self.0.lock() {
            Ok(current) => *current,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

/// A partition read, validated and transformed, waiting for ownership to settle.
struct PreparedPartition {
    report: PartitionReport,
    records: Vec<Record>,
    quarantine: Vec<RejectRow>,
    errors: Vec<RejectRow>,
}

/// A partition's final rows once shared identities have been assigned.
struct SettledPartition {
    report: PartitionReport,
    rows: Vec<RawRecord>,
    identities: Vec<IdentityKey>,
    quarantine: Vec<RejectRow>,
    errors: Vec<RejectRow>,
}

#[derive(Clone)]
enum Phase {
    Prepare,
    Commit(Arc<SettledPartition>),
}

impl Phase {
    fn first_stage(&self) -> Stage {
        match self {
            Phase::Prepare => Stage::Read,
            Phase::Commit(_) => Stage::Commit,
        }
    }
}

enum PhaseOutput {
    Prepared(PreparedPartition),
    Committed(PartitionReport),
}

/// Everything one partition task needs, owned so it can move onto the runtime.
struct PartitionJob {
    dataset: Arc<Dataset>,
    store: Arc<dyn PartitionStore>,
    index: Arc<IdentityIndex>,
    validation: ValidationPolicy,
    transform: TransformPolicy,
    cancel: CancellationToken,
    stage: StageTracker,
}

impl PartitionJob {
    async fn run(&self, key: &PartitionKey, phase: &Phase, attempt: u32) -> Result<PhaseOutput> {
        match phase {
            Phase::Prepare => self.prepare(key, attempt).await.map(PhaseOutput::Prepared),
            Phase::Commit(settled) => self
                .commit(key, settled, attempt)
                .await
                .map(PhaseOutput::Committed),
        }
    }

    async fn prepare(&self, key: &PartitionKey, attempt: u32) -> Result<PreparedPartition> {
        let ds = self.dataset.as_ref();
        let name = ds.name.as_str();
        let mut report = PartitionReport::new(key);
        report.attempts = attempt;

        self.stage.enter(Stage::Read);
        let batch = self.store.read_raw(name, key).await?;
        report.read = batch.records.len();
        report.malformed = batch.malformed.len();

        self.stage.enter(Stage::Validate);
        let validated = SchemaEnforcer::enforce(ds, &batch.records, self.validation)?;
        report.valid = validated.records.len();
        report.rejected = validated.rejected.len();

        self.stage.enter(Stage::Transform);
        let outcome = Transformer::new(ds)?.transform(validated.records, self.transform);
        report.transformed = outcome.records.len();
        report.errored = outcome.errors.len();
        report.filtered = outcome.filtered;
        report.nulls_propagated = outcome.nulls_propagated;

        let mut quarantine: Vec<RejectRow> = batch
            .malformed
            .iter()
            .map(|line| RejectRow {
                stage: Stage::Read,
                field: None,
                reason: line.reason.clone(),
                record: serde_json::json!({ "file": line.file, "line": line.line }),
            })
            .collect();
        if self.validation == ValidationPolicy::Quarantine {
            report.quarantined = validated.rejected.len();
            quarantine.extend(validated.rejected.into_iter().map(|r| RejectRow {
                stage: Stage::Validate,
                field: Some(r.error.field),
                reason: r.error.reason,
                record: serde_json::Value::Object(r.raw),
            }));
            metrics::schema::records_quarantined(name, report.quarantined);
        }

        let errors: Vec<RejectRow> = outcome
            .errors
            .into_iter()
            .map(|(original, e)| RejectRow {
                stage: Stage::Transform,
                field: Some(e.field),
                reason: format!("{}: {}", e.rule, e.reason),
                record: serde_json::Value::Object(original.to_json_map()),
            })
            .collect();

        Ok(PreparedPartition {
            report,
            records: outcome.records,
            quarantine,
            errors,
        })
    }

    async fn commit(
        &self,
        key: &PartitionKey,
        settled: &SettledPartition,
        attempt: u32,
    ) -> Result<PartitionReport> {
        let ds = self.dataset.as_ref();
        let name = ds.name.as_str();
        let mut report = settled.report.clone();
        report.attempts = report.attempts.max(attempt);

        self.stage.enter(Stage::Commit);
        let digest = content_digest(&settled.rows);
        let previous_keys = self.index.keys_in(name, key)?;

        let unchanged = matches!(
            self.store.manifest(name, Tier::Cleaned, key).await?,
            Some(manifest) if manifest.digest == digest
        );
        if unchanged {
            debug!("{}/{} unchanged, skipping commit", name, key);
            report.skipped_unchanged = true;
            metrics::orchestrator::partition_skipped_unchanged(name);
        } else {
            if self.cancel.is_cancelled() {
                return Err(CurateError::Cancelled {
                    dataset: name.to_string(),
                    partition: key.to_string(),
                });
            }
            self.store
                .write(
                    name,
                    Tier::Cleaned,
                    key,
                    &ds.output_schema(),
                    &settled.rows,
                    WriteMode::Overwrite,
                )
                .await?;
            report.new_records = settled
                .identities
                .iter()
                .filter(|k| !previous_keys.contains(k))
                .count();
        }
        self.index
            .replace_partition(name, key, &settled.identities, &digest)?;

        self.store
            .write_rejects(RejectArea::Quarantine, name, key, &settled.quarantine)
            .await?;
        self.store
            .write_rejects(RejectArea::Errors, name, key, &settled.errors)
            .await?;

        Ok(report)
    }
}

/// Decide which partition keeps each identity delivered in this run, then
/// dedup every prepared partition against the identities it does not own.
///
/// An identity already committed stays with the earliest partition that
/// committed it, as long as that partition still delivers it. Otherwise the
/// earliest partition delivering it in this run claims it. Partitions that are
/// not part of the run keep their identities untouched.
fn settle_ownership(
    index: &IdentityIndex,
    dataset: &Dataset,
    prepared: BTreeMap<PartitionKey, PreparedPartition>,
) -> Result<BTreeMap<PartitionKey, SettledPartition>> {
    let name = dataset.name.as_str();
    let delivered: BTreeMap<PartitionKey, HashSet<IdentityKey>> = prepared
        .iter()
        .map(|(key, p)| {
            let identities = p
                .records
                .iter()
                .map(|r| r.identity(&dataset.identity_key))
                .collect();
            (key.clone(), identities)
        })
        .collect();
    let by_name: HashMap<&str, &HashSet<IdentityKey>> = delivered
        .iter()
        .map(|(key, identities)| (key.as_str(), identities))
        .collect();

    let holders = index.holders(name)?;
    let mut owners: HashMap<IdentityKey, String> = HashMap::new();
    for (key, identities) in &delivered {
        for identity in identities {
            if owners.contains_key(identity) {
                continue;
            }
            let committed_owner = holders.get(identity).and_then(|partitions| {
                partitions.iter().find(|holder| {
                    by_name
                        .get(holder.as_str())
                        .map_or(true, |now| now.contains(identity))
                })
            });
            let owner = committed_owner.cloned().unwrap_or_else(|| key.to_string());
            owners.insert(identity.clone(), owner);
        }
    }

    let mut settled = BTreeMap::new();
    for (key, partition) in prepared {
        let owned_elsewhere: HashSet<IdentityKey> = delivered
            .get(&key)
            .into_iter()
            .flatten()
            .filter(|identity| {
                owners
                    .get(*identity)
                    .map_or(false, |owner| owner != key.as_str())
            })
            .cloned()
            .collect();
        if !owned_elsewhere.is_empty() {
            debug!(
                "{}/{}: {} identities belong to other partitions",
                name,
                key,
                owned_elsewhere.len()
            );
        }

        let deduped = Deduplicator::dedup(dataset, partition.records, &owned_elsewhere);
        let mut report = partition.report;
        report.deduplicated = deduped.dropped();
        report.written = deduped.records.len();
        let identities = deduped.identities(dataset);
        let rows = deduped.records.iter().map(Record::to_json_map).collect();
        settled.insert(
            key,
            SettledPartition {
                report,
                rows,
                identities,
                quarantine: partition.quarantine,
                errors: partition.errors,
            },
        );
    }
    Ok(settled)
}

/// Drives datasets through the raw, cleaned and curated tiers.
pub struct CurationOrchestrator {
    config: CurateConfig,
    registry: Arc<DatasetRegistry>,
    store: Arc<dyn PartitionStore>,
    index: Arc<IdentityIndex>,
    catalog: Arc<CatalogPublisher>,
    cancel: CancellationToken,
}

impl CurationOrchestrator {
    /// Filesystem store, identity index and catalog under `config.storage.data_root`.
    pub fn open(config: CurateConfig, registry: DatasetRegistry) -> Result<Self> {
        config.validate()?;
        let root = config.storage.data_root.clone();
        let store: Arc<dyn PartitionStore> =
            Arc::new(FsPartitionStore::with_lock_timeout(&root, config.lock_stale_after()));
        let index = Arc::new(IdentityIndex::open_at_root(&root)?);
        let catalog = Arc::new(CatalogPublisher::open(&root)?);
        info!("🗄️  Opened data root {}", root.display());
        Ok(Self::with_components(config, registry, store, index, catalog))
    }

    pub fn with_components(
        config: CurateConfig,
        registry: DatasetRegistry,
        store: Arc<dyn PartitionStore>,
        index: Arc<IdentityIndex>,
        catalog: Arc<CatalogPublisher>,
    ) -> Self {
        Self {
            config,
            registry: Arc::new(registry),
            store,
            index,
            catalog,
            cancel: CancellationToken::new(),
        }
    }

    /// Cancelling this token stops the run before any further commit.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn registry(&self) -> &DatasetRegistry {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn PartitionStore> {
        &self.store
    }

    pub fn catalog(&self) -> &CatalogPublisher {
        &self.catalog
    }

    pub fn config(&self) -> &CurateConfig {
        &self.config
    }

    /// Run every registered dataset, one after another.
    pub async fn run_all(&self) -> Result<Vec<RunReport>> {
        let mut reports = Vec::new();
        for name in self.registry.names() {
            if self.cancel.is_cancelled() {
                warn!("🛑 Run cancelled before dataset {}", name);
                break;
            }
            reports.push(self.run_dataset(&name, None).await?);
        }
        Ok(reports)
    }

    /// Process the raw partitions of `name` (all of them, or only `only`), then
    /// refresh its curated outputs and catalog entries.
    ///
    /// Partition-local failures are collected in the report; an `Err` means the
    /// run could not start (unknown dataset, unreadable store or index).
    #[instrument(skip(self, only), fields(dataset = %name))]
    pub async fn run_dataset(&self, name: &str, only: Option<Vec<PartitionKey>>) -> Result<RunReport> {
        let dataset = Arc::new(self.registry.get(name)?.clone());
        let mut report = RunReport::new(name);
        info!("🚀 Curating dataset {}", name);

        self.reconcile_index(&dataset).await?;

        let mut partitions = self.store.partitions(name, Tier::Raw).await?;
        if let Some(only) = &only {
            partitions.retain(|p| only.contains(p));
            for wanted in only {
                if !partitions.contains(wanted) {
                    warn!("⚠️  {}/{} has no raw data", name, wanted);
                }
            }
        }
        info!("📦 {} raw partitions to process for {}", partitions.len(), name);

        let failed = self.process_partitions(&dataset, partitions, &mut report).await;

        if self.cancel.is_cancelled() {
            warn!("🛑 {} cancelled; curated outputs left as they were", name);
        } else {
            self.build_aggregates(&dataset, &failed, &mut report).await;
            self.publish_dataset(&dataset, &mut report).await;
        }

        report.complete();
        let secs = report
            .duration()
            .map(|d| d.num_milliseconds() as f64 / 1000.0)
            .unwrap_or_default();
        if report.success() {
            info!(
                "✅ {} done in {:.2}s: {} records written, {} new",
                name,
                secs,
                report.total_written(),
                report.total_new_records()
            );
        } else {
            warn!(
                "⚠️  {} finished in {:.2}s with {} failures",
                name,
                secs,
                report.failures.len()
            );
        }
        Ok(report)
    }

    /// Prepares every partition, settles identity ownership across them, then
    /// commits. Both concurrent phases are bounded, and every partition runs
    /// each phase under its own timeout. Returns the partitions that failed.
    async fn process_partitions(
        &self,
        dataset: &Arc<Dataset>,
        partitions: Vec<PartitionKey>,
        report: &mut RunReport,
    ) -> HashSet<PartitionKey> {
        let name = dataset.name.as_str();
        let mut failed = HashSet::new();
        let jobs: BTreeMap<PartitionKey, Arc<PartitionJob>> = partitions
            .into_iter()
            .map(|key| {
                let job = Arc::new(PartitionJob {
                    dataset: Arc::clone(dataset),
                    store: Arc::clone(&self.store),
                    index: Arc::clone(&self.index),
                    validation: dataset.validation_policy_or(self.config.processing.validation_policy),
                    transform: dataset.transform_policy_or(self.config.processing.transform_policy),
                    cancel: self.cancel.clone(),
                    stage: StageTracker::new(),
                });
                (key, job)
            })
            .collect();

        let work = jobs
            .iter()
            .map(|(key, job)| (key.clone(), Arc::clone(job), Phase::Prepare))
            .collect();
        let mut prepared = BTreeMap::new();
        for (key, output) in self.run_phase(dataset, work, report, &mut failed).await {
            if let PhaseOutput::Prepared(partition) = output {
                prepared.insert(key, partition);
            }
        }
        if prepared.is_empty() {
            return failed;
        }

        let keys: Vec<PartitionKey> = prepared.keys().cloned().collect();
        let settled = if self.cancel.is_cancelled() {
            Err(CurateError::Cancelled {
                dataset: name.to_string(),
                partition: ALL_PARTITIONS.to_string(),
            })
        } else {
            settle_ownership(&self.index, dataset, prepared)
        };
        let settled = match settled {
            Ok(settled) => settled,
            Err(err) => {
                for key in keys {
                    let failure = StageFailure::new(name, key.as_str(), Stage::Dedup, &err);
                    error!("❌ {}", failure);
                    metrics::orchestrator::partition_failed(name, Stage::Dedup.as_str());
                    report.failures.push(failure);
                    failed.insert(key);
                }
                return failed;
            }
        };

        let work = settled
            .into_iter()
            .filter_map(|(key, partition)| {
                let job = Arc::clone(jobs.get(&key)?);
                Some((key, job, Phase::Commit(Arc::new(partition))))
            })
            .collect();
        for (key, output) in self.run_phase(dataset, work, report, &mut failed).await {
            if let PhaseOutput::Committed(partition_report) = output {
                info!(
                    "✅ {}/{}: read {}, valid {}, written {} ({} new){}",
                    name,
                    key,
                    partition_report.read,
                    partition_report.valid,
                    partition_report.written,
                    partition_report.new_records,
                    if partition_report.skipped_unchanged { ", unchanged" } else { "" }
                );
                report.partitions.push(partition_report);
            }
        }
        failed
    }

    /// Runs one phase for each partition concurrently (bounded), each under its
    /// own timeout and retry budget. Failures go to the report and `failed`.
    async fn run_phase(
        &self,
        dataset: &Dataset,
        work: Vec<(PartitionKey, Arc<PartitionJob>, Phase)>,
        report: &mut RunReport,
        failed: &mut HashSet<PartitionKey>,
    ) -> Vec<(PartitionKey, PhaseOutput)> {
        let semaphore = Arc::new(Semaphore::new(self.config.processing.max_concurrent_partitions.max(1)));
        let timeout = self.config.partition_timeout();
        let mut tasks = JoinSet::new();

        for (key, job, phase) in work {
            let semaphore = Arc::clone(&semaphore);
            let retry = self.config.retry.clone();

            tasks.spawn(async move {
                let name = job.dataset.name.clone();
                let fail = |stage: Stage, err: CurateError| {
                    StageFailure::new(&name, key.as_str(), stage, &err)
                };
                job.stage.enter(phase.first_stage());
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(e) => {
                        let stage = job.stage.current();
                        return (key.clone(), Err(fail(stage, CurateError::Config(e.to_string()))));
                    }
                };
                if job.cancel.is_cancelled() {
                    let err = CurateError::Cancelled {
                        dataset: name.clone(),
                        partition: key.to_string(),
                    };
                    return (key.clone(), Err(fail(job.stage.current(), err)));
                }

                let started = Instant::now();
                let work = with_retry(&retry, &job.cancel, &name, key.as_str(), |attempt| {
                    let job = Arc::clone(&job);
                    let key = key.clone();
                    let phase = phase.clone();
                    async move { job.run(&key, &phase, attempt).await }
                });
                let result = tokio::select! {
                    _ = job.cancel.cancelled() => Err(CurateError::Cancelled {
                        dataset: name.clone(),
                        partition: key.to_string(),
                    }),
                    timed = tokio::time::timeout(timeout, work) => match timed {
                        Ok(result) => result,
                        Err(_) => Err(CurateError::Timeout {
                            dataset: name.clone(),
                            partition: key.to_string(),
                            seconds: timeout.as_secs(),
                        }),
                    },
                };

                match result {
                    Ok(output) => {
                        if matches!(output, PhaseOutput::Committed(_)) {
                            metrics::orchestrator::partition_processed(&name, started.elapsed().as_secs_f64());
                        }
                        (key.clone(), Ok(output))
                    }
                    Err(err) => {
                        let stage = job.stage.current();
                        (key.clone(), Err(fail(stage, err)))
                    }
                }
            });
        }

        let mut done = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((key, Ok(output))) => done.push((key, output)),
                Ok((key, Err(failure))) => {
                    error!("❌ {}", failure);
                    metrics::orchestrator::partition_failed(&dataset.name, failure.stage.as_str());
                    failed.insert(key);
                    report.failures.push(failure);
                }
                Err(join_error) => {
                    error!("❌ Partition task for {} aborted: {}", dataset.name, join_error);
                    report.failures.push(StageFailure {
                        dataset: dataset.name.clone(),
                        partition: "unknown".to_string(),
                        stage: Stage::Commit,
                        reason: join_error.to_string(),
                        retryable: false,
                    });
                }
            }
        }
        done
    }

    /// Brings the identity index in line with the committed cleaned partitions.
    /// Needed after a crash between a commit and its index update.
    async fn reconcile_index(&self, dataset: &Dataset) -> Result<()> {
        let name = dataset.name.as_str();
        let committed = self.store.partitions(name, Tier::Cleaned).await?;
        let schema = dataset.output_schema();

        for key in &committed {
            let Some(manifest) = self.store.manifest(name, Tier::Cleaned, key).await? else {
                continue;
            };
            if self.index.partition_digest(name, key)?.as_deref() == Some(manifest.digest.as_str()) {
                continue;
            }
            warn!("🔧 Rebuilding identity index for {}/{}", name, key);
            let rows = self.store.read(name, Tier::Cleaned, key).await?;
            let records = decode_rows(dataset, key, &rows, &schema)?;
            let keys: Vec<_> = records
                .iter()
                .map(|r| r.identity(&dataset.identity_key))
                .collect();
            self.index.replace_partition(name, key, &keys, &manifest.digest)?;
        }

        let committed: HashSet<&str> = committed.iter().map(PartitionKey::as_str).collect();
        for indexed in self.index.indexed_partitions(name)? {
            if !committed.contains(indexed.as_str()) {
                debug!("Forgetting uncommitted partition {}/{}", name, indexed);
                self.index.forget_partition(name, &indexed)?;
            }
        }
        Ok(())
    }

    /// Recompute every curated output of `dataset` from its committed cleaned
    /// partitions. Partitions that are missing or failed in this run mark the
    /// window incomplete.
    async fn build_aggregates(
        &self,
        dataset: &Dataset,
        failed: &HashSet<PartitionKey>,
        report: &mut RunReport,
    ) {
        if dataset.aggregates.is_empty() {
            return;
        }
        let name = dataset.name.as_str();
        let (states, expected, missing) = match self.collect_states(dataset, failed).await {
            Ok(collected) => collected,
            Err(err) => {
                error!("❌ Aggregation of {} failed: {}", name, err);
                report
                    .failures
                    .push(StageFailure::new(name, ALL_PARTITIONS, Stage::Aggregate, &err));
                return;
            }
        };
        let complete = missing.is_empty();
        let all = PartitionKey::all();

        for state in states {
            let spec_name = state.spec().name.clone();
            let schema = dataset.aggregate_schema(state.spec());
            let rows: Vec<RawRecord> = state
                .finish(complete)
                .iter()
                .map(Record::to_json_map)
                .collect();
            match self.commit_curated(&spec_name, &all, &schema, &rows).await {
                Ok(()) => {
                    metrics::aggregate::rows_written(&spec_name, rows.len());
                    if !complete {
                        metrics::aggregate::window_incomplete(&spec_name);
                        warn!(
                            "⚠️  {} window incomplete: missing {}",
                            spec_name,
                            missing.join(", ")
                        );
                    }
                    info!("📊 {}: {} rows (complete: {})", spec_name, rows.len(), complete);
                    report.aggregates.push(AggregateReport {
                        name: spec_name,
                        rows: rows.len(),
                        window_complete: complete,
                        expected_partitions: expected.clone(),
                        missing_partitions: missing.clone(),
                    });
                }
                Err(err) => {
                    error!("❌ Writing {} failed: {}", spec_name, err);
                    report.failures.push(StageFailure::new(
                        &spec_name,
                        ALL_PARTITIONS,
                        Stage::Aggregate,
                        &err,
                    ));
                }
            }
        }
    }

    /// Per-partition states merged across the window, with the expected and
    /// missing partition names.
    async fn collect_states(
        &self,
        dataset: &Dataset,
        failed: &HashSet<PartitionKey>,
    ) -> Result<(Vec<AggregateState>, Vec<String>, Vec<String>)> {
        let name = dataset.name.as_str();
        let raw = self.store.partitions(name, Tier::Raw).await?;
        let committed = self.store.partitions(name, Tier::Cleaned).await?;
        let expected: BTreeSet<PartitionKey> = raw.into_iter().chain(committed.iter().cloned()).collect();
        let usable: BTreeSet<PartitionKey> = committed
            .into_iter()
            .filter(|p| !failed.contains(p))
            .collect();
        let missing: Vec<String> = expected
            .iter()
            .filter(|p| !usable.contains(*p))
            .map(|p| p.to_string())
            .collect();

        let schema = dataset.output_schema();
        let mut totals: Vec<AggregateState> =
            dataset.aggregates.iter().map(AggregateState::new).collect();
        for key in &usable {
            let rows = with_retry(&self.config.retry, &self.cancel, name, key.as_str(), |_| {
                self.store.read(name, Tier::Cleaned, key)
            })
            .await?;
            let records = decode_rows(dataset, key, &rows, &schema)?;
            for total in totals.iter_mut() {
                let mut partial = AggregateState::new(total.spec());
                partial.absorb(&records)?;
                total.merge(partial)?;
            }
        }
        Ok((
            totals,
            expected.iter().map(|p| p.to_string()).collect(),
            missing,
        ))
    }

    async fn commit_curated(
        &self,
        entity: &str,
        key: &PartitionKey,
        schema: &[FieldSpec],
        rows: &[RawRecord],
    ) -> Result<()> {
        let digest = content_digest(rows);
        let unchanged = matches!(
            self.store.manifest(entity, Tier::Curated, key).await?,
            Some(manifest) if manifest.digest == digest
        );
        if unchanged {
            debug!("{}/{} unchanged, skipping commit", entity, key);
            return Ok(());
        }
        with_retry(&self.config.retry, &self.cancel, entity, key.as_str(), |_| {
            self.store
                .write(entity, Tier::Curated, key, schema, rows, WriteMode::Overwrite)
        })
        .await?;
        Ok(())
    }

    /// Catalog entries for the cleaned dataset and each curated output that exists.
    async fn publish_dataset(&self, dataset: &Dataset, report: &mut RunReport) {
        let mut names = Vec::new();
        if matches!(self.store.partitions(&dataset.name, Tier::Cleaned).await, Ok(p) if !p.is_empty()) {
            names.push(dataset.name.clone());
        }
        for spec in &dataset.aggregates {
            if report.aggregates.iter().any(|a| a.name == spec.name) {
                names.push(spec.name.clone());
            }
        }

        for name in names {
            let result = self
                .entry_metadata(&name)
                .and_then(|metadata| self.catalog.publish(&name, metadata, false));
            match result {
                Ok(_) => report.published.push(name),
                Err(err) => {
                    warn!("⚠️  Not publishing '{}': {}", name, err);
                    report
                        .failures
                        .push(StageFailure::new(&dataset.name, &name, Stage::Publish, &err));
                }
            }
        }
    }

    /// Where the catalog entry `name` should point: a dataset's cleaned tier or
    /// an aggregate's curated tier.
    pub fn entry_metadata(&self, name: &str) -> Result<EntryMetadata> {
        let (tier, dataset) = match self.registry.get(name) {
            Ok(ds) => (Tier::Cleaned, ds.name.clone()),
            Err(_) => match self.registry.find_aggregate(name) {
                Some((ds, _)) => (Tier::Curated, ds.name.clone()),
                None => return Err(CurateError::UnknownDataset(name.to_string())),
            },
        };
        Ok(EntryMetadata {
            tier,
            dataset,
            location: self.store.location(name, tier),
            format: FILE_FORMAT.to_string(),
            compression: COMPRESSION_CODEC.to_string(),
        })
    }

    /// Publish `name` explicitly; `metadata` defaults to where this engine stores it.
    pub fn publish(&self, name: &str, metadata: Option<EntryMetadata>, confirm: bool) -> Result<PublishOutcome> {
        let metadata = match metadata {
            Some(m) => m,
            None => self.entry_metadata(name)?,
        };
        self.catalog.publish(name, metadata, confirm)
    }

    /// Columns an external engine sees for the entity `name`.
    pub fn entity_fields(&self, name: &str) -> Result<Vec<FieldSpec>> {
        if let Ok(ds) = self.registry.get(name) {
            return Ok(ds.output_schema());
        }
        match self.registry.find_aggregate(name) {
            Some((ds, spec)) => Ok(ds.aggregate_schema(spec)),
            None => Err(CurateError::UnknownDataset(name.to_string())),
        }
    }

    fn published_entry(&self, name: &str) -> Result<CatalogEntry> {
        self.catalog.describe(name)?.ok_or_else(|| {
            CurateError::Config(format!("no catalog entry named '{}'", name))
        })
    }

    /// Name, location and format an external engine resolves `name` through.
    pub fn external_triple(&self, name: &str) -> Result<ExternalTriple> {
        Ok(ExternalTriple::from_entry(&self.published_entry(name)?))
    }

    /// The external statements exposing the published entry `name`.
    pub fn ddl(&self, name: &str) -> Result<Vec<String>> {
        let entry = self.published_entry(name)?;
        let fields = self.entity_fields(name)?;
        Ok(render_ddl(&entry, &self.config.catalog, &fields))
    }

    /// Deposit raw records. With no explicit partition each record is routed by
    /// the date in the dataset's partition field; records without a usable date
    /// go to the `undated` partition, and datasets without a partition field
    /// land in today's partition.
    pub async fn ingest(
        &self,
        name: &str,
        records: Vec<RawRecord>,
        partition: Option<PartitionKey>,
    ) -> Result<BTreeMap<PartitionKey, usize>> {
        let dataset = self.registry.get(name)?;
        let mut routed: BTreeMap<PartitionKey, Vec<RawRecord>> = BTreeMap::new();
        for record in records {
            let key = match (&partition, &dataset.partition_field) {
                (Some(key), _) => key.clone(),
                (None, Some(field)) => route(&record, field)?,
                (None, None) => PartitionKey::from_date(chrono::Utc::now().date_naive()),
            };
            routed.entry(key).or_default().push(record);
        }

        let mut counts = BTreeMap::new();
        for (key, rows) in routed {
            with_retry(&self.config.retry, &self.cancel, name, key.as_str(), |_| {
                self.store.write(name, Tier::Raw, &key, &[], &rows, WriteMode::Append)
            })
            .await?;
            info!("📥 Deposited {} raw records into {}/{}", rows.len(), name, key);
            counts.insert(key, rows.len());
        }
        Ok(counts)
    }

    /// Deposit a line-delimited JSON file. Any line that is not a JSON object
    /// rejects the whole file before anything is written.
    pub async fn ingest_ndjson(
        &self,
        name: &str,
        path: &Path,
        partition: Option<PartitionKey>,
    ) -> Result<BTreeMap<PartitionKey, usize>> {
        let content = tokio::fs::read_to_string(path).await?;
        let mut records = Vec::new();
        for (i, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<serde_json::Value>(line)? {
                serde_json::Value::Object(map) => records.push(map),
                _ => {
                    return Err(CurateError::Config(format!(
                        "{} line {}: not a JSON object",
                        path.display(),
                        i + 1
                    )))
                }
            }
        }
        self.ingest(name, records, partition).await
    }
}

fn route(record: &RawRecord, field: &str) -> Result<PartitionKey> {
    let date = record
        .get(field)
        .and_then(|v| v.as_str())
        .and_then(parse_iso_date);
    match date {
        Some(d) => Ok(PartitionKey::from_date(d)),
        None => PartitionKey::new(UNDATED_PARTITION),
    }
}

fn decode_rows(
    dataset: &Dataset,
    partition: &PartitionKey,
    rows: &[RawRecord],
    schema: &[FieldSpec],
) -> Result<Vec<Record>> {
    rows.iter()
        .map(|row| {
            Record::from_json_typed(row, schema).map_err(|reason| CurateError::Definition {
                dataset: dataset.name.clone(),
                message: format!("stored partition {} does not match the schema: {}", partition, reason),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{CALENDAR, SALES};
    use crate::pipeline::storage::InMemoryPartitionStore;
    use serde_json::json;
    use std::time::Duration;

    fn raw(v: serde_json::Value) -> RawRecord {
        v.as_object().cloned().unwrap()
    }

    fn orchestrator() -> (CurationOrchestrator, Arc<InMemoryPartitionStore>) {
        let store = Arc::new(InMemoryPartitionStore::new());
        let mut config = CurateConfig::default();
        config.retry.base_delay_ms = 1;
        config.retry.max_delay_ms = 5;
        let orchestrator = CurationOrchestrator::with_components(
            config,
            DatasetRegistry::builtin(),
            store.clone(),
            Arc::new(IdentityIndex::open_in_memory().unwrap()),
            Arc::new(CatalogPublisher::in_memory()),
        );
        (orchestrator, store)
    }

    #[tokio::test]
    async fn test_ingest_routes_by_partition_field() {
        let (orch, store) = orchestrator();
        let counts = orch
            .ingest(
                SALES,
                vec![
                    raw(json!({"OrderNumber": "S1", "Qty": 1, "LineItem": 1, "OrderDate": "2024-03-15"})),
                    raw(json!({"OrderNumber": "S2", "Qty": 1, "LineItem": 1, "OrderDate": "2024-03-16"})),
                    raw(json!({"OrderNumber": "S3", "Qty": 1, "LineItem": 1})),
                ],
                None,
            )
            .await
            .unwrap();
        assert_eq!(counts.len(), 3);
        let partitions = store.partitions(SALES, Tier::Raw).await.unwrap();
        let names: Vec<&str> = partitions.iter().map(PartitionKey::as_str).collect();
        assert_eq!(names, vec!["2024-03-15", "2024-03-16", "undated"]);
    }

    #[tokio::test]
    async fn test_calendar_partition_is_cleaned() {
        let (orch, store) = orchestrator();
        orch.ingest(CALENDAR, vec![raw(json!({"Date": "2024-03-15"}))], None)
            .await
            .unwrap();
        let report = orch.run_dataset(CALENDAR, None).await.unwrap();
        assert!(report.success(), "{:?}", report.failures);

        let key = PartitionKey::new("2024-03-15").unwrap();
        let rows = store.read(CALENDAR, Tier::Cleaned, &key).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["Date"], json!("2024-03-15"));
        assert_eq!(rows[0]["Month"], json!(3));
        assert_eq!(rows[0]["Year"], json!(2024));
        assert_eq!(report.published, vec![CALENDAR.to_string()]);
    }

    #[tokio::test]
    async fn test_failed_partition_does_not_stop_siblings() {
        let (orch, store) = orchestrator();
        let mut config = orch.config().clone();
        config.retry.max_attempts = 1;
        let orch = CurationOrchestrator::with_components(
            config,
            DatasetRegistry::builtin(),
            store.clone(),
            Arc::new(IdentityIndex::open_in_memory().unwrap()),
            Arc::new(CatalogPublisher::in_memory()),
        );
        orch.ingest(
            CALENDAR,
            vec![raw(json!({"Date": "2024-03-15"})), raw(json!({"Date": "2024-03-16"}))],
            None,
        )
        .await
        .unwrap();
        store.fail_next_reads(1);

        let report = orch.run_dataset(CALENDAR, None).await.unwrap();
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].stage, Stage::Read);
        assert_eq!(report.partitions.len(), 1);
    }

    #[tokio::test]
    async fn test_stalled_disk_read_times_out_without_holding_up_siblings() {
        let dir = tempfile::tempdir().unwrap();
        let fs_store = Arc::new(FsPartitionStore::new(dir.path()));
        let mut config = CurateConfig::with_data_root(dir.path());
        config.processing.partition_timeout_secs = 1;
        config.retry.base_delay_ms = 1;
        config.retry.max_delay_ms = 5;
        let orch = CurationOrchestrator::with_components(
            config,
            DatasetRegistry::builtin(),
            fs_store.clone(),
            Arc::new(IdentityIndex::open_in_memory().unwrap()),
            Arc::new(CatalogPublisher::in_memory()),
        );
        orch.ingest(
            CALENDAR,
            vec![raw(json!({"Date": "2024-03-15"})), raw(json!({"Date": "2024-03-16"}))],
            None,
        )
        .await
        .unwrap();
        // The read blocks its thread outright, like a hung mount
        let stalled = PartitionKey::new("2024-03-15").unwrap();
        fs_store.stall_raw_reads(&stalled, Duration::from_secs(3));

        let started = Instant::now();
        let report = orch.run_dataset(CALENDAR, None).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(3));

        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].partition, "2024-03-15");
        assert_eq!(report.failures[0].stage, Stage::Read);
        assert!(report.failures[0].reason.contains("timed out"));
        let healthy = PartitionKey::new("2024-03-16").unwrap();
        assert_eq!(
            fs_store.read(CALENDAR, Tier::Cleaned, &healthy).await.unwrap().len(),
            1
        );
        assert!(fs_store.read(CALENDAR, Tier::Cleaned, &stalled).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_external_triple_follows_the_published_entry() {
        let (orch, _) = orchestrator();
        orch.ingest(CALENDAR, vec![raw(json!({"Date": "2024-03-15"}))], None)
            .await
            .unwrap();
        assert!(orch.external_triple(CALENDAR).is_err());

        orch.run_dataset(CALENDAR, None).await.unwrap();
        let triple = orch.external_triple(CALENDAR).unwrap();
        assert_eq!(triple.name, CALENDAR);
        assert_eq!(triple.location, "cleaned/Calendar/");
        assert_eq!(triple.format, "parquet");
    }

    #[tokio::test]
    async fn test_entry_metadata_resolves_aggregates() {
        let (orch, _) = orchestrator();
        let meta = orch.entry_metadata("SalesByTerritory").unwrap();
        assert_eq!(meta.tier, Tier::Curated);
        assert_eq!(meta.dataset, SALES);
        assert_eq!(meta.location, "curated/SalesByTerritory/");
        assert!(orch.entry_metadata("Nope").is_err());
    }

    #[test]
    fn test_route_falls_back_to_undated() {
        let record = raw(json!({"OrderDate": "15/03/2024"}));
        assert_eq!(route(&record, "OrderDate").unwrap().as_str(), UNDATED_PARTITION);
        let record = raw(json!({"OrderDate": "2024-03-15T10:00:00Z"}));
        assert_eq!(route(&record, "OrderDate").unwrap().as_str(), "2024-03-15");
    }
}
