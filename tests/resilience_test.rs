use anyhow::Result;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use tier_curator::constants::{COMMITS, COMMIT_SUMMARY, CUSTOMER};
use tier_curator::domain::{PartitionKey, RawRecord, Tier};
use tier_curator::error::Stage;
use tier_curator::pipeline::processing::CatalogPublisher;
use tier_curator::pipeline::{IdentityIndex, InMemoryPartitionStore, PartitionStore};
use tier_curator::{CurateConfig, CurateError, CurationOrchestrator, DatasetRegistry};

fn raw(v: Value) -> RawRecord {
    v.as_object().cloned().expect("test records are objects")
}

fn key(s: &str) -> PartitionKey {
    PartitionKey::new(s).unwrap()
}

fn customer(id: i64) -> RawRecord {
    raw(json!({"CustomerKey": id, "FirstName": "Ada", "LastName": format!("Lovelace{}", id)}))
}

fn fast_config() -> CurateConfig {
    let mut config = CurateConfig::default();
    config.retry.max_attempts = 3;
    config.retry.base_delay_ms = 1;
    config.retry.max_delay_ms = 5;
    config.processing.partition_timeout_secs = 1;
    config
}

fn setup(config: CurateConfig) -> (CurationOrchestrator, Arc<InMemoryPartitionStore>) {
    let store = Arc::new(InMemoryPartitionStore::new());
    let orch = CurationOrchestrator::with_components(
        config,
        DatasetRegistry::builtin(),
        store.clone(),
        Arc::new(IdentityIndex::open_in_memory().unwrap()),
        Arc::new(CatalogPublisher::in_memory()),
    );
    (orch, store)
}

#[tokio::test]
async fn test_transient_write_failures_are_retried() -> Result<()> {
    let (orch, store) = setup(fast_config());
    orch.ingest(CUSTOMER, vec![customer(1)], Some(key("snapshot"))).await?;
    store.fail_next_writes(2);

    let report = orch.run_dataset(CUSTOMER, None).await?;
    assert!(report.success(), "{:?}", report.failures);
    assert_eq!(report.partition("snapshot").unwrap().attempts, 3);

    let rows = store.read(CUSTOMER, Tier::Cleaned, &key("snapshot")).await?;
    assert_eq!(rows[0]["FullName"], json!("Ada Lovelace1"));
    Ok(())
}

#[tokio::test]
async fn test_failed_commit_keeps_previous_partition() -> Result<()> {
    let mut config = fast_config();
    config.retry.max_attempts = 1;
    let (orch, store) = setup(config);
    let snapshot = key("snapshot");

    orch.ingest(CUSTOMER, vec![customer(1)], Some(snapshot.clone())).await?;
    orch.run_dataset(CUSTOMER, None).await?;

    orch.ingest(CUSTOMER, vec![customer(2)], Some(snapshot.clone())).await?;
    store.fail_next_writes(1);
    let report = orch.run_dataset(CUSTOMER, None).await?;
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].stage, Stage::Commit);
    assert!(report.failures[0].retryable);
    assert_eq!(store.read(CUSTOMER, Tier::Cleaned, &snapshot).await?.len(), 1);

    let report = orch.run_dataset(CUSTOMER, None).await?;
    assert!(report.success());
    assert_eq!(report.total_new_records(), 1);
    assert_eq!(store.read(CUSTOMER, Tier::Cleaned, &snapshot).await?.len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_stalled_partition_times_out_without_blocking_others() -> Result<()> {
    let (orch, store) = setup(fast_config());
    orch.ingest(CUSTOMER, vec![customer(1)], Some(key("fast"))).await?;
    orch.ingest(CUSTOMER, vec![customer(2)], Some(key("slow"))).await?;
    store.delay_reads(&key("slow"), Duration::from_secs(5));

    let report = orch.run_dataset(CUSTOMER, None).await?;
    assert_eq!(report.failures.len(), 1);
    let failure = &report.failures[0];
    assert_eq!(failure.partition, "slow");
    assert_eq!(failure.stage, Stage::Read);
    assert!(failure.reason.contains("timed out"));

    assert_eq!(store.read(CUSTOMER, Tier::Cleaned, &key("fast")).await?.len(), 1);
    assert!(store.manifest(CUSTOMER, Tier::Cleaned, &key("slow")).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_cancellation_commits_nothing() -> Result<()> {
    let (orch, store) = setup(fast_config());
    orch.ingest(CUSTOMER, vec![customer(1)], Some(key("snapshot"))).await?;
    store.delay_writes(Duration::from_millis(500));

    let cancel = orch.cancellation_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    });

    let report = orch.run_dataset(CUSTOMER, None).await?;
    assert!(!report.success());
    assert!(report.failures[0].reason.contains("cancelled"));
    assert!(store.partitions(CUSTOMER, Tier::Cleaned).await?.is_empty());
    assert_eq!(store.commit_count(), 0);
    assert!(report.published.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_missing_partition_marks_window_incomplete() -> Result<()> {
    let mut config = fast_config();
    config.retry.max_attempts = 1;
    let (orch, store) = setup(config);
    orch.ingest(
        COMMITS,
        vec![
            raw(json!({"sha": "a", "author": "X", "committed_at": "2024-03-01T10:00:00Z"})),
            raw(json!({"sha": "b", "author": "X", "committed_at": "2024-03-02T10:00:00Z"})),
        ],
        None,
    )
    .await?;
    store.fail_next_reads(1);

    let report = orch.run_dataset(COMMITS, None).await?;
    assert_eq!(report.failures.len(), 1);
    let summary = report
        .aggregates
        .iter()
        .find(|a| a.name == COMMIT_SUMMARY)
        .unwrap();
    assert!(!summary.window_complete);
    assert_eq!(summary.expected_partitions.len(), 2);
    assert_eq!(summary.missing_partitions.len(), 1);

    let rows = store
        .read(COMMIT_SUMMARY, Tier::Curated, &PartitionKey::all())
        .await?;
    assert_eq!(rows[0]["commit_count"], json!(1));
    assert_eq!(rows[0]["window_complete"], json!(false));

    let report = orch.run_dataset(COMMITS, None).await?;
    assert!(report.success());
    let rows = store
        .read(COMMIT_SUMMARY, Tier::Curated, &PartitionKey::all())
        .await?;
    assert_eq!(rows[0]["commit_count"], json!(2));
    assert_eq!(rows[0]["window_complete"], json!(true));
    Ok(())
}

fn commit_a() -> RawRecord {
    raw(json!({"sha": "a", "author": "X", "committed_at": "2024-03-15T10:00:00Z"}))
}

async fn cleaned_rows(store: &InMemoryPartitionStore, partition: &str) -> Result<usize> {
    Ok(store.read(COMMITS, Tier::Cleaned, &key(partition)).await?.len())
}

async fn summary_rows(store: &InMemoryPartitionStore) -> Result<Vec<RawRecord>> {
    Ok(store
        .read(COMMIT_SUMMARY, Tier::Curated, &PartitionKey::all())
        .await?)
}

#[tokio::test]
async fn test_identity_shared_by_in_flight_partitions_is_kept_once() -> Result<()> {
    let (orch, store) = setup(fast_config());
    orch.ingest(COMMITS, vec![commit_a()], Some(key("2024-03-15"))).await?;
    orch.ingest(COMMITS, vec![commit_a()], Some(key("2024-03-16"))).await?;
    // Both partitions are read concurrently and the later one finishes first
    store.delay_reads(&key("2024-03-15"), Duration::from_millis(200));
    store.delay_reads(&key("2024-03-16"), Duration::from_millis(20));

    let report = orch.run_dataset(COMMITS, None).await?;
    assert!(report.success(), "{:?}", report.failures);
    assert_eq!(cleaned_rows(&store, "2024-03-15").await?, 1);
    assert_eq!(cleaned_rows(&store, "2024-03-16").await?, 0);
    assert_eq!(report.total_new_records(), 1);

    let summary = summary_rows(&store).await?;
    assert_eq!(summary.len(), 1);
    assert_eq!(summary[0]["commit_count"], json!(1));
    assert_eq!(summary[0]["window_complete"], json!(true));

    // Nothing moves on the next run
    let manifests = (
        store.manifest(COMMITS, Tier::Cleaned, &key("2024-03-15")).await?,
        store.manifest(COMMITS, Tier::Cleaned, &key("2024-03-16")).await?,
    );
    let commits = store.commit_count();
    let report = orch.run_dataset(COMMITS, None).await?;
    assert!(report.success(), "{:?}", report.failures);
    assert!(report.partitions.iter().all(|p| p.skipped_unchanged));
    assert_eq!(report.total_new_records(), 0);
    assert_eq!(store.commit_count(), commits);
    assert_eq!(
        store.manifest(COMMITS, Tier::Cleaned, &key("2024-03-15")).await?,
        manifests.0
    );
    assert_eq!(
        store.manifest(COMMITS, Tier::Cleaned, &key("2024-03-16")).await?,
        manifests.1
    );
    Ok(())
}

#[tokio::test]
async fn test_committed_identity_stays_where_it_was_first_committed() -> Result<()> {
    let (orch, store) = setup(fast_config());
    orch.ingest(COMMITS, vec![commit_a()], Some(key("2024-03-16"))).await?;
    orch.run_dataset(COMMITS, None).await?;
    let owner = store
        .manifest(COMMITS, Tier::Cleaned, &key("2024-03-16"))
        .await?
        .unwrap();

    // An earlier partition receives the same commit later on
    orch.ingest(COMMITS, vec![commit_a()], Some(key("2024-03-15"))).await?;
    let report = orch.run_dataset(COMMITS, None).await?;
    assert!(report.success(), "{:?}", report.failures);
    assert_eq!(cleaned_rows(&store, "2024-03-15").await?, 0);
    assert_eq!(cleaned_rows(&store, "2024-03-16").await?, 1);
    assert!(report.partition("2024-03-16").unwrap().skipped_unchanged);
    assert_eq!(
        store
            .manifest(COMMITS, Tier::Cleaned, &key("2024-03-16"))
            .await?
            .map(|m| m.generation),
        Some(owner.generation)
    );
    assert_eq!(summary_rows(&store).await?[0]["commit_count"], json!(1));
    Ok(())
}

#[tokio::test]
async fn test_unknown_dataset_is_an_error() {
    let (orch, _) = setup(fast_config());
    assert!(matches!(
        orch.run_dataset("Nope", None).await,
        Err(CurateError::UnknownDataset(_))
    ));
}
