use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use super::manifest::{content_digest, write_atomic, CommitManifest};
use super::parquet_io;
use super::{MalformedLine, PartitionStore, RawBatch, RejectRow};
use crate::constants::{LOCK_FILE, MANIFEST_FILE, REJECTS_FILE};
use crate::domain::{FieldSpec, PartitionKey, RawRecord, RejectArea, Tier, WriteMode};
use crate::error::{CurateError, Result};
use crate::observability::metrics;

const DEFAULT_LOCK_STALE_AFTER: Duration = Duration::from_secs(600);

/// Local-filesystem partition store following the tier layout:
///
/// ```text
/// <root>/raw/<dataset>/<YYYY>/<MM>/<DD>/*.ndjson
/// <root>/cleaned/<dataset>/<partition>/{_manifest.json, part-*.parquet}
/// <root>/curated/<dataset>/<partition>/{_manifest.json, part-*.parquet}
/// <root>/{quarantine,errors}/<dataset>/<partition>/rejects.ndjson
/// ```
///
/// A cleaned/curated partition is visible only through its manifest, which is
/// swapped in by rename after the data file is durable. Data files not named
/// by the manifest are leftovers of interrupted writes and are never read.
///
/// All file work runs on the blocking pool so a slow disk never stalls the
/// runtime driving timeouts and cancellation.
pub struct FsPartitionStore {
    inner: Arc<FsInner>,
}

pub(crate) struct FsInner {
    root: PathBuf,
    lock_stale_after: Duration,
    #[cfg(test)]
    hooks: test_hooks::Hooks,
}

/// Exclusive per-partition write lock, released on drop (including cancellation).
struct PartitionLock {
    path: PathBuf,
}

impl Drop for PartitionLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn is_transient(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::Interrupted
            | ErrorKind::TimedOut
            | ErrorKind::WouldBlock
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof
            | ErrorKind::Other
    )
}

fn io_error(dataset: &str, partition: &PartitionKey, err: std::io::Error) -> CurateError {
    if is_transient(err.kind()) {
        CurateError::storage(dataset, partition.as_str(), err)
    } else {
        CurateError::Io(err)
    }
}

fn conflict(dataset: &str, partition: &PartitionKey) -> CurateError {
    CurateError::PartitionConflict {
        dataset: dataset.to_string(),
        partition: partition.to_string(),
    }
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

#[cfg(not(target_os = "linux"))]
fn process_alive(_pid: u32) -> bool {
    true
}

fn create_lock(path: &Path) -> std::io::Result<PartitionLock> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    let _ = writeln!(file, "{} {}", std::process::id(), Utc::now().to_rfc3339());
    Ok(PartitionLock {
        path: path.to_path_buf(),
    })
}

impl FsPartitionStore {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self::with_lock_timeout(root, DEFAULT_LOCK_STALE_AFTER)
    }

    /// Store whose partition locks are reclaimed once older than `stale_after`,
    /// or as soon as the process that took them is gone.
    pub fn with_lock_timeout<P: Into<PathBuf>>(root: P, stale_after: Duration) -> Self {
        let root = root.into();
        let _ = fs::create_dir_all(&root);
        Self {
            inner: Arc::new(FsInner {
                root,
                lock_stale_after: stale_after,
                #[cfg(test)]
                hooks: test_hooks::Hooks::default(),
            }),
        }
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// Run `work` on the blocking pool against the shared store state.
    async fn blocking<T, F>(&self, dataset: &str, partition: &str, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&FsInner) -> Result<T> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || work(&inner))
            .await
            .map_err(|e| CurateError::storage(dataset, partition, e))?
    }
}

impl FsInner {
    fn dataset_dir(&self, tier: Tier, dataset: &str) -> PathBuf {
        self.root.join(tier.as_str()).join(dataset)
    }

    fn partition_dir(&self, tier: Tier, dataset: &str, partition: &PartitionKey) -> PathBuf {
        match tier {
            Tier::Raw => self
                .dataset_dir(tier, dataset)
                .join(partition.raw_relative_path()),
            _ => self.dataset_dir(tier, dataset).join(partition.as_str()),
        }
    }

    fn reject_path(&self, area: RejectArea, dataset: &str, partition: &PartitionKey) -> PathBuf {
        self.root
            .join(area.as_str())
            .join(dataset)
            .join(partition.as_str())
            .join(REJECTS_FILE)
    }

    /// A lock is abandoned when its owner process is gone or it is older than
    /// the configured limit. Lock files that cannot be parsed are aged by mtime.
    fn lock_is_stale(&self, contents: &str, path: &Path) -> bool {
        let mut parts = contents.split_whitespace();
        let pid = parts.next().and_then(|p| p.parse::<u32>().ok());
        if let Some(pid) = pid {
            if !process_alive(pid) {
                return true;
            }
        }
        let age = match parts
            .next()
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
        {
            Some(taken_at) => (Utc::now() - taken_at.with_timezone(&Utc))
                .to_std()
                .unwrap_or_default(),
            None => fs::metadata(path)
                .and_then(|m| m.modified())
                .ok()
                .and_then(|modified| modified.elapsed().ok())
                .unwrap_or_default(),
        };
        age > self.lock_stale_after
    }

    fn acquire_lock(&self, dir: &Path, dataset: &str, partition: &PartitionKey) -> Result<PartitionLock> {
        let path = dir.join(LOCK_FILE);
        match create_lock(&path) {
            Ok(lock) => return Ok(lock),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
            Err(e) => return Err(io_error(dataset, partition, e)),
        }

        let held_by = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            // Released between our attempt and the read
            Err(e) if e.kind() == ErrorKind::NotFound => String::new(),
            Err(e) => return Err(io_error(dataset, partition, e)),
        };
        if path.exists() && !self.lock_is_stale(&held_by, &path) {
            return Err(conflict(dataset, partition));
        }

        // Only remove the lock we judged stale, not one a peer has just retaken
        if fs::read_to_string(&path).map(|now| now == held_by).unwrap_or(false) {
            warn!(
                "🔓 Reclaiming abandoned lock on {}/{} (held by '{}')",
                dataset,
                partition,
                held_by.trim()
            );
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(io_error(dataset, partition, e)),
            }
        }
        match create_lock(&path) {
            Ok(lock) => Ok(lock),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(conflict(dataset, partition)),
            Err(e) => Err(io_error(dataset, partition, e)),
        }
    }

    fn load_manifest(dir: &Path) -> Result<Option<CommitManifest>> {
        let path = dir.join(MANIFEST_FILE);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn read_committed(dir: &Path, manifest: &CommitManifest) -> Result<Vec<RawRecord>> {
        let mut rows = Vec::with_capacity(manifest.record_count);
        for file in &manifest.files {
            rows.extend(parquet_io::read_rows(&dir.join(file))?);
        }
        Ok(rows)
    }

    /// Rows named by the current manifest. A concurrent commit can collect the
    /// files of the manifest we loaded; the manifest is then re-read once.
    fn read_columnar(&self, dataset: &str, tier: Tier, partition: &PartitionKey) -> Result<Vec<RawRecord>> {
        let dir = self.partition_dir(tier, dataset, partition);
        for attempt in 1..=2 {
            let Some(manifest) = Self::load_manifest(&dir)? else {
                return Ok(Vec::new());
            };
            #[cfg(test)]
            self.hooks.before_committed_read(self);
            match Self::read_committed(&dir, &manifest) {
                Err(CurateError::Io(e)) if e.kind() == ErrorKind::NotFound => {
                    debug!(
                        "Generation {} of {}/{}/{} was replaced mid-read (attempt {})",
                        manifest.generation, tier, dataset, partition, attempt
                    );
                }
                other => return other,
            }
        }
        Err(CurateError::storage(
            dataset,
            partition.as_str(),
            "committed data files disappeared during read",
        ))
    }

    /// Remove data files the manifest no longer names.
    fn collect_garbage(dir: &Path, manifest: &CommitManifest) {
        let Ok(entries) = fs::read_dir(dir) else {
            return;
        };
        for entry in entries.filter_map(|e| e.ok()) {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with("part-") && !manifest.files.contains(&name) {
                if let Err(e) = fs::remove_file(entry.path()) {
                    debug!("Could not remove stale data file {}: {}", name, e);
                }
            }
        }
    }

    fn commit_columnar(
        &self,
        dataset: &str,
        tier: Tier,
        partition: &PartitionKey,
        schema: &[FieldSpec],
        rows: &[RawRecord],
        mode: WriteMode,
    ) -> Result<CommitManifest> {
        let dir = self.partition_dir(tier, dataset, partition);
        fs::create_dir_all(&dir).map_err(|e| io_error(dataset, partition, e))?;
        let _lock = self.acquire_lock(&dir, dataset, partition)?;

        let previous = Self::load_manifest(&dir)?;
        let mut all_rows = match (&previous, mode) {
            (Some(prev), WriteMode::Append) => Self::read_committed(&dir, prev)?,
            _ => Vec::new(),
        };
        all_rows.extend_from_slice(rows);

        let generation = previous.as_ref().map(|m| m.generation + 1).unwrap_or(1);
        let mut files = Vec::new();
        if !all_rows.is_empty() {
            let file_name = format!("part-{:06}-{}.parquet", generation, Uuid::new_v4());
            parquet_io::write_rows(&dir.join(&file_name), dataset, schema, &all_rows).map_err(
                |e| match e {
                    CurateError::Io(io) => io_error(dataset, partition, io),
                    other => other,
                },
            )?;
            files.push(file_name);
        }

        #[cfg(test)]
        if self.hooks.fail_before_manifest() {
            return Err(CurateError::storage(
                dataset,
                partition.as_str(),
                "injected failure before manifest swap",
            ));
        }

        let manifest = CommitManifest {
            dataset: dataset.to_string(),
            tier,
            partition: partition.clone(),
            generation,
            files,
            record_count: all_rows.len(),
            digest: content_digest(&all_rows),
            committed_at: Utc::now(),
        };
        let bytes = serde_json::to_vec_pretty(&manifest)?;
        write_atomic(&dir.join(MANIFEST_FILE), &bytes).map_err(|e| io_error(dataset, partition, e))?;
        Self::collect_garbage(&dir, &manifest);

        metrics::storage::partition_committed(tier.as_str(), all_rows.len());
        debug!(
            "Committed {}/{}/{} generation {} ({} rows)",
            tier, dataset, partition, generation, manifest.record_count
        );
        Ok(manifest)
    }

    fn append_raw(&self, dataset: &str, partition: &PartitionKey, rows: &[RawRecord]) -> Result<CommitManifest> {
        let dir = self.partition_dir(Tier::Raw, dataset, partition);
        let mut body = Vec::new();
        for row in rows {
            serde_json::to_writer(&mut body, row)?;
            body.push(b'\n');
        }
        let file_name = format!(
            "batch-{}-{}.ndjson",
            Utc::now().format("%Y%m%dT%H%M%S%.6f"),
            Uuid::new_v4()
        );
        write_atomic(&dir.join(&file_name), &body).map_err(|e| io_error(dataset, partition, e))?;
        metrics::storage::partition_committed(Tier::Raw.as_str(), rows.len());
        Ok(CommitManifest {
            dataset: dataset.to_string(),
            tier: Tier::Raw,
            partition: partition.clone(),
            generation: 0,
            files: vec![file_name],
            record_count: rows.len(),
            digest: content_digest(rows),
            committed_at: Utc::now(),
        })
    }

    fn raw_files(dir: &Path) -> Result<Vec<PathBuf>> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut files: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                let hidden = p
                    .file_name()
                    .map(|n| n.to_string_lossy().starts_with('.'))
                    .unwrap_or(true);
                let ext = p.extension().and_then(|s| s.to_str());
                p.is_file() && !hidden && matches!(ext, Some("ndjson") | Some("jsonl"))
            })
            .collect();
        // Batch names start with their deposit time, so name order is arrival order
        files.sort();
        Ok(files)
    }

    fn read_raw(&self, dataset: &str, partition: &PartitionKey) -> Result<RawBatch> {
        #[cfg(test)]
        self.hooks.stall_raw_read(partition);

        let dir = self.partition_dir(Tier::Raw, dataset, partition);
        let mut batch = RawBatch::default();
        for path in Self::raw_files(&dir)? {
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let file = File::open(&path).map_err(|e| io_error(dataset, partition, e))?;
            for (i, line) in BufReader::new(file).lines().enumerate() {
                let line = line.map_err(|e| io_error(dataset, partition, e))?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<serde_json::Value>(&line) {
                    Ok(serde_json::Value::Object(map)) => batch.records.push(map),
                    Ok(_) => batch.malformed.push(MalformedLine {
                        file: file_name.clone(),
                        line: i + 1,
                        reason: "line is not a JSON object".to_string(),
                    }),
                    Err(e) => batch.malformed.push(MalformedLine {
                        file: file_name.clone(),
                        line: i + 1,
                        reason: e.to_string(),
                    }),
                }
            }
        }
        Ok(batch)
    }

    fn raw_partitions(&self, dataset: &str) -> Result<Vec<PartitionKey>> {
        let base = self.dataset_dir(Tier::Raw, dataset);
        let mut keys = Vec::new();
        for (name, path) in list_dirs(&base)? {
            let is_year = name.len() == 4 && name.chars().all(|c| c.is_ascii_digit());
            if is_year {
                for (month, month_path) in list_dirs(&path)? {
                    for (day, day_path) in list_dirs(&month_path)? {
                        let candidate = format!("{}-{}-{}", name, month, day);
                        match PartitionKey::new(candidate.clone()) {
                            Ok(key) if key.as_date().is_some() => {
                                if !Self::raw_files(&day_path)?.is_empty() {
                                    keys.push(key);
                                }
                            }
                            _ => warn!("Ignoring unexpected raw directory {}", candidate),
                        }
                    }
                }
            } else if let Ok(key) = PartitionKey::new(name) {
                if !Self::raw_files(&path)?.is_empty() {
                    keys.push(key);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn committed_partitions(&self, dataset: &str, tier: Tier) -> Result<Vec<PartitionKey>> {
        let mut keys = Vec::new();
        for (name, path) in list_dirs(&self.dataset_dir(tier, dataset))? {
            if !path.join(MANIFEST_FILE).exists() {
                continue;
            }
            if let Ok(key) = PartitionKey::new(name) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn write_rejects(
        &self,
        area: RejectArea,
        dataset: &str,
        partition: &PartitionKey,
        rejects: &[RejectRow],
    ) -> Result<()> {
        let path = self.reject_path(area, dataset, partition);
        if rejects.is_empty() {
            return match fs::remove_file(&path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                Err(e) => Err(io_error(dataset, partition, e)),
            };
        }
        let mut body = Vec::new();
        for reject in rejects {
            serde_json::to_writer(&mut body, reject)?;
            body.push(b'\n');
        }
        write_atomic(&path, &body).map_err(|e| io_error(dataset, partition, e))
    }

    fn read_rejects(&self, area: RejectArea, dataset: &str, partition: &PartitionKey) -> Result<Vec<RejectRow>> {
        let path = self.reject_path(area, dataset, partition);
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut rows = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if !line.trim().is_empty() {
                rows.push(serde_json::from_str(&line)?);
            }
        }
        Ok(rows)
    }
}

fn list_dirs(path: &Path) -> Result<Vec<(String, PathBuf)>> {
    let entries = match fs::read_dir(path) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut dirs: Vec<(String, PathBuf)> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .map(|e| (e.file_name().to_string_lossy().into_owned(), e.path()))
        .collect();
    dirs.sort();
    Ok(dirs)
}

#[async_trait]
impl PartitionStore for FsPartitionStore {
    async fn write(
        &self,
        dataset: &str,
        tier: Tier,
        partition: &PartitionKey,
        schema: &[FieldSpec],
        rows: &[RawRecord],
        mode: WriteMode,
    ) -> Result<CommitManifest> {
        if tier == Tier::Raw && mode == WriteMode::Overwrite {
            return Err(CurateError::Config("the raw tier is append-only".to_string()));
        }
        let (name, key) = (dataset.to_string(), partition.clone());
        let schema = schema.to_vec();
        let rows = rows.to_vec();
        self.blocking(dataset, partition.as_str(), move |inner| match tier {
            Tier::Raw => inner.append_raw(&name, &key, &rows),
            _ => inner.commit_columnar(&name, tier, &key, &schema, &rows, mode),
        })
        .await
    }

    async fn read(&self, dataset: &str, tier: Tier, partition: &PartitionKey) -> Result<Vec<RawRecord>> {
        if tier == Tier::Raw {
            return Ok(self.read_raw(dataset, partition).await?.records);
        }
        let (name, key) = (dataset.to_string(), partition.clone());
        self.blocking(dataset, partition.as_str(), move |inner| {
            inner.read_columnar(&name, tier, &key)
        })
        .await
    }

    async fn read_raw(&self, dataset: &str, partition: &PartitionKey) -> Result<RawBatch> {
        let (name, key) = (dataset.to_string(), partition.clone());
        self.blocking(dataset, partition.as_str(), move |inner| inner.read_raw(&name, &key))
            .await
    }

    async fn partitions(&self, dataset: &str, tier: Tier) -> Result<Vec<PartitionKey>> {
        let name = dataset.to_string();
        self.blocking(dataset, "*", move |inner| match tier {
            Tier::Raw => inner.raw_partitions(&name),
            _ => inner.committed_partitions(&name, tier),
        })
        .await
    }

    async fn manifest(
        &self,
        dataset: &str,
        tier: Tier,
        partition: &PartitionKey,
    ) -> Result<Option<CommitManifest>> {
        if tier == Tier::Raw {
            return Ok(None);
        }
        let dir = self.inner.partition_dir(tier, dataset, partition);
        self.blocking(dataset, partition.as_str(), move |_| FsInner::load_manifest(&dir))
            .await
    }

    async fn write_rejects(
        &self,
        area: RejectArea,
        dataset: &str,
        partition: &PartitionKey,
        rejects: &[RejectRow],
    ) -> Result<()> {
        let (name, key) = (dataset.to_string(), partition.clone());
        let rejects = rejects.to_vec();
        self.blocking(dataset, partition.as_str(), move |inner| {
            inner.write_rejects(area, &name, &key, &rejects)
        })
        .await
    }

    async fn read_rejects(
        &self,
        area: RejectArea,
        dataset: &str,
        partition: &PartitionKey,
    ) -> Result<Vec<RejectRow>> {
        let (name, key) = (dataset.to_string(), partition.clone());
        self.blocking(dataset, partition.as_str(), move |inner| {
            inner.read_rejects(area, &name, &key)
        })
        .await
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::FieldType;
    use serde_json::json;

    fn rows(values: &[serde_json::Value]) -> Vec<RawRecord> {
        values.iter().filter_map(|v| v.as_object().cloned()).collect()
    }

    fn key(s: &str) -> PartitionKey {
        PartitionKey::new(s).unwrap()
    }

    fn id_schema() -> Vec<FieldSpec> {
        vec![FieldSpec::required("id", FieldType::Int)]
    }

    async fn commit(store: &FsPartitionStore, p: &PartitionKey, ids: &[i64], mode: WriteMode) -> Result<CommitManifest> {
        let values: Vec<serde_json::Value> = ids.iter().map(|id| json!({"id": id})).collect();
        store
            .write("Sales", Tier::Cleaned, p, &id_schema(), &rows(&values), mode)
            .await
    }

    #[tokio::test]
    async fn test_overwrite_replaces_and_append_extends() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsPartitionStore::new(dir.path());
        let p = key("2024-03-15");

        commit(&store, &p, &[1], WriteMode::Overwrite).await.unwrap();
        let m = commit(&store, &p, &[2], WriteMode::Append).await.unwrap();
        assert_eq!(m.generation, 2);
        assert_eq!(store.read("Sales", Tier::Cleaned, &p).await.unwrap().len(), 2);

        commit(&store, &p, &[3], WriteMode::Overwrite).await.unwrap();
        let back = store.read("Sales", Tier::Cleaned, &p).await.unwrap();
        assert_eq!(back, rows(&[json!({"id": 3})]));

        // Superseded data files are gone
        let part_files = fs::read_dir(dir.path().join("cleaned/Sales/2024-03-15"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("part-"))
            .count();
        assert_eq!(part_files, 1);
    }

    #[tokio::test]
    async fn test_failed_write_leaves_previous_commit_visible() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsPartitionStore::new(dir.path());
        let p = key("2024-03-15");
        commit(&store, &p, &[1], WriteMode::Overwrite).await.unwrap();

        store.inject_failure_before_manifest(true);
        let err = commit(&store, &p, &[9, 10], WriteMode::Overwrite).await.unwrap_err();
        assert!(err.is_retryable());
        store.inject_failure_before_manifest(false);

        assert_eq!(
            store.read("Sales", Tier::Cleaned, &p).await.unwrap(),
            rows(&[json!({"id": 1})])
        );
        // Lock released despite the failure
        assert!(!dir.path().join("cleaned/Sales/2024-03-15").join(LOCK_FILE).exists());
    }

    #[tokio::test]
    async fn test_failed_first_write_leaves_no_partition() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsPartitionStore::new(dir.path());
        let p = key("2024-03-15");
        store.inject_failure_before_manifest(true);
        assert!(commit(&store, &p, &[1], WriteMode::Overwrite).await.is_err());

        assert!(store.partitions("Sales", Tier::Cleaned).await.unwrap().is_empty());
        assert!(store.read("Sales", Tier::Cleaned, &p).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_held_lock_is_a_partition_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsPartitionStore::new(dir.path());
        let p = key("2024-03-15");
        let part_dir = dir.path().join("cleaned/Sales/2024-03-15");
        fs::create_dir_all(&part_dir).unwrap();
        fs::write(part_dir.join(LOCK_FILE), "other writer").unwrap();

        let err = commit(&store, &p, &[1], WriteMode::Overwrite).await.unwrap_err();
        assert!(matches!(err, CurateError::PartitionConflict { .. }));
        assert!(!err.is_retryable());
        // The other writer's lock is untouched
        assert!(part_dir.join(LOCK_FILE).exists());
    }

    #[tokio::test]
    async fn test_lock_of_live_process_is_respected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsPartitionStore::new(dir.path());
        let p = key("2024-03-15");
        let part_dir = dir.path().join("cleaned/Sales/2024-03-15");
        fs::create_dir_all(&part_dir).unwrap();
        let fresh = format!("{} {}", std::process::id(), Utc::now().to_rfc3339());
        fs::write(part_dir.join(LOCK_FILE), &fresh).unwrap();

        let err = commit(&store, &p, &[1], WriteMode::Overwrite).await.unwrap_err();
        assert!(matches!(err, CurateError::PartitionConflict { .. }));
        assert_eq!(fs::read_to_string(part_dir.join(LOCK_FILE)).unwrap(), fresh);
    }

    #[tokio::test]
    async fn test_abandoned_lock_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsPartitionStore::new(dir.path());
        let p = key("2024-03-15");
        let part_dir = dir.path().join("cleaned/Sales/2024-03-15");
        fs::create_dir_all(&part_dir).unwrap();
        // Left behind by a writer that crashed long ago
        fs::write(part_dir.join(LOCK_FILE), "999999999 2020-01-01T00:00:00+00:00\n").unwrap();

        let m = commit(&store, &p, &[1], WriteMode::Overwrite).await.unwrap();
        assert_eq!(m.record_count, 1);
        assert_eq!(
            store.read("Sales", Tier::Cleaned, &p).await.unwrap(),
            rows(&[json!({"id": 1})])
        );
        assert!(!part_dir.join(LOCK_FILE).exists());
    }

    #[tokio::test]
    async fn test_lock_older_than_limit_is_reclaimed_even_if_owner_lives() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsPartitionStore::with_lock_timeout(dir.path(), Duration::from_secs(60));
        let p = key("2024-03-15");
        let part_dir = dir.path().join("cleaned/Sales/2024-03-15");
        fs::create_dir_all(&part_dir).unwrap();
        let taken_at = Utc::now() - chrono::Duration::minutes(5);
        fs::write(
            part_dir.join(LOCK_FILE),
            format!("{} {}", std::process::id(), taken_at.to_rfc3339()),
        )
        .unwrap();

        assert!(commit(&store, &p, &[1], WriteMode::Overwrite).await.is_ok());
    }

    #[tokio::test]
    async fn test_missing_data_file_is_a_retryable_read_failure() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsPartitionStore::new(dir.path());
        let p = key("2024-03-15");
        let m = commit(&store, &p, &[1], WriteMode::Overwrite).await.unwrap();
        fs::remove_file(dir.path().join("cleaned/Sales/2024-03-15").join(&m.files[0])).unwrap();

        let err = store.read("Sales", Tier::Cleaned, &p).await.unwrap_err();
        assert!(err.is_retryable(), "{}", err);
    }

    #[tokio::test]
    async fn test_read_follows_a_commit_that_lands_mid_read() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsPartitionStore::new(dir.path());
        let p = key("2024-03-15");
        commit(&store, &p, &[1], WriteMode::Overwrite).await.unwrap();

        // A concurrent overwrite collects the generation the reader just loaded
        let racing_key = p.clone();
        store.before_next_committed_read(move |inner| {
            inner
                .commit_columnar(
                    "Sales",
                    Tier::Cleaned,
                    &racing_key,
                    &id_schema(),
                    &rows(&[json!({"id": 2})]),
                    WriteMode::Overwrite,
                )
                .unwrap();
        });

        let back = store.read("Sales", Tier::Cleaned, &p).await.unwrap();
        assert_eq!(back, rows(&[json!({"id": 2})]));
    }

    #[tokio::test]
    async fn test_columns_keep_their_declared_types() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsPartitionStore::new(dir.path());
        let p = key("2024-03-15");
        let schema = vec![
            FieldSpec::required("OrderNumber", FieldType::String),
            FieldSpec::optional("OrderDate", FieldType::Date),
            FieldSpec::optional("Multiply", FieldType::Int),
        ];
        let written = rows(&[
            json!({"OrderNumber": "S1", "OrderDate": "2024-03-15", "Multiply": 6}),
            json!({"OrderNumber": "S2", "OrderDate": null, "Multiply": null}),
        ]);
        store
            .write("Sales", Tier::Cleaned, &p, &schema, &written, WriteMode::Overwrite)
            .await
            .unwrap();
        assert_eq!(store.read("Sales", Tier::Cleaned, &p).await.unwrap(), written);

        let mistyped = rows(&[json!({"OrderNumber": "S3", "Multiply": "many"})]);
        assert!(store
            .write("Sales", Tier::Cleaned, &p, &schema, &mistyped, WriteMode::Overwrite)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_raw_layout_and_malformed_lines() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsPartitionStore::new(dir.path());
        let p = key("2024-03-15");
        store
            .write("Sales", Tier::Raw, &p, &[], &rows(&[json!({"OrderNumber": "S100"})]), WriteMode::Append)
            .await
            .unwrap();
        let day_dir = dir.path().join("raw/Sales/2024/03/15");
        fs::write(day_dir.join("zz-manual.ndjson"), "not json\n[1,2]\n{\"OrderNumber\":\"S101\"}\n").unwrap();
        fs::write(day_dir.join(".inflight.ndjson"), "{\"OrderNumber\":\"S999\"}\n").unwrap();

        let batch = store.read_raw("Sales", &p).await.unwrap();
        assert_eq!(batch.records.len(), 2);
        assert_eq!(batch.malformed.len(), 2);
        assert_eq!(batch.malformed[0].line, 1);
        assert_eq!(store.partitions("Sales", Tier::Raw).await.unwrap(), vec![p]);
    }

    #[tokio::test]
    async fn test_raw_tier_rejects_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsPartitionStore::new(dir.path());
        let result = store
            .write("Sales", Tier::Raw, &key("2024-03-15"), &[], &[], WriteMode::Overwrite)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_rejects_are_replaced_per_run() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsPartitionStore::new(dir.path());
        let p = key("2024-03-15");
        let reject = RejectRow {
            stage: crate::error::Stage::Validate,
            field: Some("Qty".into()),
            reason: "not an integer".into(),
            record: json!({"Qty": "three"}),
        };
        store
            .write_rejects(RejectArea::Quarantine, "Sales", &p, &[reject.clone(), reject.clone()])
            .await
            .unwrap();
        store
            .write_rejects(RejectArea::Quarantine, "Sales", &p, &[reject.clone()])
            .await
            .unwrap();
        assert_eq!(
            store.read_rejects(RejectArea::Quarantine, "Sales", &p).await.unwrap(),
            vec![reject]
        );
        store.write_rejects(RejectArea::Quarantine, "Sales", &p, &[]).await.unwrap();
        assert!(store
            .read_rejects(RejectArea::Quarantine, "Sales", &p)
            .await
            .unwrap()
            .is_empty());
    }
}
