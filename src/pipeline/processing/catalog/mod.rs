//! Catalog of named, queryable entities over the cleaned and curated tiers.
//!
//! An entry is stable once published: republishing identical metadata is a
//! no-op, and different metadata is refused with `CatalogConflict` unless the
//! caller confirms, in which case the entry is replaced under a new version and
//! the previous one is kept in its history.

pub mod ddl;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};

use crate::constants::{CATALOG_DIR, CATALOG_FILE};
use crate::domain::Tier;
use crate::error::{CurateError, Result};
use crate::observability::metrics;
use crate::pipeline::storage::manifest::write_atomic;

pub use ddl::{render_ddl, ExternalTriple};

/// What a catalog entry points at. Two publishes are "identical" when these match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMetadata {
    pub tier: Tier,
    pub dataset: String,
    pub location: String,
    pub format: String,
    pub compression: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub name: String,
    pub version: u32,
    #[serde(flatten)]
    pub metadata: EntryMetadata,
    pub published_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PublishOutcome {
    Created(CatalogEntry),
    Unchanged(CatalogEntry),
    Replaced {
        previous: CatalogEntry,
        current: CatalogEntry,
    },
}

impl PublishOutcome {
    pub fn entry(&self) -> &CatalogEntry {
        match self {
            PublishOutcome::Created(e) | PublishOutcome::Unchanged(e) => e,
            PublishOutcome::Replaced { current, .. } => current,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            PublishOutcome::Created(_) => "created",
            PublishOutcome::Unchanged(_) => "unchanged",
            PublishOutcome::Replaced { .. } => "replaced",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CatalogRecord {
    current: Option<CatalogEntry>,
    #[serde(default)]
    history: Vec<CatalogEntry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CatalogDocument {
    entries: BTreeMap<String, CatalogRecord>,
}

/// Registers datasets as named entities. Persists to `<root>/_catalog/catalog.json`
/// when opened on a data root; in-memory otherwise.
pub struct CatalogPublisher {
    path: Option<PathBuf>,
    document: Mutex<CatalogDocument>,
}

impl CatalogPublisher {
    pub fn open<P: AsRef<Path>>(data_root: P) -> Result<Self> {
        let path = data_root.as_ref().join(CATALOG_DIR).join(CATALOG_FILE);
        let document = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == ErrorKind::NotFound => CatalogDocument::default(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path: Some(path),
            document: Mutex::new(document),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            path: None,
            document: Mutex::new(CatalogDocument::default()),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, CatalogDocument>> {
        self.document
            .lock()
            .map_err(|_| CurateError::Config("catalog lock poisoned".to_string()))
    }

    fn persist(&self, document: &CatalogDocument) -> Result<()> {
        if let Some(path) = &self.path {
            let bytes = serde_json::to_vec_pretty(document)?;
            write_atomic(path, &bytes)?;
        }
        Ok(())
    }

    /// Publish `name` with `metadata`. `confirm` allows replacing an entry whose
    /// metadata differs.
    pub fn publish(&self, name: &str, metadata: EntryMetadata, confirm: bool) -> Result<PublishOutcome> {
        if name.trim().is_empty() {
            return Err(CurateError::Config("catalog entry name is empty".to_string()));
        }
        let mut document = self.lock()?;
        let record = document.entries.entry(name.to_string()).or_default();

        let outcome = match &record.current {
            Some(existing) if existing.metadata == metadata => {
                return Ok(PublishOutcome::Unchanged(existing.clone()));
            }
            Some(existing) if !confirm => {
                metrics::catalog::conflict();
                warn!("Catalog conflict for '{}': metadata differs from version {}", name, existing.version);
                return Err(CurateError::CatalogConflict {
                    name: name.to_string(),
                    message: describe_difference(&existing.metadata, &metadata),
                });
            }
            Some(existing) => {
                let previous = existing.clone();
                let current = CatalogEntry {
                    name: name.to_string(),
                    version: previous.version + 1,
                    metadata,
                    published_at: Utc::now(),
                };
                record.history.push(previous.clone());
                record.current = Some(current.clone());
                PublishOutcome::Replaced { previous, current }
            }
            None => {
                let current = CatalogEntry {
                    name: name.to_string(),
                    version: 1,
                    metadata,
                    published_at: Utc::now(),
                };
                record.current = Some(current.clone());
                PublishOutcome::Created(current)
            }
        };

        self.persist(&document)?;
        metrics::catalog::published(outcome.label());
        info!("📚 Catalog entry '{}' {} (version {})", name, outcome.label(), outcome.entry().version);
        Ok(outcome)
    }

    pub fn list(&self) -> Result<Vec<CatalogEntry>> {
        let document = self.lock()?;
        Ok(document
            .entries
            .values()
            .filter_map(|r| r.current.clone())
            .collect())
    }

    pub fn describe(&self, name: &str) -> Result<Option<CatalogEntry>> {
        let document = self.lock()?;
        Ok(document.entries.get(name).and_then(|r| r.current.clone()))
    }

    /// Replaced versions of `name`, oldest first.
    pub fn history(&self, name: &str) -> Result<Vec<CatalogEntry>> {
        let document = self.lock()?;
        Ok(document
            .entries
            .get(name)
            .map(|r| r.history.clone())
            .unwrap_or_default())
    }
}

fn describe_difference(old: &EntryMetadata, new: &EntryMetadata) -> String {
    let mut diffs = Vec::new();
    if old.tier != new.tier {
        diffs.push(format!("tier {} -> {}", old.tier, new.tier));
    }
    if old.dataset != new.dataset {
        diffs.push(format!("dataset {} -> {}", old.dataset, new.dataset));
    }
    if old.location != new.location {
        diffs.push(format!("location {} -> {}", old.location, new.location));
    }
    if old.format != new.format {
        diffs.push(format!("format {} -> {}", old.format, new.format));
    }
    if old.compression != new.compression {
        diffs.push(format!("compression {} -> {}", old.compression, new.compression));
    }
    format!("published metadata differs ({}); confirm to replace", diffs.join(", "))
}
