use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::Path;

use crate::domain::{PartitionKey, RawRecord, Tier};

/// Marker that makes a partition visible. Written last, by rename.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitManifest {
    pub dataset: String,
    pub tier: Tier,
    pub partition: PartitionKey,
    /// Increases by one on every commit of this partition.
    pub generation: u64,
    pub files: Vec<String>,
    pub record_count: usize,
    /// `sha256:<hex>` over the committed rows in read order.
    pub digest: String,
    pub committed_at: DateTime<Utc>,
}

/// Content digest of rows, independent of how they are split across files.
pub fn content_digest(rows: &[RawRecord]) -> String {
    let mut hasher = Sha256::new();
    for row in rows {
        // serde_json::Map serializes in insertion order, which is schema order here
        let line = serde_json::to_string(row).unwrap_or_default();
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

/// Write `bytes` next to `path` then rename over it, so readers see old or new, never half.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(v: serde_json::Value) -> RawRecord {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_digest_is_order_sensitive_and_stable() {
        let a = vec![row(json!({"id": 1})), row(json!({"id": 2}))];
        let b = vec![row(json!({"id": 2})), row(json!({"id": 1}))];
        assert_eq!(content_digest(&a), content_digest(&a.clone()));
        assert_ne!(content_digest(&a), content_digest(&b));
        assert!(content_digest(&[]).starts_with("sha256:"));
    }

    #[test]
    fn test_write_atomic_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("file.json");
        write_atomic(&path, b"one").unwrap();
        write_atomic(&path, b"two").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "two");
        let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
