use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::{debug, info};

use crate::domain::Dataset;
use crate::error::{CurateError, Result};

/// One JSON file in the datasets directory.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DatasetFile {
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(flatten)]
    pub dataset: Dataset,
}

fn enabled_by_default() -> bool {
    true
}

/// Load every enabled `*.json` dataset definition in `dir`, sorted by file name.
pub fn load_from_directory<P: AsRef<Path>>(dir: P) -> Result<Vec<Dataset>> {
    let dir_path = dir.as_ref();
    if !dir_path.exists() {
        return Err(CurateError::Config(format!(
            "Datasets directory does not exist: {}",
            dir_path.display()
        )));
    }

    let entries = fs::read_dir(dir_path).map_err(|e| {
        CurateError::Config(format!("Failed to read datasets directory: {}", e))
    })?;

    let mut paths = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| {
            CurateError::Config(format!("Failed to read directory entry: {}", e))
        })?;
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) == Some("json") {
            paths.push(path);
        }
    }
    paths.sort();

    let mut datasets = Vec::new();
    for path in paths {
        let content = fs::read_to_string(&path).map_err(|e| {
            CurateError::Config(format!("Failed to read dataset file {}: {}", path.display(), e))
        })?;
        let file: DatasetFile = serde_json::from_str(&content).map_err(|e| {
            CurateError::Config(format!("Failed to parse dataset file {}: {}", path.display(), e))
        })?;
        if !file.enabled {
            debug!("Skipping disabled dataset {} ({})", file.dataset.name, path.display());
            continue;
        }
        file.dataset.validate_definition()?;
        info!("📄 Loaded dataset definition '{}' from {}", file.dataset.name, path.display());
        datasets.push(file.dataset);
    }
    Ok(datasets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{FieldType, Reduction, TransformRule};

    const PAGE_VIEWS: &str = r#"{
        "name": "PageViews",
        "schema": [
            {"name": "url", "type": "string"},
            {"name": "viewed_at", "type": "timestamp"},
            {"name": "user", "type": "string", "nullable": true}
        ],
        "identity_key": ["url", "viewed_at"],
        "partition_field": "viewed_at",
        "rules": [
            {"rule": "split_segment", "source": "url", "delimiter": "/", "index": 2, "target": "host"}
        ],
        "aggregates": [
            {"name": "ViewsByHost", "grouping": ["host"], "reduction": {"kind": "count", "output": "views"}}
        ]
    }"#;

    #[test]
    fn test_loads_json_definitions() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("page_views.json"), PAGE_VIEWS).unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let datasets = load_from_directory(dir.path()).unwrap();
        assert_eq!(datasets.len(), 1);
        let ds = &datasets[0];
        assert_eq!(ds.name, "PageViews");
        assert_eq!(ds.schema[1].field_type, FieldType::Timestamp);
        assert!(matches!(ds.rules[0], TransformRule::SplitSegment { index: 2, .. }));
        assert!(matches!(ds.aggregates[0].reduction, Reduction::Count { .. }));
    }

    #[test]
    fn test_disabled_definitions_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let disabled = PAGE_VIEWS.replacen('{', "{\"enabled\": false,", 1);
        fs::write(dir.path().join("page_views.json"), disabled).unwrap();
        assert!(load_from_directory(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn test_invalid_definition_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let broken = PAGE_VIEWS.replace(r#""identity_key": ["url", "viewed_at"]"#, r#""identity_key": ["missing"]"#);
        fs::write(dir.path().join("page_views.json"), broken).unwrap();
        assert!(matches!(
            load_from_directory(dir.path()),
            Err(CurateError::Definition { .. })
        ));
    }

    #[test]
    fn test_missing_directory_is_an_error() {
        assert!(load_from_directory("/nonexistent/datasets").is_err());
    }
}
