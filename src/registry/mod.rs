// Dataset registry: built-in definitions plus JSON definitions from disk

pub mod builtin;
pub mod dataset_loader;

use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

use crate::domain::{AggregateSpec, Dataset};
use crate::error::{CurateError, Result};

/// Every dataset the engine knows how to curate, by name.
#[derive(Debug, Clone, Default)]
pub struct DatasetRegistry {
    datasets: BTreeMap<String, Dataset>,
}

impl DatasetRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// The built-in datasets.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        for dataset in builtin::all() {
            registry.datasets.insert(dataset.name.clone(), dataset);
        }
        registry
    }

    /// Built-ins overlaid with the definitions in `dir`; a file replaces a built-in of the same name.
    pub fn with_directory<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let mut registry = Self::builtin();
        for dataset in dataset_loader::load_from_directory(dir)? {
            if registry.datasets.contains_key(&dataset.name) {
                info!("Dataset '{}' overridden by definition file", dataset.name);
            }
            registry.datasets.insert(dataset.name.clone(), dataset);
        }
        registry.check_aggregate_names()?;
        Ok(registry)
    }

    pub fn register(&mut self, dataset: Dataset) -> Result<()> {
        dataset.validate_definition()?;
        self.datasets.insert(dataset.name.clone(), dataset);
        self.check_aggregate_names()
    }

    pub fn get(&self, name: &str) -> Result<&Dataset> {
        self.datasets
            .get(name)
            .ok_or_else(|| CurateError::UnknownDataset(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        self.datasets.keys().cloned().collect()
    }

    pub fn datasets(&self) -> impl Iterator<Item = &Dataset> {
        self.datasets.values()
    }

    /// The dataset and spec producing the curated entity `name`.
    pub fn find_aggregate(&self, name: &str) -> Option<(&Dataset, &AggregateSpec)> {
        self.datasets.values().find_map(|ds| {
            ds.aggregates
                .iter()
                .find(|a| a.name == name)
                .map(|a| (ds, a))
        })
    }

    /// Catalog names are global: an aggregate may not share a name with a dataset
    /// or with another dataset's aggregate.
    fn check_aggregate_names(&self) -> Result<()> {
        let mut seen: BTreeMap<&str, &str> = BTreeMap::new();
        for ds in self.datasets.values() {
            for agg in &ds.aggregates {
                if self.datasets.contains_key(&agg.name) {
                    return Err(CurateError::Definition {
                        dataset: ds.name.clone(),
                        message: format!("aggregate '{}' shadows a dataset", agg.name),
                    });
                }
                if let Some(owner) = seen.insert(&agg.name, &ds.name) {
                    return Err(CurateError::Definition {
                        dataset: ds.name.clone(),
                        message: format!("aggregate '{}' is already defined by {}", agg.name, owner),
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{builtin_datasets, COMMITS, COMMIT_SUMMARY};
    use crate::domain::{FieldSpec, FieldType, Reduction};

    #[test]
    fn test_builtin_definitions_are_valid() {
        let registry = DatasetRegistry::builtin();
        for name in builtin_datasets() {
            let dataset = registry.get(name).unwrap();
            dataset.validate_definition().unwrap();
        }
        assert_eq!(registry.names().len(), builtin_datasets().len());
    }

    #[test]
    fn test_shipped_definitions_load() {
        let dir = concat!(env!("CARGO_MANIFEST_DIR"), "/registry/datasets");
        let registry = DatasetRegistry::with_directory(dir).unwrap();
        let page_views = registry.get("PageViews").unwrap();
        assert_eq!(page_views.aggregates.len(), 2);
        assert!(registry.find_aggregate("ViewsByHost").is_some());
        assert!(registry.get(COMMITS).is_ok());
    }

    #[test]
    fn test_unknown_dataset() {
        let registry = DatasetRegistry::builtin();
        assert!(matches!(
            registry.get("Nope"),
            Err(CurateError::UnknownDataset(_))
        ));
    }

    #[test]
    fn test_find_aggregate_owner() {
        let registry = DatasetRegistry::builtin();
        let (ds, spec) = registry.find_aggregate(COMMIT_SUMMARY).unwrap();
        assert_eq!(ds.name, COMMITS);
        assert!(matches!(spec.reduction, Reduction::Count { .. }));
    }

    #[test]
    fn test_aggregate_name_clash_is_rejected() {
        let mut registry = DatasetRegistry::builtin();
        let clash = Dataset::new("Other", vec![FieldSpec::required("author", FieldType::String)])
            .with_aggregate(AggregateSpec {
                name: COMMIT_SUMMARY.into(),
                grouping: vec!["author".into()],
                reduction: Reduction::Count { output: "n".into() },
            });
        assert!(registry.register(clash).is_err());
    }
}
