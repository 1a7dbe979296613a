use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use super::value::DATE_FORMAT;
use crate::constants::ALL_PARTITIONS;
use crate::error::{CurateError, Result};

/// Storage stage of increasing data quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Raw,
    Cleaned,
    Curated,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Raw => "raw",
            Tier::Cleaned => "cleaned",
            Tier::Curated => "curated",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Tier {
    type Err = CurateError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "raw" => Ok(Tier::Raw),
            "cleaned" => Ok(Tier::Cleaned),
            "curated" => Ok(Tier::Curated),
            other => Err(CurateError::Config(format!("unknown tier '{}'", other))),
        }
    }
}

/// Side areas that hold records removed from the main flow, for inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectArea {
    Quarantine,
    Errors,
}

impl RejectArea {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectArea::Quarantine => "quarantine",
            RejectArea::Errors => "errors",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    Append,
    Overwrite,
}

/// Value identifying one partition of a dataset: an ISO date or a plain name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PartitionKey(String);

impl PartitionKey {
    /// Names are restricted to a path-safe alphabet.
    pub fn new(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        let valid = !value.is_empty()
            && !value.starts_with('.')
            && !value.starts_with('_')
            && value
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '='));
        if !valid {
            return Err(CurateError::Config(format!(
                "invalid partition key '{}'",
                value
            )));
        }
        Ok(PartitionKey(value))
    }

    /// Key of curated outputs computed over every partition of a dataset.
    pub fn all() -> Self {
        PartitionKey(ALL_PARTITIONS.to_string())
    }

    pub fn from_date(date: NaiveDate) -> Self {
        PartitionKey(date.format(DATE_FORMAT).to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        NaiveDate::parse_from_str(&self.0, DATE_FORMAT).ok()
    }

    /// Raw tier layout: dates become `YYYY/MM/DD`, names stay a single segment.
    pub fn raw_relative_path(&self) -> PathBuf {
        match self.as_date() {
            Some(d) => PathBuf::from(format!("{:04}", d.year()))
                .join(format!("{:02}", d.month()))
                .join(format!("{:02}", d.day())),
            None => PathBuf::from(&self.0),
        }
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for PartitionKey {
    type Error = CurateError;

    fn try_from(value: String) -> Result<Self> {
        PartitionKey::new(value)
    }
}

impl From<PartitionKey> for String {
    fn from(key: PartitionKey) -> Self {
        key.0
    }
}

impl std::str::FromStr for PartitionKey {
    type Err = CurateError;

    fn from_str(s: &str) -> Result<Self> {
        PartitionKey::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_date_keys_map_to_nested_raw_layout() {
        let key = PartitionKey::from_date(NaiveDate::from_ymd_opt(2024, 3, 5).unwrap());
        assert_eq!(key.as_str(), "2024-03-05");
        assert_eq!(key.raw_relative_path(), PathBuf::from("2024/03/05"));
    }

    #[test]
    fn test_named_keys_stay_flat() {
        let key = PartitionKey::new("snapshot").unwrap();
        assert_eq!(key.raw_relative_path(), PathBuf::from("snapshot"));
        assert!(key.as_date().is_none());
    }

    #[test]
    fn test_rejects_path_traversal() {
        assert!(PartitionKey::new("../etc").is_err());
        assert!(PartitionKey::new("a/b").is_err());
        assert!(PartitionKey::new("_lock").is_err());
        assert!(PartitionKey::new("").is_err());
    }
}
