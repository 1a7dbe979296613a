use tracing::debug;

use crate::config::ValidationPolicy;
use crate::domain::coerce::coerce;
use crate::domain::{Dataset, RawRecord, Record, Value};
use crate::error::{CurateError, Result, ValidationError};
use crate::observability::metrics;

/// A raw record that failed validation, kept with the first violation found.
#[derive(Debug, Clone)]
pub struct Rejected {
    pub raw: RawRecord,
    pub error: ValidationError,
}

/// Outcome of validating one raw batch under a policy.
#[derive(Debug, Clone, Default)]
pub struct ValidatedBatch {
    pub records: Vec<Record>,
    /// Rejections in input order, under every policy; only `Quarantine` persists them.
    pub rejected: Vec<Rejected>,
}

/// Checks raw records against a dataset's declared schema and produces typed records.
///
/// Field order in the output follows the schema declaration. Undeclared raw
/// fields are discarded, or rejected when the dataset sets `reject_unknown_fields`.
pub struct SchemaEnforcer;

impl SchemaEnforcer {
    pub fn validate(dataset: &Dataset, raw: &RawRecord) -> std::result::Result<Record, ValidationError> {
        let violation = |field: &str, reason: String| ValidationError {
            dataset: dataset.name.clone(),
            field: field.to_string(),
            reason,
        };

        if dataset.reject_unknown_fields {
            if let Some(unknown) = raw.keys().find(|k| dataset.field(k).is_none()) {
                return Err(violation(unknown, "field is not declared".to_string()));
            }
        }

        let mut record = Record::new();
        for spec in &dataset.schema {
            let value = match raw.get(&spec.name) {
                Some(v) if !v.is_null() => {
                    coerce(v, spec.field_type).map_err(|reason| violation(&spec.name, reason))?
                }
                present => match &spec.default {
                    Some(default) => coerce(default, spec.field_type)
                        .map_err(|reason| violation(&spec.name, format!("bad default: {}", reason)))?,
                    None if spec.nullable => Value::Null,
                    None if present.is_some() => {
                        return Err(violation(&spec.name, "null in non-nullable field".to_string()))
                    }
                    None => return Err(violation(&spec.name, "required field is missing".to_string())),
                },
            };
            record.set(spec.name.clone(), value);
        }
        Ok(record)
    }

    /// Validate a batch. `FailBatch` turns the first violation into an error for the
    /// whole batch; the other policies keep going and report the rejects.
    pub fn enforce(dataset: &Dataset, raws: &[RawRecord], policy: ValidationPolicy) -> Result<ValidatedBatch> {
        let mut batch = ValidatedBatch::default();
        for raw in raws {
            match Self::validate(dataset, raw) {
                Ok(record) => batch.records.push(record),
                Err(error) => {
                    if policy == ValidationPolicy::FailBatch {
                        metrics::schema::records_rejected(&dataset.name, 1);
                        return Err(CurateError::Validation(error));
                    }
                    debug!("Rejected {} record: {}", dataset.name, error);
                    batch.rejected.push(Rejected {
                        raw: raw.clone(),
                        error,
                    });
                }
            }
        }
        metrics::schema::records_validated(&dataset.name, batch.records.len());
        metrics::schema::records_rejected(&dataset.name, batch.rejected.len());
        Ok(batch)
    }
}
