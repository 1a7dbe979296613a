mod apply;

use regex::Regex;
use tracing::debug;

use crate::config::TransformPolicy;
use crate::domain::{Dataset, Record, ReplaceMode, TransformRule, Value};
use crate::error::{CurateError, Result, TransformError};
use crate::observability::metrics;

/// Result of transforming one batch.
#[derive(Debug, Clone, Default)]
pub struct TransformOutcome {
    /// Transformed records, projected to the dataset's output order.
    pub records: Vec<Record>,
    /// Records routed to the error sink, as they were before transformation.
    pub errors: Vec<(Record, TransformError)>,
    /// Records dropped by filter rules.
    pub filtered: usize,
    /// Rule failures turned into null outputs under `NullPropagate`.
    pub nulls_propagated: usize,
}

/// Interprets a dataset's declarative rules. Construction compiles regex
/// patterns once; `transform` is pure and deterministic.
pub struct Transformer<'a> {
    dataset: &'a Dataset,
    regexes: Vec<Option<Regex>>,
}

enum Step {
    Keep,
    Drop,
}

impl<'a> Transformer<'a> {
    pub fn new(dataset: &'a Dataset) -> Result<Self> {
        let mut regexes = Vec::with_capacity(dataset.rules.len());
        for rule in &dataset.rules {
            let compiled = match rule {
                TransformRule::Replace {
                    pattern,
                    mode: ReplaceMode::Regex,
                    ..
                } => Some(Regex::new(pattern).map_err(|e| CurateError::Definition {
                    dataset: dataset.name.clone(),
                    message: format!("rule {}: invalid regex: {}", rule.label(), e),
                })?),
                _ => None,
            };
            regexes.push(compiled);
        }
        Ok(Self { dataset, regexes })
    }

    pub fn transform(&self, records: Vec<Record>, policy: TransformPolicy) -> TransformOutcome {
        let mut outcome = TransformOutcome::default();
        'records: for original in records {
            let mut record = original.clone();
            for (i, rule) in self.dataset.rules.iter().enumerate() {
                match self.apply_rule(i, rule, &mut record) {
                    Ok(Step::Keep) => {}
                    Ok(Step::Drop) => {
                        outcome.filtered += 1;
                        continue 'records;
                    }
                    Err((field, reason)) => {
                        let error = TransformError {
                            dataset: self.dataset.name.clone(),
                            rule: rule.label(),
                            field,
                            reason,
                        };
                        match policy {
                            TransformPolicy::NullPropagate => {
                                debug!("Null-propagating after {}", error);
                                for target in rule_targets(rule) {
                                    record.set(target, Value::Null);
                                }
                                outcome.nulls_propagated += 1;
                            }
                            TransformPolicy::ErrorSink => {
                                debug!("Routing record to error sink: {}", error);
                                outcome.errors.push((original, error));
                                continue 'records;
                            }
                        }
                    }
                }
            }
            if !self.dataset.output_order.is_empty() {
                record = record.project(&self.dataset.output_order);
            }
            outcome.records.push(record);
        }

        metrics::transform::batch_transformed(
            &self.dataset.name,
            outcome.records.len(),
            outcome.errors.len(),
            outcome.filtered,
        );
        if outcome.nulls_propagated > 0 {
            metrics::transform::nulls_propagated(&self.dataset.name, outcome.nulls_propagated);
        }
        outcome
    }

    fn apply_rule(&self, index: usize, rule: &TransformRule, record: &mut Record) -> apply::RuleResult<Step> {
        match rule {
            TransformRule::DeriveCalendar { source, parts } => apply::derive_calendar(record, source, parts)?,
            TransformRule::Concat {
                sources,
                separator,
                target,
                skip_nulls,
            } => apply::concat(record, sources, separator, target, *skip_nulls)?,
            TransformRule::SplitSegment {
                source,
                delimiter,
                index: segment,
                target,
            } => apply::split_segment(record, source, delimiter, *segment, target)?,
            TransformRule::ParseTimestamp { source, format, target } => {
                apply::parse_timestamp(record, source, format, target)?
            }
            TransformRule::Replace {
                source,
                pattern,
                replacement,
                target,
                mode,
            } => {
                let target = target.as_deref().unwrap_or(source);
                let regex = self.regexes.get(index).and_then(|r| r.as_ref());
                apply::replace(record, source, pattern, replacement, target, *mode, regex)?
            }
            TransformRule::Compute {
                left,
                right,
                op,
                target,
            } => apply::compute(record, left, right, *op, target)?,
            TransformRule::Rename { from, to } => record.rename(from, to),
            TransformRule::Filter { field, predicate } => {
                if !apply::filter(record, field, predicate) {
                    return Ok(Step::Drop);
                }
            }
        }
        Ok(Step::Keep)
    }
}

/// Fields a rule writes; these become null when the rule fails under `NullPropagate`.
fn rule_targets(rule: &TransformRule) -> Vec<String> {
    match rule {
        TransformRule::DeriveCalendar { parts, .. } => parts.iter().map(|p| p.target.clone()).collect(),
        TransformRule::Concat { target, .. }
        | TransformRule::SplitSegment { target, .. }
        | TransformRule::ParseTimestamp { target, .. }
        | TransformRule::Compute { target, .. } => vec![target.clone()],
        TransformRule::Replace { source, target, .. } => vec![target.clone().unwrap_or_else(|| source.clone())],
        TransformRule::Rename { to, .. } => vec![to.clone()],
        TransformRule::Filter { .. } => Vec::new(),
    }
}

/// Transform a batch with the dataset's rules under `policy`.
pub fn transform(dataset: &Dataset, records: Vec<Record>, policy: TransformPolicy) -> Result<TransformOutcome> {
    Ok(Transformer::new(dataset)?.transform(records, policy))
}
