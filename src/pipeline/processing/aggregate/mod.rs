use std::collections::BTreeMap;

use crate::constants::{RANK_FIELD, WINDOW_COMPLETE_FIELD};
use crate::domain::{AggregateSpec, Record, Reduction, Value};
use crate::error::{CurateError, Result};

const GROUP_SEPARATOR: char = '\u{1f}';

#[derive(Debug, Clone, PartialEq)]
struct GroupAccumulator {
    values: Vec<Value>,
    count: u64,
    int_sum: i128,
    float_sum: f64,
    saw_float: bool,
}

impl GroupAccumulator {
    fn new(values: Vec<Value>) -> Self {
        Self {
            values,
            count: 0,
            int_sum: 0,
            float_sum: 0.0,
            saw_float: false,
        }
    }

    fn merge(&mut self, other: GroupAccumulator) {
        self.count += other.count;
        self.int_sum += other.int_sum;
        self.float_sum += other.float_sum;
        self.saw_float |= other.saw_float;
    }

    fn sum_value(&self) -> Value {
        if self.saw_float {
            return Value::Float(self.int_sum as f64 + self.float_sum);
        }
        match i64::try_from(self.int_sum) {
            Ok(v) => Value::Int(v),
            Err(_) => Value::Float(self.int_sum as f64),
        }
    }
}

/// Mergeable partial result of one grouped reduction.
///
/// States built from disjoint record sets merge into the state of their union,
/// so per-partition aggregation followed by [`AggregateState::merge`] equals
/// aggregating the whole set. Integer sums are exact; float sums are subject to
/// floating-point rounding and may differ in the last digits between orders.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateState {
    spec: AggregateSpec,
    groups: BTreeMap<String, GroupAccumulator>,
}

impl AggregateState {
    pub fn new(spec: &AggregateSpec) -> Self {
        Self {
            spec: spec.clone(),
            groups: BTreeMap::new(),
        }
    }

    pub fn spec(&self) -> &AggregateSpec {
        &self.spec
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    fn error(&self, message: String) -> CurateError {
        CurateError::Aggregate {
            name: self.spec.name.clone(),
            message,
        }
    }

    pub fn absorb(&mut self, records: &[Record]) -> Result<()> {
        for record in records {
            let values: Vec<Value> = self
                .spec
                .grouping
                .iter()
                .map(|g| record.get_or_null(g).clone())
                .collect();
            let key = values
                .iter()
                .map(Value::canonical)
                .collect::<Vec<_>>()
                .join(&GROUP_SEPARATOR.to_string());

            let addend = match &self.spec.reduction {
                Reduction::Sum { field, .. } => match record.get_or_null(field) {
                    Value::Null => None,
                    Value::Int(i) => Some(Value::Int(*i)),
                    Value::Float(f) => Some(Value::Float(*f)),
                    other => {
                        return Err(self.error(format!("cannot sum '{}' in field '{}'", other, field)))
                    }
                },
                _ => None,
            };

            let acc = self
                .groups
                .entry(key)
                .or_insert_with(|| GroupAccumulator::new(values));
            acc.count += 1;
            match addend {
                Some(Value::Int(i)) => acc.int_sum += i as i128,
                Some(Value::Float(f)) => {
                    acc.float_sum += f;
                    acc.saw_float = true;
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn merge(&mut self, other: AggregateState) -> Result<()> {
        if other.spec != self.spec {
            return Err(self.error(format!(
                "cannot merge state of '{}' into a different reduction",
                other.spec.name
            )));
        }
        for (key, acc) in other.groups {
            match self.groups.get_mut(&key) {
                Some(existing) => existing.merge(acc),
                None => {
                    self.groups.insert(key, acc);
                }
            }
        }
        Ok(())
    }

    /// Curated rows: grouping fields, the reduction output, and the window flag.
    pub fn finish(self, window_complete: bool) -> Vec<Record> {
        let output = self.spec.reduction.output().to_string();
        let grouping = self.spec.grouping.clone();
        let build = |acc: &GroupAccumulator, value: Value| {
            let mut row = Record::new();
            for (name, v) in grouping.iter().zip(acc.values.iter()) {
                row.set(name.clone(), v.clone());
            }
            row.set(output.clone(), value);
            row
        };

        match &self.spec.reduction {
            Reduction::Count { .. } => self
                .groups
                .values()
                .map(|acc| with_window(build(acc, Value::Int(acc.count as i64)), window_complete))
                .collect(),
            Reduction::Sum { .. } => self
                .groups
                .values()
                .map(|acc| with_window(build(acc, acc.sum_value()), window_complete))
                .collect(),
            Reduction::TopN { n, .. } => {
                let mut ranked: Vec<(&String, &GroupAccumulator)> = self.groups.iter().collect();
                // BTreeMap iteration is already key-ascending; a stable sort keeps that for ties
                ranked.sort_by(|a, b| b.1.count.cmp(&a.1.count));
                ranked
                    .into_iter()
                    .take(*n)
                    .enumerate()
                    .map(|(i, (_, acc))| {
                        let mut row = build(acc, Value::Int(acc.count as i64));
                        row.set(RANK_FIELD, Value::Int(i as i64 + 1));
                        with_window(row, window_complete)
                    })
                    .collect()
            }
        }
    }
}

fn with_window(mut row: Record, complete: bool) -> Record {
    row.set(WINDOW_COMPLETE_FIELD, Value::Bool(complete));
    row
}

/// Aggregate a complete set of cleaned records in one pass.
pub fn aggregate(cleaned: &[Record], spec: &AggregateSpec) -> Result<Vec<Record>> {
    let mut state = AggregateState::new(spec);
    state.absorb(cleaned)?;
    Ok(state.finish(true))
}
