use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use super::rules::{ArithmeticOp, ReplaceMode, TransformRule};
use super::value::FieldType;
use crate::config::{TransformPolicy, ValidationPolicy};
use crate::constants::{RANK_FIELD, WINDOW_COMPLETE_FIELD};
use crate::error::{CurateError, Result};

/// One declared column: name, type, nullability and optional default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub nullable: bool,
    #[serde(default)]
    pub default: Option<serde_json::Value>,
}

impl FieldSpec {
    pub fn required(name: &str, field_type: FieldType) -> Self {
        Self {
            name: name.to_string(),
            field_type,
            nullable: false,
            default: None,
        }
    }

    pub fn optional(name: &str, field_type: FieldType) -> Self {
        Self {
            name: name.to_string(),
            field_type,
            nullable: true,
            default: None,
        }
    }

    pub fn with_default(mut self, default: serde_json::Value) -> Self {
        self.default = Some(default);
        self
    }
}

/// How a grouped reduction collapses each group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Reduction {
    Count { output: String },
    Sum { field: String, output: String },
    /// The `n` largest groups by record count, ranked from 1.
    TopN { n: usize, output: String },
}

impl Reduction {
    pub fn output(&self) -> &str {
        match self {
            Reduction::Count { output }
            | Reduction::Sum { output, .. }
            | Reduction::TopN { output, .. } => output,
        }
    }
}

/// A curated entity computed from a dataset's cleaned tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateSpec {
    pub name: String,
    pub grouping: Vec<String>,
    pub reduction: Reduction,
}

/// A named logical entity: schema, identity, and how it is cleaned and summarized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub name: String,
    pub schema: Vec<FieldSpec>,
    #[serde(default)]
    pub identity_key: Vec<String>,
    /// Among records sharing an identity, the highest value of this field wins.
    #[serde(default)]
    pub tie_break: Option<String>,
    /// Raw field whose date decides the partition a record is deposited under.
    #[serde(default)]
    pub partition_field: Option<String>,
    #[serde(default)]
    pub rules: Vec<TransformRule>,
    /// Cleaned-tier columns, in order. Empty keeps every field.
    #[serde(default)]
    pub output_order: Vec<String>,
    #[serde(default)]
    pub reject_unknown_fields: bool,
    #[serde(default)]
    pub validation_policy: Option<ValidationPolicy>,
    #[serde(default)]
    pub transform_policy: Option<TransformPolicy>,
    #[serde(default)]
    pub aggregates: Vec<AggregateSpec>,
}

impl Dataset {
    pub fn new(name: &str, schema: Vec<FieldSpec>) -> Self {
        Self {
            name: name.to_string(),
            schema,
            identity_key: Vec::new(),
            tie_break: None,
            partition_field: None,
            rules: Vec::new(),
            output_order: Vec::new(),
            reject_unknown_fields: false,
            validation_policy: None,
            transform_policy: None,
            aggregates: Vec::new(),
        }
    }

    pub fn with_identity(mut self, fields: &[&str]) -> Self {
        self.identity_key = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn with_tie_break(mut self, field: &str) -> Self {
        self.tie_break = Some(field.to_string());
        self
    }

    pub fn with_partition_field(mut self, field: &str) -> Self {
        self.partition_field = Some(field.to_string());
        self
    }

    pub fn with_rules(mut self, rules: Vec<TransformRule>) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_output_order(mut self, fields: &[&str]) -> Self {
        self.output_order = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn with_aggregate(mut self, spec: AggregateSpec) -> Self {
        self.aggregates.push(spec);
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.schema.iter().find(|f| f.name == name)
    }

    pub fn validation_policy_or(&self, fallback: ValidationPolicy) -> ValidationPolicy {
        self.validation_policy.unwrap_or(fallback)
    }

    pub fn transform_policy_or(&self, fallback: TransformPolicy) -> TransformPolicy {
        self.transform_policy.unwrap_or(fallback)
    }

    /// Columns of the cleaned tier after every rule and the output projection.
    pub fn output_schema(&self) -> Vec<FieldSpec> {
        let mut fields = self.schema_after_rules(self.rules.len());
        if self.output_order.is_empty() {
            return fields.into_values().collect();
        }
        self.output_order
            .iter()
            .filter_map(|name| fields.shift_remove(name))
            .collect()
    }

    pub fn output_field_names(&self) -> Vec<String> {
        self.output_schema().into_iter().map(|f| f.name).collect()
    }

    /// Columns of a curated entity computed by `spec` over this dataset.
    pub fn aggregate_schema(&self, spec: &AggregateSpec) -> Vec<FieldSpec> {
        let cleaned = self.output_schema();
        let type_of = |name: &str| {
            cleaned
                .iter()
                .find(|f| f.name == name)
                .map(|f| f.field_type)
                .unwrap_or(FieldType::String)
        };
        let mut fields: Vec<FieldSpec> = spec
            .grouping
            .iter()
            .map(|g| derived(g, type_of(g)))
            .collect();
        match &spec.reduction {
            Reduction::Count { output } => fields.push(derived(output, FieldType::Int)),
            Reduction::Sum { field, output } => fields.push(derived(output, type_of(field))),
            Reduction::TopN { output, .. } => {
                fields.push(derived(output, FieldType::Int));
                fields.push(derived(RANK_FIELD, FieldType::Int));
            }
        }
        fields.push(derived(WINDOW_COMPLETE_FIELD, FieldType::Bool));
        fields
    }

    /// Field set visible to rule `upto` (exclusive).
    fn schema_after_rules(&self, upto: usize) -> IndexMap<String, FieldSpec> {
        let mut fields: IndexMap<String, FieldSpec> = self
            .schema
            .iter()
            .map(|f| (f.name.clone(), f.clone()))
            .collect();
        for rule in self.rules.iter().take(upto) {
            apply_rule_to_schema(rule, &mut fields);
        }
        fields
    }

    /// Rejects definitions that reference unknown fields or mistyped inputs.
    pub fn validate_definition(&self) -> Result<()> {
        let fail = |message: String| {
            Err(CurateError::Definition {
                dataset: self.name.clone(),
                message,
            })
        };

        if self.name.trim().is_empty() {
            return fail("dataset name is empty".to_string());
        }
        if self.schema.is_empty() {
            return fail("schema declares no fields".to_string());
        }
        let mut seen = HashSet::new();
        for spec in &self.schema {
            if !seen.insert(spec.name.as_str()) {
                return fail(format!("field '{}' is declared twice", spec.name));
            }
            if let Some(default) = &spec.default {
                if let Err(reason) = super::coerce::coerce(default, spec.field_type) {
                    return fail(format!("default for '{}' is invalid: {}", spec.name, reason));
                }
            }
        }

        for (i, rule) in self.rules.iter().enumerate() {
            let visible = self.schema_after_rules(i);
            for input in rule.inputs() {
                if !visible.contains_key(input) {
                    return fail(format!(
                        "rule {} reads unknown field '{}'",
                        rule.label(),
                        input
                    ));
                }
            }
            if let Err(message) = check_rule_input_types(rule, &visible) {
                return fail(format!("rule {}: {}", rule.label(), message));
            }
        }

        let after_rules = self.schema_after_rules(self.rules.len());
        for name in &self.output_order {
            if !after_rules.contains_key(name) {
                return fail(format!("output field '{}' is never produced", name));
            }
        }

        let output: IndexMap<String, FieldSpec> = self
            .output_schema()
            .into_iter()
            .map(|f| (f.name.clone(), f))
            .collect();
        for key in &self.identity_key {
            if !output.contains_key(key) {
                return fail(format!("identity field '{}' is not in the output", key));
            }
        }
        if let Some(tie) = &self.tie_break {
            if !output.contains_key(tie) {
                return fail(format!("tie-break field '{}' is not in the output", tie));
            }
        }
        if let Some(pf) = &self.partition_field {
            match self.field(pf).map(|f| f.field_type) {
                Some(FieldType::Date | FieldType::Timestamp | FieldType::String) => {}
                Some(other) => {
                    return fail(format!("partition field '{}' has type {}", pf, other))
                }
                None => return fail(format!("partition field '{}' is not declared", pf)),
            }
        }

        let mut aggregate_names = HashSet::new();
        for agg in &self.aggregates {
            if agg.name == self.name || !aggregate_names.insert(agg.name.as_str()) {
                return fail(format!("aggregate name '{}' is not unique", agg.name));
            }
            if agg.grouping.is_empty() {
                return fail(format!("aggregate '{}' has no grouping", agg.name));
            }
            for g in &agg.grouping {
                if !output.contains_key(g) {
                    return fail(format!("aggregate '{}' groups by unknown '{}'", agg.name, g));
                }
            }
            match &agg.reduction {
                Reduction::Sum { field, .. } => match output.get(field) {
                    Some(spec) if spec.field_type.is_numeric() => {}
                    _ => {
                        return fail(format!(
                            "aggregate '{}' sums non-numeric field '{}'",
                            agg.name, field
                        ))
                    }
                },
                Reduction::TopN { n, .. } if *n == 0 => {
                    return fail(format!("aggregate '{}' has top-n of zero", agg.name))
                }
                _ => {}
            }
        }
        Ok(())
    }
}

fn derived(name: &str, field_type: FieldType) -> FieldSpec {
    FieldSpec::optional(name, field_type)
}

fn apply_rule_to_schema(rule: &TransformRule, fields: &mut IndexMap<String, FieldSpec>) {
    match rule {
        TransformRule::DeriveCalendar { parts, .. } => {
            for part in parts {
                fields.insert(part.target.clone(), derived(&part.target, FieldType::Int));
            }
        }
        TransformRule::Concat { target, .. }
        | TransformRule::SplitSegment { target, .. } => {
            fields.insert(target.clone(), derived(target, FieldType::String));
        }
        TransformRule::ParseTimestamp { target, .. } => {
            fields.insert(target.clone(), derived(target, FieldType::Timestamp));
        }
        TransformRule::Replace { source, target, .. } => {
            let name = target.as_ref().unwrap_or(source);
            fields.insert(name.clone(), derived(name, FieldType::String));
        }
        TransformRule::Compute {
            left,
            right,
            op,
            target,
        } => {
            let both_int = [left, right]
                .iter()
                .all(|f| fields.get(*f).map(|s| s.field_type) == Some(FieldType::Int));
            let field_type = if both_int && *op != ArithmeticOp::Divide {
                FieldType::Int
            } else {
                FieldType::Float
            };
            fields.insert(target.clone(), derived(target, field_type));
        }
        TransformRule::Rename { from, to } => {
            if let Some(index) = fields.get_index_of(from) {
                if let Some((_, mut spec)) = fields.shift_remove_index(index) {
                    spec.name = to.clone();
                    fields.shift_insert(index, to.clone(), spec);
                }
            }
        }
        TransformRule::Filter { .. } => {}
    }
}

fn check_rule_input_types(
    rule: &TransformRule,
    visible: &IndexMap<String, FieldSpec>,
) -> std::result::Result<(), String> {
    let type_of = |name: &str| visible.get(name).map(|f| f.field_type);
    match rule {
        TransformRule::DeriveCalendar { source, parts } => {
            if parts.is_empty() {
                return Err("no calendar parts requested".to_string());
            }
            match type_of(source) {
                Some(FieldType::Date | FieldType::Timestamp | FieldType::String) => Ok(()),
                Some(t) => Err(format!("'{}' is {}, expected a date", source, t)),
                None => Ok(()),
            }
        }
        TransformRule::SplitSegment {
            source, delimiter, ..
        } => {
            if delimiter.is_empty() {
                return Err("delimiter is empty".to_string());
            }
            expect_string(source, type_of(source))
        }
        TransformRule::ParseTimestamp { source, .. } => expect_string(source, type_of(source)),
        TransformRule::Replace {
            source,
            pattern,
            mode,
            ..
        } => {
            if pattern.is_empty() {
                return Err("pattern is empty".to_string());
            }
            if *mode == ReplaceMode::Regex {
                regex::Regex::new(pattern).map_err(|e| format!("invalid regex: {}", e))?;
            }
            expect_string(source, type_of(source))
        }
        TransformRule::Compute { left, right, .. } => {
            for f in [left, right] {
                match type_of(f) {
                    Some(t) if t.is_numeric() => {}
                    Some(t) => return Err(format!("'{}' is {}, expected a number", f, t)),
                    None => {}
                }
            }
            Ok(())
        }
        TransformRule::Concat { sources, .. } => {
            if sources.is_empty() {
                Err("no sources to concatenate".to_string())
            } else {
                Ok(())
            }
        }
        TransformRule::Rename { .. } | TransformRule::Filter { .. } => Ok(()),
    }
}

fn expect_string(name: &str, t: Option<FieldType>) -> std::result::Result<(), String> {
    match t {
        Some(FieldType::String) | None => Ok(()),
        Some(other) => Err(format!("'{}' is {}, expected a string", name, other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::rules::{CalendarField, DatePart};

    fn sales() -> Dataset {
        Dataset::new(
            "Sales",
            vec![
                FieldSpec::required("OrderNumber", FieldType::String),
                FieldSpec::required("Qty", FieldType::Int),
                FieldSpec::required("LineItem", FieldType::Int),
            ],
        )
        .with_rules(vec![TransformRule::Compute {
            left: "Qty".into(),
            right: "LineItem".into(),
            op: ArithmeticOp::Multiply,
            target: "Multiply".into(),
        }])
        .with_identity(&["OrderNumber", "LineItem"])
    }

    #[test]
    fn test_output_schema_includes_derived_fields() {
        let names = sales().output_field_names();
        assert_eq!(names, vec!["OrderNumber", "Qty", "LineItem", "Multiply"]);
        let multiply = sales()
            .output_schema()
            .into_iter()
            .find(|f| f.name == "Multiply")
            .unwrap();
        assert_eq!(multiply.field_type, FieldType::Int);
        assert!(sales().validate_definition().is_ok());
    }

    #[test]
    fn test_aggregate_schema_types_outputs() {
        let spec = AggregateSpec {
            name: "ByOrder".into(),
            grouping: vec!["OrderNumber".into()],
            reduction: Reduction::Sum {
                field: "Multiply".into(),
                output: "Total".into(),
            },
        };
        let fields = sales().aggregate_schema(&spec);
        let names: Vec<&str> = fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["OrderNumber", "Total", "window_complete"]);
        assert_eq!(fields[1].field_type, FieldType::Int);
        assert_eq!(fields[2].field_type, FieldType::Bool);
    }

    #[test]
    fn test_output_order_projects_fields() {
        let ds = sales().with_output_order(&["OrderNumber", "Multiply"]);
        assert_eq!(ds.output_field_names(), vec!["OrderNumber", "Multiply"]);
    }

    #[test]
    fn test_rejects_rule_reading_unknown_field() {
        let ds = Dataset::new("Calendar", vec![FieldSpec::required("Day", FieldType::Date)])
            .with_rules(vec![TransformRule::DeriveCalendar {
                source: "Date".into(),
                parts: vec![CalendarField {
                    part: DatePart::Month,
                    target: "Month".into(),
                }],
            }]);
        assert!(matches!(
            ds.validate_definition(),
            Err(CurateError::Definition { .. })
        ));
    }

    #[test]
    fn test_rejects_identity_outside_output() {
        let ds = sales()
            .with_output_order(&["OrderNumber", "Multiply"])
            .with_identity(&["LineItem"]);
        assert!(ds.validate_definition().is_err());
    }

    #[test]
    fn test_rejects_sum_over_string() {
        let ds = sales().with_aggregate(AggregateSpec {
            name: "Bad".into(),
            grouping: vec!["Qty".into()],
            reduction: Reduction::Sum {
                field: "OrderNumber".into(),
                output: "total".into(),
            },
        });
        assert!(ds.validate_definition().is_err());
    }

    #[test]
    fn test_dataset_definition_parses_from_json() {
        let json = serde_json::json!({
            "name": "PageViews",
            "schema": [
                {"name": "url", "type": "string"},
                {"name": "viewed_at", "type": "timestamp"},
                {"name": "referrer", "type": "string", "nullable": true, "default": "direct"}
            ],
            "identity_key": ["url", "viewed_at"],
            "aggregates": [
                {"name": "ViewsByUrl", "grouping": ["url"], "reduction": {"kind": "count", "output": "views"}}
            ]
        });
        let ds: Dataset = serde_json::from_value(json).unwrap();
        assert!(ds.validate_definition().is_ok());
        assert_eq!(ds.aggregates[0].reduction.output(), "views");
    }
}
