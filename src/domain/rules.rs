use serde::{Deserialize, Serialize};

/// One declarative cleaning step. Datasets list these as data; the
/// transformer interprets them in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum TransformRule {
    /// Derive calendar parts (month, year, ...) from a date-like field.
    DeriveCalendar {
        source: String,
        parts: Vec<CalendarField>,
    },
    /// Join several fields into one composite string field.
    Concat {
        sources: Vec<String>,
        #[serde(default = "default_separator")]
        separator: String,
        target: String,
        /// Skip null parts instead of treating them as invalid input.
        #[serde(default)]
        skip_nulls: bool,
    },
    /// Split a string on a delimiter and keep one segment.
    SplitSegment {
        source: String,
        delimiter: String,
        index: usize,
        target: String,
    },
    /// Re-parse a string field into a timestamp with a fixed chrono format.
    ParseTimestamp {
        source: String,
        format: String,
        target: String,
    },
    /// Substring or character replacement; writes back to `source` when `target` is absent.
    Replace {
        source: String,
        pattern: String,
        replacement: String,
        #[serde(default)]
        target: Option<String>,
        #[serde(default)]
        mode: ReplaceMode,
    },
    /// `target = left <op> right`.
    Compute {
        left: String,
        right: String,
        op: ArithmeticOp,
        target: String,
    },
    Rename {
        from: String,
        to: String,
    },
    /// Keep only records whose field satisfies the predicate.
    Filter {
        field: String,
        predicate: FilterPredicate,
    },
}

fn default_separator() -> String {
    " ".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalendarField {
    pub part: DatePart,
    pub target: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatePart {
    Year,
    Quarter,
    Month,
    Day,
    /// ISO weekday, Monday = 1.
    Weekday,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplaceMode {
    #[default]
    All,
    First,
    /// Replace only when the value starts with the pattern.
    Prefix,
    Regex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArithmeticOp {
    Multiply,
    Add,
    Subtract,
    Divide,
}

impl ArithmeticOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            ArithmeticOp::Multiply => "*",
            ArithmeticOp::Add => "+",
            ArithmeticOp::Subtract => "-",
            ArithmeticOp::Divide => "/",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FilterPredicate {
    NotNull,
    Equals(serde_json::Value),
    NotEquals(serde_json::Value),
    OneOf(Vec<serde_json::Value>),
}

impl TransformRule {
    /// Short label used in logs and error reports.
    pub fn label(&self) -> String {
        match self {
            TransformRule::DeriveCalendar { source, .. } => format!("derive_calendar({})", source),
            TransformRule::Concat { target, .. } => format!("concat->{}", target),
            TransformRule::SplitSegment { source, index, .. } => {
                format!("split_segment({})[{}]", source, index)
            }
            TransformRule::ParseTimestamp { source, .. } => format!("parse_timestamp({})", source),
            TransformRule::Replace { source, .. } => format!("replace({})", source),
            TransformRule::Compute { left, right, op, .. } => {
                format!("compute({} {} {})", left, op.symbol(), right)
            }
            TransformRule::Rename { from, to } => format!("rename({}->{})", from, to),
            TransformRule::Filter { field, .. } => format!("filter({})", field),
        }
    }

    /// Fields the rule reads.
    pub fn inputs(&self) -> Vec<&str> {
        match self {
            TransformRule::DeriveCalendar { source, .. }
            | TransformRule::SplitSegment { source, .. }
            | TransformRule::ParseTimestamp { source, .. }
            | TransformRule::Replace { source, .. } => vec![source.as_str()],
            TransformRule::Concat { sources, .. } => sources.iter().map(String::as_str).collect(),
            TransformRule::Compute { left, right, .. } => vec![left.as_str(), right.as_str()],
            TransformRule::Rename { from, .. } => vec![from.as_str()],
            TransformRule::Filter { field, .. } => vec![field.as_str()],
        }
    }
}
