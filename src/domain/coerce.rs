//! Deterministic JSON → typed value coercion.
//!
//! Only unambiguous conversions are accepted. Dates must be ISO-8601
//! (`YYYY-MM-DD`, optionally with a time part); formats like `03/15/2024`
//! or bare epoch numbers are rejected rather than guessed.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde_json::Value as JsonValue;

use super::value::{FieldType, Value, DATE_FORMAT};

/// Coerce a non-null JSON value to `target`, or explain why it cannot be.
pub fn coerce(value: &JsonValue, target: FieldType) -> Result<Value, String> {
    match target {
        FieldType::String => coerce_string(value),
        FieldType::Int => coerce_int(value),
        FieldType::Float => coerce_float(value),
        FieldType::Bool => coerce_bool(value),
        FieldType::Date => coerce_date(value),
        FieldType::Timestamp => coerce_timestamp(value),
    }
}

fn describe(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "bool",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

fn coerce_string(value: &JsonValue) -> Result<Value, String> {
    match value {
        JsonValue::String(s) => Ok(Value::Str(s.clone())),
        JsonValue::Number(n) => Ok(Value::Str(n.to_string())),
        JsonValue::Bool(b) => Ok(Value::Str(b.to_string())),
        other => Err(format!("cannot coerce {} to string", describe(other))),
    }
}

fn coerce_int(value: &JsonValue) -> Result<Value, String> {
    match value {
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                return Ok(Value::Int(i));
            }
            match n.as_f64() {
                Some(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => Ok(Value::Int(f as i64)),
                _ => Err(format!("number {} is not an integer", n)),
            }
        }
        JsonValue::String(s) => s
            .trim()
            .parse::<i64>()
            .map(Value::Int)
            .map_err(|_| format!("'{}' is not an integer", s)),
        other => Err(format!("cannot coerce {} to int", describe(other))),
    }
}

fn coerce_float(value: &JsonValue) -> Result<Value, String> {
    let parsed = match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse::<f64>().ok(),
        other => return Err(format!("cannot coerce {} to float", describe(other))),
    };
    match parsed {
        Some(f) if f.is_finite() => Ok(Value::Float(f)),
        _ => Err(format!("'{}' is not a finite number", value)),
    }
}

fn coerce_bool(value: &JsonValue) -> Result<Value, String> {
    match value {
        JsonValue::Bool(b) => Ok(Value::Bool(*b)),
        JsonValue::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            _ => Err(format!("'{}' is not a boolean", s)),
        },
        JsonValue::Number(n) => match n.as_i64() {
            Some(0) => Ok(Value::Bool(false)),
            Some(1) => Ok(Value::Bool(true)),
            _ => Err(format!("number {} is not a boolean", n)),
        },
        other => Err(format!("cannot coerce {} to bool", describe(other))),
    }
}

/// `YYYY-MM-DD`, or an ISO-8601 datetime whose date part is taken.
pub fn parse_iso_date(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    if let Ok(d) = NaiveDate::parse_from_str(s, DATE_FORMAT) {
        return Some(d);
    }
    parse_iso_timestamp(s).map(|t| t.date())
}

/// RFC 3339 (normalized to UTC) or a zone-less `YYYY-MM-DDTHH:MM:SS[.fff]`.
pub fn parse_iso_timestamp(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.naive_utc());
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(t) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(t);
        }
    }
    None
}

fn coerce_date(value: &JsonValue) -> Result<Value, String> {
    match value {
        JsonValue::String(s) => parse_iso_date(s)
            .map(Value::Date)
            .ok_or_else(|| format!("'{}' is not an ISO-8601 date", s)),
        other => Err(format!("cannot coerce {} to date", describe(other))),
    }
}

fn coerce_timestamp(value: &JsonValue) -> Result<Value, String> {
    match value {
        JsonValue::String(s) => {
            if let Some(t) = parse_iso_timestamp(s) {
                return Ok(Value::Timestamp(t));
            }
            NaiveDate::parse_from_str(s.trim(), DATE_FORMAT)
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(Value::Timestamp)
                .ok_or_else(|| format!("'{}' is not an ISO-8601 timestamp", s))
        }
        // Epoch numbers are ambiguous (seconds vs. millis)
        other => Err(format!("cannot coerce {} to timestamp", describe(other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_int_accepts_numeric_strings_and_whole_floats() {
        assert_eq!(coerce(&json!("42"), FieldType::Int), Ok(Value::Int(42)));
        assert_eq!(coerce(&json!(3.0), FieldType::Int), Ok(Value::Int(3)));
        assert!(coerce(&json!(3.5), FieldType::Int).is_err());
        assert!(coerce(&json!("three"), FieldType::Int).is_err());
    }

    #[test]
    fn test_date_requires_iso() {
        let expected = NaiveDate::from_ymd_opt(2024, 3, 15).unwrap();
        assert_eq!(coerce(&json!("2024-03-15"), FieldType::Date), Ok(Value::Date(expected)));
        assert_eq!(
            coerce(&json!("2024-03-15T10:30:00Z"), FieldType::Date),
            Ok(Value::Date(expected))
        );
        assert!(coerce(&json!("03/15/2024"), FieldType::Date).is_err());
        assert!(coerce(&json!("15/03/2024"), FieldType::Date).is_err());
    }

    #[test]
    fn test_timestamp_rejects_epoch_numbers() {
        assert!(coerce(&json!(1710498600), FieldType::Timestamp).is_err());
        assert!(coerce(&json!("2024-03-15T10:30:00+02:00"), FieldType::Timestamp).is_ok());
    }

    #[test]
    fn test_bool_is_strict() {
        assert_eq!(coerce(&json!("TRUE"), FieldType::Bool), Ok(Value::Bool(true)));
        assert!(coerce(&json!("yes"), FieldType::Bool).is_err());
        assert!(coerce(&json!(2), FieldType::Bool).is_err());
    }

    #[test]
    fn test_float_rejects_non_finite_strings() {
        assert!(coerce(&json!("NaN"), FieldType::Float).is_err());
        assert_eq!(coerce(&json!("2.5"), FieldType::Float), Ok(Value::Float(2.5)));
    }
}
