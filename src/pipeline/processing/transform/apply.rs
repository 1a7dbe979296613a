// Per-rule evaluation. Each function reads its inputs from the record and
// writes its targets; an Err is (offending field, reason).

use chrono::{Datelike, NaiveDate, NaiveDateTime};
use regex::Regex;

use crate::domain::coerce::parse_iso_date;
use crate::domain::{ArithmeticOp, CalendarField, DatePart, FilterPredicate, Record, ReplaceMode, Value};

pub(super) type RuleResult<T> = std::result::Result<T, (String, String)>;

fn fail<T>(field: &str, reason: impl Into<String>) -> RuleResult<T> {
    Err((field.to_string(), reason.into()))
}

fn require<'a>(record: &'a Record, field: &str) -> RuleResult<&'a Value> {
    match record.get_or_null(field) {
        Value::Null => fail(field, "input is null"),
        v => Ok(v),
    }
}

fn require_str<'a>(record: &'a Record, field: &str) -> RuleResult<&'a str> {
    match require(record, field)? {
        Value::Str(s) => Ok(s),
        other => fail(field, format!("expected a string, found '{}'", other)),
    }
}

pub(super) fn derive_calendar(record: &mut Record, source: &str, parts: &[CalendarField]) -> RuleResult<()> {
    let date = match require(record, source)? {
        Value::Date(d) => *d,
        Value::Timestamp(t) => t.date(),
        Value::Str(s) => match parse_iso_date(s) {
            Some(d) => d,
            None => return fail(source, format!("'{}' is not an ISO-8601 date", s)),
        },
        other => return fail(source, format!("'{}' is not a date", other)),
    };
    for field in parts {
        let n = match field.part {
            DatePart::Year => date.year() as i64,
            DatePart::Quarter => (date.month0() / 3 + 1) as i64,
            DatePart::Month => date.month() as i64,
            DatePart::Day => date.day() as i64,
            DatePart::Weekday => date.weekday().number_from_monday() as i64,
        };
        record.set(field.target.clone(), Value::Int(n));
    }
    Ok(())
}

pub(super) fn concat(
    record: &mut Record,
    sources: &[String],
    separator: &str,
    target: &str,
    skip_nulls: bool,
) -> RuleResult<()> {
    let mut parts = Vec::with_capacity(sources.len());
    for source in sources {
        match record.get_or_null(source) {
            Value::Null if skip_nulls => {}
            Value::Null => return fail(source, "input is null"),
            Value::Str(s) if skip_nulls && s.trim().is_empty() => {}
            v => parts.push(v.to_string()),
        }
    }
    if parts.is_empty() {
        let first = sources.first().map(String::as_str).unwrap_or(target);
        return fail(first, "every input is null");
    }
    record.set(target, Value::Str(parts.join(separator)));
    Ok(())
}

pub(super) fn split_segment(
    record: &mut Record,
    source: &str,
    delimiter: &str,
    index: usize,
    target: &str,
) -> RuleResult<()> {
    let text = require_str(record, source)?;
    let segment = match text.split(delimiter).nth(index) {
        Some(s) => s.to_string(),
        None => {
            let count = text.split(delimiter).count();
            return fail(
                source,
                format!("'{}' has {} segment(s), no index {}", text, count, index),
            );
        }
    };
    record.set(target, Value::Str(segment));
    Ok(())
}

pub(super) fn parse_timestamp(record: &mut Record, source: &str, format: &str, target: &str) -> RuleResult<()> {
    let parsed = match require(record, source)? {
        Value::Timestamp(t) => *t,
        Value::Date(d) => midnight(*d),
        Value::Str(s) => match NaiveDateTime::parse_from_str(s.trim(), format) {
            Ok(t) => t,
            Err(_) => match NaiveDate::parse_from_str(s.trim(), format) {
                Ok(d) => midnight(d),
                Err(e) => return fail(source, format!("'{}' does not match '{}': {}", s, format, e)),
            },
        },
        other => return fail(source, format!("'{}' is not a timestamp", other)),
    };
    record.set(target, Value::Timestamp(parsed));
    Ok(())
}

fn midnight(d: NaiveDate) -> NaiveDateTime {
    d.and_time(chrono::NaiveTime::MIN)
}

pub(super) fn replace(
    record: &mut Record,
    source: &str,
    pattern: &str,
    replacement: &str,
    target: &str,
    mode: ReplaceMode,
    regex: Option<&Regex>,
) -> RuleResult<()> {
    let text = require_str(record, source)?;
    let replaced = match mode {
        ReplaceMode::All => text.replace(pattern, replacement),
        ReplaceMode::First => text.replacen(pattern, replacement, 1),
        ReplaceMode::Prefix => match text.strip_prefix(pattern) {
            Some(rest) => format!("{}{}", replacement, rest),
            None => text.to_string(),
        },
        ReplaceMode::Regex => match regex {
            Some(re) => re.replace_all(text, replacement).into_owned(),
            None => return fail(source, "regex was not compiled"),
        },
    };
    record.set(target, Value::Str(replaced));
    Ok(())
}

pub(super) fn compute(record: &mut Record, left: &str, right: &str, op: ArithmeticOp, target: &str) -> RuleResult<()> {
    let l = require(record, left)?;
    let r = require(record, right)?;
    let result = match (l, r, op) {
        (Value::Int(a), Value::Int(b), ArithmeticOp::Multiply) => int_result(left, a.checked_mul(*b))?,
        (Value::Int(a), Value::Int(b), ArithmeticOp::Add) => int_result(left, a.checked_add(*b))?,
        (Value::Int(a), Value::Int(b), ArithmeticOp::Subtract) => int_result(left, a.checked_sub(*b))?,
        _ => {
            let a = match l.as_f64() {
                Some(a) => a,
                None => return fail(left, format!("'{}' is not a number", l)),
            };
            let b = match r.as_f64() {
                Some(b) => b,
                None => return fail(right, format!("'{}' is not a number", r)),
            };
            let x = match op {
                ArithmeticOp::Multiply => a * b,
                ArithmeticOp::Add => a + b,
                ArithmeticOp::Subtract => a - b,
                ArithmeticOp::Divide => {
                    if b == 0.0 {
                        return fail(right, "division by zero");
                    }
                    a / b
                }
            };
            if !x.is_finite() {
                return fail(left, format!("result of {} is not finite", op.symbol()));
            }
            Value::Float(x)
        }
    };
    record.set(target, result);
    Ok(())
}

fn int_result(field: &str, value: Option<i64>) -> RuleResult<Value> {
    match value {
        Some(v) => Ok(Value::Int(v)),
        None => fail(field, "integer overflow"),
    }
}

/// True when the record should be kept.
pub(super) fn filter(record: &Record, field: &str, predicate: &FilterPredicate) -> bool {
    let value = record.get_or_null(field);
    match predicate {
        FilterPredicate::NotNull => !value.is_null(),
        FilterPredicate::Equals(expected) => matches_json(value, expected),
        FilterPredicate::NotEquals(expected) => !value.is_null() && !matches_json(value, expected),
        FilterPredicate::OneOf(options) => options.iter().any(|o| matches_json(value, o)),
    }
}

fn matches_json(value: &Value, expected: &serde_json::Value) -> bool {
    if value.is_null() {
        return expected.is_null();
    }
    match (value.as_f64(), expected.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => value.to_json() == *expected,
    }
}
