use indexmap::IndexMap;
use serde_json::{Map, Value as JsonValue};

use super::dataset::FieldSpec;
use super::value::Value;

/// Untyped field mapping as delivered by acquisition and as stored on disk.
pub type RawRecord = Map<String, JsonValue>;

/// Separator between key components; a control character that never appears in canonical forms.
const KEY_SEPARATOR: char = '\u{1f}';

/// Ordered field→value mapping. Field order follows the dataset's declared schema.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Record {
    fields: IndexMap<String, Value>,
}

/// Canonical identity of a record under some key definition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdentityKey(String);

impl IdentityKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn from_stored(s: impl Into<String>) -> Self {
        IdentityKey(s.into())
    }
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        Self {
            fields: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Missing fields read as null.
    pub fn get_or_null(&self, field: &str) -> &Value {
        self.fields.get(field).unwrap_or(&Value::Null)
    }

    /// Overwrites in place if the field exists, otherwise appends.
    pub fn set(&mut self, field: impl Into<String>, value: Value) {
        self.fields.insert(field.into(), value);
    }

    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.fields.shift_remove(field)
    }

    /// Renames a field keeping its position.
    pub fn rename(&mut self, from: &str, to: &str) {
        if let Some(index) = self.fields.get_index_of(from) {
            if let Some((_, value)) = self.fields.shift_remove_index(index) {
                self.fields.shift_insert(index, to.to_string(), value);
            }
        }
    }

    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Keeps exactly the named fields, in the given order; absent ones become null.
    pub fn project(&self, order: &[String]) -> Record {
        Record {
            fields: order
                .iter()
                .map(|name| (name.clone(), self.get_or_null(name).clone()))
                .collect(),
        }
    }

    /// Identity under `key_fields`; an empty key means whole-record identity.
    pub fn identity(&self, key_fields: &[String]) -> IdentityKey {
        let mut key = String::new();
        if key_fields.is_empty() {
            for (i, (name, value)) in self.fields.iter().enumerate() {
                if i > 0 {
                    key.push(KEY_SEPARATOR);
                }
                key.push_str(name);
                key.push('=');
                key.push_str(&value.canonical());
            }
        } else {
            for (i, name) in key_fields.iter().enumerate() {
                if i > 0 {
                    key.push(KEY_SEPARATOR);
                }
                key.push_str(&self.get_or_null(name).canonical());
            }
        }
        IdentityKey(key)
    }

    pub fn to_json_map(&self) -> RawRecord {
        self.fields
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect()
    }

    /// Decodes a stored row against a known schema. Values that no longer coerce
    /// to their declared type are an error: the stored tier has drifted.
    pub fn from_json_typed(
        raw: &RawRecord,
        schema: &[FieldSpec],
    ) -> std::result::Result<Record, String> {
        let mut record = Record::new();
        for spec in schema {
            let value = match raw.get(&spec.name) {
                None | Some(JsonValue::Null) => Value::Null,
                Some(v) => super::coerce::coerce(v, spec.field_type)
                    .map_err(|reason| format!("{}: {}", spec.name, reason))?,
            };
            record.set(spec.name.clone(), value);
        }
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_preserves_existing_position() {
        let mut record = Record::from_pairs([("a", 1i64), ("b", 2i64)]);
        record.set("a", Value::Int(10));
        record.set("c", Value::Int(3));
        let names: Vec<&str> = record.field_names().collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(record.get("a"), Some(&Value::Int(10)));
    }

    #[test]
    fn test_rename_keeps_position() {
        let mut record = Record::from_pairs([("a", 1i64), ("b", 2i64), ("c", 3i64)]);
        record.rename("b", "beta");
        let names: Vec<&str> = record.field_names().collect();
        assert_eq!(names, vec!["a", "beta", "c"]);
    }

    #[test]
    fn test_identity_uses_declared_fields_only() {
        let a = Record::from_pairs([("id", Value::Int(1)), ("note", Value::from("x"))]);
        let b = Record::from_pairs([("id", Value::Int(1)), ("note", Value::from("y"))]);
        let key = vec!["id".to_string()];
        assert_eq!(a.identity(&key), b.identity(&key));
        assert_ne!(a.identity(&[]), b.identity(&[]));
    }

    #[test]
    fn test_project_orders_and_fills_nulls() {
        let record = Record::from_pairs([("b", 2i64), ("a", 1i64)]);
        let projected = record.project(&["a".to_string(), "z".to_string()]);
        let names: Vec<&str> = projected.field_names().collect();
        assert_eq!(names, vec!["a", "z"]);
        assert!(projected.get_or_null("z").is_null());
    }
}
