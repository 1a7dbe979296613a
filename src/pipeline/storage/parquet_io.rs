use chrono::{Duration, NaiveDate, NaiveDateTime};
use parquet::basic::{Compression, ConvertedType, LogicalType, Repetition, Type as PhysicalType, ZstdLevel};
use parquet::data_type::{BoolType, ByteArray, ByteArrayType, DoubleType, Int32Type, Int64Type};
use parquet::file::properties::WriterProperties;
use parquet::file::reader::{FileReader, SerializedFileReader};
use parquet::file::writer::SerializedFileWriter;
use parquet::record::Field;
use parquet::schema::types::{Type, TypePtr};
use std::collections::HashSet;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use crate::domain::coerce::coerce;
use crate::domain::{FieldSpec, FieldType, RawRecord, Value};
use crate::error::{CurateError, Result};

pub const COMPRESSION_CODEC: &str = "zstd";
pub const FILE_FORMAT: &str = "parquet";

// NaiveDate/NaiveDateTime default to 1970-01-01 (00:00:00)
fn epoch_date() -> NaiveDate {
    NaiveDate::default()
}

fn epoch_datetime() -> NaiveDateTime {
    NaiveDateTime::default()
}

/// One parquet leaf per declared field; nullable fields are OPTIONAL.
fn column_type(spec: &FieldSpec) -> Result<TypePtr> {
    let repetition = if spec.nullable {
        Repetition::OPTIONAL
    } else {
        Repetition::REQUIRED
    };
    let builder = match spec.field_type {
        FieldType::String => Type::primitive_type_builder(&spec.name, PhysicalType::BYTE_ARRAY)
            .with_logical_type(Some(LogicalType::String)),
        FieldType::Int => Type::primitive_type_builder(&spec.name, PhysicalType::INT64),
        FieldType::Float => Type::primitive_type_builder(&spec.name, PhysicalType::DOUBLE),
        FieldType::Bool => Type::primitive_type_builder(&spec.name, PhysicalType::BOOLEAN),
        FieldType::Date => Type::primitive_type_builder(&spec.name, PhysicalType::INT32)
            .with_logical_type(Some(LogicalType::Date)),
        FieldType::Timestamp => Type::primitive_type_builder(&spec.name, PhysicalType::INT64)
            .with_converted_type(ConvertedType::TIMESTAMP_MICROS),
    };
    Ok(Arc::new(builder.with_repetition(repetition).build()?))
}

fn build_schema(fields: &[FieldSpec]) -> Result<TypePtr> {
    let columns = fields.iter().map(column_type).collect::<Result<Vec<_>>>()?;
    Ok(Arc::new(
        Type::group_type_builder("schema").with_fields(columns).build()?,
    ))
}

enum ColumnValues {
    Bool(Vec<bool>),
    Int32(Vec<i32>),
    Int64(Vec<i64>),
    Double(Vec<f64>),
    Bytes(Vec<ByteArray>),
}

/// Non-null values of one column plus definition levels for OPTIONAL columns.
struct ColumnData {
    values: ColumnValues,
    def_levels: Option<Vec<i16>>,
}

fn mismatch(dataset: &str, message: String) -> CurateError {
    CurateError::Definition {
        dataset: dataset.to_string(),
        message,
    }
}

fn encode_column(dataset: &str, spec: &FieldSpec, rows: &[RawRecord]) -> Result<ColumnData> {
    let mut values = match spec.field_type {
        FieldType::String => ColumnValues::Bytes(Vec::with_capacity(rows.len())),
        FieldType::Int | FieldType::Timestamp => ColumnValues::Int64(Vec::with_capacity(rows.len())),
        FieldType::Float => ColumnValues::Double(Vec::with_capacity(rows.len())),
        FieldType::Bool => ColumnValues::Bool(Vec::with_capacity(rows.len())),
        FieldType::Date => ColumnValues::Int32(Vec::with_capacity(rows.len())),
    };
    let mut def_levels = spec.nullable.then(|| Vec::with_capacity(rows.len()));

    for row in rows {
        let typed = match row.get(&spec.name) {
            None | Some(serde_json::Value::Null) => Value::Null,
            Some(v) => coerce(v, spec.field_type)
                .map_err(|reason| mismatch(dataset, format!("column {}: {}", spec.name, reason)))?,
        };
        if typed.is_null() {
            match def_levels.as_mut() {
                Some(levels) => levels.push(0),
                None => {
                    return Err(mismatch(
                        dataset,
                        format!("column {} is required but a row holds null", spec.name),
                    ))
                }
            }
            continue;
        }
        if let Some(levels) = def_levels.as_mut() {
            levels.push(1);
        }
        match (&mut values, typed) {
            (ColumnValues::Bytes(out), Value::Str(s)) => out.push(ByteArray::from(s.as_str())),
            (ColumnValues::Int64(out), Value::Int(i)) => out.push(i),
            (ColumnValues::Int64(out), Value::Timestamp(t)) => {
                let micros = (t - epoch_datetime()).num_microseconds().ok_or_else(|| {
                    mismatch(dataset, format!("column {}: timestamp out of range", spec.name))
                })?;
                out.push(micros);
            }
            (ColumnValues::Double(out), Value::Float(f)) => out.push(f),
            (ColumnValues::Double(out), Value::Int(i)) => out.push(i as f64),
            (ColumnValues::Bool(out), Value::Bool(b)) => out.push(b),
            (ColumnValues::Int32(out), Value::Date(d)) => {
                let days = i32::try_from((d - epoch_date()).num_days()).map_err(|_| {
                    mismatch(dataset, format!("column {}: date out of range", spec.name))
                })?;
                out.push(days);
            }
            (_, other) => {
                return Err(mismatch(
                    dataset,
                    format!("column {} is {} but a row holds {}", spec.name, spec.field_type, other),
                ))
            }
        }
    }
    Ok(ColumnData { values, def_levels })
}

/// Write one zstd-compressed parquet file holding `rows` in order, one typed
/// column per field of `fields`. A row with a field outside `fields`, or a
/// value that does not fit its column, fails the write.
pub fn write_rows(path: &Path, dataset: &str, fields: &[FieldSpec], rows: &[RawRecord]) -> Result<()> {
    if fields.is_empty() {
        return Err(mismatch(dataset, "no columns declared for a columnar write".to_string()));
    }
    let known: HashSet<&str> = fields.iter().map(|f| f.name.as_str()).collect();
    if let Some(extra) = rows
        .iter()
        .flat_map(|row| row.keys())
        .find(|k| !known.contains(k.as_str()))
    {
        return Err(mismatch(dataset, format!("row field {} has no column", extra)));
    }

    let columns = fields
        .iter()
        .map(|spec| encode_column(dataset, spec, rows))
        .collect::<Result<Vec<_>>>()?;

    let schema = build_schema(fields)?;
    let props = Arc::new(
        WriterProperties::builder()
            .set_compression(Compression::ZSTD(ZstdLevel::default()))
            .build(),
    );

    let file = File::create(path)?;
    let mut writer = SerializedFileWriter::new(file, schema, props)?;
    {
        let mut row_group = writer.next_row_group()?;
        for column in &columns {
            let Some(mut col_writer) = row_group.next_column()? else {
                return Err(CurateError::Config(
                    "parquet schema has fewer columns than declared".to_string(),
                ));
            };
            let defs = column.def_levels.as_deref();
            match &column.values {
                ColumnValues::Bool(v) => col_writer.typed::<BoolType>().write_batch(v, defs, None)?,
                ColumnValues::Int32(v) => col_writer.typed::<Int32Type>().write_batch(v, defs, None)?,
                ColumnValues::Int64(v) => col_writer.typed::<Int64Type>().write_batch(v, defs, None)?,
                ColumnValues::Double(v) => col_writer.typed::<DoubleType>().write_batch(v, defs, None)?,
                ColumnValues::Bytes(v) => col_writer.typed::<ByteArrayType>().write_batch(v, defs, None)?,
            };
            col_writer.close()?;
        }
        row_group.close()?;
    }
    let file = writer.into_inner()?;
    file.sync_all()?;
    Ok(())
}

fn field_to_json(path: &Path, column: &str, field: &Field) -> Result<serde_json::Value> {
    let value = match field {
        Field::Null => Value::Null,
        Field::Bool(b) => Value::Bool(*b),
        Field::Int(i) => Value::Int(i64::from(*i)),
        Field::Long(i) => Value::Int(*i),
        Field::Float(f) => Value::Float(f64::from(*f)),
        Field::Double(f) => Value::Float(*f),
        Field::Str(s) => Value::Str(s.clone()),
        Field::Date(days) => epoch_date()
            .checked_add_signed(Duration::days(i64::from(*days)))
            .map(Value::Date)
            .unwrap_or(Value::Null),
        Field::TimestampMicros(micros) => epoch_datetime()
            .checked_add_signed(Duration::microseconds(*micros))
            .map(Value::Timestamp)
            .unwrap_or(Value::Null),
        Field::TimestampMillis(millis) => epoch_datetime()
            .checked_add_signed(Duration::milliseconds(*millis))
            .map(Value::Timestamp)
            .unwrap_or(Value::Null),
        other => {
            return Err(CurateError::Config(format!(
                "{}: unsupported value in column {}: {:?}",
                path.display(),
                column,
                other
            )))
        }
    };
    Ok(value.to_json())
}

/// Read back the rows of a file written by [`write_rows`], columns in file order.
/// Dates and timestamps come back in the same text form the cleaned records use.
pub fn read_rows(path: &Path) -> Result<Vec<RawRecord>> {
    let file = File::open(path)?;
    let reader = SerializedFileReader::new(file)?;
    let mut rows = Vec::new();
    for row in reader.get_row_iter(None)? {
        let row = row?;
        let mut record = RawRecord::new();
        for (name, field) in row.get_column_iter() {
            record.insert(name.clone(), field_to_json(path, name, field)?);
        }
        rows.push(record);
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parquet::basic::Type as ParquetType;
    use serde_json::json;

    fn rows(values: &[serde_json::Value]) -> Vec<RawRecord> {
        values.iter().filter_map(|v| v.as_object().cloned()).collect()
    }

    fn sales_fields() -> Vec<FieldSpec> {
        vec![
            FieldSpec::required("OrderNumber", FieldType::String),
            FieldSpec::required("Multiply", FieldType::Int),
            FieldSpec::optional("OrderDate", FieldType::Date),
            FieldSpec::optional("ShippedAt", FieldType::Timestamp),
            FieldSpec::optional("Discount", FieldType::Float),
            FieldSpec::optional("Gift", FieldType::Bool),
        ]
    }

    #[test]
    fn test_typed_columns_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("part-1.parquet");
        let written = rows(&[
            json!({"OrderNumber": "T100", "Multiply": 6, "OrderDate": "2024-03-15",
                   "ShippedAt": "2024-03-16T08:30:00", "Discount": 0.5, "Gift": true}),
            json!({"OrderNumber": "T101", "Multiply": 4, "OrderDate": null,
                   "ShippedAt": null, "Discount": null, "Gift": null}),
        ]);

        write_rows(&path, "Sales", &sales_fields(), &written).unwrap();
        let back = read_rows(&path).unwrap();

        assert_eq!(back, written);
        let keys: Vec<&String> = back[0].keys().collect();
        assert_eq!(
            keys,
            vec!["OrderNumber", "Multiply", "OrderDate", "ShippedAt", "Discount", "Gift"]
        );
    }

    #[test]
    fn test_file_schema_carries_declared_types() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("part-1.parquet");
        let written = rows(&[json!({"OrderNumber": "T100", "Multiply": 6, "OrderDate": "2024-03-15"})]);
        write_rows(&path, "Sales", &sales_fields(), &written).unwrap();

        let reader = SerializedFileReader::new(File::open(&path).unwrap()).unwrap();
        let schema = reader.metadata().file_metadata().schema_descr_ptr();
        let physical: Vec<ParquetType> = (0..schema.num_columns())
            .map(|i| schema.column(i).physical_type())
            .collect();
        assert_eq!(
            physical,
            vec![
                ParquetType::BYTE_ARRAY,
                ParquetType::INT64,
                ParquetType::INT32,
                ParquetType::INT64,
                ParquetType::DOUBLE,
                ParquetType::BOOLEAN
            ]
        );
        assert_eq!(schema.column(2).logical_type(), Some(LogicalType::Date));
        assert_eq!(schema.column(3).converted_type(), ConvertedType::TIMESTAMP_MICROS);
        assert!(!schema.column(0).self_type().is_optional());
        assert!(schema.column(2).self_type().is_optional());
    }

    #[test]
    fn test_rows_that_do_not_fit_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("part-1.parquet");
        let fields = sales_fields();

        let missing_required = rows(&[json!({"OrderNumber": "T1", "Multiply": null})]);
        assert!(write_rows(&path, "Sales", &fields, &missing_required).is_err());

        let wrong_type = rows(&[json!({"OrderNumber": "T1", "Multiply": "six"})]);
        assert!(write_rows(&path, "Sales", &fields, &wrong_type).is_err());

        let unknown_column = rows(&[json!({"OrderNumber": "T1", "Multiply": 1, "Note": "x"})]);
        assert!(write_rows(&path, "Sales", &fields, &unknown_column).is_err());
    }
}
