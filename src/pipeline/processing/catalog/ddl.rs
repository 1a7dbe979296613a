// External query engine statements for catalog entries.

use serde::{Deserialize, Serialize};

use super::CatalogEntry;
use crate::config::CatalogSettings;
use crate::domain::{FieldSpec, FieldType};

/// What an external engine needs to find an entry's files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalTriple {
    pub name: String,
    pub location: String,
    pub format: String,
}

impl ExternalTriple {
    pub fn from_entry(entry: &CatalogEntry) -> Self {
        Self {
            name: entry.name.clone(),
            location: entry.metadata.location.clone(),
            format: entry.metadata.format.clone(),
        }
    }
}

fn quote_ident(name: &str) -> String {
    format!("[{}]", name.replace(']', "]]"))
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn sql_type(field_type: FieldType) -> &'static str {
    match field_type {
        FieldType::String => "NVARCHAR(4000)",
        FieldType::Int => "BIGINT",
        FieldType::Float => "FLOAT",
        FieldType::Bool => "BIT",
        FieldType::Date => "DATE",
        FieldType::Timestamp => "DATETIME2",
    }
}

fn codec_class(compression: &str) -> &'static str {
    match compression {
        "snappy" => "org.apache.hadoop.io.compress.SnappyCodec",
        "gzip" => "org.apache.hadoop.io.compress.GzipCodec",
        _ => "org.apache.hadoop.io.compress.ZStandardCodec",
    }
}

fn column_definitions(fields: &[FieldSpec], with_nullability: bool) -> String {
    fields
        .iter()
        .map(|f| {
            let mut column = format!("{} {}", quote_ident(&f.name), sql_type(f.field_type));
            if with_nullability {
                column.push_str(if f.nullable { " NULL" } else { " NOT NULL" });
            }
            column
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// The four statements that expose `entry`, in execution order:
/// data source, file format, external table, and an `OPENROWSET` view.
/// Both the table and the view declare one typed column per stored parquet
/// column in `fields`.
pub fn render_ddl(entry: &CatalogEntry, settings: &CatalogSettings, fields: &[FieldSpec]) -> Vec<String> {
    let meta = &entry.metadata;
    let format_name = format!("{}_{}", meta.format, meta.compression);
    let table = format!("{}.{}", quote_ident(&settings.schema), quote_ident(&entry.name));
    let view = format!(
        "{}.{}",
        quote_ident(&settings.schema),
        quote_ident(&format!("vw_{}", entry.name))
    );

    let data_source = format!(
        "CREATE EXTERNAL DATA SOURCE {} WITH (LOCATION = {}, CREDENTIAL = {});",
        quote_ident(&settings.data_source),
        quote_literal(&settings.base_uri),
        quote_ident(&settings.credential)
    );

    let file_format = format!(
        "CREATE EXTERNAL FILE FORMAT {} WITH (FORMAT_TYPE = {}, DATA_COMPRESSION = {});",
        quote_ident(&format_name),
        meta.format.to_ascii_uppercase(),
        quote_literal(codec_class(&meta.compression))
    );

    let external_table = format!(
        "CREATE EXTERNAL TABLE {} ({}) WITH (LOCATION = {}, DATA_SOURCE = {}, FILE_FORMAT = {});",
        table,
        column_definitions(fields, true),
        quote_literal(&meta.location),
        quote_ident(&settings.data_source),
        quote_ident(&format_name)
    );

    let view_stmt = format!(
        "CREATE VIEW {} AS SELECT * FROM OPENROWSET(BULK {}, DATA_SOURCE = {}, FORMAT = {}) WITH ({}) AS [result];",
        view,
        quote_literal(&format!("{}**", meta.location)),
        quote_literal(&settings.data_source),
        quote_literal(&meta.format.to_ascii_uppercase()),
        column_definitions(fields, false)
    );

    vec![data_source, file_format, external_table, view_stmt]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Tier;
    use crate::pipeline::processing::catalog::EntryMetadata;
    use chrono::Utc;

    fn entry() -> CatalogEntry {
        CatalogEntry {
            name: "CommitSummary".into(),
            version: 1,
            metadata: EntryMetadata {
                tier: Tier::Curated,
                dataset: "Commits".into(),
                location: "curated/CommitSummary/".into(),
                format: "parquet".into(),
                compression: "zstd".into(),
            },
            published_at: Utc::now(),
        }
    }

    #[test]
    fn test_renders_four_statements_in_order() {
        let fields = vec![
            FieldSpec::optional("author", FieldType::String),
            FieldSpec::optional("commit_count", FieldType::Int),
        ];
        let stmts = render_ddl(&entry(), &CatalogSettings::default(), &fields);
        assert_eq!(stmts.len(), 4);
        assert!(stmts[0].starts_with("CREATE EXTERNAL DATA SOURCE [lake_source]"));
        assert!(stmts[1].contains("FORMAT_TYPE = PARQUET"));
        assert!(stmts[2].starts_with("CREATE EXTERNAL TABLE [curated].[CommitSummary]"));
        assert!(stmts[2].contains("LOCATION = 'curated/CommitSummary/'"));
        assert!(stmts[3].contains("OPENROWSET(BULK 'curated/CommitSummary/**'"));
    }

    #[test]
    fn test_columns_match_the_stored_parquet_types() {
        let fields = vec![
            FieldSpec::required("author", FieldType::String),
            FieldSpec::optional("commit_count", FieldType::Int),
            FieldSpec::optional("first_seen", FieldType::Date),
            FieldSpec::optional("window_complete", FieldType::Bool),
        ];
        let stmts = render_ddl(&entry(), &CatalogSettings::default(), &fields);
        assert!(stmts[2].contains(
            "([author] NVARCHAR(4000) NOT NULL, [commit_count] BIGINT NULL, \
             [first_seen] DATE NULL, [window_complete] BIT NULL)"
        ));
        assert!(!stmts[2].contains("record_json"));
        assert!(stmts[3].contains(
            "WITH ([author] NVARCHAR(4000), [commit_count] BIGINT, [first_seen] DATE, [window_complete] BIT) AS [result]"
        ));
    }

    #[test]
    fn test_identifiers_and_literals_are_escaped() {
        let mut e = entry();
        e.name = "odd]name".into();
        e.metadata.location = "curated/it's/".into();
        let fields = vec![FieldSpec::optional("odd]col", FieldType::Int)];
        let stmts = render_ddl(&e, &CatalogSettings::default(), &fields);
        assert!(stmts[2].contains("[odd]]name]"));
        assert!(stmts[2].contains("([odd]]col] BIGINT NULL)"));
        assert!(stmts[2].contains("'curated/it''s/'"));
        assert!(stmts[3].contains("SELECT * FROM OPENROWSET"));
    }

    #[test]
    fn test_triple_from_entry() {
        let triple = ExternalTriple::from_entry(&entry());
        assert_eq!(triple.name, "CommitSummary");
        assert_eq!(triple.location, "curated/CommitSummary/");
        assert_eq!(triple.format, "parquet");
    }
}
