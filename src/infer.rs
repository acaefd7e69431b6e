//! Schema inference: raw delimited text in, best-guess column
//! descriptors out.
//!
//! The pipeline mirrors the csvsql-then-inspectdb shape: sanitize the
//! header row, sample values to build one CREATE TABLE statement,
//! execute it against a scratch in-memory database, reflect the
//! physical table back out, and fold the reflected declarations into
//! column descriptors with safe, stable, deduplicated identifiers.

use std::collections::HashMap;

use anyhow::{Context, Result};
use csv::StringRecord;
use log::debug;
use rusqlite::Connection;

use crate::catalog::TypeTag;
use crate::data::{
    normalize_identifier, parse_calendar_date, parse_loose_datetime, parse_loose_time,
};
use crate::descriptor::{ColumnDescriptor, MAX_IDENTIFIER_LENGTH};
use crate::error::SchemaError;
use crate::io_utils::open_csv_reader;

const SAMPLE_ROWS: usize = 2000;
const MIN_REAL_COLUMNS: usize = 2;
const SCRATCH_TABLE: &str = "inference_scratch";

/// Strip characters that break the translation from CSV header to
/// column declaration (commas, quotes, newlines). Fails closed: a
/// header that sanitizes to nothing is kept as an empty string and
/// handled downstream.
pub fn sanitize_header(header: &str) -> String {
    header
        .chars()
        .filter(|c| !matches!(c, ',' | '"' | '\'' | '\n' | '\r'))
        .collect::<String>()
        .trim()
        .to_string()
}

fn sanitize_headers(headers: &StringRecord) -> Vec<String> {
    headers.iter().map(sanitize_header).collect()
}

/// Duplicate headers cannot survive DDL generation, so they are caught
/// here, before any scratch table work, naming the offending header.
fn check_duplicate_headers(headers: &[String]) -> Result<(), SchemaError> {
    let mut seen: HashMap<&str, ()> = HashMap::new();
    for header in headers {
        if seen.insert(header.as_str(), ()).is_some() {
            return Err(SchemaError::DuplicateColumn(header.clone()));
        }
    }
    Ok(())
}

#[derive(Debug, Clone)]
struct TypeCandidate {
    saw_value: bool,
    possible_integer: bool,
    possible_number: bool,
    possible_date: bool,
    possible_time: bool,
    possible_datetime: bool,
}

impl TypeCandidate {
    fn new() -> Self {
        Self {
            saw_value: false,
            possible_integer: true,
            possible_number: true,
            possible_date: true,
            possible_time: true,
            possible_datetime: true,
        }
    }

    fn observe(&mut self, value: &str) {
        if value.is_empty() {
            return;
        }
        self.saw_value = true;
        if self.possible_integer && value.parse::<i64>().is_err() {
            self.possible_integer = false;
        }
        if self.possible_number && value.parse::<f64>().is_err() {
            self.possible_number = false;
        }
        if self.possible_date && parse_calendar_date(value).is_err() {
            self.possible_date = false;
        }
        if self.possible_time && parse_loose_time(value).is_err() {
            self.possible_time = false;
        }
        if self.possible_datetime && parse_loose_datetime(value).is_err() {
            self.possible_datetime = false;
        }
    }

    fn decide(&self) -> &'static str {
        if !self.saw_value {
            "TEXT"
        } else if self.possible_integer {
            "INTEGER"
        } else if self.possible_number {
            "REAL"
        } else if self.possible_date {
            "DATE"
        } else if self.possible_time {
            "TIME"
        } else if self.possible_datetime {
            "DATETIME"
        } else {
            "TEXT"
        }
    }
}

/// The fixed reflected-storage-to-tag lookup. VARCHAR folds into the
/// generic text type (the text-over-short-text preference carried from
/// the source pipeline) and anything unrecognized defaults to text
/// rather than failing.
fn storage_to_tag(decl: &str) -> TypeTag {
    let upper = decl.trim().to_ascii_uppercase();
    let token = upper.split(['(', ' ']).next().unwrap_or_default();
    match token {
        "INTEGER" | "INT" | "BIGINT" | "SMALLINT" => TypeTag::Integer,
        "REAL" | "FLOAT" | "DOUBLE" | "NUMERIC" | "DECIMAL" => TypeTag::Number,
        "DATE" => TypeTag::Date,
        "TIME" => TypeTag::Time,
        "DATETIME" | "TIMESTAMP" => TypeTag::DateTime,
        _ => TypeTag::Text,
    }
}

#[derive(Debug)]
struct ReflectedColumn {
    header: String,
    decl_type: String,
}

/// Execute the CREATE TABLE against a scratch database and reverse-
/// engineer the physical table into per-field declarations.
fn reflect_scratch_table(create_sql: &str) -> Result<Vec<ReflectedColumn>> {
    let scratch = Connection::open_in_memory().context("Opening scratch database")?;
    scratch
        .execute(create_sql, [])
        .with_context(|| format!("Executing inferred DDL: {create_sql}"))?;

    let mut stmt = scratch.prepare(&format!("PRAGMA table_info(\"{SCRATCH_TABLE}\")"))?;
    let rows = stmt.query_map([], |row| {
        Ok(ReflectedColumn {
            header: row.get::<_, String>(1)?,
            decl_type: row.get::<_, String>(2)?,
        })
    })?;
    let mut columns = Vec::new();
    for row in rows {
        columns.push(row?);
    }
    Ok(columns)
}

/// Assign a safe identifier for a header: normalized, bounded length,
/// no trailing separators, deduplicated with `_2`, `_3`, … suffixes.
/// Deterministic for a given header sequence, so re-running inference
/// on the same header set yields the same names.
fn assign_identifier(header: &str, dedupe: &mut HashMap<String, usize>) -> String {
    let mut name = normalize_identifier(header);
    name.truncate(MAX_IDENTIFIER_LENGTH);
    while name.ends_with('_') {
        name.pop();
    }
    if name.is_empty() {
        name = "column".to_string();
    }
    let count = dedupe.entry(name.clone()).or_insert(0);
    *count += 1;
    if *count > 1 {
        format!("{name}_{count}")
    } else {
        name
    }
}

/// Infer a column descriptor list from raw delimited text with a header
/// row. Fails with [`SchemaError::DuplicateColumn`] when two headers
/// collide after sanitation, and with a validation error when fewer
/// than two real columns are present.
pub fn infer_columns(csv_text: &str) -> Result<Vec<ColumnDescriptor>> {
    infer_columns_delimited(csv_text, b',')
}

pub fn infer_columns_delimited(csv_text: &str, delimiter: u8) -> Result<Vec<ColumnDescriptor>> {
    let mut reader = open_csv_reader(csv_text.as_bytes(), delimiter, true);
    let headers = sanitize_headers(reader.headers().context("Reading CSV header row")?);
    check_duplicate_headers(&headers)?;

    if headers.iter().filter(|h| !h.is_empty()).count() < MIN_REAL_COLUMNS {
        return Err(SchemaError::Validation(format!(
            "the source must have at least {MIN_REAL_COLUMNS} columns to build a table"
        ))
        .into());
    }

    let mut candidates = vec![TypeCandidate::new(); headers.len()];
    let mut record = StringRecord::new();
    let mut sampled = 0usize;
    while reader.read_record(&mut record)? {
        if sampled >= SAMPLE_ROWS {
            break;
        }
        for (idx, field) in record.iter().enumerate() {
            if let Some(candidate) = candidates.get_mut(idx) {
                candidate.observe(field.trim());
            }
        }
        sampled += 1;
    }

    let decls = headers
        .iter()
        .zip(&candidates)
        .filter(|(header, _)| !header.is_empty())
        .map(|(header, candidate)| format!("\"{}\" {}", header, candidate.decide()))
        .collect::<Vec<_>>()
        .join(", ");
    let create_sql = format!("CREATE TABLE \"{SCRATCH_TABLE}\" ({decls})");
    debug!("Inferred DDL: {create_sql}");

    let reflected = reflect_scratch_table(&create_sql)?;

    let mut dedupe = HashMap::new();
    let columns = reflected
        .into_iter()
        .map(|field| {
            let mut column = ColumnDescriptor::new(
                assign_identifier(&field.header, &mut dedupe),
                storage_to_tag(&field.decl_type),
            );
            column.original_name = Some(field.header);
            column
                .attrs
                .insert("blank".to_string(), serde_json::Value::Bool(true));
            column
                .attrs
                .insert("null".to_string(), serde_json::Value::Bool(true));
            column.searchable = Some(true);
            column.filterable = Some(false);
            column
        })
        .collect();
    Ok(columns)
}
