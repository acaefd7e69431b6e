//! Typed error taxonomy shared across the crate.
//!
//! Ingestion failures (`SourceError`) and descriptor-level problems
//! (`SchemaError`) are user-actionable and rendered at the CLI boundary.
//! `DdlError` is fatal for the convergence call that raised it. Per-row
//! import failures are collected as `RowError` values, never raised.

use std::fmt;

use thiserror::Error;

/// Failure at the source ingestion boundary (network, auth, bad payload).
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("request to '{url}' failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("'{url}' returned HTML instead of CSV; use a direct CSV export link")]
    NotCsv { url: String },
    #[error("'{url}' is not a recognized sheet share URL")]
    BadShareUrl { url: String },
    #[error("no '{name}' credential is stored; add one with the credential command")]
    MissingCredentials { name: String },
    #[error("ticketing API returned an unexpected payload: {detail}")]
    BadApiPayload { detail: String },
    #[error("failed reading upload {path:?}: {source}")]
    Upload {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("data source '{0}' has no configured origin")]
    Unconfigured(String),
}

/// Descriptor-level validation failure. User-fixable; never reaches the
/// DDL engine.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("duplicate column header '{0}'")]
    DuplicateColumn(String),
    #[error("unknown column type '{0}'")]
    UnknownType(String),
    #[error("{0}")]
    Validation(String),
    #[error("a data source named '{0}' already exists")]
    SourceExists(String),
    #[error("no data source named '{0}'")]
    NoSuchSource(String),
}

/// One convergence step against the real table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DdlOperation {
    CreateTable,
    RenameTable,
    AddColumn,
    AlterColumn,
    DropTable,
}

impl fmt::Display for DdlOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let token = match self {
            DdlOperation::CreateTable => "create table",
            DdlOperation::RenameTable => "rename table",
            DdlOperation::AddColumn => "add column",
            DdlOperation::AlterColumn => "alter column",
            DdlOperation::DropTable => "drop table",
        };
        write!(f, "{token}")
    }
}

fn column_clause(column: &Option<String>) -> String {
    match column {
        Some(name) => format!(" (column '{name}')"),
        None => String::new(),
    }
}

/// A DDL statement failed mid-convergence. The transaction it ran in is
/// rolled back, so the cached shape and the real table stay in sync.
#[derive(Debug, Error)]
#[error("{operation} on table '{table}'{} failed: {source}", column_clause(.column))]
pub struct DdlError {
    pub table: String,
    pub column: Option<String>,
    pub operation: DdlOperation,
    #[source]
    pub source: rusqlite::Error,
}

/// One failed row from an import pass, keyed by row identity. Collected,
/// never aborts the batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowError {
    pub row_id: String,
    pub column: Option<String>,
    pub reason: String,
}

impl RowError {
    pub fn new(row_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            row_id: row_id.into(),
            column: None,
            reason: reason.into(),
        }
    }

    pub fn for_column(
        row_id: impl Into<String>,
        column: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            row_id: row_id.into(),
            column: Some(column.into()),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for RowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.column {
            Some(column) => write!(
                f,
                "row {}: column '{}': {}",
                self.row_id, column, self.reason
            ),
            None => write!(f, "row {}: {}", self.row_id, self.reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ddl_error_names_table_and_column() {
        let err = DdlError {
            table: "responses".to_string(),
            column: Some("submitted_at".to_string()),
            operation: DdlOperation::AlterColumn,
            source: rusqlite::Error::InvalidQuery,
        };
        let rendered = err.to_string();
        assert!(rendered.contains("alter column"));
        assert!(rendered.contains("'responses'"));
        assert!(rendered.contains("'submitted_at'"));
    }

    #[test]
    fn row_error_renders_identity_first() {
        let err = RowError::for_column("17", "status", "not an allowed choice");
        assert_eq!(err.to_string(), "row 17: column 'status': not an allowed choice");
    }
}
