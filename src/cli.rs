use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(author, version, about = "Turn CSV and spreadsheet exports into live, queryable tables", long_about = None)]
pub struct Cli {
    /// Path to the backing database file
    #[arg(long, global = true, default_value = "sources.db")]
    pub db: PathBuf,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Create a data source: fetch it, infer a schema, build its table and import the rows
    Create(CreateArgs),
    /// Apply an edited column list (and optionally a new name) to an existing source
    Apply(ApplyArgs),
    /// Re-import one source by name, or every live source when no name is given
    Refresh(RefreshArgs),
    /// List data sources with their kind, liveness and row counts
    List,
    /// Print one source's full descriptor as JSON
    Show(ShowArgs),
    /// Update a single field on a row (supports `table__column` hops)
    Set(SetArgs),
    /// Delete a source, its companions and all their rows
    Drop(DropArgs),
    /// Store an API credential used by private-sheet and ticketing sources
    Credential(CredentialArgs),
}

#[derive(Debug, Args)]
pub struct CreateArgs {
    /// Human name for the source; slugified into the table identifier
    pub name: String,
    /// Public CSV URL or Google Sheets share link
    #[arg(long, group = "origin")]
    pub url: Option<String>,
    /// Private Google Sheets share link (needs a stored sheet token)
    #[arg(long = "sheet-url", group = "origin")]
    pub sheet_url: Option<String>,
    /// Ticketing project id (needs a stored ticketing key)
    #[arg(long, group = "origin")]
    pub project: Option<i64>,
    /// Ticketing form id; the project's first form when omitted
    #[arg(long, requires = "project")]
    pub form: Option<i64>,
    /// Local CSV/TSV file to import
    #[arg(long, group = "origin")]
    pub file: Option<PathBuf>,
    /// Character encoding of the uploaded file (defaults to utf-8)
    #[arg(long = "input-encoding", requires = "file")]
    pub input_encoding: Option<String>,
    /// Infer and build the schema but skip the initial import
    #[arg(long = "no-import")]
    pub no_import: bool,
}

#[derive(Debug, Args)]
pub struct ApplyArgs {
    /// Source to edit
    pub name: String,
    /// JSON file holding the edited column descriptor list
    #[arg(long)]
    pub columns: Option<PathBuf>,
    /// New name for the source (renames its table)
    #[arg(long)]
    pub rename: Option<String>,
}

#[derive(Debug, Args)]
pub struct RefreshArgs {
    /// Source to refresh; all live primary sources when omitted
    pub name: Option<String>,
}

#[derive(Debug, Args)]
pub struct ShowArgs {
    /// Source to display
    pub name: String,
}

#[derive(Debug, Args)]
pub struct SetArgs {
    /// Source the row lives in
    #[arg(long)]
    pub model: String,
    /// Row identity
    #[arg(long)]
    pub object: i64,
    /// Column name, optionally a `table__column` hop
    #[arg(long)]
    pub field: String,
    /// New raw value; omit to clear the field
    #[arg(long)]
    pub value: Option<String>,
}

#[derive(Debug, Args)]
pub struct DropArgs {
    /// Source to delete
    pub name: String,
}

#[derive(Debug, Args)]
pub struct CredentialArgs {
    /// Credential name (`sheet_api_token` or `ticketing_api_key`)
    pub name: String,
    /// Secret value
    pub secret: String,
}
