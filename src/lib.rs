pub mod catalog;
pub mod cli;
pub mod companion;
pub mod data;
pub mod descriptor;
pub mod editor;
pub mod entity;
pub mod error;
pub mod infer;
pub mod io_utils;
pub mod reconcile;
pub mod source;
pub mod store;
pub mod update;

use std::sync::{Arc, OnceLock};
use std::{env, path::Path};

use anyhow::{Context, Result, anyhow, bail};
use clap::Parser;
use log::{LevelFilter, info, warn};
use rusqlite::Connection;

use crate::cli::{Cli, Commands};
use crate::descriptor::{DescriptorKind, SchemaDescriptor, SourceConfig};
use crate::editor::{SchemaEditor, TableLocks};
use crate::entity::EntityHandle;
use crate::error::{RowError, SchemaError};
use crate::source::Fetcher;
use crate::store::{CRED_SHEET_TOKEN, CRED_TICKETING_KEY, DescriptorStore};

static LOGGER: OnceLock<()> = OnceLock::new();

fn init_logging() {
    LOGGER.get_or_init(|| {
        let mut builder = env_logger::Builder::from_env(env_logger::Env::default());
        if env::var("RUST_LOG").is_err() {
            builder.filter_module("csv_sourced", LevelFilter::Info);
        }
        let _ = builder.format_timestamp_millis().try_init();
    });
}

pub fn run() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let conn = open_database(&cli.db)?;
    let locks = TableLocks::new();
    match cli.command {
        Commands::Create(args) => handle_create(&conn, &locks, &args),
        Commands::Apply(args) => handle_apply(&conn, &locks, &args),
        Commands::Refresh(args) => handle_refresh(&conn, &locks, &args),
        Commands::List => handle_list(&conn),
        Commands::Show(args) => handle_show(&conn, &args),
        Commands::Set(args) => handle_set(&conn, &args),
        Commands::Drop(args) => handle_drop(&conn, &locks, &args),
        Commands::Credential(args) => handle_credential(&conn, &args),
    }
}

fn open_database(path: &Path) -> Result<Connection> {
    let conn =
        Connection::open(path).with_context(|| format!("Opening database {path:?}"))?;
    store::init(&conn)?;
    Ok(conn)
}

fn handle_create(conn: &Connection, locks: &Arc<TableLocks>, args: &cli::CreateArgs) -> Result<()> {
    let name = descriptor::slugify_name(&args.name);
    if name.is_empty() {
        bail!(SchemaError::Validation(format!(
            "'{}' does not reduce to a usable table name",
            args.name
        )));
    }
    let store = DescriptorStore::new(conn);
    if store.exists(&name)? {
        bail!(SchemaError::SourceExists(name));
    }

    let source = match (&args.url, &args.sheet_url, args.project, &args.file) {
        (Some(url), None, None, None) => SourceConfig::RemoteCsv { url: url.clone() },
        (None, Some(url), None, None) => SourceConfig::PrivateSheet { url: url.clone() },
        (None, None, Some(project_id), None) => SourceConfig::Ticketing {
            project_id,
            form_id: args.form,
        },
        (None, None, None, Some(path)) => SourceConfig::Upload { path: path.clone() },
        _ => bail!(SchemaError::Validation(
            "exactly one of --url, --sheet-url, --project or --file is required".to_string()
        )),
    };

    let fetcher = Fetcher::new();
    let csv_text = match (&source, &args.input_encoding) {
        (SourceConfig::Upload { path }, Some(label)) => {
            let encoding = io_utils::resolve_encoding(Some(label))?;
            let text = io_utils::read_file_to_string(path, encoding)?;
            source::clean_delimited_headers(&text, io_utils::resolve_input_delimiter(path, None))?
        }
        _ => fetcher.fetch(&store, &SchemaDescriptor {
            id: 0,
            name: name.clone(),
            columns: Vec::new(),
            source: source.clone(),
            kind: None,
            dead: false,
        })?,
    };

    let columns = infer::infer_columns(&csv_text)?;
    descriptor::validate_columns(&columns, Some(DescriptorKind::Primary))?;

    let mut descriptor = SchemaDescriptor::new(name.clone(), columns);
    descriptor.source = source;
    descriptor.kind = Some(DescriptorKind::Primary);
    store.insert(&mut descriptor)?;

    let editor = SchemaEditor::new(conn, locks.clone());
    editor.converge(None, &descriptor)?;
    companion::ensure_companions(conn, locks, &mut descriptor)?;
    info!(
        "created source '{}' with {} column(s)",
        descriptor.name,
        descriptor.columns.len()
    );

    if args.no_import {
        return Ok(());
    }
    let errors = reconcile::import_records(conn, locks, &descriptor, &csv_text)?;
    report_row_errors(&descriptor.name, &errors)?;
    let count = EntityHandle::materialize(conn, &descriptor).count()?;
    info!("imported {count} row(s) into '{}'", descriptor.name);
    Ok(())
}

fn handle_apply(conn: &Connection, locks: &Arc<TableLocks>, args: &cli::ApplyArgs) -> Result<()> {
    let store = DescriptorStore::new(conn);
    let Some(mut descriptor) = store.get_by_name(&args.name)? else {
        bail!(SchemaError::NoSuchSource(args.name.clone()));
    };
    if args.columns.is_none() && args.rename.is_none() {
        bail!(SchemaError::Validation(
            "nothing to apply; pass --columns and/or --rename".to_string()
        ));
    }

    if let Some(path) = &args.columns {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Reading column list from {path:?}"))?;
        let columns: Vec<descriptor::ColumnDescriptor> =
            serde_json::from_str(&json).with_context(|| format!("Parsing {path:?}"))?;
        descriptor::validate_columns(&columns, descriptor.kind)?;
        descriptor.columns = columns;
    }

    let old_name = descriptor.name.clone();
    if let Some(rename) = &args.rename {
        let renamed = descriptor::slugify_name(rename);
        if renamed.is_empty() {
            bail!(SchemaError::Validation(format!(
                "'{rename}' does not reduce to a usable table name"
            )));
        }
        if renamed != old_name && store.exists(&renamed)? {
            bail!(SchemaError::SourceExists(renamed));
        }
        descriptor.name = renamed;
    }

    let editor = SchemaEditor::new(conn, locks.clone());
    let changes =
        editor.converge_with(Some(&old_name), &descriptor, |_| store.update(&descriptor))?;
    if descriptor.name != old_name {
        companion::rename_companions(conn, locks, &old_name, &descriptor.name)?;
    }
    if changes.is_empty() {
        info!("'{}' is already up to date", descriptor.name);
    } else {
        info!("applied {} change(s) to '{}'", changes.len(), descriptor.name);
    }
    Ok(())
}

fn refresh_one(
    conn: &Connection,
    locks: &Arc<TableLocks>,
    store: &DescriptorStore,
    descriptor: &mut SchemaDescriptor,
) -> Result<Vec<RowError>> {
    let outcome = Fetcher::new()
        .fetch(store, descriptor)
        .and_then(|csv_text| reconcile::import_records(conn, locks, descriptor, &csv_text));
    let failed = match &outcome {
        Ok(errors) => !errors.is_empty(),
        Err(_) => true,
    };
    if failed {
        if !descriptor.dead {
            // stop hammering a broken source until someone fixes it by hand
            descriptor.dead = true;
            store.update(descriptor)?;
        }
        return outcome;
    }
    if descriptor.dead {
        descriptor.dead = false;
        store.update(descriptor)?;
    }
    let count = EntityHandle::materialize(conn, descriptor).count()?;
    info!("refreshed '{}': {count} row(s)", descriptor.name);
    outcome
}

fn handle_refresh(conn: &Connection, locks: &Arc<TableLocks>, args: &cli::RefreshArgs) -> Result<()> {
    let store = DescriptorStore::new(conn);
    match &args.name {
        Some(name) => {
            let Some(mut descriptor) = store.get_by_name(name)? else {
                bail!(SchemaError::NoSuchSource(name.clone()));
            };
            if matches!(
                descriptor.kind,
                Some(DescriptorKind::Annotation) | Some(DescriptorKind::ContactLog)
            ) {
                bail!(SchemaError::Validation(format!(
                    "'{name}' is a companion table and has no source to refresh"
                )));
            }
            let errors = refresh_one(conn, locks, &store, &mut descriptor)?;
            report_row_errors(name, &errors)
        }
        None => {
            let mut failures = 0usize;
            for mut descriptor in store.list()? {
                let primary = matches!(descriptor.kind, Some(DescriptorKind::Primary) | None);
                if !primary || descriptor.source == SourceConfig::None {
                    continue;
                }
                if descriptor.dead {
                    warn!("skipping dead source '{}'", descriptor.name);
                    continue;
                }
                let name = descriptor.name.clone();
                match refresh_one(conn, locks, &store, &mut descriptor) {
                    Ok(errors) if errors.is_empty() => {}
                    Ok(errors) => {
                        failures += 1;
                        for error in &errors {
                            warn!("'{name}': {error}");
                        }
                    }
                    Err(err) => {
                        failures += 1;
                        warn!("'{name}': {err:#}");
                    }
                }
            }
            if failures > 0 {
                bail!("{failures} source(s) failed to refresh");
            }
            Ok(())
        }
    }
}

fn report_row_errors(name: &str, errors: &[RowError]) -> Result<()> {
    if errors.is_empty() {
        return Ok(());
    }
    for error in errors {
        eprintln!("{name}: {error}");
    }
    bail!("{} row(s) failed to import into '{name}'", errors.len());
}

fn kind_label(descriptor: &SchemaDescriptor) -> &'static str {
    match descriptor.kind {
        Some(DescriptorKind::Primary) => "primary",
        Some(DescriptorKind::Annotation) => "annotation",
        Some(DescriptorKind::ContactLog) => "contact-log",
        None => "untyped",
    }
}

fn handle_list(conn: &Connection) -> Result<()> {
    let store = DescriptorStore::new(conn);
    for descriptor in store.list()? {
        let count = EntityHandle::materialize(conn, &descriptor)
            .count()
            .unwrap_or(0);
        let liveness = if descriptor.dead { " (dead)" } else { "" };
        println!(
            "{}\t{}\t{} row(s){}",
            descriptor.name,
            kind_label(&descriptor),
            count,
            liveness
        );
    }
    Ok(())
}

fn handle_show(conn: &Connection, args: &cli::ShowArgs) -> Result<()> {
    let store = DescriptorStore::new(conn);
    let Some(descriptor) = store.get_by_name(&args.name)? else {
        bail!(SchemaError::NoSuchSource(args.name.clone()));
    };
    let rendered = serde_json::json!({
        "name": descriptor.name,
        "type": descriptor.kind.map(|k| k.as_wire()),
        "dead": descriptor.dead,
        "source": descriptor.source,
        "columns": descriptor.columns,
    });
    println!("{}", serde_json::to_string_pretty(&rendered)?);
    Ok(())
}

fn handle_set(conn: &Connection, args: &cli::SetArgs) -> Result<()> {
    let request = update::UpdateRequest {
        model: args.model.clone(),
        object: args.object,
        field: args.field.clone(),
        value: args.value.clone(),
    };
    let outcome = update::apply_update(conn, &request)?;
    println!("{}", serde_json::to_string(&outcome)?);
    match outcome {
        update::UpdateOutcome::Ok { .. } => Ok(()),
        update::UpdateOutcome::Failure { message } => Err(anyhow!(message)),
    }
}

fn handle_drop(conn: &Connection, locks: &Arc<TableLocks>, args: &cli::DropArgs) -> Result<()> {
    let store = DescriptorStore::new(conn);
    let Some(descriptor) = store.get_by_name(&args.name)? else {
        bail!(SchemaError::NoSuchSource(args.name.clone()));
    };
    if matches!(
        descriptor.kind,
        Some(DescriptorKind::Annotation) | Some(DescriptorKind::ContactLog)
    ) {
        bail!(SchemaError::Validation(format!(
            "'{}' is a companion table; drop its primary source instead",
            args.name
        )));
    }
    companion::cascade_delete(conn, locks, &descriptor)?;
    Ok(())
}

fn handle_credential(conn: &Connection, args: &cli::CredentialArgs) -> Result<()> {
    if args.name != CRED_SHEET_TOKEN && args.name != CRED_TICKETING_KEY {
        bail!(SchemaError::Validation(format!(
            "unknown credential '{}'; expected '{CRED_SHEET_TOKEN}' or '{CRED_TICKETING_KEY}'",
            args.name
        )));
    }
    DescriptorStore::new(conn).set_credential(&args.name, &args.secret)?;
    info!("stored credential '{}'", args.name);
    Ok(())
}
