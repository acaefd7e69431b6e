//! The schema editor: converges real tables to descriptor shapes.
//!
//! The editor owns the materialized-table bookkeeping. The previously
//! applied shape of every table is persisted in `materialized_shapes`
//! and written in the same transaction as the DDL it describes, so a
//! failed convergence can never leave the cached shape and the real
//! table out of sync.
//!
//! Columns removed from a descriptor are left orphaned on the physical
//! table rather than dropped. The persisted shape tracks the full
//! physical column set (descriptor columns plus orphans) so that later
//! rebuilds carry orphans forward instead of losing them.
//!
//! Concurrent requests can race to converge the same table, so every
//! convergence and drop serializes on a process-wide per-table-name
//! lock. Import reconciliation takes the same lock only as a barrier
//! before its row work begins.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use itertools::Itertools;
use log::{debug, info};
use rusqlite::Connection;

use crate::descriptor::{ColumnDescriptor, SchemaDescriptor};
use crate::error::{DdlError, DdlOperation};

/// Per-table-name advisory locks. Entries are created on demand and
/// shared process-wide through an `Arc`.
#[derive(Default)]
pub struct TableLocks {
    inner: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl TableLocks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn entry(&self, table: &str) -> Arc<Mutex<()>> {
        let mut map = lock_unpoisoned(&self.inner);
        map.entry(table.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One applied convergence step, reported for logging and idempotence
/// checks (an unchanged descriptor yields an empty change list).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DdlChange {
    CreatedTable,
    RenamedTable { from: String, to: String },
    AddedColumn(String),
    AlteredColumn(String),
}

pub struct SchemaEditor<'c> {
    conn: &'c Connection,
    locks: Arc<TableLocks>,
}

impl<'c> SchemaEditor<'c> {
    pub fn new(conn: &'c Connection, locks: Arc<TableLocks>) -> Self {
        Self { conn, locks }
    }

    pub fn locks(&self) -> Arc<TableLocks> {
        self.locks.clone()
    }

    /// The physical shape last applied to `table`, if it has been
    /// materialized.
    pub fn materialized_shape(&self, table: &str) -> Result<Option<Vec<ColumnDescriptor>>> {
        load_shape(self.conn, table)
    }

    /// Make the real table named by the descriptor match the
    /// descriptor's columns, creating, renaming, adding and altering as
    /// needed. `old_name` carries the previous table identifier when
    /// the descriptor was renamed. Idempotent: converging an unchanged
    /// descriptor applies nothing.
    pub fn converge(
        &self,
        old_name: Option<&str>,
        descriptor: &SchemaDescriptor,
    ) -> Result<Vec<DdlChange>> {
        self.converge_with(old_name, descriptor, |_| Ok(()))
    }

    /// `converge`, plus a `persist` step run inside the convergence
    /// transaction after the DDL. Descriptor bookkeeping passed here
    /// commits atomically with the table change: a failure in either
    /// rolls back both.
    pub fn converge_with<F>(
        &self,
        old_name: Option<&str>,
        descriptor: &SchemaDescriptor,
        persist: F,
    ) -> Result<Vec<DdlChange>>
    where
        F: FnOnce(&Connection) -> Result<()>,
    {
        let table = descriptor.name.as_str();
        let previous_table = old_name.unwrap_or(table);

        let mut names = vec![table];
        if previous_table != table {
            names.push(previous_table);
        }
        names.sort_unstable();
        let entries: Vec<_> = names.iter().map(|n| self.locks.entry(n)).collect();
        let _guards: Vec<_> = entries.iter().map(|e| lock_unpoisoned(e)).collect();

        // FK enforcement must be off while a rebuild drops and recreates
        // the table, or the implicit delete would fire SET NULL on every
        // companion backlink. The pragma is a no-op inside a transaction,
        // so it brackets the whole convergence.
        self.conn
            .pragma_update(None, "foreign_keys", false)
            .context("Suspending foreign key enforcement")?;
        let result = self.converge_locked(previous_table, descriptor, persist);
        self.conn
            .pragma_update(None, "foreign_keys", true)
            .context("Restoring foreign key enforcement")?;
        result
    }

    fn converge_locked<F>(
        &self,
        previous_table: &str,
        descriptor: &SchemaDescriptor,
        persist: F,
    ) -> Result<Vec<DdlChange>>
    where
        F: FnOnce(&Connection) -> Result<()>,
    {
        let table = descriptor.name.as_str();
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Opening convergence transaction")?;

        let previous = load_shape(&tx, previous_table)?;
        let changes = match previous {
            None => {
                let decls = column_decls(&descriptor.columns);
                let sql = format!("CREATE TABLE \"{table}\" (\"id\" INTEGER PRIMARY KEY{decls})");
                debug!("{sql}");
                ddl(&tx, &sql, table, None, DdlOperation::CreateTable)?;
                save_shape(&tx, table, &descriptor.columns)?;
                vec![DdlChange::CreatedTable]
            }
            Some(prev_cols) => {
                let mut changes = Vec::new();
                if previous_table != table {
                    let sql =
                        format!("ALTER TABLE \"{previous_table}\" RENAME TO \"{table}\"");
                    ddl(&tx, &sql, table, None, DdlOperation::RenameTable)?;
                    changes.push(DdlChange::RenamedTable {
                        from: previous_table.to_string(),
                        to: table.to_string(),
                    });
                }

                // target physical shape: descriptor columns, then any
                // previously materialized columns the edit dropped
                let mut physical: Vec<ColumnDescriptor> = descriptor.columns.clone();
                for prev in &prev_cols {
                    if descriptor.column(&prev.name).is_none() {
                        physical.push(prev.clone());
                    }
                }

                let added: Vec<&ColumnDescriptor> = descriptor
                    .columns
                    .iter()
                    .filter(|c| !prev_cols.iter().any(|p| p.name == c.name))
                    .collect();
                let altered: Vec<&ColumnDescriptor> = descriptor
                    .columns
                    .iter()
                    .filter(|c| {
                        prev_cols.iter().any(|p| {
                            p.name == c.name
                                && (p.type_tag != c.type_tag
                                    || p.storage_decl() != c.storage_decl())
                        })
                    })
                    .collect();

                if added.is_empty() && altered.is_empty() {
                    if previous_table != table {
                        delete_shape(&tx, previous_table)?;
                        save_shape(&tx, table, &physical)?;
                    }
                } else {
                    if altered.is_empty() {
                        for column in &added {
                            let sql = format!(
                                "ALTER TABLE \"{table}\" ADD COLUMN \"{}\" {}",
                                column.name,
                                column.storage_decl()
                            );
                            debug!("{sql}");
                            ddl(
                                &tx,
                                &sql,
                                table,
                                Some(&column.name),
                                DdlOperation::AddColumn,
                            )?;
                            changes.push(DdlChange::AddedColumn(column.name.clone()));
                        }
                    } else {
                        // SQLite cannot alter a column declaration in place;
                        // rebuild the table to the target shape and copy the
                        // shared columns across.
                        rebuild_table(&tx, table, &physical, &prev_cols, &altered[0].name)?;
                        for column in &added {
                            changes.push(DdlChange::AddedColumn(column.name.clone()));
                        }
                        for column in &altered {
                            changes.push(DdlChange::AlteredColumn(column.name.clone()));
                        }
                    }

                    if previous_table != table {
                        delete_shape(&tx, previous_table)?;
                    }
                    save_shape(&tx, table, &physical)?;
                }
                changes
            }
        };

        persist(&tx)?;
        tx.commit().context("Committing convergence")?;
        for change in &changes {
            info!("table '{}': {:?}", table, change);
        }
        Ok(changes)
    }

    /// Drop the backing table and purge its cached shape. The
    /// descriptor row itself is store bookkeeping and removed by the
    /// caller.
    pub fn drop_table(&self, table: &str) -> Result<()> {
        let entry = self.locks.entry(table);
        let _guard = lock_unpoisoned(&entry);

        let tx = self
            .conn
            .unchecked_transaction()
            .context("Opening drop transaction")?;
        let sql = format!("DROP TABLE IF EXISTS \"{table}\"");
        ddl(&tx, &sql, table, None, DdlOperation::DropTable)?;
        delete_shape(&tx, table)?;
        tx.commit().context("Committing drop")?;
        info!("table '{table}': dropped");
        Ok(())
    }
}

fn column_decls(columns: &[ColumnDescriptor]) -> String {
    columns
        .iter()
        .map(|c| format!(", \"{}\" {}", c.name, c.storage_decl()))
        .collect()
}

fn ddl(
    conn: &Connection,
    sql: &str,
    table: &str,
    column: Option<&str>,
    operation: DdlOperation,
) -> Result<(), DdlError> {
    conn.execute(sql, []).map(|_| ()).map_err(|source| DdlError {
        table: table.to_string(),
        column: column.map(str::to_string),
        operation,
        source,
    })
}

fn rebuild_table(
    conn: &Connection,
    table: &str,
    target: &[ColumnDescriptor],
    previous: &[ColumnDescriptor],
    failing_column: &str,
) -> Result<(), DdlError> {
    let scratch = format!("__rebuild_{table}");
    let decls = column_decls(target);
    let create = format!("CREATE TABLE \"{scratch}\" (\"id\" INTEGER PRIMARY KEY{decls})");
    ddl(conn, &create, table, Some(failing_column), DdlOperation::AlterColumn)?;

    let shared: Vec<&str> = target
        .iter()
        .filter(|c| previous.iter().any(|p| p.name == c.name))
        .map(|c| c.name.as_str())
        .collect();
    let column_list = std::iter::once("id")
        .chain(shared.iter().copied())
        .map(|name| format!("\"{name}\""))
        .join(", ");
    let copy = format!(
        "INSERT INTO \"{scratch}\" ({column_list}) SELECT {column_list} FROM \"{table}\""
    );
    ddl(conn, &copy, table, Some(failing_column), DdlOperation::AlterColumn)?;

    let drop = format!("DROP TABLE \"{table}\"");
    ddl(conn, &drop, table, Some(failing_column), DdlOperation::AlterColumn)?;
    let rename = format!("ALTER TABLE \"{scratch}\" RENAME TO \"{table}\"");
    ddl(conn, &rename, table, Some(failing_column), DdlOperation::AlterColumn)?;
    Ok(())
}

fn load_shape(conn: &Connection, table: &str) -> Result<Option<Vec<ColumnDescriptor>>> {
    use rusqlite::OptionalExtension;
    let raw: Option<String> = conn
        .query_row(
            "SELECT columns FROM materialized_shapes WHERE table_name = ?1",
            [table],
            |row| row.get(0),
        )
        .optional()
        .context("Loading materialized shape")?;
    raw.map(|json| {
        serde_json::from_str(&json).with_context(|| format!("Parsing cached shape for '{table}'"))
    })
    .transpose()
}

fn save_shape(conn: &Connection, table: &str, columns: &[ColumnDescriptor]) -> Result<()> {
    let json = serde_json::to_string(columns)?;
    conn.execute(
        "INSERT INTO materialized_shapes (table_name, columns) VALUES (?1, ?2) \
         ON CONFLICT(table_name) DO UPDATE SET columns = excluded.columns",
        rusqlite::params![table, json],
    )
    .context("Saving materialized shape")?;
    Ok(())
}

fn delete_shape(conn: &Connection, table: &str) -> Result<()> {
    conn.execute(
        "DELETE FROM materialized_shapes WHERE table_name = ?1",
        [table],
    )
    .context("Deleting materialized shape")?;
    Ok(())
}
