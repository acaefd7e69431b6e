//! Generic row access over a materialized table.
//!
//! There are no nominal types per data source; a handle is constructed
//! from a descriptor and reads/writes rows as maps of column name to
//! typed value. Handles bind to the descriptor they were built from, so
//! callers re-materialize after every successful convergence.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use itertools::Itertools;
use rusqlite::Connection;
use rusqlite::types::Value as SqlValue;

use crate::data::Value;
use crate::descriptor::{ColumnDescriptor, SchemaDescriptor};

/// One row of a materialized table. Null columns are absent from the
/// field map.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    pub id: i64,
    pub fields: BTreeMap<String, Value>,
}

pub struct EntityHandle<'c> {
    conn: &'c Connection,
    table: String,
    columns: Vec<ColumnDescriptor>,
}

impl<'c> EntityHandle<'c> {
    pub fn materialize(conn: &'c Connection, descriptor: &SchemaDescriptor) -> Self {
        Self {
            conn,
            table: descriptor.name.clone(),
            columns: descriptor.columns.clone(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn columns(&self) -> &[ColumnDescriptor] {
        &self.columns
    }

    fn select_list(&self) -> String {
        std::iter::once("\"id\"".to_string())
            .chain(self.columns.iter().map(|c| format!("\"{}\"", c.name)))
            .join(", ")
    }

    fn row_to_entity(&self, row: &rusqlite::Row<'_>) -> rusqlite::Result<Entity> {
        let id: i64 = row.get(0)?;
        let mut fields = BTreeMap::new();
        for (idx, column) in self.columns.iter().enumerate() {
            let stored = row.get_ref(idx + 1)?;
            if let Some(value) = column.type_tag.decode_stored(stored) {
                fields.insert(column.name.clone(), value);
            }
        }
        Ok(Entity { id, fields })
    }

    /// Restrict an incoming field map to descriptor columns, in
    /// descriptor order. Unknown keys are ignored silently.
    fn known_fields<'a>(
        &'a self,
        fields: &'a BTreeMap<String, Value>,
    ) -> Vec<(&'a str, &'a Value)> {
        self.columns
            .iter()
            .filter_map(|c| fields.get(&c.name).map(|v| (c.name.as_str(), v)))
            .collect()
    }

    pub fn get(&self, id: i64) -> Result<Option<Entity>> {
        use rusqlite::OptionalExtension;
        let sql = format!(
            "SELECT {} FROM \"{}\" WHERE \"id\" = ?1",
            self.select_list(),
            self.table
        );
        self.conn
            .query_row(&sql, [id], |row| self.row_to_entity(row))
            .optional()
            .with_context(|| format!("Loading row {id} from '{}'", self.table))
    }

    pub fn all(&self) -> Result<Vec<Entity>> {
        let sql = format!(
            "SELECT {} FROM \"{}\" ORDER BY \"id\"",
            self.select_list(),
            self.table
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| self.row_to_entity(row))?;
        let mut entities = Vec::new();
        for entity in rows {
            entities.push(entity?);
        }
        Ok(entities)
    }

    pub fn count(&self) -> Result<i64> {
        let sql = format!("SELECT COUNT(*) FROM \"{}\"", self.table);
        self.conn
            .query_row(&sql, [], |row| row.get(0))
            .with_context(|| format!("Counting rows in '{}'", self.table))
    }

    pub fn create(&self, fields: &BTreeMap<String, Value>) -> Result<i64> {
        self.insert_row(None, fields)
    }

    /// Insert with an explicit row identity (import upserts assign ids).
    pub fn create_with_id(&self, id: i64, fields: &BTreeMap<String, Value>) -> Result<i64> {
        self.insert_row(Some(id), fields)
    }

    fn insert_row(&self, id: Option<i64>, fields: &BTreeMap<String, Value>) -> Result<i64> {
        let known = self.known_fields(fields);
        let mut names: Vec<String> = Vec::new();
        let mut params: Vec<SqlValue> = Vec::new();
        if let Some(id) = id {
            names.push("\"id\"".to_string());
            params.push(SqlValue::Integer(id));
        }
        for (name, value) in &known {
            names.push(format!("\"{name}\""));
            params.push(value.to_sqlite());
        }
        let placeholders = (1..=params.len()).map(|i| format!("?{i}")).join(", ");
        let sql = if names.is_empty() {
            format!("INSERT INTO \"{}\" DEFAULT VALUES", self.table)
        } else {
            format!(
                "INSERT INTO \"{}\" ({}) VALUES ({})",
                self.table,
                names.join(", "),
                placeholders
            )
        };
        self.conn
            .execute(&sql, rusqlite::params_from_iter(params))
            .with_context(|| format!("Inserting into '{}'", self.table))?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Update only the descriptor columns present in `fields`, leaving
    /// the id and any non-descriptor columns untouched. Returns whether
    /// a row was matched.
    pub fn update(&self, id: i64, fields: &BTreeMap<String, Value>) -> Result<bool> {
        let known = self.known_fields(fields);
        if known.is_empty() {
            return Ok(self.get(id)?.is_some());
        }
        let mut assignments = Vec::new();
        let mut params: Vec<SqlValue> = Vec::new();
        for (idx, (name, value)) in known.iter().enumerate() {
            assignments.push(format!("\"{name}\" = ?{}", idx + 1));
            params.push(value.to_sqlite());
        }
        params.push(SqlValue::Integer(id));
        let sql = format!(
            "UPDATE \"{}\" SET {} WHERE \"id\" = ?{}",
            self.table,
            assignments.join(", "),
            params.len()
        );
        let updated = self
            .conn
            .execute(&sql, rusqlite::params_from_iter(params))
            .with_context(|| format!("Updating row {id} in '{}'", self.table))?;
        Ok(updated > 0)
    }

    /// Set one column to NULL-able raw absence or a value; used by the
    /// field updater where a cleared cell means NULL.
    pub fn set_field(&self, id: i64, column: &str, value: Option<Value>) -> Result<bool> {
        let sql = format!(
            "UPDATE \"{}\" SET \"{column}\" = ?1 WHERE \"id\" = ?2",
            self.table
        );
        let bound = match value {
            Some(v) => v.to_sqlite(),
            None => SqlValue::Null,
        };
        let updated = self
            .conn
            .execute(&sql, rusqlite::params![bound, id])
            .with_context(|| format!("Setting '{column}' on row {id} in '{}'", self.table))?;
        Ok(updated > 0)
    }

    pub fn delete(&self, id: i64) -> Result<bool> {
        let sql = format!("DELETE FROM \"{}\" WHERE \"id\" = ?1", self.table);
        let deleted = self
            .conn
            .execute(&sql, [id])
            .with_context(|| format!("Deleting row {id} from '{}'", self.table))?;
        Ok(deleted > 0)
    }

    /// Find the first row whose `column` equals the given integer, used
    /// for resolving reverse foreign-key hops.
    pub fn find_by_integer(&self, column: &str, value: i64) -> Result<Option<Entity>> {
        use rusqlite::OptionalExtension;
        let sql = format!(
            "SELECT {} FROM \"{}\" WHERE \"{column}\" = ?1 ORDER BY \"id\" LIMIT 1",
            self.select_list(),
            self.table
        );
        self.conn
            .query_row(&sql, [value], |row| self.row_to_entity(row))
            .optional()
            .with_context(|| format!("Searching '{}' by {column}", self.table))
    }
}
