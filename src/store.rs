//! Persistence for schema descriptors and source credentials.
//!
//! Descriptors live in `data_sources` with their column list, source
//! configuration and lifecycle attributes serialized as JSON. The
//! `credentials` keyspace carries source secrets (private-sheet token,
//! ticketing API key). Deleting a row here is bare bookkeeping; the
//! cascade ordering that keeps foreign keys happy lives in the
//! companion module.

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::json;

use crate::descriptor::{ColumnDescriptor, DescriptorKind, SchemaDescriptor, SourceConfig};

pub const CRED_SHEET_TOKEN: &str = "sheet_api_token";
pub const CRED_TICKETING_KEY: &str = "ticketing_api_key";

/// Create the bookkeeping tables and enable FK enforcement. Run once
/// per connection before anything else touches the database.
pub fn init(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         CREATE TABLE IF NOT EXISTS data_sources (
             id      INTEGER PRIMARY KEY,
             name    TEXT NOT NULL UNIQUE,
             columns TEXT NOT NULL,
             source  TEXT NOT NULL,
             attrs   TEXT NOT NULL
         );
         CREATE TABLE IF NOT EXISTS credentials (
             name   TEXT PRIMARY KEY,
             secret TEXT NOT NULL
         );
         CREATE TABLE IF NOT EXISTS materialized_shapes (
             table_name TEXT PRIMARY KEY,
             columns    TEXT NOT NULL
         );",
    )
    .context("Initializing bookkeeping tables")?;
    Ok(())
}

pub struct DescriptorStore<'c> {
    conn: &'c Connection,
}

impl<'c> DescriptorStore<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    pub fn conn(&self) -> &'c Connection {
        self.conn
    }

    fn attrs_json(descriptor: &SchemaDescriptor) -> String {
        let mut attrs = serde_json::Map::new();
        if let Some(kind) = descriptor.kind {
            attrs.insert("type".to_string(), json!(kind.as_wire()));
        }
        if descriptor.dead {
            attrs.insert("dead".to_string(), json!(true));
        }
        serde_json::Value::Object(attrs).to_string()
    }

    fn row_to_descriptor(row: &rusqlite::Row<'_>) -> rusqlite::Result<(i64, String, String, String, String)> {
        Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
        ))
    }

    fn hydrate(raw: (i64, String, String, String, String)) -> Result<SchemaDescriptor> {
        let (id, name, columns_json, source_json, attrs_json) = raw;
        let columns: Vec<ColumnDescriptor> = serde_json::from_str(&columns_json)
            .with_context(|| format!("Parsing column descriptors for '{name}'"))?;
        let source: SourceConfig = serde_json::from_str(&source_json)
            .with_context(|| format!("Parsing source config for '{name}'"))?;
        let attrs: serde_json::Value = serde_json::from_str(&attrs_json)
            .with_context(|| format!("Parsing attrs for '{name}'"))?;
        let kind = attrs
            .get("type")
            .and_then(serde_json::Value::as_i64)
            .and_then(DescriptorKind::from_wire);
        let dead = attrs
            .get("dead")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);
        Ok(SchemaDescriptor {
            id,
            name,
            columns,
            source,
            kind,
            dead,
        })
    }

    pub fn insert(&self, descriptor: &mut SchemaDescriptor) -> Result<i64> {
        let columns = serde_json::to_string(&descriptor.columns)?;
        let source = serde_json::to_string(&descriptor.source)?;
        self.conn
            .execute(
                "INSERT INTO data_sources (name, columns, source, attrs) VALUES (?1, ?2, ?3, ?4)",
                params![descriptor.name, columns, source, Self::attrs_json(descriptor)],
            )
            .with_context(|| format!("Inserting data source '{}'", descriptor.name))?;
        descriptor.id = self.conn.last_insert_rowid();
        Ok(descriptor.id)
    }

    pub fn update(&self, descriptor: &SchemaDescriptor) -> Result<()> {
        let columns = serde_json::to_string(&descriptor.columns)?;
        let source = serde_json::to_string(&descriptor.source)?;
        self.conn
            .execute(
                "UPDATE data_sources SET name = ?1, columns = ?2, source = ?3, attrs = ?4 \
                 WHERE id = ?5",
                params![
                    descriptor.name,
                    columns,
                    source,
                    Self::attrs_json(descriptor),
                    descriptor.id
                ],
            )
            .with_context(|| format!("Updating data source '{}'", descriptor.name))?;
        Ok(())
    }

    pub fn get(&self, id: i64) -> Result<Option<SchemaDescriptor>> {
        let raw = self
            .conn
            .query_row(
                "SELECT id, name, columns, source, attrs FROM data_sources WHERE id = ?1",
                params![id],
                Self::row_to_descriptor,
            )
            .optional()
            .context("Loading data source by id")?;
        raw.map(Self::hydrate).transpose()
    }

    pub fn get_by_name(&self, name: &str) -> Result<Option<SchemaDescriptor>> {
        let raw = self
            .conn
            .query_row(
                "SELECT id, name, columns, source, attrs FROM data_sources WHERE name = ?1",
                params![name],
                Self::row_to_descriptor,
            )
            .optional()
            .context("Loading data source by name")?;
        raw.map(Self::hydrate).transpose()
    }

    pub fn exists(&self, name: &str) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM data_sources WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn list(&self) -> Result<Vec<SchemaDescriptor>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, columns, source, attrs FROM data_sources ORDER BY id")?;
        let rows = stmt.query_map([], Self::row_to_descriptor)?;
        let mut descriptors = Vec::new();
        for raw in rows {
            descriptors.push(Self::hydrate(raw?)?);
        }
        Ok(descriptors)
    }

    pub fn delete(&self, id: i64) -> Result<()> {
        self.conn
            .execute("DELETE FROM data_sources WHERE id = ?1", params![id])
            .context("Deleting data source")?;
        Ok(())
    }

    pub fn credential(&self, name: &str) -> Result<Option<String>> {
        let secret = self
            .conn
            .query_row(
                "SELECT secret FROM credentials WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()
            .context("Loading credential")?;
        Ok(secret)
    }

    pub fn set_credential(&self, name: &str, secret: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO credentials (name, secret) VALUES (?1, ?2) \
                 ON CONFLICT(name) DO UPDATE SET secret = excluded.secret",
                params![name, secret],
            )
            .context("Storing credential")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::TypeTag;
    use crate::descriptor::ColumnDescriptor;

    fn memory_store() -> Connection {
        let conn = Connection::open_in_memory().expect("in-memory db");
        init(&conn).expect("init tables");
        conn
    }

    fn sample_descriptor() -> SchemaDescriptor {
        let mut column = ColumnDescriptor::new("email", TypeTag::Text);
        column.original_name = Some("Email Address".to_string());
        let mut descriptor = SchemaDescriptor::new("responses", vec![column]);
        descriptor.source = SourceConfig::RemoteCsv {
            url: "https://example.org/export.csv".to_string(),
        };
        descriptor.kind = Some(DescriptorKind::Primary);
        descriptor
    }

    #[test]
    fn descriptors_round_trip_through_the_store() {
        let conn = memory_store();
        let store = DescriptorStore::new(&conn);
        let mut descriptor = sample_descriptor();
        let id = store.insert(&mut descriptor).unwrap();
        assert!(id > 0);

        let loaded = store.get_by_name("responses").unwrap().unwrap();
        assert_eq!(loaded, descriptor);
        assert_eq!(loaded.kind, Some(DescriptorKind::Primary));
        assert!(!loaded.dead);

        let mut edited = loaded;
        edited.dead = true;
        store.update(&edited).unwrap();
        assert!(store.get(id).unwrap().unwrap().dead);

        store.delete(id).unwrap();
        assert!(store.get_by_name("responses").unwrap().is_none());
    }

    #[test]
    fn duplicate_names_are_rejected_by_the_unique_index() {
        let conn = memory_store();
        let store = DescriptorStore::new(&conn);
        store.insert(&mut sample_descriptor()).unwrap();
        assert!(store.insert(&mut sample_descriptor()).is_err());
        assert!(store.exists("responses").unwrap());
    }

    #[test]
    fn credentials_upsert() {
        let conn = memory_store();
        let store = DescriptorStore::new(&conn);
        assert_eq!(store.credential(CRED_SHEET_TOKEN).unwrap(), None);
        store.set_credential(CRED_SHEET_TOKEN, "abc").unwrap();
        store.set_credential(CRED_SHEET_TOKEN, "xyz").unwrap();
        assert_eq!(store.credential(CRED_SHEET_TOKEN).unwrap().as_deref(), Some("xyz"));
    }
}
