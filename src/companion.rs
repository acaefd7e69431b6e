//! Companion schemas: every primary source gets an annotation table and
//! a contact-log table, joined back to it by a nullable foreign key so
//! user-entered review state survives re-imports of the source rows.

use std::sync::Arc;

use anyhow::{Context, Result};
use log::info;
use rusqlite::Connection;
use serde_json::json;

use crate::catalog::TypeTag;
use crate::descriptor::{
    ColumnDescriptor, DescriptorKind, SchemaDescriptor, annotation_name, contact_log_name,
};
use crate::editor::{SchemaEditor, TableLocks};
use crate::store::DescriptorStore;

pub const DEFAULT_STATUSES: &[&str] = &[
    "Available",
    "In Progress",
    "Verified",
    "Troll",
    "Duplicate",
    "Not Applicable",
    "Inconclusive",
    "False",
];

pub const DEFAULT_CONTACT_METHODS: &[&str] = &["Email", "Phone call", "In person"];

fn choice_column(name: &str, choices: &[&str]) -> ColumnDescriptor {
    let mut column = ColumnDescriptor::new(name, TypeTag::Choice);
    column.attrs.insert("choices".to_string(), json!(choices));
    column.attrs.insert("default".to_string(), json!(choices[0]));
    column
}

fn nullable(mut column: ColumnDescriptor) -> ColumnDescriptor {
    column.attrs.insert("blank".to_string(), json!(true));
    column.attrs.insert("null".to_string(), json!(true));
    column
}

fn link_column(primary: &str) -> ColumnDescriptor {
    let mut column = ColumnDescriptor::new("metadata", TypeTag::ForeignKey);
    column.args = vec![json!(primary), json!("SET_NULL")];
    nullable(column)
}

/// Review-state columns for a primary source: triage status, assigned
/// partner, free-form notes and the backlink.
pub fn annotation_columns(primary: &str) -> Vec<ColumnDescriptor> {
    let mut partner = ColumnDescriptor::new("partner", TypeTag::ShortText);
    partner.attrs.insert("max_length".to_string(), json!(120));
    vec![
        choice_column("status", DEFAULT_STATUSES),
        nullable(partner),
        nullable(ColumnDescriptor::new("notes", TypeTag::Text)),
        link_column(primary),
    ]
}

/// Outreach-log columns: who reached out, how, when, and the backlink.
pub fn contact_log_columns(primary: &str) -> Vec<ColumnDescriptor> {
    let mut reporter = ColumnDescriptor::new("reporter", TypeTag::ShortText);
    reporter.attrs.insert("max_length".to_string(), json!(120));
    vec![
        reporter,
        choice_column("method", DEFAULT_CONTACT_METHODS),
        nullable(ColumnDescriptor::new("contact_date", TypeTag::DateTime)),
        link_column(primary),
    ]
}

fn companion_descriptor(
    name: String,
    columns: Vec<ColumnDescriptor>,
    kind: DescriptorKind,
) -> SchemaDescriptor {
    let mut descriptor = SchemaDescriptor::new(name, columns);
    descriptor.kind = Some(kind);
    descriptor
}

/// Create (or pick up where a previous run stopped) the annotation and
/// contact-log schemas for `primary`, materialize their tables, and tag
/// the primary descriptor. Safe to call again; existing companions are
/// left alone.
pub fn ensure_companions(
    conn: &Connection,
    locks: &Arc<TableLocks>,
    primary: &mut SchemaDescriptor,
) -> Result<Vec<SchemaDescriptor>> {
    let store = DescriptorStore::new(conn);
    let editor = SchemaEditor::new(conn, locks.clone());

    if primary.kind.is_none() {
        primary.kind = Some(DescriptorKind::Primary);
        store
            .update(primary)
            .with_context(|| format!("Tagging '{}' as a primary source", primary.name))?;
    }

    let wanted = [
        companion_descriptor(
            annotation_name(&primary.name),
            annotation_columns(&primary.name),
            DescriptorKind::Annotation,
        ),
        companion_descriptor(
            contact_log_name(&primary.name),
            contact_log_columns(&primary.name),
            DescriptorKind::ContactLog,
        ),
    ];

    let mut companions = Vec::new();
    for mut descriptor in wanted {
        match store.get_by_name(&descriptor.name)? {
            Some(existing) => companions.push(existing),
            None => {
                store.insert(&mut descriptor)?;
                editor.converge(None, &descriptor)?;
                info!(
                    "created companion '{}' for '{}'",
                    descriptor.name, primary.name
                );
                companions.push(descriptor);
            }
        }
    }
    Ok(companions)
}

/// Follow a primary rename: both companions move to the names derived
/// from the new primary name and their backlink targets are rewritten,
/// so hop updates and cascade deletes keep resolving. Must run after
/// the primary's own table has been renamed.
pub fn rename_companions(
    conn: &Connection,
    locks: &Arc<TableLocks>,
    old_primary: &str,
    new_primary: &str,
) -> Result<()> {
    if old_primary == new_primary {
        return Ok(());
    }
    let store = DescriptorStore::new(conn);
    let editor = SchemaEditor::new(conn, locks.clone());

    let moves = [
        (annotation_name(old_primary), annotation_name(new_primary)),
        (contact_log_name(old_primary), contact_log_name(new_primary)),
    ];
    for (old_name, new_name) in moves {
        let Some(mut descriptor) = store.get_by_name(&old_name)? else {
            continue;
        };
        descriptor.name = new_name;
        for column in &mut descriptor.columns {
            if column.type_tag == TypeTag::ForeignKey
                && column.fk_target() == Some(old_primary)
            {
                if let Some(target) = column.args.first_mut() {
                    *target = json!(new_primary);
                }
            }
        }
        editor.converge_with(Some(&old_name), &descriptor, |_| store.update(&descriptor))?;
        info!("renamed companion '{old_name}' to '{}'", descriptor.name);
    }
    Ok(())
}

/// Remove a primary source and both companions: tables dropped in
/// FK-safe order (contact log, annotation, then the primary), descriptor
/// rows last.
pub fn cascade_delete(
    conn: &Connection,
    locks: &Arc<TableLocks>,
    primary: &SchemaDescriptor,
) -> Result<()> {
    let store = DescriptorStore::new(conn);
    let editor = SchemaEditor::new(conn, locks.clone());

    let ordered = [
        contact_log_name(&primary.name),
        annotation_name(&primary.name),
        primary.name.clone(),
    ];
    for table in &ordered {
        editor.drop_table(table)?;
        if let Some(descriptor) = store.get_by_name(table)? {
            store.delete(descriptor.id)?;
        }
    }
    info!("removed source '{}' and its companions", primary.name);
    Ok(())
}
