//! Single-field row updates, the write path behind inline editing.
//!
//! A request names a source, a row, a field path and the new raw value.
//! Field paths may hop one relation with `__`: `metadata__status` on a
//! primary row resolves to the companion row whose backlink points at
//! it, then updates `status` there. Only single-valued backlinks exist
//! in this system, so one hop is all the traversal there is.

use anyhow::Result;
use log::debug;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::data::Value;
use crate::descriptor::{SchemaDescriptor, annotation_name, contact_log_name};
use crate::entity::EntityHandle;
use crate::store::DescriptorStore;

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateRequest {
    /// Source (table) name the row lives in.
    pub model: String,
    /// Row identity.
    pub object: i64,
    /// Column name, optionally prefixed with a `table__` hop.
    pub field: String,
    /// Raw new value; empty or absent clears the field.
    #[serde(default)]
    pub value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status")]
pub enum UpdateOutcome {
    #[serde(rename = "OK")]
    Ok { message: String },
    #[serde(rename = "FAILURE")]
    Failure { message: String },
}

impl UpdateOutcome {
    fn saved() -> Self {
        UpdateOutcome::Ok {
            message: "Saved!".to_string(),
        }
    }

    fn failure(message: impl Into<String>) -> Self {
        UpdateOutcome::Failure {
            message: message.into(),
        }
    }
}

/// Resolve a `table__` hop: the named companion must carry a backlink
/// column targeting `primary`, and the hop lands on the first companion
/// row pointing at `row_id`.
fn resolve_hop(
    conn: &Connection,
    store: &DescriptorStore,
    primary: &SchemaDescriptor,
    hop_table: &str,
    row_id: i64,
) -> Result<std::result::Result<(SchemaDescriptor, i64), String>> {
    let known = hop_table == annotation_name(&primary.name)
        || hop_table == contact_log_name(&primary.name);
    let Some(related) = store.get_by_name(hop_table)? else {
        return Ok(Err(format!("No related table '{hop_table}'.")));
    };
    let backlink = related.columns.iter().find(|c| {
        c.type_tag == crate::catalog::TypeTag::ForeignKey
            && c.fk_target() == Some(primary.name.as_str())
    });
    let Some(backlink) = backlink else {
        return Ok(Err(format!(
            "'{hop_table}' does not link back to '{}'.",
            primary.name
        )));
    };
    if !known {
        debug!("hop through non-companion relation '{hop_table}'");
    }
    let handle = EntityHandle::materialize(conn, &related);
    match handle.find_by_integer(&backlink.name, row_id)? {
        Some(entity) => Ok(Ok((related, entity.id))),
        None => Ok(Err(format!(
            "Row {row_id} has no '{hop_table}' record."
        ))),
    }
}

/// Apply one field update. Request-level problems (unknown source, bad
/// field, invalid value) come back as a `FAILURE` outcome; only
/// infrastructure errors are raised.
pub fn apply_update(conn: &Connection, request: &UpdateRequest) -> Result<UpdateOutcome> {
    let store = DescriptorStore::new(conn);
    let Some(primary) = store.get_by_name(&request.model)? else {
        return Ok(UpdateOutcome::failure(format!(
            "No data source named '{}'.",
            request.model
        )));
    };

    let (target, target_id, field_name) = match request.field.split_once("__") {
        None => (primary.clone(), request.object, request.field.as_str()),
        Some((hop_table, rest)) => {
            if rest.contains("__") {
                return Ok(UpdateOutcome::failure(
                    "Only one relation hop is supported.",
                ));
            }
            match resolve_hop(conn, &store, &primary, hop_table, request.object)? {
                Ok((related, related_id)) => (related, related_id, rest),
                Err(message) => return Ok(UpdateOutcome::failure(message)),
            }
        }
    };

    let Some(column) = target.column(field_name) else {
        return Ok(UpdateOutcome::failure(format!(
            "'{}' has no column '{field_name}'.",
            target.name
        )));
    };

    let raw = request.value.as_deref().unwrap_or_default();
    let typed: Option<Value> = match column.type_tag.validate(raw, column) {
        Ok(value) => value,
        Err(reason) => return Ok(UpdateOutcome::failure(reason)),
    };

    let handle = EntityHandle::materialize(conn, &target);
    if handle.get(target_id)?.is_none() {
        return Ok(UpdateOutcome::failure(format!(
            "Row {target_id} not found."
        )));
    }
    debug!(
        "updating {}.{} on row {} of '{}'",
        target.name, field_name, target_id, request.model
    );
    if handle.set_field(target_id, field_name, typed)? {
        Ok(UpdateOutcome::saved())
    } else {
        Ok(UpdateOutcome::failure(format!(
            "Row {target_id} not found."
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::TypeTag;
    use crate::companion::{ensure_companions, rename_companions};
    use crate::descriptor::ColumnDescriptor;
    use crate::editor::{SchemaEditor, TableLocks};
    use crate::store;
    use std::collections::BTreeMap;

    fn setup() -> (Connection, SchemaDescriptor, i64) {
        let conn = Connection::open_in_memory().expect("in-memory db");
        store::init(&conn).expect("init");
        let locks = TableLocks::new();
        let mut primary = SchemaDescriptor::new(
            "responses",
            vec![ColumnDescriptor::new("email", TypeTag::Text)],
        );
        DescriptorStore::new(&conn).insert(&mut primary).unwrap();
        SchemaEditor::new(&conn, locks.clone())
            .converge(None, &primary)
            .unwrap();
        ensure_companions(&conn, &locks, &mut primary).unwrap();

        let rows = EntityHandle::materialize(&conn, &primary);
        let mut fields = BTreeMap::new();
        fields.insert("email".to_string(), Value::Text("a@b.c".to_string()));
        let row_id = rows.create(&fields).unwrap();
        (conn, primary, row_id)
    }

    fn request(model: &str, object: i64, field: &str, value: &str) -> UpdateRequest {
        UpdateRequest {
            model: model.to_string(),
            object,
            field: field.to_string(),
            value: Some(value.to_string()),
        }
    }

    #[test]
    fn direct_field_update_saves() {
        let (conn, primary, row_id) = setup();
        let outcome =
            apply_update(&conn, &request("responses", row_id, "email", "new@b.c")).unwrap();
        assert_eq!(
            outcome,
            UpdateOutcome::Ok {
                message: "Saved!".to_string()
            }
        );
        let rows = EntityHandle::materialize(&conn, &primary);
        let entity = rows.get(row_id).unwrap().unwrap();
        assert_eq!(entity.fields["email"], Value::Text("new@b.c".to_string()));
    }

    #[test]
    fn hop_update_lands_on_the_linked_companion_row() {
        let (conn, primary, row_id) = setup();

        let store = DescriptorStore::new(&conn);
        let annotation = store.get_by_name("responsesmetadata").unwrap().unwrap();
        let notes = EntityHandle::materialize(&conn, &annotation);
        let mut fields = BTreeMap::new();
        fields.insert("metadata".to_string(), Value::Integer(row_id));
        let note_id = notes.create(&fields).unwrap();

        let outcome = apply_update(
            &conn,
            &request("responses", row_id, "responsesmetadata__status", "Verified"),
        )
        .unwrap();
        assert!(matches!(outcome, UpdateOutcome::Ok { .. }));

        let note = notes.get(note_id).unwrap().unwrap();
        assert_eq!(note.fields["status"], Value::Text("Verified".to_string()));
        // the primary row is untouched
        let rows = EntityHandle::materialize(&conn, &primary);
        let entity = rows.get(row_id).unwrap().unwrap();
        assert_eq!(entity.fields["email"], Value::Text("a@b.c".to_string()));
    }

    #[test]
    fn hops_still_resolve_after_a_source_rename() {
        let (conn, primary, row_id) = setup();
        let locks = TableLocks::new();

        let mut renamed = primary.clone();
        renamed.name = "leads".to_string();
        SchemaEditor::new(&conn, locks.clone())
            .converge(Some("responses"), &renamed)
            .unwrap();
        DescriptorStore::new(&conn).update(&renamed).unwrap();
        rename_companions(&conn, &locks, "responses", "leads").unwrap();

        let store = DescriptorStore::new(&conn);
        let annotation = store.get_by_name("leadsmetadata").unwrap().unwrap();
        let notes = EntityHandle::materialize(&conn, &annotation);
        let mut fields = BTreeMap::new();
        fields.insert("metadata".to_string(), Value::Integer(row_id));
        let note_id = notes.create(&fields).unwrap();

        let outcome = apply_update(
            &conn,
            &request("leads", row_id, "leadsmetadata__status", "Verified"),
        )
        .unwrap();
        assert!(matches!(outcome, UpdateOutcome::Ok { .. }));
        let note = notes.get(note_id).unwrap().unwrap();
        assert_eq!(note.fields["status"], Value::Text("Verified".to_string()));
    }

    #[test]
    fn invalid_choice_value_is_a_failure_outcome() {
        let (conn, _, row_id) = setup();
        let store = DescriptorStore::new(&conn);
        let annotation = store.get_by_name("responsesmetadata").unwrap().unwrap();
        let notes = EntityHandle::materialize(&conn, &annotation);
        let mut fields = BTreeMap::new();
        fields.insert("metadata".to_string(), Value::Integer(row_id));
        notes.create(&fields).unwrap();

        let outcome = apply_update(
            &conn,
            &request("responses", row_id, "responsesmetadata__status", "Bogus"),
        )
        .unwrap();
        assert!(matches!(outcome, UpdateOutcome::Failure { .. }));
    }

    #[test]
    fn missing_rows_and_fields_fail_without_raising() {
        let (conn, _, row_id) = setup();
        let gone = apply_update(&conn, &request("responses", 999, "email", "x")).unwrap();
        assert!(matches!(gone, UpdateOutcome::Failure { .. }));

        let no_field = apply_update(&conn, &request("responses", row_id, "nope", "x")).unwrap();
        assert!(matches!(no_field, UpdateOutcome::Failure { .. }));

        let no_source = apply_update(&conn, &request("missing", 1, "email", "x")).unwrap();
        assert!(matches!(no_source, UpdateOutcome::Failure { .. }));

        let no_hop_row = apply_update(
            &conn,
            &request("responses", row_id, "responsesmetadata__status", "Verified"),
        )
        .unwrap();
        assert!(matches!(no_hop_row, UpdateOutcome::Failure { .. }));
    }

    #[test]
    fn empty_value_clears_the_field() {
        let (conn, primary, row_id) = setup();
        let outcome = apply_update(&conn, &request("responses", row_id, "email", "")).unwrap();
        assert!(matches!(outcome, UpdateOutcome::Ok { .. }));
        let rows = EntityHandle::materialize(&conn, &primary);
        let entity = rows.get(row_id).unwrap().unwrap();
        assert!(!entity.fields.contains_key("email"));
    }

    #[test]
    fn outcome_serializes_with_status_tag() {
        let ok = serde_json::to_value(UpdateOutcome::saved()).unwrap();
        assert_eq!(ok["status"], "OK");
        let fail = serde_json::to_value(UpdateOutcome::failure("nope")).unwrap();
        assert_eq!(fail["status"], "FAILURE");
        assert_eq!(fail["message"], "nope");
    }
}
