//! Import reconciliation: normalize fetched rows and upsert them into a
//! materialized table by row identity, collecting per-row errors.
//!
//! Imports run in two phases: a dry validation pass that writes nothing,
//! then a real pass that is promoted only when the dry pass came back
//! clean. The real pass never aborts on a bad row; each failure is
//! recorded with the row's identity and the batch continues.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use log::{debug, info};
use rusqlite::Connection;

use crate::catalog::TypeTag;
use crate::data::{Value, parse_loose_date, parse_loose_datetime, parse_loose_time};
use crate::descriptor::SchemaDescriptor;
use crate::editor::TableLocks;
use crate::entity::EntityHandle;
use crate::error::RowError;
use crate::io_utils::open_csv_reader;

/// One normalized record awaiting upsert: the assigned identity plus
/// cells aligned to the mapped header row. Never persisted as its own
/// entity.
#[derive(Debug, Clone)]
pub struct ImportRow {
    pub id: i64,
    pub cells: Vec<Option<String>>,
}

/// Map raw CSV headers to descriptor column names, canonicalize
/// date/time cells, and assign row identities.
///
/// Headers with no `original_name` mapping pass through unchanged, so a
/// spreadsheet that grew new columns still imports. Cells in temporal
/// columns that fail the loose parsers become null rather than failing
/// the row. A non-empty `id` cell that does not parse as an integer is
/// a row error: falling back to row order there could collide with a
/// genuine external identity later in the batch.
pub fn normalize_records(
    descriptor: &SchemaDescriptor,
    csv_text: &str,
) -> Result<(Vec<String>, Vec<ImportRow>, Vec<RowError>)> {
    let mut reader = open_csv_reader(csv_text.as_bytes(), b',', true);
    let raw_headers = reader.headers().context("Reading import header row")?.clone();
    let headers: Vec<String> = raw_headers
        .iter()
        .map(|h| {
            descriptor
                .header_to_column(h)
                .map(str::to_string)
                .unwrap_or_else(|| h.to_string())
        })
        .collect();

    let id_index = headers.iter().position(|h| h == "id");

    let temporal: Vec<(usize, TypeTag)> = headers
        .iter()
        .enumerate()
        .filter_map(|(idx, name)| {
            descriptor
                .column(name)
                .filter(|c| c.type_tag.is_temporal())
                .map(|c| (idx, c.type_tag))
        })
        .collect();

    let mut rows = Vec::new();
    let mut bad = Vec::new();
    for (row_index, record) in reader.records().enumerate() {
        let record = record.context("Reading import row")?;
        let mut cells: Vec<Option<String>> = (0..headers.len())
            .map(|idx| record.get(idx).map(str::to_string))
            .collect();

        for (idx, tag) in &temporal {
            if let Some(Some(raw)) = cells.get(*idx).map(Option::as_ref) {
                if raw.is_empty() {
                    continue;
                }
                let canonical = match tag {
                    TypeTag::Date => parse_loose_date(raw)
                        .map(|d| d.format("%Y-%m-%d").to_string())
                        .ok(),
                    TypeTag::Time => parse_loose_time(raw)
                        .map(|t| t.format("%H:%M:%S").to_string())
                        .ok(),
                    _ => parse_loose_datetime(raw)
                        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
                        .ok(),
                };
                cells[*idx] = canonical;
            }
        }

        // external identity when the source supplies one, otherwise
        // 1-based row order
        let raw_id = id_index
            .and_then(|idx| cells.get(idx).cloned().flatten())
            .map(|raw| raw.trim().to_string())
            .filter(|raw| !raw.is_empty());
        let id = match raw_id {
            Some(raw) => match raw.parse::<i64>() {
                Ok(id) => id,
                Err(_) => {
                    bad.push(RowError::for_column(
                        (row_index + 1).to_string(),
                        "id",
                        format!("'{raw}' is not a usable row identity"),
                    ));
                    continue;
                }
            },
            None => row_index as i64 + 1,
        };

        rows.push(ImportRow { id, cells });
    }
    Ok((headers, rows, bad))
}

fn typed_fields(
    descriptor: &SchemaDescriptor,
    headers: &[String],
    row: &ImportRow,
    errors: &mut Vec<RowError>,
) -> BTreeMap<String, Value> {
    let mut fields = BTreeMap::new();
    for (idx, name) in headers.iter().enumerate() {
        if name == "id" {
            continue;
        }
        let Some(column) = descriptor.column(name) else {
            continue;
        };
        let Some(Some(raw)) = row.cells.get(idx).map(Option::as_ref) else {
            continue;
        };
        match column.type_tag.validate(raw, column) {
            Ok(Some(value)) => {
                fields.insert(name.clone(), value);
            }
            Ok(None) => {}
            Err(reason) => {
                errors.push(RowError::for_column(row.id.to_string(), name, reason));
            }
        }
    }
    for column in &descriptor.columns {
        if column.required() && !fields.contains_key(&column.name) {
            errors.push(RowError::for_column(
                row.id.to_string(),
                &column.name,
                "a value is required",
            ));
        }
    }
    fields
}

/// Parse, normalize and upsert `csv_text` into the descriptor's
/// materialized table. With `dry_run` set, validates everything and
/// writes nothing. Returns the accumulated row errors; an empty list is
/// full success.
pub fn reconcile(
    conn: &Connection,
    locks: &TableLocks,
    descriptor: &SchemaDescriptor,
    csv_text: &str,
    dry_run: bool,
) -> Result<Vec<RowError>> {
    // barrier: wait out any in-flight convergence of this table, but do
    // not hold the lock across the whole batch
    let entry = locks.entry(&descriptor.name);
    drop(
        entry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()),
    );

    let (headers, rows, mut errors) = normalize_records(descriptor, csv_text)?;
    debug!(
        "reconciling {} row(s) into '{}' (dry_run={dry_run})",
        rows.len(),
        descriptor.name
    );

    let handle = EntityHandle::materialize(conn, descriptor);

    for row in &rows {
        let mut row_errors = Vec::new();
        let fields = typed_fields(descriptor, &headers, row, &mut row_errors);
        if !row_errors.is_empty() {
            errors.extend(row_errors);
            continue;
        }
        if dry_run {
            continue;
        }

        let tx = conn
            .unchecked_transaction()
            .context("Opening per-row transaction")?;
        let outcome = match handle.get(row.id) {
            Ok(Some(_)) => handle.update(row.id, &fields).map(|_| ()),
            Ok(None) => handle.create_with_id(row.id, &fields).map(|_| ()),
            Err(err) => Err(err),
        };
        match outcome {
            Ok(()) => {
                tx.commit().context("Committing row")?;
            }
            Err(err) => {
                // dropped transaction rolls the row back; the batch goes on
                errors.push(RowError::new(row.id.to_string(), format!("{err:#}")));
            }
        }
    }

    if !dry_run {
        info!(
            "reconciled {} row(s) into '{}' with {} error(s)",
            rows.len(),
            descriptor.name,
            errors.len()
        );
    }
    Ok(errors)
}

/// The two-phase import: a dry validation pass gates the real write
/// pass, so a batch with descriptor-level problems never half-commits.
pub fn import_records(
    conn: &Connection,
    locks: &TableLocks,
    descriptor: &SchemaDescriptor,
    csv_text: &str,
) -> Result<Vec<RowError>> {
    let errors = reconcile(conn, locks, descriptor, csv_text, true)?;
    if !errors.is_empty() {
        return Ok(errors);
    }
    reconcile(conn, locks, descriptor, csv_text, false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::ColumnDescriptor;
    use crate::editor::SchemaEditor;
    use crate::store;

    fn setup(descriptor: &SchemaDescriptor) -> (Connection, std::sync::Arc<TableLocks>) {
        let conn = Connection::open_in_memory().expect("in-memory db");
        store::init(&conn).expect("init");
        let locks = TableLocks::new();
        let editor = SchemaEditor::new(&conn, locks.clone());
        editor.converge(None, descriptor).expect("converge");
        (conn, locks)
    }

    #[test]
    fn rows_without_an_id_column_get_sequential_identities() {
        let descriptor = SchemaDescriptor::new("responses", Vec::new());
        let (conn, locks) = setup(&descriptor);
        let csv = "timestamp,question one,checkbox\n\
                   11903923302,response 1,1\n\
                   29803243893,another response,0\n";
        let errors = reconcile(&conn, &locks, &descriptor, csv, false).unwrap();
        assert!(errors.is_empty());

        let handle = EntityHandle::materialize(&conn, &descriptor);
        let rows = handle.all().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].id, 1);
        assert_eq!(rows[1].id, 2);
    }

    #[test]
    fn date_variants_normalize_to_comparable_canonical_timestamps() {
        let mut column = ColumnDescriptor::new("submitted", TypeTag::DateTime);
        column.original_name = Some("Submitted At".to_string());
        let descriptor = SchemaDescriptor::new("responses", vec![column]);
        let (conn, locks) = setup(&descriptor);

        let csv = "Submitted At\n4/23/2019 3:06pm PST\n2019-04-23 15:06:00 UTC\nnot a date\n";
        let errors = reconcile(&conn, &locks, &descriptor, csv, false).unwrap();
        assert!(errors.is_empty());

        let handle = EntityHandle::materialize(&conn, &descriptor);
        let rows = handle.all().unwrap();
        assert_eq!(rows[0].fields["submitted"], rows[1].fields["submitted"]);
        assert_eq!(
            rows[0].fields["submitted"].as_display(),
            "2019-04-23 15:06:00"
        );
        // unparsable non-empty dates become null, not row failures
        assert!(!rows[2].fields.contains_key("submitted"));
    }

    #[test]
    fn reimport_upserts_by_identity_and_keeps_stable_names() {
        let mut email = ColumnDescriptor::new("email", TypeTag::Text);
        email.original_name = Some("Email Address".to_string());
        let descriptor = SchemaDescriptor::new("responses", vec![email]);
        let (conn, locks) = setup(&descriptor);

        let first = "Email Address\na@b.c\nx@y.z\n";
        assert!(reconcile(&conn, &locks, &descriptor, first, false)
            .unwrap()
            .is_empty());
        let second = "Email Address\nupdated@b.c\nx@y.z\n";
        assert!(reconcile(&conn, &locks, &descriptor, second, false)
            .unwrap()
            .is_empty());

        let handle = EntityHandle::materialize(&conn, &descriptor);
        let rows = handle.all().unwrap();
        assert_eq!(rows.len(), 2, "re-import must not duplicate rows");
        assert_eq!(rows[0].fields["email"], Value::Text("updated@b.c".to_string()));
    }

    #[test]
    fn external_id_column_wins_over_row_order() {
        let descriptor = SchemaDescriptor::new(
            "tickets",
            vec![ColumnDescriptor::new("summary", TypeTag::Text)],
        );
        let (conn, locks) = setup(&descriptor);
        let csv = "id,summary\n700,first\n300,second\n";
        assert!(reconcile(&conn, &locks, &descriptor, csv, false)
            .unwrap()
            .is_empty());
        let handle = EntityHandle::materialize(&conn, &descriptor);
        let ids: Vec<i64> = handle.all().unwrap().iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![300, 700]);
    }

    #[test]
    fn garbage_identities_are_row_errors_not_silent_renumbering() {
        let descriptor = SchemaDescriptor::new(
            "tickets",
            vec![ColumnDescriptor::new("summary", TypeTag::Text)],
        );
        let (conn, locks) = setup(&descriptor);
        let csv = "id,summary\n700,first\nnot-an-id,second\n";
        let errors = reconcile(&conn, &locks, &descriptor, csv, false).unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].row_id, "2");
        assert_eq!(errors[0].column.as_deref(), Some("id"));

        // the bad row never renumbered itself over another identity
        let handle = EntityHandle::materialize(&conn, &descriptor);
        let ids: Vec<i64> = handle.all().unwrap().iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![700]);
    }

    #[test]
    fn bad_rows_are_collected_while_good_rows_commit() {
        let mut amount = ColumnDescriptor::new("amount", TypeTag::Number);
        amount.original_name = Some("Amount".to_string());
        let descriptor = SchemaDescriptor::new("payments", vec![amount]);
        let (conn, locks) = setup(&descriptor);

        let csv = "Amount\n12.5\nnot-a-number\n99\n";
        let errors = reconcile(&conn, &locks, &descriptor, csv, false).unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].row_id, "2");
        assert_eq!(errors[0].column.as_deref(), Some("amount"));

        let handle = EntityHandle::materialize(&conn, &descriptor);
        assert_eq!(handle.count().unwrap(), 2);
    }

    #[test]
    fn two_phase_import_blocks_writes_when_validation_fails() {
        let mut amount = ColumnDescriptor::new("amount", TypeTag::Number);
        amount.original_name = Some("Amount".to_string());
        let descriptor = SchemaDescriptor::new("payments", vec![amount]);
        let (conn, locks) = setup(&descriptor);

        let csv = "Amount\n12.5\nnot-a-number\n";
        let errors = import_records(&conn, &locks, &descriptor, csv).unwrap();
        assert_eq!(errors.len(), 1);

        let handle = EntityHandle::materialize(&conn, &descriptor);
        assert_eq!(handle.count().unwrap(), 0, "dry-pass failure must gate all writes");
    }

    #[test]
    fn unexpected_new_columns_are_tolerated() {
        let mut email = ColumnDescriptor::new("email", TypeTag::Text);
        email.original_name = Some("Email".to_string());
        let descriptor = SchemaDescriptor::new("responses", vec![email]);
        let (conn, locks) = setup(&descriptor);

        let csv = "Email,Brand New Column\na@b.c,surprise\n";
        let errors = reconcile(&conn, &locks, &descriptor, csv, false).unwrap();
        assert!(errors.is_empty());
        let handle = EntityHandle::materialize(&conn, &descriptor);
        let rows = handle.all().unwrap();
        assert_eq!(rows[0].fields["email"], Value::Text("a@b.c".to_string()));
    }
}
