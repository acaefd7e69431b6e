//! End-to-end library tests: infer, materialize, import, edit, re-import.

use rusqlite::Connection;

use csv_sourced::companion::ensure_companions;
use csv_sourced::data::Value;
use csv_sourced::descriptor::SchemaDescriptor;
use csv_sourced::editor::{DdlChange, SchemaEditor, TableLocks};
use csv_sourced::entity::EntityHandle;
use csv_sourced::infer::infer_columns;
use csv_sourced::reconcile::import_records;
use csv_sourced::store::{self, DescriptorStore};
use csv_sourced::catalog::TypeTag;

const SAMPLE_CSV: &str = "Timestamp,Email Address,Amount Paid\n\
                          2019-04-23 15:06:51,a@example.org,12.5\n\
                          4/24/2019 9:00am PST,b@example.org,13\n";

fn setup() -> Connection {
    let conn = Connection::open_in_memory().expect("in-memory db");
    store::init(&conn).expect("init");
    conn
}

#[test]
fn inferred_schema_materializes_and_imports_with_canonical_dates() {
    let conn = setup();
    let locks = TableLocks::new();
    let store = DescriptorStore::new(&conn);

    let columns = infer_columns(SAMPLE_CSV).expect("inference");
    let mut descriptor = SchemaDescriptor::new("responses", columns);
    store.insert(&mut descriptor).expect("insert");

    let editor = SchemaEditor::new(&conn, locks.clone());
    let changes = editor.converge(None, &descriptor).expect("converge");
    assert_eq!(changes, vec![DdlChange::CreatedTable]);

    let errors = import_records(&conn, &locks, &descriptor, SAMPLE_CSV).expect("import");
    assert!(errors.is_empty());

    let handle = EntityHandle::materialize(&conn, &descriptor);
    let rows = handle.all().expect("rows");
    assert_eq!(rows.len(), 2);
    // both date spellings land in canonical form
    assert_eq!(rows[0].fields["timestamp"].as_display(), "2019-04-23 15:06:51");
    assert_eq!(rows[1].fields["timestamp"].as_display(), "2019-04-24 09:00:00");
    assert_eq!(rows[1].fields["amount_paid"], Value::Number(13.0));
}

#[test]
fn schema_edit_survives_a_reimport() {
    let conn = setup();
    let locks = TableLocks::new();
    let store = DescriptorStore::new(&conn);

    let mut descriptor = SchemaDescriptor::new("responses", infer_columns(SAMPLE_CSV).unwrap());
    store.insert(&mut descriptor).unwrap();
    let editor = SchemaEditor::new(&conn, locks.clone());
    editor.converge(None, &descriptor).unwrap();
    import_records(&conn, &locks, &descriptor, SAMPLE_CSV).unwrap();

    // loosen amount_paid to text, then re-import
    descriptor.columns[2].type_tag = TypeTag::Text;
    let changes = editor.converge(None, &descriptor).unwrap();
    assert_eq!(changes, vec![DdlChange::AlteredColumn("amount_paid".to_string())]);
    store.update(&descriptor).unwrap();

    let errors = import_records(&conn, &locks, &descriptor, SAMPLE_CSV).unwrap();
    assert!(errors.is_empty());
    let handle = EntityHandle::materialize(&conn, &descriptor);
    let rows = handle.all().unwrap();
    assert_eq!(rows.len(), 2, "identity upserts keep the row count stable");
    assert_eq!(rows[0].fields["amount_paid"], Value::Text("12.5".to_string()));
}

#[test]
fn annotations_survive_source_reimports() {
    let conn = setup();
    let locks = TableLocks::new();
    let store = DescriptorStore::new(&conn);

    let mut descriptor = SchemaDescriptor::new("responses", infer_columns(SAMPLE_CSV).unwrap());
    store.insert(&mut descriptor).unwrap();
    SchemaEditor::new(&conn, locks.clone())
        .converge(None, &descriptor)
        .unwrap();
    import_records(&conn, &locks, &descriptor, SAMPLE_CSV).unwrap();
    let companions = ensure_companions(&conn, &locks, &mut descriptor).unwrap();

    // annotate row 1, then refresh the source data
    let annotations = EntityHandle::materialize(&conn, &companions[0]);
    let note_id = annotations
        .create(
            &[
                ("status".to_string(), Value::Text("In Progress".to_string())),
                ("notes".to_string(), Value::Text("called back".to_string())),
                ("metadata".to_string(), Value::Integer(1)),
            ]
            .into_iter()
            .collect(),
        )
        .unwrap();

    let errors = import_records(&conn, &locks, &descriptor, SAMPLE_CSV).unwrap();
    assert!(errors.is_empty());

    let note = annotations.get(note_id).unwrap().unwrap();
    assert_eq!(note.fields["metadata"], Value::Integer(1));
    assert_eq!(note.fields["notes"], Value::Text("called back".to_string()));
}

#[test]
fn descriptor_wire_json_round_trips_through_the_store() {
    let conn = setup();
    let store = DescriptorStore::new(&conn);

    let mut descriptor = SchemaDescriptor::new("responses", infer_columns(SAMPLE_CSV).unwrap());
    store.insert(&mut descriptor).unwrap();

    // the persisted column JSON keeps the wire shape other tools consume
    let raw: String = conn
        .query_row(
            "SELECT columns FROM data_sources WHERE name = 'responses'",
            [],
            |row| row.get(0),
        )
        .unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(parsed[0]["name"], "timestamp");
    assert_eq!(parsed[0]["type"], "datetime");
    assert_eq!(parsed[0]["original_name"], "Timestamp");
    assert_eq!(parsed[0]["searchable"], true);
    assert!(parsed[0].get("args").is_none());

    let reloaded = store.get_by_name("responses").unwrap().unwrap();
    assert_eq!(reloaded, descriptor);
}
