//! Schema descriptors: the persisted, editable description of each
//! managed table.
//!
//! The column descriptor serde shape is the wire format shared with the
//! configuration UI and must stay exactly
//! `{name, original_name?, type, args?, attrs?, searchable?, filterable?, redact?}`.

use std::collections::HashSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::catalog::TypeTag;
use crate::error::SchemaError;

/// Upper bound on generated column identifiers; longer inferred headers
/// are truncated before deduplication.
pub const MAX_IDENTIFIER_LENGTH: usize = 40;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ColumnDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_name: Option<String>,
    #[serde(rename = "type")]
    pub type_tag: TypeTag,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<JsonValue>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub attrs: Map<String, JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub searchable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filterable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redact: Option<bool>,
}

impl ColumnDescriptor {
    pub fn new(name: impl Into<String>, type_tag: TypeTag) -> Self {
        Self {
            name: name.into(),
            original_name: None,
            type_tag,
            args: Vec::new(),
            attrs: Map::new(),
            searchable: None,
            filterable: None,
            redact: None,
        }
    }

    pub fn attr_bool(&self, key: &str) -> Option<bool> {
        self.attrs.get(key).and_then(JsonValue::as_bool)
    }

    pub fn attr_u64(&self, key: &str) -> Option<u64> {
        self.attrs.get(key).and_then(JsonValue::as_u64)
    }

    pub fn attr_str(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).and_then(JsonValue::as_str)
    }

    /// Ordered allowed display values for a choice column.
    pub fn choices(&self) -> Vec<String> {
        self.attrs
            .get("choices")
            .and_then(JsonValue::as_array)
            .map(|values| {
                values
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Target table identifier for a foreign-key column (first
    /// positional arg).
    pub fn fk_target(&self) -> Option<&str> {
        self.args.first().and_then(JsonValue::as_str)
    }

    /// ON DELETE action for a foreign-key column (second positional
    /// arg, wire spelling `SET_NULL` / `CASCADE`).
    pub fn fk_on_delete(&self) -> &'static str {
        match self.args.get(1).and_then(JsonValue::as_str) {
            Some("CASCADE") => "CASCADE",
            Some("RESTRICT") => "RESTRICT",
            _ => "SET NULL",
        }
    }

    /// Whether a non-empty value is required on write.
    pub fn required(&self) -> bool {
        self.attr_bool("null") == Some(false) && self.attr_str("default").is_none()
    }

    pub fn storage_decl(&self) -> String {
        self.type_tag.storage_decl(self)
    }
}

/// Model kind carried in descriptor attrs (wire values 1/2/3, from the
/// original attrs.type convention).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorKind {
    Primary,
    Annotation,
    ContactLog,
}

impl DescriptorKind {
    pub fn as_wire(&self) -> i64 {
        match self {
            DescriptorKind::Primary => 1,
            DescriptorKind::Annotation => 2,
            DescriptorKind::ContactLog => 3,
        }
    }

    pub fn from_wire(value: i64) -> Option<Self> {
        match value {
            1 => Some(DescriptorKind::Primary),
            2 => Some(DescriptorKind::Annotation),
            3 => Some(DescriptorKind::ContactLog),
            _ => None,
        }
    }
}

/// Where a source's rows come from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceConfig {
    /// Public CSV URL, including Google Sheets share links.
    RemoteCsv { url: String },
    /// Service-credentialed private sheet.
    PrivateSheet { url: String },
    /// Paginated ticketing-API form/response export.
    Ticketing {
        project_id: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        form_id: Option<i64>,
    },
    /// Uploaded file kept on disk.
    Upload { path: PathBuf },
    #[default]
    None,
}

/// A managed table: name, ordered columns, source configuration and
/// lifecycle attributes. The `name` doubles as the materialized table
/// identifier.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaDescriptor {
    pub id: i64,
    pub name: String,
    pub columns: Vec<ColumnDescriptor>,
    pub source: SourceConfig,
    pub kind: Option<DescriptorKind>,
    /// Frozen from automatic re-import until a manual import succeeds.
    pub dead: bool,
}

impl SchemaDescriptor {
    pub fn new(name: impl Into<String>, columns: Vec<ColumnDescriptor>) -> Self {
        Self {
            id: 0,
            name: name.into(),
            columns,
            source: SourceConfig::None,
            kind: None,
            dead: false,
        }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Map an incoming CSV header to its stable column name via
    /// `original_name`. Headers already matching a column name map to
    /// themselves; anything else is unknown.
    pub fn header_to_column(&self, header: &str) -> Option<&str> {
        self.columns
            .iter()
            .find(|c| c.original_name.as_deref() == Some(header))
            .or_else(|| self.columns.iter().find(|c| c.name == header))
            .map(|c| c.name.as_str())
    }
}

/// Lowercase a user-supplied source name into a slug-safe table
/// identifier (alphanumerics only, like the original slugify-and-strip).
pub fn slugify_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

pub fn annotation_name(primary: &str) -> String {
    format!("{primary}metadata")
}

pub fn contact_log_name(primary: &str) -> String {
    format!("{primary}contactmetadata")
}

fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Validate a descriptor's column list before it is allowed anywhere
/// near the DDL engine: identifier rules, uniqueness, and type exposure
/// appropriate for the descriptor kind.
pub fn validate_columns(
    columns: &[ColumnDescriptor],
    kind: Option<DescriptorKind>,
) -> Result<(), SchemaError> {
    let mut seen = HashSet::new();
    for column in columns {
        if column.name.is_empty() {
            return Err(SchemaError::Validation(
                "a column is missing its required name".to_string(),
            ));
        }
        if !is_valid_identifier(&column.name) {
            return Err(SchemaError::Validation(format!(
                "column name '{}' is not a valid identifier",
                column.name
            )));
        }
        if !seen.insert(column.name.as_str()) {
            return Err(SchemaError::DuplicateColumn(column.name.clone()));
        }

        let allowed: bool = TypeTag::hidden().contains(&column.type_tag)
            || match kind {
                Some(DescriptorKind::Annotation) | Some(DescriptorKind::ContactLog) => {
                    TypeTag::companion_facing().contains(&column.type_tag)
                }
                Some(DescriptorKind::Primary) | None => {
                    // an untagged descriptor may carry either exposure set
                    TypeTag::user_facing().contains(&column.type_tag)
                        || kind.is_none()
                            && TypeTag::companion_facing().contains(&column.type_tag)
                }
            };
        if !allowed {
            return Err(SchemaError::Validation(format!(
                "column '{}' has type '{}' which is not allowed here",
                column.name,
                column.type_tag.as_wire()
            )));
        }

        if column.type_tag == TypeTag::ForeignKey && column.fk_target().is_none() {
            return Err(SchemaError::Validation(format!(
                "foreign-key column '{}' is missing its target table",
                column.name
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn columns_json() -> &'static str {
        r#"[
            {"name": "timestamp", "original_name": "Timestamp", "type": "datetime",
             "searchable": true, "filterable": false},
            {"name": "email", "original_name": "Email Address", "type": "text"},
            {"name": "metadata", "type": "foreignkey", "args": ["responses", "SET_NULL"],
             "attrs": {"blank": true, "null": true}}
        ]"#
    }

    #[test]
    fn wire_shape_round_trips() {
        let columns: Vec<ColumnDescriptor> = serde_json::from_str(columns_json()).unwrap();
        assert_eq!(columns.len(), 3);
        assert_eq!(columns[0].type_tag, TypeTag::DateTime);
        assert_eq!(columns[1].original_name.as_deref(), Some("Email Address"));
        assert_eq!(columns[2].fk_target(), Some("responses"));

        let rendered = serde_json::to_value(&columns).unwrap();
        assert_eq!(rendered[0]["type"], json!("datetime"));
        assert_eq!(rendered[0]["searchable"], json!(true));
        // absent optional keys stay absent
        assert!(rendered[1].get("args").is_none());
        assert!(rendered[1].get("searchable").is_none());
        assert_eq!(rendered[2]["args"], json!(["responses", "SET_NULL"]));
    }

    #[test]
    fn header_mapping_prefers_original_name() {
        let columns: Vec<ColumnDescriptor> = serde_json::from_str(columns_json()).unwrap();
        let descriptor = SchemaDescriptor::new("responses", columns);
        assert_eq!(descriptor.header_to_column("Email Address"), Some("email"));
        assert_eq!(descriptor.header_to_column("email"), Some("email"));
        assert_eq!(descriptor.header_to_column("Unknown Header"), None);
    }

    #[test]
    fn validate_rejects_duplicates_and_bad_identifiers() {
        let columns = vec![
            ColumnDescriptor::new("email", TypeTag::Text),
            ColumnDescriptor::new("email", TypeTag::Text),
        ];
        assert!(matches!(
            validate_columns(&columns, Some(DescriptorKind::Primary)),
            Err(SchemaError::DuplicateColumn(name)) if name == "email"
        ));

        let columns = vec![ColumnDescriptor::new("1bad", TypeTag::Text)];
        assert!(matches!(
            validate_columns(&columns, None),
            Err(SchemaError::Validation(_))
        ));
    }

    #[test]
    fn validate_enforces_type_exposure_per_kind() {
        // choice is companion-only
        let choice = vec![ColumnDescriptor::new("status", TypeTag::Choice)];
        assert!(validate_columns(&choice, Some(DescriptorKind::Annotation)).is_ok());
        assert!(validate_columns(&choice, Some(DescriptorKind::Primary)).is_err());

        // hidden tags are valid anywhere
        let mut fk = ColumnDescriptor::new("metadata", TypeTag::ForeignKey);
        fk.args = vec![json!("responses")];
        assert!(validate_columns(std::slice::from_ref(&fk), Some(DescriptorKind::Primary)).is_ok());
    }

    #[test]
    fn slugs_and_companion_names_are_deterministic() {
        assert_eq!(slugify_name("Form Responses (2024)!"), "formresponses2024");
        assert_eq!(annotation_name("responses"), "responsesmetadata");
        assert_eq!(contact_log_name("responses"), "responsescontactmetadata");
    }

    #[test]
    fn source_config_serializes_with_kind_tag() {
        let source = SourceConfig::Ticketing {
            project_id: 42,
            form_id: None,
        };
        let value = serde_json::to_value(&source).unwrap();
        assert_eq!(value["kind"], json!("ticketing"));
        assert_eq!(value["project_id"], json!(42));
    }
}
