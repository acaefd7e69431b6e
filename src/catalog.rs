//! The closed column type catalog.
//!
//! Maps abstract type tags to concrete SQLite storage declarations and
//! per-cell validation. User-facing tags are the ones offered in
//! configuration surfaces; hidden tags exist only for system-generated
//! columns (foreign keys, tag sets, computed timestamps). Validation
//! treats both uniformly. The wire names are load-bearing: they appear
//! verbatim in persisted column descriptor JSON.

use serde::{Deserialize, Deserializer, Serialize, Serializer, de};

use crate::data::{Value, parse_loose_date, parse_loose_datetime, parse_loose_time};
use crate::descriptor::ColumnDescriptor;
use crate::error::SchemaError;

const DEFAULT_SHORT_TEXT_LENGTH: u64 = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeTag {
    Text,
    ShortText,
    Date,
    Time,
    DateTime,
    Number,
    Integer,
    Choice,
    ForeignKey,
    TagSet,
    CreatedAt,
}

impl TypeTag {
    pub fn as_wire(&self) -> &'static str {
        match self {
            TypeTag::Text => "text",
            TypeTag::ShortText => "short-text",
            TypeTag::Date => "date",
            TypeTag::Time => "time",
            TypeTag::DateTime => "datetime",
            TypeTag::Number => "number",
            TypeTag::Integer => "integer",
            TypeTag::Choice => "choice",
            TypeTag::ForeignKey => "foreignkey",
            TypeTag::TagSet => "tagging",
            TypeTag::CreatedAt => "created-at",
        }
    }

    pub fn from_wire(token: &str) -> Result<Self, SchemaError> {
        match token {
            "text" => Ok(TypeTag::Text),
            "short-text" => Ok(TypeTag::ShortText),
            "date" => Ok(TypeTag::Date),
            "time" => Ok(TypeTag::Time),
            "datetime" => Ok(TypeTag::DateTime),
            "number" => Ok(TypeTag::Number),
            "integer" => Ok(TypeTag::Integer),
            "choice" => Ok(TypeTag::Choice),
            "foreignkey" => Ok(TypeTag::ForeignKey),
            "tagging" => Ok(TypeTag::TagSet),
            "created-at" => Ok(TypeTag::CreatedAt),
            other => Err(SchemaError::UnknownType(other.to_string())),
        }
    }

    /// Tags selectable when configuring a primary (imported) source.
    pub fn user_facing() -> &'static [TypeTag] {
        &[
            TypeTag::Text,
            TypeTag::Date,
            TypeTag::Time,
            TypeTag::DateTime,
            TypeTag::Number,
        ]
    }

    /// Tags selectable on companion (annotation / contact-log) schemas.
    pub fn companion_facing() -> &'static [TypeTag] {
        &[
            TypeTag::Text,
            TypeTag::Date,
            TypeTag::Time,
            TypeTag::DateTime,
            TypeTag::Number,
            TypeTag::Choice,
        ]
    }

    /// System-generated tags, valid on any schema but never offered in
    /// configuration surfaces.
    pub fn hidden() -> &'static [TypeTag] {
        &[
            TypeTag::ShortText,
            TypeTag::Integer,
            TypeTag::ForeignKey,
            TypeTag::TagSet,
            TypeTag::CreatedAt,
        ]
    }

    pub fn is_temporal(&self) -> bool {
        matches!(self, TypeTag::Date | TypeTag::Time | TypeTag::DateTime | TypeTag::CreatedAt)
    }

    /// The concrete column declaration for a descriptor carrying this
    /// tag, including length, FK target, nullability and default.
    pub fn storage_decl(&self, column: &ColumnDescriptor) -> String {
        let base = match self {
            TypeTag::Text | TypeTag::Choice | TypeTag::TagSet => "TEXT".to_string(),
            TypeTag::ShortText => {
                let length = column.attr_u64("max_length").unwrap_or(DEFAULT_SHORT_TEXT_LENGTH);
                format!("VARCHAR({length})")
            }
            TypeTag::Date => "DATE".to_string(),
            TypeTag::Time => "TIME".to_string(),
            TypeTag::DateTime => "DATETIME".to_string(),
            TypeTag::Number => "REAL".to_string(),
            TypeTag::Integer => "INTEGER".to_string(),
            TypeTag::CreatedAt => return "DATETIME DEFAULT CURRENT_TIMESTAMP".to_string(),
            TypeTag::ForeignKey => {
                let target = column.fk_target().unwrap_or_default();
                let action = column.fk_on_delete();
                format!("INTEGER REFERENCES \"{target}\"(\"id\") ON DELETE {action}")
            }
        };
        let mut decl = base;
        if column.attr_bool("null") == Some(false) {
            decl.push_str(" NOT NULL");
        }
        if let Some(default) = column.attr_str("default") {
            decl.push_str(&format!(" DEFAULT '{}'", default.replace('\'', "''")));
        }
        decl
    }

    /// Validate one raw cell against this tag, producing a typed value.
    /// Empty cells pass as `None`; nullability is enforced separately.
    pub fn validate(&self, raw: &str, column: &ColumnDescriptor) -> Result<Option<Value>, String> {
        if raw.is_empty() {
            return Ok(None);
        }
        let value = match self {
            TypeTag::Text | TypeTag::ShortText | TypeTag::TagSet => Value::Text(raw.to_string()),
            TypeTag::Date => Value::Date(parse_loose_date(raw).map_err(|e| e.to_string())?),
            TypeTag::Time => Value::Time(parse_loose_time(raw).map_err(|e| e.to_string())?),
            TypeTag::DateTime | TypeTag::CreatedAt => {
                Value::DateTime(parse_loose_datetime(raw).map_err(|e| e.to_string())?)
            }
            TypeTag::Number => Value::Number(
                raw.parse::<f64>()
                    .map_err(|_| format!("'{raw}' is not a number"))?,
            ),
            TypeTag::Integer | TypeTag::ForeignKey => Value::Integer(
                raw.parse::<i64>()
                    .map_err(|_| format!("'{raw}' is not an integer"))?,
            ),
            TypeTag::Choice => {
                let choices = column.choices();
                if choices.iter().any(|c| c == raw) {
                    Value::Text(raw.to_string())
                } else {
                    return Err(format!(
                        "'{raw}' is not an allowed choice (expected one of: {})",
                        choices.join(", ")
                    ));
                }
            }
        };
        Ok(Some(value))
    }

    /// Decode a stored SQLite value back into the typed representation.
    pub fn decode_stored(&self, stored: rusqlite::types::ValueRef<'_>) -> Option<Value> {
        use rusqlite::types::ValueRef;
        match stored {
            ValueRef::Null => None,
            ValueRef::Integer(i) => Some(match self {
                TypeTag::Number => Value::Number(i as f64),
                _ => Value::Integer(i),
            }),
            ValueRef::Real(f) => Some(Value::Number(f)),
            ValueRef::Text(bytes) => {
                let text = String::from_utf8_lossy(bytes).into_owned();
                let value = match self {
                    TypeTag::Date => parse_loose_date(&text).map(Value::Date).ok(),
                    TypeTag::Time => parse_loose_time(&text).map(Value::Time).ok(),
                    TypeTag::DateTime | TypeTag::CreatedAt => {
                        parse_loose_datetime(&text).map(Value::DateTime).ok()
                    }
                    _ => None,
                };
                Some(value.unwrap_or(Value::Text(text)))
            }
            ValueRef::Blob(bytes) => Some(Value::Text(String::from_utf8_lossy(bytes).into_owned())),
        }
    }
}

impl Serialize for TypeTag {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_wire())
    }
}

impl<'de> Deserialize<'de> for TypeTag {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let token = String::deserialize(deserializer)?;
        TypeTag::from_wire(&token).map_err(de::Error::custom)
    }
}
