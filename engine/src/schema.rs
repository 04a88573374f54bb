//! Field schemas for entity payloads.
//!
//! Each entity type declares its payload fields in the static dispatch table
//! (see [`crate::entity`]). Validation runs before an operation is sent and
//! turns malformed entities into [`SyncError::ValidationFailed`].

use crate::{error::SyncResult, SyncError};
use serde::Serialize;
use serde_json::Value;

/// Field types supported in payload schemas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Int,
    Float,
    Bool,
    Timestamp,
    /// Arbitrary nested JSON
    Json,
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldType::String => write!(f, "String"),
            FieldType::Int => write!(f, "Int"),
            FieldType::Float => write!(f, "Float"),
            FieldType::Bool => write!(f, "Bool"),
            FieldType::Timestamp => write!(f, "Timestamp"),
            FieldType::Json => write!(f, "Json"),
        }
    }
}

/// Definition of a payload field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDef {
    /// Field name
    pub name: &'static str,
    /// Field type
    pub field_type: FieldType,
    /// Whether this field is required
    pub required: bool,
}

impl FieldDef {
    /// A required field.
    pub const fn required(name: &'static str, field_type: FieldType) -> Self {
        Self {
            name,
            field_type,
            required: true,
        }
    }

    /// An optional field.
    pub const fn optional(name: &'static str, field_type: FieldType) -> Self {
        Self {
            name,
            field_type,
            required: false,
        }
    }

    /// Validate a JSON value against this field definition.
    pub fn validate(&self, value: Option<&Value>) -> SyncResult<()> {
        match value {
            None | Some(Value::Null) if self.required => Err(SyncError::validation(format!(
                "missing required field: {}",
                self.name
            ))),
            None | Some(Value::Null) => Ok(()),
            Some(v) => self.validate_type(v),
        }
    }

    fn validate_type(&self, value: &Value) -> SyncResult<()> {
        let valid = match self.field_type {
            FieldType::String => value.is_string(),
            FieldType::Int => value.is_i64() || value.is_u64(),
            FieldType::Float => value.is_number(),
            FieldType::Bool => value.is_boolean(),
            FieldType::Timestamp => value.is_u64() || value.is_i64(),
            FieldType::Json => true,
        };

        if valid {
            Ok(())
        } else {
            Err(SyncError::validation(format!(
                "type mismatch for field '{}': expected {}, got {}",
                self.name,
                self.field_type,
                json_type_name(value)
            )))
        }
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "Null",
        Value::Bool(_) => "Bool",
        Value::Number(n) if n.is_i64() || n.is_u64() => "Int",
        Value::Number(_) => "Float",
        Value::String(_) => "String",
        Value::Array(_) => "Array",
        Value::Object(_) => "Object",
    }
}

/// Validate a payload object against a list of field definitions.
///
/// Fields not named in the schema are allowed and synced as-is.
pub fn validate_payload(fields: &[FieldDef], payload: &Value) -> SyncResult<()> {
    let obj = payload
        .as_object()
        .ok_or_else(|| SyncError::validation("payload must be an object"))?;

    for field in fields {
        field.validate(obj.get(field.name))?;
    }

    Ok(())
}
