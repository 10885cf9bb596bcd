//! Payload schema validation.
//!
//! A schema is an ordered list of required fields, each optionally restricted
//! to an enumerated set of values. Validation walks the fields in order and
//! reports the first one that is missing or outside its set.
//!
//! A field is present when its key exists; JSON `null` counts as present and
//! matches a `None` entry in an enumerated set.

use serde_json::Value;

use super::error::{Result, SchemaError};

/// One required field and, optionally, the values it may take.
#[derive(Debug, Clone, Copy)]
pub struct FieldRule {
    pub name: &'static str,
    /// `None` accepts any value. `Some` entries of `None` stand for JSON `null`.
    pub allowed: Option<&'static [Option<&'static str>]>,
}

impl FieldRule {
    pub const fn required(name: &'static str) -> Self {
        FieldRule {
            name,
            allowed: None,
        }
    }

    pub const fn one_of(name: &'static str, allowed: &'static [Option<&'static str>]) -> Self {
        FieldRule {
            name,
            allowed: Some(allowed),
        }
    }

    fn accepts(&self, value: &Value) -> bool {
        let Some(allowed) = self.allowed else {
            return true;
        };
        match value {
            Value::Null => allowed.contains(&None),
            Value::String(s) => allowed.contains(&Some(s.as_str())),
            _ => false,
        }
    }
}

/// Named, ordered set of field rules.
#[derive(Debug, Clone, Copy)]
pub struct PayloadSchema {
    pub name: &'static str,
    pub fields: &'static [FieldRule],
}

/// Schema for change payloads handed to build backends.
pub const CHANGE_SCHEMA: PayloadSchema = PayloadSchema {
    name: "change",
    fields: &[
        FieldRule::required("repo"),
        FieldRule::required("before"),
        FieldRule::required("after"),
        FieldRule::required("actor"),
        FieldRule::required("repo_url"),
        FieldRule::required("base_ref"),
        FieldRule::required("fork_url"),
        FieldRule::required("fork_ref"),
        FieldRule::one_of(
            "status",
            &[Some("open"), Some("closed"), Some("merged"), None],
        ),
        FieldRule::required("repo_id"),
        FieldRule::required("change"),
        FieldRule::required("change_id"),
        FieldRule::one_of("type", &[Some("proposal"), Some("change")]),
    ],
};

/// Schema for build results returned by build backends.
pub const BUILD_SCHEMA: PayloadSchema = PayloadSchema {
    name: "build",
    fields: &[
        FieldRule::required("backend"),
        FieldRule::required("repo"),
        FieldRule::required("change"),
        FieldRule::required("change_id"),
        FieldRule::required("sha"),
        FieldRule::one_of("type", &[Some("proposal"), Some("change")]),
        FieldRule::one_of(
            "status",
            &[
                Some("queued"),
                Some("building"),
                Some("success"),
                Some("failure"),
                Some("error"),
            ],
        ),
        FieldRule::required("build_id"),
    ],
};

/// Validate `payload` against `schema`, handing it back unchanged on success.
///
/// # Errors
///
/// - `SchemaError::NotAnObject` if the payload is not a JSON object.
/// - `SchemaError::MissingField` naming the first absent required field.
/// - `SchemaError::InvalidValue` naming the first field outside its allowed set.
pub fn validate(payload: Value, schema: &PayloadSchema) -> Result<Value> {
    let Some(object) = payload.as_object() else {
        return Err(SchemaError::NotAnObject {
            schema: schema.name,
        });
    };

    for rule in schema.fields {
        let Some(value) = object.get(rule.name) else {
            return Err(SchemaError::MissingField {
                schema: schema.name,
                field: rule.name.to_string(),
            });
        };
        if !rule.accepts(value) {
            return Err(SchemaError::InvalidValue {
                schema: schema.name,
                field: rule.name.to_string(),
                value: value.to_string(),
            });
        }
    }

    Ok(payload)
}
