//! A small structural schema language for worker payloads.
//!
//! Schemas check required fields, value shapes and enum membership. They
//! never mutate the payload they inspect.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single contract failure: the offending field path and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    /// Dotted path into the payload (`report.sections[2]`), or `$` for the root.
    pub field: String,
    pub reason: String,
}

impl Violation {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.reason)
    }
}

/// Accepted shape of a field value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldShape {
    Any,
    String,
    Number,
    Integer,
    Boolean,
    Array {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        items: Option<Box<FieldShape>>,
    },
    Object {
        schema: Schema,
    },
    Enum {
        values: Vec<String>,
    },
}

impl FieldShape {
    pub fn array_of(items: FieldShape) -> Self {
        Self::Array {
            items: Some(Box::new(items)),
        }
    }

    pub fn object(schema: Schema) -> Self {
        Self::Object { schema }
    }

    pub fn one_of<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Enum {
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Any => "any",
            Self::String => "string",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Array { .. } => "array",
            Self::Object { .. } => "object",
            Self::Enum { .. } => "enum",
        }
    }

    fn check(&self, path: &str, value: &Value, out: &mut Vec<Violation>) {
        let mismatch = |out: &mut Vec<Violation>| {
            out.push(Violation::new(
                path,
                format!("expected {}, got {}", self.name(), value_kind(value)),
            ));
        };
        match self {
            Self::Any => {}
            Self::String => {
                if !value.is_string() {
                    mismatch(out);
                }
            }
            Self::Number => {
                if !value.is_number() {
                    mismatch(out);
                }
            }
            Self::Integer => {
                if !(value.is_i64() || value.is_u64()) {
                    mismatch(out);
                }
            }
            Self::Boolean => {
                if !value.is_boolean() {
                    mismatch(out);
                }
            }
            Self::Array { items } => match value.as_array() {
                Some(elements) => {
                    if let Some(item_shape) = items {
                        for (i, element) in elements.iter().enumerate() {
                            item_shape.check(&format!("{path}[{i}]"), element, out);
                        }
                    }
                }
                None => mismatch(out),
            },
            Self::Object { schema } => {
                if value.is_object() {
                    schema.check_object(path, value, out);
                } else {
                    mismatch(out);
                }
            }
            Self::Enum { values } => match value.as_str() {
                Some(s) if values.iter().any(|v| v == s) => {}
                Some(s) => out.push(Violation::new(
                    path,
                    format!("value {s:?} is not one of [{}]", values.join(", ")),
                )),
                None => mismatch(out),
            },
        }
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Declaration of one field in a [`Schema`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub shape: FieldShape,
    #[serde(default = "default_true")]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

fn default_true() -> bool {
    true
}

/// Object schema: named fields plus a policy for undeclared ones.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Schema {
    #[serde(default)]
    pub fields: BTreeMap<String, FieldSpec>,
    /// When `false`, fields not declared in `fields` are violations.
    #[serde(default = "default_true")]
    pub allow_unknown: bool,
}

impl Schema {
    /// An open schema with no declared fields; accepts any object.
    pub fn new() -> Self {
        Self {
            fields: BTreeMap::new(),
            allow_unknown: true,
        }
    }

    pub fn required(mut self, name: impl Into<String>, shape: FieldShape) -> Self {
        self.fields.insert(
            name.into(),
            FieldSpec {
                shape,
                required: true,
                description: None,
            },
        );
        self
    }

    pub fn optional(mut self, name: impl Into<String>, shape: FieldShape) -> Self {
        self.fields.insert(
            name.into(),
            FieldSpec {
                shape,
                required: false,
                description: None,
            },
        );
        self
    }

    /// Reject fields that are not declared.
    pub fn strict(mut self) -> Self {
        self.allow_unknown = false;
        self
    }

    /// Validate a payload. The payload must be a JSON object.
    pub fn validate(&self, payload: &Value) -> Result<(), Vec<Violation>> {
        let mut violations = Vec::new();
        if payload.is_object() {
            self.check_object("", payload, &mut violations);
        } else {
            violations.push(Violation::new(
                "$",
                format!("expected object, got {}", value_kind(payload)),
            ));
        }
        if violations.is_empty() {
            Ok(())
        } else {
            Err(violations)
        }
    }

    fn check_object(&self, prefix: &str, value: &Value, out: &mut Vec<Violation>) {
        let Some(map) = value.as_object() else {
            return;
        };
        let join = |name: &str| {
            if prefix.is_empty() {
                name.to_string()
            } else {
                format!("{prefix}.{name}")
            }
        };

        for (name, spec) in &self.fields {
            let path = join(name);
            match map.get(name) {
                None => {
                    if spec.required {
                        out.push(Violation::new(path, "required field is missing"));
                    }
                }
                Some(Value::Null) if !matches!(spec.shape, FieldShape::Any) => {
                    if spec.required {
                        out.push(Violation::new(path, "required field is null"));
                    }
                }
                Some(v) => spec.shape.check(&path, v, out),
            }
        }

        if !self.allow_unknown {
            for name in map.keys() {
                if !self.fields.contains_key(name) {
                    out.push(Violation::new(join(name), "field is not declared by the schema"));
                }
            }
        }
    }
}
