//! Translation of backend-declared input schemas into validated schemas.
//!
//! Backends describe parameters with an open, JSON-Schema-like object. The hub only
//! understands a fixed set of primitive kinds; anything it cannot represent falls back
//! to an unconstrained value. The translated schema is always open: keys that the
//! backend did not declare are accepted and forwarded untouched.

use std::collections::{BTreeMap, HashMap};

use serde_json::{json, Map, Value};
use thiserror::Error;

/// Validated type of a single declared property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Number,
    /// A number without a fractional part.
    Integer,
    Boolean,
    /// A sequence of unconstrained elements.
    Array,
    /// An open mapping accepting unknown keys.
    Object,
    /// Unknown or absent declared kind; any value is accepted.
    Any,
}

impl FieldKind {
    /// Map a declared `type` to its validated kind.
    pub fn from_declared(declared: Option<&Value>) -> Self {
        match declared.and_then(Value::as_str) {
            Some("string") => FieldKind::String,
            Some("number") => FieldKind::Number,
            Some("integer") => FieldKind::Integer,
            Some("boolean") => FieldKind::Boolean,
            Some("array") => FieldKind::Array,
            Some("object") => FieldKind::Object,
            _ => FieldKind::Any,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FieldKind::String => "string",
            FieldKind::Number => "number",
            FieldKind::Integer => "integer",
            FieldKind::Boolean => "boolean",
            FieldKind::Array => "array",
            FieldKind::Object => "object",
            FieldKind::Any => "any",
        }
    }

    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            FieldKind::String => value.is_string(),
            FieldKind::Number => value.is_number(),
            FieldKind::Integer => match value {
                Value::Number(n) => {
                    n.is_i64() || n.is_u64() || n.as_f64().map_or(false, |f| f.fract() == 0.0)
                }
                _ => false,
            },
            FieldKind::Boolean => value.is_boolean(),
            FieldKind::Array => value.is_array(),
            FieldKind::Object => value.is_object(),
            FieldKind::Any => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSchema {
    pub kind: FieldKind,
    pub required: bool,
    /// Informational only; never affects validation.
    pub description: Option<String>,
}

/// Argument validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaViolation {
    #[error("missing required field '{0}'")]
    MissingField(String),
    #[error("field '{field}' must be {expected}, got {found}")]
    WrongType {
        field: String,
        expected: &'static str,
        found: &'static str,
    },
}

/// Strict, open validation schema derived from a backend's input schema.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidatedSchema {
    fields: BTreeMap<String, FieldSchema>,
}

/// Translate a backend input schema.
///
/// Without a `properties` member the result accepts any mapping. Otherwise every
/// property is mapped through [`FieldKind::from_declared`] and is optional unless
/// listed in `required`.
pub fn translate(input_schema: &Value) -> ValidatedSchema {
    let Some(properties) = input_schema.get("properties").and_then(Value::as_object) else {
        return ValidatedSchema::default();
    };

    let required: Vec<&str> = input_schema
        .get("required")
        .and_then(Value::as_array)
        .map(|names| names.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    let fields = properties
        .iter()
        .map(|(name, prop)| {
            let field = FieldSchema {
                kind: FieldKind::from_declared(prop.get("type")),
                required: required.contains(&name.as_str()),
                description: prop
                    .get("description")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            };
            (name.clone(), field)
        })
        .collect();

    ValidatedSchema { fields }
}

impl ValidatedSchema {
    /// True when no property is declared, i.e. any mapping passes.
    pub fn accepts_any(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn field(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.get(name)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&String, &FieldSchema)> {
        self.fields.iter()
    }

    /// Builder used for locally defined tools.
    pub fn with_field(
        mut self,
        name: impl Into<String>,
        kind: FieldKind,
        required: bool,
        description: Option<&str>,
    ) -> Self {
        self.fields.insert(
            name.into(),
            FieldSchema {
                kind,
                required,
                description: description.map(str::to_string),
            },
        );
        self
    }

    /// Check arguments. Undeclared keys always pass.
    pub fn validate(&self, args: &HashMap<String, Value>) -> Result<(), SchemaViolation> {
        for (name, field) in &self.fields {
            match args.get(name) {
                // Unconstrained fields also accept absence.
                None if field.required && field.kind != FieldKind::Any => {
                    return Err(SchemaViolation::MissingField(name.clone()));
                }
                None => {}
                Some(value) if !field.kind.accepts(value) => {
                    return Err(SchemaViolation::WrongType {
                        field: name.clone(),
                        expected: field.kind.as_str(),
                        found: json_type_name(value),
                    });
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// Render back to a JSON Schema object for advertisement to hub clients.
    pub fn to_json_schema(&self) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();

        for (name, field) in &self.fields {
            let mut prop = Map::new();
            match field.kind {
                FieldKind::Any => {}
                FieldKind::Array => {
                    prop.insert("type".into(), json!("array"));
                    prop.insert("items".into(), json!({}));
                }
                FieldKind::Object => {
                    prop.insert("type".into(), json!("object"));
                    prop.insert("additionalProperties".into(), json!(true));
                }
                kind => {
                    prop.insert("type".into(), json!(kind.as_str()));
                }
            }
            if let Some(description) = &field.description {
                prop.insert("description".into(), Value::String(description.clone()));
            }
            if field.required {
                required.push(Value::String(name.clone()));
            }
            properties.insert(name.clone(), Value::Object(prop));
        }

        let mut schema = Map::new();
        schema.insert("type".into(), Value::String("object".into()));
        schema.insert("properties".into(), Value::Object(properties));
        if !required.is_empty() {
            schema.insert("required".into(), Value::Array(required));
        }
        schema.insert("additionalProperties".into(), Value::Bool(true));
        Value::Object(schema)
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
