pub mod schema;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use schema::{translate, FieldKind, FieldSchema, SchemaViolation, ValidatedSchema};

/// Free-form tool hints (`readOnlyHint`, `openWorldHint`, ...), passed through as reported.
pub type ToolAnnotations = Map<String, Value>;

/// A tool as reported by a backend's catalog. Immutable once fetched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(rename = "inputSchema", alias = "input_schema", default = "empty_object")]
    pub input_schema: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<ToolAnnotations>,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>, input_schema: Value) -> Self {
        Self {
            name: name.into(),
            input_schema,
            description: None,
            annotations: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}
