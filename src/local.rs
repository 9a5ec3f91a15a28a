//! Tools answered by the hub itself rather than a backend.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};

use crate::errors::HubResult;
use crate::repository::{FnHandler, HubRegistry, ProxyEntry};
use crate::tools::{FieldKind, ToolAnnotations, ValidatedSchema};

pub const ECHO_TOOL: &str = "echo";

/// `echo { text }` answers with `text` as a single text content item.
pub fn echo_tool() -> ProxyEntry {
    let schema = ValidatedSchema::default().with_field(
        "text",
        FieldKind::String,
        true,
        Some("Text to echo back"),
    );
    let mut annotations = ToolAnnotations::new();
    annotations.insert("readOnlyHint".into(), Value::Bool(true));

    ProxyEntry::new(
        ECHO_TOOL,
        schema,
        Arc::new(FnHandler(|args: HashMap<String, Value>| async move {
            let text = args.get("text").cloned().unwrap_or_else(|| json!(""));
            json!({ "content": [{ "type": "text", "text": text }] })
        })),
    )
    .with_description("Echo the provided text")
    .with_annotations(annotations)
}

pub async fn register_local_tools(registry: &dyn HubRegistry) -> HubResult<()> {
    registry.register(echo_tool()).await
}
