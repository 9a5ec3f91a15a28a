pub mod in_memory;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::errors::HubResult;
use crate::tools::{ToolAnnotations, ValidatedSchema};

pub use in_memory::InMemoryHubRegistry;

/// Invoked with validated arguments. Never fails: failures are encoded in the returned value.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, args: HashMap<String, Value>) -> Value;
}

/// Adapts an async closure into a [`ToolHandler`].
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> ToolHandler for FnHandler<F>
where
    F: Fn(HashMap<String, Value>) -> Fut + Send + Sync,
    Fut: Future<Output = Value> + Send + 'static,
{
    async fn call(&self, args: HashMap<String, Value>) -> Value {
        (self.0)(args).await
    }
}

/// A registered tool: what the hub advertises under `qualified_name` and who answers it.
#[derive(Clone)]
pub struct ProxyEntry {
    pub qualified_name: String,
    pub schema: ValidatedSchema,
    pub description: Option<String>,
    pub annotations: ToolAnnotations,
    pub handler: Arc<dyn ToolHandler>,
}

impl ProxyEntry {
    pub fn new(
        qualified_name: impl Into<String>,
        schema: ValidatedSchema,
        handler: Arc<dyn ToolHandler>,
    ) -> Self {
        Self {
            qualified_name: qualified_name.into(),
            schema,
            description: None,
            annotations: ToolAnnotations::new(),
            handler,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_annotations(mut self, annotations: ToolAnnotations) -> Self {
        self.annotations = annotations;
        self
    }

    pub fn listing(&self) -> ToolListing {
        ToolListing {
            name: self.qualified_name.clone(),
            description: self.description.clone(),
            input_schema: self.schema.to_json_schema(),
            annotations: self.annotations.clone(),
        }
    }
}

impl std::fmt::Debug for ProxyEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyEntry")
            .field("qualified_name", &self.qualified_name)
            .field("schema", &self.schema)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

/// A tool as advertised to hub clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolListing {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
    #[serde(skip_serializing_if = "serde_json::Map::is_empty")]
    pub annotations: ToolAnnotations,
}

/// Name to handler mapping the hub dispatches against.
#[async_trait]
pub trait HubRegistry: Send + Sync {
    /// Add an entry. A name that is already taken fails with `DuplicateTool`.
    async fn register(&self, entry: ProxyEntry) -> HubResult<()>;

    /// Validate `args` against the entry's schema and run its handler.
    async fn dispatch(&self, qualified_name: &str, args: HashMap<String, Value>) -> HubResult<Value>;

    /// Every entry, sorted by qualified name.
    async fn list(&self) -> Vec<ToolListing>;

    async fn contains(&self, qualified_name: &str) -> bool;

    async fn len(&self) -> usize;
}
