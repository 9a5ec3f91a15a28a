pub mod http;
pub mod registry;
pub mod rpc;
pub mod stdio;

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::errors::HubResult;
use crate::tools::ToolDescriptor;

pub use registry::{Connector, ConnectorRegistry};

/// A live connection to one backend, owned by its bridge and shared with its proxy handlers.
#[async_trait]
pub trait BackendSession: Send + Sync {
    /// Namespace prefix of the backend this session talks to.
    fn prefix(&self) -> &str;

    /// Full tool catalog, following pagination until exhausted.
    async fn list_tools(&self) -> HubResult<Vec<ToolDescriptor>>;

    /// Invoke `name` with `args` forwarded unmodified; the raw result is returned as-is.
    async fn call_tool(&self, name: &str, args: HashMap<String, Value>) -> HubResult<Value>;
}
