//! Turns one backend session's catalog into proxy entries on the hub registry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::time::timeout;
use tracing::{info, warn};

use crate::config::BridgeTimeouts;
use crate::errors::{HubError, HubResult};
use crate::repository::{HubRegistry, ProxyEntry, ToolHandler};
use crate::tools::{translate, ToolAnnotations, ToolDescriptor};
use crate::transports::BackendSession;

pub const QUALIFIED_NAME_SEPARATOR: char = '/';

/// `prefix/tool`, the name a bridged tool is exposed under.
pub fn qualified_name(prefix: &str, tool: &str) -> String {
    format!("{}{}{}", prefix, QUALIFIED_NAME_SEPARATOR, tool)
}

/// The payload a failed call resolves to. Carries a human-readable message, never a fault.
pub fn tool_error_payload(err: &HubError) -> Value {
    let message = err.to_string();
    json!({
        "content": [{ "type": "text", "text": message }],
        "isError": true,
        "message": message,
        "kind": err.kind(),
    })
}

/// Backend annotations plus `description` (falling back to the tool name) and `openWorldHint`.
pub fn bridged_annotations(tool: &ToolDescriptor) -> ToolAnnotations {
    let mut annotations = tool.annotations.clone().unwrap_or_default();
    let description = tool.description.clone().unwrap_or_else(|| tool.name.clone());
    annotations.insert("description".into(), Value::String(description));
    annotations.insert("openWorldHint".into(), Value::Bool(true));
    annotations
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BridgeSummary {
    pub registered: usize,
    /// Qualified names refused because another entry already held them.
    pub rejected: Vec<String>,
}

/// Forwards calls for one backend tool and contains every failure.
pub struct ProxyHandler {
    session: Arc<dyn BackendSession>,
    tool: String,
    qualified_name: String,
    invoke_timeout: Duration,
}

impl ProxyHandler {
    pub fn new(
        session: Arc<dyn BackendSession>,
        prefix: &str,
        tool: &str,
        invoke_timeout: Duration,
    ) -> Self {
        Self {
            session,
            tool: tool.to_string(),
            qualified_name: qualified_name(prefix, tool),
            invoke_timeout,
        }
    }
}

#[async_trait]
impl ToolHandler for ProxyHandler {
    async fn call(&self, args: HashMap<String, Value>) -> Value {
        let outcome = match timeout(self.invoke_timeout, self.session.call_tool(&self.tool, args)).await {
            Ok(result) => result,
            Err(_) => Err(HubError::InvocationTimeout {
                tool: self.qualified_name.clone(),
                timeout: self.invoke_timeout,
            }),
        };

        match outcome {
            Ok(result) => result,
            Err(err) => {
                warn!(tool = %self.qualified_name, kind = err.kind(), error = %err, "tool call failed");
                tool_error_payload(&err)
            }
        }
    }
}

/// Build the proxy entry for one backend tool.
pub fn proxy_entry(
    session: Arc<dyn BackendSession>,
    prefix: &str,
    tool: &ToolDescriptor,
    invoke_timeout: Duration,
) -> ProxyEntry {
    let handler = ProxyHandler::new(session, prefix, &tool.name, invoke_timeout);
    let mut entry = ProxyEntry::new(
        qualified_name(prefix, &tool.name),
        translate(&tool.input_schema),
        Arc::new(handler),
    )
    .with_annotations(bridged_annotations(tool));
    entry.description = tool.description.clone();
    entry
}

/// Register every tool of `session` under `prefix`.
///
/// Fails with `Catalog` when the listing fails or exceeds `timeouts.connect`; nothing is
/// registered in that case. Name collisions are skipped and reported in the summary.
pub async fn try_bridge(
    registry: &dyn HubRegistry,
    session: Arc<dyn BackendSession>,
    prefix: &str,
    timeouts: &BridgeTimeouts,
) -> HubResult<BridgeSummary> {
    let catalog_err = |reason: String| HubError::Catalog {
        prefix: prefix.to_string(),
        reason,
    };
    let tools = match timeout(timeouts.connect, session.list_tools()).await {
        Ok(Ok(tools)) => tools,
        Ok(Err(err)) => return Err(catalog_err(err.to_string())),
        Err(_) => {
            return Err(catalog_err(format!(
                "no catalog within {}s",
                timeouts.connect.as_secs_f64()
            )))
        }
    };

    let mut summary = BridgeSummary::default();
    for tool in &tools {
        let entry = proxy_entry(session.clone(), prefix, tool, timeouts.invoke);
        let name = entry.qualified_name.clone();
        match registry.register(entry).await {
            Ok(()) => summary.registered += 1,
            Err(err) => {
                warn!(prefix = %prefix, tool = %name, error = %err, "tool not registered");
                summary.rejected.push(name);
            }
        }
    }

    info!(
        prefix = %prefix,
        registered = summary.registered,
        rejected = summary.rejected.len(),
        "bridged backend"
    );
    Ok(summary)
}

/// Register every tool of `session` under `prefix`, returning how many were registered.
/// A failed listing is logged and yields zero.
pub async fn bridge(
    registry: &dyn HubRegistry,
    session: Arc<dyn BackendSession>,
    prefix: &str,
    timeouts: &BridgeTimeouts,
) -> usize {
    match try_bridge(registry, session, prefix, timeouts).await {
        Ok(summary) => summary.registered,
        Err(err) => {
            warn!(prefix = %prefix, error = %err, "bridging failed, no tools registered");
            0
        }
    }
}
