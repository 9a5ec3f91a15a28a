//! JSON-RPC envelopes and the protocol session shared by every transport.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::errors::{HubError, HubResult};
use crate::tools::ToolDescriptor;
use crate::transports::BackendSession;

/// Protocol revisions the hub can talk, newest first.
pub const SUPPORTED_PROTOCOL_VERSIONS: [&str; 3] = ["2025-06-18", "2025-03-26", "2024-11-05"];
pub const LATEST_PROTOCOL_VERSION: &str = SUPPORTED_PROTOCOL_VERSIONS[0];

pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const PARSE_ERROR: i64 = -32700;

#[derive(Debug, Serialize)]
pub struct RpcRequest<'a> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'a str,
    pub params: &'a Value,
}

impl<'a> RpcRequest<'a> {
    pub fn new(id: u64, method: &'a str, params: &'a Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method,
            params,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RpcNotification<'a> {
    pub jsonrpc: &'static str,
    pub method: &'a str,
    pub params: &'a Value,
}

impl<'a> RpcNotification<'a> {
    pub fn new(method: &'a str, params: &'a Value) -> Self {
        Self {
            jsonrpc: "2.0",
            method,
            params,
        }
    }
}

/// Build a successful response envelope.
pub fn success_response(id: Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

/// Build an error response envelope.
pub fn error_response(id: Value, code: i64, message: impl Into<String>) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message.into() }
    })
}

/// Unwrap a response envelope into its `result`, or fail with the backend's error.
pub fn into_result(response: Value) -> HubResult<Value> {
    if let Some(error) = response.get("error") {
        let code = error.get("code").and_then(Value::as_i64).unwrap_or(0);
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        return Err(HubError::Backend(format!("{} (code {})", message, code)));
    }

    match response {
        Value::Object(mut map) => map
            .remove("result")
            .ok_or_else(|| HubError::Backend("response carries neither result nor error".into())),
        _ => Err(HubError::Backend("response is not an object".into())),
    }
}

/// Byte-level carrier of JSON-RPC messages to one backend.
#[async_trait]
pub trait RpcChannel: Send + Sync {
    /// Send a request and wait for the response carrying the same id, unwrapped via [`into_result`].
    async fn request(&self, method: &str, params: Value) -> HubResult<Value>;

    /// Fire-and-forget notification.
    async fn notify(&self, method: &str, params: Value) -> HubResult<()>;

    /// Called once the handshake settled on `version`.
    async fn negotiated(&self, _version: &str) {}
}

/// A protocol session: handshake done, catalog fetched at most once.
pub struct McpSession<C> {
    prefix: String,
    channel: C,
    protocol_version: String,
    catalog: OnceCell<Vec<ToolDescriptor>>,
}

impl<C: RpcChannel> McpSession<C> {
    /// Run the `initialize` handshake over `channel`. Any failure is a connect error.
    pub async fn handshake(prefix: impl Into<String>, channel: C) -> HubResult<Self> {
        let prefix = prefix.into();
        let connect_err = |reason: String| HubError::Connect {
            prefix: prefix.clone(),
            reason,
        };

        let params = json!({
            "protocolVersion": LATEST_PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": format!("bridge-{}", prefix),
                "version": env!("CARGO_PKG_VERSION"),
            }
        });
        let reply = channel
            .request("initialize", params)
            .await
            .map_err(|e| connect_err(e.to_string()))?;

        let version = reply
            .get("protocolVersion")
            .and_then(Value::as_str)
            .ok_or_else(|| connect_err("initialize reply has no protocolVersion".into()))?;
        if !SUPPORTED_PROTOCOL_VERSIONS.contains(&version) {
            return Err(connect_err(format!(
                "protocol mismatch: backend speaks {}",
                version
            )));
        }
        let version = version.to_string();
        channel.negotiated(&version).await;

        channel
            .notify("notifications/initialized", json!({}))
            .await
            .map_err(|e| connect_err(e.to_string()))?;

        debug!(prefix = %prefix, protocol_version = %version, "handshake complete");
        Ok(Self {
            prefix,
            channel,
            protocol_version: version,
            catalog: OnceCell::new(),
        })
    }

    pub fn protocol_version(&self) -> &str {
        &self.protocol_version
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    async fn fetch_catalog(&self) -> HubResult<Vec<ToolDescriptor>> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        let mut seen = HashSet::new();

        loop {
            let params = match &cursor {
                Some(cursor) => json!({ "cursor": cursor }),
                None => json!({}),
            };
            let page = self.channel.request("tools/list", params).await?;

            let entries = page
                .get("tools")
                .and_then(Value::as_array)
                .ok_or_else(|| HubError::Backend("tools/list reply has no tools array".into()))?;
            for entry in entries {
                match serde_json::from_value::<ToolDescriptor>(entry.clone()) {
                    Ok(tool) => tools.push(tool),
                    Err(err) => warn!(prefix = %self.prefix, error = %err, "skipping malformed tool entry"),
                }
            }

            let next = page
                .get("nextCursor")
                .and_then(Value::as_str)
                .filter(|c| !c.is_empty())
                .map(str::to_string);
            match next {
                Some(next) if !seen.insert(next.clone()) => {
                    return Err(HubError::Backend(format!(
                        "tools/list returned cursor {} twice",
                        next
                    )));
                }
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        Ok(tools)
    }
}

#[async_trait]
impl<C: RpcChannel> BackendSession for McpSession<C> {
    fn prefix(&self) -> &str {
        &self.prefix
    }

    async fn list_tools(&self) -> HubResult<Vec<ToolDescriptor>> {
        self.catalog
            .get_or_try_init(|| self.fetch_catalog())
            .await
            .map(Clone::clone)
    }

    async fn call_tool(&self, name: &str, args: HashMap<String, Value>) -> HubResult<Value> {
        let params = json!({ "name": name, "arguments": args });
        self.channel.request("tools/call", params).await
    }
}
