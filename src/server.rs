//! Hub-facing side: newline-delimited JSON-RPC over any async byte stream (stdin/stdout in the binary).

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::bridge::tool_error_payload;
use crate::errors::{HubError, HubResult};
use crate::repository::HubRegistry;
use crate::transports::rpc::{
    error_response, success_response, INVALID_PARAMS, LATEST_PROTOCOL_VERSION, METHOD_NOT_FOUND,
    PARSE_ERROR, SUPPORTED_PROTOCOL_VERSIONS,
};

pub const SERVER_NAME: &str = "mcp-hub";
const INVALID_REQUEST: i64 = -32600;
const INTERNAL_ERROR: i64 = -32603;

/// Serve `registry` until `reader` reaches EOF and every in-flight request has been answered.
///
/// Each request runs on its own task, so a slow tool never holds up other requests.
pub async fn serve<R, W>(registry: Arc<dyn HubRegistry>, reader: R, writer: W) -> HubResult<()>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel::<Value>();
    let writer_task = tokio::spawn(write_messages(writer, rx));

    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line).await? == 0 {
            break;
        }
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }

        // Rejects invalid UTF-8 as well as malformed JSON.
        let message: Value = match serde_json::from_slice(&line) {
            Ok(message) => message,
            Err(err) => {
                let _ = tx.send(error_response(Value::Null, PARSE_ERROR, format!("parse error: {}", err)));
                continue;
            }
        };

        let id = message.get("id").cloned();
        let method = message.get("method").and_then(Value::as_str).map(str::to_string);
        match (method, id) {
            (Some(method), Some(id)) => {
                let registry = registry.clone();
                let tx = tx.clone();
                let params = message.get("params").cloned().unwrap_or(Value::Null);
                tokio::spawn(async move {
                    let reply = handle_request(registry.as_ref(), id, &method, params).await;
                    let _ = tx.send(reply);
                });
            }
            (Some(method), None) => debug!(method = %method, "client notification"),
            (None, Some(id)) if message.get("result").is_some() || message.get("error").is_some() => {
                debug!(%id, "ignoring response from client")
            }
            (None, id) => {
                let _ = tx.send(error_response(
                    id.unwrap_or(Value::Null),
                    INVALID_REQUEST,
                    "invalid request",
                ));
            }
        }
    }

    drop(tx);
    writer_task
        .await
        .map_err(|e| HubError::Transport(format!("writer task failed: {}", e)))?
}

async fn write_messages<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<Value>) -> HubResult<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = rx.recv().await {
        let mut line = serde_json::to_vec(&message)?;
        line.push(b'\n');
        writer.write_all(&line).await?;
        writer.flush().await?;
    }
    Ok(())
}

async fn handle_request(registry: &dyn HubRegistry, id: Value, method: &str, params: Value) -> Value {
    match method {
        "initialize" => {
            let requested = params.get("protocolVersion").and_then(Value::as_str);
            let version = requested
                .filter(|v| SUPPORTED_PROTOCOL_VERSIONS.contains(v))
                .unwrap_or(LATEST_PROTOCOL_VERSION);
            success_response(
                id,
                json!({
                    "protocolVersion": version,
                    "capabilities": { "tools": { "listChanged": false } },
                    "serverInfo": { "name": SERVER_NAME, "version": env!("CARGO_PKG_VERSION") }
                }),
            )
        }
        "ping" => success_response(id, json!({})),
        "tools/list" => {
            let tools = registry.list().await;
            success_response(id, json!({ "tools": tools }))
        }
        "tools/call" => call_tool(registry, id, params).await,
        other => error_response(id, METHOD_NOT_FOUND, format!("method not found: {}", other)),
    }
}

async fn call_tool(registry: &dyn HubRegistry, id: Value, params: Value) -> Value {
    let Some(name) = params.get("name").and_then(Value::as_str) else {
        return error_response(id, INVALID_PARAMS, "tools/call requires a string 'name'");
    };
    let args: HashMap<String, Value> = match params.get("arguments") {
        None | Some(Value::Null) => HashMap::new(),
        Some(Value::Object(map)) => map.clone().into_iter().collect(),
        Some(_) => {
            return error_response(id, INVALID_PARAMS, "tools/call 'arguments' must be an object")
        }
    };

    match registry.dispatch(name, args).await {
        Ok(result) => success_response(id, result),
        // Backend failures are reported inside the tool result.
        Err(err) if err.is_backend_local() => {
            warn!(tool = %name, kind = err.kind(), error = %err, "tool call failed");
            success_response(id, tool_error_payload(&err))
        }
        Err(err @ (HubError::UnknownTool(_) | HubError::InvalidArguments { .. })) => {
            error_response(id, INVALID_PARAMS, err.to_string())
        }
        Err(err) => {
            error!(tool = %name, kind = err.kind(), error = %err, "dispatch failed");
            error_response(id, INTERNAL_ERROR, err.to_string())
        }
    }
}
