// Streamable HTTP transport for networked backends.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::{header, Client, Response, StatusCode};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;

use crate::auth::{resolve_credential, Credential};
use crate::config::{EnvSnapshot, NetworkBackend};
use crate::errors::{HubError, HubResult};
use crate::transports::rpc::{into_result, McpSession, RpcChannel, RpcNotification, RpcRequest};

pub const SESSION_ID_HEADER: &str = "mcp-session-id";
pub const PROTOCOL_VERSION_HEADER: &str = "mcp-protocol-version";
const ACCEPT_BOTH: &str = "application/json, text/event-stream";

pub type HttpSession = McpSession<HttpChannel>;

/// Open a session to a networked backend.
///
/// Without an explicit `credential` one is resolved from `env`; when present it is sent as a
/// bearer token on every request.
pub async fn connect(
    prefix: &str,
    backend: &NetworkBackend,
    credential: Option<Credential>,
    env: &EnvSnapshot,
) -> HubResult<HttpSession> {
    let credential = credential.or_else(|| resolve_credential(prefix, &backend.credential, env));
    let channel = HttpChannel::new(prefix, backend, credential)?;
    McpSession::handshake(prefix, channel).await
}

pub struct HttpChannel {
    client: Client,
    prefix: String,
    url: String,
    headers: HashMap<String, String>,
    credential: Option<Credential>,
    session_id: RwLock<Option<String>>,
    protocol_version: RwLock<Option<String>>,
    next_id: AtomicU64,
}

impl HttpChannel {
    pub fn new(
        prefix: &str,
        backend: &NetworkBackend,
        credential: Option<Credential>,
    ) -> HubResult<Self> {
        let client = Client::builder().build().map_err(|e| HubError::Connect {
            prefix: prefix.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            client,
            prefix: prefix.to_string(),
            url: backend.url.clone(),
            headers: backend.headers.clone(),
            credential,
            session_id: RwLock::new(None),
            protocol_version: RwLock::new(None),
            next_id: AtomicU64::new(1),
        })
    }

    pub async fn session_id(&self) -> Option<String> {
        self.session_id.read().await.clone()
    }

    async fn post<B: Serialize + ?Sized>(&self, body: &B) -> HubResult<Response> {
        let mut req = self
            .client
            .post(&self.url)
            .header(header::ACCEPT, ACCEPT_BOTH)
            .json(body);
        for (k, v) in &self.headers {
            req = req.header(k, v);
        }
        if let Some(credential) = &self.credential {
            req = req.bearer_auth(credential.expose());
        }

        let session_id = self.session_id.read().await.clone();
        let has_session = session_id.is_some();
        if let Some(id) = session_id {
            req = req.header(SESSION_ID_HEADER, id);
        }
        if let Some(version) = self.protocol_version.read().await.as_deref() {
            req = req.header(PROTOCOL_VERSION_HEADER, version);
        }

        let response = req.send().await?;
        if response.status() == StatusCode::NOT_FOUND && has_session {
            debug!(prefix = %self.prefix, "backend session expired");
            return Err(HubError::TransportClosed(self.prefix.clone()));
        }
        Ok(response)
    }

    async fn remember_session(&self, response: &Response) {
        let id = response
            .headers()
            .get(SESSION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        if let Some(id) = id {
            *self.session_id.write().await = Some(id);
        }
    }

    /// Scan an SSE reply for the response carrying `id`; other events are ignored.
    async fn read_event_stream(&self, response: Response, id: u64) -> HubResult<Value> {
        let mut events = response.bytes_stream().eventsource();
        while let Some(event) = events.next().await {
            let event = event.map_err(|e| HubError::Transport(format!("SSE stream error: {}", e)))?;
            if event.data.trim().is_empty() {
                continue;
            }
            let message: Value = match serde_json::from_str(&event.data) {
                Ok(message) => message,
                Err(err) => {
                    debug!(prefix = %self.prefix, error = %err, "ignoring non-JSON SSE event");
                    continue;
                }
            };
            if message.get("id").and_then(Value::as_u64) == Some(id)
                && message.get("method").is_none()
            {
                return into_result(message);
            }
        }
        Err(HubError::Backend(format!(
            "event stream ended without a response to request {}",
            id
        )))
    }
}

fn is_event_stream(response: &Response) -> bool {
    response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map_or(false, |ct| ct.starts_with("text/event-stream"))
}

#[async_trait]
impl RpcChannel for HttpChannel {
    async fn request(&self, method: &str, params: Value) -> HubResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let response = self.post(&RpcRequest::new(id, method, &params)).await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(HubError::Transport(format!(
                "{} answered {}: {}",
                method,
                status,
                body.trim()
            )));
        }
        if method == "initialize" {
            self.remember_session(&response).await;
        }

        if is_event_stream(&response) {
            self.read_event_stream(response, id).await
        } else {
            let message: Value = response.json().await?;
            into_result(message)
        }
    }

    async fn notify(&self, method: &str, params: Value) -> HubResult<()> {
        let response = self.post(&RpcNotification::new(method, &params)).await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(HubError::Transport(format!("{} answered {}", method, status)))
        }
    }

    async fn negotiated(&self, version: &str) {
        *self.protocol_version.write().await = Some(version.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transports::BackendSession;
    use axum::{
        body::Body,
        extract::State,
        http::{HeaderMap, Response as HttpResponse, StatusCode as HttpStatus},
        response::IntoResponse,
        routing::post,
        Json, Router,
    };
    use bytes::Bytes;
    use serde_json::json;
    use std::net::TcpListener;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Seen {
        headers: Arc<Mutex<Vec<(String, HeaderMap)>>>,
    }

    async fn mcp_endpoint(
        State(seen): State<Seen>,
        headers: HeaderMap,
        Json(message): Json<Value>,
    ) -> axum::response::Response {
        let method = message["method"].as_str().unwrap_or_default().to_string();
        seen.headers
            .lock()
            .unwrap()
            .push((method.clone(), headers.clone()));
        let id = message.get("id").cloned().unwrap_or(Value::Null);

        match method.as_str() {
            "initialize" => (
                [(SESSION_ID_HEADER, "sess-42")],
                Json(json!({"jsonrpc": "2.0", "id": id, "result": {
                    "protocolVersion": "2025-06-18",
                    "capabilities": {"tools": {}},
                    "serverInfo": {"name": "fake", "version": "1"}
                }})),
            )
                .into_response(),
            "notifications/initialized" => HttpStatus::ACCEPTED.into_response(),
            "tools/list" => {
                let page = match message["params"].get("cursor").and_then(Value::as_str) {
                    None => json!({"tools": [{"name": "search", "inputSchema": {
                        "type": "object",
                        "properties": {"query": {"type": "string"}},
                        "required": ["query"]
                    }}], "nextCursor": "page-2"}),
                    Some(_) => json!({"tools": [{"name": "news"}]}),
                };
                Json(json!({"jsonrpc": "2.0", "id": id, "result": page})).into_response()
            }
            "tools/call" => {
                let query = message["params"]["arguments"]["query"].clone();
                let body = format!(
                    "event: message\ndata: {}\n\ndata: {}\n\n",
                    json!({"jsonrpc": "2.0", "method": "notifications/progress", "params": {}}),
                    json!({"jsonrpc": "2.0", "id": id, "result": {
                        "content": [{"type": "text", "text": format!("results for {}", query.as_str().unwrap_or(""))}]
                    }})
                );
                let chunks: Vec<Result<Bytes, std::convert::Infallible>> =
                    vec![Ok(Bytes::from(body))];
                HttpResponse::builder()
                    .header("content-type", "text/event-stream")
                    .body(Body::wrap_stream(tokio_stream::iter(chunks)))
                    .unwrap()
                    .into_response()
            }
            _ => Json(json!({"jsonrpc": "2.0", "id": id, "error": {
                "code": -32601, "message": "method not found"
            }}))
            .into_response(),
        }
    }

    fn spawn_server(router: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::Server::from_tcp(listener)
                .unwrap()
                .serve(router.into_make_service())
                .await
                .unwrap();
        });
        format!("http://{}/mcp", addr)
    }

    fn backend(url: String) -> NetworkBackend {
        let mut headers = HashMap::new();
        headers.insert("X-Client".to_string(), "hub-test".to_string());
        NetworkBackend {
            url,
            headers,
            credential: Default::default(),
        }
    }

    #[tokio::test]
    async fn session_lists_and_calls_over_streamable_http() {
        let seen = Seen::default();
        let app = Router::new()
            .route("/mcp", post(mcp_endpoint))
            .with_state(seen.clone());
        let url = spawn_server(app);

        let env = EnvSnapshot::default().with_var("BRAVE_API_KEY", "from-env");
        let session = connect("brave", &backend(url), None, &env)
            .await
            .expect("connect");
        assert_eq!(session.protocol_version(), "2025-06-18");
        assert_eq!(session.channel().session_id().await.as_deref(), Some("sess-42"));

        let tools = session.list_tools().await.expect("list");
        let names: Vec<_> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["search", "news"]);

        let mut args = HashMap::new();
        args.insert("query".to_string(), json!("rust"));
        let result = session.call_tool("search", args).await.expect("call");
        assert_eq!(result["content"][0]["text"], "results for rust");

        let seen = seen.headers.lock().unwrap().clone();
        let (first_method, first) = &seen[0];
        assert_eq!(first_method, "initialize");
        assert!(first.get(SESSION_ID_HEADER).is_none());
        for (_, headers) in &seen {
            assert_eq!(headers["authorization"], "Bearer from-env");
            assert_eq!(headers["x-client"], "hub-test");
        }
        let (_, last) = seen.last().unwrap();
        assert_eq!(last[SESSION_ID_HEADER], "sess-42");
        assert_eq!(last[PROTOCOL_VERSION_HEADER], "2025-06-18");
    }

    #[tokio::test]
    async fn explicit_credential_wins_and_absent_credential_sends_no_header() {
        let seen = Seen::default();
        let app = Router::new()
            .route("/mcp", post(mcp_endpoint))
            .with_state(seen.clone());
        let url = spawn_server(app);
        let env = EnvSnapshot::default().with_var("BRAVE_API_KEY", "from-env");

        connect("brave", &backend(url.clone()), Some(Credential::new("explicit")), &env)
            .await
            .expect("connect");
        connect("other", &backend(url), None, &env)
            .await
            .expect("connect");

        let seen = seen.headers.lock().unwrap().clone();
        assert_eq!(seen[0].1["authorization"], "Bearer explicit");
        let other_init = seen
            .iter()
            .filter(|(m, _)| m == "initialize")
            .nth(1)
            .unwrap();
        assert!(other_init.1.get("authorization").is_none());
    }

    #[tokio::test]
    async fn expired_session_maps_to_transport_closed() {
        async fn expiring(headers: HeaderMap, Json(message): Json<Value>) -> axum::response::Response {
            if headers.get(SESSION_ID_HEADER).is_some()
                && message["method"] == "tools/call"
            {
                return HttpStatus::NOT_FOUND.into_response();
            }
            if message["method"] == "initialize" {
                return (
                    [(SESSION_ID_HEADER, "short-lived")],
                    Json(json!({"jsonrpc": "2.0", "id": message["id"], "result": {
                        "protocolVersion": "2024-11-05", "capabilities": {}
                    }})),
                )
                    .into_response();
            }
            HttpStatus::ACCEPTED.into_response()
        }

        let url = spawn_server(Router::new().route("/mcp", post(expiring)));
        let session = connect("gone", &backend(url), None, &EnvSnapshot::default())
            .await
            .expect("connect");
        let err = session.call_tool("anything", HashMap::new()).await.unwrap_err();
        assert!(matches!(err, HubError::TransportClosed(ref p) if p == "gone"));
    }

    #[tokio::test]
    async fn unreachable_backend_fails_to_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/mcp", listener.local_addr().unwrap());
        drop(listener);

        let err = connect("down", &backend(url), None, &EnvSnapshot::default())
            .await
            .err()
            .expect("must fail");
        assert!(matches!(err, HubError::Connect { ref prefix, .. } if prefix == "down"));
    }

    #[tokio::test]
    async fn non_success_handshake_fails_to_connect() {
        async fn reject() -> HttpStatus {
            HttpStatus::UNAUTHORIZED
        }
        let url = spawn_server(Router::new().route("/mcp", post(reject)));
        let err = connect("locked", &backend(url), None, &EnvSnapshot::default())
            .await
            .err()
            .expect("must fail");
        assert_eq!(err.kind(), "connect_error");
        assert!(err.to_string().contains("401"));
    }
}
