// Process transport: a child speaking newline-delimited JSON-RPC over stdin/stdout.
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::auth::{resolve_credential, Credential};
use crate::config::{EnvSnapshot, ProcessBackend};
use crate::errors::{HubError, HubResult};
use crate::transports::rpc::{
    error_response, into_result, success_response, McpSession, RpcChannel, RpcNotification,
    RpcRequest, METHOD_NOT_FOUND,
};

/// Variables a child inherits from the hub. Everything else is withheld.
pub const INHERITED_ENV: [&str; 8] = [
    "PATH",
    "HOME",
    "USERPROFILE",
    "TEMP",
    "TMP",
    "TMPDIR",
    "APPDATA",
    "LOCALAPPDATA",
];

/// Target used for backend diagnostics forwarded verbatim.
pub const BACKEND_LOG_TARGET: &str = "mcp_hub::backend";

pub type StdioSession = McpSession<StdioChannel>;

type Pending = Mutex<HashMap<u64, oneshot::Sender<Value>>>;

/// One line for the child's stdin. `written` reports the outcome to a waiting request.
struct Outgoing {
    line: Vec<u8>,
    written: Option<oneshot::Sender<std::io::Result<()>>>,
}

fn lock(pending: &Pending) -> MutexGuard<'_, HashMap<u64, oneshot::Sender<Value>>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Spawn a process backend and run the handshake over its stdio.
pub async fn spawn(prefix: &str, backend: &ProcessBackend, env: &EnvSnapshot) -> HubResult<StdioSession> {
    let credential = resolve_credential(prefix, &backend.credential, env);
    let var = backend.credential_var(prefix);
    let child_env = build_child_env(env, &var, credential.as_ref());
    let channel = StdioChannel::spawn(prefix, &backend.cmd, &backend.args, child_env)?;
    McpSession::handshake(prefix, channel).await
}

/// The child's complete environment: the inherited allow-list plus exactly one credential variable.
pub fn build_child_env(
    env: &EnvSnapshot,
    credential_var: &str,
    credential: Option<&Credential>,
) -> HashMap<String, String> {
    let mut vars: HashMap<String, String> = INHERITED_ENV
        .iter()
        .filter_map(|name| env.get(name).map(|v| (name.to_string(), v.to_string())))
        .collect();
    vars.insert(
        credential_var.to_string(),
        credential.map(|c| c.expose().to_string()).unwrap_or_default(),
    );
    vars
}

pub struct StdioChannel {
    prefix: String,
    outgoing: mpsc::UnboundedSender<Outgoing>,
    pending: Arc<Pending>,
    closed: Arc<AtomicBool>,
    next_id: AtomicU64,
    // Dropping the channel drops this sender, which tells the monitor to kill the child.
    _shutdown: oneshot::Sender<()>,
}

impl StdioChannel {
    /// Spawn `cmd` with exactly `env` and start the writer, reader, stderr and monitor tasks.
    pub fn spawn(
        prefix: &str,
        cmd: &str,
        args: &[String],
        env: HashMap<String, String>,
    ) -> HubResult<Self> {
        let spawn_err = |reason: String| HubError::Connect {
            prefix: prefix.to_string(),
            reason,
        };

        let mut child = Command::new(cmd)
            .args(args)
            .env_clear()
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_err(format!("failed to spawn '{}': {}", cmd, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| spawn_err("failed to get stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_err("failed to get stdout".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| spawn_err("failed to get stderr".into()))?;

        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let pending: Arc<Pending> = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        tokio::spawn(write_stdin(prefix.to_string(), stdin, outgoing_rx));
        tokio::spawn(read_stdout(
            prefix.to_string(),
            stdout,
            outgoing.clone(),
            Arc::clone(&pending),
            Arc::clone(&closed),
        ));
        tokio::spawn(forward_stderr(prefix.to_string(), stderr));
        tokio::spawn(monitor(prefix.to_string(), child, shutdown_rx));

        Ok(Self {
            prefix: prefix.to_string(),
            outgoing,
            pending,
            closed,
            next_id: AtomicU64::new(1),
            _shutdown: shutdown_tx,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn closed_error(&self) -> HubError {
        HubError::TransportClosed(self.prefix.clone())
    }

    async fn write_line<T: Serialize + Sync>(&self, message: &T) -> HubResult<()> {
        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');
        let (tx, rx) = oneshot::channel();
        self.outgoing
            .send(Outgoing {
                line,
                written: Some(tx),
            })
            .map_err(|_| self.closed_error())?;
        match rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) if !self.is_closed() && e.kind() != std::io::ErrorKind::BrokenPipe => {
                Err(HubError::from(e))
            }
            _ => Err(self.closed_error()),
        }
    }
}

/// Removes a pending entry when the waiting request goes away, e.g. on timeout.
struct PendingGuard<'a> {
    pending: &'a Pending,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(self.pending).remove(&self.id);
    }
}

#[async_trait]
impl RpcChannel for StdioChannel {
    async fn request(&self, method: &str, params: Value) -> HubResult<Value> {
        if self.is_closed() {
            return Err(self.closed_error());
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id, tx);
        let _guard = PendingGuard {
            pending: &self.pending,
            id,
        };
        // The reader may have drained the map just before the insert.
        if self.is_closed() {
            return Err(self.closed_error());
        }

        self.write_line(&RpcRequest::new(id, method, &params)).await?;

        match rx.await {
            Ok(response) => into_result(response),
            Err(_) => Err(self.closed_error()),
        }
    }

    async fn notify(&self, method: &str, params: Value) -> HubResult<()> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        self.write_line(&RpcNotification::new(method, &params)).await
    }
}

/// Read one `\n`-terminated line, replacing invalid UTF-8. `None` at EOF.
async fn read_line_lossy<R>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    if reader.read_until(b'\n', buf).await? == 0 {
        return Ok(None);
    }
    let line = String::from_utf8_lossy(buf);
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}

async fn write_stdin(
    prefix: String,
    mut stdin: ChildStdin,
    mut outgoing: mpsc::UnboundedReceiver<Outgoing>,
) {
    while let Some(Outgoing { line, written }) = outgoing.recv().await {
        let result = async {
            stdin.write_all(&line).await?;
            stdin.flush().await
        }
        .await;
        match written {
            Some(tx) => {
                let _ = tx.send(result);
            }
            None => {
                if let Err(err) = result {
                    debug!(prefix = %prefix, error = %err, "failed to answer backend request");
                }
            }
        }
    }
}

async fn read_stdout(
    prefix: String,
    stdout: ChildStdout,
    outgoing: mpsc::UnboundedSender<Outgoing>,
    pending: Arc<Pending>,
    closed: Arc<AtomicBool>,
) {
    let mut reader = BufReader::new(stdout);
    let mut buf = Vec::new();
    loop {
        match read_line_lossy(&mut reader, &mut buf).await {
            Ok(Some(line)) => handle_line(&prefix, &line, &outgoing, &pending),
            Ok(None) => break,
            Err(err) => {
                warn!(prefix = %prefix, error = %err, "failed to read backend stdout");
                break;
            }
        }
    }

    closed.store(true, Ordering::SeqCst);
    // Dropping the senders wakes every waiter with a closed-transport error.
    lock(&pending).clear();
    debug!(prefix = %prefix, "backend stdout closed");
}

fn handle_line(
    prefix: &str,
    line: &str,
    outgoing: &mpsc::UnboundedSender<Outgoing>,
    pending: &Pending,
) {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return;
    }
    let message: Value = match serde_json::from_str(trimmed) {
        Ok(Value::Object(map)) => Value::Object(map),
        _ => {
            info!(target: BACKEND_LOG_TARGET, prefix = %prefix, "{}", line);
            return;
        }
    };

    let id = message.get("id").cloned();
    match (message.get("method").and_then(Value::as_str), id) {
        (Some(method), Some(id)) => {
            let reply = if method == "ping" {
                success_response(id, Value::Object(Default::default()))
            } else {
                debug!(prefix = %prefix, method, "rejecting backend-initiated request");
                error_response(id, METHOD_NOT_FOUND, format!("method not found: {}", method))
            };
            let mut line = match serde_json::to_vec(&reply) {
                Ok(line) => line,
                Err(_) => return,
            };
            line.push(b'\n');
            // Queued for the writer task; the reader never waits on stdin.
            let _ = outgoing.send(Outgoing {
                line,
                written: None,
            });
        }
        (Some(method), None) => {
            debug!(prefix = %prefix, method, "backend notification");
        }
        (None, Some(id)) => {
            let waiter = id.as_u64().and_then(|id| lock(pending).remove(&id));
            match waiter {
                Some(tx) => {
                    let _ = tx.send(message);
                }
                None => debug!(prefix = %prefix, %id, "dropping response with no pending request"),
            }
        }
        (None, None) => {
            info!(target: BACKEND_LOG_TARGET, prefix = %prefix, "{}", line);
        }
    }
}

async fn forward_stderr(prefix: String, stderr: ChildStderr) {
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();
    loop {
        match read_line_lossy(&mut reader, &mut buf).await {
            Ok(Some(line)) => info!(target: BACKEND_LOG_TARGET, prefix = %prefix, "{}", line),
            Ok(None) => break,
            Err(err) => {
                warn!(prefix = %prefix, error = %err, "failed to read backend stderr");
                break;
            }
        }
    }
}

async fn monitor(prefix: String, mut child: Child, shutdown: oneshot::Receiver<()>) {
    tokio::select! {
        status = child.wait() => match status {
            Ok(status) => info!(prefix = %prefix, %status, "backend process exited"),
            Err(err) => warn!(prefix = %prefix, error = %err, "failed to wait on backend process"),
        },
        _ = shutdown => {
            if let Err(err) = child.kill().await {
                debug!(prefix = %prefix, error = %err, "failed to kill backend process");
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::auth::CredentialSource;
    use crate::transports::BackendSession;
    use serde_json::json;
    use std::time::Duration;

    const INIT_REPLY: &str = r#"{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2025-06-18","capabilities":{},"serverInfo":{"name":"fake","version":"0"}}}\n"#;

    /// A shell backend: answers initialize, and runs `on_list` / `on_call` for the other methods.
    /// `$id` holds the request id inside the handlers.
    fn script(on_list: &str, on_call: &str) -> String {
        format!(
            r#"echo "fake backend starting"
echo "diagnostic on stderr" >&2
while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/^{{"jsonrpc":"2.0","id":\([0-9]*\),.*/\1/p')
  case "$line" in
    *'"method":"initialize"'*) printf '{init}' "$id" ;;
    *'"method":"tools/list"'*) {on_list} ;;
    *'"method":"tools/call"'*) {on_call} ;;
  esac
done
"#,
            init = INIT_REPLY,
            on_list = on_list,
            on_call = on_call
        )
    }

    const LIST_ONE: &str = r#"printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"echo","inputSchema":{"type":"object"}}]}}\n' "$id""#;

    fn process(script: String) -> ProcessBackend {
        ProcessBackend {
            cmd: "/bin/sh".into(),
            args: vec!["-c".into(), script],
            credential_env: None,
            credential: CredentialSource::default(),
        }
    }

    fn base_env() -> EnvSnapshot {
        EnvSnapshot::default().with_var("PATH", "/usr/bin:/bin")
    }

    #[test]
    fn child_env_is_allow_list_plus_one_credential() {
        let env = base_env()
            .with_var("HOME", "/home/hub")
            .with_var("AWS_SECRET_ACCESS_KEY", "leak")
            .with_var("BRAVE_API_KEY", "k");
        let vars = build_child_env(&env, "BRAVE_API_KEY", Some(&Credential::new("k")));

        let mut names: Vec<_> = vars.keys().cloned().collect();
        names.sort();
        assert_eq!(names, vec!["BRAVE_API_KEY", "HOME", "PATH"]);
        assert_eq!(vars["BRAVE_API_KEY"], "k");

        let vars = build_child_env(&env, "CUSTOM_TOKEN", None);
        assert_eq!(vars["CUSTOM_TOKEN"], "");
        assert!(!vars.contains_key("BRAVE_API_KEY"));
    }

    #[tokio::test]
    async fn child_sees_only_its_credential() {
        let on_call = r#"printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"key=%s leak=%s"}]}}\n' "$id" "$SCOUT_API_KEY" "${LEAKY:-unset}""#;
        let env = base_env()
            .with_var("SCOUT_API_KEY", "s3cret")
            .with_var("LEAKY", "should-not-pass");

        let session = spawn("scout", &process(script(LIST_ONE, on_call)), &env)
            .await
            .expect("spawn");
        let result = session.call_tool("echo", HashMap::new()).await.expect("call");
        assert_eq!(result["content"][0]["text"], "key=s3cret leak=unset");
    }

    #[tokio::test]
    async fn lists_tools_and_answers_backend_pings() {
        // Before answering the list, the backend pings the hub and checks the reply.
        let on_list = r#"printf '%s\n' '{"jsonrpc":"2.0","id":"srv-1","method":"ping"}'
      IFS= read -r pong
      case "$pong" in
        *'"id":"srv-1"'*'"result"'*) name=pong_ok ;;
        *) name=pong_bad ;;
      esac
      printf '{"jsonrpc":"2.0","method":"notifications/message","params":{}}\n'
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"%s"}]}}\n' "$id" "$name""#;

        let session = spawn("pinger", &process(script(on_list, "true")), &base_env())
            .await
            .expect("spawn");
        let tools = session.list_tools().await.expect("list");
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "pong_ok");
    }

    #[tokio::test]
    async fn concurrent_calls_are_matched_by_id() {
        // Read two calls, answer them in reverse order.
        let on_call = r#"first=$id
      IFS= read -r line
      second=$(printf '%s\n' "$line" | sed -n 's/^{"jsonrpc":"2.0","id":\([0-9]*\),.*/\1/p')
      printf '{"jsonrpc":"2.0","id":%s,"result":{"answered":%s}}\n' "$second" "$second"
      printf '{"jsonrpc":"2.0","id":%s,"result":{"answered":%s}}\n' "$first" "$first""#;

        let session = spawn("pipe", &process(script(LIST_ONE, on_call)), &base_env())
            .await
            .expect("spawn");
        let (a, b) = tokio::join!(
            session.call_tool("echo", HashMap::new()),
            session.call_tool("echo", HashMap::new())
        );
        let (a, b) = (a.expect("first"), b.expect("second"));
        assert_ne!(a["answered"], b["answered"]);
    }

    #[tokio::test]
    async fn backend_exit_closes_the_transport() {
        let session = spawn("crashy", &process(script(LIST_ONE, "exit 3")), &base_env())
            .await
            .expect("spawn");

        let first = tokio::time::timeout(
            Duration::from_secs(5),
            session.call_tool("echo", HashMap::new()),
        )
        .await
        .expect("must not hang");
        assert!(matches!(first, Err(HubError::TransportClosed(ref p)) if p == "crashy"));

        let second = session.call_tool("echo", HashMap::new()).await;
        assert!(matches!(second, Err(HubError::TransportClosed(_))));
        assert!(session.channel().is_closed());
    }

    /// Formatted events of every subscriber built from it, for asserting on forwarded output.
    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl CapturedLogs {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }

        async fn wait_for(&self, needle: &str) -> String {
            for _ in 0..50 {
                let logs = self.contents();
                if logs.contains(needle) {
                    return logs;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            panic!("{:?} never logged; got:\n{}", needle, self.contents());
        }
    }

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for CapturedLogs {
        type Writer = CapturedLogs;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    fn capture_logs() -> (CapturedLogs, tracing::subscriber::DefaultGuard) {
        let logs = CapturedLogs::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(logs.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::DEBUG)
            .finish();
        (logs.clone(), tracing::subscriber::set_default(subscriber))
    }

    #[tokio::test]
    async fn diagnostics_are_forwarded_with_the_prefix() {
        // Single-threaded runtime: the reader tasks run under the thread-local subscriber.
        let (logs, _guard) = capture_logs();
        let on_call = r#"printf 'caf\351 on stderr\n' >&2
      printf 'caf\351 on stdout\n'
      printf '{"jsonrpc":"2.0","id":%s,"result":{"ok":true}}\n' "$id""#;
        let session = spawn("chatty", &process(script(LIST_ONE, on_call)), &base_env())
            .await
            .expect("spawn");
        let result = session.call_tool("echo", HashMap::new()).await.expect("call");
        assert_eq!(result["ok"], true);

        for needle in [
            "fake backend starting",
            "diagnostic on stderr",
            "caf\u{FFFD} on stdout",
            "caf\u{FFFD} on stderr",
        ] {
            let output = logs.wait_for(needle).await;
            let line = output.lines().find(|l| l.contains(needle)).unwrap();
            assert!(line.contains(BACKEND_LOG_TARGET), "{}", line);
            assert!(line.contains("prefix=chatty"), "{}", line);
        }
    }

    #[tokio::test]
    async fn invalid_utf8_on_stdout_keeps_the_session_open() {
        let on_call = r#"printf 'caf\351\n'
      printf '{"jsonrpc":"2.0","id":%s,"result":{"ok":true}}\n' "$id""#;
        let session = spawn("latin", &process(script(LIST_ONE, on_call)), &base_env())
            .await
            .expect("spawn");

        for _ in 0..2 {
            let result = session.call_tool("echo", HashMap::new()).await.expect("call");
            assert_eq!(result["ok"], true);
        }
        assert!(!session.channel().is_closed());
    }

    #[tokio::test]
    async fn invalid_utf8_on_stderr_does_not_kill_the_backend() {
        // A dropped stderr pipe would kill the child on its next diagnostic.
        let on_call = r#"printf 'caf\351\n' >&2
      sleep 0.2
      echo "still talking" >&2
      printf '{"jsonrpc":"2.0","id":%s,"result":{"ok":true}}\n' "$id""#;
        let session = spawn("noisy", &process(script(LIST_ONE, on_call)), &base_env())
            .await
            .expect("spawn");

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            session.call_tool("echo", HashMap::new()),
        )
        .await
        .expect("must not hang")
        .expect("call");
        assert_eq!(result["ok"], true);
        assert!(!session.channel().is_closed());
    }

    #[tokio::test]
    async fn ping_reply_does_not_wait_behind_a_blocked_request() {
        // On the first call the backend pings, then floods stdout without reading
        // stdin while the hub is still writing a second, larger-than-a-pipe request.
        let on_call = r#"first=$id
      printf '%s\n' '{"jsonrpc":"2.0","id":"srv-2","method":"ping"}'
      i=0
      while [ $i -lt 2000 ]; do
        echo "filler line $i padding padding padding padding"
        i=$((i+1))
      done
      pong=no
      second=
      while [ "$pong" = no ] || [ -z "$second" ]; do
        IFS= read -r next || exit 1
        case "$next" in
          *'"id":"srv-2"'*) pong=yes ;;
          *'"method":"tools/call"'*) second=$(printf '%s\n' "$next" | sed -n 's/^{"jsonrpc":"2.0","id":\([0-9]*\),.*/\1/p') ;;
        esac
      done
      printf '{"jsonrpc":"2.0","id":%s,"result":{"n":1}}\n' "$first"
      printf '{"jsonrpc":"2.0","id":%s,"result":{"n":2}}\n' "$second""#;
        let session = spawn("busy", &process(script(LIST_ONE, on_call)), &base_env())
            .await
            .expect("spawn");

        let mut big = HashMap::new();
        big.insert("blob".to_string(), json!("x".repeat(256 * 1024)));
        // join! polls the small call first, so its line is queued ahead of the large one.
        let (small, large) = tokio::time::timeout(Duration::from_secs(10), async {
            tokio::join!(
                session.call_tool("echo", HashMap::new()),
                session.call_tool("echo", big)
            )
        })
        .await
        .expect("must not deadlock");
        assert_eq!(small.expect("small call")["n"], 1);
        assert_eq!(large.expect("large call")["n"], 2);
    }

    #[tokio::test]
    async fn missing_command_is_a_connect_error() {
        let backend = ProcessBackend {
            cmd: "/definitely/not/a/binary".into(),
            args: vec![],
            credential_env: None,
            credential: CredentialSource::default(),
        };
        let err = spawn("ghost", &backend, &base_env()).await.err().expect("must fail");
        assert!(matches!(err, HubError::Connect { ref prefix, .. } if prefix == "ghost"));
    }

    #[tokio::test]
    async fn backend_error_reply_is_a_backend_error() {
        let on_call = r#"printf '{"jsonrpc":"2.0","id":%s,"error":{"code":-32000,"message":"quota exceeded"}}\n' "$id""#;
        let session = spawn("quota", &process(script(LIST_ONE, on_call)), &base_env())
            .await
            .expect("spawn");
        let err = session.call_tool("echo", HashMap::new()).await.unwrap_err();
        assert!(matches!(err, HubError::Backend(ref msg) if msg.contains("quota exceeded")));
    }
}
