use std::collections::{HashMap, HashSet};
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::auth::{default_credential_var, CredentialSource};
use crate::errors::{HubError, HubResult};

/// Default bound on a single forwarded tool call.
pub const DEFAULT_INVOKE_TIMEOUT: Duration = Duration::from_secs(30);
/// Default bound on the handshake and on catalog listing, an order of magnitude above invoke.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(300);

static PREFIX_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_.\-]+$").expect("prefix pattern is valid"));

/// The hub's environment, captured once at startup and handed down explicitly.
#[derive(Clone, Default)]
pub struct EnvSnapshot {
    vars: HashMap<String, String>,
}

impl EnvSnapshot {
    /// Capture the current process environment.
    pub fn capture() -> Self {
        Self::from_pairs(std::env::vars())
    }

    pub fn from_pairs(pairs: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            vars: pairs.into_iter().collect(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn with_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }
}

// Values may be secrets; only names are shown.
impl std::fmt::Debug for EnvSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.vars.keys().collect();
        names.sort();
        f.debug_struct("EnvSnapshot").field("names", &names).finish()
    }
}

/// Transport kinds a backend can be reached over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Http,
    Stdio,
}

impl TransportKind {
    pub fn as_key(&self) -> &'static str {
        match self {
            TransportKind::Http => "http",
            TransportKind::Stdio => "stdio",
        }
    }
}

/// A networked backend speaking the protocol over streamable HTTP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkBackend {
    pub url: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    #[serde(flatten)]
    pub credential: CredentialSource,
}

/// A backend spawned as a child process speaking the protocol over stdin/stdout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessBackend {
    #[serde(alias = "command")]
    pub cmd: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Name of the single variable injected into the child; defaults to `{PREFIX}_API_KEY`.
    #[serde(default, alias = "credentialEnv", skip_serializing_if = "Option::is_none")]
    pub credential_env: Option<String>,
    #[serde(flatten)]
    pub credential: CredentialSource,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendTransport {
    #[serde(alias = "network")]
    Http(NetworkBackend),
    #[serde(alias = "process")]
    Stdio(ProcessBackend),
}

/// One backend entry of the hub configuration. Immutable after load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendDescriptor {
    pub prefix: String,
    #[serde(flatten)]
    pub transport: BackendTransport,
}

impl BackendDescriptor {
    pub fn http(prefix: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            transport: BackendTransport::Http(NetworkBackend {
                url: url.into(),
                headers: HashMap::new(),
                credential: CredentialSource::default(),
            }),
        }
    }

    pub fn stdio(prefix: impl Into<String>, cmd: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            prefix: prefix.into(),
            transport: BackendTransport::Stdio(ProcessBackend {
                cmd: cmd.into(),
                args,
                credential_env: None,
                credential: CredentialSource::default(),
            }),
        }
    }

    pub fn kind(&self) -> TransportKind {
        match self.transport {
            BackendTransport::Http(_) => TransportKind::Http,
            BackendTransport::Stdio(_) => TransportKind::Stdio,
        }
    }

    pub fn credential_source(&self) -> &CredentialSource {
        match &self.transport {
            BackendTransport::Http(net) => &net.credential,
            BackendTransport::Stdio(proc) => &proc.credential,
        }
    }

    /// Short human-readable target, for logs.
    pub fn target(&self) -> String {
        match &self.transport {
            BackendTransport::Http(net) => net.url.clone(),
            BackendTransport::Stdio(proc) if proc.args.is_empty() => proc.cmd.clone(),
            BackendTransport::Stdio(proc) => format!("{} {}", proc.cmd, proc.args.join(" ")),
        }
    }

    /// Check the fields of this one descriptor.
    pub fn validate(&self) -> HubResult<()> {
        if self.prefix.is_empty() {
            return Err(HubError::Config("backend prefix must not be empty".into()));
        }
        if !PREFIX_PATTERN.is_match(&self.prefix) {
            return Err(HubError::Config(format!(
                "backend prefix '{}' may only contain letters, digits, '_', '-' and '.'",
                self.prefix
            )));
        }

        match &self.transport {
            BackendTransport::Http(net) => {
                let url = reqwest::Url::parse(&net.url).map_err(|e| {
                    HubError::Config(format!(
                        "backend '{}' has an invalid url '{}': {}",
                        self.prefix, net.url, e
                    ))
                })?;
                if url.scheme() != "http" && url.scheme() != "https" {
                    return Err(HubError::Config(format!(
                        "backend '{}' url must use http or https, got '{}'",
                        self.prefix,
                        url.scheme()
                    )));
                }
            }
            BackendTransport::Stdio(proc) => {
                if proc.cmd.trim().is_empty() {
                    return Err(HubError::Config(format!(
                        "backend '{}' has an empty command",
                        self.prefix
                    )));
                }
                if let Some(var) = &proc.credential_env {
                    if var.is_empty() || var.contains('=') {
                        return Err(HubError::Config(format!(
                            "backend '{}' has an invalid credential_env '{}'",
                            self.prefix, var
                        )));
                    }
                }
            }
        }

        Ok(())
    }
}

impl ProcessBackend {
    /// The variable the child receives its credential in.
    pub fn credential_var(&self, prefix: &str) -> String {
        self.credential_env
            .clone()
            .unwrap_or_else(|| default_credential_var(prefix))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeTimeouts {
    /// Bound on the handshake, and separately on catalog listing.
    pub connect: Duration,
    /// Bound on each forwarded tool call.
    pub invoke: Duration,
}

impl Default for BridgeTimeouts {
    fn default() -> Self {
        Self {
            connect: DEFAULT_CONNECT_TIMEOUT,
            invoke: DEFAULT_INVOKE_TIMEOUT,
        }
    }
}

/// Timeouts as written in the configuration file, in seconds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimeoutSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_secs: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invoke_secs: Option<f64>,
}

impl TimeoutSettings {
    pub fn resolve(&self) -> HubResult<BridgeTimeouts> {
        let defaults = BridgeTimeouts::default();
        Ok(BridgeTimeouts {
            connect: secs_or("connect_secs", self.connect_secs, defaults.connect)?,
            invoke: secs_or("invoke_secs", self.invoke_secs, defaults.invoke)?,
        })
    }
}

fn secs_or(name: &str, value: Option<f64>, default: Duration) -> HubResult<Duration> {
    match value {
        None => Ok(default),
        Some(secs) if secs.is_finite() && secs > 0.0 => Ok(Duration::from_secs_f64(secs)),
        Some(secs) => Err(HubError::Config(format!(
            "timeouts.{} must be a positive number of seconds, got {}",
            name, secs
        ))),
    }
}

/// Validated hub configuration.
#[derive(Debug, Clone, Default)]
pub struct HubConfig {
    pub servers: Vec<BackendDescriptor>,
    pub timeouts: BridgeTimeouts,
}

impl HubConfig {
    pub fn new(servers: Vec<BackendDescriptor>) -> Self {
        Self {
            servers,
            timeouts: BridgeTimeouts::default(),
        }
    }

    pub fn with_timeouts(mut self, timeouts: BridgeTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn validate(&self) -> HubResult<()> {
        validate_descriptors(&self.servers)?;
        if self.timeouts.connect.is_zero() || self.timeouts.invoke.is_zero() {
            return Err(HubError::Config("timeouts must be non-zero".into()));
        }
        Ok(())
    }
}

/// Validate every descriptor and reject prefixes used more than once.
pub fn validate_descriptors(descriptors: &[BackendDescriptor]) -> HubResult<()> {
    let mut seen = HashSet::new();
    for descriptor in descriptors {
        descriptor.validate()?;
        if !seen.insert(descriptor.prefix.as_str()) {
            return Err(HubError::Config(format!(
                "backend prefix '{}' is configured more than once",
                descriptor.prefix
            )));
        }
    }
    Ok(())
}
