// Hub configuration loading from YAML (or JSON) files
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tracing::warn;

use crate::config::{BackendDescriptor, EnvSnapshot, HubConfig, TimeoutSettings};
use crate::errors::{HubError, HubResult};

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("placeholder pattern is valid")
});

/// Load and validate a hub configuration file.
///
/// Supports multiple layouts:
/// - Array: `[{type: http, ...}, ...]`
/// - Object with a servers array: `{servers: [...], timeouts: {...}}`
/// - Object with a single server: `{servers: {...}}`
pub async fn load_config_from_file(path: impl AsRef<Path>, env: &EnvSnapshot) -> HubResult<HubConfig> {
    let path = path.as_ref();
    let contents = tokio::fs::read_to_string(path).await.map_err(|e| {
        HubError::Config(format!("cannot read config file '{}': {}", path.display(), e))
    })?;
    parse_config(&contents, env)
}

/// Parse and validate a hub configuration from text.
pub fn parse_config(contents: &str, env: &EnvSnapshot) -> HubResult<HubConfig> {
    let root: Value = serde_yaml::from_str(contents)
        .map_err(|e| HubError::Config(format!("config is not valid YAML: {}", e)))?;

    let (server_values, timeouts) = split_root(root)?;

    let mut servers = Vec::with_capacity(server_values.len());
    for (index, mut value) in server_values.into_iter().enumerate() {
        substitute_variables(&mut value, env);
        servers.push(descriptor_from_value(value, index)?);
    }

    let config = HubConfig {
        servers,
        timeouts: timeouts.resolve()?,
    };
    config.validate()?;
    Ok(config)
}

fn split_root(root: Value) -> HubResult<(Vec<Value>, TimeoutSettings)> {
    match root {
        Value::Array(arr) => Ok((arr, TimeoutSettings::default())),

        Value::Object(mut obj) => {
            let timeouts = match obj.remove("timeouts") {
                Some(v) => serde_json::from_value(v)
                    .map_err(|e| HubError::Config(format!("invalid 'timeouts' section: {}", e)))?,
                None => TimeoutSettings::default(),
            };
            let servers = match obj.remove("servers") {
                Some(Value::Array(arr)) => arr,
                Some(single @ Value::Object(_)) => vec![single],
                Some(Value::Null) | None => Vec::new(),
                Some(_) => {
                    return Err(HubError::Config(
                        "'servers' field must be a list or a single object".into(),
                    ))
                }
            };
            Ok((servers, timeouts))
        }

        Value::Null => Ok((Vec::new(), TimeoutSettings::default())),

        _ => Err(HubError::Config("config root must be a list or a mapping".into())),
    }
}

fn descriptor_from_value(mut value: Value, index: usize) -> HubResult<BackendDescriptor> {
    let obj = value
        .as_object_mut()
        .ok_or_else(|| HubError::Config(format!("servers[{}] must be a mapping", index)))?;

    // Accept "transport" as a synonym for the "type" discriminator.
    if !obj.contains_key("type") {
        if let Some(kind) = obj.remove("transport") {
            obj.insert("type".to_string(), kind);
        }
    }
    if !obj.contains_key("type") {
        return Err(HubError::Config(format!(
            "servers[{}] is missing its 'type' (http or stdio)",
            index
        )));
    }

    serde_json::from_value(value)
        .map_err(|e| HubError::Config(format!("servers[{}] is invalid: {}", index, e)))
}

/// Replace `${VAR}` placeholders in every string with values from the snapshot.
fn substitute_variables(value: &mut Value, env: &EnvSnapshot) {
    match value {
        Value::String(s) => {
            if !s.contains("${") {
                return;
            }
            let replaced = PLACEHOLDER.replace_all(s, |caps: &regex::Captures<'_>| {
                match env.get(&caps[1]) {
                    Some(val) => val.to_string(),
                    None => {
                        warn!(variable = &caps[1], "config placeholder has no value; left as-is");
                        caps[0].to_string()
                    }
                }
            });
            *s = replaced.into_owned();
        }
        Value::Object(obj) => {
            for (_, v) in obj.iter_mut() {
                substitute_variables(v, env);
            }
        }
        Value::Array(arr) => {
            for item in arr.iter_mut() {
                substitute_variables(item, env);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendTransport, TransportKind};
    use std::io::Write;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    #[test]
    fn parses_reference_layout() {
        let yaml = r#"
servers:
  - type: http
    prefix: brave
    url: https://search.example.com/mcp
    apiKeyEnv: BRAVE_TOKEN
  - type: stdio
    prefix: github
    cmd: npx
    args: ["-y", "@modelcontextprotocol/server-github"]
"#;
        let config = parse_config(yaml, &EnvSnapshot::default()).unwrap();
        assert_eq!(config.servers.len(), 2);
        assert_eq!(config.servers[0].kind(), TransportKind::Http);
        assert_eq!(
            config.servers[0].credential_source().api_key_env.as_deref(),
            Some("BRAVE_TOKEN")
        );
        match &config.servers[1].transport {
            BackendTransport::Stdio(proc) => {
                assert_eq!(proc.cmd, "npx");
                assert_eq!(proc.args.len(), 2);
            }
            other => panic!("expected stdio backend, got {:?}", other),
        }
        assert_eq!(config.timeouts.invoke, Duration::from_secs(30));
    }

    #[test]
    fn parses_bare_list_and_transport_synonym() {
        let yaml = r#"
- transport: process
  prefix: local
  command: ./server
"#;
        let config = parse_config(yaml, &EnvSnapshot::default()).unwrap();
        assert_eq!(config.servers[0].kind(), TransportKind::Stdio);
    }

    #[test]
    fn json_documents_are_accepted() {
        let json = r#"{"servers": {"type": "http", "prefix": "a", "url": "http://127.0.0.1:1/mcp"},
                       "timeouts": {"invoke_secs": 2}}"#;
        let config = parse_config(json, &EnvSnapshot::default()).unwrap();
        assert_eq!(config.servers.len(), 1);
        assert_eq!(config.timeouts.invoke, Duration::from_secs(2));
    }

    #[test]
    fn duplicate_prefix_is_a_config_error() {
        let yaml = r#"
servers:
  - {type: http, prefix: dup, url: "http://a.example/mcp"}
  - {type: stdio, prefix: dup, cmd: server}
"#;
        let err = parse_config(yaml, &EnvSnapshot::default()).unwrap_err();
        assert!(matches!(err, HubError::Config(_)));
    }

    #[test]
    fn missing_type_and_unknown_type_are_config_errors() {
        let missing = parse_config("- {prefix: a, url: 'http://a'}", &EnvSnapshot::default());
        assert!(matches!(missing, Err(HubError::Config(_))));

        let unknown = parse_config(
            "- {type: websocket, prefix: a, url: 'ws://a'}",
            &EnvSnapshot::default(),
        );
        assert!(matches!(unknown, Err(HubError::Config(_))));
    }

    #[test]
    fn placeholders_are_substituted_from_snapshot() {
        let env = EnvSnapshot::default().with_var("SEARCH_HOST", "search.internal");
        let yaml = r#"
- type: http
  prefix: s
  url: "https://${SEARCH_HOST}/mcp"
  headers:
    X-Missing: "${NOT_SET}"
"#;
        let config = parse_config(yaml, &env).unwrap();
        match &config.servers[0].transport {
            BackendTransport::Http(net) => {
                assert_eq!(net.url, "https://search.internal/mcp");
                assert_eq!(net.headers.get("X-Missing").unwrap(), "${NOT_SET}");
            }
            other => panic!("expected http backend, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn loads_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            "servers:\n  - type: stdio\n    prefix: echo\n    cmd: cat\n"
        )
        .unwrap();

        let config = load_config_from_file(file.path(), &EnvSnapshot::default())
            .await
            .unwrap();
        assert_eq!(config.servers[0].prefix, "echo");

        let missing = load_config_from_file("/definitely/not/here.yaml", &EnvSnapshot::default()).await;
        assert!(matches!(missing, Err(HubError::Config(_))));
    }
}
