use serde::{Deserialize, Serialize};

use crate::config::EnvSnapshot;

/// Suffix appended to the uppercased prefix to form the conventional credential variable.
pub const CREDENTIAL_VAR_SUFFIX: &str = "_API_KEY";

/// A resolved backend secret. Never printed: `Debug` is redacted and there is no `Display`.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// Raw secret, for the transport that has to send it.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credential([REDACTED])")
    }
}

/// Where a descriptor says its credential comes from, before falling back to the convention.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct CredentialSource {
    /// Literal secret written in the configuration.
    #[serde(default, alias = "apiKey", skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Name of a hub environment variable holding the secret.
    #[serde(default, alias = "apiKeyEnv", skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
}

impl std::fmt::Debug for CredentialSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialSource")
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("api_key_env", &self.api_key_env)
            .finish()
    }
}

/// `{PREFIX}_API_KEY` with the prefix uppercased, e.g. `brave` -> `BRAVE_API_KEY`.
pub fn default_credential_var(prefix: &str) -> String {
    format!("{}{}", prefix.to_uppercase(), CREDENTIAL_VAR_SUFFIX)
}

/// Resolve a backend credential.
///
/// Precedence: literal `api_key`, then the variable named by `api_key_env`, then
/// `{PREFIX}_API_KEY`. Empty values are treated as unset at every step.
pub fn resolve_credential(
    prefix: &str,
    source: &CredentialSource,
    env: &EnvSnapshot,
) -> Option<Credential> {
    if let Some(secret) = source.api_key.as_deref().filter(|s| !s.is_empty()) {
        return Some(Credential::new(secret));
    }

    if let Some(var) = &source.api_key_env {
        if let Some(secret) = env.get(var).filter(|s| !s.is_empty()) {
            return Some(Credential::new(secret));
        }
    }

    env.get(&default_credential_var(prefix))
        .filter(|s| !s.is_empty())
        .map(Credential::new)
}
