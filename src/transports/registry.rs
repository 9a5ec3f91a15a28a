use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{BackendDescriptor, BackendTransport, EnvSnapshot, TransportKind};
use crate::errors::{HubError, HubResult};
use crate::transports::{http, stdio, BackendSession};

/// Opens a session for a descriptor of one transport kind.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        descriptor: &BackendDescriptor,
        env: &EnvSnapshot,
    ) -> HubResult<Arc<dyn BackendSession>>;
}

fn wrong_kind(descriptor: &BackendDescriptor, expected: TransportKind) -> HubError {
    HubError::Config(format!(
        "backend '{}' is {}, not {}",
        descriptor.prefix,
        descriptor.kind().as_key(),
        expected.as_key()
    ))
}

pub struct HttpConnector;

#[async_trait]
impl Connector for HttpConnector {
    async fn connect(
        &self,
        descriptor: &BackendDescriptor,
        env: &EnvSnapshot,
    ) -> HubResult<Arc<dyn BackendSession>> {
        match &descriptor.transport {
            BackendTransport::Http(backend) => {
                let session = http::connect(&descriptor.prefix, backend, None, env).await?;
                Ok(Arc::new(session))
            }
            _ => Err(wrong_kind(descriptor, TransportKind::Http)),
        }
    }
}

pub struct StdioConnector;

#[async_trait]
impl Connector for StdioConnector {
    async fn connect(
        &self,
        descriptor: &BackendDescriptor,
        env: &EnvSnapshot,
    ) -> HubResult<Arc<dyn BackendSession>> {
        match &descriptor.transport {
            BackendTransport::Stdio(backend) => {
                let session = stdio::spawn(&descriptor.prefix, backend, env).await?;
                Ok(Arc::new(session))
            }
            _ => Err(wrong_kind(descriptor, TransportKind::Stdio)),
        }
    }
}

/// Plugin-style registry of connectors keyed by transport kind.
#[derive(Clone, Default)]
pub struct ConnectorRegistry {
    map: HashMap<TransportKind, Arc<dyn Connector>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    pub fn with_default_connectors() -> Self {
        let mut reg = Self::new();
        reg.register(TransportKind::Http, Arc::new(HttpConnector));
        reg.register(TransportKind::Stdio, Arc::new(StdioConnector));
        reg
    }

    pub fn register(&mut self, kind: TransportKind, connector: Arc<dyn Connector>) {
        self.map.insert(kind, connector);
    }

    pub fn get(&self, kind: TransportKind) -> Option<Arc<dyn Connector>> {
        self.map.get(&kind).cloned()
    }

    /// Connect `descriptor` with the connector registered for its kind.
    pub async fn connect(
        &self,
        descriptor: &BackendDescriptor,
        env: &EnvSnapshot,
    ) -> HubResult<Arc<dyn BackendSession>> {
        let connector = self.get(descriptor.kind()).ok_or_else(|| HubError::Connect {
            prefix: descriptor.prefix.clone(),
            reason: format!("no connector for transport '{}'", descriptor.kind().as_key()),
        })?;
        connector.connect(descriptor, env).await
    }
}
