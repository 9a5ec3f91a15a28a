//! Starts one bridging task per configured backend and reports when all have settled.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::bridge::try_bridge;
use crate::config::{validate_descriptors, BackendDescriptor, BridgeTimeouts, EnvSnapshot};
use crate::errors::HubResult;
use crate::repository::HubRegistry;
use crate::transports::ConnectorRegistry;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeStatus {
    Bridged { registered: usize, rejected: Vec<String> },
    ConnectFailed(String),
    CatalogFailed(String),
}

/// Outcome of bridging one backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeReport {
    pub prefix: String,
    pub status: BridgeStatus,
}

impl BridgeReport {
    pub fn registered(&self) -> usize {
        match &self.status {
            BridgeStatus::Bridged { registered, .. } => *registered,
            _ => 0,
        }
    }

    pub fn is_bridged(&self) -> bool {
        matches!(self.status, BridgeStatus::Bridged { .. })
    }
}

pub struct BridgeOrchestrator {
    registry: Arc<dyn HubRegistry>,
    connectors: ConnectorRegistry,
    env: EnvSnapshot,
    timeouts: BridgeTimeouts,
}

impl BridgeOrchestrator {
    pub fn new(registry: Arc<dyn HubRegistry>, env: EnvSnapshot) -> Self {
        Self {
            registry,
            connectors: ConnectorRegistry::with_default_connectors(),
            env,
            timeouts: BridgeTimeouts::default(),
        }
    }

    pub fn with_connectors(mut self, connectors: ConnectorRegistry) -> Self {
        self.connectors = connectors;
        self
    }

    pub fn with_timeouts(mut self, timeouts: BridgeTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Validate every descriptor, then launch one independent bridging task per descriptor.
    ///
    /// A configuration error is returned before any task starts.
    pub fn start_all(&self, descriptors: Vec<BackendDescriptor>) -> HubResult<BridgeSet> {
        validate_descriptors(&descriptors)?;

        let tasks = descriptors
            .into_iter()
            .map(|descriptor| {
                let prefix = descriptor.prefix.clone();
                let handle = tokio::spawn(bridge_backend(
                    self.registry.clone(),
                    self.connectors.clone(),
                    self.env.clone(),
                    self.timeouts,
                    descriptor,
                ));
                (prefix, handle)
            })
            .collect();

        Ok(BridgeSet { tasks })
    }
}

async fn bridge_backend(
    registry: Arc<dyn HubRegistry>,
    connectors: ConnectorRegistry,
    env: EnvSnapshot,
    timeouts: BridgeTimeouts,
    descriptor: BackendDescriptor,
) -> BridgeReport {
    let prefix = descriptor.prefix.clone();
    info!(
        prefix = %prefix,
        transport = descriptor.kind().as_key(),
        target = %descriptor.target(),
        "connecting to backend"
    );

    let connected = timeout(timeouts.connect, connectors.connect(&descriptor, &env)).await;
    let session = match connected {
        Ok(Ok(session)) => session,
        Ok(Err(err)) => {
            warn!(prefix = %prefix, error = %err, "backend connection failed");
            return BridgeReport {
                prefix,
                status: BridgeStatus::ConnectFailed(err.to_string()),
            };
        }
        Err(_) => {
            let reason = format!(
                "handshake did not complete within {}s",
                timeouts.connect.as_secs_f64()
            );
            warn!(prefix = %prefix, error = %reason, "backend connection failed");
            return BridgeReport {
                prefix,
                status: BridgeStatus::ConnectFailed(reason),
            };
        }
    };

    let status = match try_bridge(registry.as_ref(), session, &prefix, &timeouts).await {
        Ok(summary) => BridgeStatus::Bridged {
            registered: summary.registered,
            rejected: summary.rejected,
        },
        Err(err) => {
            warn!(prefix = %prefix, error = %err, "tool catalog unavailable");
            BridgeStatus::CatalogFailed(err.to_string())
        }
    };
    BridgeReport { prefix, status }
}

/// Running bridging tasks, in descriptor order.
pub struct BridgeSet {
    tasks: Vec<(String, JoinHandle<BridgeReport>)>,
}

impl BridgeSet {
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Wait for every task to settle. Never short-circuits; a panicked task is reported as failed.
    pub async fn ready(self) -> Vec<BridgeReport> {
        let mut reports = Vec::with_capacity(self.tasks.len());
        for (prefix, handle) in self.tasks {
            let report = match handle.await {
                Ok(report) => report,
                Err(err) => {
                    warn!(prefix = %prefix, error = %err, "bridging task aborted");
                    BridgeReport {
                        prefix,
                        status: BridgeStatus::ConnectFailed(format!("bridging task failed: {}", err)),
                    }
                }
            };
            reports.push(report);
        }
        reports
    }
}
