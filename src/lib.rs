//! Aggregation hub for Model Context Protocol tool backends.
//!
//! Each configured backend (a networked server or a spawned process) is connected, its tool
//! catalog fetched once, and every tool re-exposed under `prefix/name` on a single registry.
//! Failures stay local to their backend: a dead backend contributes no tools, and a failing
//! call resolves to a structured error payload.

pub mod auth;
pub mod bridge;
pub mod config;
pub mod errors;
pub mod loader;
pub mod local;
pub mod orchestrator;
pub mod repository;
pub mod server;
pub mod tools;
pub mod transports;

pub use bridge::{bridge, qualified_name, tool_error_payload, try_bridge, BridgeSummary};
pub use config::{BackendDescriptor, BridgeTimeouts, EnvSnapshot, HubConfig, TransportKind};
pub use errors::{HubError, HubResult};
pub use loader::{load_config_from_file, parse_config};
pub use orchestrator::{BridgeOrchestrator, BridgeReport, BridgeSet, BridgeStatus};
pub use repository::{HubRegistry, InMemoryHubRegistry, ProxyEntry, ToolHandler};
pub use tools::{translate, ToolDescriptor, ValidatedSchema};
pub use transports::{BackendSession, ConnectorRegistry};
