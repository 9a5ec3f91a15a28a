use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;

use crate::errors::{HubError, HubResult};
use crate::repository::{HubRegistry, ProxyEntry, ToolListing};

/// In-memory registry. Written while bridging, read while dispatching.
#[derive(Default)]
pub struct InMemoryHubRegistry {
    entries: RwLock<HashMap<String, ProxyEntry>>, // qualified_name -> entry
}

impl InMemoryHubRegistry {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl HubRegistry for InMemoryHubRegistry {
    async fn register(&self, entry: ProxyEntry) -> HubResult<()> {
        let mut entries = self.entries.write().await;
        if entries.contains_key(&entry.qualified_name) {
            return Err(HubError::DuplicateTool(entry.qualified_name));
        }
        debug!(tool = %entry.qualified_name, "registered tool");
        entries.insert(entry.qualified_name.clone(), entry);
        Ok(())
    }

    async fn dispatch(&self, qualified_name: &str, args: HashMap<String, Value>) -> HubResult<Value> {
        // The lock is released before the handler runs.
        let handler = {
            let entries = self.entries.read().await;
            let entry = entries
                .get(qualified_name)
                .ok_or_else(|| HubError::UnknownTool(qualified_name.to_string()))?;
            entry
                .schema
                .validate(&args)
                .map_err(|violation| HubError::InvalidArguments {
                    tool: qualified_name.to_string(),
                    reason: violation.to_string(),
                })?;
            entry.handler.clone()
        };
        Ok(handler.call(args).await)
    }

    async fn list(&self) -> Vec<ToolListing> {
        let entries = self.entries.read().await;
        let mut listings: Vec<ToolListing> = entries.values().map(ProxyEntry::listing).collect();
        listings.sort_by(|a, b| a.name.cmp(&b.name));
        listings
    }

    async fn contains(&self, qualified_name: &str) -> bool {
        self.entries.read().await.contains_key(qualified_name)
    }

    async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}
