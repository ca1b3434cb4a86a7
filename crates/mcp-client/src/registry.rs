//! Configuration cache for MCP servers.
//!
//! Readers take an `Arc` to an immutable snapshot; admin mutations call
//! [`McpRegistry::invalidate`], which drops the snapshot so the next turn
//! reloads from the repository. Snapshots carry a content hash over the
//! sorted configuration map, so "did anything change" is one string
//! comparison.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use sha2::{Digest, Sha256};

use dg_domain::config::{McpServerConfig, McpTransportKind};

/// An immutable view of the active server configurations.
#[derive(Debug)]
pub struct ConfigSnapshot {
    /// SHA-256 over the sorted config map, hex-encoded.
    pub hash: String,
    /// Sorted by server name.
    pub servers: Vec<McpServerConfig>,
}

impl ConfigSnapshot {
    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// The config-dump shape:
    /// `{name → {command,args,env} | {url,transport}}`.
    pub fn dump(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for server in &self.servers {
            let entry = match server.transport {
                McpTransportKind::Stdio => serde_json::json!({
                    "command": server.command.clone().unwrap_or_default(),
                    "args": server.args,
                    "env": server.env,
                }),
                McpTransportKind::Http | McpTransportKind::Sse => serde_json::json!({
                    "url": server.url.clone().unwrap_or_default(),
                    "transport": server.transport.to_string(),
                }),
            };
            map.insert(server.name.clone(), entry);
        }
        serde_json::Value::Object(map)
    }
}

fn snapshot_hash(sorted: &BTreeMap<String, &McpServerConfig>) -> String {
    let serialized = serde_json::to_string(sorted).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(serialized.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Default)]
pub struct McpRegistry {
    snapshot: RwLock<Option<Arc<ConfigSnapshot>>>,
}

impl McpRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The cached snapshot, if one is installed.
    pub fn current(&self) -> Option<Arc<ConfigSnapshot>> {
        self.snapshot.read().clone()
    }

    /// Build and install a snapshot from active server rows. Returns the
    /// installed snapshot (reused when the content hash is unchanged).
    pub fn install(&self, servers: Vec<McpServerConfig>) -> Arc<ConfigSnapshot> {
        let sorted: BTreeMap<String, &McpServerConfig> =
            servers.iter().map(|s| (s.name.clone(), s)).collect();
        let hash = snapshot_hash(&sorted);

        {
            let current = self.snapshot.read();
            if let Some(existing) = current.as_ref() {
                if existing.hash == hash {
                    return existing.clone();
                }
            }
        }

        let mut servers = servers;
        servers.sort_by(|a, b| a.name.cmp(&b.name));
        let snapshot = Arc::new(ConfigSnapshot { hash, servers });
        tracing::info!(
            hash = %&snapshot.hash[..8],
            server_count = snapshot.servers.len(),
            "MCP config snapshot installed"
        );
        *self.snapshot.write() = Some(snapshot.clone());
        snapshot
    }

    /// Discard the snapshot; the next `current()` caller sees `None` and
    /// reloads from the repository.
    pub fn invalidate(&self) {
        *self.snapshot.write() = None;
        tracing::debug!("MCP config snapshot invalidated");
    }
}
