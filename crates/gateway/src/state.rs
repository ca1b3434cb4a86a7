use std::sync::Arc;
use std::time::Duration;

use dg_domain::config::Config;
use dg_mcp_client::McpRegistry;
use dg_providers::ProviderRegistry;
use dg_sandbox::{ContainerRuntime, SandboxManager};
use dg_store::{HistoryStore, PermissionResolver, Repository};

use crate::runtime::conversation_lock::ConversationLockMap;

/// Shared application state passed to all API handlers.
///
/// These are the only process-wide mutable services: the sandbox map, the
/// MCP config snapshot, the permission cache, and the LLM instance cache.
/// Everything else is per-request or per-turn.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub repo: Arc<Repository>,
    pub history: Arc<HistoryStore>,
    pub permissions: Arc<PermissionResolver>,
    pub providers: Arc<ProviderRegistry>,
    pub mcp: Arc<McpRegistry>,
    pub sandboxes: Arc<SandboxManager>,
    pub conversation_locks: Arc<ConversationLockMap>,
}

impl AppState {
    pub fn build(
        config: Arc<Config>,
        repo: Arc<Repository>,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Self {
        let history = Arc::new(HistoryStore::new(repo.clone()));
        let permissions = Arc::new(PermissionResolver::new(repo.clone()));
        let providers = Arc::new(ProviderRegistry::new(Duration::from_secs(
            config.llm.request_timeout_secs,
        )));
        let sandboxes = Arc::new(SandboxManager::new(
            runtime,
            config.storage.clone(),
            &config.sandbox,
        ));

        Self {
            config,
            repo,
            history,
            permissions,
            providers,
            mcp: Arc::new(McpRegistry::new()),
            sandboxes,
            conversation_locks: Arc::new(ConversationLockMap::new()),
        }
    }
}
