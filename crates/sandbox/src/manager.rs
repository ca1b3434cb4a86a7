//! Process-wide sandbox ownership: one live [`Sandbox`] per conversation.
//!
//! The map lock covers map-level work only (lookup, insert, removal);
//! container I/O happens on each sandbox's own lock, so two concurrent
//! turns on the same conversation serialize their first-creation through
//! the map and then share the entry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use dg_domain::config::{ImageConfig, SandboxConfig, StorageConfig};
use dg_domain::error::Result;

use crate::runtime::ContainerRuntime;
use crate::sandbox::{Sandbox, SandboxLimits, VolumeLayout};

pub struct SandboxManager {
    runtime: Arc<dyn ContainerRuntime>,
    storage: StorageConfig,
    limits: SandboxLimits,
    sandboxes: Mutex<HashMap<i64, Arc<Sandbox>>>,
}

impl SandboxManager {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        storage: StorageConfig,
        config: &SandboxConfig,
    ) -> Self {
        Self {
            runtime,
            storage,
            limits: SandboxLimits {
                default_timeout: Duration::from_secs(config.default_timeout_secs),
                max_timeout: Duration::from_secs(config.max_timeout_secs),
                max_output_bytes: config.max_output_bytes,
            },
            sandboxes: Mutex::new(HashMap::new()),
        }
    }

    /// Return the conversation's sandbox, creating it on first use.
    ///
    /// The entry persists across turns (container state is valuable), but a
    /// changed effective skill set forces a rebuild: mounts are fixed at
    /// container creation, and `/workspace/skills/<name>` may exist iff
    /// `<name>` is currently permitted.
    pub async fn acquire(
        &self,
        user_id: i64,
        conversation_id: i64,
        image: ImageConfig,
        mut allowed_skills: Vec<String>,
    ) -> Result<Arc<Sandbox>> {
        allowed_skills.sort();
        allowed_skills.dedup();

        // Host directories must exist before the bind mounts reference them.
        std::fs::create_dir_all(self.storage.uploads_dir(user_id, conversation_id))?;
        std::fs::create_dir_all(self.storage.intermediate_dir(user_id, conversation_id))?;

        let (sandbox, replaced) = {
            let mut map = self.sandboxes.lock();
            let existing = map.get(&conversation_id).cloned();
            match existing {
                Some(current) if current.allowed_skills() == allowed_skills.as_slice() => {
                    (current, None)
                }
                other => {
                    let fresh = Arc::new(self.build_sandbox(
                        user_id,
                        conversation_id,
                        image,
                        allowed_skills,
                    ));
                    map.insert(conversation_id, fresh.clone());
                    (fresh, other)
                }
            }
        };

        // Container work happens outside the map lock.
        if let Some(old) = replaced {
            tracing::info!(
                conversation_id,
                "effective skill set changed, rebuilding sandbox container"
            );
            old.destroy().await?;
        }
        sandbox.ensure_running().await?;
        Ok(sandbox)
    }

    fn build_sandbox(
        &self,
        user_id: i64,
        conversation_id: i64,
        image: ImageConfig,
        allowed_skills: Vec<String>,
    ) -> Sandbox {
        // Bind sources use the daemon-visible view of the storage tree.
        let mount_base = self
            .storage
            .host_dir
            .clone()
            .unwrap_or_else(|| self.storage.base_dir.clone());
        let mount_storage = StorageConfig {
            base_dir: mount_base,
            host_dir: None,
        };

        let layout = VolumeLayout {
            uploads_host: mount_storage.uploads_dir(user_id, conversation_id),
            intermediate_host: mount_storage.intermediate_dir(user_id, conversation_id),
            skill_mounts: allowed_skills
                .iter()
                .map(|name| (name.clone(), mount_storage.skills_dir().join(name)))
                .collect(),
        };

        Sandbox::new(
            self.runtime.clone(),
            user_id,
            conversation_id,
            image,
            layout,
            allowed_skills,
            self.limits,
        )
    }

    /// Look up a live sandbox without creating one.
    pub fn get(&self, conversation_id: i64) -> Option<Arc<Sandbox>> {
        self.sandboxes.lock().get(&conversation_id).cloned()
    }

    /// Stop the conversation's container after the response has been
    /// delivered. The map entry stays so the next turn restarts the same
    /// container. Idempotent; missing entries are a no-op.
    pub fn schedule_stop(&self, conversation_id: i64) {
        let Some(sandbox) = self.get(conversation_id) else {
            return;
        };
        tokio::spawn(async move {
            if let Err(e) = sandbox.stop().await {
                tracing::warn!(
                    conversation_id = sandbox.conversation_id(),
                    error = %e,
                    "deferred sandbox stop failed"
                );
            }
        });
    }

    /// Stop every live sandbox (server shutdown).
    pub async fn stop_all(&self) {
        let sandboxes: Vec<Arc<Sandbox>> = self.sandboxes.lock().values().cloned().collect();
        for sandbox in sandboxes {
            if let Err(e) = sandbox.stop().await {
                tracing::warn!(
                    conversation_id = sandbox.conversation_id(),
                    error = %e,
                    "sandbox stop failed during shutdown"
                );
            }
        }
    }

    pub fn live_count(&self) -> usize {
        self.sandboxes.lock().len()
    }
}
