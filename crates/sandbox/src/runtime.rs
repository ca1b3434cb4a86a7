//! The container-runtime seam. The sandbox drives an existing container
//! API through this trait; the rest of the workspace never sees the
//! concrete runtime.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

/// Errors from the container runtime.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// The container does not exist (removed out from under us). The
    /// sandbox recreates it once transparently on `Execute`.
    #[error("container missing: {0}")]
    Missing(String),

    #[error("container runtime: {0}")]
    Runtime(String),

    #[error("command timed out after {0:?}")]
    Timeout(Duration),
}

/// A bind mount from the host into the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bind {
    pub host_path: String,
    pub container_path: String,
    pub read_only: bool,
}

impl Bind {
    /// Docker bind string form: `host:container[:ro]`.
    pub fn to_bind_string(&self) -> String {
        if self.read_only {
            format!("{}:{}:ro", self.host_path, self.container_path)
        } else {
            format!("{}:{}", self.host_path, self.container_path)
        }
    }
}

/// Everything needed to create a sandbox container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Container name; encodes `(user_id, conversation_id)`.
    pub name: String,
    pub image: String,
    pub working_dir: String,
    pub binds: Vec<Bind>,
    pub env: HashMap<String, String>,
    /// Sandboxes run without outbound network.
    pub network_disabled: bool,
}

/// Output of one in-container command.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    /// stdout and stderr, merged in arrival order.
    pub output: String,
    pub exit_code: i64,
}

/// Narrow interface over a container API (create / start / stop / exec).
///
/// `exec` runs a command inside a *running* container and waits for it,
/// enforcing `timeout` by giving up on the attached stream; the sandbox
/// layers output truncation and retry policy on top.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn create(&self, spec: &ContainerSpec) -> Result<(), SandboxError>;

    /// Idempotent: starting an already-running container is not an error.
    async fn start(&self, name: &str) -> Result<(), SandboxError>;

    /// Idempotent: stopping a stopped container is not an error.
    async fn stop(&self, name: &str) -> Result<(), SandboxError>;

    async fn remove(&self, name: &str) -> Result<(), SandboxError>;

    async fn exists(&self, name: &str) -> Result<bool, SandboxError>;

    async fn exec(
        &self,
        name: &str,
        command: &[String],
        timeout: Duration,
    ) -> Result<ExecOutput, SandboxError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_string_forms() {
        let rw = Bind {
            host_path: "/data/uploads/1/2".into(),
            container_path: "/workspace/uploads".into(),
            read_only: false,
        };
        assert_eq!(rw.to_bind_string(), "/data/uploads/1/2:/workspace/uploads");

        let ro = Bind {
            host_path: "/data/skills/pdf".into(),
            container_path: "/workspace/skills/pdf".into(),
            read_only: true,
        };
        assert_eq!(ro.to_bind_string(), "/data/skills/pdf:/workspace/skills/pdf:ro");
    }
}
