//! One sandbox per conversation: a container bound to the conversation's
//! upload/intermediate directories and its permitted skill mounts.
//!
//! Every file tool here runs inside the container. Commands from the same
//! turn are serialized on the sandbox's own lock; if the runtime reports
//! the container missing, it is recreated once transparently.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Serialize;

use dg_domain::config::ImageConfig;
use dg_domain::error::{Error, Result};

use crate::commands;
use crate::runtime::{Bind, ContainerRuntime, ContainerSpec, SandboxError};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Results
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize)]
pub struct ExecuteResponse {
    /// stdout + stderr, merged.
    pub output: String,
    pub exit_code: i64,
    pub truncated: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct WriteResult {
    pub path: String,
    pub lines_written: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct EditResult {
    pub path: String,
    pub occurrences: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GrepMatch {
    pub path: String,
    pub line_number: usize,
    pub line: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LsEntry {
    pub name: String,
    pub is_dir: bool,
}

/// Execution limits, copied from the sandbox section of the config.
#[derive(Debug, Clone, Copy)]
pub struct SandboxLimits {
    pub default_timeout: Duration,
    pub max_timeout: Duration,
    pub max_output_bytes: usize,
}

/// Host-side directories mounted into the container.
#[derive(Debug, Clone)]
pub struct VolumeLayout {
    pub uploads_host: PathBuf,
    pub intermediate_host: PathBuf,
    /// `(skill_name, host_dir)` pairs, mounted read-only.
    pub skill_mounts: Vec<(String, PathBuf)>,
}

impl VolumeLayout {
    fn binds(&self) -> Vec<Bind> {
        let mut binds = vec![
            Bind {
                host_path: self.uploads_host.to_string_lossy().into_owned(),
                container_path: "/workspace/uploads".into(),
                read_only: false,
            },
            Bind {
                host_path: self.intermediate_host.to_string_lossy().into_owned(),
                container_path: "/workspace/intermediate".into(),
                read_only: false,
            },
        ];
        for (name, host_dir) in &self.skill_mounts {
            binds.push(Bind {
                host_path: host_dir.to_string_lossy().into_owned(),
                container_path: format!("/workspace/skills/{name}"),
                read_only: true,
            });
        }
        binds
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sandbox
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct Sandbox {
    user_id: i64,
    conversation_id: i64,
    container_name: String,
    runtime: Arc<dyn ContainerRuntime>,
    spec: ContainerSpec,
    image: ImageConfig,
    /// Sorted skill names mounted into this container.
    allowed_skills: Vec<String>,
    limits: SandboxLimits,
    /// Serializes in-container execution within a turn.
    exec_lock: tokio::sync::Mutex<()>,
}

/// Container name for a `(user, conversation)` pair; one container per pair.
pub fn container_name(user_id: i64, conversation_id: i64) -> String {
    format!("dg-sandbox-{user_id}-{conversation_id}")
}

impl Sandbox {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        user_id: i64,
        conversation_id: i64,
        image: ImageConfig,
        layout: VolumeLayout,
        allowed_skills: Vec<String>,
        limits: SandboxLimits,
    ) -> Self {
        let container_name = container_name(user_id, conversation_id);
        let spec = ContainerSpec {
            name: container_name.clone(),
            image: image.image.clone(),
            working_dir: image.work_dir.clone(),
            binds: layout.binds(),
            env: HashMap::new(),
            network_disabled: true,
        };
        Self {
            user_id,
            conversation_id,
            container_name,
            runtime,
            spec,
            image,
            allowed_skills,
            limits,
            exec_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn user_id(&self) -> i64 {
        self.user_id
    }

    pub fn conversation_id(&self) -> i64 {
        self.conversation_id
    }

    pub fn container_name(&self) -> &str {
        &self.container_name
    }

    pub fn image(&self) -> &ImageConfig {
        &self.image
    }

    pub fn allowed_skills(&self) -> &[String] {
        &self.allowed_skills
    }

    /// Create the container if needed and start it. Safe to call every turn.
    pub async fn ensure_running(&self) -> Result<()> {
        let _guard = self.exec_lock.lock().await;
        self.ensure_running_locked().await
    }

    async fn ensure_running_locked(&self) -> Result<()> {
        if !self.runtime.exists(&self.container_name).await.map_err(sandbox_err)? {
            self.runtime.create(&self.spec).await.map_err(sandbox_err)?;
        }
        self.runtime
            .start(&self.container_name)
            .await
            .map_err(sandbox_err)?;
        Ok(())
    }

    /// Stop the container, keeping it (and its filesystem) for the next turn.
    pub async fn stop(&self) -> Result<()> {
        let _guard = self.exec_lock.lock().await;
        match self.runtime.stop(&self.container_name).await {
            Ok(()) | Err(SandboxError::Missing(_)) => Ok(()),
            Err(e) => Err(sandbox_err(e)),
        }
    }

    /// Remove the container entirely (used when the skill set changes).
    pub async fn destroy(&self) -> Result<()> {
        let _guard = self.exec_lock.lock().await;
        self.runtime
            .remove(&self.container_name)
            .await
            .map_err(sandbox_err)
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Execution
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Run a shell command inside the container.
    ///
    /// The timeout is clamped to the configured maximum; output above the
    /// byte ceiling is truncated with `truncated = true`. A timed-out
    /// command is reported in-band so the model can observe and recover.
    pub async fn execute(
        &self,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<ExecuteResponse> {
        let timeout = timeout
            .unwrap_or(self.limits.default_timeout)
            .min(self.limits.max_timeout);

        let _guard = self.exec_lock.lock().await;
        let result = self.shell_exec_locked(command, timeout).await;

        let raw = match result {
            Err(SandboxError::Timeout(d)) => {
                return Ok(ExecuteResponse {
                    output: format!("[command timed out after {}s]", d.as_secs()),
                    exit_code: -1,
                    truncated: false,
                })
            }
            other => other.map_err(sandbox_err)?,
        };

        let mut output = raw.output;
        let truncated = commands::truncate_output(&mut output, self.limits.max_output_bytes);
        Ok(ExecuteResponse {
            output,
            exit_code: raw.exit_code,
            truncated,
        })
    }

    /// Exec under the held lock, recreating the container once when the
    /// runtime reports it missing. Repeated failure is fatal for the turn.
    async fn shell_exec_locked(
        &self,
        command: &str,
        timeout: Duration,
    ) -> std::result::Result<crate::runtime::ExecOutput, SandboxError> {
        let argv = vec!["sh".to_string(), "-c".to_string(), command.to_string()];
        match self.runtime.exec(&self.container_name, &argv, timeout).await {
            Err(SandboxError::Missing(_)) => {
                tracing::warn!(
                    container = %self.container_name,
                    "container missing, recreating once"
                );
                self.ensure_running_locked()
                    .await
                    .map_err(|e| SandboxError::Runtime(e.to_string()))?;
                self.runtime.exec(&self.container_name, &argv, timeout).await
            }
            other => other,
        }
    }

    /// Internal exec for the file tools: same lock, retry and truncation,
    /// default timeout.
    async fn tool_exec(&self, command: &str) -> Result<ExecuteResponse> {
        self.execute(command, None).await
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // File tools (all in-container)
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Raw file contents, no line numbers. Used by edit and skill loading.
    pub async fn read_raw(&self, path: &str) -> Result<String> {
        let resp = self.tool_exec(&commands::cat_command(path)).await?;
        if resp.exit_code != 0 {
            return Err(Error::Sandbox(format!(
                "cannot read '{path}': {}",
                resp.output.trim()
            )));
        }
        Ok(resp.output)
    }

    /// File contents with line numbers, offset (0-indexed) and limit.
    pub async fn read(&self, path: &str, offset: usize, limit: usize) -> Result<String> {
        let content = self.read_raw(path).await?;
        Ok(commands::number_lines(&content, offset, limit))
    }

    /// Create or overwrite a file, creating parent directories.
    pub async fn write(&self, path: &str, content: &str) -> Result<WriteResult> {
        let encoded = BASE64.encode(content.as_bytes());
        let resp = self.tool_exec(&commands::write_command(path, &encoded)).await?;
        if resp.exit_code != 0 {
            return Err(Error::Sandbox(format!(
                "cannot write '{path}': {}",
                resp.output.trim()
            )));
        }
        Ok(WriteResult {
            path: path.to_string(),
            lines_written: content.lines().count(),
        })
    }

    /// Replace `old` with `new`. Unless `replace_all`, `old` must occur
    /// exactly once; nothing is written otherwise.
    pub async fn edit(
        &self,
        path: &str,
        old: &str,
        new: &str,
        replace_all: bool,
    ) -> Result<EditResult> {
        if old.is_empty() {
            return Err(Error::Sandbox("old_string must not be empty".into()));
        }
        let content = self.read_raw(path).await?;
        let occurrences = content.matches(old).count();
        if occurrences == 0 {
            return Err(Error::Sandbox(format!(
                "old_string not found in '{path}'"
            )));
        }
        if occurrences > 1 && !replace_all {
            return Err(Error::Sandbox(format!(
                "old_string occurs {occurrences} times in '{path}'; pass replace_all or make it unique"
            )));
        }

        let updated = if replace_all {
            content.replace(old, new)
        } else {
            content.replacen(old, new, 1)
        };
        self.write(path, &updated).await?;
        Ok(EditResult {
            path: path.to_string(),
            occurrences: if replace_all { occurrences } else { 1 },
        })
    }

    /// Files matching a glob pattern under `base`.
    pub async fn glob(&self, pattern: &str, base: &str) -> Result<Vec<String>> {
        let resp = self.tool_exec(&commands::glob_command(base, pattern)).await?;
        Ok(resp
            .output
            .lines()
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Regex search. `grep` exit code 1 means no matches, not a failure.
    pub async fn grep(
        &self,
        pattern: &str,
        path: Option<&str>,
        include_glob: Option<&str>,
    ) -> Result<Vec<GrepMatch>> {
        let path = path.unwrap_or("/workspace");
        let resp = self
            .tool_exec(&commands::grep_command(pattern, path, include_glob))
            .await?;
        match resp.exit_code {
            0 => Ok(commands::parse_grep_output(&resp.output)),
            1 => Ok(Vec::new()),
            _ => Err(Error::Sandbox(format!(
                "grep failed: {}",
                resp.output.trim()
            ))),
        }
    }

    pub async fn ls(&self, path: &str) -> Result<Vec<LsEntry>> {
        let resp = self.tool_exec(&commands::ls_command(path)).await?;
        if resp.exit_code != 0 {
            return Err(Error::Sandbox(format!(
                "cannot list '{path}': {}",
                resp.output.trim()
            )));
        }
        Ok(commands::parse_ls_output(&resp.output))
    }

    /// All files under the workspace trees (uploads, intermediate, skills
    /// minus SKILL.md). Feeds the workspace summary in the system prompt.
    pub async fn discover_files(&self) -> Result<Vec<String>> {
        let mut paths = Vec::new();
        for cmd in commands::discover_commands() {
            let resp = self.tool_exec(cmd).await?;
            if resp.exit_code != 0 {
                continue;
            }
            paths.extend(
                resp.output
                    .lines()
                    .filter(|l| !l.is_empty())
                    .map(str::to_string),
            );
        }
        Ok(paths)
    }
}

fn sandbox_err(e: SandboxError) -> Error {
    Error::Sandbox(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockRuntime;

    fn limits() -> SandboxLimits {
        SandboxLimits {
            default_timeout: Duration::from_secs(120),
            max_timeout: Duration::from_secs(600),
            max_output_bytes: 64,
        }
    }

    fn sandbox(runtime: Arc<MockRuntime>) -> Sandbox {
        Sandbox::new(
            runtime,
            7,
            42,
            ImageConfig::default(),
            VolumeLayout {
                uploads_host: "/data/uploads/7/42".into(),
                intermediate_host: "/data/intermediate/7/42".into(),
                skill_mounts: vec![("pdf".into(), "/data/skills/pdf".into())],
            },
            vec!["pdf".into()],
            limits(),
        )
    }

    #[test]
    fn container_name_encodes_pair() {
        assert_eq!(container_name(7, 42), "dg-sandbox-7-42");
    }

    #[test]
    fn spec_mounts_skills_read_only() {
        let rt = MockRuntime::new();
        let sb = sandbox(rt);
        let binds: Vec<String> = sb.spec.binds.iter().map(|b| b.to_bind_string()).collect();
        assert!(binds.contains(&"/data/uploads/7/42:/workspace/uploads".to_string()));
        assert!(binds.contains(&"/data/skills/pdf:/workspace/skills/pdf:ro".to_string()));
        assert!(sb.spec.network_disabled);
    }

    #[tokio::test]
    async fn ensure_running_creates_once() {
        let rt = MockRuntime::new();
        let sb = sandbox(rt.clone());
        sb.ensure_running().await.unwrap();
        sb.ensure_running().await.unwrap();
        assert_eq!(rt.create_count(), 1);
        assert_eq!(rt.start_count(), 2);
    }

    #[tokio::test]
    async fn execute_truncates_long_output() {
        let rt = MockRuntime::new();
        rt.push_output(&"x".repeat(200), 0);
        let sb = sandbox(rt);
        let resp = sb.execute("yes | head -200", None).await.unwrap();
        assert!(resp.truncated);
        assert_eq!(resp.output.len(), 64);
        assert_eq!(resp.exit_code, 0);
    }

    #[tokio::test]
    async fn execute_recreates_missing_container_once() {
        let rt = MockRuntime::new();
        rt.push_err(SandboxError::Missing("dg-sandbox-7-42".into()));
        rt.push_output("recovered", 0);
        let sb = sandbox(rt.clone());
        let resp = sb.execute("echo recovered", None).await.unwrap();
        assert_eq!(resp.output, "recovered");
        assert_eq!(rt.create_count(), 1);
    }

    #[tokio::test]
    async fn execute_repeated_missing_is_fatal() {
        let rt = MockRuntime::new();
        rt.push_err(SandboxError::Missing("c".into()));
        rt.push_err(SandboxError::Missing("c".into()));
        let sb = sandbox(rt);
        assert!(sb.execute("echo hi", None).await.is_err());
    }

    #[tokio::test]
    async fn execute_reports_timeout_in_band() {
        let rt = MockRuntime::new();
        rt.push_err(SandboxError::Timeout(Duration::from_secs(120)));
        let sb = sandbox(rt);
        let resp = sb.execute("sleep 1000", None).await.unwrap();
        assert_eq!(resp.exit_code, -1);
        assert!(resp.output.contains("timed out"));
    }

    #[tokio::test]
    async fn read_numbers_lines() {
        let rt = MockRuntime::new();
        rt.push_output("alpha\nbeta\ngamma", 0);
        let sb = sandbox(rt);
        let out = sb.read("/workspace/uploads/a.txt", 0, 2).await.unwrap();
        assert_eq!(out, "     1\talpha\n     2\tbeta");
    }

    #[tokio::test]
    async fn read_missing_file_is_tool_error() {
        let rt = MockRuntime::new();
        rt.push_output("cat: /x: No such file or directory", 1);
        let sb = sandbox(rt);
        assert!(sb.read("/x", 0, 100).await.is_err());
    }

    #[tokio::test]
    async fn edit_requires_unique_match() {
        let rt = MockRuntime::new();
        rt.push_output("foo bar foo", 0); // cat for edit
        let sb = sandbox(rt);
        let err = sb.edit("/f", "foo", "baz", false).await.unwrap_err();
        assert!(err.to_string().contains("occurs 2 times"));
    }

    #[tokio::test]
    async fn edit_replace_all_rewrites_every_match() {
        let rt = MockRuntime::new();
        rt.push_output("foo bar foo", 0); // cat
        rt.push_output("", 0); // write
        let sb = sandbox(rt.clone());
        let result = sb.edit("/f", "foo", "baz", true).await.unwrap();
        assert_eq!(result.occurrences, 2);
        // The write command carries the base64 of the replaced content.
        let written = rt.exec_commands().pop().unwrap();
        assert!(written.contains(&BASE64.encode("baz bar baz")));
    }

    #[tokio::test]
    async fn grep_no_matches_is_empty() {
        let rt = MockRuntime::new();
        rt.push_output("", 1);
        let sb = sandbox(rt);
        assert!(sb.grep("needle", None, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn discover_files_merges_all_trees() {
        let rt = MockRuntime::new();
        rt.push_output("/workspace/uploads/data.csv", 0);
        rt.push_output("/workspace/intermediate/out.txt", 0);
        rt.push_output("/workspace/skills/pdf/extract.py", 0);
        let sb = sandbox(rt);
        let files = sb.discover_files().await.unwrap();
        assert_eq!(
            files,
            vec![
                "/workspace/uploads/data.csv",
                "/workspace/intermediate/out.txt",
                "/workspace/skills/pdf/extract.py",
            ]
        );
    }
}
