use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Server configuration, deserialized from `deepgate.toml` with environment
/// overrides applied by [`Config::apply_env`].
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub subagents: SubagentConfig,
}

impl Config {
    /// Load from a TOML file, then apply environment overrides.
    pub fn load(path: Option<&std::path::Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p)?;
                toml::from_str(&raw).map_err(|e| Error::Config(e.to_string()))?
            }
            None => Config::default(),
        };
        config.apply_env();
        Ok(config)
    }

    /// Environment overrides: secrets and deployment-specific paths.
    pub fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("DEEPGATE_BASE_DIR") {
            self.storage.base_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("DEEPGATE_HOST_DIR") {
            self.storage.host_dir = Some(PathBuf::from(v));
        }
        if let Ok(v) = std::env::var("DEEPGATE_DATABASE_URL") {
            self.database.url = v;
        }
        if let Ok(v) = std::env::var("JWT_SECRET_KEY") {
            self.auth.jwt_secret = v;
        }
        if let Ok(v) = std::env::var("JWT_ALGORITHM") {
            self.auth.jwt_algorithm = v;
        }
        if let Ok(v) = std::env::var("JWT_ACCESS_TOKEN_EXPIRE_MINUTES") {
            if let Ok(minutes) = v.parse() {
                self.auth.access_token_expire_minutes = minutes;
            }
        }
    }

    /// Validate cross-field constraints. Called once at startup.
    pub fn validate(&self) -> Result<()> {
        if self.auth.jwt_secret.is_empty() {
            return Err(Error::Config(
                "auth.jwt_secret is empty; set JWT_SECRET_KEY".into(),
            ));
        }
        if self.sandbox.default_timeout_secs > self.sandbox.max_timeout_secs {
            return Err(Error::Config(format!(
                "sandbox.default_timeout_secs ({}) exceeds max_timeout_secs ({})",
                self.sandbox.default_timeout_secs, self.sandbox.max_timeout_secs
            )));
        }
        Ok(())
    }

    /// The host-visible base directory for bind mounts. When the server
    /// itself runs in a container, `storage.host_dir` names the same tree as
    /// seen by the Docker daemon; otherwise it equals `base_dir`.
    pub fn mount_base(&self) -> &std::path::Path {
        self.storage
            .host_dir
            .as_deref()
            .unwrap_or(&self.storage.base_dir)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_host")]
    pub host: String,
    #[serde(default = "d_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: d_host(),
            port: d_port(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Database
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// sqlx connection URL, e.g. `sqlite://deepgate.db`.
    #[serde(default = "d_db_url")]
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { url: d_db_url() }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Storage layout
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Persisted file layout:
/// - `{base}/uploads/{user_id}/{conversation_id}/` — user uploads (rw mount)
/// - `{base}/intermediate/{user_id}/{conversation_id}/` — model artifacts (rw mount)
/// - `{base}/skills/{name}/SKILL.md` + resources — canonical skills (ro mounts)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "d_base_dir")]
    pub base_dir: PathBuf,
    /// Same tree as `base_dir`, but as seen by the Docker daemon. Only set
    /// when the gateway itself is containerized.
    #[serde(default)]
    pub host_dir: Option<PathBuf>,
}

impl StorageConfig {
    pub fn skills_dir(&self) -> PathBuf {
        self.base_dir.join("skills")
    }

    pub fn uploads_dir(&self, user_id: i64, conversation_id: i64) -> PathBuf {
        self.base_dir
            .join("uploads")
            .join(user_id.to_string())
            .join(conversation_id.to_string())
    }

    pub fn intermediate_dir(&self, user_id: i64, conversation_id: i64) -> PathBuf {
        self.base_dir
            .join("intermediate")
            .join(user_id.to_string())
            .join(conversation_id.to_string())
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_dir: d_base_dir(),
            host_dir: None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Auth
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// HMAC secret for JWT verification. Required; set via `JWT_SECRET_KEY`.
    #[serde(default)]
    pub jwt_secret: String,
    #[serde(default = "d_jwt_alg")]
    pub jwt_algorithm: String,
    #[serde(default = "d_expire_minutes")]
    pub access_token_expire_minutes: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            jwt_algorithm: d_jwt_alg(),
            access_token_expire_minutes: d_expire_minutes(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sandbox
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    #[serde(default)]
    pub image: ImageConfig,
    /// Default `execute` timeout in seconds.
    #[serde(default = "d_exec_timeout")]
    pub default_timeout_secs: u64,
    /// Hard cap on any requested `execute` timeout.
    #[serde(default = "d_exec_timeout_cap")]
    pub max_timeout_secs: u64,
    /// Command output above this many bytes is truncated.
    #[serde(default = "d_max_output")]
    pub max_output_bytes: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: ImageConfig::default(),
            default_timeout_secs: d_exec_timeout(),
            max_timeout_secs: d_exec_timeout_cap(),
            max_output_bytes: d_max_output(),
        }
    }
}

/// Describes a pre-built sandbox image: what is installed and what the
/// environment can do. Surfaced verbatim into the dynamic system prompt so
/// the model knows what is available without trying to install anything.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageConfig {
    /// Configuration name ("data-analysis", "web-dev").
    #[serde(default = "d_image_name")]
    pub name: String,
    /// Docker image reference.
    #[serde(default = "d_image_ref")]
    pub image: String,
    /// Capability description injected into the system prompt.
    #[serde(default)]
    pub description: String,
    #[serde(default = "d_work_dir")]
    pub work_dir: String,
    /// Packages already present in the image (no installation needed).
    #[serde(default)]
    pub pre_installed_packages: Vec<String>,
    /// Capability tags ("excel", "charts", "pandas").
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            name: d_image_name(),
            image: d_image_ref(),
            description: String::new(),
            work_dir: d_work_dir(),
            pre_installed_packages: Vec::new(),
            capabilities: Vec::new(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LLM
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// HTTP request timeout for provider calls, seconds.
    #[serde(default = "d_llm_timeout")]
    pub request_timeout_secs: u64,
    /// Maximum model→tool→model iterations per turn.
    #[serde(default = "d_max_tool_loops")]
    pub max_tool_loops: usize,
    #[serde(default)]
    pub title: TitleConfig,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: d_llm_timeout(),
            max_tool_loops: d_max_tool_loops(),
            title: TitleConfig::default(),
        }
    }
}

/// Background title generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TitleConfig {
    #[serde(default = "d_true")]
    pub enabled: bool,
    /// Maximum title length in characters.
    #[serde(default = "d_title_chars")]
    pub max_chars: usize,
}

impl Default for TitleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_chars: d_title_chars(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Subagents
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubagentConfig {
    /// Maximum model→tool→model iterations inside a `task` call.
    #[serde(default = "d_subagent_loops")]
    pub max_tool_loops: usize,
}

impl Default for SubagentConfig {
    fn default() -> Self {
        Self {
            max_tool_loops: d_subagent_loops(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// MCP server configuration (shared with store + mcp-client)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum McpTransportKind {
    Stdio,
    Http,
    Sse,
}

impl std::fmt::Display for McpTransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            McpTransportKind::Stdio => write!(f, "stdio"),
            McpTransportKind::Http => write!(f, "http"),
            McpTransportKind::Sse => write!(f, "sse"),
        }
    }
}

impl std::str::FromStr for McpTransportKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "stdio" => Ok(McpTransportKind::Stdio),
            "http" => Ok(McpTransportKind::Http),
            "sse" => Ok(McpTransportKind::Sse),
            other => Err(Error::Validation(format!(
                "unknown MCP transport '{other}' (expected stdio|http|sse)"
            ))),
        }
    }
}

/// One MCP server, assembled from its admin-managed row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpServerConfig {
    pub name: String,
    pub transport: McpTransportKind,
    /// Executable for stdio transports.
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Endpoint for http/sse transports.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "d_mcp_timeout")]
    pub timeout_secs: u64,
}

impl McpServerConfig {
    /// Transport-specific field requirements: stdio needs `command`,
    /// http/sse need `url`.
    pub fn validate(&self) -> Result<()> {
        match self.transport {
            McpTransportKind::Stdio => {
                if self.command.as_deref().unwrap_or("").is_empty() {
                    return Err(Error::Validation(format!(
                        "MCP server '{}': stdio transport requires a command",
                        self.name
                    )));
                }
            }
            McpTransportKind::Http | McpTransportKind::Sse => {
                if self.url.as_deref().unwrap_or("").is_empty() {
                    return Err(Error::Validation(format!(
                        "MCP server '{}': {} transport requires a url",
                        self.name, self.transport
                    )));
                }
            }
        }
        Ok(())
    }
}

// ── Serde default helpers ──────────────────────────────────────────

fn d_host() -> String {
    "127.0.0.1".into()
}
fn d_port() -> u16 {
    8040
}
fn d_db_url() -> String {
    "sqlite://deepgate.db".into()
}
fn d_base_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn d_jwt_alg() -> String {
    "HS256".into()
}
fn d_expire_minutes() -> u64 {
    60 * 24
}
fn d_exec_timeout() -> u64 {
    120
}
fn d_exec_timeout_cap() -> u64 {
    600
}
fn d_max_output() -> usize {
    48_000
}
fn d_image_name() -> String {
    "general".into()
}
fn d_image_ref() -> String {
    "deepgate-sandbox".into()
}
fn d_work_dir() -> String {
    "/workspace".into()
}
fn d_llm_timeout() -> u64 {
    120
}
fn d_max_tool_loops() -> usize {
    25
}
fn d_title_chars() -> usize {
    15
}
fn d_subagent_loops() -> usize {
    15
}
fn d_mcp_timeout() -> u64 {
    30
}
fn d_true() -> bool {
    true
}
