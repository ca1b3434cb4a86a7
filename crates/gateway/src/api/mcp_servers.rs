//! Admin CRUD for MCP server configurations. Every mutation invalidates
//! the registry snapshot (next turn reloads and re-hashes) and the
//! permission cache.

use std::collections::HashMap;

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;

use dg_domain::config::{McpServerConfig, McpTransportKind};
use dg_domain::error::Error;

use crate::auth::RequireAdmin;
use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ServerBody {
    pub name: String,
    pub transport: McpTransportKind,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "d_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "d_active")]
    pub is_active: bool,
}

fn d_timeout() -> u64 {
    30
}
fn d_active() -> bool {
    true
}

impl ServerBody {
    fn into_config(self) -> (McpServerConfig, bool) {
        (
            McpServerConfig {
                name: self.name,
                transport: self.transport,
                command: self.command,
                args: self.args,
                env: self.env,
                url: self.url,
                timeout_secs: self.timeout_secs,
            },
            self.is_active,
        )
    }
}

fn invalidate(state: &AppState) {
    state.mcp.invalidate();
    state.permissions.invalidate_all();
}

pub async fn list(
    State(state): State<AppState>,
    RequireAdmin(_admin): RequireAdmin,
) -> Result<impl IntoResponse, ApiError> {
    let servers = state.repo.list_mcp_servers(false).await?;
    Ok(Json(servers))
}

/// The assembled `{name → {command,args,env} | {url,transport}}` dump of
/// the active configuration snapshot.
pub async fn config_dump(
    State(state): State<AppState>,
    RequireAdmin(_admin): RequireAdmin,
) -> Result<impl IntoResponse, ApiError> {
    let snapshot = match state.mcp.current() {
        Some(snapshot) => snapshot,
        None => {
            let rows = state.repo.list_mcp_servers(true).await?;
            state.mcp.install(rows.iter().map(|r| r.to_config()).collect())
        }
    };
    Ok(Json(serde_json::json!({
        "hash": snapshot.hash,
        "servers": snapshot.dump(),
    })))
}

/// Tool rows known to the permission system.
pub async fn list_tools(
    State(state): State<AppState>,
    RequireAdmin(_admin): RequireAdmin,
) -> Result<impl IntoResponse, ApiError> {
    let tools = state.repo.list_mcp_tools(false).await?;
    Ok(Json(tools))
}

pub async fn create(
    State(state): State<AppState>,
    RequireAdmin(_admin): RequireAdmin,
    Json(body): Json<ServerBody>,
) -> Result<impl IntoResponse, ApiError> {
    if state.repo.get_mcp_server(&body.name).await?.is_some() {
        return Err(ApiError(Error::Validation(format!(
            "MCP server '{}' already exists",
            body.name
        ))));
    }
    let (config, is_active) = body.into_config();
    state.repo.insert_mcp_server(&config, is_active).await?;
    invalidate(&state);
    Ok(Json(serde_json::json!({ "name": config.name })))
}

pub async fn update(
    State(state): State<AppState>,
    RequireAdmin(_admin): RequireAdmin,
    Path(name): Path<String>,
    Json(body): Json<ServerBody>,
) -> Result<impl IntoResponse, ApiError> {
    let (config, is_active) = body.into_config();
    let updated = state.repo.update_mcp_server(&name, &config, is_active).await?;
    if !updated {
        return Err(ApiError(Error::not_found("MCP server", name)));
    }
    invalidate(&state);
    Ok(Json(serde_json::json!({ "name": config.name })))
}

pub async fn delete(
    State(state): State<AppState>,
    RequireAdmin(_admin): RequireAdmin,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let deleted = state.repo.delete_mcp_server(&name).await?;
    if !deleted {
        return Err(ApiError(Error::not_found("MCP server", name)));
    }
    invalidate(&state);
    Ok(Json(serde_json::json!({ "deleted": true })))
}
