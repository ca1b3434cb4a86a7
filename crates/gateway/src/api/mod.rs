//! HTTP API surface. The chat endpoint is the core; everything else is
//! CRUD around conversations, todos, skills, MCP servers and model
//! configurations.

pub mod chat;
pub mod conversations;
pub mod mcp_servers;
pub mod models;
pub mod skills;
pub mod todos;

use axum::routing::{get, patch, post, put};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/conversations",
            get(conversations::list).post(conversations::create),
        )
        .route(
            "/api/conversations/:id",
            get(conversations::get_one).delete(conversations::delete),
        )
        .route("/api/conversations/:id/archive", post(conversations::archive))
        .route("/api/conversations/:id/star", post(conversations::star))
        .route("/api/conversations/:id/messages", get(conversations::messages))
        .route(
            "/api/conversations/:id/todos",
            get(todos::get_todos).put(todos::put_todos),
        )
        .route("/api/conversations/:id/chat", post(chat::chat))
        .route("/api/skills", get(skills::list).post(skills::install))
        .route(
            "/api/skills/:name",
            patch(skills::set_active).delete(skills::uninstall),
        )
        .route(
            "/api/mcp-servers",
            get(mcp_servers::list).post(mcp_servers::create),
        )
        .route("/api/mcp-servers/config", get(mcp_servers::config_dump))
        .route("/api/mcp-tools", get(mcp_servers::list_tools))
        .route(
            "/api/mcp-servers/:name",
            put(mcp_servers::update).delete(mcp_servers::delete),
        )
        .route("/api/models", get(models::list).post(models::create))
        .route("/api/models/:name", axum::routing::delete(models::delete))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
