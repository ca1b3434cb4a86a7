//! Admin CRUD for LLM model configurations. Mutations invalidate the
//! provider-instance cache entry so the next turn rebuilds the client.

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;

use dg_domain::error::Error;

use crate::auth::RequireAdmin;
use crate::error::ApiError;
use crate::state::AppState;

pub async fn list(
    State(state): State<AppState>,
    RequireAdmin(_admin): RequireAdmin,
) -> Result<impl IntoResponse, ApiError> {
    let rows = state.repo.list_llm_models().await?;
    // Never echo API keys back out.
    let sanitized: Vec<_> = rows
        .into_iter()
        .map(|m| {
            serde_json::json!({
                "name": m.name,
                "base_url": m.base_url,
                "model_id": m.model_id,
                "is_default": m.is_default,
                "for_titles": m.for_titles,
                "is_active": m.is_active,
            })
        })
        .collect();
    Ok(Json(sanitized))
}

#[derive(Debug, Deserialize)]
pub struct ModelBody {
    pub name: String,
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    pub model_id: String,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub for_titles: bool,
}

pub async fn create(
    State(state): State<AppState>,
    RequireAdmin(_admin): RequireAdmin,
    Json(body): Json<ModelBody>,
) -> Result<impl IntoResponse, ApiError> {
    if body.name.trim().is_empty() || body.base_url.trim().is_empty() {
        return Err(ApiError(Error::Validation(
            "model name and base_url are required".into(),
        )));
    }
    state
        .repo
        .insert_llm_model(
            &body.name,
            &body.base_url,
            &body.api_key,
            &body.model_id,
            body.is_default,
            body.for_titles,
        )
        .await?;
    state.providers.invalidate(&body.name);
    Ok(Json(serde_json::json!({ "name": body.name })))
}

pub async fn delete(
    State(state): State<AppState>,
    RequireAdmin(_admin): RequireAdmin,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let deleted = state.repo.delete_llm_model(&name).await?;
    if !deleted {
        return Err(ApiError(Error::not_found("llm model", name)));
    }
    state.providers.invalidate(&name);
    Ok(Json(serde_json::json!({ "deleted": true })))
}
