//! Skill catalog endpoints: listing (permission-scoped), archive install
//! (admin), and activation toggles (admin). Installs sync the skills table
//! so permissions can reference the new skill immediately.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;

use dg_domain::error::Error;

use crate::auth::{CurrentUser, RequireAdmin};
use crate::error::ApiError;
use crate::state::AppState;

/// Skills visible to the caller: everything for admins, the permitted set
/// for everyone else.
pub async fn list(
    State(state): State<AppState>,
    user: CurrentUser,
) -> Result<impl IntoResponse, ApiError> {
    let rows = state.repo.list_skills(true).await?;
    if user.is_admin {
        return Ok(Json(rows));
    }

    let store_user = state
        .repo
        .get_user(user.id)
        .await?
        .ok_or_else(|| Error::not_found("user", user.id))?;
    let permitted = state.permissions.resolve_skills(&store_user).await;
    let visible: Vec<_> = rows
        .into_iter()
        .filter(|s| permitted.contains(&s.name))
        .collect();
    Ok(Json(visible))
}

/// `POST /api/skills` with a raw `.tar.gz` body.
pub async fn install(
    State(state): State<AppState>,
    RequireAdmin(_admin): RequireAdmin,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    if body.is_empty() {
        return Err(ApiError(Error::Validation("empty archive body".into())));
    }

    let skills_root = state.config.storage.skills_dir();
    std::fs::create_dir_all(&skills_root).map_err(Error::Io)?;
    let skill = dg_skills::installer::install_archive(&skills_root, &body)?;

    // Keep the skills table in step with the directory on disk.
    state
        .repo
        .upsert_skill(
            &skill.name,
            &skill.version,
            &skill.description,
            &skill.path.to_string_lossy(),
            &skill.tags,
        )
        .await?;
    state.permissions.invalidate_all();

    Ok(Json(skill))
}

/// Remove a skill: its directory on disk and its catalog row.
pub async fn uninstall(
    State(state): State<AppState>,
    RequireAdmin(_admin): RequireAdmin,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let removed_dir =
        dg_skills::installer::uninstall(&state.config.storage.skills_dir(), &name)?;
    let removed_row = state.repo.delete_skill(&name).await?;
    if !removed_dir && !removed_row {
        return Err(ApiError(Error::not_found("skill", name)));
    }
    state.permissions.invalidate_all();
    Ok(Json(serde_json::json!({ "deleted": true })))
}

#[derive(Debug, Deserialize)]
pub struct SetActiveBody {
    pub is_active: bool,
}

pub async fn set_active(
    State(state): State<AppState>,
    RequireAdmin(_admin): RequireAdmin,
    Path(name): Path<String>,
    Json(body): Json<SetActiveBody>,
) -> Result<impl IntoResponse, ApiError> {
    let updated = state.repo.set_skill_active(&name, body.is_active).await?;
    if !updated {
        return Err(ApiError(Error::not_found("skill", name)));
    }
    state.permissions.invalidate_all();
    Ok(Json(serde_json::json!({ "name": name, "is_active": body.is_active })))
}
