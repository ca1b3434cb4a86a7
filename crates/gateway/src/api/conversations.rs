//! Conversation CRUD. Every route is owner-scoped; admins bypass the
//! ownership check.

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;

use dg_domain::error::Error;
use dg_store::entities::Conversation;

use crate::auth::CurrentUser;
use crate::error::ApiError;
use crate::state::AppState;

/// Fetch a conversation the caller may act on.
pub(crate) async fn load_owned(
    state: &AppState,
    user: &CurrentUser,
    conversation_id: i64,
) -> Result<Conversation, ApiError> {
    let conversation = state
        .repo
        .get_conversation(conversation_id)
        .await?
        .ok_or_else(|| Error::not_found("conversation", conversation_id))?;
    if conversation.owner_user_id != user.id && !user.is_admin {
        return Err(ApiError(Error::PermissionDenied(format!(
            "conversation {conversation_id} is not owned by user {}",
            user.id
        ))));
    }
    Ok(conversation)
}

pub async fn list(
    State(state): State<AppState>,
    user: CurrentUser,
) -> Result<impl IntoResponse, ApiError> {
    let conversations = state.repo.list_conversations(user.id).await?;
    Ok(Json(conversations))
}

#[derive(Debug, Deserialize)]
pub struct CreateBody {
    #[serde(default)]
    pub title: Option<String>,
}

pub async fn create(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(body): Json<CreateBody>,
) -> Result<impl IntoResponse, ApiError> {
    let conversation = state
        .repo
        .create_conversation(user.id, body.title.as_deref())
        .await?;
    Ok(Json(conversation))
}

pub async fn get_one(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let conversation = load_owned(&state, &user, id).await?;
    Ok(Json(conversation))
}

pub async fn delete(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    load_owned(&state, &user, id).await?;
    state.repo.delete_conversation(id).await?;
    Ok(Json(serde_json::json!({ "deleted": true })))
}

#[derive(Debug, Deserialize)]
pub struct FlagBody {
    pub value: bool,
}

pub async fn archive(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<i64>,
    Json(body): Json<FlagBody>,
) -> Result<impl IntoResponse, ApiError> {
    load_owned(&state, &user, id).await?;
    state.repo.set_archived(id, body.value).await?;
    Ok(Json(serde_json::json!({ "archived": body.value })))
}

pub async fn star(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<i64>,
    Json(body): Json<FlagBody>,
) -> Result<impl IntoResponse, ApiError> {
    load_owned(&state, &user, id).await?;
    state.repo.set_starred(id, body.value).await?;
    Ok(Json(serde_json::json!({ "starred": body.value })))
}

pub async fn messages(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    load_owned(&state, &user, id).await?;
    let rows = state.repo.list_messages(id).await?;
    Ok(Json(rows))
}
