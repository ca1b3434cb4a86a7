//! Todo endpoints: read and replace a conversation's todo list outside a
//! running turn, with the same validation the `write_todos` tool applies.

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;

use dg_domain::todo::{validate_todos, Todo};
use dg_store::entities::ConversationState;

use crate::api::conversations::load_owned;
use crate::auth::CurrentUser;
use crate::error::ApiError;
use crate::state::AppState;

pub async fn get_todos(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let conversation = load_owned(&state, &user, id).await?;
    Ok(Json(conversation.state.todos))
}

#[derive(Debug, Deserialize)]
pub struct PutTodosBody {
    pub todos: Vec<Todo>,
}

pub async fn put_todos(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<i64>,
    Json(body): Json<PutTodosBody>,
) -> Result<impl IntoResponse, ApiError> {
    validate_todos(&body.todos)?;

    let conversation = load_owned(&state, &user, id).await?;
    let new_state = ConversationState {
        todos: body.todos.clone(),
        uploads: conversation.state.uploads,
    };
    state.repo.save_state(id, &new_state).await?;
    Ok(Json(body.todos))
}
