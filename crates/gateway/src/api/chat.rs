//! `POST /api/conversations/{id}/chat` — run one turn, streamed as SSE.
//!
//! Every frame is `data: <json>\n\n` with a `type` field of `text`,
//! `tool_call`, `tool_result`, or `error`. Setup failures (unknown
//! conversation, wrong owner, bad model name) are rejected as plain HTTP
//! errors before the stream starts.

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use futures_core::Stream;
use serde::Deserialize;

use dg_domain::error::Error;
use dg_domain::selection::Selection;

use crate::auth::CurrentUser;
use crate::error::ApiError;
use crate::runtime::{resolve_provider, run_turn, TurnEvent, TurnInput};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ChatBody {
    pub message: String,
    #[serde(default)]
    pub model_name: Option<String>,
    #[serde(default)]
    pub upload_path: Option<String>,
    #[serde(default)]
    pub enable_subagents: bool,
    #[serde(default)]
    pub mcp_tools: Selection,
    #[serde(default)]
    pub skills: Selection,
}

pub async fn chat(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(conversation_id): Path<i64>,
    Json(body): Json<ChatBody>,
) -> Result<impl IntoResponse, ApiError> {
    if body.message.trim().is_empty() {
        return Err(ApiError(Error::Validation("message must not be empty".into())));
    }

    // Ownership check before anything streams.
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
    if conversation.archived {
        return Err(ApiError(Error::Validation(
            "conversation is archived".into(),
        )));
    }

    // Resolve the model now so a bad name is a 404, not an error frame.
    let provider = resolve_provider(&state, body.model_name.as_deref()).await?;

    // One turn at a time per conversation; a second request waits here.
    let permit = state.conversation_locks.acquire(conversation_id).await;

    let input = TurnInput {
        user,
        conversation_id,
        message: body.message,
        provider,
        enable_subagents: body.enable_subagents,
        tool_selection: body.mcp_tools,
        skill_selection: body.skills,
        upload_path: body.upload_path,
    };
    let rx = run_turn(state, input, permit);

    Ok(Sse::new(event_stream(rx)).keep_alive(KeepAlive::default()))
}

fn event_stream(
    mut rx: tokio::sync::mpsc::Receiver<TurnEvent>,
) -> impl Stream<Item = Result<Event, std::convert::Infallible>> {
    async_stream::stream! {
        while let Some(event) = rx.recv().await {
            let data = serde_json::to_string(&event).unwrap_or_default();
            yield Ok(Event::default().data(data));
        }
    }
}
