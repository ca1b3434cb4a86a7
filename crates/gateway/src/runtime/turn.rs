//! Turn execution: the streaming state machine that consumes LLM events,
//! persists them in step order, drives tools, and emits client frames.
//!
//! Entry point: [`run_turn`] spawns the loop and returns a channel of
//! [`TurnEvent`]s for SSE delivery.
//!
//! Persistence ordering, which readback correctness depends on:
//! 1. the user row is written before the first LLM call;
//! 2. a model-with-tool-calls row is written after its batch's results are
//!    in but before any of that batch's tool-return rows, so every prefix
//!    of the table stays a valid alternation — a crash can lose a whole
//!    batch, never half of one;
//! 3. the final text row is written last, followed by the state blob.

use std::collections::HashMap;

use futures_util::StreamExt;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::OwnedSemaphorePermit;

use dg_domain::error::{Error, Result};
use dg_domain::selection::Selection;
use dg_domain::stream::StreamEvent;
use dg_domain::tool::{Message, ToolCall};
use dg_mcp_client::McpToolset;
use dg_providers::ChatRequest;
use dg_store::entities::ConversationState;

use super::{prompt, title, tools, TurnContext};
use crate::auth::CurrentUser;
use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Input / events
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct TurnInput {
    pub user: CurrentUser,
    pub conversation_id: i64,
    pub message: String,
    /// Resolved by the chat handler (named model config or the default).
    pub provider: std::sync::Arc<dyn dg_providers::LlmProvider>,
    pub enable_subagents: bool,
    pub tool_selection: Selection,
    pub skill_selection: Selection,
    /// Upload bookkeeping only; the transfer happens elsewhere.
    pub upload_path: Option<String>,
}

/// Client-visible events; serialized verbatim into SSE `data:` frames.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum TurnEvent {
    #[serde(rename = "text")]
    Text { content: String },

    #[serde(rename = "tool_call")]
    ToolCall {
        tool_name: String,
        args: Value,
        tool_call_id: String,
    },

    #[serde(rename = "tool_result")]
    ToolResult {
        tool_name: String,
        result: Value,
        tool_call_id: String,
    },

    #[serde(rename = "error")]
    Error { content: String },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// run_turn
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Run one turn. The permit is the conversation's turn lock; it is held
/// until the turn has fully finished so concurrent turns cannot interleave
/// writes.
///
/// The caller reads [`TurnEvent`]s from the receiver; dropping it counts
/// as a client disconnect and terminates the turn cleanly at the next
/// boundary.
pub fn run_turn(
    state: AppState,
    input: TurnInput,
    permit: OwnedSemaphorePermit,
) -> mpsc::Receiver<TurnEvent> {
    let (tx, rx) = mpsc::channel::<TurnEvent>(64);

    tokio::spawn(async move {
        let conversation_id = input.conversation_id;
        let user_message = input.message.clone();

        let result = run_turn_inner(&state, input, &tx).await;
        match result {
            Ok(assistant_text) => {
                // The title task is idempotent: it re-checks for an existing
                // title on its own fresh lookup before writing.
                title::spawn_title_generation(
                    state.clone(),
                    conversation_id,
                    user_message,
                    assistant_text,
                );
            }
            Err(e) => {
                tracing::warn!(conversation_id, error = %e, "turn failed");
                let _ = tx
                    .send(TurnEvent::Error {
                        content: e.to_string(),
                    })
                    .await;
            }
        }

        state.sandboxes.schedule_stop(conversation_id);
        drop(permit);
    });

    rx
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Phase 1: prepare the turn context
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn run_turn_inner(
    state: &AppState,
    input: TurnInput,
    tx: &mpsc::Sender<TurnEvent>,
) -> Result<String> {
    // 1. Conversation, ownership, state hydration.
    let conversation = state
        .repo
        .get_conversation(input.conversation_id)
        .await?
        .ok_or_else(|| Error::not_found("conversation", input.conversation_id))?;
    if conversation.owner_user_id != input.user.id && !input.user.is_admin {
        return Err(Error::PermissionDenied(format!(
            "conversation {} is not owned by user {}",
            conversation.id, input.user.id
        )));
    }

    let store_user = state
        .repo
        .get_user(input.user.id)
        .await?
        .ok_or_else(|| Error::not_found("user", input.user.id))?;

    // 2. Permission intersection: permitted ∩ selection, per kind.
    let permitted_tools = input
        .tool_selection
        .apply(state.permissions.resolve_tools(&store_user).await);
    let permitted_skills = input
        .skill_selection
        .apply(state.permissions.resolve_skills(&store_user).await);

    // 3. Effective skills that actually exist on disk.
    let skills = dg_skills::discover_skills(
        &state.config.storage.skills_dir(),
        Some(&permitted_skills),
    )
    .unwrap_or_else(|e| {
        tracing::warn!(error = %e, "skill discovery failed, continuing without skills");
        Vec::new()
    });
    let skill_names: Vec<String> = skills.iter().map(|s| s.name.clone()).collect();

    // 4. Sandbox + workspace discovery.
    let sandbox = state
        .sandboxes
        .acquire(
            store_user.id,
            conversation.id,
            state.config.sandbox.image.clone(),
            skill_names,
        )
        .await?;
    let files = sandbox.discover_files().await.unwrap_or_else(|e| {
        tracing::warn!(error = %e, "workspace discovery failed");
        Vec::new()
    });

    let ctx = TurnContext {
        user: input.user.clone(),
        conversation_id: conversation.id,
        sandbox,
        provider: input.provider.clone(),
        permitted_tools,
        permitted_skills,
        skills,
        enable_subagents: input.enable_subagents,
        todos: parking_lot::Mutex::new(conversation.state.todos.clone()),
    };

    // 5. History + user-row persistence.
    let history = state.history.read_history(conversation.id).await?;
    let mut next_step = state.history.next_step_order(conversation.id).await?;
    state
        .history
        .persist_user(conversation.id, next_step, &input.message)
        .await?;
    next_step += 1;

    // 6. Per-turn MCP toolset. Failure never kills the turn: it proceeds
    //    with built-in tools only.
    let mcp_toolset = build_mcp_toolset(state, &ctx).await;

    // 7. Messages.
    let system_prompt = prompt::build_system_prompt(&ctx, &files, &state.config.sandbox.image);
    let mut messages = Vec::with_capacity(history.len() + 2);
    messages.push(Message::system(system_prompt));
    messages.extend(history);
    messages.push(Message::user(&input.message));

    // 8. Drive the loop; persist the turn's mutable state regardless of
    //    how it ends.
    let drive_result = drive_tool_loop(
        state,
        &ctx,
        mcp_toolset.as_ref(),
        tx,
        &mut messages,
        &mut next_step,
    )
    .await;

    let mut final_state = ConversationState {
        todos: ctx.todos.lock().clone(),
        uploads: conversation.state.uploads.clone(),
    };
    if let Some(upload_path) = &input.upload_path {
        final_state.uploads.insert(
            upload_path.clone(),
            serde_json::json!({ "recorded_at": chrono::Utc::now().to_rfc3339() }),
        );
    }
    if let Err(e) = state.history.save_state(conversation.id, &final_state).await {
        tracing::warn!(conversation_id = conversation.id, error = %e, "state save failed");
    }

    if let Some(toolset) = mcp_toolset {
        toolset.shutdown().await;
    }

    drive_result
}

async fn build_mcp_toolset(state: &AppState, ctx: &TurnContext) -> Option<McpToolset> {
    let snapshot = match state.mcp.current() {
        Some(snapshot) => snapshot,
        None => match state.repo.list_mcp_servers(true).await {
            Ok(rows) => state
                .mcp
                .install(rows.iter().map(|r| r.to_config()).collect()),
            Err(e) => {
                tracing::warn!(error = %e, "loading MCP servers failed, built-in tools only");
                return None;
            }
        },
    };
    McpToolset::connect(&snapshot, &ctx.permitted_tools).await
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Phase 2: the streaming tool loop
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One round's worth of streamed model output.
#[derive(Default)]
struct RoundOutput {
    text: String,
    tool_calls: Vec<ToolCall>,
    cancelled: bool,
}

async fn drive_tool_loop(
    state: &AppState,
    ctx: &TurnContext,
    mcp: Option<&McpToolset>,
    tx: &mpsc::Sender<TurnEvent>,
    messages: &mut Vec<Message>,
    next_step: &mut i64,
) -> Result<String> {
    let max_loops = state.config.llm.max_tool_loops;

    for loop_idx in 0..max_loops {
        if tx.is_closed() {
            tracing::debug!(loop_idx, "client disconnected, ending turn");
            return Ok(String::new());
        }

        // The permission filter runs immediately before every LLM call.
        let defs = tools::prepare_tools(ctx, tools::build_tool_definitions(ctx, mcp));

        let mut stream = ctx
            .provider
            .chat_stream(&ChatRequest {
                messages: messages.clone(),
                tools: defs,
                temperature: Some(0.2),
                max_tokens: None,
            })
            .await?;

        // ── Consume one model response ────────────────────────────
        let mut round = RoundOutput::default();
        // Fallback assembly for providers that emit started/delta but
        // never a finished event: call_id → (name, args buffer).
        let mut partial: HashMap<String, (String, String)> = HashMap::new();

        while let Some(event) = stream.next().await {
            if tx.is_closed() {
                round.cancelled = true;
                break;
            }
            let event = match event {
                Ok(event) => event,
                Err(e) => {
                    persist_text_prefix(state, ctx, next_step, &round.text).await;
                    return Err(e);
                }
            };
            match event {
                StreamEvent::Token { text } => {
                    round.text.push_str(&text);
                    let _ = tx.send(TurnEvent::Text { content: text }).await;
                }
                StreamEvent::ToolCallStarted { call_id, tool_name } => {
                    partial.entry(call_id).or_default().0 = tool_name;
                }
                StreamEvent::ToolCallDelta { call_id, delta } => {
                    partial.entry(call_id).or_default().1.push_str(&delta);
                }
                StreamEvent::ToolCallFinished {
                    call_id,
                    tool_name,
                    arguments,
                } => {
                    partial.remove(&call_id);
                    round.tool_calls.push(ToolCall {
                        call_id,
                        tool_name,
                        arguments,
                    });
                }
                StreamEvent::Done { .. } => {
                    // Some providers follow with a usage-only chunk; keep
                    // reading until the stream itself closes.
                }
                StreamEvent::Error { message } => {
                    persist_text_prefix(state, ctx, next_step, &round.text).await;
                    return Err(Error::Provider {
                        provider: ctx.provider.provider_id().to_string(),
                        message,
                    });
                }
            }
        }

        // Assemble leftovers that never saw a finished event.
        for (call_id, (tool_name, args)) in partial.drain() {
            if tool_name.is_empty() {
                continue;
            }
            let arguments = serde_json::from_str(&args)
                .unwrap_or(Value::Object(Default::default()));
            round.tool_calls.push(ToolCall {
                call_id,
                tool_name,
                arguments,
            });
        }

        if round.cancelled {
            // Keep the partial response as a resumable prefix; no tool
            // rows exist for this round, so history stays valid.
            persist_text_prefix(state, ctx, next_step, &round.text).await;
            return Ok(round.text);
        }

        // ── No tool calls: this is the final answer ───────────────
        if round.tool_calls.is_empty() {
            if !round.text.is_empty() {
                state
                    .history
                    .persist_model_text(ctx.conversation_id, *next_step, &round.text)
                    .await?;
                *next_step += 1;
            }
            return Ok(round.text);
        }

        // ── Tool batch ────────────────────────────────────────────
        messages.push(Message::assistant_with_tool_calls(
            &round.text,
            &round.tool_calls,
        ));
        for tc in &round.tool_calls {
            let _ = tx
                .send(TurnEvent::ToolCall {
                    tool_name: tc.tool_name.clone(),
                    args: tc.arguments.clone(),
                    tool_call_id: tc.call_id.clone(),
                })
                .await;
        }

        if tx.is_closed() {
            // Disconnected before dispatch: drop the whole batch. Nothing
            // of this round was persisted, so the prefix stays valid.
            return Ok(round.text);
        }

        // Dispatch concurrently; sandbox commands still serialize on the
        // sandbox's own lock. join_all keeps results in call order for
        // deterministic frame/row sequencing.
        let futures: Vec<_> = round
            .tool_calls
            .iter()
            .map(|tc| tools::dispatch_tool(state, ctx, mcp, &tc.tool_name, &tc.arguments, true))
            .collect();
        let results = futures_util::future::join_all(futures).await;

        // Flush the model row before any of its returns hits the table.
        state
            .history
            .persist_model_with_tool_calls(
                ctx.conversation_id,
                *next_step,
                &round.text,
                round.tool_calls.clone(),
            )
            .await?;
        *next_step += 1;

        for (tc, (result, is_error)) in round.tool_calls.iter().zip(results) {
            if is_error {
                tracing::debug!(tool = %tc.tool_name, "tool returned an error result");
            }
            let _ = tx
                .send(TurnEvent::ToolResult {
                    tool_name: tc.tool_name.clone(),
                    result: Value::String(result.clone()),
                    tool_call_id: tc.call_id.clone(),
                })
                .await;
            state
                .history
                .persist_tool_return(
                    ctx.conversation_id,
                    *next_step,
                    &tc.tool_name,
                    &tc.call_id,
                    &result,
                )
                .await?;
            *next_step += 1;
            messages.push(Message::tool_return(&tc.call_id, &tc.tool_name, &result));
        }
    }

    let _ = tx
        .send(TurnEvent::Error {
            content: format!("tool loop limit reached ({max_loops} iterations)"),
        })
        .await;
    Ok(String::new())
}

/// Persist accumulated text as a final model row when a turn ends early
/// (provider error or client disconnect), keeping the stored prefix
/// resumable.
async fn persist_text_prefix(
    state: &AppState,
    ctx: &TurnContext,
    next_step: &mut i64,
    text: &str,
) {
    if text.is_empty() {
        return;
    }
    match state
        .history
        .persist_model_text(ctx.conversation_id, *next_step, text)
        .await
    {
        Ok(()) => *next_step += 1,
        Err(e) => {
            tracing::warn!(
                conversation_id = ctx.conversation_id,
                error = %e,
                "failed to persist partial model text"
            );
        }
    }
}
