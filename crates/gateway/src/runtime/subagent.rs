//! The `task` tool: run a delegated piece of work in a nested agent loop.
//!
//! A subagent runs on its own [`TurnContext`] (built with
//! `TurnContext::for_subagent`): same sandbox, provider and permitted
//! toolset, but an empty, isolated todo list and no nested `task`. Its
//! final text becomes the tool result of the parent turn; nothing it does
//! is persisted as conversation history or conversation state.

use serde_json::Value;

use dg_domain::tool::Message;
use dg_mcp_client::McpToolset;
use dg_providers::ChatRequest;

use super::{tools, TurnContext};
use crate::state::AppState;

const GENERAL_PURPOSE_INSTRUCTIONS: &str = "\
You are a subagent handling one delegated task. Work autonomously: you cannot
ask follow-up questions. Use the available tools as needed and finish with a
single, complete answer to the task.";

/// Entry point from tool dispatch.
pub async fn dispatch_task(
    state: &AppState,
    ctx: &TurnContext,
    mcp: Option<&McpToolset>,
    arguments: &Value,
) -> (String, bool) {
    let Some(description) = arguments.get("description").and_then(|v| v.as_str()) else {
        return ("Error: missing 'description' argument".into(), true);
    };
    let subagent_type = arguments
        .get("subagent_type")
        .and_then(|v| v.as_str())
        .unwrap_or("general-purpose");
    if subagent_type != "general-purpose" {
        return (
            format!("Error: unknown subagent type '{subagent_type}'"),
            true,
        );
    }

    match run_subagent(state, ctx, mcp, description).await {
        Ok(answer) => (answer, false),
        Err(e) => (format!("Error: subagent failed: {e}"), true),
    }
}

async fn run_subagent(
    state: &AppState,
    ctx: &TurnContext,
    mcp: Option<&McpToolset>,
    description: &str,
) -> dg_domain::error::Result<String> {
    let max_loops = state.config.subagents.max_tool_loops;

    // An isolated child context: the parent's todos stay invisible to the
    // subagent, and a subagent `write_todos` mutates only the child list.
    // `for_subagent` disables delegation, so `task` drops out of the
    // child's toolset.
    let child = ctx.for_subagent();
    let defs = tools::prepare_tools(&child, tools::build_tool_definitions(&child, mcp));

    let mut messages = vec![
        Message::system(GENERAL_PURPOSE_INSTRUCTIONS),
        Message::user(description),
    ];

    for loop_idx in 0..max_loops {
        let response = child
            .provider
            .chat(&ChatRequest {
                messages: messages.clone(),
                tools: defs.clone(),
                temperature: Some(0.2),
                max_tokens: None,
            })
            .await?;

        if response.tool_calls.is_empty() {
            tracing::debug!(loop_idx, "subagent finished");
            return Ok(response.content);
        }

        messages.push(Message::assistant_with_tool_calls(
            &response.content,
            &response.tool_calls,
        ));
        for tc in &response.tool_calls {
            let (result, is_error) = Box::pin(tools::dispatch_tool(
                state,
                &child,
                mcp,
                &tc.tool_name,
                &tc.arguments,
                false, // no nested delegation
            ))
            .await;
            if is_error {
                tracing::debug!(tool = %tc.tool_name, "subagent tool error");
            }
            messages.push(Message::tool_return(&tc.call_id, &tc.tool_name, &result));
        }
    }

    Ok(format!(
        "Subagent stopped after {max_loops} tool iterations without a final answer."
    ))
}
