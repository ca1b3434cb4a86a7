//! Background title generation: after the first response is delivered, a
//! small model produces a short Chinese title from the opening exchange.
//!
//! The task is detached from the request (it outlives a client
//! disconnect) and idempotent: it re-checks whether the conversation still
//! has no title right before writing, and the write itself is conditional,
//! so two racing tasks cannot overwrite each other.

use dg_providers::{ChatRequest, ModelEndpoint};

use dg_domain::tool::Message;

use super::truncate_chars;
use crate::state::AppState;

/// Spawn the title task. No-op when titles are disabled or the
/// conversation already has one.
pub fn spawn_title_generation(
    state: AppState,
    conversation_id: i64,
    user_message: String,
    assistant_text: String,
) {
    if !state.config.llm.title.enabled {
        return;
    }
    tokio::spawn(async move {
        if let Err(e) = generate(&state, conversation_id, &user_message, &assistant_text).await {
            tracing::warn!(conversation_id, error = %e, "title generation failed");
        }
    });
}

async fn generate(
    state: &AppState,
    conversation_id: i64,
    user_message: &str,
    assistant_text: &str,
) -> dg_domain::error::Result<()> {
    // Re-check under a fresh lookup: another turn's task may have won.
    let Some(conversation) = state.repo.get_conversation(conversation_id).await? else {
        return Ok(());
    };
    if !conversation.needs_title() {
        return Ok(());
    }

    let Some(model) = state.repo.title_llm_model().await? else {
        tracing::debug!("no LLM model configured, skipping title generation");
        return Ok(());
    };
    let provider = state.providers.get_or_create(&ModelEndpoint {
        name: model.name,
        base_url: model.base_url,
        api_key: model.api_key,
        model_id: model.model_id,
    })?;

    let max_chars = state.config.llm.title.max_chars;
    let prompt = format!(
        "请为以下对话生成一个不超过{}个字的简短中文标题，只输出标题本身，不要引号或标点。\n\n用户：{}\n\n助手：{}",
        max_chars,
        truncate_chars(user_message, 200),
        truncate_chars(assistant_text, 300),
    );

    let response = provider
        .chat(&ChatRequest {
            messages: vec![Message::user(prompt)],
            tools: vec![],
            temperature: Some(0.3),
            max_tokens: Some(30),
        })
        .await?;

    let title = clean_title(&response.content, max_chars);
    if title.is_empty() {
        return Ok(());
    }

    // Conditional write: loses gracefully if another task got there first.
    let written = state.repo.set_title_if_missing(conversation_id, &title).await?;
    if written {
        tracing::info!(conversation_id, title = %title, "conversation title generated");
    } else {
        tracing::debug!(conversation_id, "title already set, skipping");
    }
    Ok(())
}

/// Strip quoting/whitespace the model tends to add, then cap the length.
fn clean_title(raw: &str, max_chars: usize) -> String {
    let trimmed = raw
        .trim()
        .trim_matches(|c| matches!(c, '"' | '\'' | '「' | '」' | '《' | '》' | '。'))
        .trim();
    let first_line = trimmed.lines().next().unwrap_or("");
    truncate_chars(first_line, max_chars)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_title_strips_quotes_and_truncates() {
        assert_eq!(clean_title("「数据分析报告」", 15), "数据分析报告");
        assert_eq!(clean_title("\"Sales Report\"\n", 15), "Sales Report");
        assert_eq!(
            clean_title("这是一个特别特别特别特别长的标题啊", 15),
            "这是一个特别特别特别特别长的标"
        );
    }

    #[test]
    fn clean_title_takes_first_line() {
        assert_eq!(clean_title("标题\n解释文字", 15), "标题");
    }

    #[test]
    fn clean_title_empty_input() {
        assert_eq!(clean_title("  \n ", 15), "");
    }
}
