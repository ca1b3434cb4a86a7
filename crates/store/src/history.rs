//! Conversation-history reconstruction and step-ordered persistence.
//!
//! Readback contract: messages in `step_order` form a valid alternation —
//! user request → (model response with tool calls → one tool return per
//! call)* → model response (final text). The persistence methods here are
//! the only writers of `messages`, and the turn engine calls them in an
//! order that keeps every prefix of the table valid: the
//! model-with-tool-calls row for a batch is always written before any of
//! that batch's tool returns.

use std::sync::Arc;

use dg_domain::error::Result;
use dg_domain::tool::{Message, ToolCall};

use crate::entities::{ConversationState, MessageRole, MessageRow, NewMessage};
use crate::repository::Repository;

pub struct HistoryStore {
    repo: Arc<Repository>,
}

impl HistoryStore {
    pub fn new(repo: Arc<Repository>) -> Self {
        Self { repo }
    }

    /// Rebuild the provider-neutral message sequence for a conversation.
    pub async fn read_history(&self, conversation_id: i64) -> Result<Vec<Message>> {
        let rows = self.repo.list_messages(conversation_id).await?;
        Ok(rows.iter().map(row_to_message).collect())
    }

    /// One greater than the conversation's current maximum step order.
    pub async fn next_step_order(&self, conversation_id: i64) -> Result<i64> {
        Ok(self.repo.max_step_order(conversation_id).await? + 1)
    }

    pub async fn persist_user(&self, conversation_id: i64, step: i64, text: &str) -> Result<()> {
        self.repo
            .insert_message(&NewMessage::user(conversation_id, step, text))
            .await?;
        Ok(())
    }

    pub async fn persist_model_text(
        &self,
        conversation_id: i64,
        step: i64,
        text: &str,
    ) -> Result<()> {
        self.repo
            .insert_message(&NewMessage::model_text(conversation_id, step, text))
            .await?;
        Ok(())
    }

    /// Persist a model response together with the tool calls it emitted.
    /// Must be written before any tool return of the same batch.
    pub async fn persist_model_with_tool_calls(
        &self,
        conversation_id: i64,
        step: i64,
        text: &str,
        tool_calls: Vec<ToolCall>,
    ) -> Result<()> {
        self.repo
            .insert_message(&NewMessage::model_with_tool_calls(
                conversation_id,
                step,
                text,
                tool_calls,
            ))
            .await?;
        Ok(())
    }

    pub async fn persist_tool_return(
        &self,
        conversation_id: i64,
        step: i64,
        tool_name: &str,
        tool_call_id: &str,
        content: &str,
    ) -> Result<()> {
        self.repo
            .insert_message(&NewMessage::tool_return(
                conversation_id,
                step,
                tool_name,
                tool_call_id,
                content,
            ))
            .await?;
        Ok(())
    }

    pub async fn save_state(
        &self,
        conversation_id: i64,
        state: &ConversationState,
    ) -> Result<()> {
        self.repo.save_state(conversation_id, state).await
    }
}

/// Map one persisted row back to the provider-neutral shape.
fn row_to_message(row: &MessageRow) -> Message {
    match row.role {
        MessageRole::User => Message::user(row.content.as_deref().unwrap_or("")),
        MessageRole::Model => {
            let text = row.content.as_deref().unwrap_or("");
            match &row.tool_calls {
                Some(calls) if !calls.is_empty() => {
                    Message::assistant_with_tool_calls(text, calls)
                }
                _ => Message::assistant(text),
            }
        }
        MessageRole::ToolReturn => Message::tool_return(
            row.tool_call_id.as_deref().unwrap_or(""),
            row.tool_name.as_deref().unwrap_or(""),
            row.tool_return_content.as_deref().unwrap_or(""),
        ),
    }
}
