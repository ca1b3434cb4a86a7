//! Typed rows exposed by the repository. JSON-ish columns (state, tool
//! calls, tags, args, env) are TEXT in SQLite and deserialized here.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use dg_domain::config::{McpServerConfig, McpTransportKind};
use dg_domain::todo::Todo;
use dg_domain::tool::ToolCall;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Conversations
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Mutable per-conversation state carried in the `state` column: the todo
/// list and upload bookkeeping.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationState {
    #[serde(default)]
    pub todos: Vec<Todo>,
    #[serde(default)]
    pub uploads: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Conversation {
    pub id: i64,
    pub owner_user_id: i64,
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub archived: bool,
    pub starred: bool,
    pub state: ConversationState,
}

impl Conversation {
    /// A title is generated only while the conversation still has none.
    pub fn needs_title(&self) -> bool {
        self.title.as_deref().unwrap_or("").trim().is_empty()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Messages
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Model,
    ToolReturn,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Model => "model",
            MessageRole::ToolReturn => "tool_return",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(MessageRole::User),
            "model" => Some(MessageRole::Model),
            "tool_return" => Some(MessageRole::ToolReturn),
            _ => None,
        }
    }
}

/// One persisted message row, in the shape of the `messages` table.
#[derive(Debug, Clone, Serialize)]
pub struct MessageRow {
    pub id: i64,
    pub conversation_id: i64,
    /// Strictly monotonic, gap-free per conversation.
    pub step_order: i64,
    pub role: MessageRole,
    pub content: Option<String>,
    pub tool_calls: Option<Vec<ToolCall>>,
    pub tool_name: Option<String>,
    pub tool_call_id: Option<String>,
    pub tool_return_content: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A message about to be written (no id/timestamp yet).
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: i64,
    pub step_order: i64,
    pub role: MessageRole,
    pub content: Option<String>,
    pub tool_calls: Option<Vec<ToolCall>>,
    pub tool_name: Option<String>,
    pub tool_call_id: Option<String>,
    pub tool_return_content: Option<String>,
}

impl NewMessage {
    pub fn user(conversation_id: i64, step_order: i64, text: &str) -> Self {
        Self {
            conversation_id,
            step_order,
            role: MessageRole::User,
            content: Some(text.to_owned()),
            tool_calls: None,
            tool_name: None,
            tool_call_id: None,
            tool_return_content: None,
        }
    }

    pub fn model_text(conversation_id: i64, step_order: i64, text: &str) -> Self {
        Self {
            conversation_id,
            step_order,
            role: MessageRole::Model,
            content: Some(text.to_owned()),
            tool_calls: None,
            tool_name: None,
            tool_call_id: None,
            tool_return_content: None,
        }
    }

    pub fn model_with_tool_calls(
        conversation_id: i64,
        step_order: i64,
        text: &str,
        tool_calls: Vec<ToolCall>,
    ) -> Self {
        Self {
            conversation_id,
            step_order,
            role: MessageRole::Model,
            content: Some(text.to_owned()),
            tool_calls: Some(tool_calls),
            tool_name: None,
            tool_call_id: None,
            tool_return_content: None,
        }
    }

    pub fn tool_return(
        conversation_id: i64,
        step_order: i64,
        tool_name: &str,
        tool_call_id: &str,
        content: &str,
    ) -> Self {
        Self {
            conversation_id,
            step_order,
            role: MessageRole::ToolReturn,
            content: None,
            tool_calls: None,
            tool_name: Some(tool_name.to_owned()),
            tool_call_id: Some(tool_call_id.to_owned()),
            tool_return_content: Some(content.to_owned()),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Users
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub is_admin: bool,
    pub is_active: bool,
    pub department_id: Option<i64>,
    pub role_ids: Vec<i64>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Skills / tools / servers / models
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize)]
pub struct SkillRow {
    pub id: i64,
    pub name: String,
    pub version: String,
    pub description: String,
    pub path: String,
    pub tags: Vec<String>,
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct McpToolRow {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub server_name: Option<String>,
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct McpServerRow {
    pub id: i64,
    pub name: String,
    pub transport: McpTransportKind,
    pub command: Option<String>,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub url: Option<String>,
    pub timeout_secs: u64,
    pub is_active: bool,
}

impl McpServerRow {
    pub fn to_config(&self) -> McpServerConfig {
        McpServerConfig {
            name: self.name.clone(),
            transport: self.transport,
            command: self.command.clone(),
            args: self.args.clone(),
            env: self.env.clone(),
            url: self.url.clone(),
            timeout_secs: self.timeout_secs,
        }
    }
}

/// One admin-managed LLM endpoint configuration.
#[derive(Debug, Clone, Serialize)]
pub struct LlmModelRow {
    pub id: i64,
    pub name: String,
    pub base_url: String,
    pub api_key: String,
    pub model_id: String,
    pub is_default: bool,
    /// Marked models are preferred for background title generation.
    pub for_titles: bool,
    pub is_active: bool,
}
