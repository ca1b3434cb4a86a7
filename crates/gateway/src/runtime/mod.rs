//! The turn runtime: per-turn context, the streaming engine, tool routing,
//! subagents, prompt assembly, and background title generation.

pub mod conversation_lock;
pub mod prompt;
pub mod subagent;
pub mod title;
pub mod tools;
pub mod turn;

pub use turn::{run_turn, TurnEvent, TurnInput};

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

use dg_domain::error::{Error, Result};
use dg_domain::todo::Todo;
use dg_providers::{LlmProvider, ModelEndpoint};
use dg_sandbox::Sandbox;
use dg_skills::Skill;

use crate::auth::CurrentUser;
use crate::state::AppState;

/// Everything one turn needs, assembled before the first LLM call.
///
/// The only mutation during the turn is the todo list (through the todo
/// tools); it is saved back into the conversation state when the turn
/// finishes.
pub struct TurnContext {
    pub user: CurrentUser,
    pub conversation_id: i64,
    pub sandbox: Arc<Sandbox>,
    pub provider: Arc<dyn LlmProvider>,
    /// Effective MCP tool names: permitted ∩ selection.
    pub permitted_tools: HashSet<String>,
    /// Effective skill names: permitted ∩ selection.
    pub permitted_skills: HashSet<String>,
    /// Discovered metadata for the effective skills (for the prompt).
    pub skills: Vec<Skill>,
    pub enable_subagents: bool,
    pub todos: Mutex<Vec<Todo>>,
}

impl TurnContext {
    /// Context for a delegated subagent: shares the sandbox, provider, and
    /// permitted sets, but carries its OWN empty todo list and cannot
    /// delegate further. The parent's todos are never visible to the
    /// child, and nothing the child plans can reach the parent's
    /// conversation state.
    pub fn for_subagent(&self) -> TurnContext {
        TurnContext {
            user: self.user.clone(),
            conversation_id: self.conversation_id,
            sandbox: self.sandbox.clone(),
            provider: self.provider.clone(),
            permitted_tools: self.permitted_tools.clone(),
            permitted_skills: self.permitted_skills.clone(),
            skills: self.skills.clone(),
            enable_subagents: false,
            todos: Mutex::new(Vec::new()),
        }
    }
}

/// Resolve the provider for a turn: the named model config, or the
/// configured default.
pub async fn resolve_provider(
    state: &AppState,
    model_name: Option<&str>,
) -> Result<Arc<dyn LlmProvider>> {
    let row = match model_name {
        Some(name) => state
            .repo
            .get_llm_model(name)
            .await?
            .ok_or_else(|| Error::not_found("llm model", name))?,
        None => state
            .repo
            .default_llm_model()
            .await?
            .ok_or_else(|| Error::Config("no LLM model configured".into()))?,
    };
    state.providers.get_or_create(&ModelEndpoint {
        name: row.name,
        base_url: row.base_url,
        api_key: row.api_key,
        model_id: row.model_id,
    })
}

/// Truncate to at most `max` characters (not bytes).
pub(crate) fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}
