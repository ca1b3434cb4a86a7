//! Conversation todo list: the planning state carried in the conversation's
//! `state` blob and mutated by the `read_todos`/`write_todos` tools.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    Pending,
    InProgress,
    Completed,
}

impl TodoStatus {
    fn icon(self) -> &'static str {
        match self {
            TodoStatus::Pending => "[ ]",
            TodoStatus::InProgress => "[*]",
            TodoStatus::Completed => "[x]",
        }
    }
}

/// A single todo item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Todo {
    /// Imperative task description ("Implement feature X").
    pub content: String,
    pub status: TodoStatus,
    /// Present continuous form shown while the task runs ("Implementing feature X").
    pub active_form: String,
}

/// Validate a full todo list: at most one item may be `in_progress`.
pub fn validate_todos(todos: &[Todo]) -> Result<()> {
    let in_progress = todos
        .iter()
        .filter(|t| t.status == TodoStatus::InProgress)
        .count();
    if in_progress > 1 {
        return Err(Error::Validation(format!(
            "at most one todo may be in_progress (got {in_progress})"
        )));
    }
    Ok(())
}

/// Render the list the way the `read_todos` tool reports it.
pub fn render_todos(todos: &[Todo]) -> String {
    if todos.is_empty() {
        return "No todos in the list. Use write_todos to create tasks.".into();
    }

    let mut lines = vec!["Current todos:".to_string()];
    for (i, todo) in todos.iter().enumerate() {
        lines.push(format!("{}. {} {}", i + 1, todo.status.icon(), todo.content));
    }
    lines.push(String::new());
    lines.push(format!("Summary: {}", summarize(todos)));
    lines.join("\n")
}

/// Short status summary, e.g. "1 completed, 1 in progress, 2 pending".
pub fn summarize(todos: &[Todo]) -> String {
    let mut completed = 0;
    let mut in_progress = 0;
    let mut pending = 0;
    for t in todos {
        match t.status {
            TodoStatus::Completed => completed += 1,
            TodoStatus::InProgress => in_progress += 1,
            TodoStatus::Pending => pending += 1,
        }
    }
    format!("{completed} completed, {in_progress} in progress, {pending} pending")
}

/// Render the system-prompt section showing the current todo state.
pub fn render_prompt_section(todos: &[Todo]) -> String {
    if todos.is_empty() {
        return String::new();
    }
    let mut lines = vec!["## Current Todos".to_string()];
    for todo in todos {
        lines.push(format!("- {} {}", todo.status.icon(), todo.content));
    }
    lines.join("\n")
}
