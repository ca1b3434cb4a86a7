//! Per-turn tool routing: builds the toolset exposed to the LLM and
//! dispatches tool calls to the sandbox, the todo state, the skill tools,
//! subagents, or the MCP toolset.
//!
//! Tool failures are never turn failures: every error is surfaced back to
//! the model as the tool's result so it can observe and recover.

use serde_json::Value;

use dg_domain::todo::{self, Todo};
use dg_domain::tool::ToolDefinition;
use dg_mcp_client::McpToolset;
use dg_sandbox::commands::shell_quote;
use dg_skills::parse_skill_md;

use super::{subagent, TurnContext};
use crate::state::AppState;

/// Built-in tool names. Definitions with these prefixes are always kept by
/// the permission filter; only MCP tools are permission-gated.
pub const BUILTIN_TOOL_PREFIXES: &[&str] = &[
    "read_todos",
    "write_todos",
    "ls",
    "read_file",
    "write_file",
    "edit_file",
    "glob",
    "grep",
    "execute",
    "task",
    "list_skills",
    "load_skill",
    "read_skill_resource",
    "execute_skill_script",
];

pub fn is_builtin(name: &str) -> bool {
    BUILTIN_TOOL_PREFIXES.iter().any(|p| name.starts_with(p))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Definitions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn def(name: &str, description: &str, parameters: Value) -> ToolDefinition {
    ToolDefinition {
        name: name.into(),
        description: description.into(),
        parameters,
    }
}

/// The full per-turn toolset: built-ins plus the MCP tools that survived
/// the permission intersection.
pub fn build_tool_definitions(ctx: &TurnContext, mcp: Option<&McpToolset>) -> Vec<ToolDefinition> {
    let mut defs = vec![
        def(
            "read_todos",
            "Read the current todo list with each task's status.",
            serde_json::json!({ "type": "object", "properties": {} }),
        ),
        def(
            "write_todos",
            "Replace the todo list. Use it to plan multi-step work and track progress. \
             At most one todo may be in_progress at a time.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "todos": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "content": { "type": "string", "description": "Imperative task description" },
                                "status": { "type": "string", "enum": ["pending", "in_progress", "completed"] },
                                "active_form": { "type": "string", "description": "Present continuous form" }
                            },
                            "required": ["content", "status", "active_form"]
                        }
                    }
                },
                "required": ["todos"]
            }),
        ),
        def(
            "ls",
            "List files and directories at a path.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string", "description": "Directory path (default /workspace)" }
                }
            }),
        ),
        def(
            "read_file",
            "Read file content with line numbers.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string" },
                    "offset": { "type": "integer", "description": "First line to read, 0-indexed" },
                    "limit": { "type": "integer", "description": "Maximum lines (default 500)" }
                },
                "required": ["path"]
            }),
        ),
        def(
            "write_file",
            "Create or overwrite a file. Parent directories are created.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string" },
                    "content": { "type": "string" }
                },
                "required": ["path", "content"]
            }),
        ),
        def(
            "edit_file",
            "Replace a string in a file. old must occur exactly once unless replace_all.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string" },
                    "old": { "type": "string" },
                    "new": { "type": "string" },
                    "replace_all": { "type": "boolean" }
                },
                "required": ["path", "old", "new"]
            }),
        ),
        def(
            "glob",
            "Find files matching a glob pattern (e.g. \"**/*.py\").",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "pattern": { "type": "string" },
                    "path": { "type": "string", "description": "Base directory (default /workspace)" }
                },
                "required": ["pattern"]
            }),
        ),
        def(
            "grep",
            "Search file contents for a regex pattern.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "pattern": { "type": "string" },
                    "path": { "type": "string" },
                    "glob": { "type": "string", "description": "Filter files, e.g. \"*.py\"" },
                    "output_mode": { "type": "string", "enum": ["content", "files_with_matches", "count"] }
                },
                "required": ["pattern"]
            }),
        ),
        def(
            "execute",
            "Run a shell command in the isolated sandbox. No network access.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "command": { "type": "string" },
                    "timeout": { "type": "integer", "description": "Seconds (default 120, max 600)" }
                },
                "required": ["command"]
            }),
        ),
        def(
            "list_skills",
            "List the skills mounted in this conversation's sandbox.",
            serde_json::json!({ "type": "object", "properties": {} }),
        ),
        def(
            "load_skill",
            "Load a skill's full instructions from its SKILL.md.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "skill_name": { "type": "string" }
                },
                "required": ["skill_name"]
            }),
        ),
        def(
            "read_skill_resource",
            "Read a resource file bundled with a skill.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "skill_name": { "type": "string" },
                    "resource_name": { "type": "string" }
                },
                "required": ["skill_name", "resource_name"]
            }),
        ),
        def(
            "execute_skill_script",
            "Run a script bundled with a skill inside the sandbox.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "skill_name": { "type": "string" },
                    "script_name": { "type": "string" },
                    "args": { "type": "string", "description": "Command-line arguments" },
                    "working_dir": { "type": "string", "description": "Default /workspace/intermediate" }
                },
                "required": ["skill_name", "script_name"]
            }),
        ),
    ];

    if ctx.enable_subagents {
        defs.push(def(
            "task",
            "Delegate a self-contained task to a subagent with fresh context. \
             Provide a complete description; the subagent cannot ask questions.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "description": { "type": "string" },
                    "subagent_type": { "type": "string", "enum": ["general-purpose"] }
                },
                "required": ["description", "subagent_type"]
            }),
        ));
    }

    if let Some(mcp) = mcp {
        defs.extend(mcp.definitions());
    }

    defs
}

/// The permission-filter hook, applied immediately before every LLM call:
/// built-in names pass unconditionally, everything else must be in the
/// turn's effective tool set.
pub fn prepare_tools(ctx: &TurnContext, mut defs: Vec<ToolDefinition>) -> Vec<ToolDefinition> {
    let before = defs.len();
    defs.retain(|d| is_builtin(&d.name) || ctx.permitted_tools.contains(&d.name));
    if defs.len() != before {
        tracing::debug!(
            user_id = ctx.user.id,
            kept = defs.len(),
            dropped = before - defs.len(),
            "permission filter narrowed toolset"
        );
    }
    defs
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Dispatch
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Execute one tool call. Returns `(result_text, is_error)`.
pub async fn dispatch_tool(
    state: &AppState,
    ctx: &TurnContext,
    mcp: Option<&McpToolset>,
    tool_name: &str,
    arguments: &Value,
    allow_task: bool,
) -> (String, bool) {
    match tool_name {
        "read_todos" => (todo::render_todos(&ctx.todos.lock()), false),
        "write_todos" => dispatch_write_todos(ctx, arguments),
        "ls" => dispatch_ls(ctx, arguments).await,
        "read_file" => dispatch_read_file(ctx, arguments).await,
        "write_file" => dispatch_write_file(ctx, arguments).await,
        "edit_file" => dispatch_edit_file(ctx, arguments).await,
        "glob" => dispatch_glob(ctx, arguments).await,
        "grep" => dispatch_grep(ctx, arguments).await,
        "execute" => dispatch_execute(ctx, arguments).await,
        "list_skills" => dispatch_list_skills(ctx).await,
        "load_skill" => dispatch_load_skill(ctx, arguments).await,
        "read_skill_resource" => dispatch_read_skill_resource(ctx, arguments).await,
        "execute_skill_script" => dispatch_execute_skill_script(ctx, arguments).await,
        "task" if allow_task && ctx.enable_subagents => {
            subagent::dispatch_task(state, ctx, mcp, arguments).await
        }
        "task" => ("Error: subagents are not enabled for this turn".into(), true),
        other => dispatch_mcp(mcp, other, arguments).await,
    }
}

fn arg_str<'a>(arguments: &'a Value, key: &str) -> Option<&'a str> {
    arguments.get(key).and_then(|v| v.as_str())
}

fn dispatch_write_todos(ctx: &TurnContext, arguments: &Value) -> (String, bool) {
    let todos: Vec<Todo> = match arguments
        .get("todos")
        .cloned()
        .map(serde_json::from_value)
        .transpose()
    {
        Ok(Some(t)) => t,
        Ok(None) => return ("Error: missing 'todos' argument".into(), true),
        Err(e) => return (format!("Error: invalid todos: {e}"), true),
    };
    if let Err(e) = todo::validate_todos(&todos) {
        return (format!("Error: {e}"), true);
    }

    let summary = format!("Updated {} todos: {}", todos.len(), todo::summarize(&todos));
    *ctx.todos.lock() = todos;
    (summary, false)
}

async fn dispatch_ls(ctx: &TurnContext, arguments: &Value) -> (String, bool) {
    let path = arg_str(arguments, "path").unwrap_or("/workspace");
    match ctx.sandbox.ls(path).await {
        Ok(entries) if entries.is_empty() => {
            (format!("Directory '{path}' is empty"), false)
        }
        Ok(entries) => {
            let mut lines = vec![format!("Contents of {path}:")];
            for entry in entries {
                if entry.is_dir {
                    lines.push(format!("  {}/", entry.name));
                } else {
                    lines.push(format!("  {}", entry.name));
                }
            }
            (lines.join("\n"), false)
        }
        Err(e) => (format!("Error: {e}"), true),
    }
}

async fn dispatch_read_file(ctx: &TurnContext, arguments: &Value) -> (String, bool) {
    let Some(path) = arg_str(arguments, "path") else {
        return ("Error: missing 'path' argument".into(), true);
    };
    let offset = arguments.get("offset").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
    let limit = arguments.get("limit").and_then(|v| v.as_u64()).unwrap_or(500) as usize;
    match ctx.sandbox.read(path, offset, limit).await {
        Ok(content) => (content, false),
        Err(e) => (format!("Error: {e}"), true),
    }
}

async fn dispatch_write_file(ctx: &TurnContext, arguments: &Value) -> (String, bool) {
    let (Some(path), Some(content)) = (arg_str(arguments, "path"), arg_str(arguments, "content"))
    else {
        return ("Error: write_file requires 'path' and 'content'".into(), true);
    };
    match ctx.sandbox.write(path, content).await {
        Ok(result) => (
            format!("Wrote {} lines to {}", result.lines_written, result.path),
            false,
        ),
        Err(e) => (format!("Error: {e}"), true),
    }
}

async fn dispatch_edit_file(ctx: &TurnContext, arguments: &Value) -> (String, bool) {
    let (Some(path), Some(old), Some(new)) = (
        arg_str(arguments, "path"),
        arg_str(arguments, "old"),
        arg_str(arguments, "new"),
    ) else {
        return ("Error: edit_file requires 'path', 'old' and 'new'".into(), true);
    };
    let replace_all = arguments
        .get("replace_all")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    match ctx.sandbox.edit(path, old, new, replace_all).await {
        Ok(result) => (
            format!(
                "Edited {}: replaced {} occurrence(s)",
                result.path, result.occurrences
            ),
            false,
        ),
        Err(e) => (format!("Error: {e}"), true),
    }
}

async fn dispatch_glob(ctx: &TurnContext, arguments: &Value) -> (String, bool) {
    let Some(pattern) = arg_str(arguments, "pattern") else {
        return ("Error: missing 'pattern' argument".into(), true);
    };
    let base = arg_str(arguments, "path").unwrap_or("/workspace");
    match ctx.sandbox.glob(pattern, base).await {
        Ok(paths) if paths.is_empty() => {
            (format!("No files matching '{pattern}' in {base}"), false)
        }
        Ok(paths) => {
            let mut lines = vec![format!("Found {} file(s) matching '{pattern}':", paths.len())];
            for path in paths.iter().take(100) {
                lines.push(format!("  {path}"));
            }
            if paths.len() > 100 {
                lines.push(format!("  ... and {} more", paths.len() - 100));
            }
            (lines.join("\n"), false)
        }
        Err(e) => (format!("Error: {e}"), true),
    }
}

async fn dispatch_grep(ctx: &TurnContext, arguments: &Value) -> (String, bool) {
    let Some(pattern) = arg_str(arguments, "pattern") else {
        return ("Error: missing 'pattern' argument".into(), true);
    };
    let path = arg_str(arguments, "path");
    let glob = arg_str(arguments, "glob");
    let mode = arg_str(arguments, "output_mode").unwrap_or("files_with_matches");

    let matches = match ctx.sandbox.grep(pattern, path, glob).await {
        Ok(m) => m,
        Err(e) => return (format!("Error: {e}"), true),
    };
    if matches.is_empty() {
        return (format!("No matches for '{pattern}'"), false);
    }

    let text = match mode {
        "count" => format!("Found {} match(es) for '{pattern}'", matches.len()),
        "content" => {
            let mut lines = vec![format!("Matches for '{pattern}':")];
            for m in matches.iter().take(50) {
                let snippet: String = m.line.chars().take(100).collect();
                lines.push(format!("  {}:{}: {}", m.path, m.line_number, snippet));
            }
            if matches.len() > 50 {
                lines.push(format!("  ... and {} more matches", matches.len() - 50));
            }
            lines.join("\n")
        }
        _ => {
            let mut files: Vec<&str> = matches.iter().map(|m| m.path.as_str()).collect();
            files.sort();
            files.dedup();
            let mut lines = vec![format!("Files containing '{pattern}':")];
            for file in files.iter().take(50) {
                lines.push(format!("  {file}"));
            }
            if files.len() > 50 {
                lines.push(format!("  ... and {} more files", files.len() - 50));
            }
            lines.join("\n")
        }
    };
    (text, false)
}

async fn dispatch_execute(ctx: &TurnContext, arguments: &Value) -> (String, bool) {
    let Some(command) = arg_str(arguments, "command") else {
        return ("Error: missing 'command' argument".into(), true);
    };
    let timeout = arguments
        .get("timeout")
        .and_then(|v| v.as_u64())
        .map(std::time::Duration::from_secs);

    match ctx.sandbox.execute(command, timeout).await {
        Ok(resp) => {
            let mut output = resp.output;
            if resp.truncated {
                output.push_str("\n\n... (output truncated)");
            }
            if resp.exit_code != 0 {
                (
                    format!("Command failed (exit code {}):\n{output}", resp.exit_code),
                    false,
                )
            } else {
                (output, false)
            }
        }
        Err(e) => (format!("Error: {e}"), true),
    }
}

// ── Skill tools ────────────────────────────────────────────────────
// Skill bodies are parsed from inside the container only; the host never
// reads past the frontmatter it discovered at turn start.

async fn find_skill_dir(ctx: &TurnContext, skill_name: &str) -> Result<String, String> {
    let cmd = format!(
        "find /workspace/skills -maxdepth 1 -type d -name {} 2>/dev/null",
        shell_quote(skill_name)
    );
    let resp = ctx
        .sandbox
        .execute(&cmd, None)
        .await
        .map_err(|e| e.to_string())?;
    resp.output
        .lines()
        .find(|l| !l.is_empty())
        .map(str::to_string)
        .ok_or_else(|| format!("skill '{skill_name}' not found in /workspace/skills"))
}

async fn skill_resources(ctx: &TurnContext, skill_dir: &str) -> Vec<String> {
    let cmd = format!(
        "find {} -type f ! -name 'SKILL.md' -exec basename {{}} \\; 2>/dev/null",
        shell_quote(skill_dir)
    );
    match ctx.sandbox.execute(&cmd, None).await {
        Ok(resp) if resp.exit_code == 0 => resp
            .output
            .lines()
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

async fn dispatch_list_skills(ctx: &TurnContext) -> (String, bool) {
    let find = "find /workspace/skills -name 'SKILL.md' -type f 2>/dev/null";
    let resp = match ctx.sandbox.execute(find, None).await {
        Ok(r) => r,
        Err(e) => return (format!("Error: {e}"), true),
    };

    let mut paths: Vec<&str> = resp.output.lines().filter(|l| !l.is_empty()).collect();
    if paths.is_empty() {
        return (
            "No skills available. The /workspace/skills directory is empty or not mounted."
                .into(),
            false,
        );
    }
    paths.sort();

    let mut lines = vec!["Available Skills:".to_string(), String::new()];
    for md_path in paths {
        let content = match ctx.sandbox.read_raw(md_path).await {
            Ok(c) => c,
            Err(_) => continue,
        };
        let Ok((frontmatter, _body)) = parse_skill_md(&content) else {
            continue;
        };
        let skill_dir = md_path.rsplit_once('/').map(|(d, _)| d).unwrap_or(md_path);
        let resources = skill_resources(ctx, skill_dir).await;
        let tags = if frontmatter.tags.is_empty() {
            "none".to_string()
        } else {
            frontmatter.tags.join(", ")
        };
        let resources_note = if resources.is_empty() {
            String::new()
        } else {
            format!(" (resources: {})", resources.join(", "))
        };

        lines.push(format!(
            "**{}** (v{})",
            frontmatter.name,
            frontmatter.version.as_deref().unwrap_or("1.0.0")
        ));
        lines.push(format!("  Description: {}", frontmatter.description));
        lines.push(format!("  Tags: {tags}"));
        lines.push(format!("  Path: {skill_dir}{resources_note}"));
        lines.push(String::new());
    }

    if lines.len() == 2 {
        return ("No valid skills found.".into(), false);
    }
    (lines.join("\n"), false)
}

async fn dispatch_load_skill(ctx: &TurnContext, arguments: &Value) -> (String, bool) {
    let Some(skill_name) = arg_str(arguments, "skill_name") else {
        return ("Error: missing 'skill_name' argument".into(), true);
    };
    let skill_dir = match find_skill_dir(ctx, skill_name).await {
        Ok(d) => d,
        Err(e) => return (format!("Error: {e}"), true),
    };

    let content = match ctx.sandbox.read_raw(&format!("{skill_dir}/SKILL.md")).await {
        Ok(c) => c,
        Err(e) => return (format!("Error: {e}"), true),
    };
    let (frontmatter, body) = match parse_skill_md(&content) {
        Ok(parsed) => parsed,
        Err(e) => return (format!("Error: {e}"), true),
    };

    let mut lines = vec![
        format!("# Skill: {}", frontmatter.name),
        format!(
            "Version: {}",
            frontmatter.version.as_deref().unwrap_or("1.0.0")
        ),
        format!("Path: {skill_dir}"),
        String::new(),
        "## Instructions".to_string(),
        String::new(),
        body,
    ];

    let resources = skill_resources(ctx, &skill_dir).await;
    if !resources.is_empty() {
        lines.push(String::new());
        lines.push("## Available Resources".to_string());
        lines.push(String::new());
        for resource in &resources {
            lines.push(format!("- {skill_dir}/{resource}"));
            lines.push(format!(
                "  Use `read_skill_resource('{}', '{resource}')` to read this file",
                frontmatter.name
            ));
        }
    }
    (lines.join("\n"), false)
}

async fn dispatch_read_skill_resource(ctx: &TurnContext, arguments: &Value) -> (String, bool) {
    let (Some(skill_name), Some(resource_name)) = (
        arg_str(arguments, "skill_name"),
        arg_str(arguments, "resource_name"),
    ) else {
        return (
            "Error: read_skill_resource requires 'skill_name' and 'resource_name'".into(),
            true,
        );
    };
    let skill_dir = match find_skill_dir(ctx, skill_name).await {
        Ok(d) => d,
        Err(e) => return (format!("Error: {e}"), true),
    };

    // Basename only: resource paths must not traverse out of the skill dir.
    let safe_name = resource_name.rsplit('/').next().unwrap_or(resource_name);
    match ctx.sandbox.read_raw(&format!("{skill_dir}/{safe_name}")).await {
        Ok(content) => (content, false),
        Err(_) => {
            let available = skill_resources(ctx, &skill_dir).await;
            (
                format!(
                    "Error: resource '{resource_name}' not found. Available resources: {}",
                    if available.is_empty() {
                        "none".to_string()
                    } else {
                        available.join(", ")
                    }
                ),
                true,
            )
        }
    }
}

async fn dispatch_execute_skill_script(ctx: &TurnContext, arguments: &Value) -> (String, bool) {
    let (Some(skill_name), Some(script_name)) = (
        arg_str(arguments, "skill_name"),
        arg_str(arguments, "script_name"),
    ) else {
        return (
            "Error: execute_skill_script requires 'skill_name' and 'script_name'".into(),
            true,
        );
    };
    let args = arg_str(arguments, "args").unwrap_or("");
    let working_dir = arg_str(arguments, "working_dir").unwrap_or("/workspace/intermediate");

    let skill_dir = match find_skill_dir(ctx, skill_name).await {
        Ok(d) => d,
        Err(e) => return (format!("Error: {e}"), true),
    };
    let safe_script = script_name.rsplit('/').next().unwrap_or(script_name);
    let script_path = format!("{skill_dir}/{safe_script}");

    let command = format!(
        "cd {} && sh {} {}",
        shell_quote(working_dir),
        shell_quote(&script_path),
        args
    );
    let resp = match ctx
        .sandbox
        .execute(&command, Some(std::time::Duration::from_secs(300)))
        .await
    {
        Ok(r) => r,
        Err(e) => return (format!("Error: {e}"), true),
    };

    let mut lines = vec![
        format!("Script: {script_path}"),
        format!("Working Directory: {working_dir}"),
        format!("Exit Code: {}", resp.exit_code),
        String::new(),
        "Output:".to_string(),
        resp.output,
    ];
    if resp.truncated {
        lines.push(String::new());
        lines.push("(Output was truncated due to size limit)".to_string());
    }
    (lines.join("\n"), false)
}

async fn dispatch_mcp(
    mcp: Option<&McpToolset>,
    tool_name: &str,
    arguments: &Value,
) -> (String, bool) {
    let Some(mcp) = mcp else {
        return (
            format!("Error: tool '{tool_name}' is not available this turn"),
            true,
        );
    };
    match mcp.call(tool_name, arguments.clone()).await {
        Ok((text, is_error)) => (text, is_error),
        Err(e) => (format!("Error: {e}"), true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::CurrentUser;
    use dg_domain::config::ImageConfig;
    use dg_domain::error::Result as DgResult;
    use dg_domain::stream::{BoxStream, StreamEvent};
    use dg_providers::{ChatRequest, ChatResponse, LlmProvider};
    use dg_sandbox::sandbox::{Sandbox, SandboxLimits, VolumeLayout};
    use dg_sandbox::testing::MockRuntime;
    use std::collections::HashSet;
    use std::sync::Arc;

    struct NullProvider;

    #[async_trait::async_trait]
    impl LlmProvider for NullProvider {
        async fn chat(&self, _req: &ChatRequest) -> DgResult<ChatResponse> {
            unreachable!("tool tests never call the provider")
        }
        async fn chat_stream(
            &self,
            _req: &ChatRequest,
        ) -> DgResult<BoxStream<'static, DgResult<StreamEvent>>> {
            unreachable!("tool tests never call the provider")
        }
        fn provider_id(&self) -> &str {
            "null"
        }
    }

    fn ctx_with(runtime: Arc<MockRuntime>, permitted: &[&str]) -> TurnContext {
        let sandbox = Sandbox::new(
            runtime,
            1,
            1,
            ImageConfig::default(),
            VolumeLayout {
                uploads_host: "/data/uploads/1/1".into(),
                intermediate_host: "/data/intermediate/1/1".into(),
                skill_mounts: vec![],
            },
            vec![],
            SandboxLimits {
                default_timeout: std::time::Duration::from_secs(120),
                max_timeout: std::time::Duration::from_secs(600),
                max_output_bytes: 10_000,
            },
        );
        TurnContext {
            user: CurrentUser {
                id: 1,
                username: "alice".into(),
                is_admin: false,
            },
            conversation_id: 1,
            sandbox: Arc::new(sandbox),
            provider: Arc::new(NullProvider),
            permitted_tools: permitted.iter().map(|s| s.to_string()).collect(),
            permitted_skills: HashSet::new(),
            skills: vec![],
            enable_subagents: true,
            todos: parking_lot::Mutex::new(vec![]),
        }
    }

    #[test]
    fn builtin_prefixes_recognized() {
        for name in ["read_todos", "execute", "task", "load_skill"] {
            assert!(is_builtin(name), "{name}");
        }
        assert!(!is_builtin("web_search"));
    }

    #[test]
    fn prepare_tools_keeps_builtins_and_permitted_only() {
        let ctx = ctx_with(MockRuntime::new(), &["tool_x"]);
        let defs = vec![
            def("execute", "", serde_json::json!({})),
            def("tool_x", "", serde_json::json!({})),
            def("tool_y", "", serde_json::json!({})),
        ];
        let kept = prepare_tools(&ctx, defs);
        let names: Vec<&str> = kept.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["execute", "tool_x"]);
    }

    #[test]
    fn definitions_include_task_only_when_enabled() {
        let mut ctx = ctx_with(MockRuntime::new(), &[]);
        assert!(build_tool_definitions(&ctx, None)
            .iter()
            .any(|d| d.name == "task"));

        ctx.enable_subagents = false;
        assert!(!build_tool_definitions(&ctx, None)
            .iter()
            .any(|d| d.name == "task"));
    }

    #[tokio::test]
    async fn write_todos_rejects_two_in_progress() {
        let ctx = ctx_with(MockRuntime::new(), &[]);
        let args = serde_json::json!({
            "todos": [
                {"content": "a", "status": "in_progress", "active_form": "doing a"},
                {"content": "b", "status": "in_progress", "active_form": "doing b"}
            ]
        });
        let (msg, is_error) = dispatch_write_todos(&ctx, &args);
        assert!(is_error);
        assert!(msg.contains("in_progress"));
        assert!(ctx.todos.lock().is_empty(), "rejected write must not mutate");
    }

    #[tokio::test]
    async fn write_then_read_todos() {
        let ctx = ctx_with(MockRuntime::new(), &[]);
        let args = serde_json::json!({
            "todos": [
                {"content": "analyze data", "status": "in_progress", "active_form": "Analyzing data"}
            ]
        });
        let (msg, is_error) = dispatch_write_todos(&ctx, &args);
        assert!(!is_error);
        assert!(msg.contains("1 in progress"));

        let (out, _) = (todo::render_todos(&ctx.todos.lock()), false);
        assert!(out.contains("[*] analyze data"));
    }

    #[tokio::test]
    async fn subagent_context_isolates_todos() {
        let ctx = ctx_with(MockRuntime::new(), &[]);
        let parent_args = serde_json::json!({
            "todos": [
                {"content": "ship the report", "status": "pending", "active_form": "Shipping the report"}
            ]
        });
        let (_, is_error) = dispatch_write_todos(&ctx, &parent_args);
        assert!(!is_error);

        // The child starts empty and cannot delegate further.
        let child = ctx.for_subagent();
        assert!(child.todos.lock().is_empty());
        assert!(!child.enable_subagents);
        assert!(!build_tool_definitions(&child, None)
            .iter()
            .any(|d| d.name == "task"));

        // A subagent write_todos touches only the child's list.
        let child_args = serde_json::json!({
            "todos": [
                {"content": "subagent scratch", "status": "pending", "active_form": "Scratching"}
            ]
        });
        let (_, is_error) = dispatch_write_todos(&child, &child_args);
        assert!(!is_error);
        assert_eq!(child.todos.lock()[0].content, "subagent scratch");

        let parent_todos = ctx.todos.lock();
        assert_eq!(parent_todos.len(), 1);
        assert_eq!(parent_todos[0].content, "ship the report");
    }

    #[tokio::test]
    async fn ls_formats_directory_listing() {
        let rt = MockRuntime::new();
        rt.push_output("uploads/\nintermediate/\n", 0);
        let ctx = ctx_with(rt, &[]);
        let (out, is_error) =
            dispatch_ls(&ctx, &serde_json::json!({"path": "/workspace"})).await;
        assert!(!is_error);
        assert_eq!(out, "Contents of /workspace:\n  uploads/\n  intermediate/");
    }

    #[tokio::test]
    async fn execute_reports_nonzero_exit() {
        let rt = MockRuntime::new();
        rt.push_output("boom", 2);
        let ctx = ctx_with(rt, &[]);
        let (out, is_error) =
            dispatch_execute(&ctx, &serde_json::json!({"command": "false"})).await;
        assert!(!is_error, "nonzero exit is a result the model can observe");
        assert!(out.starts_with("Command failed (exit code 2):"));
    }

    #[tokio::test]
    async fn unknown_tool_without_mcp_errors() {
        let ctx = ctx_with(MockRuntime::new(), &[]);
        let (out, is_error) =
            dispatch_mcp(None, "web_search", &serde_json::json!({})).await;
        assert!(is_error);
        assert!(out.contains("web_search"));
        let _ = ctx;
    }

    #[tokio::test]
    async fn grep_count_mode() {
        let rt = MockRuntime::new();
        rt.push_output("/a.py:1:import os\n/b.py:2:import sys\n", 0);
        let ctx = ctx_with(rt, &[]);
        let (out, _) = dispatch_grep(
            &ctx,
            &serde_json::json!({"pattern": "import", "output_mode": "count"}),
        )
        .await;
        assert_eq!(out, "Found 2 match(es) for 'import'");
    }
}
