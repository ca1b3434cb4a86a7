//! Dynamic system-prompt assembly: base instructions, workspace summary,
//! current todos, filesystem/sandbox rules, execution-environment report,
//! subagent roster, and the skill catalogue.

use dg_domain::config::ImageConfig;
use dg_domain::todo;
use dg_skills::types::render_catalog;

use super::TurnContext;

const BASE_INSTRUCTIONS: &str = "\
You are a capable assistant with planning, filesystem, execution, subagent, \
and skill tools.

## Working style
1. Plan before acting: use the todo list for multi-step tasks.
2. Read a file before editing it.
3. Mark a todo in_progress when you start it and completed as soon as it is done.
4. Delegate specialised work to a subagent when one is available.
5. Check the skill catalogue first; load a matching skill before improvising.

## Limits
- If the same tool fails 3 times in a row, stop retrying and tell the user.
- If searches stay unproductive after 2-3 keyword variations, say so.
- If you notice yourself repeating an action, stop and reconsider.";

const FILESYSTEM_SECTION: &str = "\
## Filesystem tools
- `ls(path)`: list a directory
- `read_file(path, offset?, limit?)`: read with line numbers
- `write_file(path, content)`: create or overwrite
- `edit_file(path, old, new, replace_all?)`: replace a unique string
- `glob(pattern, path?)`: find files by pattern
- `grep(pattern, path?, glob?, output_mode?)`: search file contents
Always read before editing; use edit_file for small changes, write_file for rewrites.";

const SANDBOX_SECTION: &str = "\
## Command execution (sandbox)
`execute(command, timeout?)` runs shell commands in an isolated container.
Rules:
1. The sandbox has NO network access. Never attempt `pip install`, `apt-get`,
   or any other download; use only the pre-installed libraries listed in the
   environment report.
2. Write intermediate artifacts under /workspace/intermediate.
3. Be careful with destructive commands.";

const SUBAGENT_SECTION: &str = "\
## Subagents
`task(description, subagent_type)` delegates a self-contained piece of work to
a subagent with its own fresh context. Available types:
- `general-purpose`: research, multi-step analysis, open-ended tasks
Give the subagent a complete description; it cannot ask follow-up questions.";

/// Assemble the full dynamic system prompt for one turn.
pub fn build_system_prompt(ctx: &TurnContext, files: &[String], image: &ImageConfig) -> String {
    let mut sections = vec![BASE_INSTRUCTIONS.to_string()];

    let files_section = render_files_section(files);
    if !files_section.is_empty() {
        sections.push(files_section);
    }

    {
        let todos = ctx.todos.lock();
        let todo_section = todo::render_prompt_section(&todos);
        if !todo_section.is_empty() {
            sections.push(todo_section);
        }
    }

    sections.push(FILESYSTEM_SECTION.to_string());
    sections.push(SANDBOX_SECTION.to_string());
    sections.push(render_environment_report(image));

    if ctx.enable_subagents {
        sections.push(SUBAGENT_SECTION.to_string());
    }

    let skills_section = render_catalog(&ctx.skills);
    if !skills_section.is_empty() {
        sections.push(skills_section);
    }

    sections.join("\n\n")
}

/// The workspace layout plus every discovered file.
fn render_files_section(files: &[String]) -> String {
    if files.is_empty() {
        return String::new();
    }
    let mut lines = vec![
        "## Available Files".to_string(),
        String::new(),
        "The workspace is laid out as /workspace/{uploads,intermediate,skills}. \
         These files are currently available:"
            .to_string(),
        String::new(),
    ];
    let mut sorted = files.to_vec();
    sorted.sort();
    for path in &sorted {
        lines.push(format!("- `{path}`"));
    }
    lines.push(String::new());
    lines.push(
        "Use `read_file(path)` to view contents, `grep` to search, or `execute` to \
         process them with shell commands."
            .to_string(),
    );
    lines.join("\n")
}

/// Capability report for the sandbox image, surfaced verbatim so the model
/// knows what is installed.
fn render_environment_report(image: &ImageConfig) -> String {
    let mut lines = vec![
        "## Execution Environment".to_string(),
        String::new(),
        format!("**Environment**: {}", image.name),
    ];
    if !image.description.is_empty() {
        lines.push(format!("**Description**: {}", image.description));
    }
    lines.push(format!("**Working directory**: {}", image.work_dir));
    if !image.pre_installed_packages.is_empty() {
        lines.push(String::new());
        lines.push("**Pre-installed libraries** (no installation needed):".to_string());
        for pkg in &image.pre_installed_packages {
            lines.push(format!("- {pkg}"));
        }
    }
    if !image.capabilities.is_empty() {
        lines.push(String::new());
        lines.push(format!("**Capabilities**: {}", image.capabilities.join(", ")));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn environment_report_lists_packages() {
        let image = ImageConfig {
            name: "data-analysis".into(),
            description: "Excel and stats".into(),
            pre_installed_packages: vec!["pandas".into(), "numpy".into()],
            capabilities: vec!["excel".into()],
            ..Default::default()
        };
        let report = render_environment_report(&image);
        assert!(report.contains("**Environment**: data-analysis"));
        assert!(report.contains("- pandas"));
        assert!(report.contains("**Capabilities**: excel"));
    }

    #[test]
    fn files_section_sorted_and_empty_when_no_files() {
        assert_eq!(render_files_section(&[]), "");
        let section = render_files_section(&[
            "/workspace/uploads/b.csv".into(),
            "/workspace/uploads/a.csv".into(),
        ]);
        let a = section.find("a.csv").unwrap();
        let b = section.find("b.csv").unwrap();
        assert!(a < b);
    }
}
