use std::path::PathBuf;

use serde::Serialize;

/// A discovered skill: frontmatter metadata plus the resource files that
/// sit next to SKILL.md. The instruction body stays on disk and is read
/// inside the sandbox when the model loads the skill.
#[derive(Debug, Clone, Serialize)]
pub struct Skill {
    pub name: String,
    pub version: String,
    pub description: String,
    pub path: PathBuf,
    pub tags: Vec<String>,
    /// File names next to SKILL.md (scripts, templates, references).
    pub resources: Vec<String>,
}

/// Render the skill catalogue section of the dynamic system prompt.
///
/// The skill-first rule is part of the prompt contract: when a task matches
/// a listed skill the model should load it instead of improvising.
pub fn render_catalog(skills: &[Skill]) -> String {
    if skills.is_empty() {
        return String::new();
    }

    let mut lines = vec![
        "## Available Skills".to_string(),
        String::new(),
        "Skills are curated capability packs with vetted instructions and resources."
            .to_string(),
        "When a task matches a skill below, load it with `load_skill` first and follow"
            .to_string(),
        "its instructions instead of improvising. Prefer bundled scripts and templates"
            .to_string(),
        "over writing your own.".to_string(),
        String::new(),
    ];

    for skill in skills {
        let tags = if skill.tags.is_empty() {
            String::new()
        } else {
            format!(" [{}]", skill.tags.join(", "))
        };
        lines.push(format!("- **{}**{}: {}", skill.name, tags, skill.description));
    }

    lines.join("\n")
}
