//! SKILL.md frontmatter — a YAML block delimited by `---` at the top of the
//! file, followed by markdown instructions.
//!
//! Required fields:
//! ```yaml
//! ---
//! name: excel-report
//! description: Build styled Excel reports from CSV inputs
//! ---
//! ```
//! Optional: `version`, `author`, `tags`.

use serde::{Deserialize, Serialize};

use dg_domain::error::{Error, Result};

/// Validates a skill name: `^[a-z0-9]+(-[a-z0-9]+)*$`.
pub fn is_valid_skill_name(name: &str) -> bool {
    if name.is_empty() || name.starts_with('-') || name.ends_with('-') {
        return false;
    }
    let mut prev_hyphen = false;
    for ch in name.chars() {
        if ch == '-' {
            if prev_hyphen {
                return false;
            }
            prev_hyphen = true;
        } else if ch.is_ascii_lowercase() || ch.is_ascii_digit() {
            prev_hyphen = false;
        } else {
            return false;
        }
    }
    true
}

/// Parsed YAML frontmatter of a SKILL.md file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SkillFrontmatter {
    pub name: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl SkillFrontmatter {
    pub fn validate(&self) -> Result<()> {
        if !is_valid_skill_name(&self.name) {
            return Err(Error::Validation(format!(
                "invalid skill name '{}': must match ^[a-z0-9]+(-[a-z0-9]+)*$",
                self.name
            )));
        }
        if self.description.trim().is_empty() {
            return Err(Error::Validation(format!(
                "skill '{}' has no description",
                self.name
            )));
        }
        Ok(())
    }
}

/// Split a SKILL.md file into frontmatter and body.
///
/// Fails when the frontmatter block is missing, unparseable, or invalid
/// (no name / bad name / empty description).
pub fn parse_skill_md(content: &str) -> Result<(SkillFrontmatter, String)> {
    let trimmed = content.trim_start();
    let Some(after_open) = trimmed.strip_prefix("---") else {
        return Err(Error::Validation(
            "SKILL.md is missing its YAML frontmatter block".into(),
        ));
    };

    let Some(close_idx) = after_open.find("\n---") else {
        return Err(Error::Validation(
            "SKILL.md frontmatter is not closed with ---".into(),
        ));
    };

    let yaml = &after_open[..close_idx];
    let body = after_open[close_idx + 4..]
        .trim_start_matches('\n')
        .to_string();

    let frontmatter: SkillFrontmatter =
        serde_yaml::from_str(yaml).map_err(|e| Error::Validation(format!("SKILL.md frontmatter: {e}")))?;
    frontmatter.validate()?;
    Ok((frontmatter, body))
}

/// Render frontmatter + body back into SKILL.md form. Inverse of
/// [`parse_skill_md`] on the well-formed subset.
pub fn render_skill_md(frontmatter: &SkillFrontmatter, body: &str) -> String {
    let yaml = serde_yaml::to_string(frontmatter).unwrap_or_default();
    format!("---\n{yaml}---\n\n{body}")
}
