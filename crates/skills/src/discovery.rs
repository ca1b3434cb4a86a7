//! On-disk skill discovery: scan the skills root for `<name>/SKILL.md`
//! directories and collect frontmatter plus resource listings.

use std::collections::HashSet;
use std::path::Path;

use dg_domain::error::Result;

use crate::manifest::parse_skill_md;
use crate::types::Skill;

/// Scan `skills_root` and return all parseable skills, sorted by name.
///
/// When `allowed` is given, only skills whose frontmatter name is in the
/// set are returned — this is how the effective (permitted ∩ selected)
/// skill set narrows what gets mounted and listed.
///
/// Directories with a missing or invalid SKILL.md are skipped with a
/// warning, never fatal.
pub fn discover_skills(
    skills_root: &Path,
    allowed: Option<&HashSet<String>>,
) -> Result<Vec<Skill>> {
    let mut skills = Vec::new();
    if !skills_root.exists() {
        return Ok(skills);
    }

    for entry in std::fs::read_dir(skills_root)? {
        let entry = entry?;
        let dir = entry.path();
        if !dir.is_dir() {
            continue;
        }

        let md_path = dir.join("SKILL.md");
        if !md_path.exists() {
            continue;
        }

        let content = match std::fs::read_to_string(&md_path) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(path = %md_path.display(), error = %e, "unreadable SKILL.md, skipping");
                continue;
            }
        };

        let (frontmatter, _body) = match parse_skill_md(&content) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!(path = %md_path.display(), error = %e, "invalid SKILL.md, skipping");
                continue;
            }
        };

        if let Some(allowed) = allowed {
            if !allowed.contains(&frontmatter.name) {
                continue;
            }
        }

        skills.push(Skill {
            name: frontmatter.name,
            version: frontmatter.version.unwrap_or_else(|| "1.0.0".into()),
            description: frontmatter.description,
            tags: frontmatter.tags,
            resources: list_resources(&dir),
            path: dir,
        });
    }

    skills.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(skills)
}

/// Files next to SKILL.md (non-recursive), sorted.
fn list_resources(skill_dir: &Path) -> Vec<String> {
    let mut resources: Vec<String> = std::fs::read_dir(skill_dir)
        .map(|entries| {
            entries
                .flatten()
                .filter(|e| e.path().is_file())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .filter(|name| name != "SKILL.md")
                .collect()
        })
        .unwrap_or_default();
    resources.sort();
    resources
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_skill(root: &Path, name: &str, extra_files: &[&str]) {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("SKILL.md"),
            format!("---\nname: {name}\ndescription: {name} skill\n---\n\nInstructions for {name}.\n"),
        )
        .unwrap();
        for file in extra_files {
            std::fs::write(dir.join(file), "x").unwrap();
        }
    }

    #[test]
    fn discovers_sorted_skills_with_resources() {
        let root = TempDir::new().unwrap();
        write_skill(root.path(), "pdf", &[]);
        write_skill(root.path(), "excel-report", &["run.py", "template.xlsx"]);

        let skills = discover_skills(root.path(), None).unwrap();
        assert_eq!(skills.len(), 2);
        assert_eq!(skills[0].name, "excel-report");
        assert_eq!(skills[0].resources, vec!["run.py", "template.xlsx"]);
        assert_eq!(skills[1].name, "pdf");
        assert!(skills[1].resources.is_empty());
    }

    #[test]
    fn filters_by_allowed_names() {
        let root = TempDir::new().unwrap();
        write_skill(root.path(), "pdf", &[]);
        write_skill(root.path(), "excel-report", &[]);

        let allowed: HashSet<String> = ["pdf".to_string()].into();
        let skills = discover_skills(root.path(), Some(&allowed)).unwrap();
        assert_eq!(skills.len(), 1);
        assert_eq!(skills[0].name, "pdf");
    }

    #[test]
    fn skips_directories_without_manifest() {
        let root = TempDir::new().unwrap();
        std::fs::create_dir_all(root.path().join("not-a-skill")).unwrap();
        write_skill(root.path(), "pdf", &[]);

        let skills = discover_skills(root.path(), None).unwrap();
        assert_eq!(skills.len(), 1);
    }

    #[test]
    fn skips_invalid_manifest() {
        let root = TempDir::new().unwrap();
        let dir = root.path().join("broken");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("SKILL.md"), "no frontmatter at all").unwrap();

        assert!(discover_skills(root.path(), None).unwrap().is_empty());
    }

    #[test]
    fn missing_root_is_empty() {
        let root = TempDir::new().unwrap();
        let missing = root.path().join("nope");
        assert!(discover_skills(&missing, None).unwrap().is_empty());
    }
}
