//! Skill-pack installation from an uploaded `.tar.gz` archive.
//!
//! An archive must contain exactly one top-level directory holding a
//! SKILL.md; the directory is installed under the skills root as
//! `{skills_root}/{name}/` where `name` comes from the frontmatter, not
//! the archive. Entries that escape their directory are rejected.

use std::io::Read;
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use tar::Archive;

use dg_domain::error::{Error, Result};

use crate::manifest::parse_skill_md;
use crate::types::Skill;

/// Hard cap on a single extracted file, guards against decompression bombs.
const MAX_ENTRY_BYTES: u64 = 20 * 1024 * 1024;

/// Unpack and install a skill archive. Returns the installed skill's
/// discovered metadata. Replaces any existing skill with the same name.
pub fn install_archive(skills_root: &Path, archive_bytes: &[u8]) -> Result<Skill> {
    let entries = unpack(archive_bytes)?;

    let top_dir = single_top_dir(&entries)?;
    let manifest = entries
        .iter()
        .find(|(path, _)| *path == top_dir.join("SKILL.md"))
        .ok_or_else(|| Error::Validation("archive has no SKILL.md in its top-level directory".into()))?;

    let content = String::from_utf8(manifest.1.clone())
        .map_err(|_| Error::Validation("SKILL.md is not valid UTF-8".into()))?;
    let (frontmatter, _body) = parse_skill_md(&content)?;

    // Write into place under the frontmatter name, replacing any previous
    // install of the same skill.
    let target = skills_root.join(&frontmatter.name);
    if target.exists() {
        std::fs::remove_dir_all(&target)?;
    }
    for (path, bytes) in &entries {
        let relative = path.strip_prefix(&top_dir).unwrap_or(path);
        if relative.as_os_str().is_empty() {
            continue;
        }
        let dest = target.join(relative);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&dest, bytes)?;
    }

    tracing::info!(
        skill = %frontmatter.name,
        files = entries.len(),
        path = %target.display(),
        "skill pack installed"
    );

    let resources = entries
        .iter()
        .filter_map(|(path, _)| {
            let rel = path.strip_prefix(&top_dir).ok()?;
            let name = rel.to_string_lossy().into_owned();
            (rel.components().count() == 1 && name != "SKILL.md").then_some(name)
        })
        .collect();

    Ok(Skill {
        name: frontmatter.name,
        version: frontmatter.version.unwrap_or_else(|| "1.0.0".into()),
        description: frontmatter.description,
        tags: frontmatter.tags,
        resources,
        path: target,
    })
}

/// Remove an installed skill directory. Returns whether it existed.
pub fn uninstall(skills_root: &Path, name: &str) -> Result<bool> {
    let target = skills_root.join(name);
    if !target.exists() {
        return Ok(false);
    }
    std::fs::remove_dir_all(&target)?;
    Ok(true)
}

/// Decode the gzip tar into `(relative_path, bytes)` pairs, validating
/// every entry path.
fn unpack(archive_bytes: &[u8]) -> Result<Vec<(PathBuf, Vec<u8>)>> {
    let mut archive = Archive::new(GzDecoder::new(archive_bytes));
    let mut files = Vec::new();

    let entries = archive
        .entries()
        .map_err(|e| Error::Validation(format!("not a valid tar.gz archive: {e}")))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| Error::Validation(format!("corrupt archive entry: {e}")))?;
        let path = entry
            .path()
            .map_err(|e| Error::Validation(format!("bad entry path: {e}")))?
            .into_owned();
        validate_entry_path(&path)?;

        if entry.size() > MAX_ENTRY_BYTES {
            return Err(Error::Validation(format!(
                "archive entry '{}' exceeds the {MAX_ENTRY_BYTES}-byte limit",
                path.display()
            )));
        }

        if entry.header().entry_type().is_dir() {
            continue;
        }
        let mut bytes = Vec::with_capacity(entry.size() as usize);
        entry
            .read_to_end(&mut bytes)
            .map_err(|e| Error::Validation(format!("corrupt archive entry: {e}")))?;
        files.push((path, bytes));
    }

    if files.is_empty() {
        return Err(Error::Validation("archive contains no files".into()));
    }
    Ok(files)
}

fn validate_entry_path(path: &Path) -> Result<()> {
    if path.is_absolute() {
        return Err(Error::Validation(format!(
            "archive entry '{}' has an absolute path",
            path.display()
        )));
    }
    for component in path.components() {
        if matches!(component, Component::ParentDir) {
            return Err(Error::Validation(format!(
                "archive entry '{}' escapes its directory",
                path.display()
            )));
        }
    }
    Ok(())
}

/// All entries must share one top-level directory.
fn single_top_dir(entries: &[(PathBuf, Vec<u8>)]) -> Result<PathBuf> {
    let mut top: Option<PathBuf> = None;
    for (path, _) in entries {
        let first = path
            .components()
            .next()
            .map(|c| PathBuf::from(c.as_os_str()))
            .ok_or_else(|| Error::Validation("archive entry with empty path".into()))?;
        if path.components().count() < 2 {
            return Err(Error::Validation(format!(
                "archive entry '{}' is not inside a top-level directory",
                path.display()
            )));
        }
        match &top {
            None => top = Some(first),
            Some(existing) if *existing != first => {
                return Err(Error::Validation(
                    "archive must contain exactly one top-level directory".into(),
                ));
            }
            _ => {}
        }
    }
    top.ok_or_else(|| Error::Validation("archive contains no files".into()))
}
