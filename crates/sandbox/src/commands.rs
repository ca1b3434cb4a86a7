//! Pure helpers behind the sandbox file tools: the in-container command
//! strings and the parsing/formatting of their output. Kept free of I/O so
//! they are testable without a container.

use crate::sandbox::{GrepMatch, LsEntry};

/// Single-quote a string for `sh -c` interpolation.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Command listing every file under the three workspace trees, SKILL.md
/// excluded from the skills listing to keep the discovery output small.
pub fn discover_commands() -> [&'static str; 3] {
    [
        "find /workspace/uploads -type f 2>/dev/null || true",
        "find /workspace/intermediate -type f 2>/dev/null || true",
        "find /workspace/skills -type f ! -name 'SKILL.md' 2>/dev/null || true",
    ]
}

pub fn cat_command(path: &str) -> String {
    format!("cat -- {}", shell_quote(path))
}

/// Write base64-encoded content to a path, creating parent directories.
pub fn write_command(path: &str, encoded: &str) -> String {
    let quoted = shell_quote(path);
    match parent_dir(path) {
        Some(parent) => format!(
            "mkdir -p -- {} && printf '%s' {} | base64 -d > {}",
            shell_quote(&parent),
            shell_quote(encoded),
            quoted
        ),
        None => format!("printf '%s' {} | base64 -d > {}", shell_quote(encoded), quoted),
    }
}

fn parent_dir(path: &str) -> Option<String> {
    let trimmed = path.trim_end_matches('/');
    let idx = trimmed.rfind('/')?;
    if idx == 0 {
        return None;
    }
    Some(trimmed[..idx].to_string())
}

/// `ls` with one entry per line, directories marked with a trailing slash.
pub fn ls_command(path: &str) -> String {
    format!("ls -1Ap -- {}", shell_quote(path))
}

pub fn parse_ls_output(output: &str) -> Vec<LsEntry> {
    output
        .lines()
        .filter(|l| !l.is_empty())
        .map(|line| match line.strip_suffix('/') {
            Some(name) => LsEntry {
                name: name.to_string(),
                is_dir: true,
            },
            None => LsEntry {
                name: line.to_string(),
                is_dir: false,
            },
        })
        .collect()
}

/// Translate a glob pattern into a `find` invocation under `base`.
///
/// `**/` prefixes search recursively; a bare pattern stays in the top
/// directory; a directory prefix narrows the search root.
pub fn glob_command(base: &str, pattern: &str) -> String {
    let (dir, file_pattern, recursive) = split_glob(base, pattern);
    let depth = if recursive { "" } else { " -maxdepth 1" };
    format!(
        "find {}{} -type f -name {} 2>/dev/null | sort",
        shell_quote(&dir),
        depth,
        shell_quote(&file_pattern)
    )
}

/// Split `pattern` into (search root, file pattern, recursive).
fn split_glob(base: &str, pattern: &str) -> (String, String, bool) {
    let base = base.trim_end_matches('/');
    let (dir_part, file_part) = match pattern.rsplit_once('/') {
        Some((dir, file)) => (dir, file),
        None => ("", pattern),
    };

    let recursive = dir_part.contains("**");
    let fixed_prefix: String = dir_part
        .split('/')
        .take_while(|seg| !seg.contains('*'))
        .collect::<Vec<_>>()
        .join("/");

    let dir = if fixed_prefix.is_empty() {
        base.to_string()
    } else {
        format!("{base}/{fixed_prefix}")
    };
    (dir, file_part.to_string(), recursive)
}

/// `grep -rnE` with an optional `--include` filter.
pub fn grep_command(pattern: &str, path: &str, include_glob: Option<&str>) -> String {
    let include = include_glob
        .map(|g| format!(" --include={}", shell_quote(g)))
        .unwrap_or_default();
    format!(
        "grep -rnE{} -e {} -- {} 2>/dev/null",
        include,
        shell_quote(pattern),
        shell_quote(path)
    )
}

/// Parse `grep -rn` output lines (`path:line:content`).
pub fn parse_grep_output(output: &str) -> Vec<GrepMatch> {
    output
        .lines()
        .filter_map(|line| {
            let (path, rest) = line.split_once(':')?;
            let (line_number, content) = rest.split_once(':')?;
            Some(GrepMatch {
                path: path.to_string(),
                line_number: line_number.parse().ok()?,
                line: content.to_string(),
            })
        })
        .collect()
}

/// Number file content like `cat -n`, applying a line offset (0-indexed)
/// and limit.
pub fn number_lines(content: &str, offset: usize, limit: usize) -> String {
    content
        .lines()
        .enumerate()
        .skip(offset)
        .take(limit)
        .map(|(i, line)| format!("{:>6}\t{}", i + 1, line))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Truncate at `max_bytes` on a char boundary. Returns whether truncation
/// happened.
pub fn truncate_output(output: &mut String, max_bytes: usize) -> bool {
    if output.len() <= max_bytes {
        return false;
    }
    let mut end = max_bytes;
    while end > 0 && !output.is_char_boundary(end) {
        end -= 1;
    }
    output.truncate(end);
    true
}
