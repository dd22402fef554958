//! Project instruction files and the system-prompt override.
//!
//! `instructions` / `instructions.md` at the project root are plain text
//! with `@@` line comments and `@include <rel>` directives. Includes are
//! resolved against the project root with the same symlink-aware escape
//! checks as every other read, and fenced code blocks (``` or ~~~)
//! suppress directive parsing so examples can show the syntax.

use std::collections::HashSet;
use std::path::Path;
use std::path::PathBuf;

use tracing::warn;

use crate::config::system_prompt_override_path;
use crate::error::Bb7Err;
use crate::error::Result;
use crate::paths::is_within_real;
use crate::paths::safe_join;

const CANDIDATE_FILENAMES: &[&str] = &["instructions", "instructions.md"];
const MAX_INCLUDE_DEPTH: usize = 8;

const INSTRUCTIONS_TEMPLATE: &str = "\
@@ Project instructions for the assistant.
@@ Lines starting with @@ are comments and are not sent to the model.
@@ Use @include <relative-path> to pull in other files.
";

/// The instruction file the project uses: the first existing candidate,
/// or the default location when none exists yet.
pub fn instructions_path(project_root: &Path) -> PathBuf {
    for name in CANDIDATE_FILENAMES {
        let candidate = project_root.join(name);
        if candidate.is_file() {
            return candidate;
        }
    }
    project_root.join("instructions.md")
}

/// Create the instruction file from the template when missing; returns its
/// path either way.
pub fn prepare(project_root: &Path) -> Result<PathBuf> {
    let path = instructions_path(project_root);
    if !path.exists() {
        std::fs::write(&path, INSTRUCTIONS_TEMPLATE)?;
    }
    Ok(path)
}

/// Load and render the project instructions, or `None` when no file
/// exists or it renders empty.
pub fn load_project_instructions(project_root: &Path) -> Result<Option<String>> {
    let path = instructions_path(project_root);
    let raw = match std::fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut visited = HashSet::new();
    visited.insert(path.clone());
    let rendered = render(&raw, project_root, 0, &mut visited)?;
    if rendered.trim().is_empty() {
        Ok(None)
    } else {
        Ok(Some(rendered))
    }
}

/// `~/.config/bb7/system_prompt.txt`, comment-stripped; replaces the
/// built-in system prompt only when non-empty.
pub fn load_system_prompt_override() -> Result<Option<String>> {
    let path = system_prompt_override_path()?;
    let raw = match std::fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let stripped = strip_comments(&raw);
    if stripped.trim().is_empty() {
        Ok(None)
    } else {
        Ok(Some(stripped))
    }
}

/// Drop `@@` comment lines; everything else passes through untouched.
pub fn strip_comments(text: &str) -> String {
    let mut out = String::new();
    for line in text.lines() {
        if line.trim_start().starts_with("@@") {
            continue;
        }
        out.push_str(line);
        out.push('\n');
    }
    out
}

fn render(
    text: &str,
    project_root: &Path,
    depth: usize,
    visited: &mut HashSet<PathBuf>,
) -> Result<String> {
    let mut out = String::new();
    let mut fence: Option<&str> = None;

    for line in text.lines() {
        let trimmed = line.trim_start();

        // Track fenced blocks; directives inside them are literal text.
        if let Some(open) = fence {
            out.push_str(line);
            out.push('\n');
            if trimmed.starts_with(open) {
                fence = None;
            }
            continue;
        }
        if trimmed.starts_with("```") {
            fence = Some("```");
            out.push_str(line);
            out.push('\n');
            continue;
        }
        if trimmed.starts_with("~~~") {
            fence = Some("~~~");
            out.push_str(line);
            out.push('\n');
            continue;
        }

        if trimmed.starts_with("@@") {
            continue;
        }

        if let Some(rest) = trimmed.strip_prefix("@include") {
            let target = parse_include_target(rest);
            match target {
                Some(rel) => {
                    out.push_str(&self::include(&rel, project_root, depth, visited)?);
                }
                None => warn!("malformed @include directive: {line}"),
            }
            continue;
        }

        out.push_str(line);
        out.push('\n');
    }
    Ok(out)
}

/// `@include foo/bar.md` or `@include "with spaces.md"`.
fn parse_include_target(rest: &str) -> Option<String> {
    let rest = rest.trim();
    if rest.is_empty() {
        return None;
    }
    if let Some(stripped) = rest.strip_prefix('"') {
        let end = stripped.find('"')?;
        return Some(stripped[..end].to_string());
    }
    Some(rest.split_whitespace().next()?.to_string())
}

fn include(
    rel: &str,
    project_root: &Path,
    depth: usize,
    visited: &mut HashSet<PathBuf>,
) -> Result<String> {
    if depth >= MAX_INCLUDE_DEPTH {
        return Err(Bb7Err::InvalidRequest(format!(
            "@include nesting deeper than {MAX_INCLUDE_DEPTH}: {rel}"
        )));
    }
    let path = safe_join(project_root, rel)?;
    if !is_within_real(project_root, &path)? {
        return Err(Bb7Err::PathEscape(rel.to_string()));
    }
    if !visited.insert(path.clone()) {
        warn!("skipping circular @include of {rel}");
        return Ok(String::new());
    }
    let raw = match std::fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!("@include target not found: {rel}");
            return Ok(String::new());
        }
        Err(e) => return Err(e.into()),
    };
    render(&raw, project_root, depth + 1, visited)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn comments_are_stripped_and_includes_resolved() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        std::fs::write(root.join("extra.md"), "extra line\n").unwrap();
        std::fs::write(
            root.join("instructions.md"),
            "@@ hidden\nkeep this\n@include extra.md\n",
        )
        .unwrap();

        let rendered = load_project_instructions(root).unwrap().unwrap();
        assert_eq!(rendered, "keep this\nextra line\n");
    }

    #[test]
    fn quoted_include_targets_may_contain_spaces() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        std::fs::write(root.join("with space.md"), "spaced\n").unwrap();
        std::fs::write(
            root.join("instructions"),
            "@include \"with space.md\"\n",
        )
        .unwrap();

        let rendered = load_project_instructions(root).unwrap().unwrap();
        assert_eq!(rendered, "spaced\n");
    }

    #[test]
    fn fences_suppress_directive_parsing() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        std::fs::write(
            root.join("instructions.md"),
            "```\n@include nope.md\n@@ kept literal\n```\nafter\n",
        )
        .unwrap();

        let rendered = load_project_instructions(root).unwrap().unwrap();
        assert!(rendered.contains("@include nope.md"));
        assert!(rendered.contains("@@ kept literal"));
        assert!(rendered.contains("after"));
    }

    #[test]
    fn escaping_includes_are_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("proj");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("instructions.md"), "@include ../secret\n").unwrap();

        assert!(matches!(
            load_project_instructions(&root),
            Err(Bb7Err::PathEscape(_))
        ));
    }

    #[test]
    fn circular_includes_terminate() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        std::fs::write(root.join("instructions.md"), "top\n@include a.md\n").unwrap();
        std::fs::write(root.join("a.md"), "a\n@include a.md\n").unwrap();

        let rendered = load_project_instructions(root).unwrap().unwrap();
        assert_eq!(rendered, "top\na\n");
    }

    #[test]
    fn prepare_creates_template_once() {
        let tmp = tempfile::tempdir().unwrap();
        let path = prepare(tmp.path()).unwrap();
        assert!(path.ends_with("instructions.md"));
        let first = std::fs::read_to_string(&path).unwrap();

        std::fs::write(&path, "customized\n").unwrap();
        let again = prepare(tmp.path()).unwrap();
        assert_eq!(again, path);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "customized\n");
        assert!(first.contains("@@"));
    }
}
