//! Path guard for everything the frontend or the model supplies.
//!
//! Two layers: [`safe_join`] is the lexical gate every relative path goes
//! through, and [`is_within_real`] is the symlink-resolving check that
//! protects writes. A write whose *resolved* target escapes the project
//! root is a fatal condition (see `error::fatal_project_escape`).

use std::path::Component;
use std::path::Path;
use std::path::PathBuf;

use crate::error::Bb7Err;
use crate::error::Result;

/// Lexically clean a relative path, resolving `.` and `..` without touching
/// the filesystem. `..` components that would climb above the start are
/// kept so the caller can detect escapes.
fn clean_relative(path: &Path) -> PathBuf {
    let mut out: Vec<Component> = Vec::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => match out.last() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                _ => out.push(Component::ParentDir),
            },
            other => out.push(other),
        }
    }
    out.iter().collect()
}

/// Join `rel` onto `base`, rejecting empty input, interior NUL bytes,
/// absolute paths, and any cleaned result that escapes `base`. Lexical
/// only: symlinks are the business of [`is_within_real`].
pub fn safe_join(base: &Path, rel: &str) -> Result<PathBuf> {
    if rel.is_empty() {
        return Err(Bb7Err::InvalidPath("empty path".to_string()));
    }
    if rel.contains('\0') {
        return Err(Bb7Err::InvalidPath(format!(
            "path contains NUL byte: {}",
            rel.escape_debug()
        )));
    }
    let rel_path = Path::new(rel);
    if rel_path.is_absolute() {
        return Err(Bb7Err::AbsolutePath(rel.to_string()));
    }

    let cleaned = clean_relative(rel_path);
    if cleaned.as_os_str().is_empty() {
        return Err(Bb7Err::InvalidPath(rel.to_string()));
    }
    match cleaned.components().next() {
        Some(Component::ParentDir) => Err(Bb7Err::PathEscape(rel.to_string())),
        _ => Ok(base.join(cleaned)),
    }
}

/// Resolve `path` through symlinks even when a suffix of it does not exist
/// yet: the nearest existing ancestor is canonicalized and the missing
/// tail re-attached.
pub fn resolve_lenient(path: &Path) -> std::io::Result<PathBuf> {
    match path.canonicalize() {
        Ok(resolved) => Ok(resolved),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let mut existing = path.to_path_buf();
            let mut tail: Vec<std::ffi::OsString> = Vec::new();
            loop {
                match existing.canonicalize() {
                    Ok(resolved) => {
                        let mut out = resolved;
                        for part in tail.iter().rev() {
                            out.push(part);
                        }
                        return Ok(out);
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        match existing.file_name() {
                            Some(name) => {
                                tail.push(name.to_os_string());
                                existing.pop();
                            }
                            None => return Err(e),
                        }
                        if existing.as_os_str().is_empty() {
                            return Err(std::io::Error::new(
                                std::io::ErrorKind::NotFound,
                                format!("no existing ancestor for {}", path.display()),
                            ));
                        }
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Err(e) => Err(e),
    }
}

/// Symlink-aware containment check used as the write guard: both sides are
/// resolved through the real filesystem before comparison.
pub fn is_within_real(base: &Path, target: &Path) -> std::io::Result<bool> {
    let base = base.canonicalize()?;
    let target = resolve_lenient(target)?;
    Ok(target.starts_with(&base))
}

/// If `abs` lies inside `root`, return its project-relative form with `/`
/// separators; `None` when it points elsewhere.
pub fn relativize(root: &Path, abs: &Path) -> Option<String> {
    let rel = abs.strip_prefix(root).ok()?;
    let mut out = String::new();
    for comp in rel.components() {
        if !out.is_empty() {
            out.push('/');
        }
        out.push_str(&comp.as_os_str().to_string_lossy());
    }
    if out.is_empty() { None } else { Some(out) }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn joins_simple_relative_paths() {
        let base = Path::new("/p");
        assert_eq!(
            safe_join(base, "a/b.go").unwrap(),
            PathBuf::from("/p/a/b.go")
        );
        assert_eq!(
            safe_join(base, "./a/../c.go").unwrap(),
            PathBuf::from("/p/c.go")
        );
    }

    #[test]
    fn rejects_escapes() {
        let base = Path::new("/p");
        assert!(matches!(
            safe_join(base, ".."),
            Err(Bb7Err::PathEscape(_))
        ));
        assert!(matches!(
            safe_join(base, "../x"),
            Err(Bb7Err::PathEscape(_))
        ));
        assert!(matches!(
            safe_join(base, "a/../../x"),
            Err(Bb7Err::PathEscape(_))
        ));
    }

    #[test]
    fn rejects_empty_nul_and_absolute() {
        let base = Path::new("/p");
        assert!(matches!(safe_join(base, ""), Err(Bb7Err::InvalidPath(_))));
        assert!(matches!(
            safe_join(base, "a\0b"),
            Err(Bb7Err::InvalidPath(_))
        ));
        assert!(matches!(
            safe_join(base, "/etc/passwd"),
            Err(Bb7Err::AbsolutePath(_))
        ));
    }

    #[test]
    fn within_real_follows_symlinks() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("root");
        let outside = tmp.path().join("outside");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::create_dir_all(&outside).unwrap();

        // A directory symlink inside the root pointing outside of it.
        #[cfg(unix)]
        {
            std::os::unix::fs::symlink(&outside, root.join("link")).unwrap();
            let escapee = root.join("link/evil.txt");
            assert!(!is_within_real(&root, &escapee).unwrap());
        }

        let fine = root.join("sub/ok.txt");
        assert!(is_within_real(&root, &fine).unwrap());
    }

    #[test]
    fn resolve_lenient_reattaches_missing_tail() {
        let tmp = tempfile::tempdir().unwrap();
        let missing = tmp.path().join("not/yet/here.txt");
        let resolved = resolve_lenient(&missing).unwrap();
        assert!(resolved.ends_with("not/yet/here.txt"));
    }

    #[test]
    fn relativize_inside_and_outside() {
        let root = Path::new("/p");
        assert_eq!(
            relativize(root, Path::new("/p/a/b.go")),
            Some("a/b.go".to_string())
        );
        assert_eq!(relativize(root, Path::new("/q/a.go")), None);
        assert_eq!(relativize(root, Path::new("/p")), None);
    }
}
