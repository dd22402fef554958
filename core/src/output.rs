//! Output engine: pending model-authored file versions staged under the
//! chat's `output/` tree until the user applies or rejects them.
//!
//! Writes are double-guarded: the lexical `safe_join` first, then a
//! symlink-resolving containment check against the project root. A
//! resolved escape is fatal (it means a symlink was planted inside the
//! output tree, or a logic bug let a hostile path through).

use std::path::Path;
use std::path::PathBuf;

use bb7_protocol::Chat;

use crate::error::Bb7Err;
use crate::error::Result;
use crate::error::fatal_project_escape;
use crate::paths::is_within_real;
use crate::paths::relativize;
use crate::paths::safe_join;
use crate::store::ChatStore;

pub struct OutputEngine<'a> {
    store: &'a ChatStore,
    project_root: Option<&'a Path>,
}

impl<'a> OutputEngine<'a> {
    pub fn new(store: &'a ChatStore, project_root: Option<&'a Path>) -> Self {
        Self {
            store,
            project_root,
        }
    }

    /// Normalize a frontend- or model-supplied path to the output-relative
    /// form. Absolute paths inside the project are relativized; absolute
    /// paths outside it are rejected.
    pub fn normalize(&self, path: &str) -> Result<String> {
        if path.contains('\0') {
            return Err(Bb7Err::InvalidPath(path.escape_debug().to_string()));
        }
        let p = Path::new(path);
        if p.is_absolute() {
            let root = self
                .project_root
                .ok_or_else(|| Bb7Err::AbsolutePath(path.to_string()))?;
            return relativize(root, p).ok_or_else(|| Bb7Err::PathEscape(path.to_string()));
        }
        Ok(path.to_string())
    }

    /// Absolute filesystem location of an output entry.
    pub fn resolve_fs_path(&self, chat_id: &str, path: &str) -> Result<PathBuf> {
        let rel = self.normalize(path)?;
        safe_join(&self.store.output_dir(chat_id), &rel)
    }

    /// Absolute location of the file in the user's working tree.
    pub fn resolve_local_path(&self, path: &str) -> Result<PathBuf> {
        let rel = self.normalize(path)?;
        let root = self
            .project_root
            .ok_or_else(|| Bb7Err::FileNotFound(rel.clone()))?;
        safe_join(root, &rel)
    }

    pub fn write(&self, chat: &Chat, path: &str, content: &str) -> Result<()> {
        if chat.global {
            return Err(Bb7Err::GlobalReadOnly);
        }
        let rel = self.normalize(path)?;
        if let Some(cf) = chat.find_context_file(&rel) {
            if cf.external {
                return Err(Bb7Err::ExternalReadOnly(rel));
            }
            if cf.readonly {
                return Err(Bb7Err::ReadOnly(rel));
            }
        }

        let target = self.resolve_fs_path(&chat.id, &rel)?;
        self.guard_real(&target)?;
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
            // A directory symlink may have been created by the mkdir walk
            // above resolving through an existing link; re-check now that
            // every component exists.
            self.guard_real(&target)?;
        }
        std::fs::write(&target, content)?;
        Ok(())
    }

    pub fn read(&self, chat_id: &str, path: &str) -> Result<String> {
        let target = self.resolve_fs_path(chat_id, path)?;
        match std::fs::read_to_string(&target) {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Bb7Err::FileNotFound(path.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn exists(&self, chat_id: &str, path: &str) -> bool {
        self.resolve_fs_path(chat_id, path)
            .map(|p| p.is_file())
            .unwrap_or(false)
    }

    /// Recursive listing of pending proposals, root-relative with `/`
    /// separators, sorted for deterministic output.
    pub fn list(&self, chat_id: &str) -> Result<Vec<String>> {
        let root = self.store.output_dir(chat_id);
        let mut out = Vec::new();
        if root.is_dir() {
            collect_files(&root, &root, &mut out)?;
        }
        out.sort();
        Ok(out)
    }

    /// Delete one pending proposal and prune any directories the removal
    /// emptied, up to (but not including) the output root.
    pub fn delete(&self, chat_id: &str, path: &str) -> Result<()> {
        let root = self.store.output_dir(chat_id);
        let target = self.resolve_fs_path(chat_id, path)?;
        match std::fs::remove_file(&target) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Bb7Err::FileNotFound(path.to_string()));
            }
            Err(e) => return Err(e.into()),
        }

        let mut dir = target.parent().map(Path::to_path_buf);
        while let Some(d) = dir {
            if d == root || !d.starts_with(&root) {
                break;
            }
            if std::fs::remove_dir(&d).is_err() {
                break; // not empty (or already gone)
            }
            dir = d.parent().map(Path::to_path_buf);
        }
        Ok(())
    }

    /// The fatal symlink guard. Only meaningful for project chats; global
    /// chats never reach here because writes are refused earlier.
    fn guard_real(&self, target: &Path) -> Result<()> {
        let Some(root) = self.project_root else {
            return Err(Bb7Err::GlobalReadOnly);
        };
        match is_within_real(root, target) {
            Ok(true) => Ok(()),
            Ok(false) => fatal_project_escape(target),
            Err(e) => Err(e.into()),
        }
    }
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<String>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            collect_files(root, &path, out)?;
        } else if file_type.is_file()
            && let Some(rel) = relativize(root, &path)
        {
            out.push(rel);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use bb7_protocol::ContextFile;
    use pretty_assertions::assert_eq;

    struct Fixture {
        _tmp: tempfile::TempDir,
        root: PathBuf,
        store: ChatStore,
        chat: Chat,
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("proj");
        std::fs::create_dir_all(&root).unwrap();
        let store = ChatStore::project(&root);
        std::fs::create_dir_all(store.chats_dir()).unwrap();
        let chat = store.create("t").unwrap();
        Fixture {
            _tmp: tmp,
            root,
            store,
            chat,
        }
    }

    #[test]
    fn write_read_list_delete_round_trip() {
        let fx = fixture();
        let engine = OutputEngine::new(&fx.store, Some(&fx.root));

        engine.write(&fx.chat, "src/deep/a.go", "X\n").unwrap();
        engine.write(&fx.chat, "b.go", "Y\n").unwrap();
        assert_eq!(engine.read(&fx.chat.id, "src/deep/a.go").unwrap(), "X\n");
        assert_eq!(
            engine.list(&fx.chat.id).unwrap(),
            vec!["b.go".to_string(), "src/deep/a.go".to_string()]
        );

        engine.delete(&fx.chat.id, "src/deep/a.go").unwrap();
        // Emptied ancestors are pruned, the root survives.
        assert!(!fx.store.output_dir(&fx.chat.id).join("src").exists());
        assert!(fx.store.output_dir(&fx.chat.id).is_dir());
        assert_eq!(engine.list(&fx.chat.id).unwrap(), vec!["b.go".to_string()]);
    }

    #[test]
    fn absolute_paths_inside_project_are_relativized() {
        let fx = fixture();
        let engine = OutputEngine::new(&fx.store, Some(&fx.root));
        let abs = fx.root.join("c.go");
        engine
            .write(&fx.chat, &abs.to_string_lossy(), "Z\n")
            .unwrap();
        assert_eq!(engine.read(&fx.chat.id, "c.go").unwrap(), "Z\n");
    }

    #[test]
    fn escapes_and_invalid_paths_are_typed_errors() {
        let fx = fixture();
        let engine = OutputEngine::new(&fx.store, Some(&fx.root));
        assert!(matches!(
            engine.write(&fx.chat, "../escape", "x"),
            Err(Bb7Err::PathEscape(_))
        ));
        assert!(matches!(
            engine.write(&fx.chat, "/etc/passwd", "x"),
            Err(Bb7Err::PathEscape(_))
        ));
        assert!(matches!(
            engine.write(&fx.chat, "a\0b", "x"),
            Err(Bb7Err::InvalidPath(_))
        ));
        assert!(matches!(
            engine.write(&fx.chat, "", "x"),
            Err(Bb7Err::InvalidPath(_))
        ));
    }

    #[test]
    fn readonly_and_external_context_files_refuse_writes() {
        let mut fx = fixture();
        fx.chat.context_files.push(ContextFile {
            path: "ro.go".to_string(),
            readonly: true,
            external: false,
            version: "00000000".to_string(),
            start_line: 0,
            end_line: 0,
        });
        fx.chat.context_files.push(ContextFile {
            path: "/abs/ext.go".to_string(),
            readonly: true,
            external: true,
            version: "00000000".to_string(),
            start_line: 0,
            end_line: 0,
        });
        let engine = OutputEngine::new(&fx.store, Some(&fx.root));
        assert!(matches!(
            engine.write(&fx.chat, "ro.go", "x"),
            Err(Bb7Err::ReadOnly(_))
        ));
    }

    #[test]
    fn global_chats_refuse_writes() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ChatStore::global(tmp.path());
        std::fs::create_dir_all(store.chats_dir()).unwrap();
        let chat = store.create("g").unwrap();
        assert!(chat.global);

        let engine = OutputEngine::new(&store, None);
        assert!(matches!(
            engine.write(&chat, "a.go", "x"),
            Err(Bb7Err::GlobalReadOnly)
        ));
    }
}
