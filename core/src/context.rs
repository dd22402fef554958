//! Context engine: the set of file snapshots the model is allowed to see.
//!
//! Full files live under `context/` by their project-relative path,
//! read-only line-range sections under `context/_sections/<hash>`, and
//! external (absolute, outside-project) files under
//! `context/_external/<hash>`. Every mutation appends exactly one context
//! event to the active chat so the model can replay the history of
//! attachments and edits.

use std::path::Path;
use std::path::PathBuf;

use bb7_protocol::Chat;
use bb7_protocol::ContextAction;
use bb7_protocol::ContextEvent;
use bb7_protocol::ContextFile;

use crate::error::Bb7Err;
use crate::error::Result;
use crate::hash::short_id;
use crate::hash::storage_hash;
use crate::paths::relativize;
use crate::paths::safe_join;
use crate::store::ChatStore;
use crate::store::EXTERNAL_SUBDIR;
use crate::store::SECTIONS_SUBDIR;

pub struct ContextEngine<'a> {
    store: &'a ChatStore,
    project_root: Option<&'a Path>,
}

/// Canonical form of a frontend-supplied path.
enum CanonicalPath {
    /// Relative to the project root (absolute inputs inside the project
    /// are folded into this form).
    Internal(String),
    /// Absolute and outside the project; forced read-only.
    External(String),
}

impl<'a> ContextEngine<'a> {
    pub fn new(store: &'a ChatStore, project_root: Option<&'a Path>) -> Self {
        Self {
            store,
            project_root,
        }
    }

    fn canonicalize(&self, path: &str) -> Result<CanonicalPath> {
        if path.is_empty() {
            return Err(Bb7Err::InvalidPath("empty path".to_string()));
        }
        if path.contains('\0') {
            return Err(Bb7Err::InvalidPath(path.escape_debug().to_string()));
        }
        let p = Path::new(path);
        if p.is_absolute() {
            if let Some(root) = self.project_root
                && let Some(rel) = relativize(root, p)
            {
                return Ok(CanonicalPath::Internal(rel));
            }
            return Ok(CanonicalPath::External(path.to_string()));
        }
        // Validate the relative path lexically; the joined result is
        // discarded, only the cleaned relative form matters here.
        let root = self.project_root.unwrap_or_else(|| Path::new("."));
        let joined = safe_join(root, path)?;
        match relativize(root, &joined) {
            Some(rel) => Ok(CanonicalPath::Internal(rel)),
            None => Err(Bb7Err::InvalidPath(path.to_string())),
        }
    }

    /// Where a context entry's snapshot bytes live on disk.
    pub fn storage_path(&self, chat_id: &str, cf: &ContextFile) -> Result<PathBuf> {
        let context_dir = self.store.context_dir(chat_id);
        if cf.is_section() {
            let key = format!("{}:{}:{}", cf.path, cf.start_line, cf.end_line);
            Ok(context_dir.join(SECTIONS_SUBDIR).join(storage_hash(&key)))
        } else if cf.external {
            Ok(context_dir.join(EXTERNAL_SUBDIR).join(storage_hash(&cf.path)))
        } else {
            safe_join(&context_dir, &cf.path)
        }
    }

    /// Content to snapshot: the explicit buffer contents when given, else
    /// the file as it exists on disk.
    fn resolve_content(&self, canonical: &CanonicalPath, content: Option<&str>) -> Result<String> {
        if let Some(content) = content {
            return Ok(content.to_string());
        }
        let fs_path = match canonical {
            CanonicalPath::External(abs) => PathBuf::from(abs),
            CanonicalPath::Internal(rel) => {
                let root = self
                    .project_root
                    .ok_or_else(|| Bb7Err::FileNotFound(rel.clone()))?;
                safe_join(root, rel)?
            }
        };
        match std::fs::read_to_string(&fs_path) {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Bb7Err::FileNotFound(fs_path.display().to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn write_snapshot(&self, chat_id: &str, cf: &ContextFile, content: &str) -> Result<()> {
        let path = self.storage_path(chat_id, cf)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn add(
        &self,
        chat: &mut Chat,
        path: &str,
        content: Option<&str>,
        readonly: bool,
    ) -> Result<ContextFile> {
        let canonical = self.canonicalize(path)?;
        let (canonical_path, external, readonly) = match &canonical {
            CanonicalPath::Internal(rel) => (rel.clone(), false, readonly),
            // External files can never be writable.
            CanonicalPath::External(abs) => (abs.clone(), true, true),
        };

        if chat
            .context_files
            .iter()
            .any(|cf| cf.same_entry(&canonical_path, 0, 0))
        {
            return Err(Bb7Err::FileExists(canonical_path));
        }

        let content = self.resolve_content(&canonical, content)?;
        let cf = ContextFile {
            path: canonical_path.clone(),
            readonly,
            external,
            version: short_id(&canonical_path, &content),
            start_line: 0,
            end_line: 0,
        };
        self.write_snapshot(&chat.id, &cf, &content)?;
        chat.context_files.push(cf.clone());

        let mut event = ContextEvent::new(ContextAction::UserAddFile, &canonical_path);
        event.readonly = Some(readonly);
        event.external = external.then_some(true);
        event.version = Some(cf.version.clone());
        chat.record_event(event);
        Ok(cf)
    }

    pub fn add_section(
        &self,
        chat: &mut Chat,
        path: &str,
        start_line: u32,
        end_line: u32,
        content: Option<&str>,
    ) -> Result<ContextFile> {
        if start_line < 1 || end_line < start_line {
            return Err(Bb7Err::InvalidRequest(format!(
                "invalid section range {start_line}-{end_line}"
            )));
        }
        let canonical = self.canonicalize(path)?;
        let canonical_path = match &canonical {
            CanonicalPath::Internal(rel) => rel.clone(),
            CanonicalPath::External(abs) => abs.clone(),
        };

        // Overlapping sections are fine; the exact same range twice is not.
        if chat
            .context_files
            .iter()
            .any(|cf| cf.same_entry(&canonical_path, start_line, end_line))
        {
            return Err(Bb7Err::FileExists(format!(
                "{canonical_path}:{start_line}-{end_line}"
            )));
        }

        let content = match content {
            Some(content) => content.to_string(),
            None => {
                let full = self.resolve_content(&canonical, None)?;
                slice_lines(&full, start_line, end_line)
            }
        };

        let key = format!("{canonical_path}:{start_line}:{end_line}");
        let cf = ContextFile {
            path: canonical_path.clone(),
            readonly: true,
            external: false,
            version: short_id(&key, &content),
            start_line,
            end_line,
        };
        self.write_snapshot(&chat.id, &cf, &content)?;
        chat.context_files.push(cf.clone());

        let mut event = ContextEvent::new(ContextAction::UserAddSection, &canonical_path);
        event.start_line = Some(start_line);
        event.end_line = Some(end_line);
        event.version = Some(cf.version.clone());
        chat.record_event(event);
        Ok(cf)
    }

    /// Removes the entry from the list. The snapshot file stays on disk so
    /// versions referenced by historical audit events remain readable.
    pub fn remove(&self, chat: &mut Chat, path: &str) -> Result<()> {
        let canonical_path = self.canonical_key(path)?;
        let before = chat.context_files.len();
        chat.context_files
            .retain(|cf| !cf.same_entry(&canonical_path, 0, 0));
        if chat.context_files.len() == before {
            return Err(Bb7Err::FileNotFound(canonical_path));
        }
        chat.record_event(ContextEvent::new(
            ContextAction::UserRemoveFile,
            &canonical_path,
        ));
        Ok(())
    }

    pub fn remove_section(
        &self,
        chat: &mut Chat,
        path: &str,
        start_line: u32,
        end_line: u32,
    ) -> Result<()> {
        let canonical_path = self.canonical_key(path)?;
        let before = chat.context_files.len();
        chat.context_files
            .retain(|cf| !cf.same_entry(&canonical_path, start_line, end_line));
        if chat.context_files.len() == before {
            return Err(Bb7Err::FileNotFound(format!(
                "{canonical_path}:{start_line}-{end_line}"
            )));
        }
        let mut event = ContextEvent::new(ContextAction::UserRemoveSection, &canonical_path);
        event.start_line = Some(start_line);
        event.end_line = Some(end_line);
        chat.record_event(event);
        Ok(())
    }

    /// Replace the stored snapshot of a non-section entry.
    pub fn update(&self, chat: &mut Chat, path: &str, content: Option<&str>) -> Result<()> {
        let canonical = self.canonicalize(path)?;
        let canonical_path = match &canonical {
            CanonicalPath::Internal(rel) => rel.clone(),
            CanonicalPath::External(abs) => abs.clone(),
        };
        let content = self.resolve_content(&canonical, content)?;

        let chat_id = chat.id.clone();
        let Some(cf) = chat
            .context_files
            .iter_mut()
            .find(|cf| cf.same_entry(&canonical_path, 0, 0))
        else {
            return Err(Bb7Err::FileNotFound(canonical_path));
        };

        let prev_version = cf.version.clone();
        cf.version = short_id(&canonical_path, &content);
        let new_version = cf.version.clone();
        let cf_snapshot = cf.clone();
        self.write_snapshot(&chat_id, &cf_snapshot, &content)?;

        let mut event = ContextEvent::new(ContextAction::UserWriteFile, &canonical_path);
        event.prev_version = Some(prev_version);
        event.version = Some(new_version);
        chat.record_event(event);
        Ok(())
    }

    /// Flip the readonly flag. `has_pending_output` blocks the transition
    /// to readonly so a staged proposal cannot silently conflict.
    pub fn set_readonly(
        &self,
        chat: &mut Chat,
        path: &str,
        readonly: bool,
        has_pending_output: bool,
    ) -> Result<()> {
        let canonical_path = self.canonical_key(path)?;
        let Some(cf) = chat
            .context_files
            .iter_mut()
            .find(|cf| cf.same_entry(&canonical_path, 0, 0))
        else {
            return Err(Bb7Err::FileNotFound(canonical_path));
        };
        if cf.external && !readonly {
            return Err(Bb7Err::ExternalReadOnly(canonical_path));
        }
        if readonly && has_pending_output {
            return Err(Bb7Err::ContextModified(canonical_path));
        }
        cf.readonly = readonly;

        let mut event = ContextEvent::new(ContextAction::UserSetReadOnly, &canonical_path);
        event.readonly = Some(readonly);
        chat.record_event(event);
        Ok(())
    }

    /// Snapshot bytes for an entry, as the prompt builder reads them.
    pub fn get(&self, chat: &Chat, cf: &ContextFile) -> Result<String> {
        let path = self.storage_path(&chat.id, cf)?;
        match std::fs::read_to_string(&path) {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Bb7Err::FileNotFound(cf.path.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Canonical key for lookup-style operations that must not touch disk.
    fn canonical_key(&self, path: &str) -> Result<String> {
        match self.canonicalize(path)? {
            CanonicalPath::Internal(rel) => Ok(rel),
            CanonicalPath::External(abs) => Ok(abs),
        }
    }
}

/// Extract 1-indexed inclusive `start..=end` lines, preserving trailing
/// newlines of all but the last line.
fn slice_lines(content: &str, start_line: u32, end_line: u32) -> String {
    let mut out = String::new();
    for (idx, line) in content.lines().enumerate() {
        let lineno = idx as u32 + 1;
        if lineno < start_line {
            continue;
        }
        if lineno > end_line {
            break;
        }
        if lineno > start_line {
            out.push('\n');
        }
        out.push_str(line);
    }
    out
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use bb7_protocol::MessagePart;
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

    fn last_event(chat: &Chat) -> &ContextEvent {
        match chat
            .messages
            .last()
            .and_then(|m| m.parts.last())
        {
            Some(MessagePart::ContextEvent { event }) => event,
            other => panic!("expected trailing context event, got {other:?}"),
        }
    }

    #[test]
    fn add_list_get_round_trip() {
        let mut fx = fixture();
        let engine = ContextEngine::new(&fx.store, Some(&fx.root));
        let cf = engine
            .add(&mut fx.chat, "a.go", Some("A\nB\n"), false)
            .unwrap();
        assert_eq!(cf.version.len(), 8);
        assert_eq!(engine.get(&fx.chat, &cf).unwrap(), "A\nB\n");
        assert_eq!(last_event(&fx.chat).action, ContextAction::UserAddFile);
    }

    #[test]
    fn duplicate_add_fails() {
        let mut fx = fixture();
        let engine = ContextEngine::new(&fx.store, Some(&fx.root));
        engine
            .add(&mut fx.chat, "a.go", Some("A\n"), false)
            .unwrap();
        assert!(matches!(
            engine.add(&mut fx.chat, "a.go", Some("A\n"), false),
            Err(Bb7Err::FileExists(_))
        ));
        // Same path via an absolute spelling is still a duplicate.
        let abs = fx.root.join("a.go");
        assert!(matches!(
            engine.add(&mut fx.chat, &abs.to_string_lossy(), Some("A\n"), false),
            Err(Bb7Err::FileExists(_))
        ));
    }

    #[test]
    fn absolute_outside_project_becomes_external_readonly() {
        let mut fx = fixture();
        let outside = fx._tmp.path().join("elsewhere.txt");
        std::fs::write(&outside, "ext\n").unwrap();

        let engine = ContextEngine::new(&fx.store, Some(&fx.root));
        let cf = engine
            .add(&mut fx.chat, &outside.to_string_lossy(), None, false)
            .unwrap();
        assert!(cf.external);
        assert!(cf.readonly);
        assert_eq!(engine.get(&fx.chat, &cf).unwrap(), "ext\n");

        // Snapshot landed under _external, not at the absolute path.
        let storage = engine.storage_path(&fx.chat.id, &cf).unwrap();
        assert!(storage.starts_with(fx.store.context_dir(&fx.chat.id).join(EXTERNAL_SUBDIR)));

        // And it may never become writable.
        assert!(matches!(
            engine.set_readonly(&mut fx.chat, &cf.path.clone(), false, false),
            Err(Bb7Err::ExternalReadOnly(_))
        ));
    }

    #[test]
    fn sections_are_readonly_sliced_and_deduped() {
        let mut fx = fixture();
        std::fs::write(fx.root.join("big.go"), "l1\nl2\nl3\nl4\n").unwrap();
        let engine = ContextEngine::new(&fx.store, Some(&fx.root));

        let cf = engine
            .add_section(&mut fx.chat, "big.go", 2, 3, None)
            .unwrap();
        assert!(cf.readonly);
        assert_eq!(engine.get(&fx.chat, &cf).unwrap(), "l2\nl3");

        // Overlap is allowed.
        engine
            .add_section(&mut fx.chat, "big.go", 3, 4, None)
            .unwrap();
        // Exact duplicate is not.
        assert!(matches!(
            engine.add_section(&mut fx.chat, "big.go", 2, 3, None),
            Err(Bb7Err::FileExists(_))
        ));
        // Degenerate ranges are rejected.
        assert!(engine.add_section(&mut fx.chat, "big.go", 0, 3, None).is_err());
        assert!(engine.add_section(&mut fx.chat, "big.go", 3, 2, None).is_err());
    }

    #[test]
    fn remove_keeps_snapshot_file() {
        let mut fx = fixture();
        let engine = ContextEngine::new(&fx.store, Some(&fx.root));
        let cf = engine
            .add(&mut fx.chat, "a.go", Some("A\n"), false)
            .unwrap();
        let storage = engine.storage_path(&fx.chat.id, &cf).unwrap();

        engine.remove(&mut fx.chat, "a.go").unwrap();
        assert!(fx.chat.context_files.is_empty());
        assert!(storage.exists(), "historical snapshot must survive removal");
        assert_eq!(last_event(&fx.chat).action, ContextAction::UserRemoveFile);
    }

    #[test]
    fn update_records_prev_version() {
        let mut fx = fixture();
        let engine = ContextEngine::new(&fx.store, Some(&fx.root));
        let cf = engine
            .add(&mut fx.chat, "a.go", Some("A\n"), false)
            .unwrap();
        let v1 = cf.version.clone();

        engine
            .update(&mut fx.chat, "a.go", Some("B\n"))
            .unwrap();
        let event = last_event(&fx.chat);
        assert_eq!(event.action, ContextAction::UserWriteFile);
        assert_eq!(event.prev_version.as_deref(), Some(v1.as_str()));
        assert_ne!(event.version.as_deref(), Some(v1.as_str()));
    }

    #[test]
    fn readonly_flip_blocked_by_pending_output() {
        let mut fx = fixture();
        let engine = ContextEngine::new(&fx.store, Some(&fx.root));
        engine
            .add(&mut fx.chat, "a.go", Some("A\n"), false)
            .unwrap();
        assert!(matches!(
            engine.set_readonly(&mut fx.chat, "a.go", true, true),
            Err(Bb7Err::ContextModified(_))
        ));
        engine
            .set_readonly(&mut fx.chat, "a.go", true, false)
            .unwrap();
        assert!(fx.chat.context_files[0].readonly);
    }
}
