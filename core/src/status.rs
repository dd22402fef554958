//! Status engine: per-file status over the union of context entries and
//! pending output, plus the transitions that resolve pending proposals
//! (apply, save-as, and the local-diff reconciliation protocol).

use std::path::Path;

use tracing::debug;

use bb7_protocol::Chat;
use bb7_protocol::ContextAction;
use bb7_protocol::ContextEvent;
use bb7_protocol::ContextFile;
use bb7_protocol::DiffPaths;
use bb7_protocol::FileStatusEntry;

use crate::context::ContextEngine;
use crate::error::Bb7Err;
use crate::error::Result;
use crate::hash::short_id;
use crate::output::OutputEngine;
use crate::store::ChatStore;
use crate::util::estimate_tokens;
use crate::util::normalize_line_endings;

/// Result of `diff_local_done`: what the user's interactive diff session
/// actually did to the working copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffLocalOutcome {
    /// Working copy still matches context; nothing happened.
    None,
    /// Working copy matches the proposal; the file was fully applied.
    Full,
    /// Working copy is somewhere in between; context follows it and the
    /// proposal stays pending for the remaining hunks.
    Partial,
}

pub struct StatusEngine<'a> {
    store: &'a ChatStore,
    project_root: Option<&'a Path>,
}

impl<'a> StatusEngine<'a> {
    pub fn new(store: &'a ChatStore, project_root: Option<&'a Path>) -> Self {
        Self {
            store,
            project_root,
        }
    }

    fn context(&self) -> ContextEngine<'a> {
        ContextEngine::new(self.store, self.project_root)
    }

    fn output(&self) -> OutputEngine<'a> {
        OutputEngine::new(self.store, self.project_root)
    }

    /// Union of (A) every context entry and (B) every output path not
    /// otherwise in context, with per-file token estimates of what the
    /// model will actually see.
    pub fn file_statuses(&self, chat: &Chat) -> Result<Vec<FileStatusEntry>> {
        let context = self.context();
        let output = self.output();
        let output_paths = output.list(&chat.id)?;
        let mut entries = Vec::new();

        for cf in &chat.context_files {
            let original = context.get(chat, cf).unwrap_or_default();
            let original_tokens = estimate_tokens(&original);

            if cf.is_section() {
                entries.push(status_entry(cf, "S", original_tokens, 0, original_tokens));
                continue;
            }

            let pending = if output_paths.iter().any(|p| p == &cf.path) {
                Some(output.read(&chat.id, &cf.path)?)
            } else {
                None
            };
            match pending {
                None => {
                    entries.push(status_entry(cf, "", original_tokens, 0, original_tokens));
                }
                Some(out_content) => {
                    let out_tokens = estimate_tokens(&out_content);
                    if normalize_line_endings(&original) == normalize_line_endings(&out_content) {
                        // Applied: the proposal no longer differs.
                        entries.push(status_entry(
                            cf,
                            "",
                            original_tokens,
                            out_tokens,
                            original_tokens,
                        ));
                    } else {
                        entries.push(status_entry(
                            cf,
                            "M",
                            original_tokens,
                            out_tokens,
                            original_tokens + out_tokens,
                        ));
                    }
                }
            }
        }

        for path in &output_paths {
            if chat
                .context_files
                .iter()
                .any(|cf| !cf.is_section() && &cf.path == path)
            {
                continue;
            }
            let out_content = output.read(&chat.id, path)?;
            let out_tokens = estimate_tokens(&out_content);
            let conflicts = output
                .resolve_local_path(path)
                .map(|p| p.exists())
                .unwrap_or(false);
            let status = if conflicts { "!A" } else { "A" };
            entries.push(FileStatusEntry {
                path: path.clone(),
                status: status.to_string(),
                readonly: false,
                external: false,
                start_line: 0,
                end_line: 0,
                original_tokens: 0,
                output_tokens: out_tokens,
                tokens: out_tokens,
            });
        }

        entries.sort_by(|a, b| a.path.cmp(&b.path).then(a.start_line.cmp(&b.start_line)));
        Ok(entries)
    }

    /// Promote a pending proposal into the context snapshot (adding the
    /// file to context when it was output-only), then drop the proposal.
    pub fn apply_file(&self, chat: &mut Chat, path: &str) -> Result<()> {
        let output = self.output();
        let rel = output.normalize(path)?;
        let content = output.read(&chat.id, &rel)?;
        let new_version = short_id(&rel, &content);

        let mut event = ContextEvent::new(ContextAction::UserApplyFile, &rel);
        event.version = Some(new_version.clone());

        match chat.find_context_file_mut(&rel) {
            Some(cf) => {
                event.prev_version = Some(cf.version.clone());
                cf.version = new_version;
                let cf = cf.clone();
                self.write_context_snapshot(chat, &cf, &content)?;
            }
            None => {
                let cf = ContextFile {
                    path: rel.clone(),
                    readonly: false,
                    external: false,
                    version: new_version,
                    start_line: 0,
                    end_line: 0,
                };
                self.write_context_snapshot(chat, &cf, &content)?;
                chat.context_files.push(cf);
                event.added = Some(true);
            }
        }
        chat.record_event(event);

        if let Err(e) = output.delete(&chat.id, &rel) {
            debug!("failed to drop applied output {rel}: {e}");
        }
        Ok(())
    }

    /// Save the proposal at `original` into context under `destination`.
    pub fn apply_file_as(&self, chat: &mut Chat, original: &str, destination: &str) -> Result<()> {
        let output = self.output();
        let src = output.normalize(original)?;
        let dst = output.normalize(destination)?;
        let content = output.read(&chat.id, &src)?;

        if chat.find_context_file(&dst).is_some() {
            return Err(Bb7Err::FileExists(dst));
        }

        let cf = ContextFile {
            path: dst.clone(),
            readonly: false,
            external: false,
            version: short_id(&dst, &content),
            start_line: 0,
            end_line: 0,
        };
        self.write_context_snapshot(chat, &cf, &content)?;

        let mut event = ContextEvent::new(ContextAction::UserSaveAs, &dst);
        event.version = Some(cf.version.clone());
        event.original_path = Some(src.clone());
        event.added = Some(true);
        chat.context_files.push(cf);
        chat.record_event(event);

        if let Err(e) = output.delete(&chat.id, &src) {
            debug!("failed to drop saved-as output {src}: {e}");
        }
        Ok(())
    }

    /// Reconcile after the user finishes interactive diff-and-edit against
    /// the working copy.
    pub fn diff_local_done(&self, chat: &mut Chat, path: &str) -> Result<DiffLocalOutcome> {
        let output = self.output();
        let rel = output.normalize(path)?;
        let out_content = normalize_line_endings(&output.read(&chat.id, &rel)?);
        let local = normalize_line_endings(&self.read_local(&rel)?);

        let context = self.context();
        let context_content = chat
            .find_context_file(&rel)
            .cloned()
            .and_then(|cf| context.get(chat, &cf).ok())
            .map(|c| normalize_line_endings(&c));

        if context_content.as_deref() == Some(local.as_str()) {
            return Ok(DiffLocalOutcome::None);
        }

        if local == out_content {
            self.apply_file(chat, &rel)?;
            // Re-sync in case an on-save formatter touched the file while
            // the diff view had it open.
            self.sync_context_to_local(chat, &rel)?;
            return Ok(DiffLocalOutcome::Full);
        }

        // Partial: context follows the working copy; the proposal stays
        // pending so the remaining hunks are still reviewable.
        let new_version = short_id(&rel, &local);
        let mut event = ContextEvent::new(ContextAction::UserPartialApplyFile, &rel);
        event.version = Some(new_version.clone());
        match chat.find_context_file_mut(&rel) {
            Some(cf) => {
                event.prev_version = Some(cf.version.clone());
                cf.version = new_version;
                let cf = cf.clone();
                self.write_context_snapshot(chat, &cf, &local)?;
            }
            None => {
                let cf = ContextFile {
                    path: rel.clone(),
                    readonly: false,
                    external: false,
                    version: new_version,
                    start_line: 0,
                    end_line: 0,
                };
                self.write_context_snapshot(chat, &cf, &local)?;
                chat.context_files.push(cf);
                event.added = Some(true);
            }
        }
        chat.record_event(event);
        Ok(DiffLocalOutcome::Partial)
    }

    /// Replace the context snapshot with the on-disk working-tree content
    /// when they differ after normalization. No audit event: this tracks
    /// out-of-band edits (formatters, manual saves), not user intent.
    pub fn sync_context_to_local(&self, chat: &mut Chat, path: &str) -> Result<()> {
        let rel = self.output().normalize(path)?;
        let Some(cf) = chat.find_context_file(&rel).cloned() else {
            return Err(Bb7Err::FileNotFound(rel));
        };
        let local = self.read_local(&rel)?;
        let context = self.context();
        let current = context.get(chat, &cf).unwrap_or_default();
        if normalize_line_endings(&current) == normalize_line_endings(&local) {
            return Ok(());
        }
        let new_version = short_id(&rel, &local);
        if let Some(cf) = chat.find_context_file_mut(&rel) {
            cf.version = new_version;
            let cf = cf.clone();
            self.write_context_snapshot(chat, &cf, &local)?;
        }
        Ok(())
    }

    /// Absolute `{context, output, local}` paths the editor feeds to its
    /// differ; each side present only when the file exists there.
    pub fn diff_paths(&self, chat: &Chat, path: &str) -> Result<DiffPaths> {
        let output = self.output();
        let rel = output.normalize(path)?;
        let context = self.context();

        let context_path = chat
            .find_context_file(&rel)
            .and_then(|cf| context.storage_path(&chat.id, cf).ok())
            .filter(|p| p.exists())
            .map(|p| p.display().to_string());
        let output_path = output
            .resolve_fs_path(&chat.id, &rel)
            .ok()
            .filter(|p| p.exists())
            .map(|p| p.display().to_string());
        let local_path = output
            .resolve_local_path(&rel)
            .ok()
            .filter(|p| p.exists())
            .map(|p| p.display().to_string());

        Ok(DiffPaths {
            context: context_path,
            output: output_path,
            local: local_path,
        })
    }

    fn read_local(&self, rel: &str) -> Result<String> {
        let path = self.output().resolve_local_path(rel)?;
        match std::fs::read_to_string(&path) {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_context_snapshot(&self, chat: &Chat, cf: &ContextFile, content: &str) -> Result<()> {
        let path = self.context().storage_path(&chat.id, cf)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }
}

fn status_entry(
    cf: &ContextFile,
    status: &str,
    original_tokens: u64,
    output_tokens: u64,
    tokens: u64,
) -> FileStatusEntry {
    FileStatusEntry {
        path: cf.path.clone(),
        status: status.to_string(),
        readonly: cf.readonly,
        external: cf.external,
        start_line: cf.start_line,
        end_line: cf.end_line,
        original_tokens,
        output_tokens,
        tokens,
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use bb7_protocol::MessagePart;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;

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

    fn add_context(fx: &mut Fixture, path: &str, content: &str) {
        let engine = ContextEngine::new(&fx.store, Some(&fx.root));
        engine.add(&mut fx.chat, path, Some(content), false).unwrap();
    }

    fn write_output(fx: &Fixture, path: &str, content: &str) {
        let engine = OutputEngine::new(&fx.store, Some(&fx.root));
        engine.write(&fx.chat, path, content).unwrap();
    }

    fn last_action(chat: &Chat) -> ContextAction {
        match chat.messages.last().and_then(|m| m.parts.last()) {
            Some(MessagePart::ContextEvent { event }) => event.action,
            other => panic!("expected context event, got {other:?}"),
        }
    }

    #[test]
    fn statuses_cover_the_full_matrix() {
        let mut fx = fixture();
        add_context(&mut fx, "clean.go", "A\n");
        add_context(&mut fx, "dirty.go", "A\n");
        write_output(&fx, "dirty.go", "B\n");
        // Same content modulo line endings counts as applied.
        add_context(&mut fx, "applied.go", "A\nB\n");
        write_output(&fx, "applied.go", "A\r\nB\r\n");
        write_output(&fx, "new.go", "N\n");
        std::fs::write(fx.root.join("conflict.go"), "local\n").unwrap();
        write_output(&fx, "conflict.go", "C\n");
        let engine = ContextEngine::new(&fx.store, Some(&fx.root));
        std::fs::write(fx.root.join("sect.go"), "1\n2\n3\n").unwrap();
        engine
            .add_section(&mut fx.chat, "sect.go", 1, 2, None)
            .unwrap();

        let statuses = StatusEngine::new(&fx.store, Some(&fx.root))
            .file_statuses(&fx.chat)
            .unwrap();
        let by_path: std::collections::HashMap<&str, &FileStatusEntry> = statuses
            .iter()
            .map(|e| (e.path.as_str(), e))
            .collect();

        assert_eq!(by_path["clean.go"].status, "");
        assert_eq!(by_path["dirty.go"].status, "M");
        assert_eq!(
            by_path["dirty.go"].tokens,
            by_path["dirty.go"].original_tokens + by_path["dirty.go"].output_tokens
        );
        assert_eq!(by_path["applied.go"].status, "");
        assert_eq!(by_path["new.go"].status, "A");
        assert_eq!(by_path["conflict.go"].status, "!A");
        assert_eq!(by_path["sect.go"].status, "S");
    }

    #[test]
    fn apply_file_moves_output_into_context() {
        let mut fx = fixture();
        add_context(&mut fx, "a.go", "A\nB\n");
        let v1 = fx.chat.context_files[0].version.clone();
        write_output(&fx, "a.go", "X\nB\n");

        let engine = StatusEngine::new(&fx.store, Some(&fx.root));
        engine.apply_file(&mut fx.chat, "a.go").unwrap();

        assert_eq!(last_action(&fx.chat), ContextAction::UserApplyFile);
        let cf = fx.chat.find_context_file("a.go").unwrap().clone();
        assert_ne!(cf.version, v1);
        let context = ContextEngine::new(&fx.store, Some(&fx.root));
        assert_eq!(context.get(&fx.chat, &cf).unwrap(), "X\nB\n");
        assert!(!OutputEngine::new(&fx.store, Some(&fx.root)).exists(&fx.chat.id, "a.go"));

        // And the status collapses back to unchanged.
        let statuses = engine.file_statuses(&fx.chat).unwrap();
        assert_eq!(statuses[0].status, "");
    }

    #[test]
    fn apply_file_adds_missing_context_entry() {
        let mut fx = fixture();
        write_output(&fx, "new.go", "N\n");
        let engine = StatusEngine::new(&fx.store, Some(&fx.root));
        engine.apply_file(&mut fx.chat, "new.go").unwrap();

        let cf = fx.chat.find_context_file("new.go").unwrap();
        assert!(!cf.readonly);
        assert!(!cf.external);
        match fx.chat.messages.last().and_then(|m| m.parts.last()) {
            Some(MessagePart::ContextEvent { event }) => {
                assert_eq!(event.action, ContextAction::UserApplyFile);
                assert_eq!(event.added, Some(true));
            }
            other => panic!("expected context event, got {other:?}"),
        }
    }

    #[test]
    fn apply_file_as_records_original_path() {
        let mut fx = fixture();
        write_output(&fx, "gen.go", "G\n");
        let engine = StatusEngine::new(&fx.store, Some(&fx.root));
        engine
            .apply_file_as(&mut fx.chat, "gen.go", "renamed.go")
            .unwrap();

        assert!(fx.chat.find_context_file("renamed.go").is_some());
        match fx.chat.messages.last().and_then(|m| m.parts.last()) {
            Some(MessagePart::ContextEvent { event }) => {
                assert_eq!(event.action, ContextAction::UserSaveAs);
                assert_eq!(event.original_path.as_deref(), Some("gen.go"));
                assert_eq!(event.path, "renamed.go");
            }
            other => panic!("expected context event, got {other:?}"),
        }
        assert!(!OutputEngine::new(&fx.store, Some(&fx.root)).exists(&fx.chat.id, "gen.go"));
    }

    #[test]
    fn diff_local_done_outcomes() {
        let mut fx = fixture();

        // none: working copy still equals context.
        add_context(&mut fx, "a.go", "A\n");
        std::fs::write(fx.root.join("a.go"), "A\n").unwrap();
        write_output(&fx, "a.go", "X\n");
        assert_eq!(
            StatusEngine::new(&fx.store, Some(&fx.root))
                .diff_local_done(&mut fx.chat, "a.go")
                .unwrap(),
            DiffLocalOutcome::None
        );

        // full: working copy took the proposal.
        std::fs::write(fx.root.join("a.go"), "X\n").unwrap();
        assert_eq!(
            StatusEngine::new(&fx.store, Some(&fx.root))
                .diff_local_done(&mut fx.chat, "a.go")
                .unwrap(),
            DiffLocalOutcome::Full
        );
        assert!(!OutputEngine::new(&fx.store, Some(&fx.root)).exists(&fx.chat.id, "a.go"));

        // partial: working copy kept some hunks only.
        write_output(&fx, "a.go", "X\nY\nZ\n");
        std::fs::write(fx.root.join("a.go"), "X\nY\n").unwrap();
        assert_eq!(
            StatusEngine::new(&fx.store, Some(&fx.root))
                .diff_local_done(&mut fx.chat, "a.go")
                .unwrap(),
            DiffLocalOutcome::Partial
        );
        assert_eq!(last_action(&fx.chat), ContextAction::UserPartialApplyFile);
        // The proposal stays pending for the remaining hunks.
        assert!(OutputEngine::new(&fx.store, Some(&fx.root)).exists(&fx.chat.id, "a.go"));
        let cf = fx.chat.find_context_file("a.go").unwrap().clone();
        let context = ContextEngine::new(&fx.store, Some(&fx.root));
        assert_eq!(context.get(&fx.chat, &cf).unwrap(), "X\nY\n");
    }

    #[test]
    fn sync_context_follows_local_edits() {
        let mut fx = fixture();
        add_context(&mut fx, "a.go", "A\n");
        std::fs::write(fx.root.join("a.go"), "edited\n").unwrap();

        let engine = StatusEngine::new(&fx.store, Some(&fx.root));
        engine.sync_context_to_local(&mut fx.chat, "a.go").unwrap();

        let cf = fx.chat.find_context_file("a.go").unwrap().clone();
        let context = ContextEngine::new(&fx.store, Some(&fx.root));
        assert_eq!(context.get(&fx.chat, &cf).unwrap(), "edited\n");
    }
}
