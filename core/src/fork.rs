//! Fork / edit engine.
//!
//! Forking copies a chat at a user-message cut point; editing rewinds the
//! active chat in place. Both restore the context list from the cut
//! message's snapshot, warning (but continuing) when a snapshot has been
//! deleted or drifted from the recorded version. Warnings are appended as
//! a synthesized system message whose parts are context events, keeping
//! the audit trail inside the conversation.

use std::collections::HashSet;
use std::path::Path;

use tracing::warn;

use bb7_protocol::Chat;
use bb7_protocol::ContextAction;
use bb7_protocol::ContextEvent;
use bb7_protocol::ContextFile;
use bb7_protocol::ForkWarning;
use bb7_protocol::ForkWarningKind;
use bb7_protocol::Message;
use bb7_protocol::MessagePart;
use bb7_protocol::Role;
use bb7_protocol::SnapshotRef;

use crate::context::ContextEngine;
use crate::error::Bb7Err;
use crate::error::Result;
use crate::hash::short_id;
use crate::output::OutputEngine;
use crate::store::ChatStore;

pub struct ForkEngine<'a> {
    store: &'a ChatStore,
    project_root: Option<&'a Path>,
}

pub struct ForkOutcome {
    pub chat: Chat,
    pub warnings: Vec<ForkWarning>,
}

impl<'a> ForkEngine<'a> {
    pub fn new(store: &'a ChatStore, project_root: Option<&'a Path>) -> Self {
        Self {
            store,
            project_root,
        }
    }

    /// Copy `source` into a new chat truncated at `fork_index` (which must
    /// address a user message), restoring that message's context snapshot.
    /// The caller locks and activates the returned chat.
    pub fn fork(&self, source: &Chat, fork_index: usize) -> Result<ForkOutcome> {
        let fork_msg = self.cut_message(source, fork_index)?;

        // Idempotent on repeated forks: forking a fork keeps one prefix.
        let name = if source.name.starts_with("Fork of ") {
            source.name.clone()
        } else {
            format!("Fork of {}", source.name)
        };

        let mut chat = self.store.create(&name)?;
        chat.model = source.model.clone();
        chat.reasoning_effort = source.reasoning_effort;
        chat.messages = source.messages[..fork_index].to_vec();
        chat.draft = fork_msg.text();

        let refs = self.snapshot_refs_for(source, fork_msg);
        let (context_files, warnings) =
            self.restore_context(&source.id, &chat.id, &refs)?;
        chat.context_files = context_files;
        append_warning_message(&mut chat, &warnings);

        self.store.save(&chat)?;
        Ok(ForkOutcome { chat, warnings })
    }

    /// Rewind the active chat to `msg_index` in place: restore that user
    /// message's context snapshot, truncate the tail, install the new
    /// draft, and drop output files no longer referenced by any surviving
    /// assistant message.
    pub fn edit_user_message(
        &self,
        chat: &mut Chat,
        msg_index: usize,
        new_draft: Option<&str>,
    ) -> Result<Vec<ForkWarning>> {
        let cut = self.cut_message(chat, msg_index)?;
        let draft = match new_draft {
            Some(draft) => draft.to_string(),
            None => cut.text(),
        };
        let refs = self.snapshot_refs_for(chat, cut);

        let (context_files, warnings) = self.restore_context(&chat.id, &chat.id, &refs)?;
        chat.context_files = context_files;
        chat.messages.truncate(msg_index);
        chat.draft = draft;
        append_warning_message(chat, &warnings);

        self.gc_unreferenced_output(chat)?;
        Ok(warnings)
    }

    fn cut_message<'c>(&self, chat: &'c Chat, index: usize) -> Result<&'c Message> {
        let msg = chat.messages.get(index).ok_or_else(|| {
            Bb7Err::InvalidRequest(format!(
                "message index {index} out of range (chat has {} messages)",
                chat.messages.len()
            ))
        })?;
        if msg.role != Role::User {
            return Err(Bb7Err::InvalidRequest(format!(
                "message {index} is not a user message"
            )));
        }
        Ok(msg)
    }

    /// The cut message's snapshot; chats predating snapshots fall back to
    /// the source's current context list.
    fn snapshot_refs_for(&self, chat: &Chat, msg: &Message) -> Vec<SnapshotRef> {
        match &msg.context_snapshot {
            Some(refs) => refs.clone(),
            None => chat.snapshot_refs(),
        }
    }

    fn restore_context(
        &self,
        source_chat_id: &str,
        target_chat_id: &str,
        refs: &[SnapshotRef],
    ) -> Result<(Vec<ContextFile>, Vec<ForkWarning>)> {
        let engine = ContextEngine::new(self.store, self.project_root);
        let mut files = Vec::new();
        let mut warnings = Vec::new();

        for r in refs {
            // Flags are re-derived from the ref: snapshots predate the
            // point where readonly may have been toggled, and external is
            // a property of the path itself.
            let external = Path::new(&r.path).is_absolute()
                && self
                    .project_root
                    .map(|root| !Path::new(&r.path).starts_with(root))
                    .unwrap_or(true);
            let is_section = r.start_line > 0 && r.end_line > 0;
            let mut cf = ContextFile {
                path: r.path.clone(),
                readonly: external || is_section,
                external,
                version: r.version.clone(),
                start_line: r.start_line,
                end_line: r.end_line,
            };

            // A tampered snapshot ref whose path escapes the context tree
            // is never read.
            let source_path = match engine.storage_path(source_chat_id, &cf) {
                Ok(path) => path,
                Err(e) => {
                    warn!("refusing snapshot {} during restore: {e}", r.path);
                    warnings.push(ForkWarning {
                        kind: ForkWarningKind::Deleted,
                        path: r.path.clone(),
                    });
                    continue;
                }
            };

            let content = match std::fs::read_to_string(&source_path) {
                Ok(content) => content,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    warnings.push(ForkWarning {
                        kind: ForkWarningKind::Deleted,
                        path: r.path.clone(),
                    });
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            // Skip files that vanished from the working tree entirely.
            if !self.still_on_disk(&cf) {
                warnings.push(ForkWarning {
                    kind: ForkWarningKind::Deleted,
                    path: r.path.clone(),
                });
                continue;
            }

            if source_chat_id != target_chat_id {
                let target_path = engine.storage_path(target_chat_id, &cf)?;
                if let Some(parent) = target_path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&target_path, &content)?;
            }

            let key = if is_section {
                format!("{}:{}:{}", cf.path, cf.start_line, cf.end_line)
            } else {
                cf.path.clone()
            };
            let current = short_id(&key, &content);
            if current != r.version {
                warnings.push(ForkWarning {
                    kind: ForkWarningKind::Modified,
                    path: r.path.clone(),
                });
            }
            cf.version = current;
            files.push(cf);
        }

        Ok((files, warnings))
    }

    fn still_on_disk(&self, cf: &ContextFile) -> bool {
        let p = Path::new(&cf.path);
        if p.is_absolute() {
            return p.exists();
        }
        match self.project_root {
            Some(root) => root.join(p).exists(),
            // Global chats have no working tree to compare against.
            None => true,
        }
    }

    fn gc_unreferenced_output(&self, chat: &Chat) -> Result<()> {
        let output = OutputEngine::new(self.store, self.project_root);
        let referenced: HashSet<&str> = chat
            .messages
            .iter()
            .filter(|m| m.role == Role::Assistant)
            .flat_map(|m| m.output_files.iter().flatten())
            .map(String::as_str)
            .collect();
        for path in output.list(&chat.id)? {
            if !referenced.contains(path.as_str())
                && let Err(e) = output.delete(&chat.id, &path)
            {
                warn!("failed to gc output {path}: {e}");
            }
        }
        Ok(())
    }
}

fn append_warning_message(chat: &mut Chat, warnings: &[ForkWarning]) {
    if warnings.is_empty() {
        return;
    }
    let mut msg = Message::new(Role::System);
    for w in warnings {
        let action = match w.kind {
            ForkWarningKind::Deleted => ContextAction::ForkWarningDeleted,
            ForkWarningKind::Modified => ContextAction::ForkWarningModified,
        };
        msg.parts.push(MessagePart::ContextEvent {
            event: ContextEvent::new(action, &w.path),
        });
    }
    chat.messages.push(msg);
}
