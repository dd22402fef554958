//! Prompt builder: composes the single structured user message the model
//! receives, plus the per-diff-mode tool definitions and tool prompts.
//!
//! Layout, in order: readonly file blocks, the compact history, the
//! latest user input (with a `Files:` summary), an optional retry-context
//! block, and writable file blocks. Readonly and writable lists are
//! sorted by `(path, id)` so prompts are stable across runs, which keeps
//! provider-side prompt caching effective.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::Path;

use serde_json::json;

use bb7_protocol::Chat;
use bb7_protocol::ContextEvent;
use bb7_protocol::DiffErrorDetail;
use bb7_protocol::DiffMode;
use bb7_protocol::MessagePart;
use bb7_protocol::Role;

use crate::context::ContextEngine;
use crate::error::Result;
use crate::hash::short_id;
use crate::output::OutputEngine;
use crate::store::ChatStore;

/// The `instructions`-independent base system prompt.
pub const BASE_SYSTEM_PROMPT: &str = include_str!("../prompt.md");

const READONLY_HEADER: &str = "-- readonly files --";
const HISTORY_HEADER: &str = "-- history --";
const LATEST_HEADER: &str = "-- latest --";
const WRITABLE_HEADER: &str = "-- writable files --";

/// Errors and tool calls from a failed first attempt, fed back to the
/// model in the hidden repair retry.
#[derive(Debug, Clone, Default)]
pub struct RetryContext {
    pub errors: Vec<DiffErrorDetail>,
    pub tool_calls: Vec<serde_json::Value>,
}

pub struct PromptBuilder<'a> {
    store: &'a ChatStore,
    project_root: Option<&'a Path>,
}

pub struct BuiltPrompt {
    pub body: String,
    /// True when the re-hash side effect changed any `ContextFile`
    /// version; the caller persists the chat before sending.
    pub context_dirty: bool,
}

struct FileBlock {
    path: String,
    id: String,
    mode: &'static str,
    source: &'static str,
    status: Option<&'static str>,
    lines: Option<(u32, u32)>,
    content: String,
}

impl FileBlock {
    fn render(&self, out: &mut String) {
        let _ = write!(
            out,
            "@file id={} path={} mode={} source={}",
            self.id, self.path, self.mode, self.source
        );
        if let Some(status) = self.status {
            let _ = write!(out, " status={status}");
        }
        if let Some((start, end)) = self.lines {
            let _ = write!(out, " lines={start}-{end}");
        }
        out.push('\n');
        out.push_str(&self.content);
        if !self.content.ends_with('\n') {
            out.push('\n');
        }
        let _ = writeln!(out, "@end file id={}", self.id);
    }

    fn summary_line(&self) -> String {
        format!("- {} id={} mode={}", self.path, self.id, self.mode)
    }
}

impl<'a> PromptBuilder<'a> {
    pub fn new(store: &'a ChatStore, project_root: Option<&'a Path>) -> Self {
        Self {
            store,
            project_root,
        }
    }

    /// Build the prompt body. The chat's last message must be the user
    /// message being sent; everything before it is history.
    ///
    /// `output_overrides` replaces the pending-output bytes per path
    /// (used by the repair retry so the model edits its own partial
    /// result instead of the original).
    pub fn build(
        &self,
        chat: &mut Chat,
        diff_mode: DiffMode,
        retry: Option<&RetryContext>,
        output_overrides: Option<&HashMap<String, String>>,
    ) -> Result<BuiltPrompt> {
        let context = ContextEngine::new(self.store, self.project_root);
        let output = OutputEngine::new(self.store, self.project_root);
        let mut context_dirty = false;

        // Re-hash every context snapshot while collecting; a drifted
        // version is corrected in place and reported to the caller.
        let mut contents: Vec<String> = Vec::with_capacity(chat.context_files.len());
        {
            let chat_snapshot = chat.clone();
            for (idx, cf) in chat_snapshot.context_files.iter().enumerate() {
                let content = context.get(&chat_snapshot, cf).unwrap_or_default();
                let key = if cf.is_section() {
                    format!("{}:{}:{}", cf.path, cf.start_line, cf.end_line)
                } else {
                    cf.path.clone()
                };
                let current = short_id(&key, &content);
                if current != cf.version {
                    chat.context_files[idx].version = current;
                    context_dirty = true;
                }
                contents.push(content);
            }
        }

        let pending_paths: Vec<String> = if chat.global {
            Vec::new()
        } else {
            output.list(&chat.id)?
        };
        let pending_content = |path: &str| -> Result<Option<String>> {
            if let Some(overrides) = output_overrides
                && let Some(content) = overrides.get(path)
            {
                return Ok(Some(content.clone()));
            }
            if pending_paths.iter().any(|p| p == path) {
                return Ok(Some(output.read(&chat.id, path)?));
            }
            Ok(None)
        };

        let mut readonly_blocks: Vec<FileBlock> = Vec::new();
        let mut writable_blocks: Vec<FileBlock> = Vec::new();

        for (cf, content) in chat.context_files.iter().zip(contents.iter()) {
            if cf.readonly {
                readonly_blocks.push(FileBlock {
                    path: cf.path.clone(),
                    id: cf.version.clone(),
                    mode: "ro",
                    source: "context",
                    status: None,
                    lines: cf.is_section().then_some((cf.start_line, cf.end_line)),
                    content: content.clone(),
                });
                continue;
            }

            match pending_content(&cf.path)? {
                Some(pending) => {
                    // Both sides are shown: the original for reference and
                    // the pending proposal as the editable base.
                    readonly_blocks.push(FileBlock {
                        path: cf.path.clone(),
                        id: cf.version.clone(),
                        mode: "ro",
                        source: "context",
                        status: Some("original"),
                        lines: None,
                        content: content.clone(),
                    });
                    writable_blocks.push(FileBlock {
                        path: cf.path.clone(),
                        id: short_id(&cf.path, &pending),
                        mode: "rw",
                        source: "output",
                        status: Some("pending_output"),
                        lines: None,
                        content: pending,
                    });
                }
                None => writable_blocks.push(FileBlock {
                    path: cf.path.clone(),
                    id: cf.version.clone(),
                    mode: "rw",
                    source: "context",
                    status: None,
                    lines: None,
                    content: content.clone(),
                }),
            }
        }

        // Output-only paths: proposals for files that were never attached.
        let mut extra_paths: Vec<&String> = pending_paths
            .iter()
            .filter(|p| !chat.context_files.iter().any(|cf| &&cf.path == p))
            .collect();
        if let Some(overrides) = output_overrides {
            for path in overrides.keys() {
                if !pending_paths.contains(path)
                    && !chat.context_files.iter().any(|cf| &cf.path == path)
                {
                    extra_paths.push(path);
                }
            }
        }
        for path in extra_paths {
            let Some(pending) = pending_content(path)? else {
                continue;
            };
            writable_blocks.push(FileBlock {
                path: path.clone(),
                id: short_id(path, &pending),
                mode: "rw",
                source: "output",
                status: Some("added_output"),
                lines: None,
                content: pending,
            });
        }

        readonly_blocks.sort_by(|a, b| a.path.cmp(&b.path).then(a.id.cmp(&b.id)));
        writable_blocks.sort_by(|a, b| a.path.cmp(&b.path).then(a.id.cmp(&b.id)));

        // Assemble.
        let mut body = String::new();
        if !readonly_blocks.is_empty() {
            body.push_str(READONLY_HEADER);
            body.push('\n');
            for block in &readonly_blocks {
                block.render(&mut body);
            }
            body.push('\n');
        }

        let (history, latest) = match chat.messages.split_last() {
            Some((latest, history)) if latest.role == Role::User => (history, Some(latest)),
            _ => (chat.messages.as_slice(), None),
        };

        if !history.is_empty() {
            body.push_str(HISTORY_HEADER);
            body.push('\n');
            for (idx, msg) in history.iter().enumerate() {
                render_history_message(&mut body, idx, msg);
            }
            body.push('\n');
        }

        body.push_str(LATEST_HEADER);
        body.push('\n');
        if !readonly_blocks.is_empty() || !writable_blocks.is_empty() {
            body.push_str("Files:\n");
            for block in readonly_blocks.iter().chain(writable_blocks.iter()) {
                body.push_str(&block.summary_line());
                body.push('\n');
            }
        }
        if let Some(latest) = latest {
            body.push_str(&latest.text());
            if !body.ends_with('\n') {
                body.push('\n');
            }
        }
        body.push('\n');

        if let Some(retry) = retry {
            render_retry_context(&mut body, retry, diff_mode);
            body.push('\n');
        }

        if !writable_blocks.is_empty() {
            body.push_str(WRITABLE_HEADER);
            body.push('\n');
            for block in &writable_blocks {
                block.render(&mut body);
            }
        }

        Ok(BuiltPrompt {
            body,
            context_dirty,
        })
    }
}

fn render_history_message(out: &mut String, idx: usize, msg: &bb7_protocol::Message) {
    for part in &msg.parts {
        match part {
            MessagePart::Text { content } => {
                render_msg_block(out, idx, msg.role, "text", content);
            }
            MessagePart::Thinking { content } => {
                render_msg_block(out, idx, msg.role, "reasoning", content);
            }
            MessagePart::Code { content } => {
                render_msg_block(out, idx, msg.role, "code", content);
            }
            MessagePart::Raw { content } => {
                render_msg_block(out, idx, msg.role, "raw", content);
            }
            MessagePart::ContextEvent { event } => {
                render_action_line(out, idx, event);
            }
        }
    }
}

fn render_msg_block(out: &mut String, idx: usize, role: Role, kind: &str, content: &str) {
    let _ = writeln!(out, "@msg id={idx} role={role} kind={kind}");
    out.push_str(content);
    if !content.ends_with('\n') {
        out.push('\n');
    }
    let _ = writeln!(out, "@end msg id={idx}");
}

fn render_action_line(out: &mut String, idx: usize, event: &ContextEvent) {
    let _ = write!(out, "@action id={idx} action={} path={}", event.action, event.path);
    if let (Some(start), Some(end)) = (event.start_line, event.end_line) {
        let _ = write!(out, " lines={start}-{end}");
    }
    if let Some(readonly) = event.readonly {
        let _ = write!(out, " readonly={readonly}");
    }
    if event.external == Some(true) {
        let _ = write!(out, " external=true");
    }
    if let Some(prev) = &event.prev_version {
        let _ = write!(out, " prev_version={prev}");
    }
    if let Some(version) = &event.version {
        let _ = write!(out, " version={version}");
    }
    if let Some(original) = &event.original_path {
        let _ = write!(out, " original_path={original}");
    }
    if event.added == Some(true) {
        let _ = write!(out, " added=true");
    }
    out.push('\n');
}

fn render_retry_context(out: &mut String, retry: &RetryContext, diff_mode: DiffMode) {
    out.push_str("@retry_context\n");
    out.push_str(
        "Your previous response contained file edits that failed to apply. \
         The writable file blocks below already include the edits that did \
         apply; fix only what failed.\n",
    );
    out.push_str("Errors:\n");
    for e in &retry.errors {
        let _ = writeln!(out, "- {}: {}", e.path, e.message);
    }
    if !retry.tool_calls.is_empty() {
        out.push_str("Previous tool calls:\n");
        for call in &retry.tool_calls {
            let _ = writeln!(
                out,
                "{}",
                serde_json::to_string(call).unwrap_or_default()
            );
        }
    }
    match diff_mode {
        DiffMode::SearchReplace | DiffMode::SearchReplaceMulti => {
            out.push_str(
                "Copy old_string exactly from the current writable block, \
                 including whitespace, and add surrounding lines when the \
                 match was ambiguous.\n",
            );
        }
        DiffMode::Anchored => {
            out.push_str(
                "Re-read the line numbers from the current writable block; \
                 ranges are 1-indexed, inclusive, and must not overlap.\n",
            );
        }
        DiffMode::WriteFile | DiffMode::None => {}
    }
    out.push_str("@end retry_context\n");
}

/// The tool-usage addendum appended to the system prompt per diff mode.
pub fn tool_prompt(diff_mode: DiffMode) -> &'static str {
    match diff_mode {
        DiffMode::WriteFile => {
            "To change a file, call write_file with the complete new file \
             contents. Each path may be written at most once per reply."
        }
        DiffMode::SearchReplace => {
            "To change a file, call edit_file with an exact old_string from \
             the writable block and its replacement. old_string must match \
             exactly one location unless replace_all is set. Pass the \
             block's id as file_id."
        }
        DiffMode::SearchReplaceMulti => {
            "To change files, call edit_file with a list of edits. Each \
             edit replaces an exact old_string; later edits on the same \
             path see the result of earlier ones. Pass the block's id as \
             file_id on every edit."
        }
        DiffMode::Anchored => {
            "To change a file, call edit_file with line-range changes. \
             start and end are 1-indexed inclusive line numbers over the \
             writable block; ranges must not overlap. Pass the block's id \
             as file_id."
        }
        DiffMode::None => "",
    }
}

/// OpenAI-compatible tool definitions for the selected diff mode.
pub fn tool_definitions(diff_mode: DiffMode) -> Vec<serde_json::Value> {
    let write_file = json!({
        "type": "function",
        "function": {
            "name": "write_file",
            "description": "Create or fully replace one project file.",
            "parameters": {
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "content": {"type": "string"}
                },
                "required": ["path", "content"],
                "additionalProperties": false
            }
        }
    });
    match diff_mode {
        DiffMode::None => vec![],
        DiffMode::WriteFile => vec![write_file],
        DiffMode::SearchReplace => vec![
            write_file,
            json!({
                "type": "function",
                "function": {
                    "name": "edit_file",
                    "description": "Replace an exact string in one file.",
                    "parameters": {
                        "type": "object",
                        "properties": {
                            "path": {"type": "string"},
                            "old_string": {"type": "string"},
                            "new_string": {"type": "string"},
                            "replace_all": {"type": "boolean"},
                            "file_id": {"type": "string"}
                        },
                        "required": ["path", "old_string", "new_string", "file_id"],
                        "additionalProperties": false
                    }
                }
            }),
        ],
        DiffMode::SearchReplaceMulti => vec![
            write_file,
            json!({
                "type": "function",
                "function": {
                    "name": "edit_file",
                    "description": "Apply a list of exact string replacements.",
                    "parameters": {
                        "type": "object",
                        "properties": {
                            "edits": {
                                "type": "array",
                                "items": {
                                    "type": "object",
                                    "properties": {
                                        "path": {"type": "string"},
                                        "old_string": {"type": "string"},
                                        "new_string": {"type": "string"},
                                        "replace_all": {"type": "boolean"},
                                        "file_id": {"type": "string"}
                                    },
                                    "required": ["path", "old_string", "new_string", "file_id"],
                                    "additionalProperties": false
                                }
                            }
                        },
                        "required": ["edits"],
                        "additionalProperties": false
                    }
                }
            }),
        ],
        DiffMode::Anchored => vec![
            write_file,
            json!({
                "type": "function",
                "function": {
                    "name": "edit_file",
                    "description": "Replace 1-indexed inclusive line ranges in one file.",
                    "parameters": {
                        "type": "object",
                        "properties": {
                            "path": {"type": "string"},
                            "changes": {
                                "type": "array",
                                "items": {
                                    "type": "object",
                                    "properties": {
                                        "start": {"type": "integer"},
                                        "end": {"type": "integer"},
                                        "content": {"type": "string"}
                                    },
                                    "required": ["start", "end", "content"],
                                    "additionalProperties": false
                                }
                            },
                            "file_id": {"type": "string"}
                        },
                        "required": ["path", "changes", "file_id"],
                        "additionalProperties": false
                    }
                }
            }),
        ],
    }
}
