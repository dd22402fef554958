use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use strum_macros::Display;
use strum_macros::EnumString;

/// Version written into every `chat.json`. Version 1 chats stored message
/// bodies as a flat `content` string; they are migrated to `parts` on load
/// and re-saved at the current version.
pub const CHAT_SCHEMA_VERSION: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ReasoningEffort {
    Low,
    Medium,
    High,
}

/// Shape of the editing tool offered to the model. `None` disables file
/// tools entirely (forced for global chats).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DiffMode {
    WriteFile,
    #[default]
    SearchReplace,
    SearchReplaceMulti,
    Anchored,
    None,
}

impl DiffMode {
    /// Modes whose failed edits can be fed back through the hidden repair
    /// retry. Full rewrites either land or terminate the stream, so they
    /// are excluded.
    pub fn supports_repair_retry(self) -> bool {
        matches!(
            self,
            DiffMode::SearchReplace | DiffMode::SearchReplaceMulti | DiffMode::Anchored
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// A file (or line-range section of one) the model is allowed to see.
///
/// Uniquely keyed by `(path, start_line, end_line)`; `version` is the short
/// content hash taken when the snapshot was stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextFile {
    pub path: String,
    #[serde(default)]
    pub readonly: bool,
    #[serde(default)]
    pub external: bool,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub start_line: u32,
    #[serde(default)]
    pub end_line: u32,
}

impl ContextFile {
    pub fn is_section(&self) -> bool {
        self.start_line > 0 && self.end_line > 0
    }

    /// Two entries refer to the same context slot when their canonical path
    /// and line range coincide.
    pub fn same_entry(&self, path: &str, start_line: u32, end_line: u32) -> bool {
        self.path == path && self.start_line == start_line && self.end_line == end_line
    }
}

/// Audit record embedded in the message stream describing a mutation of the
/// file world. Exactly one event is produced per successful mutation.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
pub enum ContextAction {
    UserAddFile,
    UserAddSection,
    UserRemoveFile,
    UserRemoveSection,
    UserWriteFile,
    UserSetReadOnly,
    UserApplyFile,
    UserPartialApplyFile,
    UserSaveAs,
    UserRejectOutput,
    AssistantWriteFile,
    ForkWarningDeleted,
    ForkWarningModified,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextEvent {
    pub action: ContextAction,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readonly: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub added: Option<bool>,
}

impl ContextEvent {
    pub fn new(action: ContextAction, path: impl Into<String>) -> Self {
        Self {
            action,
            path: path.into(),
            start_line: None,
            end_line: None,
            readonly: None,
            external: None,
            version: None,
            prev_version: None,
            original_path: None,
            added: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePart {
    Text {
        content: String,
    },
    /// Model reasoning. Kept in history but re-emitted as `kind=reasoning`.
    Thinking {
        content: String,
    },
    Code {
        content: String,
    },
    Raw {
        content: String,
    },
    ContextEvent {
        #[serde(flatten)]
        event: ContextEvent,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_input_tokens: Option<u64>,
    pub output_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_output_tokens: Option<u64>,
    pub total_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
}

impl TokenUsage {
    /// Fold a follow-up request (e.g. the hidden repair retry) into this
    /// turn's totals.
    pub fn merge(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.total_tokens += other.total_tokens;
        if let Some(c) = other.cached_input_tokens {
            *self.cached_input_tokens.get_or_insert(0) += c;
        }
        if let Some(r) = other.reasoning_output_tokens {
            *self.reasoning_output_tokens.get_or_insert(0) += r;
        }
        if let Some(c) = other.cost {
            *self.cost.get_or_insert(0.0) += c;
        }
    }
}

/// Reference to a context entry as it existed when a user message was sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRef {
    pub path: String,
    pub version: String,
    #[serde(default)]
    pub start_line: u32,
    #[serde(default)]
    pub end_line: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    pub role: Role,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<ReasoningEffort>,
    /// Paths the assistant staged in the output tree during this turn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_files: Option<Vec<String>>,
    /// Context as it existed when this user message was sent; consumed by
    /// fork/edit restoration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_snapshot: Option<Vec<SnapshotRef>>,
    pub parts: Vec<MessagePart>,
}

impl Message {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            timestamp: Utc::now(),
            model: None,
            usage: None,
            reasoning_effort: None,
            output_files: None,
            context_snapshot: None,
            parts: Vec::new(),
        }
    }

    /// Concatenated text parts, in order. This is what fork uses as the new
    /// draft and what search matches against.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for part in &self.parts {
            if let MessagePart::Text { content } = part {
                out.push_str(content);
            }
        }
        out
    }
}

/// Wire/disk shape: accepts both the current `parts` form and the legacy
/// flat `content` form.
#[derive(Deserialize)]
struct MessageDe {
    role: Role,
    #[serde(default = "unix_epoch")]
    timestamp: DateTime<Utc>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    usage: Option<TokenUsage>,
    #[serde(default)]
    reasoning_effort: Option<ReasoningEffort>,
    #[serde(default)]
    output_files: Option<Vec<String>>,
    #[serde(default)]
    context_snapshot: Option<Vec<SnapshotRef>>,
    #[serde(default)]
    parts: Vec<MessagePart>,
    #[serde(default)]
    content: Option<String>,
}

fn unix_epoch() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

impl<'de> Deserialize<'de> for Message {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let de = MessageDe::deserialize(deserializer)?;
        let mut parts = de.parts;
        if parts.is_empty()
            && let Some(content) = de.content
            && !content.is_empty()
        {
            parts.push(MessagePart::Text { content });
        }
        Ok(Message {
            role: de.role,
            timestamp: de.timestamp,
            model: de.model,
            usage: de.usage,
            reasoning_effort: de.reasoning_effort,
            output_files: de.output_files,
            context_snapshot: de.context_snapshot,
            parts,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chat {
    pub id: String,
    pub name: String,
    pub created: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<ReasoningEffort>,
    /// Global chats live outside any project; file operations are disabled.
    #[serde(default)]
    pub global: bool,
    #[serde(default)]
    pub draft: String,
    #[serde(default)]
    pub context_files: Vec<ContextFile>,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default = "legacy_chat_version")]
    pub version: u32,
}

fn legacy_chat_version() -> u32 {
    1
}

impl Chat {
    /// Record an audit event on the active chat. Events attach to the
    /// trailing message; a chat with no messages yet gets a user message
    /// carrying only the event so the audit trail stays inside the
    /// conversation.
    pub fn record_event(&mut self, event: ContextEvent) {
        match self.messages.last_mut() {
            Some(last) => last.parts.push(MessagePart::ContextEvent { event }),
            None => {
                let mut msg = Message::new(Role::User);
                msg.parts.push(MessagePart::ContextEvent { event });
                self.messages.push(msg);
            }
        }
    }

    pub fn find_context_file(&self, path: &str) -> Option<&ContextFile> {
        self.context_files
            .iter()
            .find(|cf| !cf.is_section() && cf.path == path)
    }

    pub fn find_context_file_mut(&mut self, path: &str) -> Option<&mut ContextFile> {
        self.context_files
            .iter_mut()
            .find(|cf| !cf.is_section() && cf.path == path)
    }

    /// Snapshot of the current context list, stored on user messages at
    /// send time.
    pub fn snapshot_refs(&self) -> Vec<SnapshotRef> {
        self.context_files
            .iter()
            .map(|cf| SnapshotRef {
                path: cf.path.clone(),
                version: cf.version.clone(),
                start_line: cf.start_line,
                end_line: cf.end_line,
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatSummary {
    pub id: String,
    pub name: String,
    pub created: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub message_count: usize,
}

impl From<&Chat> for ChatSummary {
    fn from(chat: &Chat) -> Self {
        Self {
            id: chat.id.clone(),
            name: chat.name.clone(),
            created: chat.created,
            model: chat.model.clone(),
            message_count: chat.messages.len(),
        }
    }
}

/// On-disk cache of the chats directory. Purely advisory: when missing or
/// corrupt it is rebuilt from the directory listing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatIndex {
    #[serde(default)]
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_chat_id: Option<String>,
    #[serde(default)]
    pub chats: Vec<ChatSummary>,
}

/// One row of `get_file_statuses`: the union of context entries and pending
/// output paths, with the per-file token estimate the model would actually
/// see.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileStatusEntry {
    pub path: String,
    /// `""` unchanged/applied, `M` modified, `A` added, `!A` conflicting
    /// add, `S` section.
    pub status: String,
    #[serde(default)]
    pub readonly: bool,
    #[serde(default)]
    pub external: bool,
    #[serde(default)]
    pub start_line: u32,
    #[serde(default)]
    pub end_line: u32,
    #[serde(default)]
    pub original_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub tokens: u64,
}
