use serde::Deserialize;
use serde::Serialize;
use serde::de::Deserializer;
use serde::ser::Serializer;

use crate::model::Chat;
use crate::model::ChatSummary;
use crate::model::ContextFile;
use crate::model::FileStatusEntry;
use crate::model::ReasoningEffort;
use crate::model::TokenUsage;

/// Correlation id supplied by the frontend. Accepts a JSON string or
/// number; always serialized back as the decimal string form so the
/// frontend can key replies uniformly.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestId(pub String);

impl Serialize for RequestId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for RequestId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = serde_json::Value::deserialize(deserializer)?;
        match value {
            serde_json::Value::String(s) => Ok(RequestId(s)),
            serde_json::Value::Number(n) => Ok(RequestId(n.to_string())),
            other => Err(serde::de::Error::custom(format!(
                "request_id must be a string or number, got {other}"
            ))),
        }
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One stdin line: `action` selects the operation, `request_id` correlates
/// the response(s).
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub request_id: Option<RequestId>,
    #[serde(flatten)]
    pub op: RequestOp,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RequestOp {
    // Read-only / init-ish.
    Ping,
    Version,
    Bb7Init {
        path: String,
    },
    Init {
        path: String,
    },
    ChatList,
    ChatActive,
    ChatGet {
        #[serde(default)]
        chat_id: Option<String>,
    },
    ContextList,
    GetContextFile {
        path: String,
        #[serde(default)]
        start_line: u32,
        #[serde(default)]
        end_line: u32,
    },
    GetOutputFile {
        path: String,
    },
    GetFileStatuses,
    GetDiffPaths {
        path: String,
    },
    GetBalance,
    GetModels,
    EstimateTokens,
    EstimateTextTokens {
        text: String,
    },
    GetCustomizationInfo,
    SearchChats {
        query: String,
    },
    Cancel {
        #[serde(default)]
        target_request_id: Option<RequestId>,
    },
    Shutdown,

    // Chat lifecycle.
    ChatNew {
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        global: bool,
    },
    ChatSelect {
        chat_id: String,
    },
    ChatDelete {
        chat_id: String,
    },
    ChatRename {
        #[serde(default)]
        chat_id: Option<String>,
        name: String,
    },
    /// Rewind the active chat to a user message, restoring that message's
    /// context snapshot and turning its text into the new draft.
    ChatEdit {
        message_index: usize,
        #[serde(default)]
        draft: Option<String>,
    },
    ForkChat {
        #[serde(default)]
        chat_id: Option<String>,
        message_index: usize,
    },
    SaveDraft {
        #[serde(default)]
        draft: String,
    },
    SaveChatSettings {
        #[serde(default)]
        model: Option<String>,
        #[serde(default)]
        reasoning_effort: Option<ReasoningEffort>,
    },
    ChatForceUnlock {
        chat_id: String,
    },

    // Context mutation.
    ContextAdd {
        path: String,
        #[serde(default)]
        content: Option<String>,
        #[serde(default)]
        readonly: bool,
    },
    ContextAddSection {
        path: String,
        start_line: u32,
        end_line: u32,
        #[serde(default)]
        content: Option<String>,
    },
    ContextUpdate {
        path: String,
        #[serde(default)]
        content: Option<String>,
    },
    ContextSetReadonly {
        path: String,
        readonly: bool,
    },
    ContextRemove {
        path: String,
    },
    ContextRemoveSection {
        path: String,
        start_line: u32,
        end_line: u32,
    },

    // Output / status transitions.
    OutputDelete {
        path: String,
    },
    ApplyFile {
        path: String,
    },
    ApplyFileAs {
        path: String,
        destination: String,
    },
    SyncContext {
        path: String,
    },
    DiffLocalDone {
        path: String,
    },

    // Turn-adjacent.
    GenerateTitle,
    AddSystemMessage {
        text: String,
    },
    PrepareInstructions,
    Send {
        #[serde(default)]
        text: String,
        #[serde(default)]
        model: Option<String>,
        #[serde(default)]
        reasoning_effort: Option<ReasoningEffort>,
    },
}

impl RequestOp {
    /// Actions that may run while a turn is streaming. Everything else is
    /// rejected with *another request in progress* until the terminal
    /// response for the in-flight `send` has been emitted.
    pub fn allowed_mid_stream(&self) -> bool {
        matches!(
            self,
            RequestOp::Ping
                | RequestOp::Version
                | RequestOp::Bb7Init { .. }
                | RequestOp::Init { .. }
                | RequestOp::ChatList
                | RequestOp::ChatActive
                | RequestOp::ChatGet { .. }
                | RequestOp::ContextList
                | RequestOp::GetContextFile { .. }
                | RequestOp::GetOutputFile { .. }
                | RequestOp::GetFileStatuses
                | RequestOp::GetDiffPaths { .. }
                | RequestOp::GetBalance
                | RequestOp::GetModels
                | RequestOp::EstimateTokens
                | RequestOp::EstimateTextTokens { .. }
                | RequestOp::GetCustomizationInfo
                | RequestOp::SearchChats { .. }
                | RequestOp::Cancel { .. }
                | RequestOp::Shutdown
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForkWarningKind {
    Deleted,
    Modified,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForkWarning {
    pub kind: ForkWarningKind,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub chat_id: String,
    pub name: String,
    pub match_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffPaths {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local: Option<String>,
}

/// One failed edit from the diff executor, carried verbatim into the
/// `diff_error` response and the hidden-retry context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffErrorDetail {
    pub path: String,
    pub message: String,
}

/// One stdout line. `request_id` echoes the originating request when it
/// carried one.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
    #[serde(flatten)]
    pub body: ResponseBody,
}

impl Response {
    pub fn new(request_id: Option<RequestId>, body: ResponseBody) -> Self {
        Self { request_id, body }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseBody {
    Ok,
    Error {
        message: String,
    },
    Chat {
        chat: Chat,
    },
    ChatList {
        chats: Vec<ChatSummary>,
        #[serde(skip_serializing_if = "Option::is_none")]
        active_chat_id: Option<String>,
    },
    ChatActive {
        #[serde(skip_serializing_if = "Option::is_none")]
        chat: Option<Chat>,
    },
    SearchResults {
        results: Vec<SearchResult>,
    },
    ForkResult {
        chat: Chat,
        warnings: Vec<ForkWarning>,
    },
    ContextList {
        files: Vec<ContextFile>,
    },
    FileContent {
        path: String,
        content: String,
    },
    FileStatuses {
        files: Vec<FileStatusEntry>,
    },
    DiffPaths {
        #[serde(flatten)]
        paths: DiffPaths,
    },
    TokenEstimate {
        tokens: u64,
    },
    TextTokenEstimate {
        tokens: u64,
    },
    Balance {
        total: f64,
        used: f64,
    },
    Models {
        models: Vec<String>,
    },
    CustomizationInfo {
        instructions_path: String,
        instructions_exists: bool,
        system_prompt_path: String,
        system_prompt_exists: bool,
    },
    InstructionsPath {
        path: String,
    },
    Version {
        version: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        commit: Option<String>,
    },
    /// Streaming assistant text.
    Chunk {
        content: String,
    },
    /// Streaming reasoning text.
    Thinking {
        content: String,
    },
    /// Terminal success for a turn.
    Done {
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<TokenUsage>,
        duration_ms: u64,
    },
    /// Terminal failure of the diff contract. An LLM error, not a system
    /// error: the conversation continues.
    DiffError {
        message: String,
        errors: Vec<DiffErrorDetail>,
        tool_calls: Vec<serde_json::Value>,
    },
    TitleUpdated {
        chat_id: String,
        name: String,
    },
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn request_id_normalizes_numbers_to_strings() {
        let req: Request =
            serde_json::from_str(r#"{"action":"ping","request_id":7}"#).unwrap();
        assert_eq!(req.request_id, Some(RequestId("7".to_string())));

        let req: Request =
            serde_json::from_str(r#"{"action":"ping","request_id":1.5}"#).unwrap();
        assert_eq!(req.request_id, Some(RequestId("1.5".to_string())));

        let resp = Response::new(req.request_id, ResponseBody::Ok);
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["request_id"], "1.5");
        assert_eq!(json["type"], "ok");
    }

    #[test]
    fn action_tag_dispatch() {
        let req: Request = serde_json::from_str(
            r#"{"action":"context_add","path":"a.go","content":"A\n","readonly":true}"#,
        )
        .unwrap();
        match req.op {
            RequestOp::ContextAdd {
                path,
                content,
                readonly,
            } => {
                assert_eq!(path, "a.go");
                assert_eq!(content.as_deref(), Some("A\n"));
                assert!(readonly);
            }
            other => panic!("wrong op: {other:?}"),
        }
    }

    #[test]
    fn mid_stream_gate_admits_reads_and_cancel() {
        let read: Request = serde_json::from_str(r#"{"action":"get_file_statuses"}"#).unwrap();
        assert!(read.op.allowed_mid_stream());

        let cancel: Request = serde_json::from_str(r#"{"action":"cancel"}"#).unwrap();
        assert!(cancel.op.allowed_mid_stream());

        let send: Request = serde_json::from_str(r#"{"action":"send","text":"x"}"#).unwrap();
        assert!(!send.op.allowed_mid_stream());

        let apply: Request =
            serde_json::from_str(r#"{"action":"apply_file","path":"a.go"}"#).unwrap();
        assert!(!apply.op.allowed_mid_stream());
    }
}
