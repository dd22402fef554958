use std::io;
use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;
use tokio::task::JoinError;

pub type Result<T> = std::result::Result<T, Bb7Err>;

#[derive(Error, Debug)]
pub enum Bb7Err {
    /// Request was syntactically valid JSON but semantically malformed.
    /// The message is returned verbatim to the caller.
    #[error("{0}")]
    InvalidRequest(String),

    #[error("not initialized")]
    NotInitialized,

    #[error("not a bb7 project")]
    NotBb7Project,

    #[error("already initialized")]
    AlreadyInit,

    #[error("no active chat")]
    NoActiveChat,

    #[error("chat not found: {0}")]
    ChatNotFound(String),

    /// Another live process holds the chat's lock file.
    #[error("chat is locked by another process (pid {0})")]
    ChatLocked(u32),

    #[error("chat name cannot be empty")]
    ChatNameEmpty,

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("file already exists: {0}")]
    FileExists(String),

    /// External (absolute, outside-project) context entries can never
    /// become writable.
    #[error("external files are always read-only: {0}")]
    ExternalReadOnly(String),

    /// Refusing to flip a file read-only while it has pending output.
    #[error("context modified: {0} has pending output")]
    ContextModified(String),

    #[error("file is read-only: {0}")]
    ReadOnly(String),

    #[error("global chats cannot modify files")]
    GlobalReadOnly,

    #[error("path escapes the project root: {0}")]
    PathEscape(String),

    #[error("absolute path not allowed: {0}")]
    AbsolutePath(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// A mutating request arrived while a turn was streaming.
    #[error("another request in progress")]
    RequestInProgress,

    /// One or more model-emitted edits failed to apply. An LLM error, not
    /// a system error: surfaced as a `diff_error` response, never aborts
    /// the conversation.
    #[error("diff failed to apply: {0}")]
    Diff(String),

    /// SSE stream disconnected or errored after the HTTP handshake
    /// succeeded. Optionally carries a provider-requested retry delay.
    #[error("stream disconnected before completion: {0}")]
    Stream(String, Option<Duration>),

    #[error("Response aborted by user.")]
    Canceled,

    /// Unexpected HTTP status code from the provider.
    #[error("unexpected status {0}: {1}")]
    UnexpectedStatus(StatusCode, String),

    /// Retry limit exceeded.
    #[error("exceeded retry limit, last status: {0}")]
    RetryLimit(StatusCode),

    #[error("missing environment or config value: {0}")]
    MissingConfig(String),

    // -----------------------------------------------------------------
    // Automatic conversions for common external error types
    // -----------------------------------------------------------------
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    TokioJoin(#[from] JoinError),
}

impl Bb7Err {
    /// Fixed human-readable message emitted on the wire for each sentinel
    /// condition; pass-through for everything else.
    pub fn ui_message(&self) -> String {
        match self {
            Bb7Err::NotInitialized => "Project not initialized".to_string(),
            Bb7Err::NotBb7Project => "Not a bb7 project".to_string(),
            Bb7Err::AlreadyInit => "Project already initialized".to_string(),
            Bb7Err::NoActiveChat => "No active chat".to_string(),
            Bb7Err::ChatLocked(_) => "Chat is locked by another process".to_string(),
            Bb7Err::ChatNameEmpty => "Chat name cannot be empty".to_string(),
            Bb7Err::GlobalReadOnly => "Global chats cannot modify files".to_string(),
            Bb7Err::RequestInProgress => "another request in progress".to_string(),
            Bb7Err::Canceled => "Response aborted by user.".to_string(),
            other => other.to_string(),
        }
    }
}

/// Terminates the process after a resolved write target escaped the
/// project root. This indicates a severe logic bug or an attack via the
/// output tree, so no recovery is attempted.
pub fn fatal_project_escape(path: &std::path::Path) -> ! {
    tracing::error!(
        "FATAL: resolved write target escapes the project root: {}",
        path.display()
    );
    std::process::exit(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_messages_are_fixed() {
        assert_eq!(Bb7Err::NoActiveChat.ui_message(), "No active chat");
        assert_eq!(
            Bb7Err::Canceled.ui_message(),
            "Response aborted by user."
        );
        assert_eq!(
            Bb7Err::RequestInProgress.ui_message(),
            "another request in progress"
        );
    }

    #[test]
    fn passthrough_messages_keep_detail() {
        let err = Bb7Err::PathEscape("../x".to_string());
        assert!(err.ui_message().contains("../x"));
    }
}
