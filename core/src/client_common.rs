use std::pin::Pin;
use std::task::Context;
use std::task::Poll;

use futures::Stream;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;

use bb7_protocol::ReasoningEffort;
use bb7_protocol::TokenUsage;

use crate::error::Result;

/// One model turn as handed to the HTTP client: a fully composed system
/// prompt, the single structured user message from the prompt builder,
/// and the tool definitions for the selected diff mode.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub model: String,
    pub system_prompt: String,
    pub user_message: String,
    pub reasoning_effort: Option<ReasoningEffort>,
    pub tools: Vec<serde_json::Value>,
}

/// A completed tool call, re-assembled from streamed argument fragments.
/// `arguments` stays a raw JSON string; the turn orchestrator parses it
/// per diff mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    pub arguments: String,
}

/// The streaming event vocabulary the rest of the pipeline consumes,
/// independent of the provider's wire format.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Content(String),
    Reasoning(String),
    ToolCall(ToolCall),
    Done { usage: Option<TokenUsage> },
}

pub struct EventStream {
    pub(crate) rx_event: mpsc::Receiver<Result<StreamEvent>>,
}

impl Stream for EventStream {
    type Item = Result<StreamEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx_event.poll_recv(cx)
    }
}

pub(crate) fn reasoning_param(effort: Option<ReasoningEffort>) -> Option<serde_json::Value> {
    effort.map(|e| serde_json::json!({ "effort": e.to_string() }))
}
