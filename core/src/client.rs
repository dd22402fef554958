//! HTTP client for an OpenAI-compatible chat-completions provider.
//!
//! Only the streaming event vocabulary matters to the rest of the
//! system: SSE chunks are mapped onto [`StreamEvent`]s and forwarded over
//! a channel so the turn orchestrator can stay agnostic of the wire
//! format.

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use eventsource_stream::Eventsource;
use futures::Stream;
use futures::StreamExt;
use futures::TryStreamExt;
use reqwest::StatusCode;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::debug;
use tracing::trace;

use bb7_protocol::TokenUsage;

use crate::client_common::ChatRequest;
use crate::client_common::EventStream;
use crate::client_common::StreamEvent;
use crate::client_common::ToolCall;
use crate::client_common::reasoning_param;
use crate::config::Config;
use crate::error::Bb7Err;
use crate::error::Result;
use crate::flags::BB7_REQUEST_MAX_RETRIES;
use crate::flags::BB7_STREAM_IDLE_TIMEOUT_MS;
use crate::util::backoff;

#[derive(Clone)]
pub struct ModelClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    deny_data_collection: bool,
    explicit_cache_key: Option<String>,
}

impl ModelClient {
    pub fn new(config: &Config) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            deny_data_collection: !config.allow_training || !config.allow_data_retention,
            explicit_cache_key: config.explicit_cache_key.clone(),
        }
    }

    fn payload(&self, req: &ChatRequest, stream: bool) -> serde_json::Value {
        let messages = json!([
            {"role": "system", "content": req.system_prompt},
            {"role": "user", "content": req.user_message},
        ]);
        let mut payload = json!({
            "model": req.model,
            "messages": messages,
            "stream": stream,
        });
        if stream {
            payload["stream_options"] = json!({"include_usage": true});
        }
        if !req.tools.is_empty() {
            payload["tools"] = json!(req.tools);
        }
        if let Some(reasoning) = reasoning_param(req.reasoning_effort) {
            payload["reasoning"] = reasoning;
        }
        if self.deny_data_collection {
            payload["provider"] = json!({"data_collection": "deny"});
        }
        if let Some(key) = &self.explicit_cache_key {
            payload["prompt_cache_key"] = json!(key);
        }
        payload
    }

    async fn post(&self, payload: &serde_json::Value) -> Result<reqwest::Response> {
        let url = format!("{}/chat/completions", self.base_url);
        debug!("POST to {url}");
        trace!(
            "payload: {}",
            serde_json::to_string(payload).unwrap_or_default()
        );

        let mut attempt = 0;
        loop {
            attempt += 1;

            let mut req_builder = self.client.post(&url);
            if let Some(api_key) = &self.api_key {
                req_builder = req_builder.bearer_auth(api_key.clone());
            }
            let res = req_builder
                .header(reqwest::header::ACCEPT, "text/event-stream")
                .json(payload)
                .send()
                .await;

            match res {
                Ok(resp) if resp.status().is_success() => return Ok(resp),
                Ok(res) => {
                    let status = res.status();
                    if !(status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()) {
                        let body = (res.text().await).unwrap_or_default();
                        return Err(Bb7Err::UnexpectedStatus(status, body));
                    }

                    if attempt > *BB7_REQUEST_MAX_RETRIES {
                        return Err(Bb7Err::RetryLimit(status));
                    }

                    let retry_after_secs = res
                        .headers()
                        .get(reqwest::header::RETRY_AFTER)
                        .and_then(|v| v.to_str().ok())
                        .and_then(|s| s.parse::<u64>().ok());
                    let delay = retry_after_secs
                        .map(|s| Duration::from_millis(s * 1_000))
                        .unwrap_or_else(|| backoff(attempt));
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    if attempt > *BB7_REQUEST_MAX_RETRIES {
                        return Err(e.into());
                    }
                    let delay = backoff(attempt);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Start a streaming completion; events arrive on the returned
    /// channel-backed stream.
    pub async fn stream(&self, req: &ChatRequest) -> Result<EventStream> {
        let payload = self.payload(req, true);
        let resp = self.post(&payload).await?;
        let (tx_event, rx_event) = mpsc::channel::<Result<StreamEvent>>(16);
        let stream = resp
            .bytes_stream()
            .map_err(Bb7Err::Reqwest);
        tokio::spawn(process_chat_sse(stream, tx_event));
        Ok(EventStream { rx_event })
    }

    /// One-shot, non-streaming completion; used for title generation.
    pub async fn complete(&self, req: &ChatRequest) -> Result<String> {
        let payload = self.payload(req, false);
        let resp = self.post(&payload).await?;
        let body: serde_json::Value = resp.json().await?;
        let content = body
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .unwrap_or_default();
        Ok(content.to_string())
    }

    pub async fn list_models(&self) -> Result<Vec<String>> {
        let url = format!("{}/models", self.base_url);
        let mut req_builder = self.client.get(&url);
        if let Some(api_key) = &self.api_key {
            req_builder = req_builder.bearer_auth(api_key.clone());
        }
        let body: serde_json::Value = req_builder.send().await?.error_for_status()?.json().await?;
        let mut models: Vec<String> = body
            .get("data")
            .and_then(|d| d.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|m| m.get("id").and_then(|id| id.as_str()))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        models.sort();
        Ok(models)
    }

    /// `(total, used)` credits from the provider's `/credits` endpoint.
    pub async fn get_balance(&self) -> Result<(f64, f64)> {
        let url = format!("{}/credits", self.base_url);
        let mut req_builder = self.client.get(&url);
        if let Some(api_key) = &self.api_key {
            req_builder = req_builder.bearer_auth(api_key.clone());
        }
        let body: serde_json::Value = req_builder.send().await?.error_for_status()?.json().await?;
        let data = body.get("data").unwrap_or(&body);
        let total = data
            .get("total_credits")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0);
        let used = data
            .get("total_usage")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0);
        Ok((total, used))
    }
}

/// SSE processor for the chat-completions streaming format.
///
/// Providers may interleave several tool calls in one response, splitting
/// each call's `arguments` over many delta events; fragments are keyed by
/// the delta's `index` and flushed in order once a `finish_reason`
/// arrives.
async fn process_chat_sse<S>(stream: S, tx_event: mpsc::Sender<Result<StreamEvent>>)
where
    S: Stream<Item = Result<Bytes>> + Unpin,
{
    let mut stream = stream.eventsource();

    let idle_timeout = *BB7_STREAM_IDLE_TIMEOUT_MS;

    #[derive(Default)]
    struct FnCallState {
        name: Option<String>,
        arguments: String,
    }

    let mut fn_calls: BTreeMap<u64, FnCallState> = BTreeMap::new();
    let mut usage: Option<TokenUsage> = None;
    let mut flushed_calls = false;

    loop {
        let sse = match timeout(idle_timeout, stream.next()).await {
            Ok(Some(Ok(ev))) => ev,
            Ok(Some(Err(e))) => {
                let _ = tx_event
                    .send(Err(Bb7Err::Stream(e.to_string(), None)))
                    .await;
                return;
            }
            Ok(None) => {
                // Stream closed gracefully.
                let _ = tx_event.send(Ok(StreamEvent::Done { usage })).await;
                return;
            }
            Err(_) => {
                let _ = tx_event
                    .send(Err(Bb7Err::Stream(
                        "idle timeout waiting for SSE".to_string(),
                        None,
                    )))
                    .await;
                return;
            }
        };

        // The terminating sentinel of the chat streaming format.
        if sse.data.trim() == "[DONE]" {
            let _ = tx_event.send(Ok(StreamEvent::Done { usage })).await;
            return;
        }

        let chunk: serde_json::Value = match serde_json::from_str(&sse.data) {
            Ok(v) => v,
            Err(_) => continue,
        };
        trace!("received SSE chunk: {chunk:?}");

        if let Some(error) = chunk.get("error") {
            let message = error
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("provider returned an error")
                .to_string();
            let _ = tx_event.send(Err(Bb7Err::Stream(message, None))).await;
            return;
        }

        if let Some(u) = chunk.get("usage").filter(|u| !u.is_null()) {
            usage = Some(parse_usage(u));
        }

        let Some(choice) = chunk.get("choices").and_then(|c| c.get(0)) else {
            continue;
        };
        let delta = choice.get("delta");

        if let Some(content) = delta
            .and_then(|d| d.get("content"))
            .and_then(|c| c.as_str())
            && !content.is_empty()
        {
            let _ = tx_event
                .send(Ok(StreamEvent::Content(content.to_string())))
                .await;
        }

        // Reasoning deltas come under either key depending on provider.
        for key in ["reasoning", "reasoning_content"] {
            if let Some(reasoning) = delta
                .and_then(|d| d.get(key))
                .and_then(|c| c.as_str())
                && !reasoning.is_empty()
            {
                let _ = tx_event
                    .send(Ok(StreamEvent::Reasoning(reasoning.to_string())))
                    .await;
            }
        }

        if let Some(tool_calls) = delta
            .and_then(|d| d.get("tool_calls"))
            .and_then(|tc| tc.as_array())
        {
            for tool_call in tool_calls {
                let index = tool_call.get("index").and_then(|i| i.as_u64()).unwrap_or(0);
                let state = fn_calls.entry(index).or_default();
                if let Some(function) = tool_call.get("function") {
                    if let Some(name) = function.get("name").and_then(|n| n.as_str()) {
                        state.name.get_or_insert_with(|| name.to_string());
                    }
                    if let Some(fragment) = function.get("arguments").and_then(|a| a.as_str()) {
                        state.arguments.push_str(fragment);
                    }
                }
            }
        }

        if let Some(finish_reason) = choice.get("finish_reason").and_then(|v| v.as_str()) {
            debug!("stream finished: {finish_reason}");
            if !flushed_calls {
                flushed_calls = true;
                for (_, state) in std::mem::take(&mut fn_calls) {
                    let _ = tx_event
                        .send(Ok(StreamEvent::ToolCall(ToolCall {
                            name: state.name.unwrap_or_default(),
                            arguments: state.arguments,
                        })))
                        .await;
                }
            }
            // Keep reading: usage often arrives in a trailing chunk
            // before [DONE].
        }
    }
}

fn parse_usage(u: &serde_json::Value) -> TokenUsage {
    let input_tokens = u
        .get("prompt_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let output_tokens = u
        .get("completion_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    TokenUsage {
        input_tokens,
        cached_input_tokens: u
            .get("prompt_tokens_details")
            .and_then(|d| d.get("cached_tokens"))
            .and_then(|v| v.as_u64()),
        output_tokens,
        reasoning_output_tokens: u
            .get("completion_tokens_details")
            .and_then(|d| d.get("reasoning_tokens"))
            .and_then(|v| v.as_u64()),
        total_tokens: u
            .get("total_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(input_tokens + output_tokens),
        cost: u.get("cost").and_then(|v| v.as_f64()),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use futures::StreamExt as _;
    use pretty_assertions::assert_eq;

    fn sse_body(events: &[&str]) -> String {
        let mut body = String::new();
        for data in events {
            body.push_str("data: ");
            body.push_str(data);
            body.push_str("\n\n");
        }
        body
    }

    async fn collect(body: String) -> Vec<StreamEvent> {
        let chunks = vec![Ok::<Bytes, Bb7Err>(Bytes::from(body))];
        let stream = futures::stream::iter(chunks);
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(process_chat_sse(stream, tx));
        let mut out = Vec::new();
        let mut events = EventStream { rx_event: rx };
        while let Some(ev) = events.next().await {
            out.push(ev.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn content_deltas_and_done() {
        let body = sse_body(&[
            r#"{"choices":[{"delta":{"content":"Hel"}}]}"#,
            r#"{"choices":[{"delta":{"content":"lo"}},{"delta":{}}]}"#,
            r#"{"choices":[{"delta":{},"finish_reason":"stop"}],"usage":{"prompt_tokens":3,"completion_tokens":2,"total_tokens":5}}"#,
            "[DONE]",
        ]);
        let events = collect(body).await;
        assert_eq!(events[0], StreamEvent::Content("Hel".to_string()));
        assert_eq!(events[1], StreamEvent::Content("lo".to_string()));
        match events.last().unwrap() {
            StreamEvent::Done { usage: Some(usage) } => {
                assert_eq!(usage.input_tokens, 3);
                assert_eq!(usage.total_tokens, 5);
            }
            other => panic!("expected done with usage, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn tool_call_fragments_reassemble_by_index() {
        let body = sse_body(&[
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"name":"edit_file","arguments":"{\"path\":"}}]}}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"a.go\"}"}}]}}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":1,"function":{"name":"write_file","arguments":"{}"}}]}}]}"#,
            r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#,
            "[DONE]",
        ]);
        let events = collect(body).await;
        assert_eq!(
            events[0],
            StreamEvent::ToolCall(ToolCall {
                name: "edit_file".to_string(),
                arguments: r#"{"path":"a.go"}"#.to_string(),
            })
        );
        assert_eq!(
            events[1],
            StreamEvent::ToolCall(ToolCall {
                name: "write_file".to_string(),
                arguments: "{}".to_string(),
            })
        );
        assert!(matches!(events[2], StreamEvent::Done { .. }));
    }

    #[tokio::test]
    async fn reasoning_deltas_are_forwarded() {
        let body = sse_body(&[
            r#"{"choices":[{"delta":{"reasoning":"hmm"}}]}"#,
            "[DONE]",
        ]);
        let events = collect(body).await;
        assert_eq!(events[0], StreamEvent::Reasoning("hmm".to_string()));
    }

    #[tokio::test]
    async fn provider_error_chunk_terminates_stream() {
        let body = sse_body(&[r#"{"error":{"message":"boom"}}"#]);
        let chunks = vec![Ok::<Bytes, Bb7Err>(Bytes::from(body))];
        let stream = futures::stream::iter(chunks);
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(process_chat_sse(stream, tx));
        let mut events = EventStream { rx_event: rx };
        match events.next().await {
            Some(Err(Bb7Err::Stream(msg, _))) => assert_eq!(msg, "boom"),
            other => panic!("expected stream error, got {other:?}"),
        }
    }
}
