#![allow(clippy::unwrap_used, clippy::expect_used)]
// Each integration binary uses a different subset of these helpers.
#![allow(dead_code)]
//! Shared harness for end-to-end turn tests: a temp project wired to a
//! wiremock provider that replays scripted SSE bodies.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use wiremock::MockServer;
use wiremock::ResponseTemplate;

use bb7_core::App;
use bb7_core::Config;
use bb7_core::DebugLog;
use bb7_core::ModelClient;
use bb7_protocol::DiffMode;
use bb7_protocol::RequestId;
use bb7_protocol::Response;
use bb7_protocol::ResponseBody;

pub struct TestApp {
    pub app: Arc<App>,
    pub root: PathBuf,
    _tmp: tempfile::TempDir,
}

pub async fn test_app(server: &MockServer, diff_mode: DiffMode) -> TestApp {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().join("proj");
    std::fs::create_dir_all(&root).unwrap();

    let config = Config {
        base_url: server.uri(),
        api_key: Some("test-key".to_string()),
        default_model: "test-model".to_string(),
        title_model: "test-title-model".to_string(),
        diff_mode,
        allow_training: true,
        allow_data_retention: true,
        explicit_cache_key: None,
        auto_retry_partial_edits: true,
        bb7_home: tmp.path().join("home").join(".bb7"),
    };
    let client = ModelClient::new(&config);
    let app = Arc::new(App::new(config, client, DebugLog::default()));
    app.bb7_init(&root.to_string_lossy()).unwrap();
    app.init(&root.to_string_lossy()).unwrap();

    TestApp {
        app,
        root,
        _tmp: tmp,
    }
}

/// Build an SSE body from `data:` payload strings, appending `[DONE]`.
pub fn sse_body(events: &[String]) -> String {
    let mut body = String::new();
    for data in events {
        body.push_str("data: ");
        body.push_str(data);
        body.push_str("\n\n");
    }
    body.push_str("data: [DONE]\n\n");
    body
}

pub fn sse_response(events: &[String]) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_raw(sse_body(events), "text/event-stream")
}

pub fn content_event(text: &str) -> String {
    serde_json::json!({
        "choices": [{"delta": {"content": text}}]
    })
    .to_string()
}

pub fn tool_call_event(name: &str, arguments: &serde_json::Value) -> String {
    tool_call_event_at(0, name, arguments)
}

pub fn tool_call_event_at(index: u32, name: &str, arguments: &serde_json::Value) -> String {
    serde_json::json!({
        "choices": [{"delta": {"tool_calls": [{
            "index": index,
            "function": {"name": name, "arguments": arguments.to_string()}
        }]}}]
    })
    .to_string()
}

pub fn finish_event(reason: &str) -> String {
    serde_json::json!({
        "choices": [{"delta": {}, "finish_reason": reason}],
        "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
    })
    .to_string()
}

/// Drive one `send` to its terminal response and return everything that
/// was emitted, terminal last.
pub async fn run_send(test: &TestApp, text: &str) -> Vec<ResponseBody> {
    let (tx, rx) = mpsc::channel::<Response>(256);
    test.app.slot.reserve("t1").unwrap();
    bb7_core::run_send(
        Arc::clone(&test.app),
        tx,
        Some(RequestId("t1".to_string())),
        text.to_string(),
        None,
        None,
    )
    .await;
    drain(rx)
}

pub fn drain(mut rx: mpsc::Receiver<Response>) -> Vec<ResponseBody> {
    let mut out = Vec::new();
    while let Ok(resp) = rx.try_recv() {
        out.push(resp.body);
    }
    out
}

pub fn terminal(responses: &[ResponseBody]) -> &ResponseBody {
    responses
        .iter()
        .rev()
        .find(|body| {
            matches!(
                body,
                ResponseBody::Done { .. }
                    | ResponseBody::Error { .. }
                    | ResponseBody::DiffError { .. }
            )
        })
        .expect("turn emitted no terminal response")
}
