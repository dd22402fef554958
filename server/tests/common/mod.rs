#![allow(clippy::unwrap_used, clippy::expect_used)]
// Each integration binary uses a different subset of these helpers.
#![allow(dead_code)]
//! Shared harness for dispatch tests: a processor wired to an in-memory
//! response channel over a temp project.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;

use bb7_core::App;
use bb7_core::Config;
use bb7_core::DebugLog;
use bb7_core::ModelClient;
use bb7_protocol::DiffMode;
use bb7_protocol::Response;
use bb7_server::MessageProcessor;

pub struct TestServer {
    pub app: Arc<App>,
    pub processor: MessageProcessor,
    pub rx: mpsc::Receiver<Response>,
    pub root: PathBuf,
    _tmp: tempfile::TempDir,
}

pub fn test_server() -> TestServer {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().join("proj");
    std::fs::create_dir_all(&root).unwrap();

    let config = Config {
        base_url: "http://127.0.0.1:9/v1".to_string(),
        api_key: None,
        default_model: "test-model".to_string(),
        title_model: "test-title-model".to_string(),
        diff_mode: DiffMode::SearchReplace,
        allow_training: false,
        allow_data_retention: false,
        explicit_cache_key: None,
        auto_retry_partial_edits: true,
        bb7_home: tmp.path().join("home").join(".bb7"),
    };
    let client = ModelClient::new(&config);
    let app = Arc::new(App::new(config, client, DebugLog::default()));

    let (tx, rx) = mpsc::channel::<Response>(64);
    let processor = MessageProcessor::new(Arc::clone(&app), tx);
    TestServer {
        app,
        processor,
        rx,
        root,
        _tmp: tmp,
    }
}

impl TestServer {
    /// Feed one stdin line; returns the processor's continue flag and
    /// everything emitted in response.
    pub async fn send_line(&mut self, line: &str) -> (bool, Vec<Response>) {
        let more = self.processor.process_line(line.to_string()).await;
        let mut out = Vec::new();
        while let Ok(resp) = self.rx.try_recv() {
            out.push(resp);
        }
        (more, out)
    }

    /// Feed a line that must keep the loop running and produce exactly
    /// one response.
    pub async fn request(&mut self, line: &str) -> Response {
        let (more, mut responses) = self.send_line(line).await;
        assert!(more, "processor stopped unexpectedly on: {line}");
        assert_eq!(
            responses.len(),
            1,
            "expected exactly one response to: {line}"
        );
        responses.remove(0)
    }

    /// Serialize `value` as the request line and dispatch it.
    pub async fn request_json(&mut self, value: serde_json::Value) -> Response {
        self.request(&value.to_string()).await
    }
}
