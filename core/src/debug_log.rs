//! LLM debug log: a JSONL transcript of every request line, response
//! line, provider payload and raw stream event, written under
//! `~/.bb7/logs/` when debugging is enabled.
//!
//! The log is recorded through a channel owned by a writer task so the
//! hot path never blocks on disk; a disabled log is a no-op sender.

use std::path::PathBuf;

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::warn;

use crate::config::Config;

#[derive(Serialize)]
struct LogEntry<'a> {
    ts: String,
    kind: &'a str,
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    payload: serde_json::Value,
}

#[derive(Clone, Default)]
pub struct DebugLog {
    tx: Option<mpsc::UnboundedSender<String>>,
}

impl DebugLog {
    /// Opens the log file and spawns its writer task when debugging is
    /// enabled; otherwise returns a disabled no-op handle. Failure to set
    /// up the log never fails startup.
    pub fn new(config: &Config) -> Self {
        if !config.debug_enabled() {
            return Self { tx: None };
        }
        let path = log_file_path(config);
        let file = match open_log_file(&path) {
            Ok(file) => file,
            Err(e) => {
                warn!("failed to open debug log {}: {e}", path.display());
                return Self { tx: None };
            }
        };

        // Unbounded on purpose: handlers record synchronously while
        // holding the state lock and must never wait on the disk.
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        tokio::spawn(async move {
            let mut file = tokio::fs::File::from_std(file);
            while let Some(line) = rx.recv().await {
                if let Err(e) = file.write_all(line.as_bytes()).await {
                    warn!("debug log write failed: {e}");
                    break;
                }
                if let Err(e) = file.write_all(b"\n").await {
                    warn!("debug log write failed: {e}");
                    break;
                }
                if let Err(e) = file.flush().await {
                    warn!("debug log flush failed: {e}");
                    break;
                }
            }
        });
        Self { tx: Some(tx) }
    }

    pub fn enabled(&self) -> bool {
        self.tx.is_some()
    }

    pub fn record(&self, kind: &str, payload: serde_json::Value) {
        let Some(tx) = &self.tx else {
            return;
        };
        let entry = LogEntry {
            ts: Utc::now().to_rfc3339(),
            kind,
            payload,
        };
        match serde_json::to_string(&entry) {
            Ok(line) => {
                let _ = tx.send(line);
            }
            Err(e) => warn!("failed to serialize debug log entry: {e}"),
        }
    }
}

fn log_file_path(config: &Config) -> PathBuf {
    let date = Utc::now().format("%Y-%m-%d");
    config
        .log_dir()
        .join(format!("bb7-{date}-{}.jsonl", std::process::id()))
}

fn open_log_file(path: &PathBuf) -> std::io::Result<std::fs::File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::OpenOptions::new().append(true).create(true).open(path)
}
