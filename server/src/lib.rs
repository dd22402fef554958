//! Stdio server: newline-delimited JSON over stdin/stdout.
//!
//! Three tasks wired with bounded channels: a stdin reader, the message
//! processor, and a single stdout writer. Responses are serialized by
//! the writer task alone, so interleaved output is impossible — the
//! writer *is* the response lock.
#![deny(clippy::print_stdout, clippy::print_stderr)]

use std::io::Result as IoResult;
use std::sync::Arc;

use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::io::{self};
use tokio::sync::mpsc;
use tracing::debug;
use tracing::error;
use tracing::info;

use bb7_core::App;
use bb7_protocol::Response;

pub mod message_processor;

pub use crate::message_processor::MessageProcessor;

/// Size of the bounded channels used to communicate between tasks. The
/// value is a balance between throughput and memory usage – 128 messages
/// is plenty for one editor frontend.
const CHANNEL_CAPACITY: usize = 128;

/// Hard cap on one request line. A line over the cap produces a typed
/// error on stdout and terminates the process: the stream is framed by
/// newlines, so an oversized line means the peer is broken.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

pub async fn run_main(app: Arc<App>) -> IoResult<()> {
    // `tracing` output goes to stderr; stdout belongs to the protocol.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let (incoming_tx, mut incoming_rx) = mpsc::channel::<String>(CHANNEL_CAPACITY);
    let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<Response>(CHANNEL_CAPACITY);

    // Task: read lines from stdin, push to `incoming_tx`.
    let stdin_reader_handle = tokio::spawn({
        let incoming_tx = incoming_tx.clone();
        async move {
            let stdin = io::stdin();
            let reader = BufReader::new(stdin);
            let mut lines = reader.lines();

            while let Ok(Some(line)) = lines.next_line().await {
                if incoming_tx.send(line).await.is_err() {
                    // Receiver gone – nothing left to do.
                    break;
                }
            }

            debug!("stdin reader finished (EOF)");
        }
    });

    // Task: process incoming lines until EOF or shutdown.
    let processor_handle = tokio::spawn({
        let app = Arc::clone(&app);
        let outgoing_tx = outgoing_tx.clone();
        async move {
            let mut processor = MessageProcessor::new(app, outgoing_tx);
            while let Some(line) = incoming_rx.recv().await {
                if !processor.process_line(line).await {
                    break;
                }
            }
            info!("processor task exited");
        }
    });

    // Task: write outgoing responses to stdout.
    let debug_log = app.debug.clone();
    let stdout_writer_handle = tokio::spawn(async move {
        let mut stdout = io::stdout();
        while let Some(resp) = outgoing_rx.recv().await {
            match serde_json::to_string(&resp) {
                Ok(json) => {
                    debug_log.record("response", serde_json::json!({"line": json}));
                    if let Err(e) = stdout.write_all(json.as_bytes()).await {
                        error!("Failed to write to stdout: {e}");
                        break;
                    }
                    if let Err(e) = stdout.write_all(b"\n").await {
                        error!("Failed to write newline to stdout: {e}");
                        break;
                    }
                    if let Err(e) = stdout.flush().await {
                        error!("Failed to flush stdout: {e}");
                        break;
                    }
                }
                Err(e) => error!("Failed to serialize response: {e}"),
            }
        }

        info!("stdout writer exited (channel closed)");
    });

    // Drop our copies so EOF (or shutdown) propagates: reader closes the
    // incoming channel, the processor drops the outgoing sender, and the
    // writer drains what is left before exiting.
    drop(incoming_tx);
    drop(outgoing_tx);

    // The reader may still be parked on a blocking stdin read after a
    // shutdown request; don't wait for the peer to close the pipe.
    let _ = tokio::join!(processor_handle, stdout_writer_handle);
    stdin_reader_handle.abort();
    app.shutdown();

    Ok(())
}
