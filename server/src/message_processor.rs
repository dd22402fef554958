use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::warn;

use bb7_core::App;
use bb7_core::Bb7Err;
use bb7_core::estimate_tokens;
use bb7_protocol::Request;
use bb7_protocol::RequestId;
use bb7_protocol::RequestOp;
use bb7_protocol::Response;
use bb7_protocol::ResponseBody;

use crate::MAX_LINE_BYTES;

/// Parses request lines, gates them against the in-flight turn, and
/// routes each action to its handler.
pub struct MessageProcessor {
    app: Arc<App>,
    outgoing: mpsc::Sender<Response>,
}

impl MessageProcessor {
    pub fn new(app: Arc<App>, outgoing: mpsc::Sender<Response>) -> Self {
        Self { app, outgoing }
    }

    /// Handle one stdin line. Returns `false` when the process should
    /// stop (shutdown request or oversized line).
    pub async fn process_line(&mut self, line: String) -> bool {
        if line.trim().is_empty() {
            return true;
        }
        self.app
            .debug
            .record("request", serde_json::json!({"line": line}));

        if line.len() > MAX_LINE_BYTES {
            self.send(None, err_body(&Bb7Err::InvalidRequest(format!(
                "request line exceeds {MAX_LINE_BYTES} bytes"
            ))))
            .await;
            return false;
        }

        // Parse loosely first so a malformed request still gets its
        // request_id echoed back.
        let value: serde_json::Value = match serde_json::from_str(&line) {
            Ok(value) => value,
            Err(e) => {
                self.send(None, err_body(&Bb7Err::InvalidRequest(format!(
                    "invalid JSON: {e}"
                ))))
                .await;
                return true;
            }
        };
        let request_id = value
            .get("request_id")
            .cloned()
            .and_then(|v| serde_json::from_value::<RequestId>(v).ok());
        let request: Request = match serde_json::from_value(value) {
            Ok(request) => request,
            Err(e) => {
                self.send(request_id, err_body(&Bb7Err::InvalidRequest(e.to_string())))
                    .await;
                return true;
            }
        };

        // Mid-stream gate: while a turn is streaming, only read-only
        // actions and `cancel` go through.
        if self.app.slot.is_active() && !request.op.allowed_mid_stream() {
            self.send(request.request_id, err_body(&Bb7Err::RequestInProgress))
                .await;
            return true;
        }

        self.dispatch(request).await
    }

    async fn dispatch(&mut self, request: Request) -> bool {
        let Request { request_id, op } = request;
        match op {
            RequestOp::Ping => self.send(request_id, ResponseBody::Ok).await,
            RequestOp::Version => {
                self.send(
                    request_id,
                    ResponseBody::Version {
                        version: env!("CARGO_PKG_VERSION").to_string(),
                        commit: option_env!("BB7_BUILD_COMMIT").map(str::to_string),
                    },
                )
                .await
            }
            RequestOp::Shutdown => {
                self.send(request_id, ResponseBody::Ok).await;
                return false;
            }
            RequestOp::Cancel { target_request_id } => {
                let target = target_request_id.as_ref().map(|id| id.0.as_str());
                if !self.app.slot.cancel(target) {
                    warn!("cancel received with no matching active stream");
                }
                self.send(request_id, ResponseBody::Ok).await;
            }

            RequestOp::Send {
                text,
                model,
                reasoning_effort,
            } => {
                // Reserve synchronously so a second `send` (or any
                // mutating action) observes the slot immediately.
                let slot_key = request_id.as_ref().map(|r| r.0.clone()).unwrap_or_default();
                if let Err(e) = self.app.slot.reserve(&slot_key) {
                    self.send(request_id, err_body(&e)).await;
                    return true;
                }
                let app = Arc::clone(&self.app);
                let outgoing = self.outgoing.clone();
                tokio::spawn(bb7_core::run_send(
                    app,
                    outgoing,
                    request_id,
                    text,
                    model,
                    reasoning_effort,
                ));
            }
            RequestOp::GenerateTitle => {
                let app = Arc::clone(&self.app);
                let outgoing = self.outgoing.clone();
                tokio::spawn(async move {
                    if let Err(e) =
                        bb7_core::generate_title(app, outgoing.clone(), request_id.clone()).await
                    {
                        let resp = Response::new(request_id, err_body(&e));
                        let _ = outgoing.send(resp).await;
                    }
                });
            }
            RequestOp::GetBalance => {
                let app = Arc::clone(&self.app);
                let outgoing = self.outgoing.clone();
                tokio::spawn(async move {
                    let body = match app.client.get_balance().await {
                        Ok((total, used)) => ResponseBody::Balance { total, used },
                        Err(e) => err_body(&e),
                    };
                    let _ = outgoing.send(Response::new(request_id, body)).await;
                });
            }
            RequestOp::GetModels => {
                let app = Arc::clone(&self.app);
                let outgoing = self.outgoing.clone();
                tokio::spawn(async move {
                    let body = match app.client.list_models().await {
                        Ok(models) => ResponseBody::Models { models },
                        Err(e) => err_body(&e),
                    };
                    let _ = outgoing.send(Response::new(request_id, body)).await;
                });
            }

            op => {
                let body = self.handle_sync(op);
                self.send(request_id, body).await;
            }
        }
        true
    }

    /// All the synchronous state operations; each locks the state for
    /// its own duration inside `App`.
    fn handle_sync(&self, op: RequestOp) -> ResponseBody {
        let app = &self.app;
        let result: bb7_core::Result<ResponseBody> = match op {
            RequestOp::Bb7Init { path } => app.bb7_init(&path).map(|()| ResponseBody::Ok),
            RequestOp::Init { path } => app.init(&path).map(|()| ResponseBody::Ok),
            RequestOp::ChatList => app.chat_list().map(|(chats, active_chat_id)| {
                ResponseBody::ChatList {
                    chats,
                    active_chat_id,
                }
            }),
            RequestOp::ChatActive => Ok(ResponseBody::ChatActive {
                chat: app.active_chat(),
            }),
            RequestOp::ChatGet { chat_id } => app
                .chat_get(chat_id.as_deref())
                .map(|chat| ResponseBody::Chat { chat }),
            RequestOp::ChatNew { name, global } => app
                .chat_new(name.as_deref(), global)
                .map(|chat| ResponseBody::Chat { chat }),
            RequestOp::ChatSelect { chat_id } => app
                .chat_select(&chat_id)
                .map(|chat| ResponseBody::Chat { chat }),
            RequestOp::ChatDelete { chat_id } => {
                app.chat_delete(&chat_id).map(|()| ResponseBody::Ok)
            }
            RequestOp::ChatRename { chat_id, name } => app
                .chat_rename(chat_id.as_deref(), &name)
                .map(|chat| ResponseBody::Chat { chat }),
            RequestOp::ChatEdit {
                message_index,
                draft,
            } => app
                .chat_edit(message_index, draft.as_deref())
                .map(|(chat, _warnings)| ResponseBody::Chat { chat }),
            RequestOp::ForkChat {
                chat_id,
                message_index,
            } => app
                .fork_chat(chat_id.as_deref(), message_index)
                .map(|(chat, warnings)| ResponseBody::ForkResult { chat, warnings }),
            RequestOp::SaveDraft { draft } => {
                app.save_draft(&draft).map(|()| ResponseBody::Ok)
            }
            RequestOp::SaveChatSettings {
                model,
                reasoning_effort,
            } => app
                .save_chat_settings(model.as_deref(), reasoning_effort)
                .map(|()| ResponseBody::Ok),
            RequestOp::ChatForceUnlock { chat_id } => {
                app.chat_force_unlock(&chat_id).map(|()| ResponseBody::Ok)
            }
            RequestOp::SearchChats { query } => app
                .search_chats(&query)
                .map(|results| ResponseBody::SearchResults { results }),
            RequestOp::AddSystemMessage { text } => {
                app.add_system_message(&text).map(|()| ResponseBody::Ok)
            }

            RequestOp::ContextAdd {
                path,
                content,
                readonly,
            } => app
                .context_add(&path, content.as_deref(), readonly)
                .map(|_| ResponseBody::Ok),
            RequestOp::ContextAddSection {
                path,
                start_line,
                end_line,
                content,
            } => app
                .context_add_section(&path, start_line, end_line, content.as_deref())
                .map(|_| ResponseBody::Ok),
            RequestOp::ContextUpdate { path, content } => app
                .context_update(&path, content.as_deref())
                .map(|()| ResponseBody::Ok),
            RequestOp::ContextSetReadonly { path, readonly } => app
                .context_set_readonly(&path, readonly)
                .map(|()| ResponseBody::Ok),
            RequestOp::ContextRemove { path } => {
                app.context_remove(&path).map(|()| ResponseBody::Ok)
            }
            RequestOp::ContextRemoveSection {
                path,
                start_line,
                end_line,
            } => app
                .context_remove_section(&path, start_line, end_line)
                .map(|()| ResponseBody::Ok),
            RequestOp::ContextList => app
                .context_list()
                .map(|files| ResponseBody::ContextList { files }),
            RequestOp::GetContextFile {
                path,
                start_line,
                end_line,
            } => app
                .get_context_file(&path, start_line, end_line)
                .map(|(path, content)| ResponseBody::FileContent { path, content }),
            RequestOp::GetOutputFile { path } => app
                .get_output_file(&path)
                .map(|(path, content)| ResponseBody::FileContent { path, content }),
            RequestOp::OutputDelete { path } => {
                app.output_delete(&path).map(|()| ResponseBody::Ok)
            }
            RequestOp::GetFileStatuses => app
                .get_file_statuses()
                .map(|files| ResponseBody::FileStatuses { files }),
            RequestOp::GetDiffPaths { path } => app
                .get_diff_paths(&path)
                .map(|paths| ResponseBody::DiffPaths { paths }),
            RequestOp::ApplyFile { path } => app.apply_file(&path).map(|()| ResponseBody::Ok),
            RequestOp::ApplyFileAs { path, destination } => app
                .apply_file_as(&path, &destination)
                .map(|()| ResponseBody::Ok),
            RequestOp::SyncContext { path } => {
                app.sync_context(&path).map(|()| ResponseBody::Ok)
            }
            RequestOp::DiffLocalDone { path } => {
                app.diff_local_done(&path).map(|_| ResponseBody::Ok)
            }

            RequestOp::EstimateTokens => app
                .estimate_chat_tokens()
                .map(|tokens| ResponseBody::TokenEstimate { tokens }),
            RequestOp::EstimateTextTokens { text } => Ok(ResponseBody::TextTokenEstimate {
                tokens: estimate_tokens(&text),
            }),
            RequestOp::GetCustomizationInfo => app.customization_info().map(
                |(instructions_path, instructions_exists, system_prompt_path, system_prompt_exists)| {
                    ResponseBody::CustomizationInfo {
                        instructions_path,
                        instructions_exists,
                        system_prompt_path,
                        system_prompt_exists,
                    }
                },
            ),
            RequestOp::PrepareInstructions => app
                .prepare_instructions()
                .map(|path| ResponseBody::InstructionsPath { path }),

            // Handled in `dispatch`.
            RequestOp::Ping
            | RequestOp::Version
            | RequestOp::Shutdown
            | RequestOp::Cancel { .. }
            | RequestOp::Send { .. }
            | RequestOp::GenerateTitle
            | RequestOp::GetBalance
            | RequestOp::GetModels => Ok(ResponseBody::Ok),
        };
        match result {
            Ok(body) => body,
            Err(e) => err_body(&e),
        }
    }

    async fn send(&self, request_id: Option<RequestId>, body: ResponseBody) {
        let resp = Response::new(request_id, body);
        if self.outgoing.send(resp).await.is_err() {
            warn!("outgoing channel closed; dropping response");
        }
    }
}

fn err_body(e: &Bb7Err) -> ResponseBody {
    ResponseBody::Error {
        message: e.ui_message(),
    }
}
