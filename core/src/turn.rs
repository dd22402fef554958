// Poisoned slot mutex should fail the program
#![allow(clippy::unwrap_used)]

//! Turn orchestrator.
//!
//! At most one turn is in flight per process: [`StreamSlot`] is the
//! single-slot descriptor the dispatcher reserves before spawning a
//! turn, and `cancel` requests resolve against it. The turn itself
//! acquires the state lock only around discrete reads and writes; the
//! streaming HTTP call runs with no lock held so read-only actions stay
//! responsive.
//!
//! Pending writes live in memory for the duration of the turn and hit
//! the output tree only on commit (success, or cancel with zero diff
//! errors). Failed edits accumulate and, when the diff mode allows it,
//! feed exactly one hidden repair retry in which the model edits its own
//! partial result.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Instant;

use futures::StreamExt;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use bb7_protocol::Chat;
use bb7_protocol::ContextAction;
use bb7_protocol::ContextEvent;
use bb7_protocol::DiffErrorDetail;
use bb7_protocol::DiffMode;
use bb7_protocol::Message;
use bb7_protocol::MessagePart;
use bb7_protocol::ReasoningEffort;
use bb7_protocol::RequestId;
use bb7_protocol::Response;
use bb7_protocol::ResponseBody;
use bb7_protocol::Role;
use bb7_protocol::TokenUsage;

use crate::client_common::ChatRequest;
use crate::client_common::StreamEvent;
use crate::client_common::ToolCall;
use crate::context::ContextEngine;
use crate::diff;
use crate::diff::AnchoredArgs;
use crate::diff::SearchReplaceArgs;
use crate::diff::SearchReplaceMultiArgs;
use crate::diff::WriteFileArgs;
use crate::error::Bb7Err;
use crate::error::Result;
use crate::hash::short_id;
use crate::instructions;
use crate::output::OutputEngine;
use crate::prompt::BASE_SYSTEM_PROMPT;
use crate::prompt::PromptBuilder;
use crate::prompt::RetryContext;
use crate::prompt::tool_definitions;
use crate::prompt::tool_prompt;
use crate::session::App;
use crate::store::ChatStore;

pub type Outgoing = mpsc::Sender<Response>;

/// The single in-flight turn descriptor.
#[derive(Default)]
pub struct StreamSlot {
    inner: Mutex<Option<ActiveTurn>>,
}

struct ActiveTurn {
    request_id: String,
    token: CancellationToken,
    canceled: bool,
}

impl StreamSlot {
    /// Atomically claim the slot for `request_id`.
    pub fn reserve(&self, request_id: &str) -> Result<CancellationToken> {
        let mut inner = self.inner.lock().unwrap();
        if inner.is_some() {
            return Err(Bb7Err::RequestInProgress);
        }
        let token = CancellationToken::new();
        *inner = Some(ActiveTurn {
            request_id: request_id.to_string(),
            token: token.clone(),
            canceled: false,
        });
        Ok(token)
    }

    /// Cancel the active turn; an empty/absent target matches any.
    pub fn cancel(&self, target: Option<&str>) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.as_mut() {
            Some(turn)
                if target.is_none_or(|t| t.is_empty() || t == turn.request_id) =>
            {
                turn.canceled = true;
                turn.token.cancel();
                true
            }
            _ => false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.inner.lock().unwrap().is_some()
    }

    pub fn was_canceled(&self, request_id: &str) -> bool {
        let inner = self.inner.lock().unwrap();
        inner
            .as_ref()
            .is_some_and(|turn| turn.request_id == request_id && turn.canceled)
    }

    /// Cancellation handle of the active turn, when `request_id` owns it.
    pub fn token_for(&self, request_id: &str) -> Option<CancellationToken> {
        let inner = self.inner.lock().unwrap();
        inner
            .as_ref()
            .filter(|turn| turn.request_id == request_id)
            .map(|turn| turn.token.clone())
    }

    /// Release the slot, but only if it still belongs to `request_id`.
    pub fn clear(&self, request_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        if inner
            .as_ref()
            .is_some_and(|turn| turn.request_id == request_id)
        {
            *inner = None;
        }
    }
}

struct Emitter {
    outgoing: Outgoing,
    request_id: Option<RequestId>,
}

impl Emitter {
    async fn emit(&self, body: ResponseBody) {
        let resp = Response::new(self.request_id.clone(), body);
        if self.outgoing.send(resp).await.is_err() {
            warn!("response channel closed while emitting turn event");
        }
    }
}

/// In-memory state of one streaming attempt.
#[derive(Default)]
struct TurnState {
    content: String,
    thinking: String,
    pending_writes: HashMap<String, String>,
    /// Paths in first-write order, for `output_files` and commit order.
    write_order: Vec<String>,
    /// Pinned per-path file_id for the multi-edit form.
    pinned_ids: HashMap<String, String>,
    diff_errors: Vec<DiffErrorDetail>,
    tool_calls: Vec<serde_json::Value>,
    usage: Option<TokenUsage>,
    stream_error: Option<String>,
    canceled: bool,
}

impl TurnState {
    fn note_write(&mut self, path: &str, content: String) {
        if !self.pending_writes.contains_key(path) {
            self.write_order.push(path.to_string());
        }
        self.pending_writes.insert(path.to_string(), content);
    }

    fn has_output(&self) -> bool {
        !self.content.is_empty() || !self.thinking.is_empty() || !self.pending_writes.is_empty()
    }
}

/// Everything `run_send` resolves once at the start of the turn.
struct TurnPlan {
    chat: Chat,
    store: ChatStore,
    project_root: Option<std::path::PathBuf>,
    model: String,
    diff_mode: DiffMode,
    effort: Option<ReasoningEffort>,
    system_prompt: String,
}

/// Entry point: the dispatcher has already reserved the stream slot and
/// spawns this as a task. Exactly one terminal response (`done`,
/// `error`, or `diff_error`) is emitted before the slot is cleared.
pub async fn run_send(
    app: Arc<App>,
    outgoing: Outgoing,
    request_id: Option<RequestId>,
    text: String,
    model_override: Option<String>,
    effort_override: Option<ReasoningEffort>,
) {
    let slot_key = request_id
        .as_ref()
        .map(|r| r.0.clone())
        .unwrap_or_default();
    let emitter = Emitter {
        outgoing: outgoing.clone(),
        request_id,
    };

    let started = Instant::now();
    if let Err(e) = run_send_inner(
        &app,
        &outgoing,
        &emitter,
        &slot_key,
        started,
        text,
        model_override,
        effort_override,
    )
    .await
    {
        emitter
            .emit(ResponseBody::Error {
                message: e.ui_message(),
            })
            .await;
    }
    app.slot.clear(&slot_key);
}

#[allow(clippy::too_many_arguments)]
async fn run_send_inner(
    app: &Arc<App>,
    outgoing: &Outgoing,
    emitter: &Emitter,
    slot_key: &str,
    started: Instant,
    text: String,
    model_override: Option<String>,
    effort_override: Option<ReasoningEffort>,
) -> Result<()> {
    let plan = prepare_turn(app, text, model_override, effort_override)?;
    let TurnPlan {
        mut chat,
        store,
        project_root,
        model,
        diff_mode,
        effort,
        system_prompt,
    } = plan;
    let token = app
        .slot
        .token_for(slot_key)
        .unwrap_or_else(CancellationToken::new);

    let builder = PromptBuilder::new(&store, project_root.as_deref());
    let built = builder.build(&mut chat, diff_mode, None, None)?;
    // Persist the user message (and any re-hashed versions) before the
    // request leaves the process.
    app.commit_chat(chat.clone())?;

    let request = ChatRequest {
        model: model.clone(),
        system_prompt: system_prompt.clone(),
        user_message: built.body,
        reasoning_effort: effort,
        tools: tool_definitions(diff_mode),
    };
    app.debug.record(
        "llm_request",
        json!({"model": model, "diff_mode": diff_mode.to_string()}),
    );

    let events = app.client.stream(&request).await?;
    let mut turn = TurnState::default();
    consume_stream(
        app,
        emitter,
        &token,
        events,
        &mut turn,
        diff_mode,
        &chat,
        &store,
        project_root.as_deref(),
        true,
    )
    .await;

    let canceled = turn.canceled || app.slot.was_canceled(slot_key);

    if canceled {
        finish_canceled(app, emitter, &mut chat, &store, project_root.as_deref(), turn, &model)
            .await;
        return Ok(());
    }

    if let Some(message) = turn.stream_error.take() {
        let mut msg = Message::new(Role::System);
        msg.parts.push(MessagePart::Text {
            content: format!("Stream error: {message}"),
        });
        chat.messages.push(msg);
        if let Err(e) = app.commit_chat(chat.clone()) {
            warn!("failed to persist stream-error message: {e}");
        }
        emitter.emit(ResponseBody::Error { message }).await;
        return Ok(());
    }

    if !turn.diff_errors.is_empty() {
        let retry_eligible =
            diff_mode.supports_repair_retry() && app.config.auto_retry_partial_edits;
        if !retry_eligible {
            emit_diff_error(emitter, &turn).await;
            return Ok(());
        }
        match run_repair_retry(
            app,
            emitter,
            &token,
            slot_key,
            &mut chat,
            &store,
            project_root.as_deref(),
            diff_mode,
            &model,
            &system_prompt,
            &mut turn,
        )
        .await?
        {
            RetryOutcome::Repaired => {}
            RetryOutcome::Canceled => {
                finish_canceled(
                    app,
                    emitter,
                    &mut chat,
                    &store,
                    project_root.as_deref(),
                    turn,
                    &model,
                )
                .await;
                return Ok(());
            }
            RetryOutcome::Failed => {
                emit_diff_error(emitter, &turn).await;
                return Ok(());
            }
        }
    }

    // Success: commit the buffered writes, then the assistant message.
    let committed = commit_pending_writes(&chat, &store, project_root.as_deref(), &turn)?;
    let first_assistant_turn = !chat
        .messages
        .iter()
        .any(|m| m.role == Role::Assistant);
    append_assistant_message(&mut chat, &turn, &model, effort, &committed);
    app.commit_chat(chat.clone())?;

    let duration_ms = started.elapsed().as_millis() as u64;
    emitter
        .emit(ResponseBody::Done {
            usage: turn.usage,
            duration_ms,
        })
        .await;
    info!("turn complete in {duration_ms}ms");

    if first_assistant_turn {
        let app = Arc::clone(app);
        let outgoing = outgoing.clone();
        tokio::spawn(async move {
            if let Err(e) = generate_title(app, outgoing, None).await {
                warn!("title generation failed: {e}");
            }
        });
    }
    Ok(())
}

fn prepare_turn(
    app: &App,
    text: String,
    model_override: Option<String>,
    effort_override: Option<ReasoningEffort>,
) -> Result<TurnPlan> {
    let inputs = app.turn_inputs()?;
    let mut chat = inputs.chat;

    // Request > chat > config default.
    let model = model_override
        .or_else(|| chat.model.clone())
        .unwrap_or_else(|| app.config.default_model.clone());
    let diff_mode = if chat.global {
        DiffMode::None
    } else {
        app.config.diff_mode
    };
    let effort = effort_override.or(chat.reasoning_effort);

    let mut system_prompt = instructions::load_system_prompt_override()?
        .unwrap_or_else(|| BASE_SYSTEM_PROMPT.to_string());
    if let Some(root) = &inputs.project_root
        && let Some(project_instructions) = instructions::load_project_instructions(root)?
    {
        system_prompt.push_str("\n-- instructions --\n");
        system_prompt.push_str(&project_instructions);
    }
    let tools_prompt = tool_prompt(diff_mode);
    if !tools_prompt.is_empty() {
        system_prompt.push('\n');
        system_prompt.push_str(tools_prompt);
    }

    let user_text = if text.is_empty() {
        chat.draft.clone()
    } else {
        text
    };
    let mut msg = Message::new(Role::User);
    msg.parts.push(MessagePart::Text { content: user_text });
    msg.context_snapshot = Some(chat.snapshot_refs());
    msg.model = Some(model.clone());
    msg.reasoning_effort = effort;
    chat.messages.push(msg);
    chat.draft = String::new();

    Ok(TurnPlan {
        chat,
        store: inputs.store,
        project_root: inputs.project_root,
        model,
        diff_mode,
        effort,
        system_prompt,
    })
}

#[allow(clippy::too_many_arguments)]
async fn consume_stream(
    app: &App,
    emitter: &Emitter,
    token: &CancellationToken,
    mut events: crate::client_common::EventStream,
    turn: &mut TurnState,
    diff_mode: DiffMode,
    chat: &Chat,
    store: &ChatStore,
    project_root: Option<&std::path::Path>,
    forward_to_ui: bool,
) {
    loop {
        let next = tokio::select! {
            _ = token.cancelled() => {
                turn.canceled = true;
                break;
            }
            next = events.next() => next,
        };
        match next {
            Some(Ok(StreamEvent::Content(delta))) => {
                turn.content.push_str(&delta);
                if forward_to_ui {
                    emitter.emit(ResponseBody::Chunk { content: delta }).await;
                }
            }
            Some(Ok(StreamEvent::Reasoning(delta))) => {
                turn.thinking.push_str(&delta);
                if forward_to_ui {
                    emitter
                        .emit(ResponseBody::Thinking { content: delta })
                        .await;
                }
            }
            Some(Ok(StreamEvent::ToolCall(call))) => {
                app.debug
                    .record("tool_call", json!({"name": call.name, "args": call.arguments}));
                if let Some(note) =
                    handle_tool_call(turn, diff_mode, chat, store, project_root, &call)
                    && forward_to_ui
                {
                    emitter.emit(ResponseBody::Chunk { content: note }).await;
                }
                if turn.stream_error.is_some() {
                    break;
                }
            }
            Some(Ok(StreamEvent::Done { usage })) => {
                match (&mut turn.usage, usage) {
                    (Some(total), Some(u)) => total.merge(&u),
                    (slot @ None, Some(u)) => *slot = Some(u),
                    _ => {}
                }
                break;
            }
            Some(Err(e)) => {
                // The first terminal error wins.
                turn.stream_error = Some(e.ui_message());
                break;
            }
            None => break,
        }
    }
}

/// Interpret one completed tool call. Returns a UI note for forwarded
/// writes; terminal failures land in `turn.stream_error`.
fn handle_tool_call(
    turn: &mut TurnState,
    diff_mode: DiffMode,
    chat: &Chat,
    store: &ChatStore,
    project_root: Option<&std::path::Path>,
    call: &ToolCall,
) -> Option<String> {
    turn.tool_calls.push(json!({
        "name": call.name,
        "arguments": call.arguments,
    }));
    let output = OutputEngine::new(store, project_root);

    match call.name.as_str() {
        "write_file" => {
            let args: WriteFileArgs = match serde_json::from_str(&call.arguments) {
                Ok(args) => args,
                Err(e) => {
                    turn.stream_error = Some(format!("malformed write_file arguments: {e}"));
                    return None;
                }
            };
            match validate_write_target(turn, chat, &output, &args.path, true) {
                Ok(rel) => {
                    let existed = base_for(turn, chat, store, project_root, &rel).is_some();
                    turn.note_write(&rel, args.content);
                    let verb = if existed { "Modified" } else { "Added" };
                    Some(format!("\n[{verb} {rel}]\n"))
                }
                Err(e) => {
                    turn.stream_error = Some(e.ui_message());
                    None
                }
            }
        }
        "edit_file" => match diff_mode {
            DiffMode::SearchReplace => {
                let args: SearchReplaceArgs = match serde_json::from_str(&call.arguments) {
                    Ok(args) => args,
                    Err(e) => {
                        turn.stream_error = Some(format!("malformed edit_file arguments: {e}"));
                        return None;
                    }
                };
                apply_single_edit(turn, chat, store, project_root, &output, &args, false);
                None
            }
            DiffMode::SearchReplaceMulti => {
                let args: SearchReplaceMultiArgs = match serde_json::from_str(&call.arguments) {
                    Ok(args) => args,
                    Err(e) => {
                        turn.stream_error = Some(format!("malformed edit_file arguments: {e}"));
                        return None;
                    }
                };
                for edit in &args.edits {
                    apply_single_edit(turn, chat, store, project_root, &output, edit, true);
                    if turn.stream_error.is_some() {
                        break;
                    }
                }
                None
            }
            DiffMode::Anchored => {
                let args: AnchoredArgs = match serde_json::from_str(&call.arguments) {
                    Ok(args) => args,
                    Err(e) => {
                        turn.stream_error = Some(format!("malformed edit_file arguments: {e}"));
                        return None;
                    }
                };
                apply_anchored_edit(turn, chat, store, project_root, &output, &args);
                None
            }
            DiffMode::WriteFile | DiffMode::None => {
                turn.stream_error =
                    Some(format!("edit_file is not available in {diff_mode} mode"));
                None
            }
        },
        other => {
            turn.stream_error = Some(format!("unknown tool: {other}"));
            None
        }
    }
}

/// Normalize and guard a model-supplied write target. Duplicate
/// `write_file` paths within one turn are terminal when `dedup` is set.
fn validate_write_target(
    turn: &TurnState,
    chat: &Chat,
    output: &OutputEngine<'_>,
    path: &str,
    dedup: bool,
) -> Result<String> {
    if chat.global {
        return Err(Bb7Err::GlobalReadOnly);
    }
    let rel = output.normalize(path)?;
    // Lexical escape check up front; the symlink-resolving guard runs
    // again when the buffer is committed.
    output.resolve_fs_path(&chat.id, &rel)?;
    if dedup && turn.pending_writes.contains_key(&rel) {
        return Err(Bb7Err::InvalidRequest(format!(
            "duplicate write_file for {rel} in one turn"
        )));
    }
    if let Some(cf) = chat.find_context_file(&rel) {
        if cf.external {
            return Err(Bb7Err::ExternalReadOnly(rel));
        }
        if cf.readonly {
            return Err(Bb7Err::ReadOnly(rel));
        }
    }
    Ok(rel)
}

/// Base bytes an edit applies against: pending turn buffer, then staged
/// output, then the context snapshot.
fn base_for(
    turn: &TurnState,
    chat: &Chat,
    store: &ChatStore,
    project_root: Option<&std::path::Path>,
    rel: &str,
) -> Option<String> {
    if let Some(pending) = turn.pending_writes.get(rel) {
        return Some(pending.clone());
    }
    let output = OutputEngine::new(store, project_root);
    if let Ok(content) = output.read(&chat.id, rel) {
        return Some(content);
    }
    let context = ContextEngine::new(store, project_root);
    let cf = chat.find_context_file(rel)?;
    context.get(chat, cf).ok()
}

fn apply_single_edit(
    turn: &mut TurnState,
    chat: &Chat,
    store: &ChatStore,
    project_root: Option<&std::path::Path>,
    output: &OutputEngine<'_>,
    edit: &SearchReplaceArgs,
    pin_ids: bool,
) {
    let rel = match validate_write_target(turn, chat, output, &edit.path, false) {
        Ok(rel) => rel,
        Err(e) => {
            turn.stream_error = Some(e.ui_message());
            return;
        }
    };
    let Some(base) = base_for(turn, chat, store, project_root, &rel) else {
        // Editing a file the model was never shown is a terminal error,
        // not a repairable diff failure.
        turn.stream_error = Some(format!("edit_file target has no base: {rel}"));
        return;
    };

    // The multi form pins the first-quoted id per path so later edits in
    // the same call keep validating against the base the model saw. The
    // single form always checks the current base; two single edits to
    // one path in one turn therefore need the updated id.
    let expected = if pin_ids {
        turn.pinned_ids
            .entry(rel.clone())
            .or_insert_with(|| short_id(&rel, &base))
            .clone()
    } else {
        short_id(&rel, &base)
    };
    if let Err(e) = diff::check_file_id(&expected, &edit.file_id) {
        turn.diff_errors.push(DiffErrorDetail {
            path: rel,
            message: e.to_string(),
        });
        return;
    }

    match diff::apply_search_replace(&base, &edit.old_string, &edit.new_string, edit.replace_all)
    {
        Ok(updated) => turn.note_write(&rel, updated),
        Err(e) => turn.diff_errors.push(DiffErrorDetail {
            path: rel,
            message: e.to_string(),
        }),
    }
}

fn apply_anchored_edit(
    turn: &mut TurnState,
    chat: &Chat,
    store: &ChatStore,
    project_root: Option<&std::path::Path>,
    output: &OutputEngine<'_>,
    args: &AnchoredArgs,
) {
    // Two anchored calls for one path in a turn would each carry line
    // numbers over a different base; treat the duplicate as terminal.
    let rel = match validate_write_target(turn, chat, output, &args.path, true) {
        Ok(rel) => rel,
        Err(e) => {
            turn.stream_error = Some(e.ui_message());
            return;
        }
    };
    let Some(base) = base_for(turn, chat, store, project_root, &rel) else {
        turn.stream_error = Some(format!("edit_file target has no base: {rel}"));
        return;
    };

    let expected = short_id(&rel, &base);
    if let Err(e) = diff::check_file_id(&expected, &args.file_id) {
        turn.diff_errors.push(DiffErrorDetail {
            path: rel,
            message: e.to_string(),
        });
        return;
    }

    match diff::apply_anchored(&base, &args.changes) {
        Ok(updated) => turn.note_write(&rel, updated),
        Err(e) => turn.diff_errors.push(DiffErrorDetail {
            path: rel,
            message: e.to_string(),
        }),
    }
}

enum RetryOutcome {
    Repaired,
    Failed,
    Canceled,
}

/// The hidden repair retry: one extra streaming call against the first
/// attempt's partial result. UI deltas are suppressed; usage merges into
/// the turn totals; tool calls append to the audit log.
#[allow(clippy::too_many_arguments)]
async fn run_repair_retry(
    app: &App,
    emitter: &Emitter,
    token: &CancellationToken,
    slot_key: &str,
    chat: &mut Chat,
    store: &ChatStore,
    project_root: Option<&std::path::Path>,
    diff_mode: DiffMode,
    model: &str,
    system_prompt: &str,
    turn: &mut TurnState,
) -> Result<RetryOutcome> {
    info!(
        "repair retry: {} edit(s) failed on first attempt",
        turn.diff_errors.len()
    );
    let preserved = turn.pending_writes.clone();
    let retry_context = RetryContext {
        errors: turn.diff_errors.clone(),
        tool_calls: turn.tool_calls.clone(),
    };

    let mut scratch = chat.clone();
    let built = PromptBuilder::new(store, project_root).build(
        &mut scratch,
        diff_mode,
        Some(&retry_context),
        Some(&preserved),
    )?;

    let request = ChatRequest {
        model: model.to_string(),
        system_prompt: system_prompt.to_string(),
        user_message: built.body,
        // No reasoning on the repair pass.
        reasoning_effort: None,
        tools: tool_definitions(diff_mode),
    };
    app.debug.record("llm_retry_request", json!({"model": model}));

    let events = app.client.stream(&request).await?;
    let mut retry_turn = TurnState {
        pending_writes: preserved.clone(),
        write_order: turn.write_order.clone(),
        ..TurnState::default()
    };
    consume_stream(
        app,
        emitter,
        token,
        events,
        &mut retry_turn,
        diff_mode,
        chat,
        store,
        project_root,
        false,
    )
    .await;

    // Both attempts' calls stay in the audit log.
    turn.tool_calls.extend(retry_turn.tool_calls.clone());
    match (&mut turn.usage, retry_turn.usage) {
        (Some(total), Some(u)) => total.merge(&u),
        (slot @ None, Some(u)) => *slot = Some(u),
        _ => {}
    }
    if !retry_turn.content.is_empty() {
        turn.content.push_str(&retry_turn.content);
    }

    if retry_turn.canceled || app.slot.was_canceled(slot_key) {
        turn.canceled = true;
        return Ok(RetryOutcome::Canceled);
    }
    if let Some(message) = retry_turn.stream_error {
        turn.diff_errors.push(DiffErrorDetail {
            path: String::new(),
            message: format!("retry attempt: {message}"),
        });
        return Ok(RetryOutcome::Failed);
    }
    if !retry_turn.diff_errors.is_empty() {
        for e in retry_turn.diff_errors {
            turn.diff_errors.push(DiffErrorDetail {
                path: e.path,
                message: format!("retry attempt: {}", e.message),
            });
        }
        return Ok(RetryOutcome::Failed);
    }

    turn.pending_writes = retry_turn.pending_writes;
    turn.write_order = retry_turn.write_order;
    turn.diff_errors.clear();
    Ok(RetryOutcome::Repaired)
}

async fn emit_diff_error(emitter: &Emitter, turn: &TurnState) {
    emitter
        .emit(ResponseBody::DiffError {
            message: "One or more edits failed to apply".to_string(),
            errors: turn.diff_errors.clone(),
            tool_calls: turn.tool_calls.clone(),
        })
        .await;
}

struct CommittedWrite {
    path: String,
    version: String,
    added: bool,
    readonly: Option<bool>,
    external: Option<bool>,
}

fn commit_pending_writes(
    chat: &Chat,
    store: &ChatStore,
    project_root: Option<&std::path::Path>,
    turn: &TurnState,
) -> Result<Vec<CommittedWrite>> {
    let output = OutputEngine::new(store, project_root);
    let mut committed = Vec::new();
    for path in &turn.write_order {
        let Some(content) = turn.pending_writes.get(path) else {
            continue;
        };
        output.write(chat, path, content)?;
        let cf = chat.find_context_file(path);
        committed.push(CommittedWrite {
            path: path.clone(),
            version: short_id(path, content),
            added: cf.is_none(),
            readonly: cf.map(|cf| cf.readonly),
            external: cf.map(|cf| cf.external),
        });
        debug!("committed pending write: {path}");
    }
    Ok(committed)
}

fn append_assistant_message(
    chat: &mut Chat,
    turn: &TurnState,
    model: &str,
    effort: Option<ReasoningEffort>,
    committed: &[CommittedWrite],
) {
    let mut msg = Message::new(Role::Assistant);
    msg.model = Some(model.to_string());
    msg.usage = turn.usage;
    msg.reasoning_effort = effort;
    if !turn.thinking.is_empty() {
        msg.parts.push(MessagePart::Thinking {
            content: turn.thinking.clone(),
        });
    }
    if !turn.content.is_empty() {
        msg.parts.push(MessagePart::Text {
            content: turn.content.clone(),
        });
    }
    for write in committed {
        let mut event = ContextEvent::new(ContextAction::AssistantWriteFile, &write.path);
        event.version = Some(write.version.clone());
        event.added = write.added.then_some(true);
        event.readonly = write.readonly;
        event.external = write.external.filter(|e| *e);
        msg.parts.push(MessagePart::ContextEvent { event });
    }
    if !committed.is_empty() {
        msg.output_files = Some(committed.iter().map(|w| w.path.clone()).collect());
    }
    chat.messages.push(msg);
}

/// Cancelled unwind: commit the buffer only when no diff errors
/// accumulated, persist a partial assistant message if anything was
/// produced, and answer with the fixed abort message.
async fn finish_canceled(
    app: &App,
    emitter: &Emitter,
    chat: &mut Chat,
    store: &ChatStore,
    project_root: Option<&std::path::Path>,
    turn: TurnState,
    model: &str,
) {
    let committed = if turn.diff_errors.is_empty() && !turn.pending_writes.is_empty() {
        match commit_pending_writes(chat, store, project_root, &turn) {
            Ok(committed) => committed,
            Err(e) => {
                warn!("failed to commit writes on cancel: {e}");
                Vec::new()
            }
        }
    } else {
        Vec::new()
    };

    if turn.has_output() {
        append_assistant_message(chat, &turn, model, None, &committed);
        if let Err(e) = app.commit_chat(chat.clone()) {
            warn!("failed to persist partial message: {e}");
        }
    }
    emitter
        .emit(ResponseBody::Error {
            message: Bb7Err::Canceled.ui_message(),
        })
        .await;
}

/// Generate (or regenerate) the chat title with the cheap title model and
/// broadcast `title_updated`. Used both after the first turn and for the
/// explicit `generate_title` action.
pub async fn generate_title(
    app: Arc<App>,
    outgoing: Outgoing,
    request_id: Option<RequestId>,
) -> Result<()> {
    let Some(chat) = app.active_chat() else {
        return Err(Bb7Err::NoActiveChat);
    };
    let user_text = chat
        .messages
        .iter()
        .find(|m| m.role == Role::User)
        .map(|m| m.text())
        .unwrap_or_default();
    let assistant_text = chat
        .messages
        .iter()
        .find(|m| m.role == Role::Assistant)
        .map(|m| m.text())
        .unwrap_or_default();

    let request = ChatRequest {
        model: app.config.title_model.clone(),
        system_prompt: "Reply with a short title (at most six words) for the \
                        conversation. Output the title only: no quotes, no \
                        trailing punctuation."
            .to_string(),
        user_message: format!(
            "User: {}\n\nAssistant: {}",
            truncate(&user_text, 2000),
            truncate(&assistant_text, 2000)
        ),
        reasoning_effort: None,
        tools: Vec::new(),
    };
    let raw = app.client.complete(&request).await?;
    let title = raw.trim().trim_matches('"').trim();
    if title.is_empty() {
        return Ok(());
    }
    let name = truncate(title, 80).to_string();

    let chat_id = chat.id.clone();
    app.rename_if_active(&chat_id, &name)?;
    let resp = Response::new(
        request_id,
        ResponseBody::TitleUpdated {
            chat_id,
            name,
        },
    );
    if outgoing.send(resp).await.is_err() {
        warn!("response channel closed while emitting title update");
    }
    Ok(())
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
