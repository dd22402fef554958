//! Application context and request handlers.
//!
//! All package-level state is carried explicitly in [`App`]: the state
//! engine behind one mutex, the HTTP client, the config snapshot, the
//! single-slot stream descriptor, the lock manager and the debug log.
//! Handlers lock the state for the duration of a mutating action and
//! never hold it across network I/O.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;

use tracing::warn;

use bb7_protocol::Chat;
use bb7_protocol::ChatSummary;
use bb7_protocol::ContextAction;
use bb7_protocol::ContextEvent;
use bb7_protocol::ContextFile;
use bb7_protocol::DiffPaths;
use bb7_protocol::FileStatusEntry;
use bb7_protocol::ForkWarning;
use bb7_protocol::Message;
use bb7_protocol::MessagePart;
use bb7_protocol::ReasoningEffort;
use bb7_protocol::Role;
use bb7_protocol::SearchResult;

use crate::client::ModelClient;
use crate::config::Config;
use crate::config::system_prompt_override_path;
use crate::context::ContextEngine;
use crate::debug_log::DebugLog;
use crate::error::Bb7Err;
use crate::error::Result;
use crate::fork::ForkEngine;
use crate::instructions;
use crate::lock::LockManager;
use crate::output::OutputEngine;
use crate::prompt::PromptBuilder;
use crate::status::DiffLocalOutcome;
use crate::status::StatusEngine;
use crate::store::ChatStore;
use crate::turn::StreamSlot;
use crate::util::estimate_tokens;

pub struct App {
    pub config: Config,
    pub client: ModelClient,
    pub debug: DebugLog,
    pub locks: LockManager,
    pub slot: StreamSlot,
    state: Mutex<AppState>,
}

#[derive(Default)]
struct AppState {
    project_root: Option<PathBuf>,
    project_store: Option<ChatStore>,
    global_store: Option<ChatStore>,
    active: Option<Chat>,
}

impl App {
    pub fn new(config: Config, client: ModelClient, debug: DebugLog) -> Self {
        let global_store = ChatStore::global(&config.bb7_home);
        Self {
            config,
            client,
            debug,
            locks: LockManager::new(),
            slot: StreamSlot::default(),
            state: Mutex::new(AppState {
                project_root: None,
                project_store: None,
                global_store: Some(global_store),
                active: None,
            }),
        }
    }

    // Poisoned state is unrecoverable; aborting is the right response.
    #[allow(clippy::unwrap_used)]
    fn lock_state(&self) -> std::sync::MutexGuard<'_, AppState> {
        self.state.lock().unwrap()
    }

    /// Runs `f` with the state locked. Handlers use this so no guard can
    /// accidentally live across an await point.
    fn with_state<T>(&self, f: impl FnOnce(&mut AppState) -> Result<T>) -> Result<T> {
        let mut state = self.lock_state();
        f(&mut state)
    }

    // ------------------------------------------------------------------
    // Project lifecycle
    // ------------------------------------------------------------------

    pub fn bb7_init(&self, path: &str) -> Result<()> {
        let root = PathBuf::from(path);
        let marker = root.join(".bb7");
        if marker.exists() {
            return Err(Bb7Err::AlreadyInit);
        }
        std::fs::create_dir_all(marker.join("chats"))?;
        Ok(())
    }

    pub fn init(&self, path: &str) -> Result<()> {
        let root = PathBuf::from(path)
            .canonicalize()
            .map_err(|_| Bb7Err::NotBb7Project)?;
        if !root.join(".bb7").is_dir() {
            return Err(Bb7Err::NotBb7Project);
        }
        let store = ChatStore::project(&root);

        let mut state = self.lock_state();
        if let Some(prev) = state.active.take() {
            let prev_store = store_for(&state, &prev)?;
            self.locks.release(&prev_store.chat_dir(&prev.id));
        }
        state.project_root = Some(root);
        state.project_store = Some(store.clone());

        // Restore the previously active chat when its lock is available.
        if let Some(id) = store.active_chat_id() {
            match store.load(&id) {
                Ok(chat) => match self.locks.acquire(&store.chat_dir(&id)) {
                    Ok(()) => state.active = Some(chat),
                    Err(e) => warn!("not restoring active chat {id}: {e}"),
                },
                Err(e) => warn!("failed to load active chat {id}: {e}"),
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Chat lifecycle
    // ------------------------------------------------------------------

    pub fn chat_new(&self, name: Option<&str>, global: bool) -> Result<Chat> {
        self.with_state(|state| {
            let store = if global {
                state
                    .global_store
                    .clone()
                    .ok_or(Bb7Err::NotInitialized)?
            } else {
                state.project_store.clone().ok_or(Bb7Err::NotInitialized)?
            };
            std::fs::create_dir_all(store.chats_dir())?;
            let chat = store.create(name.unwrap_or("New chat"))?;
            self.activate(state, &store, chat.clone())?;
            Ok(chat)
        })
    }

    pub fn chat_select(&self, chat_id: &str) -> Result<Chat> {
        self.with_state(|state| {
            let store = self.find_store_for_id(state, chat_id)?;
            let chat = store.load(chat_id)?;
            self.activate(state, &store, chat.clone())?;
            Ok(chat)
        })
    }

    /// Swap the lock from the previous active chat to `chat` and record
    /// it as active in its store's index.
    fn activate(&self, state: &mut AppState, store: &ChatStore, chat: Chat) -> Result<()> {
        self.locks.acquire(&store.chat_dir(&chat.id))?;
        if let Some(prev) = state.active.take()
            && prev.id != chat.id
            && let Ok(prev_store) = store_for(state, &prev)
        {
            self.locks.release(&prev_store.chat_dir(&prev.id));
        }
        store.set_active(Some(&chat.id));
        state.active = Some(chat);
        Ok(())
    }

    pub fn chat_delete(&self, chat_id: &str) -> Result<()> {
        self.with_state(|state| {
            let store = self.find_store_for_id(state, chat_id)?;
            if state
                .active
                .as_ref()
                .is_some_and(|chat| chat.id == chat_id)
            {
                state.active = None;
            }
            self.locks.release(&store.chat_dir(chat_id));
            store.delete(chat_id)
        })
    }

    pub fn chat_rename(&self, chat_id: Option<&str>, name: &str) -> Result<Chat> {
        if name.trim().is_empty() {
            return Err(Bb7Err::ChatNameEmpty);
        }
        self.with_state(|state| {
            match chat_id {
                Some(id)
                    if state
                        .active
                        .as_ref()
                        .is_none_or(|chat| chat.id != id) =>
                {
                    let store = self.find_store_for_id(state, id)?;
                    let mut chat = store.load(id)?;
                    chat.name = name.to_string();
                    store.save(&chat)?;
                    Ok(chat)
                }
                _ => {
                    let chat = state.active.as_mut().ok_or(Bb7Err::NoActiveChat)?;
                    chat.name = name.to_string();
                    let chat = chat.clone();
                    store_for(state, &chat)?.save(&chat)?;
                    Ok(chat)
                }
            }
        })
    }

    pub fn save_draft(&self, draft: &str) -> Result<()> {
        self.with_state(|state| {
            let chat = state.active.as_mut().ok_or(Bb7Err::NoActiveChat)?;
            chat.draft = draft.to_string();
            let chat = chat.clone();
            store_for(state, &chat)?.save(&chat)
        })
    }

    pub fn save_chat_settings(
        &self,
        model: Option<&str>,
        reasoning_effort: Option<ReasoningEffort>,
    ) -> Result<()> {
        self.with_state(|state| {
            let chat = state.active.as_mut().ok_or(Bb7Err::NoActiveChat)?;
            if let Some(model) = model {
                chat.model = Some(model.to_string());
            }
            if let Some(effort) = reasoning_effort {
                chat.reasoning_effort = Some(effort);
            }
            let chat = chat.clone();
            store_for(state, &chat)?.save(&chat)
        })
    }

    pub fn chat_force_unlock(&self, chat_id: &str) -> Result<()> {
        self.with_state(|state| {
            let store = self.find_store_for_id(state, chat_id)?;
            LockManager::force_unlock(&store.chat_dir(chat_id))
        })
    }

    pub fn chat_list(&self) -> Result<(Vec<ChatSummary>, Option<String>)> {
        self.with_state(|state| {
            let mut chats = Vec::new();
            if let Some(store) = &state.project_store {
                chats.extend(store.list());
            }
            if let Some(store) = &state.global_store {
                chats.extend(store.list());
            }
            chats.sort_by(|a, b| b.created.cmp(&a.created));
            let active = state.active.as_ref().map(|chat| chat.id.clone());
            Ok((chats, active))
        })
    }

    pub fn active_chat(&self) -> Option<Chat> {
        self.lock_state().active.clone()
    }

    pub fn chat_get(&self, chat_id: Option<&str>) -> Result<Chat> {
        self.with_state(|state| match chat_id {
            None => state.active.clone().ok_or(Bb7Err::NoActiveChat),
            Some(id) => {
                if let Some(active) = &state.active
                    && active.id == id
                {
                    return Ok(active.clone());
                }
                let store = self.find_store_for_id(state, id)?;
                store.load(id)
            }
        })
    }

    pub fn search_chats(&self, query: &str) -> Result<Vec<SearchResult>> {
        let needle = query.to_lowercase();
        self.with_state(|state| {
            let mut results = Vec::new();
            let stores: Vec<ChatStore> = state
                .project_store
                .iter()
                .chain(state.global_store.iter())
                .cloned()
                .collect();
            for store in stores {
                for summary in store.list() {
                    let chat = match store.load(&summary.id) {
                        Ok(chat) => chat,
                        Err(e) => {
                            warn!("skipping unsearchable chat {}: {e}", summary.id);
                            continue;
                        }
                    };
                    let mut match_count = 0;
                    if chat.name.to_lowercase().contains(&needle) {
                        match_count += 1;
                    }
                    for msg in &chat.messages {
                        if msg.text().to_lowercase().contains(&needle) {
                            match_count += 1;
                        }
                    }
                    if match_count > 0 {
                        results.push((chat.created, SearchResult {
                            chat_id: chat.id,
                            name: chat.name,
                            match_count,
                        }));
                    }
                }
            }
            results.sort_by(|a, b| b.0.cmp(&a.0));
            Ok(results.into_iter().map(|(_, r)| r).collect())
        })
    }

    pub fn add_system_message(&self, text: &str) -> Result<()> {
        self.with_state(|state| {
            let chat = state.active.as_mut().ok_or(Bb7Err::NoActiveChat)?;
            let mut msg = Message::new(Role::System);
            msg.parts.push(MessagePart::Text {
                content: text.to_string(),
            });
            chat.messages.push(msg);
            let chat = chat.clone();
            store_for(state, &chat)?.save(&chat)
        })
    }

    // ------------------------------------------------------------------
    // Fork / edit
    // ------------------------------------------------------------------

    pub fn fork_chat(
        &self,
        chat_id: Option<&str>,
        message_index: usize,
    ) -> Result<(Chat, Vec<ForkWarning>)> {
        self.with_state(|state| {
            let source = match chat_id {
                None => state.active.clone().ok_or(Bb7Err::NoActiveChat)?,
                Some(id) => {
                    let store = self.find_store_for_id(state, id)?;
                    store.load(id)?
                }
            };
            let store = store_for(state, &source)?;
            let root = state.project_root.clone();
            let engine = ForkEngine::new(&store, root.as_deref());
            let outcome = engine.fork(&source, message_index)?;
            self.activate(state, &store, outcome.chat.clone())?;
            store.save(&outcome.chat)?;
            Ok((outcome.chat, outcome.warnings))
        })
    }

    pub fn chat_edit(
        &self,
        message_index: usize,
        draft: Option<&str>,
    ) -> Result<(Chat, Vec<ForkWarning>)> {
        self.with_state(|state| {
            let mut chat = state.active.clone().ok_or(Bb7Err::NoActiveChat)?;
            let store = store_for(state, &chat)?;
            let root = state.project_root.clone();
            let engine = ForkEngine::new(&store, root.as_deref());
            let warnings = engine.edit_user_message(&mut chat, message_index, draft)?;
            store.save(&chat)?;
            state.active = Some(chat.clone());
            Ok((chat, warnings))
        })
    }

    // ------------------------------------------------------------------
    // Context / output / status
    // ------------------------------------------------------------------

    /// Runs `f` against the active chat with its engines' inputs resolved,
    /// then persists the chat.
    fn with_active_chat<T>(
        &self,
        f: impl FnOnce(&ChatStore, Option<&Path>, &mut Chat) -> Result<T>,
    ) -> Result<T> {
        self.with_state(|state| {
            let mut chat = state.active.clone().ok_or(Bb7Err::NoActiveChat)?;
            let store = store_for(state, &chat)?;
            let root = state.project_root.clone();
            let out = f(&store, root.as_deref(), &mut chat)?;
            store.save(&chat)?;
            state.active = Some(chat);
            Ok(out)
        })
    }

    pub fn context_add(
        &self,
        path: &str,
        content: Option<&str>,
        readonly: bool,
    ) -> Result<ContextFile> {
        self.with_active_chat(|store, root, chat| {
            ContextEngine::new(store, root).add(chat, path, content, readonly)
        })
    }

    pub fn context_add_section(
        &self,
        path: &str,
        start_line: u32,
        end_line: u32,
        content: Option<&str>,
    ) -> Result<ContextFile> {
        self.with_active_chat(|store, root, chat| {
            ContextEngine::new(store, root).add_section(chat, path, start_line, end_line, content)
        })
    }

    pub fn context_update(&self, path: &str, content: Option<&str>) -> Result<()> {
        self.with_active_chat(|store, root, chat| {
            ContextEngine::new(store, root).update(chat, path, content)
        })
    }

    pub fn context_set_readonly(&self, path: &str, readonly: bool) -> Result<()> {
        self.with_active_chat(|store, root, chat| {
            let engine = ContextEngine::new(store, root);
            let output = OutputEngine::new(store, root);
            let has_pending = output.exists(&chat.id, path);
            engine.set_readonly(chat, path, readonly, has_pending)
        })
    }

    pub fn context_remove(&self, path: &str) -> Result<()> {
        self.with_active_chat(|store, root, chat| {
            ContextEngine::new(store, root).remove(chat, path)
        })
    }

    pub fn context_remove_section(
        &self,
        path: &str,
        start_line: u32,
        end_line: u32,
    ) -> Result<()> {
        self.with_active_chat(|store, root, chat| {
            ContextEngine::new(store, root).remove_section(chat, path, start_line, end_line)
        })
    }

    pub fn context_list(&self) -> Result<Vec<ContextFile>> {
        self.with_state(|state| {
            let chat = state.active.as_ref().ok_or(Bb7Err::NoActiveChat)?;
            Ok(chat.context_files.clone())
        })
    }

    pub fn get_context_file(
        &self,
        path: &str,
        start_line: u32,
        end_line: u32,
    ) -> Result<(String, String)> {
        self.with_state(|state| {
            let chat = state.active.as_ref().ok_or(Bb7Err::NoActiveChat)?;
            let store = store_for(state, chat)?;
            let engine = ContextEngine::new(&store, state.project_root.as_deref());
            let cf = chat
                .context_files
                .iter()
                .find(|cf| cf.same_entry(path, start_line, end_line))
                .ok_or_else(|| Bb7Err::FileNotFound(path.to_string()))?;
            Ok((cf.path.clone(), engine.get(chat, cf)?))
        })
    }

    pub fn get_output_file(&self, path: &str) -> Result<(String, String)> {
        self.with_state(|state| {
            let chat = state.active.as_ref().ok_or(Bb7Err::NoActiveChat)?;
            let store = store_for(state, chat)?;
            let engine = OutputEngine::new(&store, state.project_root.as_deref());
            let rel = engine.normalize(path)?;
            Ok((rel.clone(), engine.read(&chat.id, &rel)?))
        })
    }

    /// Reject (delete) a pending proposal; audited as `UserRejectOutput`.
    pub fn output_delete(&self, path: &str) -> Result<()> {
        self.with_active_chat(|store, root, chat| {
            let engine = OutputEngine::new(store, root);
            let rel = engine.normalize(path)?;
            engine.delete(&chat.id, &rel)?;
            chat.record_event(ContextEvent::new(ContextAction::UserRejectOutput, &rel));
            Ok(())
        })
    }

    pub fn get_file_statuses(&self) -> Result<Vec<FileStatusEntry>> {
        self.with_state(|state| {
            let chat = state.active.as_ref().ok_or(Bb7Err::NoActiveChat)?;
            let store = store_for(state, chat)?;
            StatusEngine::new(&store, state.project_root.as_deref()).file_statuses(chat)
        })
    }

    pub fn get_diff_paths(&self, path: &str) -> Result<DiffPaths> {
        self.with_state(|state| {
            let chat = state.active.as_ref().ok_or(Bb7Err::NoActiveChat)?;
            let store = store_for(state, chat)?;
            StatusEngine::new(&store, state.project_root.as_deref()).diff_paths(chat, path)
        })
    }

    pub fn apply_file(&self, path: &str) -> Result<()> {
        self.with_active_chat(|store, root, chat| {
            StatusEngine::new(store, root).apply_file(chat, path)
        })
    }

    pub fn apply_file_as(&self, path: &str, destination: &str) -> Result<()> {
        self.with_active_chat(|store, root, chat| {
            StatusEngine::new(store, root).apply_file_as(chat, path, destination)
        })
    }

    pub fn sync_context(&self, path: &str) -> Result<()> {
        self.with_active_chat(|store, root, chat| {
            StatusEngine::new(store, root).sync_context_to_local(chat, path)
        })
    }

    pub fn diff_local_done(&self, path: &str) -> Result<DiffLocalOutcome> {
        self.with_active_chat(|store, root, chat| {
            StatusEngine::new(store, root).diff_local_done(chat, path)
        })
    }

    // ------------------------------------------------------------------
    // Estimates / customization
    // ------------------------------------------------------------------

    /// Token estimate over the prompt the model would actually see for
    /// the active chat (system prompt + composed body + draft).
    pub fn estimate_chat_tokens(&self) -> Result<u64> {
        self.with_state(|state| {
            let chat = state.active.as_ref().ok_or(Bb7Err::NoActiveChat)?;
            let store = store_for(state, chat)?;
            let mut scratch = chat.clone();
            // The draft stands in for the latest user message.
            let mut draft_msg = Message::new(Role::User);
            draft_msg.parts.push(MessagePart::Text {
                content: chat.draft.clone(),
            });
            scratch.messages.push(draft_msg);
            let built = PromptBuilder::new(&store, state.project_root.as_deref()).build(
                &mut scratch,
                self.config.diff_mode,
                None,
                None,
            )?;
            Ok(estimate_tokens(crate::prompt::BASE_SYSTEM_PROMPT) + estimate_tokens(&built.body))
        })
    }

    pub fn customization_info(&self) -> Result<(String, bool, String, bool)> {
        let system_prompt = system_prompt_override_path()?;
        self.with_state(|state| {
            let instructions_path = match &state.project_root {
                Some(root) => instructions::instructions_path(root),
                None => return Err(Bb7Err::NotInitialized),
            };
            Ok((
                instructions_path.display().to_string(),
                instructions_path.exists(),
                system_prompt.display().to_string(),
                system_prompt.exists(),
            ))
        })
    }

    pub fn prepare_instructions(&self) -> Result<String> {
        self.with_state(|state| {
            let root = state.project_root.as_ref().ok_or(Bb7Err::NotInitialized)?;
            Ok(instructions::prepare(root)?.display().to_string())
        })
    }

    // ------------------------------------------------------------------
    // Turn support (called from the orchestrator)
    // ------------------------------------------------------------------

    /// Snapshot of everything a turn needs before streaming starts.
    pub(crate) fn turn_inputs(&self) -> Result<TurnInputs> {
        self.with_state(|state| {
            let chat = state.active.clone().ok_or(Bb7Err::NoActiveChat)?;
            let store = store_for(state, &chat)?;
            Ok(TurnInputs {
                chat,
                store,
                project_root: state.project_root.clone(),
            })
        })
    }

    /// Replace the active chat (it must still be active) and persist.
    pub(crate) fn commit_chat(&self, chat: Chat) -> Result<()> {
        self.with_state(|state| {
            let store = store_for(state, &chat)?;
            store.save(&chat)?;
            if state
                .active
                .as_ref()
                .is_some_and(|active| active.id == chat.id)
            {
                state.active = Some(chat);
            }
            Ok(())
        })
    }

    /// Rename a chat by id, keeping the in-memory active copy in step.
    /// Used by async title generation, which races ordinary renames.
    pub(crate) fn rename_if_active(&self, chat_id: &str, name: &str) -> Result<()> {
        self.with_state(|state| {
            let store = self.find_store_for_id(state, chat_id)?;
            let mut chat = store.load(chat_id)?;
            chat.name = name.to_string();
            store.save(&chat)?;
            if let Some(active) = state.active.as_mut()
                && active.id == chat_id
            {
                active.name = name.to_string();
            }
            Ok(())
        })
    }

    /// Release resources at process exit.
    pub fn shutdown(&self) {
        self.locks.cleanup();
    }

    fn find_store_for_id(&self, state: &AppState, chat_id: &str) -> Result<ChatStore> {
        if let Some(store) = &state.project_store
            && store.exists(chat_id)
        {
            return Ok(store.clone());
        }
        if let Some(store) = &state.global_store
            && store.exists(chat_id)
        {
            return Ok(store.clone());
        }
        Err(Bb7Err::ChatNotFound(chat_id.to_string()))
    }
}

pub(crate) struct TurnInputs {
    pub chat: Chat,
    pub store: ChatStore,
    pub project_root: Option<PathBuf>,
}

fn store_for(state: &AppState, chat: &Chat) -> Result<ChatStore> {
    let store = if chat.global {
        state.global_store.as_ref()
    } else {
        state.project_store.as_ref()
    };
    store.cloned().ok_or(Bb7Err::NotInitialized)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use pretty_assertions::assert_eq;

    fn test_config(bb7_home: PathBuf) -> Config {
        Config {
            base_url: "http://127.0.0.1:9/v1".to_string(),
            api_key: None,
            default_model: "test-model".to_string(),
            title_model: "test-title-model".to_string(),
            diff_mode: bb7_protocol::DiffMode::SearchReplace,
            allow_training: false,
            allow_data_retention: false,
            explicit_cache_key: None,
            auto_retry_partial_edits: true,
            bb7_home,
        }
    }

    fn app_with_project() -> (tempfile::TempDir, App, PathBuf) {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("proj");
        std::fs::create_dir_all(&root).unwrap();
        let config = test_config(tmp.path().join("home/.bb7"));
        let client = ModelClient::new(&config);
        let app = App::new(config, client, DebugLog::default());
        app.bb7_init(&root.to_string_lossy()).unwrap();
        app.init(&root.to_string_lossy()).unwrap();
        (tmp, app, root)
    }

    #[test]
    fn init_requires_bb7_marker() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("plain");
        std::fs::create_dir_all(&root).unwrap();
        let config = test_config(tmp.path().join("home/.bb7"));
        let client = ModelClient::new(&config);
        let app = App::new(config, client, DebugLog::default());

        assert!(matches!(
            app.init(&root.to_string_lossy()),
            Err(Bb7Err::NotBb7Project)
        ));
        app.bb7_init(&root.to_string_lossy()).unwrap();
        assert!(matches!(
            app.bb7_init(&root.to_string_lossy()),
            Err(Bb7Err::AlreadyInit)
        ));
        app.init(&root.to_string_lossy()).unwrap();
    }

    #[test]
    fn chat_lifecycle_with_lock_swap() {
        let (_tmp, app, _root) = app_with_project();
        let a = app.chat_new(Some("a"), false).unwrap();
        let b = app.chat_new(Some("b"), false).unwrap();

        // Creating b released a's lock and acquired b's.
        let (chats, active) = app.chat_list().unwrap();
        assert_eq!(chats.len(), 2);
        assert_eq!(active.as_deref(), Some(b.id.as_str()));

        let selected = app.chat_select(&a.id).unwrap();
        assert_eq!(selected.id, a.id);
        assert_eq!(app.active_chat().unwrap().id, a.id);

        app.chat_delete(&a.id).unwrap();
        assert!(app.active_chat().is_none());
        let (chats, _) = app.chat_list().unwrap();
        assert_eq!(chats.len(), 1);
    }

    #[test]
    fn rename_validates_and_persists() {
        let (_tmp, app, _root) = app_with_project();
        let chat = app.chat_new(Some("old"), false).unwrap();
        assert!(matches!(
            app.chat_rename(None, "  "),
            Err(Bb7Err::ChatNameEmpty)
        ));
        let renamed = app.chat_rename(Some(&chat.id), "new name").unwrap();
        assert_eq!(renamed.name, "new name");
        assert_eq!(app.chat_get(Some(&chat.id)).unwrap().name, "new name");
    }

    #[test]
    fn context_round_trip_through_app() {
        let (_tmp, app, _root) = app_with_project();
        app.chat_new(Some("t"), false).unwrap();
        app.context_add("a.go", Some("A\nB\n"), false).unwrap();

        let files = app.context_list().unwrap();
        assert_eq!(files.len(), 1);
        let (path, content) = app.get_context_file("a.go", 0, 0).unwrap();
        assert_eq!(path, "a.go");
        assert_eq!(content, "A\nB\n");

        // Round-trips byte-exactly and is audited on the active chat.
        let chat = app.active_chat().unwrap();
        match chat.messages.last().and_then(|m| m.parts.last()) {
            Some(MessagePart::ContextEvent { event }) => {
                assert_eq!(event.action, ContextAction::UserAddFile);
            }
            other => panic!("expected event, got {other:?}"),
        }
    }

    #[test]
    fn search_matches_names_and_bodies() {
        let (_tmp, app, _root) = app_with_project();
        app.chat_new(Some("alpha quest"), false).unwrap();
        app.add_system_message("nothing interesting").unwrap();
        app.chat_new(Some("beta"), false).unwrap();
        app.add_system_message("the QUEST continues").unwrap();

        let results = app.search_chats("quest").unwrap();
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn output_delete_records_rejection() {
        let (_tmp, app, root) = app_with_project();
        app.chat_new(Some("t"), false).unwrap();
        app.context_add("a.go", Some("A\n"), false).unwrap();

        // Stage a proposal by hand, then reject it.
        let chat = app.active_chat().unwrap();
        let store = ChatStore::project(&root);
        let output = OutputEngine::new(&store, Some(&root));
        output.write(&chat, "a.go", "B\n").unwrap();

        app.output_delete("a.go").unwrap();
        let chat = app.active_chat().unwrap();
        match chat.messages.last().and_then(|m| m.parts.last()) {
            Some(MessagePart::ContextEvent { event }) => {
                assert_eq!(event.action, ContextAction::UserRejectOutput);
            }
            other => panic!("expected event, got {other:?}"),
        }
        assert!(app.get_output_file("a.go").is_err());
    }

    #[test]
    fn global_chats_coexist_with_project_chats() {
        let (_tmp, app, _root) = app_with_project();
        app.chat_new(Some("proj"), false).unwrap();
        let global = app.chat_new(Some("glob"), true).unwrap();
        assert!(global.global);

        let (chats, active) = app.chat_list().unwrap();
        assert_eq!(chats.len(), 2);
        assert_eq!(active.as_deref(), Some(global.id.as_str()));
    }
}
