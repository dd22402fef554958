//! On-disk chat layout and the chats-directory index.
//!
//! Project layout:
//!
//! ```text
//! <root>/.bb7/
//!   chats/
//!     index.json
//!     <chatid>/
//!       chat.json
//!       lock
//!       context/
//!         _sections/<hash>
//!         _external/<hash>
//!       output/
//! ```
//!
//! Global chats use the same shape under `~/.bb7/chats/` minus `output/`.
//! The index is a cache: when missing or corrupt it is rebuilt from the
//! directory listing, and no operation fails solely because the index
//! cannot be written.

use std::path::Path;
use std::path::PathBuf;

use chrono::Utc;
use rand::RngCore;
use tracing::debug;
use tracing::warn;

use bb7_protocol::CHAT_SCHEMA_VERSION;
use bb7_protocol::Chat;
use bb7_protocol::ChatIndex;
use bb7_protocol::ChatSummary;

use crate::error::Bb7Err;
use crate::error::Result;

const INDEX_VERSION: u32 = 1;
const INDEX_FILENAME: &str = "index.json";
const CHAT_FILENAME: &str = "chat.json";

pub const SECTIONS_SUBDIR: &str = "_sections";
pub const EXTERNAL_SUBDIR: &str = "_external";

/// Storage for one chats directory (a project's `.bb7/chats` or the
/// global `~/.bb7/chats`).
#[derive(Debug, Clone)]
pub struct ChatStore {
    chats_dir: PathBuf,
    global: bool,
}

impl ChatStore {
    pub fn project(project_root: &Path) -> Self {
        Self {
            chats_dir: project_root.join(".bb7").join("chats"),
            global: false,
        }
    }

    pub fn global(bb7_home: &Path) -> Self {
        Self {
            chats_dir: bb7_home.join("chats"),
            global: true,
        }
    }

    pub fn is_global(&self) -> bool {
        self.global
    }

    pub fn chats_dir(&self) -> &Path {
        &self.chats_dir
    }

    pub fn chat_dir(&self, id: &str) -> PathBuf {
        self.chats_dir.join(id)
    }

    pub fn context_dir(&self, id: &str) -> PathBuf {
        self.chat_dir(id).join("context")
    }

    pub fn output_dir(&self, id: &str) -> PathBuf {
        self.chat_dir(id).join("output")
    }

    fn chat_json_path(&self, id: &str) -> PathBuf {
        self.chat_dir(id).join(CHAT_FILENAME)
    }

    fn index_path(&self) -> PathBuf {
        self.chats_dir.join(INDEX_FILENAME)
    }

    pub fn exists(&self, id: &str) -> bool {
        self.chat_json_path(id).exists()
    }

    /// Draw an unused 6-hex-char chat id.
    fn new_chat_id(&self) -> String {
        loop {
            let mut bytes = [0u8; 3];
            rand::rng().fill_bytes(&mut bytes);
            let id = format!("{:02x}{:02x}{:02x}", bytes[0], bytes[1], bytes[2]);
            if !self.chat_dir(&id).exists() {
                return id;
            }
        }
    }

    pub fn create(&self, name: &str) -> Result<Chat> {
        if name.is_empty() {
            return Err(Bb7Err::ChatNameEmpty);
        }
        let id = self.new_chat_id();
        let chat = Chat {
            id: id.clone(),
            name: name.to_string(),
            created: Utc::now(),
            model: None,
            reasoning_effort: None,
            global: self.global,
            draft: String::new(),
            context_files: Vec::new(),
            messages: Vec::new(),
            version: CHAT_SCHEMA_VERSION,
        };

        std::fs::create_dir_all(self.context_dir(&id))?;
        std::fs::create_dir_all(self.context_dir(&id).join(SECTIONS_SUBDIR))?;
        std::fs::create_dir_all(self.context_dir(&id).join(EXTERNAL_SUBDIR))?;
        if !self.global {
            std::fs::create_dir_all(self.output_dir(&id))?;
        }
        self.save(&chat)?;
        Ok(chat)
    }

    /// Load a chat, transparently migrating legacy schemas. A migrated
    /// chat is re-saved at the current version right away so later code
    /// paths only ever see `parts`-shaped messages.
    pub fn load(&self, id: &str) -> Result<Chat> {
        let raw = match std::fs::read_to_string(self.chat_json_path(id)) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Bb7Err::ChatNotFound(id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let mut chat: Chat = serde_json::from_str(&raw)?;
        if chat.version < CHAT_SCHEMA_VERSION {
            debug!(
                "migrating chat {} from schema v{} to v{CHAT_SCHEMA_VERSION}",
                chat.id, chat.version
            );
            chat.version = CHAT_SCHEMA_VERSION;
            self.save(&chat)?;
        }
        Ok(chat)
    }

    pub fn save(&self, chat: &Chat) -> Result<()> {
        let json = serde_json::to_string_pretty(chat)?;
        std::fs::create_dir_all(self.chat_dir(&chat.id))?;
        std::fs::write(self.chat_json_path(&chat.id), json)?;
        self.update_index_entry(chat);
        Ok(())
    }

    /// Removes the chat and every file under it.
    pub fn delete(&self, id: &str) -> Result<()> {
        if !self.exists(id) {
            return Err(Bb7Err::ChatNotFound(id.to_string()));
        }
        std::fs::remove_dir_all(self.chat_dir(id))?;

        let mut index = self.ensure_index();
        index.chats.retain(|c| c.id != id);
        if index.active_chat_id.as_deref() == Some(id) {
            index.active_chat_id = None;
        }
        self.save_index(&index);
        Ok(())
    }

    pub fn list(&self) -> Vec<ChatSummary> {
        self.ensure_index().chats
    }

    pub fn active_chat_id(&self) -> Option<String> {
        self.ensure_index().active_chat_id
    }

    /// Best-effort: record which chat is active in the index.
    pub fn set_active(&self, id: Option<&str>) {
        let mut index = self.ensure_index();
        index.active_chat_id = id.map(str::to_string);
        self.save_index(&index);
    }

    /// Reconcile the index file with the directory tree, tolerating a
    /// missing or corrupt index by starting fresh from the listing.
    pub fn ensure_index(&self) -> ChatIndex {
        let from_disk = std::fs::read_to_string(self.index_path())
            .ok()
            .and_then(|raw| serde_json::from_str::<ChatIndex>(&raw).ok());

        let mut index = match from_disk {
            Some(index) if index.version == INDEX_VERSION => index,
            Some(_) | None => ChatIndex {
                version: INDEX_VERSION,
                active_chat_id: None,
                chats: Vec::new(),
            },
        };

        let on_disk = self.scan_chat_ids();

        // Drop entries whose directory vanished, add entries the index
        // missed, refresh the rest lazily (summaries are updated on save).
        index.chats.retain(|c| on_disk.contains(&c.id));
        for id in &on_disk {
            if !index.chats.iter().any(|c| &c.id == id) {
                match self.load(id) {
                    Ok(chat) => index.chats.push(ChatSummary::from(&chat)),
                    Err(e) => warn!("skipping unreadable chat {id}: {e}"),
                }
            }
        }
        if let Some(active) = &index.active_chat_id
            && !on_disk.contains(active)
        {
            index.active_chat_id = None;
        }
        index.chats.sort_by(|a, b| b.created.cmp(&a.created));

        self.save_index(&index);
        index
    }

    fn scan_chat_ids(&self) -> Vec<String> {
        let mut ids = Vec::new();
        let entries = match std::fs::read_dir(&self.chats_dir) {
            Ok(entries) => entries,
            Err(_) => return ids,
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if entry.path().join(CHAT_FILENAME).exists() {
                ids.push(name);
            }
        }
        ids
    }

    fn update_index_entry(&self, chat: &Chat) {
        let mut index = self.ensure_index_without_rescan();
        match index.chats.iter_mut().find(|c| c.id == chat.id) {
            Some(entry) => *entry = ChatSummary::from(chat),
            None => index.chats.push(ChatSummary::from(chat)),
        }
        index.chats.sort_by(|a, b| b.created.cmp(&a.created));
        self.save_index(&index);
    }

    /// Cheap read of the index for incremental updates; corruption falls
    /// back to an empty index rather than a directory scan, since the
    /// next `list` will reconcile anyway.
    fn ensure_index_without_rescan(&self) -> ChatIndex {
        std::fs::read_to_string(self.index_path())
            .ok()
            .and_then(|raw| serde_json::from_str::<ChatIndex>(&raw).ok())
            .filter(|index| index.version == INDEX_VERSION)
            .unwrap_or(ChatIndex {
                version: INDEX_VERSION,
                active_chat_id: None,
                chats: Vec::new(),
            })
    }

    /// Index writes never fail an operation.
    fn save_index(&self, index: &ChatIndex) {
        let json = match serde_json::to_string_pretty(index) {
            Ok(json) => json,
            Err(e) => {
                warn!("failed to serialize chat index: {e}");
                return;
            }
        };
        if let Err(e) = std::fs::create_dir_all(&self.chats_dir) {
            warn!("failed to create chats dir: {e}");
            return;
        }
        if let Err(e) = std::fs::write(self.index_path(), json) {
            warn!("failed to write chat index: {e}");
        }
    }
}
