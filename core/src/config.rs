use std::path::PathBuf;

use serde::Deserialize;

use bb7_protocol::DiffMode;

use crate::error::Bb7Err;
use crate::error::Result;
use crate::flags::BB7_DEBUG;

const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";
const DEFAULT_MODEL: &str = "anthropic/claude-sonnet-4";
const DEFAULT_TITLE_MODEL: &str = "google/gemini-2.5-flash-lite";

/// Settings read from `~/.config/bb7/config.json`, merged with defaults.
/// A missing file yields the defaults; a corrupt file is an error the
/// caller surfaces (silently masking a typo'd API key helps nobody).
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub base_url: String,
    pub api_key: Option<String>,
    pub default_model: String,
    pub title_model: String,
    pub diff_mode: DiffMode,
    pub allow_training: bool,
    pub allow_data_retention: bool,
    /// Stable key the provider may use for prompt-cache routing.
    pub explicit_cache_key: Option<String>,
    pub auto_retry_partial_edits: bool,

    /// Directory containing global bb7 state (defaults to `~/.bb7`).
    pub bb7_home: PathBuf,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    base_url: Option<String>,
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default)]
    default_model: Option<String>,
    #[serde(default)]
    title_model: Option<String>,
    #[serde(default)]
    diff_mode: Option<DiffMode>,
    #[serde(default)]
    allow_training: Option<bool>,
    #[serde(default)]
    allow_data_retention: Option<bool>,
    #[serde(default)]
    explicit_cache_key: Option<String>,
    #[serde(default)]
    auto_retry_partial_edits: Option<bool>,
}

impl Config {
    pub fn load() -> Result<Self> {
        let file = match std::fs::read_to_string(config_file_path()?) {
            Ok(raw) => serde_json::from_str::<ConfigFile>(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ConfigFile::default(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self::from_file(file, bb7_home()?))
    }

    fn from_file(file: ConfigFile, bb7_home: PathBuf) -> Self {
        Self {
            base_url: file
                .base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            api_key: file.api_key,
            default_model: file
                .default_model
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            title_model: file
                .title_model
                .unwrap_or_else(|| DEFAULT_TITLE_MODEL.to_string()),
            diff_mode: file.diff_mode.unwrap_or_default(),
            allow_training: file.allow_training.unwrap_or(false),
            allow_data_retention: file.allow_data_retention.unwrap_or(false),
            explicit_cache_key: file.explicit_cache_key,
            auto_retry_partial_edits: file.auto_retry_partial_edits.unwrap_or(true),
            bb7_home,
        }
    }

    /// Debug logging is on when `BB7_DEBUG=1` or `~/.bb7/debug` exists.
    pub fn debug_enabled(&self) -> bool {
        *BB7_DEBUG || self.bb7_home.join("debug").exists()
    }

    pub fn log_dir(&self) -> PathBuf {
        self.bb7_home.join("logs")
    }

    /// Directory holding global (project-less) chats.
    pub fn global_chats_dir(&self) -> PathBuf {
        self.bb7_home.join("chats")
    }
}

/// Returns `~/.bb7`, creating nothing.
pub fn bb7_home() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| Bb7Err::MissingConfig("home directory".to_string()))?;
    Ok(home.join(".bb7"))
}

fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| Bb7Err::MissingConfig("home directory".to_string()))?;
    Ok(home.join(".config").join("bb7"))
}

pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join("config.json"))
}

/// Location of the optional system-prompt override. The file replaces the
/// built-in system prompt when it is non-empty after comment stripping.
pub fn system_prompt_override_path() -> Result<PathBuf> {
    Ok(config_dir()?.join("system_prompt.txt"))
}
