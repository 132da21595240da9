//! Application configuration.
//!
//! Layers, lowest priority first:
//!
//! 1. compiled defaults
//! 2. TOML file (`<config_dir>/ollama-chat/config.toml`, or an explicit path)
//! 3. environment variables (`OLLAMA_HOST`, `OLLAMA_CHAT_*`)
//!
//! Command-line flags of the binary are applied on top by `main`.

use crate::commands::{ChatOptions, TitleStrategy};
use crate::ollama_api::DEFAULT_OLLAMA_URL;

use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

const APP_DIR: &str = "ollama-chat";
const CONFIG_FILE: &str = "config.toml";
const DATABASE_FILE: &str = "ollama-chat.db";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file '{path}': {source}")]
    ParseToml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid value for environment variable '{name}': {message}")]
    InvalidEnvVar { name: String, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    pub database_path: PathBuf,
    pub ollama_url: String,
    pub log_level: String,
    pub title_strategy: TitleStrategy,
    pub title_max_chars: usize,
    pub send_history: bool,
    pub resume_last_session: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        let defaults = ChatOptions::default();
        Self {
            database_path: default_database_path(),
            ollama_url: DEFAULT_OLLAMA_URL.to_string(),
            log_level: "info".to_string(),
            title_strategy: defaults.title_strategy,
            title_max_chars: defaults.title_max_chars,
            send_history: defaults.send_history,
            resume_last_session: false,
        }
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_DIR).join(CONFIG_FILE))
}

pub fn default_database_path() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join(APP_DIR))
        .unwrap_or_default()
        .join(DATABASE_FILE)
}

impl AppConfig {
    /// Loads defaults, then the config file, then the process environment.
    ///
    /// A missing default config file is ignored; a missing explicit one is an error.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with_env(explicit, |name| std::env::var(name).ok())
    }

    pub fn load_with_env<F>(explicit: Option<&Path>, env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match explicit {
            Some(path) => Self::from_file(path)?,
            None => match default_config_path().filter(|p| p.exists()) {
                Some(path) => Self::from_file(&path)?,
                None => Self::default(),
            },
        };
        config.apply_env(env)?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Self = toml::from_str(&content).map_err(|source| ConfigError::ParseToml {
            path: path.to_path_buf(),
            source,
        })?;
        config.ollama_url = normalize_url(&config.ollama_url);

        debug!(path = %path.display(), "loaded config file");
        Ok(config)
    }

    fn apply_env<F>(&mut self, env: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = env("OLLAMA_CHAT_DB") {
            self.database_path = PathBuf::from(path);
        }
        if let Some(host) = env("OLLAMA_HOST") {
            self.ollama_url = normalize_url(&host);
        }
        if let Some(level) = env("OLLAMA_CHAT_LOG") {
            self.log_level = level;
        }
        if let Some(value) = env("OLLAMA_CHAT_TITLES") {
            self.title_strategy = match value.to_lowercase().as_str() {
                "truncate" => TitleStrategy::Truncate,
                "model" => TitleStrategy::Model,
                _ => return Err(invalid_env("OLLAMA_CHAT_TITLES", "expected 'truncate' or 'model'")),
            };
        }
        if let Some(value) = env("OLLAMA_CHAT_HISTORY") {
            self.send_history =
                parse_bool(&value).ok_or_else(|| invalid_env("OLLAMA_CHAT_HISTORY", "expected bool"))?;
        }
        if let Some(value) = env("OLLAMA_CHAT_RESUME") {
            self.resume_last_session =
                parse_bool(&value).ok_or_else(|| invalid_env("OLLAMA_CHAT_RESUME", "expected bool"))?;
        }
        Ok(())
    }

    pub fn chat_options(&self) -> ChatOptions {
        ChatOptions {
            title_strategy: self.title_strategy,
            title_max_chars: self.title_max_chars,
            send_history: self.send_history,
        }
    }
}

fn invalid_env(name: &str, message: &str) -> ConfigError {
    ConfigError::InvalidEnvVar {
        name: name.to_string(),
        message: message.to_string(),
    }
}

/// Accepts: "true", "false", "1", "0", "yes", "no", "on", "off" (case-insensitive).
fn parse_bool(s: &str) -> Option<bool> {
    match s.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// `OLLAMA_HOST` is often given as a bare `host:port`.
pub fn normalize_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{}", trimmed)
    }
}
