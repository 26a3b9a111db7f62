//! Daemon configuration.
//!
//! Loaded from an optional TOML file, then overlaid with `LIVEWATCH_*`
//! environment variables, then validated:
//!
//! ```toml
//! client_id = "abc"
//! client_secret = "xyz"
//! polling_interval_secs = 90
//! push_capacity = 3
//!
//! [telegram]
//! bot_token = "123:ABC"
//! chat_id = -1001234
//!
//! [[channels]]
//! handle = "somestreamer"
//! priority = "high"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use lw_core::Priority;
use serde::Deserialize;
use thiserror::Error;

use crate::twitch::AppCredentials;

/// Shortest allowed polling interval.
pub const MIN_POLLING_INTERVAL_SECS: u64 = 30;

pub const DEFAULT_POLLING_INTERVAL_SECS: u64 = 90;

pub const DEFAULT_PUSH_CAPACITY: usize = 3;

pub const DEFAULT_REDIRECT_URI: &str = "http://localhost:8080/oauth/callback";

const REGISTRY_FILE: &str = "channels.json";
const USER_TOKEN_FILE: &str = "user_token.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("missing required setting `{0}`")]
    Missing(&'static str),

    #[error("invalid value for `{key}`: {message}")]
    Invalid { key: &'static str, message: String },
}

/// Telegram delivery target.
#[derive(Clone, Deserialize)]
pub struct TelegramConfig {
    pub bot_token: String,
    pub chat_id: i64,
}

impl std::fmt::Debug for TelegramConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramConfig")
            .field("bot_token", &"<redacted>")
            .field("chat_id", &self.chat_id)
            .finish()
    }
}

/// A channel tracked at startup if the registry does not hold it yet.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SeedChannel {
    pub handle: String,
    #[serde(default)]
    pub priority: Priority,
}

/// Endpoint overrides, mostly for pointing at a local mock.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Endpoints {
    pub auth_base: Option<String>,
    pub api_base: Option<String>,
    pub eventsub_url: Option<String>,
}

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    /// Directory for the registry snapshot and the user credential.
    /// Filled in by the binary when left unset.
    pub data_dir: Option<PathBuf>,
    pub polling_interval_secs: u64,
    /// Maximum number of channels in push mode.
    pub push_capacity: usize,
    pub telegram: Option<TelegramConfig>,
    pub endpoints: Endpoints,
    pub channels: Vec<SeedChannel>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            redirect_uri: DEFAULT_REDIRECT_URI.to_string(),
            data_dir: None,
            polling_interval_secs: DEFAULT_POLLING_INTERVAL_SECS,
            push_capacity: DEFAULT_PUSH_CAPACITY,
            telegram: None,
            endpoints: Endpoints::default(),
            channels: Vec::new(),
        }
    }
}

impl std::fmt::Debug for DaemonConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaemonConfig")
            .field("client_id", &self.client_id)
            .field("redirect_uri", &self.redirect_uri)
            .field("data_dir", &self.data_dir)
            .field("polling_interval_secs", &self.polling_interval_secs)
            .field("push_capacity", &self.push_capacity)
            .field("telegram", &self.telegram)
            .field("endpoints", &self.endpoints)
            .field("channels", &self.channels)
            .finish_non_exhaustive()
    }
}

impl DaemonConfig {
    /// Parses a TOML document. Missing keys take their defaults.
    pub fn from_toml(raw: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Reads `path` if given; otherwise starts from defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                Self::from_toml(&raw, path)
            }
            None => Ok(Self::default()),
        }
    }

    /// Overlays values from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Overlays values returned by `lookup` for each `LIVEWATCH_*` key.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("LIVEWATCH_CLIENT_ID") {
            self.client_id = v;
        }
        if let Some(v) = lookup("LIVEWATCH_CLIENT_SECRET") {
            self.client_secret = v;
        }
        if let Some(v) = lookup("LIVEWATCH_REDIRECT_URI") {
            self.redirect_uri = v;
        }
        if let Some(v) = lookup("LIVEWATCH_DATA_DIR") {
            self.data_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("LIVEWATCH_POLLING_INTERVAL_SECS") {
            self.polling_interval_secs = v.trim().parse().map_err(|_| ConfigError::Invalid {
                key: "LIVEWATCH_POLLING_INTERVAL_SECS",
                message: format!("`{v}` is not a number of seconds"),
            })?;
        }

        let token = lookup("LIVEWATCH_TELEGRAM_TOKEN");
        let chat = lookup("LIVEWATCH_TELEGRAM_CHAT_ID")
            .map(|v| {
                v.trim().parse::<i64>().map_err(|_| ConfigError::Invalid {
                    key: "LIVEWATCH_TELEGRAM_CHAT_ID",
                    message: format!("`{v}` is not a chat id"),
                })
            })
            .transpose()?;

        match (token, chat) {
            (Some(bot_token), Some(chat_id)) => {
                self.telegram = Some(TelegramConfig { bot_token, chat_id });
            }
            (Some(bot_token), None) => match self.telegram.as_mut() {
                Some(existing) => existing.bot_token = bot_token,
                None => return Err(ConfigError::Missing("LIVEWATCH_TELEGRAM_CHAT_ID")),
            },
            (None, Some(chat_id)) => match self.telegram.as_mut() {
                Some(existing) => existing.chat_id = chat_id,
                None => return Err(ConfigError::Missing("LIVEWATCH_TELEGRAM_TOKEN")),
            },
            (None, None) => {}
        }

        Ok(())
    }

    /// Checks required settings and clamps the polling interval.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Missing`] when the application id or secret is
    /// empty, and [`ConfigError::Invalid`] for a zero push capacity.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.client_id.trim().is_empty() {
            return Err(ConfigError::Missing("client_id"));
        }
        if self.client_secret.trim().is_empty() {
            return Err(ConfigError::Missing("client_secret"));
        }
        if self.push_capacity == 0 {
            return Err(ConfigError::Invalid {
                key: "push_capacity",
                message: "must be at least 1".to_string(),
            });
        }
        if self.polling_interval_secs < MIN_POLLING_INTERVAL_SECS {
            tracing::warn!(
                requested = self.polling_interval_secs,
                floor = MIN_POLLING_INTERVAL_SECS,
                "Polling interval below floor, clamping"
            );
            self.polling_interval_secs = MIN_POLLING_INTERVAL_SECS;
        }
        Ok(())
    }

    pub fn polling_interval(&self) -> Duration {
        Duration::from_secs(self.polling_interval_secs.max(MIN_POLLING_INTERVAL_SECS))
    }

    pub fn app_credentials(&self) -> AppCredentials {
        AppCredentials {
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone(),
            redirect_uri: self.redirect_uri.clone(),
        }
    }

    /// Sets the data directory if the file and environment left it unset.
    pub fn with_default_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        if self.data_dir.is_none() {
            self.data_dir = Some(dir.into());
        }
        self
    }

    fn data_path(&self, file: &str) -> PathBuf {
        self.data_dir
            .as_deref()
            .unwrap_or_else(|| Path::new("."))
            .join(file)
    }

    pub fn registry_path(&self) -> PathBuf {
        self.data_path(REGISTRY_FILE)
    }

    pub fn user_token_path(&self) -> PathBuf {
        self.data_path(USER_TOKEN_FILE)
    }
}
