//! Configuration file parser for ~/.config/notifeed/config.toml.
//!
//! The config file is optional. A missing or empty file yields
//! `Config::default()`. Unknown keys are accepted but logged, since they are
//! usually typos.
use crate::session::CenterOptions;
use secrecy::SecretString;
use serde::{Deserialize, Deserializer};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Environment variable that overrides `api_key` from the file.
pub const API_KEY_ENV: &str = "NOTIFEED_API_KEY";

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config file too large: {0}")]
    TooLarge(String),
}

// ============================================================================
// Configuration
// ============================================================================

/// Top-level configuration. Every key is optional.
#[derive(Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base URL of the remote notifications API (used with `--remote`).
    pub backend_url: Option<String>,

    /// Bearer token for the remote API. `NOTIFEED_API_KEY` takes precedence.
    #[serde(deserialize_with = "deserialize_secret")]
    pub api_key: Option<SecretString>,

    /// Local SQLite database. Defaults to `notifications.db` next to the config file.
    pub database_path: Option<PathBuf>,

    /// Prefix of the per-owner push topic.
    pub feed_topic: String,

    /// Window over which invalidations collapse into one refetch.
    pub reconcile_debounce_ms: u64,

    /// Number of owners whose feeds stay cached.
    pub max_cached_owners: usize,

    pub request_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend_url: None,
            api_key: None,
            database_path: None,
            feed_topic: "notifications".to_string(),
            reconcile_debounce_ms: 50,
            max_cached_owners: 8,
            request_timeout_secs: 30,
        }
    }
}

fn deserialize_secret<'de, D>(deserializer: D) -> Result<Option<SecretString>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw.filter(|s| !s.is_empty()).map(SecretString::from))
}

// The API key never appears in Debug output.
impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("backend_url", &self.backend_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("database_path", &self.database_path)
            .field("feed_topic", &self.feed_topic)
            .field("reconcile_debounce_ms", &self.reconcile_debounce_ms)
            .field("max_cached_owners", &self.max_cached_owners)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

impl Config {
    const MAX_FILE_SIZE: u64 = 1_048_576;

    const KNOWN_KEYS: [&'static str; 7] = [
        "backend_url",
        "api_key",
        "database_path",
        "feed_topic",
        "reconcile_debounce_ms",
        "max_cached_owners",
        "request_timeout_secs",
    ];

    /// Load configuration from a TOML file.
    ///
    /// - Missing or empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Over 1 MB → `Err(ConfigError::TooLarge)` without reading it
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Deleted between metadata and read
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        if content.trim().is_empty() {
            tracing::debug!(path = %path.display(), "Config file is empty, using defaults");
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !Self::KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(&content)?;
        tracing::info!(
            path = %path.display(),
            remote = config.backend_url.is_some(),
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Apply `NOTIFEED_API_KEY` if it is set.
    pub fn with_env_overrides(self) -> Self {
        self.with_api_key_override(std::env::var(API_KEY_ENV).ok())
    }

    /// Replace the file's API key with `key` when it is non-empty.
    pub fn with_api_key_override(mut self, key: Option<String>) -> Self {
        if let Some(key) = key.filter(|k| !k.trim().is_empty()) {
            tracing::debug!("Using API key from environment");
            self.api_key = Some(SecretString::from(key));
        }
        self
    }

    pub fn reconcile_debounce(&self) -> Duration {
        Duration::from_millis(self.reconcile_debounce_ms)
    }

    /// Cache arena capacity. Zero is treated as one.
    pub fn max_cached_owners(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.max_cached_owners).unwrap_or(NonZeroUsize::MIN)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn center_options(&self) -> CenterOptions {
        CenterOptions {
            feed_topic: self.feed_topic.clone(),
            reconcile_debounce: self.reconcile_debounce(),
            max_cached_owners: self.max_cached_owners(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
