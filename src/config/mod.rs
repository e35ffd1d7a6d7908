//! Layered gateway configuration.
//!
//! Values are resolved in order: built-in defaults, the JSON config file
//! (`$CHATGATE_CONFIG` or `~/.chatgate/config.json`), a `.env` file, then
//! individual environment overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{GatewayError, Result};
use crate::providers::gemini::{DEFAULT_GEMINI_MODEL, GEMINI_API_BASE};
use crate::session::SessionLimits;

/// Environment variable naming an explicit config file.
pub const CONFIG_PATH_ENV: &str = "CHATGATE_CONFIG";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub backend: BackendConfig,
    pub prompt: PromptConfig,
    pub context: ContextConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address (default: 127.0.0.1).
    pub bind: String,
    pub port: u16,
    /// Maximum accepted request body size.
    pub body_limit_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 8000,
            body_limit_bytes: 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub api_key: Option<String>,
    pub model: String,
    pub api_base: String,
    pub request_timeout_secs: u64,
    pub stream_idle_timeout_secs: u64,
    /// Fragments buffered between the backend pump and the relay.
    pub stream_buffer: usize,
    pub temperature: Option<f32>,
    pub max_output_tokens: Option<u32>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: DEFAULT_GEMINI_MODEL.to_string(),
            api_base: GEMINI_API_BASE.to_string(),
            request_timeout_secs: 120,
            stream_idle_timeout_secs: 60,
            stream_buffer: 32,
            temperature: None,
            max_output_tokens: None,
        }
    }
}

impl BackendConfig {
    pub fn session_limits(&self) -> SessionLimits {
        SessionLimits {
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            idle_timeout: Duration::from_secs(self.stream_idle_timeout_secs),
            stream_buffer: self.stream_buffer,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptConfig {
    /// Lifetime of an admin-set system prompt.
    pub ttl_secs: u64,
    /// Optional file kept in sync with the prompt cache.
    pub file: Option<PathBuf>,
    pub watch_interval_secs: u64,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 300,
            file: None,
            watch_interval_secs: 5,
        }
    }
}

impl PromptConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Where per-user context comes from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextSource {
    #[default]
    None,
    Dummy,
    File,
    Http,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    pub source: ContextSource,
    /// JSON file of `{ user_id: context }` for the `file` source.
    pub path: Option<PathBuf>,
    /// Base URL for the `http` source.
    pub url: Option<String>,
    pub timeout_secs: u64,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            source: ContextSource::None,
            path: None,
            url: None,
            timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl Config {
    /// Default config file location: `~/.chatgate/config.json`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".chatgate").join("config.json"))
    }

    /// Load the full layered configuration.
    ///
    /// `explicit` takes precedence over `$CHATGATE_CONFIG`. A missing default
    /// file is not an error; a missing explicit file is.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut config = match explicit
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from))
        {
            Some(path) => Self::from_file(&path)?,
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::from_file(&path)?,
                _ => Self::default(),
            },
        };

        if let Ok(path) = dotenvy::dotenv() {
            debug!(path = %path.display(), "Loaded .env");
        }
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        serde_json::from_str(&raw)
            .map_err(|e| GatewayError::Config(format!("invalid JSON in {}: {e}", path.display())))
    }

    /// Apply environment overrides, reading variables through `lookup`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(key) = non_empty("GENAI_API_KEY") {
            self.backend.api_key = Some(key);
        }
        if let Some(model) = non_empty("GENAI_MODEL") {
            self.backend.model = model;
        }
        if let Some(bind) = non_empty("CHATGATE_BIND") {
            self.server.bind = bind;
        }
        if let Some(port) = non_empty("CHATGATE_PORT").and_then(|v| v.trim().parse().ok()) {
            self.server.port = port;
        }
        if let Some(ttl) = non_empty("CHATGATE_PROMPT_TTL_SECS").and_then(|v| v.trim().parse().ok())
        {
            self.prompt.ttl_secs = ttl;
        }
        if let Some(file) = non_empty("CHATGATE_PROMPT_FILE") {
            self.prompt.file = Some(PathBuf::from(file));
        }
        if let Some(level) = non_empty("CHATGATE_LOG") {
            self.logging.level = level;
        }
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(GatewayError::Config(msg.to_string()));

        if self.prompt.ttl_secs == 0 {
            return fail("prompt.ttl_secs must be greater than zero");
        }
        if self.prompt.file.is_some() && self.prompt.watch_interval_secs == 0 {
            return fail("prompt.watch_interval_secs must be greater than zero");
        }
        if self.backend.stream_buffer == 0 {
            return fail("backend.stream_buffer must be greater than zero");
        }
        if self.backend.request_timeout_secs == 0 || self.backend.stream_idle_timeout_secs == 0 {
            return fail("backend timeouts must be greater than zero");
        }
        if self.context.timeout_secs == 0 {
            return fail("context.timeout_secs must be greater than zero");
        }
        match self.context.source {
            ContextSource::File if self.context.path.is_none() => {
                return fail("context.path is required when context.source is \"file\"");
            }
            ContextSource::Http if self.context.url.is_none() => {
                return fail("context.url is required when context.source is \"http\"");
            }
            _ => {}
        }
        Ok(())
    }

    /// Copy with secrets masked, for display.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.backend.api_key.is_some() {
            copy.backend.api_key = Some("***".to_string());
        }
        copy
    }
}
