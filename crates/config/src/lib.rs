//! Configuration loading, validation, and management for pincer.
//!
//! Loads configuration from `~/.pincer/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.pincer/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// API key shared by providers that do not set their own
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Default model
    #[serde(default = "default_model")]
    pub default_model: String,

    /// Default temperature
    #[serde(default = "default_temperature")]
    pub default_temperature: f32,

    /// Default max tokens per LLM response
    #[serde(default = "default_max_tokens")]
    pub default_max_tokens: u32,

    /// Agent loop settings
    #[serde(default)]
    pub agent: AgentSettings,

    /// Outbound call throttle
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Per-exchange retry policy
    #[serde(default)]
    pub retry: RetryConfig,

    /// Context window management
    #[serde(default)]
    pub compaction: CompactionConfig,

    /// Upstream providers, in failover order
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

fn default_model() -> String {
    "gpt-4o-mini".into()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    4096
}

fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("api_key", &redact(&self.api_key))
            .field("default_model", &self.default_model)
            .field("default_temperature", &self.default_temperature)
            .field("default_max_tokens", &self.default_max_tokens)
            .field("agent", &self.agent)
            .field("rate_limit", &self.rate_limit)
            .field("retry", &self.retry)
            .field("compaction", &self.compaction)
            .field("providers", &self.providers)
            .finish()
    }
}

/// Which wire dialect a provider speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// `/chat/completions` with `tools[].function` definitions
    Openai,
    /// Messages API with typed content blocks
    Anthropic,
    /// Local chat server (`/api/chat`)
    Ollama,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub kind: ProviderKind,

    /// Display name (defaults to the kind)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,

    /// Model override for this provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Failover timeout for one exchange with this provider
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    120
}

impl ProviderConfig {
    pub fn new(kind: ProviderKind) -> Self {
        Self {
            kind,
            name: None,
            api_key: None,
            api_url: None,
            model: None,
            timeout_secs: default_timeout_secs(),
        }
    }

    /// The configured name, or the lowercase kind.
    pub fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| {
            match self.kind {
                ProviderKind::Openai => "openai",
                ProviderKind::Anthropic => "anthropic",
                ProviderKind::Ollama => "ollama",
            }
            .to_string()
        })
    }
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("api_key", &redact(&self.api_key))
            .field("api_url", &self.api_url)
            .field("model", &self.model)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,

    /// Upper bound on model calls per turn
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Turns processed concurrently by the bus loop
    #[serde(default = "default_max_concurrent_turns")]
    pub max_concurrent_turns: usize,

    /// Messages of stored history loaded per turn
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

fn default_system_prompt() -> String {
    "You are a helpful personal assistant. Use the available tools when they help \
     answer the user, and answer directly when they do not."
        .into()
}
fn default_max_iterations() -> u32 {
    20
}
fn default_max_concurrent_turns() -> usize {
    3
}
fn default_history_limit() -> usize {
    50
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            system_prompt: default_system_prompt(),
            max_iterations: default_max_iterations(),
            max_concurrent_turns: default_max_concurrent_turns(),
            history_limit: default_history_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Calls allowed back to back
    #[serde(default = "default_burst")]
    pub burst: u32,

    /// Sustained calls per minute
    #[serde(default = "default_per_minute")]
    pub per_minute: f64,
}

fn default_burst() -> u32 {
    5
}
fn default_per_minute() -> f64 {
    30.0
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            burst: default_burst(),
            per_minute: default_per_minute(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Unit of the quadratic backoff (attempt² × base)
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    1000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    /// Estimated tokens above which history gets summarized
    #[serde(default = "default_token_budget")]
    pub token_budget: usize,

    /// Most recent messages always kept verbatim
    #[serde(default = "default_min_recent")]
    pub min_recent: usize,

    #[serde(default = "default_summary_max_tokens")]
    pub summary_max_tokens: u32,
}

fn default_token_budget() -> usize {
    6000
}
fn default_min_recent() -> usize {
    10
}
fn default_summary_max_tokens() -> u32 {
    512
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            token_budget: default_token_budget(),
            min_recent: default_min_recent(),
            summary_max_tokens: default_summary_max_tokens(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.pincer/config.toml).
    ///
    /// Also checks environment variables:
    /// - `PINCER_API_KEY` (highest priority), then `OPENAI_API_KEY`,
    ///   then `ANTHROPIC_API_KEY`
    /// - `PINCER_MODEL`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;

        if config.api_key.is_none() {
            config.api_key = std::env::var("PINCER_API_KEY")
                .ok()
                .or_else(|| std::env::var("OPENAI_API_KEY").ok())
                .or_else(|| std::env::var("ANTHROPIC_API_KEY").ok());
        }

        if let Ok(model) = std::env::var("PINCER_MODEL") {
            config.default_model = model;
        }

        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        Self::from_toml(&content).map_err(|e| match e {
            ConfigError::ParseError { reason, .. } => ConfigError::ParseError {
                path: path.to_path_buf(),
                reason,
            },
            other => other,
        })
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::ParseError {
            path: PathBuf::new(),
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".pincer")
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=2.0).contains(&self.default_temperature) {
            return Err(ConfigError::ValidationError(
                "default_temperature must be between 0.0 and 2.0".into(),
            ));
        }

        if self.agent.max_iterations == 0 {
            return Err(ConfigError::ValidationError(
                "agent.max_iterations must be > 0".into(),
            ));
        }

        if self.agent.max_concurrent_turns == 0 {
            return Err(ConfigError::ValidationError(
                "agent.max_concurrent_turns must be > 0".into(),
            ));
        }

        if let Some(p) = self.providers.iter().find(|p| p.timeout_secs == 0) {
            return Err(ConfigError::ValidationError(format!(
                "provider '{}' has a zero timeout",
                p.display_name()
            )));
        }

        Ok(())
    }

    /// Providers in failover order. An empty list yields a single
    /// OpenAI-compatible entry using the shared API key.
    pub fn provider_chain(&self) -> Vec<ProviderConfig> {
        if self.providers.is_empty() {
            vec![ProviderConfig::new(ProviderKind::Openai)]
        } else {
            self.providers.clone()
        }
    }

    /// Generate a default config TOML string (for the `onboard` command).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            default_model: default_model(),
            default_temperature: default_temperature(),
            default_max_tokens: default_max_tokens(),
            agent: AgentSettings::default(),
            rate_limit: RateLimitConfig::default(),
            retry: RetryConfig::default(),
            compaction: CompactionConfig::default(),
            providers: Vec::new(),
        }
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
