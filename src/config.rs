use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::dispatcher::UnmatchedPolicy;
use crate::error::ConfigError;
use crate::event::Scope;
use crate::plugins::{PatternType, PluginDescriptor};

/// Upper bound on dedup retention (30 days).
const MAX_RETENTION_SECS: u64 = 30 * 24 * 60 * 60;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_slack_config")]
    pub slack: SlackConfig,
    #[serde(default = "default_server_config")]
    pub server: ServerConfig,
    #[serde(default = "default_dedup_config")]
    pub dedup: DedupConfig,
    #[serde(default = "default_queue_config")]
    pub queue: QueueConfig,
    #[serde(default = "default_dispatch_config")]
    pub dispatch: DispatchConfig,
    #[serde(default = "default_plugins")]
    pub plugins: Vec<PluginDescriptor>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SlackConfig {
    /// `xoxb-` token; empty means responses are only logged
    #[serde(default)]
    pub bot_token: String,
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_ack_deadline_ms")]
    pub ack_deadline_ms: u64,
    #[serde(default = "default_publish_timeout_ms")]
    pub publish_timeout_ms: u64,
    /// Budget for each ingress dedup store call; expiry counts as first seen
    #[serde(default = "default_dedup_timeout_ms")]
    pub dedup_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DedupBackend {
    #[default]
    Memory,
    Sqlite,
}

impl std::fmt::Display for DedupBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DedupBackend::Memory => write!(f, "memory"),
            DedupBackend::Sqlite => write!(f, "sqlite"),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DedupConfig {
    #[serde(default)]
    pub backend: DedupBackend,
    #[serde(default = "default_db_path")]
    pub database_path: PathBuf,
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
    /// How long a SQLite writer waits on another instance's lock
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// Six-field cron expression for the eviction sweep
    #[serde(default = "default_sweep_cron")]
    pub sweep_cron: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,
    /// Dead letters kept for inspection; older ones are dropped first
    #[serde(default = "default_dead_letter_limit")]
    pub dead_letter_limit: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DispatchConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_plugin_timeout_ms")]
    pub plugin_timeout_ms: u64,
    #[serde(default)]
    pub unmatched: UnmatchedPolicy,
}

fn default_api_base_url() -> String {
    "https://slack.com/api".to_string()
}

fn default_bind() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_ack_deadline_ms() -> u64 {
    3000
}

fn default_publish_timeout_ms() -> u64 {
    1000
}

fn default_dedup_timeout_ms() -> u64 {
    500
}

fn default_db_path() -> PathBuf {
    PathBuf::from("relaybot.db")
}

fn default_retention_secs() -> u64 {
    300
}

fn default_busy_timeout_ms() -> u64 {
    250
}

fn default_sweep_cron() -> String {
    "0 * * * * *".to_string()
}

fn default_capacity() -> usize {
    1024
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    1000
}

fn default_visibility_timeout_secs() -> u64 {
    30
}

fn default_dead_letter_limit() -> usize {
    1000
}

fn default_workers() -> usize {
    8
}

fn default_plugin_timeout_ms() -> u64 {
    10_000
}

fn default_slack_config() -> SlackConfig {
    SlackConfig {
        bot_token: String::new(),
        api_base_url: default_api_base_url(),
    }
}

fn default_server_config() -> ServerConfig {
    ServerConfig {
        bind: default_bind(),
        ack_deadline_ms: default_ack_deadline_ms(),
        publish_timeout_ms: default_publish_timeout_ms(),
        dedup_timeout_ms: default_dedup_timeout_ms(),
    }
}

fn default_dedup_config() -> DedupConfig {
    DedupConfig {
        backend: DedupBackend::default(),
        database_path: default_db_path(),
        retention_secs: default_retention_secs(),
        busy_timeout_ms: default_busy_timeout_ms(),
        sweep_cron: default_sweep_cron(),
    }
}

fn default_queue_config() -> QueueConfig {
    QueueConfig {
        capacity: default_capacity(),
        max_attempts: default_max_attempts(),
        backoff_ms: default_backoff_ms(),
        visibility_timeout_secs: default_visibility_timeout_secs(),
        dead_letter_limit: default_dead_letter_limit(),
    }
}

fn default_dispatch_config() -> DispatchConfig {
    DispatchConfig {
        workers: default_workers(),
        plugin_timeout_ms: default_plugin_timeout_ms(),
        unmatched: UnmatchedPolicy::default(),
    }
}

/// The built-in plugins, used when the file has no `[[plugins]]` entries.
fn default_plugins() -> Vec<PluginDescriptor> {
    let builtin = |name: &str, patterns: &[&str], pattern_type, scope, description: &str| PluginDescriptor {
        name: name.to_string(),
        patterns: patterns.iter().map(|p| p.to_string()).collect(),
        pattern_type,
        enabled: true,
        scope,
        description: description.to_string(),
        handler: None,
    };
    vec![
        builtin(
            "incident",
            &[r"\bincident\s*#?(?P<id>\d+)"],
            PatternType::Regex,
            Scope::Any,
            "Look up an incident by number",
        ),
        builtin("ping", &["ping"], PatternType::Literal, Scope::Channel, "Check the bot is alive"),
        builtin("status", &["status"], PatternType::Literal, Scope::Any, "Bot health and uptime"),
        builtin("help", &["help"], PatternType::Literal, Scope::Any, "List available commands"),
    ]
}

impl ServerConfig {
    pub fn ack_deadline(&self) -> Duration {
        Duration::from_millis(self.ack_deadline_ms)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    pub fn dedup_timeout(&self) -> Duration {
        Duration::from_millis(self.dedup_timeout_ms)
    }
}

impl DedupConfig {
    /// Retention window. `validate` caps `retention_secs`, so this cannot overflow.
    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.retention_secs.min(MAX_RETENTION_SECS) as i64)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

impl QueueConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }
}

impl DispatchConfig {
    pub fn plugin_timeout(&self) -> Duration {
        Duration::from_millis(self.plugin_timeout_ms)
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let mut config = Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        if let Ok(token) = std::env::var("SLACK_BOT_TOKEN") {
            if !token.is_empty() {
                config.slack.bot_token = token;
            }
        }

        Ok(config)
    }

    /// Parse and validate TOML content.
    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the timing relations the pipeline depends on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.publish_timeout_ms == 0 || self.server.publish_timeout_ms >= self.server.ack_deadline_ms {
            return Err(ConfigError::Invalid(format!(
                "server.publish_timeout_ms ({}) must be positive and below server.ack_deadline_ms ({})",
                self.server.publish_timeout_ms, self.server.ack_deadline_ms
            )));
        }
        // Ingress worst case: dedup check, publish, then releasing the mark.
        let ingress_budget = self
            .server
            .dedup_timeout_ms
            .saturating_mul(2)
            .saturating_add(self.server.publish_timeout_ms);
        if self.server.dedup_timeout_ms == 0 || ingress_budget >= self.server.ack_deadline_ms {
            return Err(ConfigError::Invalid(format!(
                "2 x server.dedup_timeout_ms ({}) plus server.publish_timeout_ms ({}) must be positive and below server.ack_deadline_ms ({})",
                self.server.dedup_timeout_ms, self.server.publish_timeout_ms, self.server.ack_deadline_ms
            )));
        }
        if self.dedup.busy_timeout_ms >= self.server.dedup_timeout_ms {
            return Err(ConfigError::Invalid(format!(
                "dedup.busy_timeout_ms ({}) must be below server.dedup_timeout_ms ({})",
                self.dedup.busy_timeout_ms, self.server.dedup_timeout_ms
            )));
        }
        if self.dispatch.plugin_timeout() >= self.queue.visibility_timeout() {
            return Err(ConfigError::Invalid(format!(
                "dispatch.plugin_timeout_ms ({}) must be below queue.visibility_timeout_secs ({}s)",
                self.dispatch.plugin_timeout_ms, self.queue.visibility_timeout_secs
            )));
        }
        if self.queue.max_attempts == 0 {
            return Err(ConfigError::Invalid("queue.max_attempts must be at least 1".to_string()));
        }
        if self.dedup.retention_secs == 0 || self.dedup.retention_secs > MAX_RETENTION_SECS {
            return Err(ConfigError::Invalid(format!(
                "dedup.retention_secs ({}) must be between 1 and {}",
                self.dedup.retention_secs, MAX_RETENTION_SECS
            )));
        }
        if self.dispatch.workers == 0 {
            return Err(ConfigError::Invalid("dispatch.workers must be at least 1".to_string()));
        }
        Ok(())
    }
}
