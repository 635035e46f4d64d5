use serde::Deserialize;
use std::path::Path;

use crate::grade::calculator::DEFAULT_FLOOR_THRESHOLD;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub web: WebConfig,
    #[serde(default)]
    pub grading: GradingConfig,
    #[serde(default)]
    pub journal: JournalConfig,
    #[serde(default)]
    pub mail: MailConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebConfig {
    #[serde(default = "default_web_address")]
    pub address: String,
    #[serde(default = "default_web_port")]
    pub port: u16,
    /// Allow any origin (grading UIs are usually served from another host)
    #[serde(default = "default_true")]
    pub permissive_cors: bool,
}

/// Canonical grading policy. Activities may override the threshold.
#[derive(Debug, Deserialize, Clone)]
pub struct GradingConfig {
    /// Below this no penalty applies; above it penalized grades cannot fall under it
    #[serde(default = "default_floor_threshold")]
    pub floor_threshold: f64,
    /// Penalty used by the "never submitted" shortcut
    #[serde(default = "default_max_penalty")]
    pub max_penalty: f64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct JournalConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Max journal entries before rotation
    #[serde(default = "default_journal_max")]
    pub max_entries: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MailConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_mail_from")]
    pub from: String,
    /// Public URL prefix for student feedback links
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_outbox_max")]
    pub max_outbox: usize,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct StorageConfig {
    /// Snapshot file. In-memory only when unset.
    pub path: Option<String>,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            address: default_web_address(),
            port: default_web_port(),
            permissive_cors: true,
        }
    }
}

impl Default for GradingConfig {
    fn default() -> Self {
        Self {
            floor_threshold: default_floor_threshold(),
            max_penalty: default_max_penalty(),
        }
    }
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: default_journal_max(),
        }
    }
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            from: default_mail_from(),
            base_url: default_base_url(),
            max_outbox: default_outbox_max(),
        }
    }
}

// Default value functions
fn default_true() -> bool { true }
fn default_web_address() -> String { "127.0.0.1".to_string() }
fn default_web_port() -> u16 { 8080 }
fn default_floor_threshold() -> f64 { DEFAULT_FLOOR_THRESHOLD }
fn default_max_penalty() -> f64 { 15.0 }
fn default_journal_max() -> usize { 100_000 }
fn default_mail_from() -> String { "grades@localhost".to_string() }
fn default_base_url() -> String { "http://127.0.0.1:8080".to_string() }
fn default_outbox_max() -> usize { 10_000 }

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file '{}': {}", path, e))?;
        Self::parse(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config '{}': {}", path, e))
    }

    /// Load the config, falling back to defaults when the file does not exist
    pub fn load_or_default(path: &str) -> anyhow::Result<Self> {
        if Path::new(path).exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)?;
        if !config.grading.floor_threshold.is_finite() || config.grading.floor_threshold < 0.0 {
            anyhow::bail!("grading.floor_threshold must be a non-negative number");
        }
        if !config.grading.max_penalty.is_finite() || config.grading.max_penalty < 0.0 {
            anyhow::bail!("grading.max_penalty must be a non-negative number");
        }
        Ok(config)
    }
}
