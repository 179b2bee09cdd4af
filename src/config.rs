//! Configuration for Shipwright, read from `.shipwright/shipwright.toml`.
//!
//! Layering: file → environment (`.env` is loaded first by the binary) → CLI
//! flags. Every field has a default, so an empty or missing file is valid.
//!
//! # Configuration File Format
//!
//! ```toml
//! [provider]
//! base_url = "https://api.anthropic.com"
//! model = "claude-sonnet-4-5"
//! secret_name = "anthropic_api_key"
//!
//! [retry]
//! max_attempts = 3
//! base_delay_ms = 1000
//!
//! [stages.implement]
//! max_tokens = 32000
//! model = "claude-opus-4-1"
//!
//! [queue]
//! workers = 4
//!
//! [sweep]
//! interval_secs = 60
//! stale_after_secs = 600
//!
//! [storage]
//! db_path = ".shipwright/shipwright.db"
//! artifact_dir = ".shipwright/artifacts"
//!
//! [server]
//! host = "127.0.0.1"
//! port = 3141
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::llm::RetryPolicy;
use crate::llm::client::{DEFAULT_API_VERSION, DEFAULT_BASE_URL};
use crate::pipeline::{Agent, StageTable};
use crate::queue::QueueSettings;

pub const DEFAULT_CONFIG_PATH: &str = ".shipwright/shipwright.toml";
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-5";
pub const DEFAULT_SECRET_NAME: &str = "anthropic_api_key";

/// Model provider settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderSection {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    /// Model used by every stage without its own override.
    #[serde(default = "default_model")]
    pub model: String,
    /// Name of the per-owner secret holding the provider API key.
    #[serde(default = "default_secret_name")]
    pub secret_name: String,
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_api_version() -> String {
    DEFAULT_API_VERSION.to_string()
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_secret_name() -> String {
    DEFAULT_SECRET_NAME.to_string()
}

impl Default for ProviderSection {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_version: default_api_version(),
            model: default_model(),
            secret_name: default_secret_name(),
        }
    }
}

/// Transport retry settings for 429/529 responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
    #[serde(default = "default_max_retry_after_secs")]
    pub max_retry_after_secs: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_backoff_secs() -> u64 {
    15
}

fn default_max_retry_after_secs() -> u64 {
    30
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_backoff_secs: default_max_backoff_secs(),
            max_retry_after_secs: default_max_retry_after_secs(),
        }
    }
}

/// Per-stage override. Unset fields fall back to the provider model and the
/// stage's built-in token ceiling.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSection {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_max_deliveries")]
    pub max_deliveries: u32,
    #[serde(default = "default_redelivery_delay_ms")]
    pub redelivery_delay_ms: u64,
}

fn default_workers() -> usize {
    4
}

fn default_max_deliveries() -> u32 {
    3
}

fn default_redelivery_delay_ms() -> u64 {
    500
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_deliveries: default_max_deliveries(),
            redelivery_delay_ms: default_redelivery_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepSection {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// A processing job with no update for this long is failed.
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
}

fn default_interval_secs() -> u64 {
    60
}

fn default_stale_after_secs() -> u64 {
    600
}

impl Default for SweepSection {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            stale_after_secs: default_stale_after_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageSection {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default = "default_artifact_dir")]
    pub artifact_dir: PathBuf,
}

fn default_db_path() -> PathBuf {
    PathBuf::from(".shipwright/shipwright.db")
}

fn default_artifact_dir() -> PathBuf {
    PathBuf::from(".shipwright/artifacts")
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            artifact_dir: default_artifact_dir(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3141
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PromptsSection {
    /// Directory of `<agent>.md` files replacing the built-in system prompts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

/// The complete shipwright.toml structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShipwrightConfig {
    #[serde(default)]
    pub provider: ProviderSection,
    #[serde(default)]
    pub retry: RetrySection,
    /// Keyed by stage name: `spec`, `plan`, `tests`, `implement`,
    /// `security_review`, `code_review`, `alignment`.
    #[serde(default)]
    pub stages: BTreeMap<String, StageOverride>,
    #[serde(default)]
    pub queue: QueueSection,
    #[serde(default)]
    pub sweep: SweepSection,
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub prompts: PromptsSection,
}

impl ShipwrightConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse shipwright.toml")
    }

    /// Defaults when `path` does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let content =
            toml::to_string_pretty(self).context("Failed to serialize shipwright.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply `SHIPWRIGHT_*` overrides from the process environment.
    pub fn with_env(self) -> Result<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply `SHIPWRIGHT_*` overrides looked up through `lookup`.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(url) = lookup("SHIPWRIGHT_PROVIDER_URL") {
            self.provider.base_url = url;
        }
        if let Some(model) = lookup("SHIPWRIGHT_MODEL") {
            self.provider.model = model;
        }
        if let Some(path) = lookup("SHIPWRIGHT_DB_PATH") {
            self.storage.db_path = PathBuf::from(path);
        }
        if let Some(dir) = lookup("SHIPWRIGHT_ARTIFACT_DIR") {
            self.storage.artifact_dir = PathBuf::from(dir);
        }
        if let Some(port) = lookup("SHIPWRIGHT_PORT") {
            self.server.port = port
                .parse()
                .with_context(|| format!("Invalid SHIPWRIGHT_PORT '{port}'"))?;
        }
        Ok(self)
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();
        if self.provider.model.trim().is_empty() {
            problems.push("provider.model must not be empty".to_string());
        }
        if self.provider.secret_name.trim().is_empty() {
            problems.push("provider.secret_name must not be empty".to_string());
        }
        if self.retry.max_attempts == 0 {
            problems.push("retry.max_attempts must be at least 1".to_string());
        }
        if self.queue.workers == 0 {
            problems.push("queue.workers must be at least 1".to_string());
        }
        if self.queue.max_deliveries == 0 {
            problems.push("queue.max_deliveries must be at least 1".to_string());
        }
        if self.sweep.interval_secs == 0 {
            problems.push("sweep.interval_secs must be at least 1".to_string());
        }
        for (name, stage) in &self.stages {
            if !Agent::ALL.iter().any(|agent| agent.as_str() == name) {
                problems.push(format!("unknown stage '{name}' in [stages]"));
            }
            if stage.max_tokens == Some(0) {
                problems.push(format!("stages.{name}.max_tokens must be at least 1"));
            }
        }
        if problems.is_empty() {
            Ok(())
        } else {
            anyhow::bail!("Invalid configuration:\n  - {}", problems.join("\n  - "))
        }
    }

    pub fn stage_table(&self) -> StageTable {
        Agent::ALL
            .into_iter()
            .fold(StageTable::new(&self.provider.model), |table, agent| {
                let stage = self.stages.get(agent.as_str());
                let max_tokens = stage
                    .and_then(|s| s.max_tokens)
                    .unwrap_or_else(|| agent.default_max_tokens());
                table.with(agent, max_tokens, stage.and_then(|s| s.model.clone()))
            })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_backoff: Duration::from_secs(self.retry.max_backoff_secs),
            max_retry_after: Duration::from_secs(self.retry.max_retry_after_secs),
        }
    }

    pub fn queue_settings(&self) -> QueueSettings {
        QueueSettings {
            workers: self.queue.workers,
            max_deliveries: self.queue.max_deliveries,
            redelivery_delay: Duration::from_millis(self.queue.redelivery_delay_ms),
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep.interval_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.sweep.stale_after_secs)
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn test_parse_empty_uses_defaults() {
        let config = ShipwrightConfig::parse("").unwrap();
        assert_eq!(config, ShipwrightConfig::default());
        assert_eq!(config.provider.base_url, "https://api.anthropic.com");
        assert_eq!(config.provider.secret_name, "anthropic_api_key");
        assert_eq!(config.server.port, 3141);
        assert_eq!(config.stale_after(), Duration::from_secs(600));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_partial_sections() {
        let config = ShipwrightConfig::parse(
            r#"
[provider]
model = "small-model"

[queue]
workers = 8

[stages.implement]
max_tokens = 64000
model = "big-model"

[stages.spec]
max_tokens = 4000
"#,
        )
        .unwrap();
        assert_eq!(config.queue.workers, 8);
        assert_eq!(config.queue.max_deliveries, 3);

        let table = config.stage_table();
        let implement = table.get(Agent::Implementer);
        assert_eq!(implement.model, "big-model");
        assert_eq!(implement.max_tokens, 64_000);
        let spec = table.get(Agent::Spec);
        assert_eq!(spec.model, "small-model");
        assert_eq!(spec.max_tokens, 4_000);
        assert_eq!(table.get(Agent::Alignment).max_tokens, 2_048);
    }

    #[test]
    fn test_validate_rejects_zero_values_and_unknown_stages() {
        let mut config = ShipwrightConfig::default();
        config.queue.workers = 0;
        config.retry.max_attempts = 0;
        config.stages.insert(
            "deploy".into(),
            StageOverride {
                max_tokens: Some(0),
                model: None,
            },
        );
        let message = config.validate().unwrap_err().to_string();
        assert!(message.contains("queue.workers"));
        assert!(message.contains("retry.max_attempts"));
        assert!(message.contains("unknown stage 'deploy'"));
        assert!(message.contains("stages.deploy.max_tokens"));
    }

    #[test]
    fn test_env_overrides_file_values() {
        let env: HashMap<&str, &str> = [
            ("SHIPWRIGHT_MODEL", "env-model"),
            ("SHIPWRIGHT_PORT", "9000"),
            ("SHIPWRIGHT_DB_PATH", "/tmp/x.db"),
        ]
        .into_iter()
        .collect();
        let config = ShipwrightConfig::parse("[provider]\nmodel = \"file-model\"\n")
            .unwrap()
            .with_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.provider.model, "env-model");
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.storage.db_path, PathBuf::from("/tmp/x.db"));
    }

    #[test]
    fn test_env_rejects_bad_port() {
        let result = ShipwrightConfig::default()
            .with_overrides(|key| (key == "SHIPWRIGHT_PORT").then(|| "http".to_string()));
        assert!(result.is_err());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".shipwright").join("shipwright.toml");
        let mut config = ShipwrightConfig::default();
        config.sweep.stale_after_secs = 120;
        config.stages.insert(
            "code_review".into(),
            StageOverride {
                max_tokens: Some(12_000),
                model: None,
            },
        );
        config.save(&path).unwrap();

        let loaded = ShipwrightConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempdir().unwrap();
        let config = ShipwrightConfig::load_or_default(&dir.path().join("missing.toml")).unwrap();
        assert_eq!(config.queue.workers, 4);
    }

    #[test]
    fn test_retry_and_queue_conversion() {
        let config = ShipwrightConfig::default();
        assert_eq!(config.retry_policy(), RetryPolicy::default());
        let queue = config.queue_settings();
        assert_eq!(queue.workers, 4);
        assert_eq!(queue.redelivery_delay, Duration::from_millis(500));
    }
}
