//! Application configuration for the threat forecaster.
//!
//! User config lives at `~/.biothreat/biothreat.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ForecastError, Result};
use crate::types::ThreatLevel;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "biothreat.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".biothreat";

// ---------------------------------------------------------------------------
// Config structs (matching biothreat.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Database location.
    #[serde(default)]
    pub storage: StorageConfig,

    /// OpenRouter settings.
    #[serde(default)]
    pub openrouter: OpenRouterConfig,

    /// Extraction and mapping policy.
    #[serde(default)]
    pub pipeline: PipelineSettings,

    /// Source fetching.
    #[serde(default)]
    pub fetch: FetchSettings,

    /// Cycle coordination.
    #[serde(default)]
    pub cycle: CycleConfig,
}

/// `[storage]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to the libSQL database file.
    #[serde(default = "default_database_path")]
    pub database_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

fn default_database_path() -> String {
    "./data/biothreat.db".into()
}

/// `[openrouter]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenRouterConfig {
    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// API base URL; `/chat/completions` is appended.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Model used for extraction and scoring.
    #[serde(default = "default_model")]
    pub default_model: String,

    /// Per-call timeout.
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

impl Default for OpenRouterConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_api_key_env(),
            base_url: default_base_url(),
            default_model: default_model(),
            timeout_secs: default_llm_timeout(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
        }
    }
}

fn default_api_key_env() -> String {
    "OPENROUTER_API_KEY".into()
}
fn default_base_url() -> String {
    "https://openrouter.ai/api/v1".into()
}
fn default_model() -> String {
    "anthropic/claude-sonnet-4".into()
}
fn default_llm_timeout() -> u64 {
    90
}
fn default_max_tokens() -> u32 {
    2000
}
fn default_temperature() -> f32 {
    0.2
}

/// `[pipeline]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSettings {
    /// Extraction candidates below this confidence are discarded.
    #[serde(default = "default_half")]
    pub confidence_threshold: f64,

    /// Mapping scores below this floor are not persisted.
    #[serde(default = "default_half")]
    pub relevance_floor: f64,

    /// Maximum in-flight calls per stage.
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,

    /// Failed documents/pairs are retried on later cycles up to this many attempts.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Document text is truncated to this many characters before extraction.
    #[serde(default = "default_max_document_chars")]
    pub max_document_chars: usize,

    /// A category's highest active score at or above this is `medium`.
    #[serde(default = "default_half")]
    pub level_medium: f64,

    /// Highest active score at or above this is `high`.
    #[serde(default = "default_level_high")]
    pub level_high: f64,

    /// Highest active score at or above this is `critical`.
    #[serde(default = "default_level_critical")]
    pub level_critical: f64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            confidence_threshold: default_half(),
            relevance_floor: default_half(),
            concurrency: default_concurrency(),
            max_attempts: default_max_attempts(),
            max_document_chars: default_max_document_chars(),
            level_medium: default_half(),
            level_high: default_level_high(),
            level_critical: default_level_critical(),
        }
    }
}

fn default_half() -> f64 {
    0.5
}
fn default_level_high() -> f64 {
    0.7
}
fn default_level_critical() -> f64 {
    0.85
}
fn default_concurrency() -> u32 {
    4
}
fn default_max_attempts() -> u32 {
    3
}
fn default_max_document_chars() -> usize {
    12_000
}

/// `[fetch]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchSettings {
    /// Per-source request timeout.
    #[serde(default = "default_fetch_timeout")]
    pub timeout_secs: u64,

    /// Most recent entries taken from each source per cycle.
    #[serde(default = "default_max_items")]
    pub max_items_per_source: usize,

    /// Permit loopback/private endpoints (local mirrors, mock servers).
    #[serde(default)]
    pub allow_private_hosts: bool,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_fetch_timeout(),
            max_items_per_source: default_max_items(),
            allow_private_hosts: false,
        }
    }
}

fn default_fetch_timeout() -> u64 {
    30
}
fn default_max_items() -> usize {
    20
}

/// `[cycle]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleConfig {
    /// Catalog load timeout; exceeding it fails the cycle.
    #[serde(default = "default_catalog_timeout")]
    pub catalog_timeout_secs: u64,

    /// A `running` cycle with no recorded progress for this long is considered abandoned.
    #[serde(default = "default_stale_after")]
    pub stale_after_mins: u64,

    /// Interval for `cycle watch`.
    #[serde(default = "default_schedule_interval")]
    pub schedule_interval_mins: u64,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            catalog_timeout_secs: default_catalog_timeout(),
            stale_after_mins: default_stale_after(),
            schedule_interval_mins: default_schedule_interval(),
        }
    }
}

fn default_catalog_timeout() -> u64 {
    10
}
fn default_stale_after() -> u64 {
    120
}
fn default_schedule_interval() -> u64 {
    360
}

impl AppConfig {
    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        let p = &self.pipeline;
        for (name, value) in [
            ("pipeline.confidence_threshold", p.confidence_threshold),
            ("pipeline.relevance_floor", p.relevance_floor),
            ("pipeline.level_medium", p.level_medium),
            ("pipeline.level_high", p.level_high),
            ("pipeline.level_critical", p.level_critical),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ForecastError::config(format!(
                    "{name} must be within [0, 1], got {value}"
                )));
            }
        }
        if !(p.level_medium <= p.level_high && p.level_high <= p.level_critical) {
            return Err(ForecastError::config(
                "pipeline.level_medium, level_high and level_critical must be ascending",
            ));
        }
        if p.concurrency == 0 {
            return Err(ForecastError::config("pipeline.concurrency must be at least 1"));
        }
        if p.max_attempts == 0 {
            return Err(ForecastError::config("pipeline.max_attempts must be at least 1"));
        }
        if self.fetch.timeout_secs == 0
            || self.openrouter.timeout_secs == 0
            || self.cycle.catalog_timeout_secs == 0
        {
            return Err(ForecastError::config("timeouts must be greater than zero"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Runtime views (merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime fetch configuration.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub timeout: Duration,
    pub max_items_per_source: usize,
    pub allow_private_hosts: bool,
}

impl From<&AppConfig> for FetchConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            timeout: Duration::from_secs(config.fetch.timeout_secs),
            max_items_per_source: config.fetch.max_items_per_source,
            allow_private_hosts: config.fetch.allow_private_hosts,
        }
    }
}

/// Runtime extraction/mapping policy.
#[derive(Debug, Clone)]
pub struct PipelinePolicy {
    pub confidence_threshold: f64,
    pub relevance_floor: f64,
    pub concurrency: usize,
    pub max_attempts: u32,
    pub max_document_chars: usize,
    /// Timeout applied to each language-model call.
    pub call_timeout: Duration,
    pub catalog_timeout: Duration,
    pub stale_after: Duration,
}

impl From<&AppConfig> for PipelinePolicy {
    fn from(config: &AppConfig) -> Self {
        Self {
            confidence_threshold: config.pipeline.confidence_threshold,
            relevance_floor: config.pipeline.relevance_floor,
            concurrency: config.pipeline.concurrency.max(1) as usize,
            max_attempts: config.pipeline.max_attempts,
            max_document_chars: config.pipeline.max_document_chars,
            call_timeout: Duration::from_secs(config.openrouter.timeout_secs),
            catalog_timeout: Duration::from_secs(config.cycle.catalog_timeout_secs),
            stale_after: Duration::from_secs(config.cycle.stale_after_mins * 60),
        }
    }
}

/// Score cut points that turn a category's highest active score into a [`ThreatLevel`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThreatLevelCuts {
    pub medium: f64,
    pub high: f64,
    pub critical: f64,
}

impl ThreatLevelCuts {
    /// Categories without active mappings are `low`.
    pub fn level(&self, max_score: Option<f64>) -> ThreatLevel {
        match max_score {
            Some(s) if s >= self.critical => ThreatLevel::Critical,
            Some(s) if s >= self.high => ThreatLevel::High,
            Some(s) if s >= self.medium => ThreatLevel::Medium,
            _ => ThreatLevel::Low,
        }
    }
}

impl From<&AppConfig> for ThreatLevelCuts {
    fn from(config: &AppConfig) -> Self {
        Self {
            medium: config.pipeline.level_medium,
            high: config.pipeline.level_high,
            critical: config.pipeline.level_critical,
        }
    }
}

impl Default for ThreatLevelCuts {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl Default for PipelinePolicy {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.biothreat/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| ForecastError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.biothreat/biothreat.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| ForecastError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content)
        .map_err(|e| ForecastError::config(format!("failed to parse {}: {e}", path.display())))?;
    config.validate()?;
    Ok(config)
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| ForecastError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| ForecastError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| ForecastError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Check that the OpenRouter API key env var is set and non-empty, returning it.
pub fn validate_api_key(config: &AppConfig) -> Result<String> {
    let var_name = &config.openrouter.api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(val),
        _ => Err(ForecastError::config(format!(
            "OpenRouter API key not found. Set the {var_name} environment variable.\n\
             Get a key at https://openrouter.ai/keys"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("database_path"));
        assert!(toml_str.contains("OPENROUTER_API_KEY"));
        assert!(toml_str.contains("relevance_floor"));
    }

    #[test]
    fn partial_file_fills_defaults() {
        let toml_str = r#"
[pipeline]
relevance_floor = 0.7

[fetch]
allow_private_hosts = true
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.pipeline.relevance_floor, 0.7);
        assert_eq!(config.pipeline.confidence_threshold, 0.5);
        assert_eq!(config.pipeline.concurrency, 4);
        assert!(config.fetch.allow_private_hosts);
        assert_eq!(config.fetch.max_items_per_source, 20);
        assert_eq!(config.openrouter.timeout_secs, 90);
        config.validate().expect("valid");
    }

    #[test]
    fn validate_rejects_out_of_range_threshold() {
        let mut config = AppConfig::default();
        config.pipeline.confidence_threshold = 1.5;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("confidence_threshold"));

        let mut config = AppConfig::default();
        config.pipeline.concurrency = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn threat_level_cuts() {
        let cuts = ThreatLevelCuts::default();
        assert_eq!(cuts.level(None), ThreatLevel::Low);
        assert_eq!(cuts.level(Some(0.3)), ThreatLevel::Low);
        assert_eq!(cuts.level(Some(0.5)), ThreatLevel::Medium);
        assert_eq!(cuts.level(Some(0.7)), ThreatLevel::High);
        assert_eq!(cuts.level(Some(0.92)), ThreatLevel::Critical);

        let mut config = AppConfig::default();
        config.pipeline.level_high = 0.9;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("ascending"));
    }

    #[test]
    fn runtime_views_from_app_config() {
        let app = AppConfig::default();
        let fetch = FetchConfig::from(&app);
        assert_eq!(fetch.timeout, Duration::from_secs(30));
        assert!(!fetch.allow_private_hosts);

        let policy = PipelinePolicy::from(&app);
        assert_eq!(policy.concurrency, 4);
        assert_eq!(policy.call_timeout, Duration::from_secs(90));
        assert_eq!(policy.stale_after, Duration::from_secs(120 * 60));
    }

    #[test]
    fn load_config_from_file() {
        let path = std::env::temp_dir().join(format!("biothreat-config-{}.toml", uuid::Uuid::now_v7()));
        std::fs::write(&path, "[storage]\ndatabase_path = \"/tmp/x.db\"\n").unwrap();
        let config = load_config_from(&path).expect("load");
        assert_eq!(config.storage.database_path, "/tmp/x.db");
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn api_key_validation() {
        let mut config = AppConfig::default();
        // Use a unique env var name to avoid interfering with other tests
        config.openrouter.api_key_env = "BIOTHREAT_TEST_NONEXISTENT_KEY_12345".into();
        let result = validate_api_key(&config);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("API key not found"));
    }
}
