//! Desk configuration: a TOML file (`SKB_CONFIG`, else `configs/skb.toml`)
//! with every field defaulted, overlaid with `SKB_*` environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::collab::AnswerOptions;
use crate::retry::RetryPolicy;
use crate::types::{Category, FALLBACK_CATEGORY};

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct AggregatorConfig {
    /// Inactivity after which a buffered conversation is complete.
    pub quiet_period_secs: u64,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            quiet_period_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct PendingConfig {
    pub ttl_secs: u64,
}

impl Default for PendingConfig {
    fn default() -> Self {
        Self { ttl_secs: 600 }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct SyncConfig {
    pub interval_mins: u64,
    pub max_attempts: u32,
    pub retry_delay_secs: u64,
    /// Sheet endpoint; sync self-disables when absent.
    pub sink_url: Option<String>,
    pub sink_token: Option<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_mins: 30,
            max_attempts: 3,
            retry_delay_secs: 5,
            sink_url: None,
            sink_token: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct AnalysisConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub chat_model: String,
    pub embedding_model: String,
    /// Inputs longer than this are cut before embedding.
    pub embedding_max_chars: usize,
    /// Sampling temperature for drafted answers.
    pub answer_temperature: f32,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            base_url: "https://openrouter.ai/api/v1".to_string(),
            api_key: None,
            chat_model: "google/gemini-2.5-flash-lite".to_string(),
            embedding_model: "openai/text-embedding-3-small".to_string(),
            embedding_max_chars: 14_000,
            answer_temperature: 0.4,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    /// PostgREST base URL; the in-memory store is used when absent.
    pub url: Option<String>,
    pub service_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct SearchConfig {
    pub match_count: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self { match_count: 3 }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct AccessConfig {
    pub allowed_operators: Vec<i64>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct CategoriesConfig {
    pub fallback: String,
    /// Seeded into an empty store at startup.
    pub defaults: Vec<Category>,
}

impl Default for CategoriesConfig {
    fn default() -> Self {
        Self {
            fallback: FALLBACK_CATEGORY.to_string(),
            defaults: vec![
                Category::new("баги_фронтенд", "Баги на фронтенде (UI, отображение)"),
                Category::new("баги_бэкенд", "Баги на бэкенде (API, сервер)"),
                Category::new("частые_вопросы", "Часто задаваемые вопросы"),
                Category::new("лимиты_баланс", "Вопросы по лимитам и балансу"),
                Category::new("описание_моделей", "Вопросы про модели и их функции"),
                Category::new(FALLBACK_CATEGORY, "Всё остальное"),
            ],
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub aggregator: AggregatorConfig,
    pub pending: PendingConfig,
    pub sync: SyncConfig,
    pub analysis: AnalysisConfig,
    pub store: StoreConfig,
    pub search: SearchConfig,
    pub access: AccessConfig,
    pub categories: CategoriesConfig,
    pub shutdown_grace_secs: u64,
    pub log_dir: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            aggregator: AggregatorConfig::default(),
            pending: PendingConfig::default(),
            sync: SyncConfig::default(),
            analysis: AnalysisConfig::default(),
            store: StoreConfig::default(),
            search: SearchConfig::default(),
            access: AccessConfig::default(),
            categories: CategoriesConfig::default(),
            shutdown_grace_secs: 10,
            log_dir: None,
        }
    }
}

impl Config {
    pub fn quiet_period(&self) -> Duration {
        Duration::from_secs(self.aggregator.quiet_period_secs.max(1))
    }

    pub fn pending_ttl(&self) -> Duration {
        Duration::from_secs(self.pending.ttl_secs.max(1))
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync.interval_mins.max(1) * 60)
    }

    pub fn sync_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(
            self.sync.max_attempts,
            Duration::from_secs(self.sync.retry_delay_secs),
        )
    }

    pub fn answer_options(&self) -> AnswerOptions {
        AnswerOptions {
            temperature: self.analysis.answer_temperature,
        }
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// Overlay `SKB_*` environment variables on top of file values.
    pub fn apply_env_overrides(&mut self) {
        if let Some(v) = env_u64("SKB_QUIET_PERIOD_SECS") {
            self.aggregator.quiet_period_secs = v;
        }
        if let Some(v) = env_u64("SKB_PENDING_TTL_SECS") {
            self.pending.ttl_secs = v;
        }
        if let Some(v) = env_u64("SKB_SYNC_INTERVAL_MINS") {
            self.sync.interval_mins = v;
        }
        if let Some(v) = env_u64("SKB_SYNC_MAX_ATTEMPTS") {
            self.sync.max_attempts = v.min(u32::MAX as u64) as u32;
        }
        if let Some(v) = env_u64("SKB_SYNC_RETRY_DELAY_SECS") {
            self.sync.retry_delay_secs = v;
        }
        if let Some(v) = env_u64("SKB_SHUTDOWN_GRACE_SECS") {
            self.shutdown_grace_secs = v;
        }
        if let Some(v) = env_string("SKB_ANALYSIS_BASE_URL") {
            self.analysis.base_url = v;
        }
        if let Some(v) = env_string("SKB_ANSWER_TEMPERATURE").and_then(|v| v.parse::<f32>().ok()) {
            self.analysis.answer_temperature = v;
        }
        if let Some(v) = env_string("SKB_ANALYSIS_API_KEY") {
            self.analysis.api_key = Some(v);
        }
        if let Some(v) = env_string("SKB_STORE_URL") {
            self.store.url = Some(v);
        }
        if let Some(v) = env_string("SKB_STORE_KEY") {
            self.store.service_key = Some(v);
        }
        if let Some(v) = env_string("SKB_SINK_URL") {
            self.sync.sink_url = Some(v);
        }
        if let Some(v) = env_string("SKB_SINK_TOKEN") {
            self.sync.sink_token = Some(v);
        }
        if let Some(v) = env_string("SKB_LOG_DIR") {
            self.log_dir = Some(v);
        }
        if let Some(raw) = env_string("SKB_ALLOWED_OPERATORS") {
            self.access.allowed_operators = parse_operator_list(&raw);
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_u64(key: &str) -> Option<u64> {
    let raw = env_string(key)?;
    match raw.parse::<u64>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %raw, "ignoring non-numeric override");
            None
        }
    }
}

/// Comma-separated operator ids; blanks and non-numbers are dropped.
pub fn parse_operator_list(raw: &str) -> Vec<i64> {
    raw.split(',')
        .filter_map(|part| part.trim().parse::<i64>().ok())
        .filter(|id| *id != 0)
        .collect()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    let cfg: Config =
        toml::from_str(&content).with_context(|| format!("parsing config {}", path.display()))?;
    Ok(cfg)
}

fn discovered_config_path() -> (Option<PathBuf>, &'static str) {
    if let Some(explicit) = env_string("SKB_CONFIG") {
        return (Some(PathBuf::from(explicit)), "env");
    }
    let default = PathBuf::from("configs/skb.toml");
    if default.exists() {
        (Some(default), "search")
    } else {
        (None, "search")
    }
}

/// File config (when discovered) with environment overrides applied.
pub fn load_effective_config() -> Result<Config> {
    let (path_opt, source) = discovered_config_path();
    let mut cfg = match path_opt {
        Some(path) => {
            let cfg = load_config(&path)?;
            info!(path = %path.display(), source, "loaded config");
            cfg
        }
        None => {
            info!("no config file discovered; using defaults and env overrides");
            Config::default()
        }
    };
    cfg.apply_env_overrides();
    Ok(cfg)
}
