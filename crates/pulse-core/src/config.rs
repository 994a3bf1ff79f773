use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Cache TTL for hot stream values (seconds).
pub const HOT_CACHE_TTL_SECS: u64 = 60;
/// How long a system-created trigger may stay active without firing.
pub const TRIGGER_RETIRE_HOURS: i64 = 72;
/// Lookback window floor for the trade poll when a connection was never polled.
pub const TRADE_POLL_LOOKBACK_SECS: i64 = 300;

/// Top-level config (pulsed.toml + PULSE_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PulseConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    pub security: SecurityConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub vector: VectorConfig,
    #[serde(default)]
    pub market: MarketConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub health: HealthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CacheConfig {
    /// redis:// URL. Unset means in-process cache only.
    pub redis_url: Option<String>,
}

/// Credentials for the symmetric cipher guarding exchange API keys.
/// Missing or malformed key material aborts startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// base64-encoded 32-byte AES key.
    pub encryption_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    /// Routed to chat-grade tasks: patrol evaluation, briefing commentary.
    #[serde(default = "default_fast_model")]
    pub fast_model: String,
    /// Routed to the signal judge and trade reasoning inference.
    #[serde(default = "default_deep_model")]
    pub deep_model: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: default_llm_base_url(),
            fast_model: default_fast_model(),
            deep_model: default_deep_model(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorConfig {
    #[serde(default)]
    pub api_key: String,
    /// Host of the vector index (embed + upsert + query endpoints).
    #[serde(default)]
    pub base_url: String,
    #[serde(default = "default_vector_index")]
    pub index: String,
    #[serde(default = "default_embed_model")]
    pub embed_model: String,
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: String::new(),
            index: default_vector_index(),
            embed_model: default_embed_model(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MarketConfig {
    /// News headlines source key. Unset yields empty headline sets.
    pub cryptopanic_api_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    pub api_key: Option<String>,
    #[serde(default = "default_search_base_url")]
    pub base_url: String,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: default_search_base_url(),
        }
    }
}

/// Cadences and limits for the monitoring core.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Hot stream poll cadence, seconds.
    #[serde(default = "default_hot_poll_interval")]
    pub hot_poll_interval: u64,
    /// Warm stream poll cadence, seconds.
    #[serde(default = "default_warm_poll_interval")]
    pub warm_poll_interval: u64,
    /// Days since last mention before hot demotes to warm.
    #[serde(default = "default_hot_threshold_days")]
    pub hot_threshold_days: i64,
    /// Days since last mention before warm demotes to cold.
    #[serde(default = "default_warm_threshold_days")]
    pub warm_threshold_days: i64,
    /// Trade detection cadence, seconds.
    #[serde(default = "default_trade_poll_interval")]
    pub trade_poll_interval: u64,
    /// Orders below this percent of total balance value are ignored.
    #[serde(default = "default_dust_threshold_percent")]
    pub dust_threshold_percent: f64,
    /// Patrol cadence, seconds.
    #[serde(default = "default_patrol_interval_seconds")]
    pub patrol_interval_seconds: u64,
    /// Signals per user per UTC day.
    #[serde(default = "default_daily_signal_limit")]
    pub daily_signal_limit: i64,
    /// Maximum simultaneously connected exchanges per user.
    #[serde(default = "default_max_exchanges")]
    pub max_exchanges: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            hot_poll_interval: default_hot_poll_interval(),
            warm_poll_interval: default_warm_poll_interval(),
            hot_threshold_days: default_hot_threshold_days(),
            warm_threshold_days: default_warm_threshold_days(),
            trade_poll_interval: default_trade_poll_interval(),
            dust_threshold_percent: default_dust_threshold_percent(),
            patrol_interval_seconds: default_patrol_interval_seconds(),
            daily_signal_limit: default_daily_signal_limit(),
            max_exchanges: default_max_exchanges(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_health_bind")]
    pub bind: String,
    #[serde(default = "default_health_port")]
    pub port: u16,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            bind: default_health_bind(),
            port: default_health_port(),
        }
    }
}

fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{home}/.pulse/pulse.db")
}
fn default_llm_base_url() -> String {
    "https://api.anthropic.com".to_string()
}
fn default_fast_model() -> String {
    "claude-sonnet-4-5".to_string()
}
fn default_deep_model() -> String {
    "claude-opus-4-6".to_string()
}
fn default_vector_index() -> String {
    "pulse-episodes".to_string()
}
fn default_embed_model() -> String {
    "multilingual-e5-large".to_string()
}
fn default_search_base_url() -> String {
    "https://api.tavily.com".to_string()
}
fn default_hot_poll_interval() -> u64 {
    10
}
fn default_warm_poll_interval() -> u64 {
    1800
}
fn default_hot_threshold_days() -> i64 {
    7
}
fn default_warm_threshold_days() -> i64 {
    30
}
fn default_trade_poll_interval() -> u64 {
    30
}
fn default_dust_threshold_percent() -> f64 {
    1.0
}
fn default_patrol_interval_seconds() -> u64 {
    3600
}
fn default_daily_signal_limit() -> i64 {
    5
}
fn default_max_exchanges() -> usize {
    3
}
fn default_health_bind() -> String {
    "127.0.0.1".to_string()
}
fn default_health_port() -> u16 {
    8787
}

impl PulseConfig {
    /// Load config from a TOML file with PULSE_* env var overrides.
    ///
    /// Section and key are separated by a double underscore, e.g.
    /// `PULSE_MONITOR__HOT_POLL_INTERVAL=5`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: PulseConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("PULSE_").split("__"))
            .extract()
            .map_err(|e| crate::error::PulseError::Config(e.to_string()))?;

        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{home}/.pulse/pulsed.toml")
}
