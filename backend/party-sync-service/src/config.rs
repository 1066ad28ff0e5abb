use crate::error::AppError;
use crate::hub::HubConfig;
use actix_middleware::RateLimitConfig;
use serde::Deserialize;
use std::time::Duration;
use validator::Validate;

/// Service configuration, read from the environment
///
/// Every field maps to the upper-case env var of the same name
/// (`app_port` -> `APP_PORT`). A `.env` file is honored for local runs.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct Config {
    #[serde(default = "default_app_host")]
    pub app_host: String,

    #[serde(default = "default_app_port")]
    #[validate(range(min = 1))]
    pub app_port: u16,

    #[serde(default = "default_api_version")]
    pub api_version: String,

    /// `redis://...` for a shared backbone, `memory://[name]` for a single process
    #[serde(default = "default_redis_url")]
    #[validate(length(min = 1))]
    pub redis_url: String,

    #[serde(default = "default_max_connections")]
    #[validate(range(min = 1, max = 500))]
    pub max_connections_per_campaign: usize,

    #[serde(default = "default_history_limit")]
    #[validate(range(min = 1, max = 500))]
    pub history_limit: usize,

    #[serde(default = "default_action_dedupe_limit")]
    #[validate(range(min = 1, max = 10000))]
    pub action_dedupe_limit: usize,

    #[serde(default = "default_max_campaigns")]
    #[validate(range(min = 1, max = 100000))]
    pub max_campaigns: usize,

    /// Shared secret for WebSocket clients; unset or empty disables the check
    #[serde(default)]
    pub ws_api_key: Option<String>,

    #[serde(default)]
    pub rate_limit_enabled: bool,

    #[serde(default = "default_rate_limit_rps")]
    #[validate(range(min = 1))]
    pub rate_limit_rps: u32,

    #[serde(default = "default_rate_limit_burst")]
    #[validate(range(min = 1))]
    pub rate_limit_burst: u32,

    #[serde(default = "default_poll_timeout_ms")]
    #[validate(range(min = 10, max = 60000))]
    pub backbone_poll_timeout_ms: u64,

    #[serde(default = "default_idle_sleep_ms")]
    #[validate(range(max = 1000))]
    pub backbone_idle_sleep_ms: u64,

    /// 0 keeps history until it is evicted by size
    #[serde(default = "default_history_ttl_secs")]
    #[validate(range(max = 604800))]
    pub history_ttl_secs: u64,

    #[serde(default = "default_heartbeat_secs")]
    #[validate(range(min = 1, max = 3600))]
    pub heartbeat_interval_secs: u64,

    /// `text` or `json`
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

fn default_app_host() -> String {
    "0.0.0.0".to_string()
}

fn default_app_port() -> u16 {
    8085
}

fn default_api_version() -> String {
    "1.0.0".to_string()
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_max_connections() -> usize {
    32
}

fn default_history_limit() -> usize {
    50
}

fn default_action_dedupe_limit() -> usize {
    256
}

fn default_max_campaigns() -> usize {
    1000
}

fn default_rate_limit_rps() -> u32 {
    20
}

fn default_rate_limit_burst() -> u32 {
    40
}

fn default_poll_timeout_ms() -> u64 {
    1000
}

fn default_idle_sleep_ms() -> u64 {
    10
}

fn default_history_ttl_secs() -> u64 {
    3600
}

fn default_heartbeat_secs() -> u64 {
    30
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        dotenvy::dotenv().ok();
        let config: Config =
            envy::from_env().map_err(|e| AppError::Config(format!("invalid environment: {e}")))?;
        config.checked()
    }

    /// Build from explicit `(KEY, value)` pairs instead of the process environment.
    pub fn from_iter<I>(vars: I) -> Result<Self, AppError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let config: Config = envy::from_iter(vars)
            .map_err(|e| AppError::Config(format!("invalid environment: {e}")))?;
        config.checked()
    }

    fn checked(self) -> Result<Self, AppError> {
        self.validate()
            .map_err(|e| AppError::Config(format!("validation failed: {e}")))?;
        Ok(self)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.app_host, self.app_port)
    }

    pub fn ws_api_key(&self) -> Option<&str> {
        self.ws_api_key.as_deref().filter(|key| !key.is_empty())
    }

    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            max_connections_per_channel: self.max_connections_per_campaign,
            max_channels: self.max_campaigns,
            history_limit: self.history_limit,
            action_dedupe_limit: self.action_dedupe_limit,
            poll_timeout: Duration::from_millis(self.backbone_poll_timeout_ms),
            idle_sleep: Duration::from_millis(self.backbone_idle_sleep_ms),
            history_ttl: (self.history_ttl_secs > 0)
                .then(|| Duration::from_secs(self.history_ttl_secs)),
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs),
        }
    }

    pub fn rate_limit_config(&self) -> RateLimitConfig {
        RateLimitConfig {
            req_per_second: self.rate_limit_rps,
            burst_size: self.rate_limit_burst,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            app_host: default_app_host(),
            app_port: default_app_port(),
            api_version: default_api_version(),
            redis_url: default_redis_url(),
            max_connections_per_campaign: default_max_connections(),
            history_limit: default_history_limit(),
            action_dedupe_limit: default_action_dedupe_limit(),
            max_campaigns: default_max_campaigns(),
            ws_api_key: None,
            rate_limit_enabled: false,
            rate_limit_rps: default_rate_limit_rps(),
            rate_limit_burst: default_rate_limit_burst(),
            backbone_poll_timeout_ms: default_poll_timeout_ms(),
            backbone_idle_sleep_ms: default_idle_sleep_ms(),
            history_ttl_secs: default_history_ttl_secs(),
            heartbeat_interval_secs: default_heartbeat_secs(),
            log_format: default_log_format(),
        }
    }
}
