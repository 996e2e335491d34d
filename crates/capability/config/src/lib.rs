//! 网关运行配置加载（环境变量，前缀 `GW_`）。
//!
//! 通道级的驱动配置（端点、设备号等）由编排层通过 `DriverConfig` 传入，
//! 这里只承载进程级的调优参数：超时、重试次数、订阅队列容量等。

use std::env;

/// 配置加载错误。
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required env: {0}")]
    Missing(String),
    #[error("invalid value for {0}: {1}")]
    Invalid(String, String),
}

/// 网关运行配置。
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bacnet_timeout_ms: u64,
    pub bacnet_discovery_window_ms: u64,
    pub bacnet_recovery_interval_seconds: u64,
    pub bacnet_point_cooldown_seconds: u64,
    pub opcua_connect_timeout_ms: u64,
    pub opcua_reconnect_timeout_ms: u64,
    pub opcua_browse_max_depth: u32,
    pub opcua_browse_retries: u32,
    pub opcua_sampling_interval_ms: u64,
    pub opcua_publish_interval_ms: u64,
    pub opcua_queue_size: usize,
    pub opcua_use_subscription: bool,
    pub default_timeout_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bacnet_timeout_ms: 3000,
            bacnet_discovery_window_ms: 2000,
            bacnet_recovery_interval_seconds: 30,
            bacnet_point_cooldown_seconds: 10,
            opcua_connect_timeout_ms: 10_000,
            opcua_reconnect_timeout_ms: 5000,
            opcua_browse_max_depth: 5,
            opcua_browse_retries: 3,
            opcua_sampling_interval_ms: 500,
            opcua_publish_interval_ms: 1000,
            opcua_queue_size: 256,
            opcua_use_subscription: true,
            default_timeout_ms: 5000,
        }
    }
}

impl GatewayConfig {
    /// 从环境变量读取配置，未设置的项使用默认值。
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let bacnet_timeout_ms = read_u64_with_default("GW_BACNET_TIMEOUT_MS", defaults.bacnet_timeout_ms)?;
        let bacnet_discovery_window_ms = read_u64_with_default(
            "GW_BACNET_DISCOVERY_WINDOW_MS",
            defaults.bacnet_discovery_window_ms,
        )?;
        let bacnet_recovery_interval_seconds = read_u64_with_default(
            "GW_BACNET_RECOVERY_INTERVAL_SECONDS",
            defaults.bacnet_recovery_interval_seconds,
        )?;
        let bacnet_point_cooldown_seconds = read_u64_with_default(
            "GW_BACNET_POINT_COOLDOWN_SECONDS",
            defaults.bacnet_point_cooldown_seconds,
        )?;
        let opcua_connect_timeout_ms = read_u64_with_default(
            "GW_OPCUA_CONNECT_TIMEOUT_MS",
            defaults.opcua_connect_timeout_ms,
        )?;
        let opcua_reconnect_timeout_ms = read_u64_with_default(
            "GW_OPCUA_RECONNECT_TIMEOUT_MS",
            defaults.opcua_reconnect_timeout_ms,
        )?;
        let opcua_browse_max_depth =
            read_u32_with_default("GW_OPCUA_BROWSE_MAX_DEPTH", defaults.opcua_browse_max_depth)?;
        let opcua_browse_retries =
            read_u32_with_default("GW_OPCUA_BROWSE_RETRIES", defaults.opcua_browse_retries)?;
        let opcua_sampling_interval_ms = read_u64_with_default(
            "GW_OPCUA_SAMPLING_INTERVAL_MS",
            defaults.opcua_sampling_interval_ms,
        )?;
        let opcua_publish_interval_ms = read_u64_with_default(
            "GW_OPCUA_PUBLISH_INTERVAL_MS",
            defaults.opcua_publish_interval_ms,
        )?;
        let opcua_queue_size =
            read_u64_with_default("GW_OPCUA_QUEUE_SIZE", defaults.opcua_queue_size as u64)?
                as usize;
        let opcua_use_subscription =
            read_bool_with_default("GW_OPCUA_USE_SUBSCRIPTION", defaults.opcua_use_subscription);
        let default_timeout_ms =
            read_u64_with_default("GW_DEFAULT_TIMEOUT_MS", defaults.default_timeout_ms)?;

        if opcua_queue_size == 0 {
            return Err(ConfigError::Invalid(
                "GW_OPCUA_QUEUE_SIZE".to_string(),
                "0".to_string(),
            ));
        }
        if opcua_browse_retries == 0 {
            return Err(ConfigError::Invalid(
                "GW_OPCUA_BROWSE_RETRIES".to_string(),
                "0".to_string(),
            ));
        }

        Ok(Self {
            bacnet_timeout_ms,
            bacnet_discovery_window_ms,
            bacnet_recovery_interval_seconds,
            bacnet_point_cooldown_seconds,
            opcua_connect_timeout_ms,
            opcua_reconnect_timeout_ms,
            opcua_browse_max_depth,
            opcua_browse_retries,
            opcua_sampling_interval_ms,
            opcua_publish_interval_ms,
            opcua_queue_size,
            opcua_use_subscription,
            default_timeout_ms,
        })
    }
}

fn read_u32_with_default(key: &str, default: u32) -> Result<u32, ConfigError> {
    let value = match env::var(key) {
        Ok(value) => value,
        Err(_) => return Ok(default),
    };
    value
        .parse::<u32>()
        .map_err(|_| ConfigError::Invalid(key.to_string(), value))
}

fn read_u64_with_default(key: &str, default: u64) -> Result<u64, ConfigError> {
    let value = match env::var(key) {
        Ok(value) => value,
        Err(_) => return Ok(default),
    };
    value
        .parse::<u64>()
        .map_err(|_| ConfigError::Invalid(key.to_string(), value))
}

/// 读取必填环境变量（探针等入口使用）。
pub fn read_required(key: &str) -> Result<String, ConfigError> {
    read_optional(key).ok_or_else(|| ConfigError::Missing(key.to_string()))
}

pub fn read_optional(key: &str) -> Option<String> {
    match env::var(key) {
        Ok(value) if !value.is_empty() => Some(value),
        _ => None,
    }
}

fn read_bool_with_default(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(value) => matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "on"),
        Err(_) => default,
    }
}
