//! 应用运行配置加载。

mod adapters;
mod bridge;

pub use adapters::{
    AdapterConfig, AdapterModeConfig, PollingConfig, ScheduleKind, parse_adapters,
    validate_adapters,
};
pub use bridge::{BridgeConfigService, MqttBridge};

use std::env;

/// 配置加载错误。
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {0}: {1}")]
    Invalid(String, String),
}

/// 采样 payload 编码方式。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadFormat {
    /// JSON 信封（timestamp/tagName/value）
    Json,
    /// 原始值
    Raw,
}

/// 应用运行配置。
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_client_id_prefix: String,
    pub mqtt_channel_capacity: usize,
    pub mqtt_keep_alive_seconds: u64,
    pub mqtt_ack_timeout_ms: u64,
    pub publish_max_in_flight: usize,
    pub payload_format: PayloadFormat,
    pub event_capacity: usize,
    pub scheduler_stop_timeout_ms: u64,
    pub modbus_connect_timeout_ms: u64,
    pub modbus_read_timeout_ms: u64,
    pub adapters: Vec<AdapterConfig>,
}

impl AppConfig {
    /// 从环境变量读取配置。
    ///
    /// 适配器定义来自 `EDGE_ADAPTERS_FILE`（JSON 文件路径）或 `EDGE_ADAPTERS_JSON`（内联 JSON），
    /// 两者都未设置时为空列表。
    pub fn from_env() -> Result<Self, ConfigError> {
        let mqtt_host = env::var("EDGE_MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let mqtt_port = read_u16_with_default("EDGE_MQTT_PORT", 1883)?;
        let mqtt_username = read_optional("EDGE_MQTT_USERNAME");
        let mqtt_password = read_optional("EDGE_MQTT_PASSWORD");
        let mqtt_client_id_prefix =
            env::var("EDGE_MQTT_CLIENT_ID_PREFIX").unwrap_or_else(|_| "edge-gateway".to_string());
        let mqtt_channel_capacity = read_u64_with_default("EDGE_MQTT_CHANNEL_CAPACITY", 10)? as usize;
        let mqtt_keep_alive_seconds = read_u64_with_default("EDGE_MQTT_KEEP_ALIVE_SECONDS", 30)?;
        let mqtt_ack_timeout_ms = read_u64_with_default("EDGE_MQTT_ACK_TIMEOUT_MS", 10_000)?;
        let publish_max_in_flight =
            read_u64_with_default("EDGE_PUBLISH_MAX_IN_FLIGHT", 1_000)? as usize;
        let payload_format = read_payload_format("EDGE_PAYLOAD_FORMAT")?;
        let event_capacity = read_u64_with_default("EDGE_EVENT_CAPACITY", 500)? as usize;
        let scheduler_stop_timeout_ms =
            read_u64_with_default("EDGE_SCHEDULER_STOP_TIMEOUT_MS", 5_000)?;
        let modbus_connect_timeout_ms =
            read_u64_with_default("EDGE_MODBUS_CONNECT_TIMEOUT_MS", 5_000)?;
        let modbus_read_timeout_ms = read_u64_with_default("EDGE_MODBUS_READ_TIMEOUT_MS", 3_000)?;
        let adapters = read_adapters()?;

        Ok(Self {
            mqtt_host,
            mqtt_port,
            mqtt_username,
            mqtt_password,
            mqtt_client_id_prefix,
            mqtt_channel_capacity,
            mqtt_keep_alive_seconds,
            mqtt_ack_timeout_ms,
            publish_max_in_flight,
            payload_format,
            event_capacity,
            scheduler_stop_timeout_ms,
            modbus_connect_timeout_ms,
            modbus_read_timeout_ms,
            adapters,
        })
    }
}

fn read_adapters() -> Result<Vec<AdapterConfig>, ConfigError> {
    if let Some(path) = read_optional("EDGE_ADAPTERS_FILE") {
        let json = std::fs::read_to_string(&path).map_err(|err| {
            ConfigError::Invalid("EDGE_ADAPTERS_FILE".to_string(), format!("{}: {}", path, err))
        })?;
        return parse_adapters(&json);
    }
    match read_optional("EDGE_ADAPTERS_JSON") {
        Some(json) => parse_adapters(&json),
        None => Ok(Vec::new()),
    }
}

fn read_payload_format(key: &str) -> Result<PayloadFormat, ConfigError> {
    match env::var(key) {
        Err(_) => Ok(PayloadFormat::Json),
        Ok(value) => match value.to_ascii_lowercase().as_str() {
            "" | "json" => Ok(PayloadFormat::Json),
            "raw" => Ok(PayloadFormat::Raw),
            _ => Err(ConfigError::Invalid(key.to_string(), value)),
        },
    }
}

fn read_u16_with_default(key: &str, default: u16) -> Result<u16, ConfigError> {
    let value = match env::var(key) {
        Ok(value) => value,
        Err(_) => return Ok(default),
    };
    value
        .parse::<u16>()
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

fn read_optional(key: &str) -> Option<String> {
    match env::var(key) {
        Ok(value) if !value.is_empty() => Some(value),
        _ => None,
    }
}
