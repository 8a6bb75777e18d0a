//! 适配器定义（JSON）。

use crate::ConfigError;
use domain::{Qos, TagSubscription};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// 适配器运行模式。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterModeConfig {
    #[default]
    Polling,
    Subscription,
}

/// 调度节奏。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    #[default]
    FixedDelay,
    FixedRate,
}

/// 轮询配置。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollingConfig {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// 未配置时等于 `interval_ms`
    #[serde(default)]
    pub initial_delay_ms: Option<u64>,
    /// 0 表示永不驱逐
    #[serde(default = "default_max_errors", alias = "maxConsecutiveErrors")]
    pub max_polling_errors_before_removal: u32,
    #[serde(default)]
    pub jitter_ms: u64,
    #[serde(default)]
    pub schedule: ScheduleKind,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            initial_delay_ms: None,
            max_polling_errors_before_removal: default_max_errors(),
            jitter_ms: 0,
            schedule: ScheduleKind::default(),
        }
    }
}

impl PollingConfig {
    pub fn initial_delay_ms(&self) -> u64 {
        self.initial_delay_ms.unwrap_or(self.interval_ms)
    }
}

fn default_interval_ms() -> u64 {
    1_000
}

fn default_max_errors() -> u32 {
    10
}

fn default_lazy_connect() -> bool {
    true
}

/// 单个适配器配置。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterConfig {
    pub id: String,
    pub protocol: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub resource_path: String,
    #[serde(default = "default_lazy_connect")]
    pub lazy_connect: bool,
    #[serde(default)]
    pub mode: AdapterModeConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub subscriptions: Vec<TagSubscription>,
}

/// 解析并校验适配器列表（JSON 数组）。
pub fn parse_adapters(json: &str) -> Result<Vec<AdapterConfig>, ConfigError> {
    let adapters: Vec<AdapterConfig> = serde_json::from_str(json)
        .map_err(|err| ConfigError::Invalid("adapters".to_string(), err.to_string()))?;
    validate_adapters(&adapters)?;
    Ok(adapters)
}

/// 校验适配器列表。
pub fn validate_adapters(adapters: &[AdapterConfig]) -> Result<(), ConfigError> {
    let mut ids = HashSet::new();
    for adapter in adapters {
        let scope = format!("adapters[{}]", adapter.id);
        if adapter.id.trim().is_empty() {
            return Err(invalid("adapters.id", "adapter id is empty"));
        }
        if !ids.insert(adapter.id.as_str()) {
            return Err(invalid(&scope, "duplicate adapter id"));
        }
        if adapter.protocol.trim().is_empty() {
            return Err(invalid(&scope, "protocol is empty"));
        }
        if adapter.host.trim().is_empty() {
            return Err(invalid(&scope, "host is empty"));
        }
        if adapter.port == 0 {
            return Err(invalid(&scope, "port must be in 1..=65535"));
        }
        if adapter.mode == AdapterModeConfig::Polling && adapter.polling.interval_ms == 0 {
            return Err(invalid(&scope, "polling.intervalMs must be positive"));
        }

        let mut tags = HashSet::new();
        for subscription in &adapter.subscriptions {
            if subscription.tag_name.trim().is_empty() {
                return Err(invalid(&scope, "tagName is empty"));
            }
            if !tags.insert(subscription.tag_name.as_str()) {
                return Err(invalid(
                    &scope,
                    &format!("duplicate tagName: {}", subscription.tag_name),
                ));
            }
            if subscription.tag_address.trim().is_empty() {
                return Err(invalid(
                    &scope,
                    &format!("tagAddress is empty for {}", subscription.tag_name),
                ));
            }
            if subscription.destination.trim().is_empty()
                || subscription.destination.contains(['+', '#'])
            {
                return Err(invalid(
                    &scope,
                    &format!("invalid destination for {}", subscription.tag_name),
                ));
            }
            if Qos::from_u8(subscription.qos).is_none() {
                return Err(invalid(
                    &scope,
                    &format!("qos must be 0, 1 or 2 for {}", subscription.tag_name),
                ));
            }
        }
    }
    Ok(())
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::Invalid(key.to_string(), message.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_fields_are_missing() {
        let adapters = parse_adapters(
            r#"[{"id":"plc-1","protocol":"modbus-tcp","host":"10.0.0.5","port":502}]"#,
        )
        .unwrap();
        let adapter = &adapters[0];
        assert!(adapter.lazy_connect);
        assert_eq!(adapter.mode, AdapterModeConfig::Polling);
        assert_eq!(adapter.resource_path, "");
        assert_eq!(adapter.polling.interval_ms, 1_000);
        assert_eq!(adapter.polling.initial_delay_ms(), 1_000);
        assert_eq!(adapter.polling.max_polling_errors_before_removal, 10);
        assert_eq!(adapter.polling.schedule, ScheduleKind::FixedDelay);
    }

    #[test]
    fn zero_interval_is_rejected_for_polling() {
        let err = parse_adapters(
            r#"[{"id":"a","protocol":"tcp","host":"h","port":1,"polling":{"intervalMs":0}}]"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("intervalMs"));
    }
}
