//! MQTT 桥接配置（仅维护列表，供外部 API 读写）。

use crate::ConfigError;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use std::sync::RwLock;

/// 一条 MQTT 桥接定义。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MqttBridge {
    pub id: String,
    pub host: String,
    #[serde(default = "default_bridge_port")]
    pub port: u16,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_seconds: u64,
    #[serde(default = "default_clean_start")]
    pub clean_start: bool,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// 转发的 topic 过滤器
    #[serde(default)]
    pub topic_filters: Vec<String>,
}

fn default_bridge_port() -> u16 {
    1883
}

fn default_keep_alive() -> u64 {
    60
}

fn default_clean_start() -> bool {
    true
}

/// 线程安全的桥接配置列表。
#[derive(Debug, Default)]
pub struct BridgeConfigService {
    bridges: RwLock<Vec<MqttBridge>>,
}

impl BridgeConfigService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_bridge(&self, bridge: MqttBridge) {
        self.bridges
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(bridge);
    }

    /// 添加 base64 编码的 JSON 桥接定义。
    pub fn add_bridge_encoded(&self, encoded: &str) -> Result<MqttBridge, ConfigError> {
        let json = STANDARD
            .decode(encoded.trim())
            .map_err(|err| ConfigError::Invalid("bridge".to_string(), err.to_string()))?;
        let bridge: MqttBridge = serde_json::from_slice(&json)
            .map_err(|err| ConfigError::Invalid("bridge".to_string(), err.to_string()))?;
        if bridge.id.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "bridge".to_string(),
                "bridge id is empty".to_string(),
            ));
        }
        self.add_bridge(bridge.clone());
        Ok(bridge)
    }

    /// 当前桥接列表快照。
    pub fn bridges(&self) -> Vec<MqttBridge> {
        self.bridges
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// 按 ID 移除；存在并已移除时返回 true。
    pub fn remove_bridge(&self, id: &str) -> bool {
        let mut bridges = self
            .bridges
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = bridges.len();
        bridges.retain(|bridge| bridge.id != id);
        bridges.len() != before
    }
}
