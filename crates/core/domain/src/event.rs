use serde::{Deserialize, Serialize};

/// 事件严重级别。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Info,
    Warn,
    Error,
    Critical,
}

/// 运行事件（适配器启动、采样错误、首次发布等）。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: String,
    pub adapter_id: Option<String>,
    pub severity: Severity,
    pub message: String,
    pub payload: Option<String>,
    pub created_at_ms: i64,
}
