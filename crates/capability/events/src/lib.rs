//! 运行事件服务。
//!
//! 采样器与发布链路通过 [`EventService`] 上报运维事件（适配器启动、采样错误、
//! 首次发布等）；[`InMemoryEventService`] 保留最近的事件供外部 API 读取。

use domain::{Event, Severity, now_epoch_ms};
use std::collections::VecDeque;
use std::sync::RwLock;
use tracing::{info, warn};

/// 事件 payload 预览的最大字节数。
pub const PAYLOAD_PREVIEW_BYTES: usize = 256;

/// 默认保留事件数量。
pub const DEFAULT_EVENT_CAPACITY: usize = 500;

/// 事件接收端抽象（同步、非阻塞）。
pub trait EventService: Send + Sync {
    fn emit(&self, event: Event);
}

/// 空事件服务（用于接线与测试）。
#[derive(Debug, Default)]
pub struct NoopEventService;

impl EventService for NoopEventService {
    fn emit(&self, _event: Event) {}
}

/// 事件构造器。
#[derive(Debug, Clone)]
pub struct EventBuilder {
    severity: Severity,
    adapter_id: Option<String>,
    message: String,
    payload: Option<String>,
}

impl EventBuilder {
    pub fn new(severity: Severity) -> Self {
        Self {
            severity,
            adapter_id: None,
            message: String::new(),
            payload: None,
        }
    }

    pub fn adapter(mut self, adapter_id: impl Into<String>) -> Self {
        self.adapter_id = Some(adapter_id.into());
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    pub fn build(self) -> Event {
        Event {
            id: uuid::Uuid::new_v4().to_string(),
            adapter_id: self.adapter_id,
            severity: self.severity,
            message: self.message,
            payload: self.payload,
            created_at_ms: now_epoch_ms(),
        }
    }
}

/// 生成 payload 预览：最多 [`PAYLOAD_PREVIEW_BYTES`] 字节，非 UTF-8 字节按替换字符处理。
pub fn payload_preview(payload: &[u8]) -> String {
    if payload.len() <= PAYLOAD_PREVIEW_BYTES {
        return String::from_utf8_lossy(payload).into_owned();
    }
    let mut preview = String::from_utf8_lossy(&payload[..PAYLOAD_PREVIEW_BYTES]).into_owned();
    preview.push_str("...");
    preview
}

/// 内存事件服务（有界环形缓冲，满时丢弃最旧事件）。
pub struct InMemoryEventService {
    events: RwLock<VecDeque<Event>>,
    capacity: usize,
}

impl InMemoryEventService {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: RwLock::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// 读取事件，按时间倒序。
    ///
    /// - `since_ms`：仅返回 `created_at_ms >= since_ms` 的事件
    /// - `limit`：最多返回条数
    pub fn read_events(&self, since_ms: Option<i64>, limit: Option<usize>) -> Vec<Event> {
        let events = self
            .events
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let limit = limit.unwrap_or(self.capacity);
        events
            .iter()
            .rev()
            .filter(|event| since_ms.is_none_or(|since| event.created_at_ms >= since))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryEventService {
    fn default() -> Self {
        Self::new()
    }
}

impl EventService for InMemoryEventService {
    fn emit(&self, event: Event) {
        match event.severity {
            Severity::Info => info!(
                target: "edge.events",
                event_id = %event.id,
                adapter_id = ?event.adapter_id,
                message = %event.message,
                "event_emitted"
            ),
            _ => warn!(
                target: "edge.events",
                event_id = %event.id,
                adapter_id = ?event.adapter_id,
                severity = ?event.severity,
                message = %event.message,
                "event_emitted"
            ),
        }
        let mut events = self
            .events
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        while events.len() >= self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_truncates_long_payloads() {
        let payload = vec![b'a'; PAYLOAD_PREVIEW_BYTES + 10];
        let preview = payload_preview(&payload);
        assert_eq!(preview.len(), PAYLOAD_PREVIEW_BYTES + 3);
        assert!(preview.ends_with("..."));
    }

    #[test]
    fn preview_keeps_short_json() {
        assert_eq!(payload_preview(br#"{"value":1}"#), r#"{"value":1}"#);
    }
}
