pub mod data;
pub mod event;
pub mod status;

pub use data::{DataSample, Qos, TagSubscription, TagValue};
pub use event::{Event, Severity};
pub use status::ConnectionStatus;

/// 获取当前时间戳（毫秒）。
pub fn now_epoch_ms() -> i64 {
    let now = std::time::SystemTime::now();
    let duration = now
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    duration.as_millis() as i64
}
