//! 采样器抽象与状态机
//!
//! ```text
//! CREATED ──► SCHEDULED ◄──► RUNNING
//!                 │              │
//!                 └──► CLOSED ◄──┘
//! ```
//!
//! CLOSED 为终态：显式停止或被调度器驱逐后不再回到其它状态。

use crate::error::SamplerError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use tokio::sync::watch;

/// 默认连续错误上限。
pub const DEFAULT_MAX_CONSECUTIVE_ERRORS: u32 = 10;

/// 调度节奏。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleMode {
    /// 上一次采集完成后等待一个周期
    #[default]
    FixedDelay,
    /// 按墙钟节奏触发，允许同一采样器的采集重叠
    FixedRate,
}

/// 采样器调度配置。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SamplerConfig {
    pub period: Duration,
    pub initial_delay: Duration,
    /// 0 表示永不驱逐
    pub max_consecutive_errors: u32,
    pub schedule: ScheduleMode,
    pub jitter: Duration,
}

impl SamplerConfig {
    /// 以周期构造，首次延迟默认等于周期。
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            initial_delay: period,
            max_consecutive_errors: DEFAULT_MAX_CONSECUTIVE_ERRORS,
            schedule: ScheduleMode::default(),
            jitter: Duration::ZERO,
        }
    }

    pub fn with_initial_delay(mut self, initial_delay: Duration) -> Self {
        self.initial_delay = initial_delay;
        self
    }

    pub fn with_max_consecutive_errors(mut self, max_consecutive_errors: u32) -> Self {
        self.max_consecutive_errors = max_consecutive_errors;
        self
    }

    pub fn with_schedule(mut self, schedule: ScheduleMode) -> Self {
        self.schedule = schedule;
        self
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// 首次触发延迟：`initial_delay` 加上由采样器 ID 决定的 `[0, jitter)` 偏移。
    pub fn start_delay(&self, sampler_id: &str) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return self.initial_delay;
        }
        let mut hasher = DefaultHasher::new();
        sampler_id.hash(&mut hasher);
        self.initial_delay + Duration::from_millis(hasher.finish() % jitter_ms)
    }

    /// 第 `count` 次连续失败后是否应驱逐。
    pub fn should_evict(&self, count: u32) -> bool {
        self.max_consecutive_errors > 0 && count >= self.max_consecutive_errors
    }
}

/// 采样器状态。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SamplerState {
    Created = 0,
    Scheduled = 1,
    Running = 2,
    Closed = 3,
}

impl SamplerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Created,
            1 => Self::Scheduled,
            2 => Self::Running,
            _ => Self::Closed,
        }
    }
}

/// 采样器状态单元（原子，可跨任务观察）。
#[derive(Debug)]
pub struct SamplerLifecycle {
    state: AtomicU8,
}

impl Default for SamplerLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl SamplerLifecycle {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(SamplerState::Created as u8),
        }
    }

    pub fn state(&self) -> SamplerState {
        SamplerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// 状态迁移；已关闭时拒绝并返回 false。
    pub fn transition(&self, to: SamplerState) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current == SamplerState::Closed as u8 {
                return false;
            }
            match self.state.compare_exchange(
                current,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SamplerState::Closed
    }
}

/// 单次触发上下文，携带调度器的中断信号。
#[derive(Debug, Clone)]
pub struct TickContext {
    cancel: watch::Receiver<bool>,
    sequence: u64,
}

impl TickContext {
    pub(crate) fn new(cancel: watch::Receiver<bool>, sequence: u64) -> Self {
        Self { cancel, sequence }
    }

    /// 调度器是否已发出停止信号。
    pub fn is_interrupted(&self) -> bool {
        *self.cancel.borrow()
    }

    /// 本采样器的第几次触发（从 0 开始）。
    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

/// 可调度的采样单元。
#[async_trait]
pub trait Sampler: Send + Sync {
    /// 采样器唯一标识（调度幂等键）
    fn id(&self) -> &str;

    fn adapter_id(&self) -> &str;

    fn config(&self) -> &SamplerConfig;

    fn lifecycle(&self) -> &SamplerLifecycle;

    /// 执行一次采集；在采集完成时返回，不等待发布。
    async fn execute(&self, ctx: &TickContext) -> Result<(), SamplerError>;

    /// 清理钩子（停止或驱逐后调用一次）。
    async fn close(&self);

    /// 上报失败；`continuing == false` 表示已达到连续错误上限。
    async fn error(&self, cause: &SamplerError, continuing: bool);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_is_terminal() {
        let lifecycle = SamplerLifecycle::new();
        assert_eq!(lifecycle.state(), SamplerState::Created);
        assert!(lifecycle.transition(SamplerState::Scheduled));
        assert!(lifecycle.transition(SamplerState::Running));
        assert!(lifecycle.transition(SamplerState::Closed));
        assert!(!lifecycle.transition(SamplerState::Scheduled));
        assert!(lifecycle.is_closed());
    }

    #[test]
    fn jitter_offset_is_stable_and_bounded() {
        let config = SamplerConfig::new(Duration::from_millis(100))
            .with_initial_delay(Duration::from_millis(10))
            .with_jitter(Duration::from_millis(50));
        let first = config.start_delay("plc-1/temp");
        assert_eq!(first, config.start_delay("plc-1/temp"));
        assert!(first >= Duration::from_millis(10));
        assert!(first < Duration::from_millis(60));

        let plain = SamplerConfig::new(Duration::from_millis(100));
        assert_eq!(plain.start_delay("x"), Duration::from_millis(100));
    }

    #[test]
    fn zero_max_never_evicts() {
        let config = SamplerConfig::new(Duration::from_secs(1)).with_max_consecutive_errors(0);
        assert!(!config.should_evict(u32::MAX));

        let config = config.with_max_consecutive_errors(3);
        assert!(!config.should_evict(2));
        assert!(config.should_evict(3));
    }
}
