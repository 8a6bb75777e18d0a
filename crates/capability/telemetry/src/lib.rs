//! 追踪初始化与计数器。
//!
//! 指标以显式注入的 [`MetricsSink`] 传入各组件，不使用全局单例，
//! 测试可替换为假实现，同一进程内也可以并存多个网关实例。

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing_subscriber::{EnvFilter, fmt};

/// 窄口径指标接口：计数器 + 耗时。
pub trait MetricsSink: Send + Sync {
    fn increment(&self, name: &str);
    fn record_latency_ms(&self, name: &str, latency_ms: u64);
}

/// 空指标（用于接线与测试）。
#[derive(Debug, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn increment(&self, _name: &str) {}

    fn record_latency_ms(&self, _name: &str, _latency_ms: u64) {}
}

#[derive(Default)]
struct Timer {
    total_ms: AtomicU64,
    count: AtomicU64,
}

/// 耗时快照。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimerSnapshot {
    pub total_ms: u64,
    pub count: u64,
}

/// 基于原子计数的指标实现。
#[derive(Default)]
pub struct TelemetryMetrics {
    counters: RwLock<HashMap<String, Arc<AtomicU64>>>,
    timers: RwLock<HashMap<String, Arc<Timer>>>,
}

impl TelemetryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// 读取单个计数器，不存在时为 0。
    pub fn counter(&self, name: &str) -> u64 {
        let counters = self
            .counters
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        counters
            .get(name)
            .map(|value| value.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn timer(&self, name: &str) -> TimerSnapshot {
        let timers = self
            .timers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        timers
            .get(name)
            .map(|timer| TimerSnapshot {
                total_ms: timer.total_ms.load(Ordering::Relaxed),
                count: timer.count.load(Ordering::Relaxed),
            })
            .unwrap_or_default()
    }

    /// 全部计数器快照（按名称排序）。
    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        let counters = self
            .counters
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        counters
            .iter()
            .map(|(name, value)| (name.clone(), value.load(Ordering::Relaxed)))
            .collect()
    }

    fn counter_slot(&self, name: &str) -> Arc<AtomicU64> {
        {
            let counters = self
                .counters
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(slot) = counters.get(name) {
                return slot.clone();
            }
        }
        let mut counters = self
            .counters
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        counters.entry(name.to_string()).or_default().clone()
    }

    fn timer_slot(&self, name: &str) -> Arc<Timer> {
        {
            let timers = self
                .timers
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(slot) = timers.get(name) {
                return slot.clone();
            }
        }
        let mut timers = self
            .timers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        timers.entry(name.to_string()).or_default().clone()
    }
}

impl MetricsSink for TelemetryMetrics {
    fn increment(&self, name: &str) {
        self.counter_slot(name).fetch_add(1, Ordering::Relaxed);
    }

    fn record_latency_ms(&self, name: &str, latency_ms: u64) {
        let timer = self.timer_slot(name);
        timer.total_ms.fetch_add(latency_ms, Ordering::Relaxed);
        timer.count.fetch_add(1, Ordering::Relaxed);
    }
}

/// 单个适配器的指标命名与上报。
///
/// 名称格式：`edge.protocol-adapters.<protocol>.<adapter_id>.<metric>`。
#[derive(Clone)]
pub struct AdapterMetrics {
    prefix: String,
    sink: Arc<dyn MetricsSink>,
}

impl AdapterMetrics {
    pub fn new(protocol: &str, adapter_id: &str, sink: Arc<dyn MetricsSink>) -> Self {
        Self {
            prefix: format!("edge.protocol-adapters.{}.{}", protocol, adapter_id),
            sink,
        }
    }

    pub fn name(&self, metric: &str) -> String {
        format!("{}.{}", self.prefix, metric)
    }

    /// 记录发布成功次数。
    pub fn increment_read_publish_success(&self) {
        self.sink.increment(&self.name("read.publish.success.count"));
    }

    /// 记录发布失败次数。
    pub fn increment_read_publish_failure(&self) {
        self.sink.increment(&self.name("read.publish.failure.count"));
    }

    /// 记录按 QoS 分组的发布成功次数。
    pub fn increment_qos_success(&self, qos: u8) {
        self.sink
            .increment(&self.name(&format!("publish.qos-{}.success.count", qos)));
    }

    /// 记录按 QoS 分组的发布失败次数。
    pub fn increment_qos_failure(&self, qos: u8) {
        self.sink
            .increment(&self.name(&format!("publish.qos-{}.failure.count", qos)));
    }

    /// 记录因在途发布已满而丢弃的采样。
    pub fn increment_publish_backpressure(&self) {
        self.sink.increment(&self.name("publish.backpressure.count"));
    }

    /// 记录连接失败次数。
    pub fn increment_connection_failure(&self) {
        self.sink.increment(&self.name("connection.failure.count"));
    }

    /// 记录采样失败次数。
    pub fn increment_sampler_error(&self) {
        self.sink.increment(&self.name("sampler.error.count"));
    }

    /// 记录单次读取耗时（毫秒）。
    pub fn record_read_latency_ms(&self, latency_ms: u64) {
        self.sink.record_latency_ms(&self.name("read.latency"), latency_ms);
    }
}

/// 初始化 tracing（默认 info）。
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).try_init();
}
