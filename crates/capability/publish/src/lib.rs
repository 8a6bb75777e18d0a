//! 采样发布链路。
//!
//! [`PublishPipeline::capture_data_sample`] 校验采样、编码 payload 后把消息交给总线，
//! 发送在后台任务中完成，调用方（采样线程）不等待发布结果。每个采样至多尝试发布一次，
//! 失败只计数与记录日志，不重试：重新采集一个更新的样本比重放旧样本更便宜也更正确。
//!
//! 在途发布数有上限（[`PipelineConfig::max_in_flight`]）；总线停滞时超出部分的采样直接丢弃，
//! 返回 [`PublishError::Backpressure`]，调用方不会被阻塞。

mod mqtt;
mod serializer;

pub use mqtt::{MqttBusConfig, MqttMessageBus};
pub use serializer::{JsonSampleSerializer, RawSampleSerializer, SampleSerializer};

use async_trait::async_trait;
use domain::{DataSample, Qos, Severity};
use edge_events::{EventBuilder, EventService, payload_preview};
use edge_telemetry::AdapterMetrics;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// 发布链路错误。
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    /// 采样违反结构约束，不会尝试发布
    #[error("validation error: {0}")]
    Validation(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    /// 消息总线拒绝或投递失败
    #[error("bus error: {0}")]
    Bus(String),
    /// 在途发布已满，采样被丢弃
    #[error("backpressure: {0}")]
    Backpressure(String),
}

pub const DEFAULT_MAX_IN_FLIGHT: usize = 1_000;

/// 发布链路参数。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineConfig {
    /// 每个适配器同时在途的发布上限
    pub max_in_flight: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
        }
    }
}

/// 单次发布的最终结果。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    Delivered,
    Failed(String),
}

/// 发往总线的消息。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: Qos,
}

/// 消息总线客户端抽象。
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, message: PublishMessage) -> Result<(), PublishError>;
}

/// 空总线（用于接线与测试）。
#[derive(Debug, Default)]
pub struct NoopBus;

#[async_trait]
impl MessageBus for NoopBus {
    async fn publish(&self, _message: PublishMessage) -> Result<(), PublishError> {
        Ok(())
    }
}

/// 发布计数快照。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishStats {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub qos_successes: [u64; 3],
    pub qos_failures: [u64; 3],
}

/// 单个适配器的发布计数（单调递增）。
#[derive(Default)]
struct PublishCounters {
    attempts: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    qos_successes: [AtomicU64; 3],
    qos_failures: [AtomicU64; 3],
}

impl PublishCounters {
    fn snapshot(&self) -> PublishStats {
        PublishStats {
            attempts: self.attempts.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            qos_successes: [
                self.qos_successes[0].load(Ordering::Relaxed),
                self.qos_successes[1].load(Ordering::Relaxed),
                self.qos_successes[2].load(Ordering::Relaxed),
            ],
            qos_failures: [
                self.qos_failures[0].load(Ordering::Relaxed),
                self.qos_failures[1].load(Ordering::Relaxed),
                self.qos_failures[2].load(Ordering::Relaxed),
            ],
        }
    }
}

struct PipelineInner {
    adapter_id: String,
    bus: Arc<dyn MessageBus>,
    serializer: Arc<dyn SampleSerializer>,
    events: Arc<dyn EventService>,
    metrics: AdapterMetrics,
    counters: PublishCounters,
    in_flight: Arc<Semaphore>,
}

impl PipelineInner {
    fn record_success(&self, qos: Qos) {
        self.counters.successes.fetch_add(1, Ordering::Relaxed);
        self.counters.qos_successes[qos.as_u8() as usize].fetch_add(1, Ordering::Relaxed);
        self.metrics.increment_read_publish_success();
        self.metrics.increment_qos_success(qos.as_u8());
    }

    fn record_failure(&self, qos: Qos) {
        self.counters.failures.fetch_add(1, Ordering::Relaxed);
        self.counters.qos_failures[qos.as_u8() as usize].fetch_add(1, Ordering::Relaxed);
        self.metrics.increment_read_publish_failure();
        self.metrics.increment_qos_failure(qos.as_u8());
    }
}

/// 采样发布入口（每个适配器一个）。
#[derive(Clone)]
pub struct PublishPipeline {
    inner: Arc<PipelineInner>,
}

impl PublishPipeline {
    pub fn new(
        adapter_id: impl Into<String>,
        bus: Arc<dyn MessageBus>,
        serializer: Arc<dyn SampleSerializer>,
        events: Arc<dyn EventService>,
        metrics: AdapterMetrics,
    ) -> Self {
        Self::with_config(
            adapter_id,
            bus,
            serializer,
            events,
            metrics,
            PipelineConfig::default(),
        )
    }

    pub fn with_config(
        adapter_id: impl Into<String>,
        bus: Arc<dyn MessageBus>,
        serializer: Arc<dyn SampleSerializer>,
        events: Arc<dyn EventService>,
        metrics: AdapterMetrics,
        config: PipelineConfig,
    ) -> Self {
        Self {
            inner: Arc::new(PipelineInner {
                adapter_id: adapter_id.into(),
                bus,
                serializer,
                events,
                metrics,
                counters: PublishCounters::default(),
                in_flight: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
            }),
        }
    }

    pub fn adapter_id(&self) -> &str {
        &self.inner.adapter_id
    }

    pub fn stats(&self) -> PublishStats {
        self.inner.counters.snapshot()
    }

    /// 发布一个采样。
    ///
    /// 校验或编码失败时同步返回错误且不会发布；在途发布已满时丢弃采样并记一次失败；
    /// 否则立即返回 [`PendingPublish`]，发送在后台完成并更新计数。
    pub fn capture_data_sample(&self, sample: DataSample) -> Result<PendingPublish, PublishError> {
        let qos = validate_sample(&sample)?;
        let payload = self.inner.serializer.serialize(&sample)?;

        let attempt = self.inner.counters.attempts.fetch_add(1, Ordering::AcqRel);
        let Ok(permit) = self.inner.in_flight.clone().try_acquire_owned() else {
            self.inner.record_failure(qos);
            self.inner.metrics.increment_publish_backpressure();
            return Err(PublishError::Backpressure(
                "in-flight publish limit reached".to_string(),
            ));
        };
        if attempt == 0 {
            self.inner.events.emit(
                EventBuilder::new(Severity::Info)
                    .adapter(self.inner.adapter_id.clone())
                    .message(format!(
                        "Adapter took first sample to be published to '{}'",
                        sample.topic()
                    ))
                    .payload(payload_preview(&payload))
                    .build(),
            );
        }

        let message = PublishMessage {
            topic: sample.topic().to_string(),
            payload,
            qos,
        };
        debug!(
            target: "edge.publish",
            adapter_id = %self.inner.adapter_id,
            topic = %message.topic,
            qos = qos.as_u8(),
            payload_size = message.payload.len(),
            "publish_submitted"
        );

        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            let _permit = permit;
            let topic = message.topic.clone();
            match inner.bus.publish(message).await {
                Ok(()) => {
                    inner.record_success(qos);
                    PublishOutcome::Delivered
                }
                Err(err) => {
                    inner.record_failure(qos);
                    warn!(
                        target: "edge.publish",
                        adapter_id = %inner.adapter_id,
                        topic = %topic,
                        error = %err,
                        "publish_failed"
                    );
                    PublishOutcome::Failed(err.to_string())
                }
            }
        });
        Ok(PendingPublish { task })
    }
}

/// 进行中的发布；丢弃即"发送后不管"。
pub struct PendingPublish {
    task: JoinHandle<PublishOutcome>,
}

impl PendingPublish {
    /// 等待发布结果。
    pub async fn outcome(self) -> PublishOutcome {
        self.task
            .await
            .unwrap_or_else(|err| PublishOutcome::Failed(err.to_string()))
    }
}

/// 校验采样结构：topic 非空且不含通配符，payload 非空，QoS ∈ {0,1,2}。
fn validate_sample(sample: &DataSample) -> Result<Qos, PublishError> {
    if sample.topic().trim().is_empty() {
        return Err(PublishError::Validation("topic is empty".to_string()));
    }
    if sample.topic().contains(['+', '#']) {
        return Err(PublishError::Validation(format!(
            "topic contains wildcard: {}",
            sample.topic()
        )));
    }
    if sample.payload().is_empty() {
        return Err(PublishError::Validation("payload is empty".to_string()));
    }
    Qos::from_u8(sample.qos()).ok_or_else(|| {
        PublishError::Validation(format!(
            "QoS needs to be a valid Quality-Of-Service value (0,1,2), got {}",
            sample.qos()
        ))
    })
}
