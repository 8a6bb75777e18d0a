//! 协议适配器
//!
//! 适配器由组合而成：一个 [`PlcConnection`]、一个采集策略 [`SampleAcquirer`]、
//! 一个查询构造函数 [`QueryBuilder`]，以及注入的 [`ModuleServices`]。
//! 同一套调度/采样机制因此可以驱动任意协议族。

use crate::error::{AdapterError, SamplerError};
use crate::sampler::{Sampler, SamplerConfig, SamplerLifecycle, TickContext};
use crate::scheduler::PollingScheduler;
use async_trait::async_trait;
use domain::{ConnectionStatus, DataSample, Severity, TagSubscription};
use edge_events::{EventBuilder, EventService};
use edge_protocol::{
    ConnectionTarget, PlcConnection, PlcDriver, ProtocolError, ReadResponse, Subscription,
    TagQuery,
};
use edge_publish::{
    MessageBus, PipelineConfig, PublishError, PublishPipeline, PublishStats, SampleSerializer,
};
use edge_telemetry::{AdapterMetrics, MetricsSink};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// 推送流中断后首次重新订阅的等待时间，之后每次翻倍
pub const RESUBSCRIBE_INITIAL_DELAY: Duration = Duration::from_secs(1);
pub const RESUBSCRIBE_MAX_DELAY: Duration = Duration::from_secs(30);

/// 采集策略：如何从连接取得一个标签值。
#[async_trait]
pub trait SampleAcquirer: Send + Sync {
    async fn acquire(
        &self,
        connection: &PlcConnection,
        query: &TagQuery,
    ) -> Result<ReadResponse, SamplerError>;
}

/// 默认采集策略：一次阻塞读取。
#[derive(Debug, Default, Clone, Copy)]
pub struct ReadAcquirer;

#[async_trait]
impl SampleAcquirer for ReadAcquirer {
    async fn acquire(
        &self,
        connection: &PlcConnection,
        query: &TagQuery,
    ) -> Result<ReadResponse, SamplerError> {
        Ok(connection.read_value(query).await?)
    }
}

/// 由标签订阅构造驱动查询。
pub type QueryBuilder = Arc<dyn Fn(&TagSubscription) -> TagQuery + Send + Sync>;

fn default_query_builder() -> QueryBuilder {
    Arc::new(|subscription: &TagSubscription| {
        TagQuery::new(&subscription.tag_name, &subscription.tag_address)
    })
}

/// 适配器运行模式。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterMode {
    /// 每个标签一个采样器，按配置轮询
    Polling(SamplerConfig),
    /// 设备推送
    Subscription,
}

/// 适配器定义。
#[derive(Debug, Clone)]
pub struct AdapterDefinition {
    pub id: String,
    pub target: ConnectionTarget,
    /// false 时 `start` 立即建立连接
    pub lazy_connect: bool,
    pub mode: AdapterMode,
    pub subscriptions: Vec<TagSubscription>,
}

/// 适配器共享的外部服务（构造时注入）。
#[derive(Clone)]
pub struct ModuleServices {
    pub scheduler: PollingScheduler,
    pub events: Arc<dyn EventService>,
    pub metrics: Arc<dyn MetricsSink>,
    pub bus: Arc<dyn MessageBus>,
    pub serializer: Arc<dyn SampleSerializer>,
    pub pipeline: PipelineConfig,
}

/// 适配器构造器。
pub struct AdapterBuilder {
    definition: AdapterDefinition,
    driver: Arc<dyn PlcDriver>,
    services: ModuleServices,
    acquirer: Arc<dyn SampleAcquirer>,
    query_builder: QueryBuilder,
}

impl AdapterBuilder {
    pub fn acquirer(mut self, acquirer: Arc<dyn SampleAcquirer>) -> Self {
        self.acquirer = acquirer;
        self
    }

    pub fn query_builder(mut self, query_builder: QueryBuilder) -> Self {
        self.query_builder = query_builder;
        self
    }

    pub fn build(self) -> Result<PollingProtocolAdapter, AdapterError> {
        let definition = self.definition;
        if definition.id.trim().is_empty() {
            return Err(AdapterError::Definition("adapter id is empty".to_string()));
        }
        if let AdapterMode::Polling(config) = &definition.mode {
            if config.period.is_zero() {
                return Err(AdapterError::Definition(format!(
                    "polling period of adapter '{}' must be positive",
                    definition.id
                )));
            }
        }
        let protocol = self.driver.protocol().to_string();
        let connection = PlcConnection::new(self.driver, &definition.target)?;
        let metrics = AdapterMetrics::new(&protocol, &definition.id, self.services.metrics.clone());
        let pipeline = PublishPipeline::with_config(
            definition.id.clone(),
            self.services.bus.clone(),
            self.services.serializer.clone(),
            self.services.events.clone(),
            metrics.clone(),
            self.services.pipeline,
        );
        Ok(PollingProtocolAdapter {
            inner: Arc::new(AdapterInner {
                definition,
                protocol,
                connection,
                acquirer: self.acquirer,
                query_builder: self.query_builder,
                services: self.services,
                pipeline,
                metrics,
                status: Mutex::new(ConnectionStatus::Uninitialized),
                last_error: Mutex::new(None),
                running: AtomicBool::new(false),
                lifecycle: tokio::sync::Mutex::new(()),
                subscriptions: Mutex::new(Vec::new()),
            }),
        })
    }
}

struct AdapterInner {
    definition: AdapterDefinition,
    protocol: String,
    connection: PlcConnection,
    acquirer: Arc<dyn SampleAcquirer>,
    query_builder: QueryBuilder,
    services: ModuleServices,
    pipeline: PublishPipeline,
    metrics: AdapterMetrics,
    status: Mutex<ConnectionStatus>,
    last_error: Mutex<Option<String>>,
    running: AtomicBool,
    /// 串行化 start/stop
    lifecycle: tokio::sync::Mutex<()>,
    subscriptions: Mutex<Vec<Subscription>>,
}

/// 轮询/订阅协议适配器。
#[derive(Clone)]
pub struct PollingProtocolAdapter {
    inner: Arc<AdapterInner>,
}

impl PollingProtocolAdapter {
    pub fn builder(
        definition: AdapterDefinition,
        driver: Arc<dyn PlcDriver>,
        services: ModuleServices,
    ) -> AdapterBuilder {
        AdapterBuilder {
            definition,
            driver,
            services,
            acquirer: Arc::new(ReadAcquirer),
            query_builder: default_query_builder(),
        }
    }

    /// 使用默认采集策略与查询构造。
    pub fn new(
        definition: AdapterDefinition,
        driver: Arc<dyn PlcDriver>,
        services: ModuleServices,
    ) -> Result<Self, AdapterError> {
        Self::builder(definition, driver, services).build()
    }

    pub fn id(&self) -> &str {
        &self.inner.definition.id
    }

    pub fn protocol(&self) -> &str {
        &self.inner.protocol
    }

    pub fn connection_string(&self) -> &str {
        self.inner.connection.connection_string()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.status()
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner
            .last_error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connection.is_connected()
    }

    pub fn publish_stats(&self) -> PublishStats {
        self.inner.pipeline.stats()
    }

    /// 启动适配器：按需建立连接，然后注册采样器或设备订阅。
    pub async fn start(&self) -> Result<(), AdapterError> {
        AdapterInner::start(&self.inner).await
    }

    /// 停止适配器：停止全部采样器与订阅并断开连接。
    pub async fn stop(&self) {
        self.inner.stop().await;
    }
}

impl AdapterInner {
    fn id(&self) -> &str {
        &self.definition.id
    }

    fn status(&self) -> ConnectionStatus {
        *self
            .status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_status(&self, status: ConnectionStatus) {
        let mut current = self
            .status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if *current != status {
            debug!(
                target: "edge.polling",
                adapter_id = %self.definition.id,
                from = %*current,
                to = %status,
                "adapter_status_changed"
            );
            *current = status;
        }
    }

    fn record_error(&self, message: String) {
        self.set_status(ConnectionStatus::Error);
        *self
            .last_error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(message);
    }

    fn emit(&self, severity: Severity, message: String) {
        self.services.events.emit(
            EventBuilder::new(severity)
                .adapter(self.id().to_string())
                .message(message)
                .build(),
        );
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    async fn start(self: &Arc<Self>) -> Result<(), AdapterError> {
        let _guard = self.lifecycle.lock().await;
        if self.is_running() {
            return Ok(());
        }
        info!(
            target: "edge.polling",
            adapter_id = %self.id(),
            connection = %self.connection.connection_string(),
            lazy_connect = self.definition.lazy_connect,
            "adapter_starting"
        );
        self.set_status(ConnectionStatus::Connecting);

        if !self.definition.lazy_connect {
            if let Err(err) = self.connection.connect().await {
                self.fail_start(&err);
                return Err(err.into());
            }
            self.set_status(ConnectionStatus::Connected);
        }

        self.running.store(true, Ordering::Release);
        match &self.definition.mode {
            AdapterMode::Polling(config) => {
                for subscription in &self.definition.subscriptions {
                    let sampler = AdapterSampler::new(self, subscription.clone(), config.clone());
                    self.services.scheduler.schedule_polling(Arc::new(sampler));
                }
            }
            AdapterMode::Subscription => {
                for subscription in &self.definition.subscriptions {
                    if let Err(err) = self.subscribe(subscription).await {
                        self.running.store(false, Ordering::Release);
                        self.clear_subscriptions();
                        self.fail_start(&err);
                        return Err(err.into());
                    }
                }
                self.set_status(ConnectionStatus::Connected);
            }
        }

        self.emit(
            Severity::Info,
            format!("Adapter '{}' started", self.id()),
        );
        Ok(())
    }

    fn fail_start(&self, err: &ProtocolError) {
        if matches!(err, ProtocolError::Connection { .. }) {
            self.metrics.increment_connection_failure();
        }
        self.record_error(err.to_string());
        warn!(
            target: "edge.polling",
            adapter_id = %self.id(),
            error = %err,
            "adapter_start_failed"
        );
        self.emit(
            Severity::Error,
            format!("Adapter '{}' failed to start: {}", self.id(), err),
        );
    }

    async fn subscribe(self: &Arc<Self>, subscription: &TagSubscription) -> Result<(), ProtocolError> {
        let query = (self.query_builder)(subscription);
        let adapter = Arc::downgrade(self);
        let tag = subscription.clone();
        let handle = self
            .connection
            .subscribe(query, move |result| {
                let Some(adapter) = adapter.upgrade() else {
                    return;
                };
                match result {
                    Ok(response) => adapter.on_sample_acquired(&tag, response),
                    Err(err) => adapter.on_subscription_failed(&tag, &err),
                }
            })
            .await?;
        let mut subscriptions = self
            .subscriptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // 替换同一标签上已结束的订阅
        subscriptions.retain(|existing| existing.tag_name() != subscription.tag_name);
        subscriptions.push(handle);
        Ok(())
    }

    /// 推送流中断后按退避间隔重新订阅，直到成功或适配器停止。
    fn schedule_resubscribe(self: &Arc<Self>, subscription: TagSubscription) {
        let adapter = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut delay = RESUBSCRIBE_INITIAL_DELAY;
            loop {
                tokio::time::sleep(delay).await;
                let Some(adapter) = adapter.upgrade() else {
                    return;
                };
                match adapter.resubscribe(&subscription).await {
                    Ok(()) => return,
                    Err(err) => {
                        if matches!(err, ProtocolError::Connection { .. }) {
                            adapter.metrics.increment_connection_failure();
                        }
                        adapter.record_error(err.to_string());
                        warn!(
                            target: "edge.polling",
                            adapter_id = %adapter.id(),
                            tag = %subscription.tag_name,
                            error = %err,
                            retry_in_ms = (delay * 2).min(RESUBSCRIBE_MAX_DELAY).as_millis() as u64,
                            "resubscribe_failed"
                        );
                    }
                }
                delay = (delay * 2).min(RESUBSCRIBE_MAX_DELAY);
            }
        });
    }

    async fn resubscribe(self: &Arc<Self>, subscription: &TagSubscription) -> Result<(), ProtocolError> {
        let _guard = self.lifecycle.lock().await;
        if !self.is_running() {
            return Ok(());
        }
        self.subscribe(subscription).await?;
        info!(
            target: "edge.polling",
            adapter_id = %self.id(),
            tag = %subscription.tag_name,
            "subscription_restored"
        );
        Ok(())
    }

    fn clear_subscriptions(&self) {
        let subscriptions: Vec<Subscription> = self
            .subscriptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
            .collect();
        for subscription in &subscriptions {
            subscription.cancel();
        }
    }

    async fn stop(&self) {
        let _guard = self.lifecycle.lock().await;
        let was_running = self.running.swap(false, Ordering::AcqRel);
        if !was_running
            && matches!(
                self.status(),
                ConnectionStatus::Stopped | ConnectionStatus::Uninitialized
            )
        {
            return;
        }

        let stopped = self.services.scheduler.stop_adapter(self.id()).await;
        self.clear_subscriptions();
        if let Err(err) = self.connection.disconnect().await {
            warn!(
                target: "edge.polling",
                adapter_id = %self.id(),
                error = %err,
                "adapter_disconnect_failed"
            );
        }
        self.set_status(ConnectionStatus::Stopped);
        info!(
            target: "edge.polling",
            adapter_id = %self.id(),
            samplers_stopped = stopped,
            "adapter_stopped"
        );
        self.emit(
            Severity::Info,
            format!("Adapter '{}' stopped", self.id()),
        );
    }

    /// 采集成功：组装采样并交给发布链路（不等待发布结果）。
    fn on_sample_acquired(&self, subscription: &TagSubscription, response: ReadResponse) {
        if !self.is_running() {
            debug!(
                target: "edge.polling",
                adapter_id = %self.id(),
                tag = %subscription.tag_name,
                "late_sample_ignored"
            );
            return;
        }
        self.set_status(ConnectionStatus::Connected);

        let payload = match serde_json::to_vec(&response.value) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(
                    target: "edge.polling",
                    adapter_id = %self.id(),
                    tag = %subscription.tag_name,
                    error = %err,
                    "sample_encode_failed"
                );
                return;
            }
        };
        let sample = DataSample::with_timestamp(
            self.id(),
            subscription.tag_name.clone(),
            subscription.destination.clone(),
            payload,
            subscription.qos,
            response.received_at_ms,
        );
        match self.pipeline.capture_data_sample(sample) {
            Ok(_) => {}
            // 总线停滞时每个采样都会被丢弃，只记日志与计数
            Err(err @ PublishError::Backpressure(_)) => {
                debug!(
                    target: "edge.polling",
                    adapter_id = %self.id(),
                    tag = %subscription.tag_name,
                    error = %err,
                    "sample_dropped"
                );
            }
            Err(err) => self.reject_sample(subscription, &err),
        }
    }

    fn reject_sample(&self, subscription: &TagSubscription, err: &PublishError) {
        warn!(
            target: "edge.polling",
            adapter_id = %self.id(),
            tag = %subscription.tag_name,
            error = %err,
            "sample_rejected"
        );
        self.emit(
            Severity::Warn,
            format!(
                "Sample for tag '{}' was rejected: {}",
                subscription.tag_name, err
            ),
        );
    }

    fn on_subscription_failed(self: &Arc<Self>, subscription: &TagSubscription, err: &ProtocolError) {
        if !self.is_running() {
            return;
        }
        self.record_error(err.to_string());
        self.emit(
            Severity::Warn,
            format!(
                "Subscription for tag '{}' failed: {}",
                subscription.tag_name, err
            ),
        );
        self.schedule_resubscribe(subscription.clone());
    }

    async fn on_sampler_error(&self, tag_name: &str, cause: &SamplerError, continuing: bool) {
        self.metrics.increment_sampler_error();
        if matches!(cause, SamplerError::Protocol(ProtocolError::Connection { .. })) {
            self.metrics.increment_connection_failure();
        }
        self.record_error(cause.to_string());
        if continuing {
            self.emit(
                Severity::Warn,
                format!("Sampler for tag '{}' failed: {}", tag_name, cause),
            );
            return;
        }
        self.emit(
            Severity::Error,
            format!(
                "Adapter '{}' stopped after reaching the polling error limit: {}",
                self.id(),
                cause
            ),
        );
        self.stop().await;
    }
}

/// 绑定到单个适配器与单个标签的采样器。
pub struct AdapterSampler {
    id: String,
    adapter_id: String,
    subscription: TagSubscription,
    config: SamplerConfig,
    lifecycle: SamplerLifecycle,
    adapter: Weak<AdapterInner>,
}

impl AdapterSampler {
    fn new(adapter: &Arc<AdapterInner>, subscription: TagSubscription, config: SamplerConfig) -> Self {
        Self {
            id: format!("{}/{}", adapter.id(), subscription.tag_name),
            adapter_id: adapter.id().to_string(),
            subscription,
            config,
            lifecycle: SamplerLifecycle::new(),
            adapter: Arc::downgrade(adapter),
        }
    }
}

#[async_trait]
impl Sampler for AdapterSampler {
    fn id(&self) -> &str {
        &self.id
    }

    fn adapter_id(&self) -> &str {
        &self.adapter_id
    }

    fn config(&self) -> &SamplerConfig {
        &self.config
    }

    fn lifecycle(&self) -> &SamplerLifecycle {
        &self.lifecycle
    }

    async fn execute(&self, ctx: &TickContext) -> Result<(), SamplerError> {
        if ctx.is_interrupted() {
            return Err(SamplerError::Cancelled);
        }
        let adapter = self.adapter.upgrade().ok_or(SamplerError::Cancelled)?;
        if !adapter.is_running() {
            return Err(SamplerError::Cancelled);
        }

        let query = (adapter.query_builder)(&self.subscription);
        let started_at = Instant::now();
        let response = adapter.acquirer.acquire(&adapter.connection, &query).await?;
        adapter
            .metrics
            .record_read_latency_ms(started_at.elapsed().as_millis() as u64);
        adapter.on_sample_acquired(&self.subscription, response);
        Ok(())
    }

    async fn close(&self) {
        debug!(
            target: "edge.polling",
            sampler_id = %self.id,
            "sampler_closed"
        );
    }

    async fn error(&self, cause: &SamplerError, continuing: bool) {
        if let Some(adapter) = self.adapter.upgrade() {
            adapter
                .on_sampler_error(&self.subscription.tag_name, cause, continuing)
                .await;
        }
    }
}
