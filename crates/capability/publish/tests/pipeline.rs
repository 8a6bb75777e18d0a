use async_trait::async_trait;
use domain::{DataSample, Severity};
use edge_events::InMemoryEventService;
use edge_publish::{
    MessageBus, PipelineConfig, PublishError, PublishMessage, PublishOutcome, PublishPipeline,
    RawSampleSerializer,
};
use edge_telemetry::{AdapterMetrics, TelemetryMetrics};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Default)]
struct RecordingBus {
    sent: Mutex<Vec<PublishMessage>>,
    fail: AtomicBool,
    gate: Option<Arc<Notify>>,
}

#[async_trait]
impl MessageBus for RecordingBus {
    async fn publish(&self, message: PublishMessage) -> Result<(), PublishError> {
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(PublishError::Bus("broker unavailable".to_string()));
        }
        self.sent.lock().unwrap().push(message);
        Ok(())
    }
}

struct Fixture {
    bus: Arc<RecordingBus>,
    events: Arc<InMemoryEventService>,
    metrics: Arc<TelemetryMetrics>,
    pipeline: PublishPipeline,
}

fn fixture(bus: RecordingBus) -> Fixture {
    fixture_with(bus, PipelineConfig::default())
}

fn fixture_with(bus: RecordingBus, config: PipelineConfig) -> Fixture {
    let bus = Arc::new(bus);
    let events = Arc::new(InMemoryEventService::new());
    let metrics = Arc::new(TelemetryMetrics::new());
    let pipeline = PublishPipeline::with_config(
        "plc-1",
        bus.clone(),
        Arc::new(RawSampleSerializer),
        events.clone(),
        AdapterMetrics::new("modbus-tcp", "plc-1", metrics.clone()),
        config,
    );
    Fixture {
        bus,
        events,
        metrics,
        pipeline,
    }
}

fn sample(qos: u8) -> DataSample {
    DataSample::new("plc-1", "temp", "site/plc-1/temp", b"21.5".to_vec(), qos)
}

#[tokio::test]
async fn invalid_qos_is_rejected_without_publishing() {
    let fx = fixture(RecordingBus::default());

    let err = fx
        .pipeline
        .capture_data_sample(sample(3))
        .err()
        .expect("validation");
    assert!(matches!(err, PublishError::Validation(_)));

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(fx.bus.sent.lock().unwrap().is_empty());
    assert_eq!(fx.pipeline.stats().attempts, 0);
    assert!(fx.events.is_empty());
}

#[tokio::test]
async fn first_publish_event_fires_once() {
    let fx = fixture(RecordingBus::default());

    for _ in 0..3 {
        let pending = fx.pipeline.capture_data_sample(sample(1)).expect("accepted");
        assert_eq!(pending.outcome().await, PublishOutcome::Delivered);
    }

    let events = fx.events.read_events(None, None);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].severity, Severity::Info);
    assert_eq!(
        events[0].message,
        "Adapter took first sample to be published to 'site/plc-1/temp'"
    );
    assert_eq!(events[0].adapter_id.as_deref(), Some("plc-1"));
    assert_eq!(events[0].payload.as_deref(), Some("21.5"));
}

#[tokio::test]
async fn counters_track_success_and_failure() {
    let fx = fixture(RecordingBus::default());

    let delivered = fx.pipeline.capture_data_sample(sample(1)).expect("accepted");
    assert_eq!(delivered.outcome().await, PublishOutcome::Delivered);

    fx.bus.fail.store(true, Ordering::SeqCst);
    let failed = fx.pipeline.capture_data_sample(sample(2)).expect("accepted");
    assert!(matches!(failed.outcome().await, PublishOutcome::Failed(_)));

    let stats = fx.pipeline.stats();
    assert_eq!(stats.attempts, 2);
    assert_eq!(stats.successes, 1);
    assert_eq!(stats.failures, 1);
    assert_eq!(stats.qos_successes, [0, 1, 0]);
    assert_eq!(stats.qos_failures, [0, 0, 1]);

    let prefix = "edge.protocol-adapters.modbus-tcp.plc-1";
    assert_eq!(
        fx.metrics
            .counter(&format!("{}.read.publish.success.count", prefix)),
        1
    );
    assert_eq!(
        fx.metrics
            .counter(&format!("{}.read.publish.failure.count", prefix)),
        1
    );
    assert_eq!(
        fx.metrics
            .counter(&format!("{}.publish.qos-2.failure.count", prefix)),
        1
    );
    // 失败不重试
    assert_eq!(fx.bus.sent.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn capture_does_not_wait_for_the_bus() {
    let gate = Arc::new(Notify::new());
    let fx = fixture(RecordingBus {
        gate: Some(gate.clone()),
        ..RecordingBus::default()
    });

    let pending = fx.pipeline.capture_data_sample(sample(0)).expect("accepted");
    assert_eq!(fx.pipeline.stats().successes, 0);

    gate.notify_one();
    assert_eq!(pending.outcome().await, PublishOutcome::Delivered);
    assert_eq!(fx.pipeline.stats().successes, 1);
}

/// 永不完成的总线。
struct StalledBus;

#[async_trait]
impl MessageBus for StalledBus {
    async fn publish(&self, _message: PublishMessage) -> Result<(), PublishError> {
        std::future::pending().await
    }
}

#[tokio::test]
async fn stalled_bus_drops_samples_beyond_in_flight_limit() {
    let metrics = Arc::new(TelemetryMetrics::new());
    let pipeline = PublishPipeline::with_config(
        "plc-1",
        Arc::new(StalledBus),
        Arc::new(RawSampleSerializer),
        Arc::new(InMemoryEventService::new()),
        AdapterMetrics::new("modbus-tcp", "plc-1", metrics.clone()),
        PipelineConfig { max_in_flight: 4 },
    );

    let mut accepted = Vec::new();
    let mut dropped = 0;
    for _ in 0..1_000 {
        match pipeline.capture_data_sample(sample(1)) {
            Ok(pending) => accepted.push(pending),
            Err(PublishError::Backpressure(_)) => dropped += 1,
            Err(err) => panic!("unexpected error: {err}"),
        }
    }

    assert_eq!(accepted.len(), 4);
    assert_eq!(dropped, 996);
    let stats = pipeline.stats();
    assert_eq!(stats.attempts, 1_000);
    assert_eq!(stats.successes, 0);
    assert_eq!(stats.failures, 996);
    assert_eq!(stats.qos_failures, [0, 996, 0]);
    assert_eq!(
        metrics.counter("edge.protocol-adapters.modbus-tcp.plc-1.publish.backpressure.count"),
        996
    );
}

#[tokio::test]
async fn completed_publish_frees_an_in_flight_slot() {
    let gate = Arc::new(Notify::new());
    let fx = fixture_with(
        RecordingBus {
            gate: Some(gate.clone()),
            ..RecordingBus::default()
        },
        PipelineConfig { max_in_flight: 1 },
    );

    let first = fx.pipeline.capture_data_sample(sample(0)).expect("accepted");
    let err = fx
        .pipeline
        .capture_data_sample(sample(0))
        .err()
        .expect("limit reached");
    assert!(matches!(err, PublishError::Backpressure(_)));

    gate.notify_one();
    assert_eq!(first.outcome().await, PublishOutcome::Delivered);

    let third = fx.pipeline.capture_data_sample(sample(0)).expect("slot freed");
    gate.notify_one();
    assert_eq!(third.outcome().await, PublishOutcome::Delivered);
    assert_eq!(fx.pipeline.stats().successes, 2);
    assert_eq!(fx.pipeline.stats().failures, 1);
}
