use domain::DataSample;
use edge_events::InMemoryEventService;
use edge_publish::{
    MqttBusConfig, MqttMessageBus, PublishOutcome, PublishPipeline, RawSampleSerializer,
};
use edge_telemetry::{AdapterMetrics, TelemetryMetrics};
use std::sync::Arc;
use std::time::Duration;

/// 取一个当前无人监听的本地端口。
fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("addr").port();
    drop(listener);
    port
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unreachable_broker_counts_every_sample_as_failed() {
    let (bus, handle) = MqttMessageBus::connect(MqttBusConfig {
        host: "127.0.0.1".to_string(),
        port: closed_port(),
        ack_timeout: Duration::from_millis(500),
        ..MqttBusConfig::default()
    });
    let bus = Arc::new(bus);
    let metrics = Arc::new(TelemetryMetrics::new());
    let pipeline = PublishPipeline::new(
        "plc-1",
        bus.clone(),
        Arc::new(RawSampleSerializer),
        Arc::new(InMemoryEventService::new()),
        AdapterMetrics::new("modbus-tcp", "plc-1", metrics.clone()),
    );

    let mut pending = Vec::new();
    for _ in 0..5 {
        let sample = DataSample::new("plc-1", "temp", "site/plc-1/temp", b"21.5".to_vec(), 1);
        pending.push(pipeline.capture_data_sample(sample).expect("accepted"));
    }
    for publish in pending {
        assert!(matches!(publish.outcome().await, PublishOutcome::Failed(_)));
    }

    let stats = pipeline.stats();
    assert_eq!(stats.successes, 0);
    assert_eq!(stats.failures, 5);
    assert!(!bus.is_connected());
    assert_eq!(
        metrics.counter("edge.protocol-adapters.modbus-tcp.plc-1.read.publish.success.count"),
        0
    );

    handle.abort();
}
