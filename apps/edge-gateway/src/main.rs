//! 边缘网关进程：加载适配器配置，启动轮询/订阅，把采样发布到 MQTT。

mod wiring;

use edge_config::AppConfig;
use edge_events::InMemoryEventService;
use edge_polling::{ModuleServices, PollingScheduler, SchedulerConfig};
use edge_publish::{MqttBusConfig, MqttMessageBus, PipelineConfig};
use edge_telemetry::{TelemetryMetrics, init_tracing};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 加载本地 .env（如存在），便于直接 cargo run 启动
    dotenvy::dotenv().ok();
    // 从环境变量加载运行配置
    let config = AppConfig::from_env()?;
    // 初始化结构化日志
    init_tracing();

    let (bus, bus_handle) = MqttMessageBus::connect(MqttBusConfig {
        host: config.mqtt_host.clone(),
        port: config.mqtt_port,
        username: config.mqtt_username.clone(),
        password: config.mqtt_password.clone(),
        client_id_prefix: config.mqtt_client_id_prefix.clone(),
        channel_capacity: config.mqtt_channel_capacity,
        keep_alive_secs: config.mqtt_keep_alive_seconds,
        ack_timeout: Duration::from_millis(config.mqtt_ack_timeout_ms),
    });
    let events = Arc::new(InMemoryEventService::with_capacity(config.event_capacity));
    let metrics = Arc::new(TelemetryMetrics::new());
    let scheduler = PollingScheduler::new(SchedulerConfig {
        stop_timeout: Duration::from_millis(config.scheduler_stop_timeout_ms),
    });
    let services = ModuleServices {
        scheduler: scheduler.clone(),
        events: events.clone(),
        metrics: metrics.clone(),
        bus: Arc::new(bus),
        serializer: wiring::serializer(config.payload_format),
        pipeline: PipelineConfig {
            max_in_flight: config.publish_max_in_flight,
        },
    };
    let registry = wiring::driver_registry(&config);

    let mut adapters = Vec::with_capacity(config.adapters.len());
    for adapter_config in &config.adapters {
        let adapter = wiring::build_adapter(adapter_config, &registry, &services)?;
        // 单个适配器启动失败不影响其它适配器
        if let Err(err) = adapter.start().await {
            error!(
                target: "edge.gateway",
                adapter_id = %adapter.id(),
                error = %err,
                "adapter_start_failed"
            );
        }
        adapters.push(adapter);
    }
    info!(
        target: "edge.gateway",
        adapters = adapters.len(),
        protocols = ?registry.protocols(),
        "gateway_started"
    );
    if adapters.is_empty() {
        warn!(
            target: "edge.gateway",
            "no adapters configured (set EDGE_ADAPTERS_FILE or EDGE_ADAPTERS_JSON)"
        );
    }

    tokio::signal::ctrl_c().await?;
    info!(target: "edge.gateway", "gateway_shutting_down");

    for adapter in &adapters {
        adapter.stop().await;
        let stats = adapter.publish_stats();
        info!(
            target: "edge.gateway",
            adapter_id = %adapter.id(),
            status = %adapter.status(),
            publish_attempts = stats.attempts,
            publish_successes = stats.successes,
            publish_failures = stats.failures,
            "adapter_summary"
        );
    }
    scheduler.shutdown().await;
    bus_handle.abort();
    info!(
        target: "edge.gateway",
        events = events.len(),
        metrics = ?metrics.snapshot(),
        "gateway_stopped"
    );
    Ok(())
}
