//! 配置 → 运行时组件。

use edge_config::{AdapterConfig, AdapterModeConfig, AppConfig, PayloadFormat, ScheduleKind};
use edge_polling::{
    AdapterDefinition, AdapterError, AdapterMode, ModuleServices, PollingProtocolAdapter,
    SamplerConfig, ScheduleMode,
};
use edge_protocol::{
    ConnectionTarget, DriverRegistry, ModbusTcpConfig, ModbusTcpDriver, TcpLineConfig,
    TcpLineDriver,
};
use edge_publish::{JsonSampleSerializer, RawSampleSerializer, SampleSerializer};
use std::sync::Arc;
use std::time::Duration;

/// 注册内置驱动。
pub fn driver_registry(config: &AppConfig) -> DriverRegistry {
    let mut registry = DriverRegistry::new();
    registry.register(Arc::new(ModbusTcpDriver::new(ModbusTcpConfig {
        connect_timeout_ms: config.modbus_connect_timeout_ms,
        read_timeout_ms: config.modbus_read_timeout_ms,
    })));
    registry.register(Arc::new(TcpLineDriver::new(TcpLineConfig::default())));
    registry
}

pub fn serializer(format: PayloadFormat) -> Arc<dyn SampleSerializer> {
    match format {
        PayloadFormat::Json => Arc::new(JsonSampleSerializer),
        PayloadFormat::Raw => Arc::new(RawSampleSerializer),
    }
}

/// 适配器配置 → 适配器定义。
pub fn adapter_definition(config: &AdapterConfig) -> AdapterDefinition {
    let mode = match config.mode {
        AdapterModeConfig::Polling => {
            let polling = &config.polling;
            let schedule = match polling.schedule {
                ScheduleKind::FixedDelay => ScheduleMode::FixedDelay,
                ScheduleKind::FixedRate => ScheduleMode::FixedRate,
            };
            AdapterMode::Polling(
                SamplerConfig::new(Duration::from_millis(polling.interval_ms))
                    .with_initial_delay(Duration::from_millis(polling.initial_delay_ms()))
                    .with_max_consecutive_errors(polling.max_polling_errors_before_removal)
                    .with_schedule(schedule)
                    .with_jitter(Duration::from_millis(polling.jitter_ms)),
            )
        }
        AdapterModeConfig::Subscription => AdapterMode::Subscription,
    };
    AdapterDefinition {
        id: config.id.clone(),
        target: ConnectionTarget::new(&config.host, config.port, &config.resource_path),
        lazy_connect: config.lazy_connect,
        mode,
        subscriptions: config.subscriptions.clone(),
    }
}

/// 按协议选取驱动并构造适配器。
pub fn build_adapter(
    config: &AdapterConfig,
    registry: &DriverRegistry,
    services: &ModuleServices,
) -> Result<PollingProtocolAdapter, AdapterError> {
    let driver = registry.get(&config.protocol).ok_or_else(|| {
        AdapterError::Definition(format!(
            "unknown protocol '{}' for adapter '{}' (known: {})",
            config.protocol,
            config.id,
            registry.protocols().join(", ")
        ))
    })?;
    PollingProtocolAdapter::new(adapter_definition(config), driver, services.clone())
}
