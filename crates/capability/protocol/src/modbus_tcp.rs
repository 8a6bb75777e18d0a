//! Modbus TCP 驱动实现
//!
//! 连接串：`modbus-tcp://<host>:<port>[/<unit_id>]`，资源路径为从站 ID（默认 1）。
//! 标签地址格式见 [`ModbusAddress`]。仅支持阻塞读取，不支持订阅。
//!
//! ## 使用示例
//!
//! ```rust,ignore
//! let driver = Arc::new(ModbusTcpDriver::new(ModbusTcpConfig::default()));
//! let target = ConnectionTarget::new("192.168.1.100", 502, "1");
//! let connection = PlcConnection::new(driver, &target)?;
//! let response = connection.read_value(&TagQuery::new("temp", "3:100:2:float32")).await?;
//! ```

use crate::driver::{PlcDriver, PlcHandle, SubscriptionStream};
use crate::error::ProtocolError;
use crate::types::{
    DriverMetadata, ModbusAddress, ModbusDataType, Operation, ReadResponse, TagQuery,
    parse_connection_string,
};
use async_trait::async_trait;
use domain::{TagValue, now_epoch_ms};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_modbus::prelude::*;
use tracing::{debug, info, warn};

/// 协议标识
pub const MODBUS_TCP_PROTOCOL: &str = "modbus-tcp";

/// Modbus TCP 驱动配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModbusTcpConfig {
    /// 连接超时（毫秒）
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// 读取超时（毫秒）
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,
}

impl Default for ModbusTcpConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout(),
            read_timeout_ms: default_read_timeout(),
        }
    }
}

fn default_connect_timeout() -> u64 {
    5000
}

fn default_read_timeout() -> u64 {
    3000
}

/// Modbus TCP 驱动
#[derive(Debug, Clone, Default)]
pub struct ModbusTcpDriver {
    config: ModbusTcpConfig,
}

impl ModbusTcpDriver {
    pub fn new(config: ModbusTcpConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl PlcDriver for ModbusTcpDriver {
    fn protocol(&self) -> &str {
        MODBUS_TCP_PROTOCOL
    }

    async fn connect(&self, connection_string: &str) -> Result<Arc<dyn PlcHandle>, ProtocolError> {
        let parsed = parse_connection_string(connection_string)?;
        let unit_id = parse_unit_id(&parsed.target.resource_path)?;
        let authority = format!("{}:{}", parsed.target.host.trim(), parsed.target.port);
        let addr = tokio::net::lookup_host(&authority)
            .await?
            .next()
            .ok_or_else(|| ProtocolError::Config(format!("unresolved address: {}", authority)))?;

        info!(
            target: "edge.protocol",
            addr = %addr,
            unit_id = unit_id,
            "modbus_connecting"
        );

        let ctx = tokio::time::timeout(
            Duration::from_millis(self.config.connect_timeout_ms),
            tcp::connect_slave(addr, Slave(unit_id)),
        )
        .await
        .map_err(|_| ProtocolError::Timeout(format!("connect to {}", addr)))?
        .map_err(|e| ProtocolError::Connection {
            connection_string: connection_string.to_string(),
            message: e.to_string(),
        })?;

        Ok(Arc::new(ModbusTcpHandle {
            ctx: Mutex::new(ctx),
            connected: AtomicBool::new(true),
            read_timeout: Duration::from_millis(self.config.read_timeout_ms),
        }))
    }
}

fn parse_unit_id(resource_path: &str) -> Result<u8, ProtocolError> {
    let resource_path = resource_path.trim().trim_matches('/');
    if resource_path.is_empty() {
        return Ok(1);
    }
    resource_path
        .parse::<u8>()
        .map_err(|e| ProtocolError::Config(format!("unit id {}: {}", resource_path, e)))
}

/// Modbus TCP 会话
struct ModbusTcpHandle {
    ctx: Mutex<tokio_modbus::client::Context>,
    connected: AtomicBool,
    read_timeout: Duration,
}

impl ModbusTcpHandle {
    async fn read_address(&self, address: &ModbusAddress) -> Result<TagValue, ProtocolError> {
        let mut ctx = self.ctx.lock().await;
        let start = address.register_address;
        let count = address.register_count;

        let value = match address.function_code {
            1 | 2 => {
                let future = async {
                    if address.function_code == 1 {
                        // 读线圈
                        ctx.read_coils(start, count).await
                    } else {
                        // 读离散输入
                        ctx.read_discrete_inputs(start, count).await
                    }
                };
                let coils = tokio::time::timeout(self.read_timeout, future)
                    .await
                    .map_err(|_| ProtocolError::Timeout(format!("read coils at {}", start)))?
                    .map_err(|e| self.transport_error(e.to_string()))?
                    .map_err(|e| ProtocolError::Modbus(format!("exception: {:?}", e)))?;
                let first = coils
                    .first()
                    .copied()
                    .ok_or_else(|| ProtocolError::DataParse("empty coils".to_string()))?;
                TagValue::Bool(first)
            }
            3 | 4 => {
                let future = async {
                    if address.function_code == 3 {
                        // 读保持寄存器
                        ctx.read_holding_registers(start, count).await
                    } else {
                        // 读输入寄存器
                        ctx.read_input_registers(start, count).await
                    }
                };
                let registers = tokio::time::timeout(self.read_timeout, future)
                    .await
                    .map_err(|_| ProtocolError::Timeout(format!("read registers at {}", start)))?
                    .map_err(|e| self.transport_error(e.to_string()))?
                    .map_err(|e| ProtocolError::Modbus(format!("exception: {:?}", e)))?;
                debug!(
                    target: "edge.protocol",
                    register = start,
                    count = count,
                    values = ?registers,
                    "read modbus registers"
                );
                parse_registers(&registers, address.data_type)?
            }
            other => {
                return Err(ProtocolError::Config(format!(
                    "unsupported function code: {}",
                    other
                )));
            }
        };
        Ok(value)
    }

    /// 传输层错误：标记会话失效，下一次读取时重连
    fn transport_error(&self, message: String) -> ProtocolError {
        self.connected.store(false, Ordering::Release);
        ProtocolError::Modbus(message)
    }
}

#[async_trait]
impl PlcHandle for ModbusTcpHandle {
    fn metadata(&self) -> DriverMetadata {
        DriverMetadata {
            can_read: true,
            can_subscribe: false,
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn read(&self, query: &TagQuery) -> Result<ReadResponse, ProtocolError> {
        let address = ModbusAddress::parse(&query.address)?;
        let value = self.read_address(&address).await?;
        Ok(ReadResponse {
            tag_name: query.tag_name.clone(),
            value,
            received_at_ms: now_epoch_ms(),
        })
    }

    async fn subscribe(&self, _query: &TagQuery) -> Result<SubscriptionStream, ProtocolError> {
        Err(ProtocolError::Capability(Operation::Subscribe))
    }

    async fn close(&self) -> Result<(), ProtocolError> {
        self.connected.store(false, Ordering::Release);
        let mut ctx = self.ctx.lock().await;
        if let Err(e) = ctx.disconnect().await {
            warn!(target: "edge.protocol", error = %e, "modbus_disconnect_failed");
            return Err(ProtocolError::Modbus(e.to_string()));
        }
        Ok(())
    }
}

/// 解析寄存器数据
fn parse_registers(registers: &[u16], data_type: ModbusDataType) -> Result<TagValue, ProtocolError> {
    if registers.is_empty() {
        return Err(ProtocolError::DataParse("empty registers".to_string()));
    }
    let needed = data_type.register_count() as usize;
    if registers.len() < needed {
        return Err(ProtocolError::DataParse(format!(
            "need {} registers for {:?}",
            needed, data_type
        )));
    }

    let value = match data_type {
        ModbusDataType::Int16 => TagValue::Int(registers[0] as i16 as i64),
        ModbusDataType::Uint16 => TagValue::Int(registers[0] as i64),
        ModbusDataType::Int32 => {
            let high = registers[0] as u32;
            let low = registers[1] as u32;
            TagValue::Int(((high << 16) | low) as i32 as i64)
        }
        ModbusDataType::Uint32 => {
            let high = registers[0] as u32;
            let low = registers[1] as u32;
            TagValue::Int(((high << 16) | low) as i64)
        }
        ModbusDataType::Float32 => {
            let high = registers[0] as u32;
            let low = registers[1] as u32;
            TagValue::Float(f32::from_bits((high << 16) | low) as f64)
        }
        ModbusDataType::Float64 => {
            let bits = registers[..4]
                .iter()
                .fold(0u64, |acc, register| (acc << 16) | *register as u64);
            TagValue::Float(f64::from_bits(bits))
        }
    };

    Ok(value)
}
