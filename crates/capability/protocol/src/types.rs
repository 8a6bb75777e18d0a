//! 协议相关类型定义

use crate::error::ProtocolError;
use domain::TagValue;
use serde::{Deserialize, Serialize};
use std::fmt;

/// 连接串中端口的上限（不含）。
const MAX_UINT16: u32 = 65_535;

/// 连接目标（host/port/资源路径）。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionTarget {
    pub host: String,
    pub port: u16,
    /// 资源路径（可为空），如 `rack0/slot1`
    #[serde(default)]
    pub resource_path: String,
}

impl ConnectionTarget {
    pub fn new(host: impl Into<String>, port: u16, resource_path: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            resource_path: resource_path.into(),
        }
    }

    /// 校验连接配置。
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.host.trim().is_empty() {
            return Err(ProtocolError::Config("host is empty".to_string()));
        }
        if self.port == 0 || u32::from(self.port) >= MAX_UINT16 {
            return Err(ProtocolError::Config(format!(
                "port out of range: {}",
                self.port
            )));
        }
        Ok(())
    }

    /// 生成连接串：`<protocol>://<host>:<port>[/<resource_path>]`。
    pub fn connection_string(&self, protocol: &str) -> String {
        let resource_path = self.resource_path.trim();
        if resource_path.is_empty() {
            format!("{}://{}:{}", protocol.trim(), self.host.trim(), self.port)
        } else {
            format!(
                "{}://{}:{}/{}",
                protocol.trim(),
                self.host.trim(),
                self.port,
                resource_path
            )
        }
    }
}

/// 解析后的连接串。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedConnectionString {
    pub protocol: String,
    pub target: ConnectionTarget,
}

/// 解析连接串（供驱动使用）。
pub fn parse_connection_string(value: &str) -> Result<ParsedConnectionString, ProtocolError> {
    let (protocol, rest) = value
        .split_once("://")
        .ok_or_else(|| ProtocolError::Config(format!("missing scheme: {}", value)))?;
    let (authority, resource_path) = match rest.split_once('/') {
        Some((authority, path)) => (authority, path),
        None => (rest, ""),
    };
    let (host, port) = authority
        .rsplit_once(':')
        .ok_or_else(|| ProtocolError::Config(format!("missing port: {}", value)))?;
    let port = port
        .parse::<u16>()
        .map_err(|e| ProtocolError::Config(format!("invalid port {}: {}", port, e)))?;
    let target = ConnectionTarget::new(host, port, resource_path);
    target.validate()?;
    Ok(ParsedConnectionString {
        protocol: protocol.to_string(),
        target,
    })
}

/// 驱动能力元数据。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverMetadata {
    pub can_read: bool,
    pub can_subscribe: bool,
}

/// 连接操作（用于能力错误）。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Read,
    Subscribe,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Read => f.write_str("read-blocking"),
            Operation::Subscribe => f.write_str("subscribe"),
        }
    }
}

/// 读取/订阅查询。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagQuery {
    /// 标签名（回填到响应）
    pub tag_name: String,
    /// 驱动相关的地址表达式
    pub address: String,
}

impl TagQuery {
    pub fn new(tag_name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            tag_name: tag_name.into(),
            address: address.into(),
        }
    }
}

/// 设备读取/推送的响应。
#[derive(Debug, Clone, PartialEq)]
pub struct ReadResponse {
    pub tag_name: String,
    pub value: TagValue,
    /// 接收时间戳（毫秒）
    pub received_at_ms: i64,
}

/// Modbus 寄存器数据类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModbusDataType {
    /// 16位有符号整数
    #[default]
    Int16,
    /// 16位无符号整数
    Uint16,
    /// 32位有符号整数（2个寄存器）
    Int32,
    /// 32位无符号整数（2个寄存器）
    Uint32,
    /// 32位浮点数（2个寄存器）
    Float32,
    /// 64位浮点数（4个寄存器）
    Float64,
}

impl ModbusDataType {
    fn parse(value: &str) -> Result<Self, ProtocolError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "int16" => Ok(Self::Int16),
            "uint16" => Ok(Self::Uint16),
            "int32" => Ok(Self::Int32),
            "uint32" => Ok(Self::Uint32),
            "float32" => Ok(Self::Float32),
            "float64" => Ok(Self::Float64),
            other => Err(ProtocolError::Config(format!(
                "unsupported data type: {}",
                other
            ))),
        }
    }

    /// 该类型最少需要的寄存器数量
    pub fn register_count(self) -> u16 {
        match self {
            Self::Int16 | Self::Uint16 => 1,
            Self::Int32 | Self::Uint32 | Self::Float32 => 2,
            Self::Float64 => 4,
        }
    }
}

/// Modbus 标签地址：`<function_code>:<register>[:<count>][:<data_type>]`
///
/// 例如 `3:100:2:float32` 读保持寄存器 100 起的 2 个寄存器并按 float32 解析。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModbusAddress {
    /// 功能码（1-4）
    pub function_code: u8,
    /// 寄存器起始地址
    pub register_address: u16,
    /// 寄存器数量
    pub register_count: u16,
    /// 数据类型
    pub data_type: ModbusDataType,
}

impl ModbusAddress {
    pub fn parse(value: &str) -> Result<Self, ProtocolError> {
        let parts: Vec<&str> = value.split(':').map(str::trim).collect();
        if parts.len() < 2 || parts.len() > 4 {
            return Err(ProtocolError::Config(format!(
                "invalid modbus address: {}",
                value
            )));
        }
        let function_code = parts[0]
            .parse::<u8>()
            .map_err(|e| ProtocolError::Config(format!("function code: {}", e)))?;
        if !(1..=4).contains(&function_code) {
            return Err(ProtocolError::Config(format!(
                "unsupported function code: {}",
                function_code
            )));
        }
        let register_address = parts[1]
            .parse::<u16>()
            .map_err(|e| ProtocolError::Config(format!("register address: {}", e)))?;
        let data_type = match parts.get(3) {
            Some(data_type) => ModbusDataType::parse(data_type)?,
            None => ModbusDataType::default(),
        };
        let register_count = match parts.get(2) {
            Some(count) => count
                .parse::<u16>()
                .map_err(|e| ProtocolError::Config(format!("register count: {}", e)))?,
            None => data_type.register_count(),
        };
        if register_count == 0 {
            return Err(ProtocolError::Config("register count is zero".to_string()));
        }
        Ok(Self {
            function_code,
            register_address,
            register_count,
            data_type,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_string_without_resource_path() {
        let target = ConnectionTarget::new("plc.local", 102, "");
        assert_eq!(target.connection_string("s7"), "s7://plc.local:102");

        let blank = ConnectionTarget::new("plc.local", 102, "   ");
        assert_eq!(blank.connection_string("s7"), "s7://plc.local:102");
    }

    #[test]
    fn connection_string_with_resource_path() {
        let target = ConnectionTarget::new(" plc.local ", 102, "rack0/slot1");
        assert_eq!(
            target.connection_string("s7"),
            "s7://plc.local:102/rack0/slot1"
        );
    }

    #[test]
    fn parse_connection_string_roundtrips_target() {
        let parsed = parse_connection_string("modbus-tcp://10.0.0.5:502/3").unwrap();
        assert_eq!(parsed.protocol, "modbus-tcp");
        assert_eq!(parsed.target.host, "10.0.0.5");
        assert_eq!(parsed.target.port, 502);
        assert_eq!(parsed.target.resource_path, "3");
    }

    #[test]
    fn validate_rejects_bad_targets() {
        assert!(ConnectionTarget::new("", 502, "").validate().is_err());
        assert!(ConnectionTarget::new("plc", 0, "").validate().is_err());
        assert!(ConnectionTarget::new("plc", 502, "").validate().is_ok());
    }

    #[test]
    fn parse_modbus_address() {
        let address = ModbusAddress::parse("3:100:2:float32").unwrap();
        assert_eq!(address.function_code, 3);
        assert_eq!(address.register_address, 100);
        assert_eq!(address.register_count, 2);
        assert_eq!(address.data_type, ModbusDataType::Float32);

        let short = ModbusAddress::parse("4:7").unwrap();
        assert_eq!(short.register_count, 1);
        assert_eq!(short.data_type, ModbusDataType::Int16);

        assert!(ModbusAddress::parse("6:1").is_err());
        assert!(ModbusAddress::parse("3").is_err());
    }
}
