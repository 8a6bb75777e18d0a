//! 协议错误类型定义

use crate::types::Operation;

/// 协议通信错误
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// 连接/握手失败（同步返回给触发连接的调用方，不在此层重试）
    #[error("connection error ({connection_string}): {message}")]
    Connection {
        connection_string: String,
        message: String,
    },

    /// 连接类型不支持该操作（配置错误，不重试）
    #[error("connection type cannot {0}")]
    Capability(Operation),

    /// 连接配置非法
    #[error("invalid connection configuration: {0}")]
    Config(String),

    /// IO 错误
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Modbus 错误
    #[error("modbus error: {0}")]
    Modbus(String),

    /// 数据解析错误
    #[error("data parse error: {0}")]
    DataParse(String),

    /// 超时错误
    #[error("timeout: {0}")]
    Timeout(String),

    /// 订阅错误
    #[error("subscription error: {0}")]
    Subscription(String),

    /// 通道关闭
    #[error("channel closed")]
    ChannelClosed,
}

impl ProtocolError {
    /// 包装为连接错误；已是连接错误时原样返回。
    pub fn connection(connection_string: &str, cause: ProtocolError) -> Self {
        match cause {
            err @ ProtocolError::Connection { .. } => err,
            other => ProtocolError::Connection {
                connection_string: connection_string.to_string(),
                message: other.to_string(),
            },
        }
    }

    pub fn is_capability(&self) -> bool {
        matches!(self, ProtocolError::Capability(_))
    }
}
