//! 驱动抽象
//!
//! 具体协议驱动实现 [`PlcDriver`]（建立连接）与 [`PlcHandle`]（已建立的会话）。

use crate::error::ProtocolError;
use crate::types::{DriverMetadata, ReadResponse, TagQuery};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// 订阅推送流：设备每推送一次产生一条响应。
pub type SubscriptionStream = mpsc::Receiver<ReadResponse>;

/// 已建立的设备会话。
#[async_trait]
pub trait PlcHandle: Send + Sync {
    /// 驱动能力（是否支持阻塞读取/订阅）
    fn metadata(&self) -> DriverMetadata;

    /// 会话是否仍然可用
    fn is_connected(&self) -> bool;

    async fn read(&self, query: &TagQuery) -> Result<ReadResponse, ProtocolError>;

    async fn subscribe(&self, query: &TagQuery) -> Result<SubscriptionStream, ProtocolError>;

    async fn close(&self) -> Result<(), ProtocolError>;
}

/// 协议驱动：按连接串完成握手。
#[async_trait]
pub trait PlcDriver: Send + Sync {
    /// 协议标识（连接串 scheme）
    fn protocol(&self) -> &str;

    /// 建立连接（可能阻塞较长时间）
    async fn connect(&self, connection_string: &str) -> Result<Arc<dyn PlcHandle>, ProtocolError>;
}

/// 驱动注册表：protocol id -> 驱动。
#[derive(Clone, Default)]
pub struct DriverRegistry {
    drivers: HashMap<String, Arc<dyn PlcDriver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册驱动；同名协议后注册者覆盖先注册者。
    pub fn register(&mut self, driver: Arc<dyn PlcDriver>) {
        self.drivers.insert(driver.protocol().to_string(), driver);
    }

    pub fn get(&self, protocol: &str) -> Option<Arc<dyn PlcDriver>> {
        self.drivers.get(protocol).cloned()
    }

    pub fn protocols(&self) -> Vec<String> {
        let mut protocols: Vec<String> = self.drivers.keys().cloned().collect();
        protocols.sort();
        protocols
    }
}
