//! 设备连接生命周期
//!
//! 连接状态由单个互斥锁保护的显式状态机表示，"不存在则连接，存在则复用"
//! 是一次加锁内完成的原子操作，因此并发调用只会发生一次物理握手。
//! `is_connected` 读取的是锁外发布的快照，可以在任意线程无锁调用。

use crate::driver::{PlcDriver, PlcHandle};
use crate::error::ProtocolError;
use crate::types::{ConnectionTarget, Operation, ReadResponse, TagQuery};
use std::sync::{Arc, RwLock};
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

enum ConnectionState {
    NotConnected,
    Connected(Arc<dyn PlcHandle>),
    Closed,
}

/// 单个设备的连接。
pub struct PlcConnection {
    driver: Arc<dyn PlcDriver>,
    connection_string: String,
    state: Mutex<ConnectionState>,
    current: RwLock<Option<Arc<dyn PlcHandle>>>,
}

impl PlcConnection {
    /// 创建连接（不发起握手）；配置非法时返回 [`ProtocolError::Config`]。
    pub fn new(driver: Arc<dyn PlcDriver>, target: &ConnectionTarget) -> Result<Self, ProtocolError> {
        if let Err(err) = target.validate() {
            debug!(
                target: "edge.protocol",
                error = %err,
                "connection_config_invalid"
            );
            return Err(err);
        }
        let connection_string = target.connection_string(driver.protocol());
        Ok(Self {
            driver,
            connection_string,
            state: Mutex::new(ConnectionState::NotConnected),
            current: RwLock::new(None),
        })
    }

    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }

    /// 当前是否已连接（无锁快照，仅供参考）。
    pub fn is_connected(&self) -> bool {
        self.snapshot()
            .map(|handle| handle.is_connected())
            .unwrap_or(false)
    }

    /// 建立连接；已连接时不做任何事。
    pub async fn connect(&self) -> Result<(), ProtocolError> {
        self.ensure_connected().await.map(|_| ())
    }

    /// 发起一次读取，结果通过回调异步送达。
    ///
    /// 连接失败与能力不满足同步返回；读取一旦发出，其失败只通过回调传递。
    pub async fn read<F>(&self, query: TagQuery, callback: F) -> Result<(), ProtocolError>
    where
        F: FnOnce(Result<ReadResponse, ProtocolError>) + Send + 'static,
    {
        let handle = self.ensure_connected().await?;
        if !handle.metadata().can_read {
            return Err(ProtocolError::Capability(Operation::Read));
        }
        debug!(
            target: "edge.protocol",
            connection = %self.connection_string,
            tag = %query.tag_name,
            "read_requested"
        );
        tokio::spawn(async move {
            let result = handle.read(&query).await;
            callback(result);
        });
        Ok(())
    }

    /// 读取并等待结果（基于 [`PlcConnection::read`] 的回调）。
    pub async fn read_value(&self, query: &TagQuery) -> Result<ReadResponse, ProtocolError> {
        let (tx, rx) = oneshot::channel();
        self.read(query.clone(), move |result| {
            let _ = tx.send(result);
        })
        .await?;
        rx.await.map_err(|_| ProtocolError::ChannelClosed)?
    }

    /// 订阅设备推送；此后每次推送都会调用 `callback`。
    ///
    /// 订阅请求本身在后台完成；订阅失败或设备端关闭推送流时，回调收到一次 `Err`，此后不再回调。
    /// 返回的 [`Subscription`] 被丢弃时订阅随之取消。
    pub async fn subscribe<F>(&self, query: TagQuery, callback: F) -> Result<Subscription, ProtocolError>
    where
        F: Fn(Result<ReadResponse, ProtocolError>) + Send + Sync + 'static,
    {
        let handle = self.ensure_connected().await?;
        if !handle.metadata().can_subscribe {
            return Err(ProtocolError::Capability(Operation::Subscribe));
        }
        debug!(
            target: "edge.protocol",
            connection = %self.connection_string,
            tag = %query.tag_name,
            "subscribe_requested"
        );
        let tag_name = query.tag_name.clone();
        let task = tokio::spawn(async move {
            let mut stream = match handle.subscribe(&query).await {
                Ok(stream) => stream,
                Err(err) => {
                    warn!(
                        target: "edge.protocol",
                        tag = %query.tag_name,
                        error = %err,
                        "subscription_failed"
                    );
                    callback(Err(err));
                    return;
                }
            };
            while let Some(response) = stream.recv().await {
                callback(Ok(response));
            }
            warn!(target: "edge.protocol", tag = %query.tag_name, "subscription_ended");
            callback(Err(ProtocolError::Subscription(format!(
                "stream for tag '{}' ended",
                query.tag_name
            ))));
        });
        Ok(Subscription { tag_name, task })
    }

    /// 断开连接；无论 close 是否成功，句柄都会被清空。
    pub async fn disconnect(&self) -> Result<(), ProtocolError> {
        let mut state = self.state.lock().await;
        let previous = std::mem::replace(&mut *state, ConnectionState::Closed);
        self.publish(None);
        if let ConnectionState::Connected(handle) = previous {
            if handle.is_connected() {
                info!(
                    target: "edge.protocol",
                    connection = %self.connection_string,
                    "connection_closing"
                );
                handle.close().await?;
            }
        }
        Ok(())
    }

    async fn ensure_connected(&self) -> Result<Arc<dyn PlcHandle>, ProtocolError> {
        if let Some(handle) = self.snapshot() {
            if handle.is_connected() {
                return Ok(handle);
            }
        }

        let mut state = self.state.lock().await;
        if let ConnectionState::Connected(handle) = &*state {
            if handle.is_connected() {
                return Ok(handle.clone());
            }
            // 会话已失效：尽力关闭后重连
            if let Err(err) = handle.close().await {
                debug!(
                    target: "edge.protocol",
                    connection = %self.connection_string,
                    error = %err,
                    "stale_connection_close_failed"
                );
            }
        }

        info!(
            target: "edge.protocol",
            connection = %self.connection_string,
            "connection_connecting"
        );
        match self.driver.connect(&self.connection_string).await {
            Ok(handle) => {
                *state = ConnectionState::Connected(handle.clone());
                self.publish(Some(handle.clone()));
                info!(
                    target: "edge.protocol",
                    connection = %self.connection_string,
                    "connection_established"
                );
                Ok(handle)
            }
            Err(err) => {
                *state = ConnectionState::NotConnected;
                self.publish(None);
                warn!(
                    target: "edge.protocol",
                    connection = %self.connection_string,
                    error = %err,
                    "connection_failed"
                );
                Err(ProtocolError::connection(&self.connection_string, err))
            }
        }
    }

    fn snapshot(&self) -> Option<Arc<dyn PlcHandle>> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn publish(&self, handle: Option<Arc<dyn PlcHandle>>) {
        *self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = handle;
    }
}

/// 活动订阅；丢弃或 [`Subscription::cancel`] 后不再回调。
pub struct Subscription {
    tag_name: String,
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn tag_name(&self) -> &str {
        &self.tag_name
    }

    pub fn cancel(&self) {
        self.task.abort();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}
