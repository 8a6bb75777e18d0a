//! TCP 行协议驱动
//!
//! 以换行分隔的文本帧与设备交互，两种模式由连接串资源路径决定：
//! - **request**（默认）：发送标签地址作为请求命令，读取一行响应；只支持读取
//! - **stream**（`tcp://host:port/stream`）：设备主动推送数据行；只支持订阅
//!
//! ## 使用示例
//!
//! ```rust,ignore
//! let driver = Arc::new(TcpLineDriver::new(TcpLineConfig::default()));
//! let target = ConnectionTarget::new("192.168.1.100", 8080, "");
//! let connection = PlcConnection::new(driver, &target)?;
//! let response = connection.read_value(&TagQuery::new("temp", "READ TEMP")).await?;
//! ```

use crate::driver::{PlcDriver, PlcHandle, SubscriptionStream};
use crate::error::ProtocolError;
use crate::types::{DriverMetadata, Operation, ReadResponse, TagQuery, parse_connection_string};
use async_trait::async_trait;
use domain::{TagValue, now_epoch_ms};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

/// 协议标识
pub const TCP_LINE_PROTOCOL: &str = "tcp";

/// 推送模式的资源路径
const STREAM_RESOURCE: &str = "stream";

/// TCP 行协议驱动配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpLineConfig {
    /// 连接超时（毫秒）
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// 读取超时（毫秒）
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,
    /// 每个订阅的推送缓冲
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for TcpLineConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout(),
            read_timeout_ms: default_read_timeout(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

fn default_connect_timeout() -> u64 {
    5000
}

fn default_read_timeout() -> u64 {
    5000
}

fn default_channel_capacity() -> usize {
    64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineMode {
    Request,
    Stream,
}

/// TCP 行协议驱动
#[derive(Debug, Clone, Default)]
pub struct TcpLineDriver {
    config: TcpLineConfig,
}

impl TcpLineDriver {
    pub fn new(config: TcpLineConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl PlcDriver for TcpLineDriver {
    fn protocol(&self) -> &str {
        TCP_LINE_PROTOCOL
    }

    async fn connect(&self, connection_string: &str) -> Result<Arc<dyn PlcHandle>, ProtocolError> {
        let parsed = parse_connection_string(connection_string)?;
        let mode = if parsed.target.resource_path.trim().trim_matches('/') == STREAM_RESOURCE {
            LineMode::Stream
        } else {
            LineMode::Request
        };
        let addr = format!("{}:{}", parsed.target.host.trim(), parsed.target.port);
        info!(target: "edge.protocol", addr = %addr, mode = ?mode, "tcp_connecting");

        let stream = tokio::time::timeout(
            Duration::from_millis(self.config.connect_timeout_ms),
            TcpStream::connect(&addr),
        )
        .await
        .map_err(|_| ProtocolError::Timeout(format!("connect to {}", addr)))?
        .map_err(|e| ProtocolError::Connection {
            connection_string: connection_string.to_string(),
            message: e.to_string(),
        })?;

        let (reader, writer) = stream.into_split();
        Ok(Arc::new(TcpLineHandle {
            mode,
            io: Mutex::new(Some(LineIo {
                reader: BufReader::new(reader),
                writer,
            })),
            parked_writer: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(true)),
            subscribers: Arc::new(StdMutex::new(Vec::new())),
            read_timeout: Duration::from_millis(self.config.read_timeout_ms),
            channel_capacity: self.config.channel_capacity.max(1),
        }))
    }
}

struct LineIo {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

type Subscribers = Arc<StdMutex<Vec<(String, mpsc::Sender<ReadResponse>)>>>;

/// TCP 行协议会话
struct TcpLineHandle {
    mode: LineMode,
    io: Mutex<Option<LineIo>>,
    /// 推送模式下读半部交给推送循环，写半部停放至会话关闭
    parked_writer: Mutex<Option<OwnedWriteHalf>>,
    connected: Arc<AtomicBool>,
    subscribers: Subscribers,
    read_timeout: Duration,
    channel_capacity: usize,
}

#[async_trait]
impl PlcHandle for TcpLineHandle {
    fn metadata(&self) -> DriverMetadata {
        DriverMetadata {
            can_read: self.mode == LineMode::Request,
            can_subscribe: self.mode == LineMode::Stream,
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn read(&self, query: &TagQuery) -> Result<ReadResponse, ProtocolError> {
        if self.mode != LineMode::Request {
            return Err(ProtocolError::Capability(Operation::Read));
        }
        let mut guard = self.io.lock().await;
        let io = guard.as_mut().ok_or_else(|| ProtocolError::Connection {
            connection_string: TCP_LINE_PROTOCOL.to_string(),
            message: "connection closed".to_string(),
        })?;

        // 发送请求命令
        let command = query.address.trim_end_matches('\n');
        if !command.is_empty() {
            let line = format!("{}\n", command);
            io.writer.write_all(line.as_bytes()).await.map_err(|e| {
                self.connected.store(false, Ordering::Release);
                ProtocolError::Io(e)
            })?;
            io.writer.flush().await?;
            debug!(target: "edge.protocol", command = %command, "sent request command");
        }

        // 读取响应
        let mut response = String::new();
        match tokio::time::timeout(self.read_timeout, io.reader.read_line(&mut response)).await {
            Ok(Ok(0)) => {
                self.connected.store(false, Ordering::Release);
                Err(ProtocolError::Connection {
                    connection_string: TCP_LINE_PROTOCOL.to_string(),
                    message: "connection closed".to_string(),
                })
            }
            Ok(Ok(_)) => {
                let data = response.trim();
                debug!(target: "edge.protocol", response = %data, "received response");
                Ok(ReadResponse {
                    tag_name: query.tag_name.clone(),
                    value: parse_response(data),
                    received_at_ms: now_epoch_ms(),
                })
            }
            Ok(Err(e)) => {
                self.connected.store(false, Ordering::Release);
                Err(ProtocolError::Io(e))
            }
            Err(_) => Err(ProtocolError::Timeout(format!(
                "read response for {}",
                query.tag_name
            ))),
        }
    }

    async fn subscribe(&self, query: &TagQuery) -> Result<SubscriptionStream, ProtocolError> {
        if self.mode != LineMode::Stream {
            return Err(ProtocolError::Capability(Operation::Subscribe));
        }
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((query.tag_name.clone(), tx));

        // 首个订阅者接管读半部，启动推送循环
        let io = self.io.lock().await.take();
        if let Some(io) = io {
            tokio::spawn(push_loop(
                io.reader,
                self.subscribers.clone(),
                self.connected.clone(),
            ));
            *self.parked_writer.lock().await = Some(io.writer);
        } else if !self.is_connected() {
            return Err(ProtocolError::Subscription(
                "stream already closed".to_string(),
            ));
        }
        Ok(rx)
    }

    async fn close(&self) -> Result<(), ProtocolError> {
        self.connected.store(false, Ordering::Release);
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
        if let Some(mut io) = self.io.lock().await.take() {
            io.writer.shutdown().await?;
        }
        if let Some(mut writer) = self.parked_writer.lock().await.take() {
            writer.shutdown().await?;
        }
        Ok(())
    }
}

/// 推送循环：每行数据分发给所有订阅者
async fn push_loop(
    mut reader: BufReader<OwnedReadHalf>,
    subscribers: Subscribers,
    connected: Arc<AtomicBool>,
) {
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                info!(target: "edge.protocol", "tcp stream closed by peer");
                break;
            }
            Ok(_) => {
                let data = line.trim();
                if data.is_empty() {
                    continue;
                }
                let value = parse_response(data);
                let received_at_ms = now_epoch_ms();
                let mut subscribers = subscribers
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                subscribers.retain(|(tag_name, tx)| {
                    let response = ReadResponse {
                        tag_name: tag_name.clone(),
                        value: value.clone(),
                        received_at_ms,
                    };
                    match tx.try_send(response) {
                        Ok(()) => true,
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            warn!(target: "edge.protocol", tag = %tag_name, "subscriber lagging, frame dropped");
                            true
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => false,
                    }
                });
                if subscribers.is_empty() {
                    break;
                }
            }
            Err(e) => {
                warn!(target: "edge.protocol", error = %e, "tcp stream read failed");
                break;
            }
        }
    }
    connected.store(false, Ordering::Release);
    subscribers
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clear();
}

/// 解析响应数据
fn parse_response(data: &str) -> TagValue {
    // 格式1：纯数值
    if let Ok(value) = data.parse::<f64>() {
        return TagValue::Float(value);
    }

    // 格式2：JSON {"value": 123.45}
    if let Ok(json) = serde_json::from_str::<serde_json::Value>(data) {
        if let Some(value) = json.get("value").and_then(|v| v.as_f64()) {
            return TagValue::Float(value);
        }
    }

    // 格式3：key=value
    for part in data.split(['=', ':', ',']) {
        if let Ok(value) = part.trim().parse::<f64>() {
            return TagValue::Float(value);
        }
    }

    TagValue::Text(data.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_parse_config() {
        let config: TcpLineConfig = serde_json::from_str(r#"{"read_timeout_ms": 2000}"#).unwrap();
        let driver = TcpLineDriver::new(config);
        assert_eq!(driver.config.read_timeout_ms, 2000);
        assert_eq!(driver.config.connect_timeout_ms, 5000);
    }

    #[test]
    fn test_parse_response() {
        // 纯数值
        assert_eq!(parse_response("123.45"), TagValue::Float(123.45));

        // JSON 格式
        assert_eq!(parse_response(r#"{"value": 42.0}"#), TagValue::Float(42.0));

        // key=value 格式
        assert_eq!(parse_response("temp=25.5"), TagValue::Float(25.5));

        // 无法解析时保留原文
        assert_eq!(parse_response("OK"), TagValue::Text("OK".to_string()));
    }

    #[tokio::test]
    async fn request_mode_reads_one_line() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (reader, mut writer) = stream.into_split();
            let mut reader = BufReader::new(reader);
            let mut command = String::new();
            reader.read_line(&mut command).await.unwrap();
            assert_eq!(command.trim(), "READ TEMP");
            writer.write_all(b"temp=21.5\n").await.unwrap();
        });

        let driver = TcpLineDriver::default();
        let handle = driver
            .connect(&format!("tcp://127.0.0.1:{}", port))
            .await
            .unwrap();
        assert!(handle.metadata().can_read);
        assert!(!handle.metadata().can_subscribe);

        let response = handle
            .read(&TagQuery::new("temperature", "READ TEMP"))
            .await
            .unwrap();
        assert_eq!(response.tag_name, "temperature");
        assert_eq!(response.value, TagValue::Float(21.5));
    }

    #[tokio::test]
    async fn stream_mode_pushes_lines_to_subscribers() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(b"1\n2\n").await.unwrap();
        });

        let driver = TcpLineDriver::default();
        let handle = driver
            .connect(&format!("tcp://127.0.0.1:{}/stream", port))
            .await
            .unwrap();
        assert!(handle.metadata().can_subscribe);

        let mut stream = handle
            .subscribe(&TagQuery::new("counter", ""))
            .await
            .unwrap();
        let first = stream.recv().await.unwrap();
        let second = stream.recv().await.unwrap();
        assert_eq!(first.value, TagValue::Float(1.0));
        assert_eq!(second.value, TagValue::Float(2.0));
        assert_eq!(second.tag_name, "counter");
    }
}
