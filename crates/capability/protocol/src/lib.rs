//! # 设备连接能力模块
//!
//! 核心只依赖驱动抽象（[`PlcDriver`] / [`PlcHandle`]），不关心具体现场总线的字节格式。
//! 每个适配器持有一个 [`PlcConnection`]，负责：
//! - **懒/急连接**：首次读取时建立或启动时立即建立
//! - **单飞连接**：并发调用 `connect` 时只发生一次物理握手
//! - **读取/订阅**：能力不满足时返回 [`ProtocolError::Capability`]
//! - **断开**：无论 close 是否失败都清空句柄
//!
//! ## 架构设计
//!
//! ```text
//! AdapterConfig (protocol + host/port/resource_path)
//!       │
//!       ▼
//! DriverRegistry ──► PlcDriver::connect(connection_string)
//!       │
//!       ▼
//! PlcConnection (Mutex<ConnectionState>)
//!       │
//!       ├── read(query, callback)
//!       └── subscribe(query, callback)
//!       │
//!       ▼
//! PlcHandle (ModbusTcpHandle / TcpLineHandle / ...)
//! ```
//!
//! ## 连接串
//!
//! `<protocol>://<host>:<port>[/<resource_path>]`，资源路径为空时不带尾段：
//! ```text
//! modbus-tcp://plc.local:502/1
//! tcp://10.0.0.8:9000/stream
//! ```

mod connection;
mod driver;
mod error;
mod modbus_tcp;
mod tcp_client;
mod types;

pub use connection::{PlcConnection, Subscription};
pub use driver::{DriverRegistry, PlcDriver, PlcHandle, SubscriptionStream};
pub use error::ProtocolError;
pub use modbus_tcp::{MODBUS_TCP_PROTOCOL, ModbusTcpConfig, ModbusTcpDriver};
pub use tcp_client::{TCP_LINE_PROTOCOL, TcpLineConfig, TcpLineDriver};
pub use types::*;
