//! # 轮询调度能力模块
//!
//! - [`PollingScheduler`]：跨适配器共享，按节奏触发采样器，集中维护连续错误计数并驱逐
//! - [`Sampler`] / [`AdapterSampler`]：绑定单个适配器与单个标签的调度单元
//! - [`PollingProtocolAdapter`]：连接 + 采集策略 + 查询构造的组合
//!
//! ## 数据流
//!
//! ```text
//! PollingScheduler tick
//!       │
//!       ▼
//! Sampler::execute ──► SampleAcquirer::acquire(PlcConnection)
//!       │                         │
//!       │ Err                     ▼ Ok
//!       ▼                   PublishPipeline::capture_data_sample（不等待）
//! 连续错误计数 ──► Sampler::error(cause, continuing)
//!                         │ continuing == false
//!                         ▼
//!                 PollingProtocolAdapter::stop
//! ```

mod adapter;
mod error;
mod sampler;
mod scheduler;

pub use adapter::{
    AdapterBuilder, AdapterDefinition, AdapterMode, AdapterSampler, ModuleServices,
    PollingProtocolAdapter, QueryBuilder, ReadAcquirer, SampleAcquirer,
};
pub use error::{AdapterError, SamplerError};
pub use sampler::{
    DEFAULT_MAX_CONSECUTIVE_ERRORS, Sampler, SamplerConfig, SamplerLifecycle, SamplerState,
    ScheduleMode, TickContext,
};
pub use scheduler::{DEFAULT_STOP_TIMEOUT, PollingScheduler, SchedulerConfig};
