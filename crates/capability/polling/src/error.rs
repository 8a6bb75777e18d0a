use edge_protocol::ProtocolError;

/// 单次采样失败原因。
#[derive(Debug, thiserror::Error)]
pub enum SamplerError {
    /// 采样前已收到停止信号（不计入连续错误）
    #[error("sampler cancelled")]
    Cancelled,
    #[error("acquisition error: {0}")]
    Acquisition(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// 适配器生命周期错误。
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("invalid adapter definition: {0}")]
    Definition(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
