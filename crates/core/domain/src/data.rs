use serde::{Deserialize, Serialize};

/// 设备读回的标签值。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TagValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

/// MQTT 服务质量等级。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Qos {
    /// 至多一次 (0)
    AtMostOnce = 0,
    /// 至少一次 (1)
    AtLeastOnce = 1,
    /// 恰好一次 (2)
    ExactlyOnce = 2,
}

impl Qos {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::AtMostOnce),
            1 => Some(Self::AtLeastOnce),
            2 => Some(Self::ExactlyOnce),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl From<Qos> for u8 {
    fn from(value: Qos) -> Self {
        value.as_u8()
    }
}

impl TryFrom<u8> for Qos {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::from_u8(value).ok_or_else(|| format!("invalid qos: {}", value))
    }
}

/// 一次轮询产出的采样。
///
/// 构造后不可变，由发布链路按值消费一次。QoS 保留原始数值，
/// 合法性（0/1/2）由发布链路在发送前校验。
#[derive(Debug, Clone, PartialEq)]
pub struct DataSample {
    adapter_id: String,
    tag_name: String,
    topic: String,
    payload: Vec<u8>,
    qos: u8,
    captured_at_ms: i64,
}

impl DataSample {
    /// 以当前时间作为采集时间构造采样。
    pub fn new(
        adapter_id: impl Into<String>,
        tag_name: impl Into<String>,
        topic: impl Into<String>,
        payload: Vec<u8>,
        qos: u8,
    ) -> Self {
        Self::with_timestamp(adapter_id, tag_name, topic, payload, qos, crate::now_epoch_ms())
    }

    pub fn with_timestamp(
        adapter_id: impl Into<String>,
        tag_name: impl Into<String>,
        topic: impl Into<String>,
        payload: Vec<u8>,
        qos: u8,
        captured_at_ms: i64,
    ) -> Self {
        Self {
            adapter_id: adapter_id.into(),
            tag_name: tag_name.into(),
            topic: topic.into(),
            payload,
            qos,
            captured_at_ms,
        }
    }

    pub fn adapter_id(&self) -> &str {
        &self.adapter_id
    }

    pub fn tag_name(&self) -> &str {
        &self.tag_name
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// 原始 QoS 数值（未校验）。
    pub fn qos(&self) -> u8 {
        self.qos
    }

    pub fn captured_at_ms(&self) -> i64 {
        self.captured_at_ms
    }
}

/// 标签订阅：读取哪个地址、发布到哪个 topic。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagSubscription {
    pub tag_name: String,
    pub tag_address: String,
    /// 目标 topic
    pub destination: String,
    #[serde(default)]
    pub qos: u8,
}

impl TagSubscription {
    pub fn new(
        tag_name: impl Into<String>,
        tag_address: impl Into<String>,
        destination: impl Into<String>,
        qos: u8,
    ) -> Self {
        Self {
            tag_name: tag_name.into(),
            tag_address: tag_address.into(),
            destination: destination.into(),
            qos,
        }
    }
}
