//! 采样 payload 编码。

use crate::PublishError;
use domain::DataSample;
use serde::Serialize;

/// 将采样编码为总线 payload。
pub trait SampleSerializer: Send + Sync {
    fn serialize(&self, sample: &DataSample) -> Result<Vec<u8>, PublishError>;
}

/// 原样透传采样 payload。
#[derive(Debug, Default, Clone, Copy)]
pub struct RawSampleSerializer;

impl SampleSerializer for RawSampleSerializer {
    fn serialize(&self, sample: &DataSample) -> Result<Vec<u8>, PublishError> {
        Ok(sample.payload().to_vec())
    }
}

/// JSON 信封：`{"timestamp": .., "tagName": .., "value": ..}`。
///
/// payload 本身是合法 JSON 时按结构嵌入，否则作为字符串。
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSampleSerializer;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SampleEnvelope<'a> {
    timestamp: i64,
    tag_name: &'a str,
    value: serde_json::Value,
}

impl SampleSerializer for JsonSampleSerializer {
    fn serialize(&self, sample: &DataSample) -> Result<Vec<u8>, PublishError> {
        let value = serde_json::from_slice::<serde_json::Value>(sample.payload()).unwrap_or_else(
            |_| serde_json::Value::String(String::from_utf8_lossy(sample.payload()).into_owned()),
        );
        let envelope = SampleEnvelope {
            timestamp: sample.captured_at_ms(),
            tag_name: sample.tag_name(),
            value,
        };
        serde_json::to_vec(&envelope).map_err(|err| PublishError::Serialization(err.to_string()))
    }
}
