use domain::{ConnectionStatus, DataSample, Qos};

#[test]
fn sample_keeps_raw_fields() {
    let sample = DataSample::with_timestamp(
        "adapter-1",
        "temperature",
        "plant/line-1/temperature",
        b"21.5".to_vec(),
        1,
        1_700_000_000_000,
    );

    assert_eq!(sample.adapter_id(), "adapter-1");
    assert_eq!(sample.tag_name(), "temperature");
    assert_eq!(sample.topic(), "plant/line-1/temperature");
    assert_eq!(sample.payload(), b"21.5");
    assert_eq!(sample.qos(), 1);
    assert_eq!(sample.captured_at_ms(), 1_700_000_000_000);
}

#[test]
fn qos_accepts_only_defined_levels() {
    assert_eq!(Qos::from_u8(0), Some(Qos::AtMostOnce));
    assert_eq!(Qos::from_u8(2), Some(Qos::ExactlyOnce));
    assert!(Qos::from_u8(3).is_none());
    assert!(Qos::try_from(7u8).is_err());
}

#[test]
fn connection_status_defaults_to_uninitialized() {
    assert_eq!(ConnectionStatus::default(), ConnectionStatus::Uninitialized);
    assert_eq!(ConnectionStatus::Error.to_string(), "ERROR");
}
