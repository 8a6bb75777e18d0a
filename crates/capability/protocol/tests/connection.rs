use async_trait::async_trait;
use domain::TagValue;
use edge_protocol::{
    ConnectionTarget, DriverMetadata, PlcConnection, PlcDriver, PlcHandle, ProtocolError,
    ReadResponse, SubscriptionStream, TagQuery,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

#[derive(Default)]
struct FakeState {
    connects: AtomicUsize,
    reads: AtomicUsize,
    fail_connect: AtomicBool,
    fail_close: AtomicBool,
}

struct FakeDriver {
    state: Arc<FakeState>,
    metadata: DriverMetadata,
    handshake_delay: Duration,
}

impl FakeDriver {
    fn new(metadata: DriverMetadata) -> Self {
        Self {
            state: Arc::new(FakeState::default()),
            metadata,
            handshake_delay: Duration::from_millis(20),
        }
    }
}

struct FakeHandle {
    state: Arc<FakeState>,
    metadata: DriverMetadata,
    connected: AtomicBool,
}

#[async_trait]
impl PlcDriver for FakeDriver {
    fn protocol(&self) -> &str {
        "fake"
    }

    async fn connect(&self, connection_string: &str) -> Result<Arc<dyn PlcHandle>, ProtocolError> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.handshake_delay).await;
        if self.state.fail_connect.load(Ordering::SeqCst) {
            return Err(ProtocolError::Connection {
                connection_string: connection_string.to_string(),
                message: "refused".to_string(),
            });
        }
        Ok(Arc::new(FakeHandle {
            state: self.state.clone(),
            metadata: self.metadata,
            connected: AtomicBool::new(true),
        }))
    }
}

#[async_trait]
impl PlcHandle for FakeHandle {
    fn metadata(&self) -> DriverMetadata {
        self.metadata
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn read(&self, query: &TagQuery) -> Result<ReadResponse, ProtocolError> {
        self.state.reads.fetch_add(1, Ordering::SeqCst);
        Ok(ReadResponse {
            tag_name: query.tag_name.clone(),
            value: TagValue::Int(42),
            received_at_ms: 1,
        })
    }

    async fn subscribe(&self, query: &TagQuery) -> Result<SubscriptionStream, ProtocolError> {
        let (tx, rx) = mpsc::channel(8);
        let tag_name = query.tag_name.clone();
        tokio::spawn(async move {
            for value in 0..3 {
                let _ = tx
                    .send(ReadResponse {
                        tag_name: tag_name.clone(),
                        value: TagValue::Int(value),
                        received_at_ms: 1,
                    })
                    .await;
            }
        });
        Ok(rx)
    }

    async fn close(&self) -> Result<(), ProtocolError> {
        self.connected.store(false, Ordering::SeqCst);
        if self.state.fail_close.load(Ordering::SeqCst) {
            return Err(ProtocolError::Io(std::io::Error::other("close failed")));
        }
        Ok(())
    }
}

const READ_ONLY: DriverMetadata = DriverMetadata {
    can_read: true,
    can_subscribe: false,
};

fn target() -> ConnectionTarget {
    ConnectionTarget::new("plc.local", 102, "")
}

#[tokio::test]
async fn concurrent_connect_performs_one_handshake() {
    let driver = Arc::new(FakeDriver::new(READ_ONLY));
    let state = driver.state.clone();
    let connection = Arc::new(PlcConnection::new(driver, &target()).expect("connection"));

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let connection = connection.clone();
        tasks.push(tokio::spawn(async move { connection.connect().await }));
    }
    for task in tasks {
        task.await.expect("join").expect("connect");
    }

    assert_eq!(state.connects.load(Ordering::SeqCst), 1);
    assert!(connection.is_connected());

    connection.connect().await.expect("idempotent connect");
    assert_eq!(state.connects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn connect_failure_leaves_connection_retryable() {
    let driver = Arc::new(FakeDriver::new(READ_ONLY));
    let state = driver.state.clone();
    state.fail_connect.store(true, Ordering::SeqCst);
    let connection = PlcConnection::new(driver, &target()).expect("connection");

    let err = connection.connect().await.expect_err("refused");
    assert!(matches!(err, ProtocolError::Connection { .. }));
    assert!(!connection.is_connected());

    state.fail_connect.store(false, Ordering::SeqCst);
    connection.connect().await.expect("retry connects");
    assert!(connection.is_connected());
    assert_eq!(state.connects.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn read_without_capability_fails_before_io() {
    let driver = Arc::new(FakeDriver::new(DriverMetadata {
        can_read: false,
        can_subscribe: true,
    }));
    let state = driver.state.clone();
    let connection = PlcConnection::new(driver, &target()).expect("connection");

    let err = connection
        .read(TagQuery::new("tag", "addr"), |_| {})
        .await
        .expect_err("capability");
    assert!(err.is_capability());
    assert_eq!(err.to_string(), "connection type cannot read-blocking");
    assert_eq!(state.reads.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn subscribe_without_capability_fails() {
    let driver = Arc::new(FakeDriver::new(READ_ONLY));
    let connection = PlcConnection::new(driver, &target()).expect("connection");

    let err = connection
        .subscribe(TagQuery::new("tag", "addr"), |_| {})
        .await
        .err()
        .expect("capability");
    assert!(err.is_capability());
}

#[tokio::test]
async fn read_delivers_response_through_callback() {
    let driver = Arc::new(FakeDriver::new(READ_ONLY));
    let connection = PlcConnection::new(driver, &target()).expect("connection");

    let (tx, rx) = oneshot::channel();
    connection
        .read(TagQuery::new("speed", "addr"), move |result| {
            let _ = tx.send(result);
        })
        .await
        .expect("read submitted");
    let response = rx.await.expect("callback").expect("response");
    assert_eq!(response.tag_name, "speed");
    assert_eq!(response.value, TagValue::Int(42));

    let value = connection
        .read_value(&TagQuery::new("speed", "addr"))
        .await
        .expect("read value");
    assert_eq!(value.value, TagValue::Int(42));
}

#[tokio::test]
async fn subscribe_invokes_callback_for_every_push() {
    let driver = Arc::new(FakeDriver::new(DriverMetadata {
        can_read: false,
        can_subscribe: true,
    }));
    let connection = PlcConnection::new(driver, &target()).expect("connection");

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _subscription = connection
        .subscribe(TagQuery::new("counter", "addr"), move |result| {
            let _ = tx.send(result.map(|response| response.value));
        })
        .await
        .expect("subscribed");

    for expected in 0..3 {
        let value = rx.recv().await.expect("push").expect("value");
        assert_eq!(value, TagValue::Int(expected));
    }
}

#[tokio::test]
async fn closed_stream_is_reported_once_through_callback() {
    let driver = Arc::new(FakeDriver::new(DriverMetadata {
        can_read: false,
        can_subscribe: true,
    }));
    let connection = PlcConnection::new(driver, &target()).expect("connection");

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _subscription = connection
        .subscribe(TagQuery::new("counter", "addr"), move |result| {
            let _ = tx.send(result.map(|response| response.value));
        })
        .await
        .expect("subscribed");

    for _ in 0..3 {
        rx.recv().await.expect("push").expect("value");
    }
    let ended = rx.recv().await.expect("end of stream");
    assert!(matches!(ended, Err(ProtocolError::Subscription(_))));
    // 回调闭包随订阅任务结束被释放
    assert!(rx.recv().await.is_none());
}

#[tokio::test]
async fn disconnect_clears_handle_even_when_close_fails() {
    let driver = Arc::new(FakeDriver::new(READ_ONLY));
    let state = driver.state.clone();
    let connection = PlcConnection::new(driver, &target()).expect("connection");
    connection.connect().await.expect("connect");
    assert!(connection.is_connected());

    state.fail_close.store(true, Ordering::SeqCst);
    let result = connection.disconnect().await;
    assert!(result.is_err());
    assert!(!connection.is_connected());

    // 断开后再次读取会重新连接
    connection
        .read_value(&TagQuery::new("tag", "addr"))
        .await
        .expect("reconnected read");
    assert_eq!(state.connects.load(Ordering::SeqCst), 2);
}

#[test]
fn invalid_target_is_rejected() {
    let driver = Arc::new(FakeDriver::new(READ_ONLY));
    let result = PlcConnection::new(driver, &ConnectionTarget::new("", 102, ""));
    assert!(matches!(result, Err(ProtocolError::Config(_))));
}

#[test]
fn connection_string_uses_driver_protocol() {
    let driver = Arc::new(FakeDriver::new(READ_ONLY));
    let connection = PlcConnection::new(
        driver.clone(),
        &ConnectionTarget::new("plc.local", 102, "rack0/slot1"),
    )
    .expect("connection");
    assert_eq!(
        connection.connection_string(),
        "fake://plc.local:102/rack0/slot1"
    );

    let plain = PlcConnection::new(driver, &ConnectionTarget::new("plc.local", 102, ""))
        .expect("connection");
    assert_eq!(plain.connection_string(), "fake://plc.local:102");
}
