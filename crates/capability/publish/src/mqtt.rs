//! 基于 rumqttc 的消息总线。
//!
//! rumqttc 的 `publish` 只表示请求已进入客户端通道。这里在 eventloop 中跟踪
//! 连接状态与确认报文：QoS 0 在报文写出后视为完成，QoS 1 等待 PUBACK，
//! QoS 2 等待 PUBCOMP。broker 不可用时直接返回失败，不排队。

use crate::{MessageBus, PublishError, PublishMessage};
use async_trait::async_trait;
use domain::Qos;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, MqttOptions, Outgoing, Packet, QoS};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{Mutex, oneshot};
use tracing::{debug, info, warn};

/// MQTT 消息总线配置。
#[derive(Debug, Clone)]
pub struct MqttBusConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id_prefix: String,
    /// 客户端请求通道容量
    pub channel_capacity: usize,
    pub keep_alive_secs: u64,
    /// 等待 broker 确认的上限
    pub ack_timeout: Duration,
}

impl Default for MqttBusConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            username: None,
            password: None,
            client_id_prefix: "edge-gateway".to_string(),
            channel_capacity: 10,
            keep_alive_secs: 30,
            ack_timeout: Duration::from_secs(10),
        }
    }
}

type Delivery = Result<(), PublishError>;

struct Waiter {
    qos: Qos,
    tx: oneshot::Sender<Delivery>,
}

impl Waiter {
    fn resolve(self) {
        let _ = self.tx.send(Ok(()));
    }
}

/// 发布确认跟踪。
///
/// 请求通道是 FIFO，eventloop 按提交顺序写出报文，所以 `queued` 的队首总对应下一个
/// `Outgoing::Publish`。断线后 rumqttc 会重发未确认的报文，这些重发按 packet id 识别并忽略。
#[derive(Default)]
struct DeliveryTracker {
    connected: bool,
    /// 已提交、尚未写出
    queued: VecDeque<Waiter>,
    /// packet id 冲突，等待旧报文确认后写出
    collided: Option<(u16, Waiter)>,
    await_puback: HashMap<u16, VecDeque<Waiter>>,
    await_pubrec: HashMap<u16, VecDeque<Waiter>>,
    await_pubcomp: HashMap<u16, VecDeque<Waiter>>,
}

impl DeliveryTracker {
    /// 登记一次提交；broker 未连接时返回 None。
    fn enqueue(&mut self, qos: Qos) -> Option<oneshot::Receiver<Delivery>> {
        if !self.connected {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        self.queued.push_back(Waiter { qos, tx });
        Some(rx)
    }

    /// 撤销最近一次登记（请求未进入客户端通道）。
    fn discard_last(&mut self) {
        self.queued.pop_back();
    }

    fn on_disconnect(&mut self) {
        self.connected = false;
    }

    fn on_event(&mut self, event: &Event) {
        match event {
            Event::Incoming(Packet::ConnAck(ack)) => {
                self.connected = ack.code == ConnectReturnCode::Success;
            }
            Event::Incoming(Packet::PubAck(ack)) => {
                if let Some(waiter) = pop_front(&mut self.await_puback, ack.pkid) {
                    waiter.resolve();
                }
            }
            Event::Incoming(Packet::PubRec(rec)) => {
                if let Some(waiter) = pop_front(&mut self.await_pubrec, rec.pkid) {
                    self.await_pubcomp
                        .entry(rec.pkid)
                        .or_default()
                        .push_back(waiter);
                }
            }
            Event::Incoming(Packet::PubComp(comp)) => {
                if let Some(waiter) = pop_front(&mut self.await_pubcomp, comp.pkid) {
                    waiter.resolve();
                }
            }
            Event::Outgoing(Outgoing::AwaitAck(pkid)) => {
                if let Some(waiter) = self.queued.pop_front() {
                    self.collided = Some((*pkid, waiter));
                }
            }
            Event::Outgoing(Outgoing::Publish(pkid)) => self.on_publish_written(*pkid),
            _ => {}
        }
    }

    fn on_publish_written(&mut self, pkid: u16) {
        if pkid != 0 {
            if matches!(&self.collided, Some((collided, _)) if *collided == pkid) {
                if let Some((_, waiter)) = self.collided.take() {
                    self.track(pkid, waiter);
                }
                return;
            }
            // 重连后重发的未确认报文
            if self.await_puback.contains_key(&pkid) || self.await_pubrec.contains_key(&pkid) {
                return;
            }
        }
        if let Some(waiter) = self.queued.pop_front() {
            self.track(pkid, waiter);
        }
    }

    fn track(&mut self, pkid: u16, waiter: Waiter) {
        match waiter.qos {
            Qos::AtMostOnce => waiter.resolve(),
            Qos::AtLeastOnce => self.await_puback.entry(pkid).or_default().push_back(waiter),
            Qos::ExactlyOnce => self.await_pubrec.entry(pkid).or_default().push_back(waiter),
        }
    }
}

fn pop_front(map: &mut HashMap<u16, VecDeque<Waiter>>, pkid: u16) -> Option<Waiter> {
    let queue = map.get_mut(&pkid)?;
    let waiter = queue.pop_front();
    if queue.is_empty() {
        map.remove(&pkid);
    }
    waiter
}

/// 基于 rumqttc 的消息总线。
#[derive(Clone)]
pub struct MqttMessageBus {
    client: AsyncClient,
    tracker: Arc<StdMutex<DeliveryTracker>>,
    /// 保证登记顺序与请求通道顺序一致
    submit: Arc<Mutex<()>>,
    ack_timeout: Duration,
}

impl MqttMessageBus {
    /// 创建客户端并在后台驱动 eventloop；返回的句柄在进程退出前保持运行。
    pub fn connect(config: MqttBusConfig) -> (Self, tokio::task::JoinHandle<()>) {
        let client_id = format!("{}-{}", config.client_id_prefix, uuid::Uuid::new_v4());
        let mut options = MqttOptions::new(client_id, config.host, config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
        if let (Some(username), Some(password)) = (config.username, config.password) {
            options.set_credentials(username, password);
        }
        let (client, mut eventloop) = AsyncClient::new(options, config.channel_capacity.max(1));
        let tracker = Arc::new(StdMutex::new(DeliveryTracker::default()));

        let loop_tracker = tracker.clone();
        let handle = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(event) => {
                        if let Event::Incoming(Packet::ConnAck(ack)) = &event {
                            info!(target: "edge.publish", code = ?ack.code, "mqtt_connected");
                        }
                        lock(&loop_tracker).on_event(&event);
                    }
                    Err(err) => {
                        lock(&loop_tracker).on_disconnect();
                        warn!(target: "edge.publish", error = %err, "mqtt_eventloop_error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });
        (
            Self {
                client,
                tracker,
                submit: Arc::new(Mutex::new(())),
                ack_timeout: config.ack_timeout,
            },
            handle,
        )
    }

    /// 最近一次 CONNACK 成功且之后未断线。
    pub fn is_connected(&self) -> bool {
        lock(&self.tracker).connected
    }
}

fn lock(tracker: &StdMutex<DeliveryTracker>) -> std::sync::MutexGuard<'_, DeliveryTracker> {
    tracker
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl MessageBus for MqttMessageBus {
    async fn publish(&self, message: PublishMessage) -> Result<(), PublishError> {
        debug!(
            target: "edge.publish",
            topic = %message.topic,
            payload_size = message.payload.len(),
            "mqtt_publish"
        );
        let delivery = {
            let _order = self.submit.lock().await;
            let delivery = lock(&self.tracker)
                .enqueue(message.qos)
                .ok_or_else(|| PublishError::Bus("broker unavailable".to_string()))?;
            if let Err(err) = self
                .client
                .publish(message.topic, to_mqtt_qos(message.qos), false, message.payload)
                .await
            {
                lock(&self.tracker).discard_last();
                return Err(PublishError::Bus(err.to_string()));
            }
            delivery
        };

        match tokio::time::timeout(self.ack_timeout, delivery).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(PublishError::Bus("delivery tracking closed".to_string())),
            Err(_) => Err(PublishError::Bus(format!(
                "no acknowledgement within {} ms",
                self.ack_timeout.as_millis()
            ))),
        }
    }
}

fn to_mqtt_qos(qos: Qos) -> QoS {
    match qos {
        Qos::AtMostOnce => QoS::AtMostOnce,
        Qos::AtLeastOnce => QoS::AtLeastOnce,
        Qos::ExactlyOnce => QoS::ExactlyOnce,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::{ConnAck, PubAck, PubComp, PubRec};
    use tokio::sync::oneshot::error::TryRecvError;

    fn connected() -> DeliveryTracker {
        let mut tracker = DeliveryTracker::default();
        tracker.on_event(&Event::Incoming(Packet::ConnAck(ConnAck::new(
            ConnectReturnCode::Success,
            false,
        ))));
        tracker
    }

    fn written(pkid: u16) -> Event {
        Event::Outgoing(Outgoing::Publish(pkid))
    }

    #[test]
    fn qos_maps_one_to_one() {
        assert_eq!(to_mqtt_qos(Qos::AtMostOnce), QoS::AtMostOnce);
        assert_eq!(to_mqtt_qos(Qos::AtLeastOnce), QoS::AtLeastOnce);
        assert_eq!(to_mqtt_qos(Qos::ExactlyOnce), QoS::ExactlyOnce);
    }

    #[test]
    fn nothing_is_queued_before_connack() {
        let mut tracker = DeliveryTracker::default();
        assert!(tracker.enqueue(Qos::AtMostOnce).is_none());

        tracker.on_event(&Event::Incoming(Packet::ConnAck(ConnAck::new(
            ConnectReturnCode::NotAuthorized,
            false,
        ))));
        assert!(tracker.enqueue(Qos::AtMostOnce).is_none());
    }

    #[test]
    fn disconnect_refuses_new_publishes() {
        let mut tracker = connected();
        assert!(tracker.enqueue(Qos::AtMostOnce).is_some());
        tracker.on_disconnect();
        assert!(tracker.enqueue(Qos::AtMostOnce).is_none());
    }

    #[test]
    fn qos0_completes_when_written() {
        let mut tracker = connected();
        let mut rx = tracker.enqueue(Qos::AtMostOnce).unwrap();
        assert_eq!(rx.try_recv().unwrap_err(), TryRecvError::Empty);

        tracker.on_event(&written(0));
        assert!(rx.try_recv().unwrap().is_ok());
    }

    #[test]
    fn qos1_completes_on_puback() {
        let mut tracker = connected();
        let mut rx = tracker.enqueue(Qos::AtLeastOnce).unwrap();
        tracker.on_event(&written(1));
        assert_eq!(rx.try_recv().unwrap_err(), TryRecvError::Empty);

        tracker.on_event(&Event::Incoming(Packet::PubAck(PubAck::new(1))));
        assert!(rx.try_recv().unwrap().is_ok());
    }

    #[test]
    fn qos2_completes_on_pubcomp_only() {
        let mut tracker = connected();
        let mut rx = tracker.enqueue(Qos::ExactlyOnce).unwrap();
        tracker.on_event(&written(3));
        tracker.on_event(&Event::Incoming(Packet::PubRec(PubRec::new(3))));
        assert_eq!(rx.try_recv().unwrap_err(), TryRecvError::Empty);

        tracker.on_event(&Event::Incoming(Packet::PubComp(PubComp::new(3))));
        assert!(rx.try_recv().unwrap().is_ok());
    }

    #[test]
    fn resent_packet_after_reconnect_keeps_waiting_for_ack() {
        let mut tracker = connected();
        let mut first = tracker.enqueue(Qos::AtLeastOnce).unwrap();
        tracker.on_event(&written(1));
        let mut second = tracker.enqueue(Qos::AtMostOnce).unwrap();

        tracker.on_disconnect();
        tracker.on_event(&Event::Incoming(Packet::ConnAck(ConnAck::new(
            ConnectReturnCode::Success,
            false,
        ))));
        // 重发 pkid 1，然后写出通道中积压的 QoS 0
        tracker.on_event(&written(1));
        assert_eq!(first.try_recv().unwrap_err(), TryRecvError::Empty);
        tracker.on_event(&written(0));
        assert!(second.try_recv().unwrap().is_ok());

        tracker.on_event(&Event::Incoming(Packet::PubAck(PubAck::new(1))));
        assert!(first.try_recv().unwrap().is_ok());
    }

    #[test]
    fn collided_packet_waits_for_its_own_ack() {
        let mut tracker = connected();
        let mut old = tracker.enqueue(Qos::AtLeastOnce).unwrap();
        tracker.on_event(&written(5));
        let mut new = tracker.enqueue(Qos::AtLeastOnce).unwrap();
        tracker.on_event(&Event::Outgoing(Outgoing::AwaitAck(5)));

        // rumqttc 先写出冲突报文，再上报旧报文的 PUBACK
        tracker.on_event(&written(5));
        tracker.on_event(&Event::Incoming(Packet::PubAck(PubAck::new(5))));
        assert!(old.try_recv().unwrap().is_ok());
        assert_eq!(new.try_recv().unwrap_err(), TryRecvError::Empty);

        tracker.on_event(&Event::Incoming(Packet::PubAck(PubAck::new(5))));
        assert!(new.try_recv().unwrap().is_ok());
    }
}
