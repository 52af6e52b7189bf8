//! MQTT 5 binding of the queue contract.
//!
//! A queue is the topic `<prefix>/<queue>` plus one persistent session that holds it. The
//! session belongs to the client id `<base>-listener-<queue>`, never expires on its own and is
//! subscribed to the topic at QoS 1. Declaring a queue creates or resumes that session, so the
//! broker stores messages from the first publish on, whether or not a listener is attached.
//! The listener connects with the same client id, advertises its prefetch as the receive
//! maximum and acknowledges manually. Anything it took but never PUBACKed is redelivered when
//! the session resumes.

use super::{
    validate_queue_name, BrokerError, Delivery, DeliveryTag, QueueConsumer, QueuePublisher,
};
use crate::config::Config;
use bytes::Bytes;
use rumqttc::v5::mqttbytes::v5::{
    ConnectReturnCode, DisconnectReasonCode, Packet, Publish, SubAck, SubscribeReasonCode,
};
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, StateError};
use rumqttc::Outgoing;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::task::JoinHandle;

const REQUEST_CAPACITY: usize = 32;
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);
/// How long a listener whose session was taken over waits before resuming it.
const RESUME_DELAY: Duration = Duration::from_secs(1);
const MAX_SESSION_RESUMES: u32 = 5;

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub topic_prefix: String,
    pub keepalive: Duration,
    pub connect_timeout: Duration,
    pub client_id: String,
    /// Base of the per-queue session ids.
    pub session_base: String,
    pub session_expiry_secs: u32,
}

impl MqttSettings {
    pub fn from_config(config: &Config, client_id: String) -> Self {
        Self {
            host: config.mqtt_host.clone(),
            port: config.mqtt_port,
            username: config.mqtt_username.clone(),
            password: config.mqtt_password.clone(),
            topic_prefix: config.mqtt_topic_prefix.clone(),
            keepalive: config.mqtt_keepalive(),
            connect_timeout: config.mqtt_connect_timeout(),
            client_id,
            session_base: config.mqtt_client_id.clone(),
            session_expiry_secs: config.mqtt_session_expiry_secs,
        }
    }

    fn options(&self, client_id: String) -> MqttOptions {
        let mut mqttoptions = MqttOptions::new(client_id, self.host.clone(), self.port);
        mqttoptions.set_keep_alive(self.keepalive);
        mqttoptions.set_connection_timeout(self.connect_timeout.as_secs().max(1));
        if let Some(username) = &self.username {
            mqttoptions.set_credentials(username.clone(), self.password.clone().unwrap_or_default());
        }
        mqttoptions
    }

    /// Options for the session that holds `queue`.
    fn queue_session_options(&self, queue: &str, receive_maximum: u16) -> MqttOptions {
        let mut mqttoptions = self.options(queue_session_id(&self.session_base, queue));
        mqttoptions
            .set_clean_start(false)
            .set_session_expiry_interval(Some(self.session_expiry_secs))
            .set_receive_maximum(Some(receive_maximum.max(1)))
            .set_manual_acks(true);
        mqttoptions
    }
}

pub fn queue_topic(prefix: &str, queue: &str) -> String {
    let prefix = prefix.trim().trim_end_matches('/');
    if prefix.is_empty() {
        queue.to_string()
    } else {
        format!("{prefix}/{queue}")
    }
}

/// Client id of the persistent session that stores `queue`.
pub fn queue_session_id(base: &str, queue: &str) -> String {
    format!("{base}-listener-{queue}")
}

fn connect_error(host: &str, err: impl std::fmt::Display) -> BrokerError {
    BrokerError::Connect {
        host: host.to_string(),
        reason: err.to_string(),
    }
}

/// Drives the event loop until the broker accepts the connection.
async fn await_connack(
    eventloop: &mut EventLoop,
    host: &str,
    timeout: Duration,
) -> Result<bool, BrokerError> {
    let wait = async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code == ConnectReturnCode::Success {
                        return Ok(ack.session_present);
                    }
                    return Err(connect_error(host, format!("{:?}", ack.code)));
                }
                Ok(_) => {}
                Err(err) => return Err(connect_error(host, err)),
            }
        }
    };
    match tokio::time::timeout(timeout, wait).await {
        Ok(result) => result,
        Err(_) => Err(connect_error(
            host,
            format!("no CONNACK within {}s", timeout.as_secs_f64()),
        )),
    }
}

/// Polls until the SUBACK arrives. Publishes that arrive meanwhile stay unacknowledged.
async fn await_suback(
    eventloop: &mut EventLoop,
    topic: &str,
    timeout: Duration,
) -> Result<(), BrokerError> {
    let wait = async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::SubAck(suback))) => return check_suback(topic, &suback),
                Ok(_) => {}
                Err(err) => return Err(BrokerError::Disconnected(err.to_string())),
            }
        }
    };
    tokio::time::timeout(timeout, wait)
        .await
        .unwrap_or_else(|_| Err(BrokerError::SubscriptionRejected(topic.to_string())))
}

fn check_suback(topic: &str, suback: &SubAck) -> Result<(), BrokerError> {
    if suback
        .return_codes
        .iter()
        .all(|code| matches!(code, SubscribeReasonCode::Success(_)))
    {
        Ok(())
    } else {
        Err(BrokerError::SubscriptionRejected(topic.to_string()))
    }
}

/// Another connection with the queue's client id took the session, usually a producer
/// declaring the queue while this listener was attached.
fn is_session_takeover(err: &ConnectionError) -> bool {
    matches!(
        err,
        ConnectionError::MqttState(StateError::ServerDisconnect {
            reason_code: DisconnectReasonCode::SessionTakenOver,
            ..
        })
    )
}

/// Sends DISCONNECT after everything already queued on the client and waits for it to leave.
async fn drain_and_disconnect(client: &AsyncClient, eventloop: &mut EventLoop) -> Result<(), BrokerError> {
    client.disconnect().await?;
    let drain = async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) => return Ok(()),
                Ok(_) => {}
                Err(err) => return Err(BrokerError::Disconnected(err.to_string())),
            }
        }
    };
    tokio::time::timeout(CLOSE_TIMEOUT, drain)
        .await
        .unwrap_or_else(|_| Err(BrokerError::Disconnected("timed out draining on close".into())))
}

/// Creates the queue's session on the broker, or resumes it when it already exists, and makes
/// sure it is subscribed at QoS 1. Returns whether the session existed before.
///
/// Messages the broker hands over while we hold the session are never acknowledged here, so
/// they stay queued for the listener.
pub async fn establish_queue_session(
    settings: &MqttSettings,
    queue: &str,
) -> Result<bool, BrokerError> {
    validate_queue_name(queue)?;
    let (client, mut eventloop) =
        AsyncClient::new(settings.queue_session_options(queue, 1), REQUEST_CAPACITY);
    let session_present =
        await_connack(&mut eventloop, &settings.host, settings.connect_timeout).await?;

    let topic = queue_topic(&settings.topic_prefix, queue);
    client.subscribe(topic.clone(), QoS::AtLeastOnce).await?;
    await_suback(&mut eventloop, &topic, settings.connect_timeout).await?;
    drain_and_disconnect(&client, &mut eventloop).await?;

    tracing::info!(topic = %topic, session_present, "declared durable queue");
    Ok(session_present)
}

pub struct MqttPublisher {
    client: AsyncClient,
    settings: MqttSettings,
    declared: HashSet<String>,
    poller: JoinHandle<Result<(), ConnectionError>>,
}

impl MqttPublisher {
    pub async fn connect(settings: &MqttSettings) -> Result<Self, BrokerError> {
        let (client, mut eventloop) =
            AsyncClient::new(settings.options(settings.client_id.clone()), REQUEST_CAPACITY);
        await_connack(&mut eventloop, &settings.host, settings.connect_timeout).await?;
        tracing::info!(host = %settings.host, port = settings.port, "producer connected to MQTT");

        let poller = tokio::spawn(async move {
            loop {
                if let Event::Outgoing(Outgoing::Disconnect) = eventloop.poll().await? {
                    return Ok(());
                }
            }
        });

        Ok(Self {
            client,
            settings: settings.clone(),
            declared: HashSet::new(),
            poller,
        })
    }
}

impl QueuePublisher for MqttPublisher {
    async fn declare_queue(&mut self, queue: &str) -> Result<(), BrokerError> {
        validate_queue_name(queue)?;
        if self.declared.contains(queue) {
            return Ok(());
        }
        establish_queue_session(&self.settings, queue).await?;
        self.declared.insert(queue.to_string());
        Ok(())
    }

    async fn publish(&mut self, queue: &str, body: Bytes) -> Result<(), BrokerError> {
        if !self.declared.contains(queue) {
            return Err(BrokerError::UndeclaredQueue(queue.to_string()));
        }
        if self.poller.is_finished() {
            return Err(BrokerError::Disconnected(format!(
                "event loop for host={} stopped",
                self.settings.host
            )));
        }
        let topic = queue_topic(&self.settings.topic_prefix, queue);
        self.client
            .publish_bytes(topic, QoS::AtLeastOnce, false, body)
            .await?;
        Ok(())
    }

    async fn close(self) -> Result<(), BrokerError> {
        if self.poller.is_finished() {
            return match self.poller.await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => Err(BrokerError::Disconnected(err.to_string())),
                Err(err) => Err(BrokerError::Disconnected(err.to_string())),
            };
        }
        self.client.disconnect().await?;
        match tokio::time::timeout(CLOSE_TIMEOUT, self.poller).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(err))) => Err(BrokerError::Disconnected(err.to_string())),
            Ok(Err(err)) => Err(BrokerError::Disconnected(err.to_string())),
            Err(_) => Err(BrokerError::Disconnected("timed out draining on close".into())),
        }
    }
}

/// What to do with a publish the event loop handed us.
#[derive(Debug)]
enum Inbound {
    Deliver(Delivery),
    /// Not our queue's topic; acknowledge and drop it.
    Foreign(Publish),
}

/// Delivery tags and the publishes they still owe a PUBACK for.
#[derive(Debug)]
struct InFlight {
    topic: String,
    prefetch: u16,
    next_tag: DeliveryTag,
    pending: HashMap<DeliveryTag, Publish>,
}

impl InFlight {
    fn new(topic: String, prefetch: u16) -> Self {
        Self {
            topic,
            prefetch: prefetch.max(1),
            next_tag: 0,
            pending: HashMap::new(),
        }
    }

    fn ensure_capacity(&self) -> Result<(), BrokerError> {
        if self.pending.len() >= usize::from(self.prefetch) {
            return Err(BrokerError::PrefetchExhausted(self.prefetch));
        }
        Ok(())
    }

    fn accept(&mut self, publish: Publish) -> Inbound {
        if publish.topic.as_ref() != self.topic.as_bytes() {
            return Inbound::Foreign(publish);
        }
        self.next_tag += 1;
        let delivery = Delivery {
            tag: self.next_tag,
            body: publish.payload.clone(),
            redelivered: publish.dup,
        };
        self.pending.insert(delivery.tag, publish);
        Inbound::Deliver(delivery)
    }

    fn settle(&mut self, tag: DeliveryTag) -> Result<Publish, BrokerError> {
        self.pending
            .remove(&tag)
            .ok_or(BrokerError::UnknownDeliveryTag(tag))
    }

    /// Forgets everything unacknowledged; the broker redelivers it on the resumed session.
    fn reset(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }

    fn len(&self) -> usize {
        self.pending.len()
    }
}

pub struct MqttConsumer {
    client: AsyncClient,
    eventloop: EventLoop,
    in_flight: InFlight,
}

impl MqttConsumer {
    /// Attaches to the queue's persistent session. The broker sends at most `prefetch`
    /// unacknowledged messages at a time.
    pub async fn connect(
        settings: &MqttSettings,
        queue: &str,
        prefetch: u16,
    ) -> Result<Self, BrokerError> {
        validate_queue_name(queue)?;
        let (client, mut eventloop) =
            AsyncClient::new(settings.queue_session_options(queue, prefetch), REQUEST_CAPACITY);
        let session_present =
            await_connack(&mut eventloop, &settings.host, settings.connect_timeout).await?;

        let topic = queue_topic(&settings.topic_prefix, queue);
        client.subscribe(topic.clone(), QoS::AtLeastOnce).await?;
        tracing::info!(
            host = %settings.host,
            topic = %topic,
            session_present,
            prefetch,
            "listener connected to MQTT"
        );

        Ok(Self {
            client,
            eventloop,
            in_flight: InFlight::new(topic, prefetch),
        })
    }
}

impl QueueConsumer for MqttConsumer {
    async fn next_delivery(&mut self) -> Result<Delivery, BrokerError> {
        self.in_flight.ensure_capacity()?;
        let mut resumes = 0;
        loop {
            let event = match self.eventloop.poll().await {
                Ok(event) => event,
                Err(err) if is_session_takeover(&err) && resumes < MAX_SESSION_RESUMES => {
                    resumes += 1;
                    let dropped = self.in_flight.reset();
                    tracing::warn!(
                        topic = %self.in_flight.topic,
                        attempt = resumes,
                        unacked = dropped,
                        "session taken over; resuming"
                    );
                    tokio::time::sleep(RESUME_DELAY).await;
                    continue;
                }
                Err(err) => return Err(BrokerError::Disconnected(err.to_string())),
            };
            match event {
                Event::Incoming(Packet::Publish(publish)) => match self.in_flight.accept(publish) {
                    Inbound::Deliver(delivery) => return Ok(delivery),
                    Inbound::Foreign(publish) => {
                        tracing::warn!(
                            topic = %String::from_utf8_lossy(&publish.topic),
                            "ignoring message for foreign topic"
                        );
                        self.client.ack(&publish).await?;
                    }
                },
                Event::Incoming(Packet::SubAck(suback)) => {
                    check_suback(&self.in_flight.topic, &suback)?;
                }
                _ => {}
            }
        }
    }

    async fn ack(&mut self, tag: DeliveryTag) -> Result<(), BrokerError> {
        let publish = self.in_flight.settle(tag)?;
        // The PUBACK goes out on the next event loop poll.
        self.client.ack(&publish).await?;
        Ok(())
    }

    fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    async fn close(mut self) -> Result<(), BrokerError> {
        if self.in_flight.len() > 0 {
            tracing::info!(
                unacked = self.in_flight.len(),
                "closing with unacknowledged deliveries; broker will redeliver"
            );
        }
        drain_and_disconnect(&self.client, &mut self.eventloop).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(host: &str, port: u16) -> MqttSettings {
        MqttSettings {
            host: host.to_string(),
            port,
            username: None,
            password: None,
            topic_prefix: "smoker".to_string(),
            keepalive: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            client_id: "smoker-test".to_string(),
            session_base: "smoker-test".to_string(),
            session_expiry_secs: u32::MAX,
        }
    }

    fn publish(topic: &str, body: &'static str) -> Publish {
        Publish::new(topic, QoS::AtLeastOnce, Bytes::from_static(body.as_bytes()), None)
    }

    #[test]
    fn queue_topic_applies_prefix() {
        assert_eq!(queue_topic("smoker", "temp1"), "smoker/temp1");
        assert_eq!(queue_topic("smoker/", "temp1"), "smoker/temp1");
        assert_eq!(queue_topic("", "temp3"), "temp3");
    }

    #[test]
    fn producer_and_listener_share_the_queue_session() {
        let settings = settings("localhost", 1883);
        let options = settings.queue_session_options("temp2", 1);
        assert_eq!(options.client_id(), "smoker-test-listener-temp2");
        assert!(!options.clean_start());
        assert!(options.manual_acks());
        assert_eq!(options.session_expiry_interval(), Some(u32::MAX));
        assert_eq!(options.receive_maximum(), Some(1));
    }

    #[test]
    fn prefetch_becomes_the_receive_maximum() {
        let options = settings("localhost", 1883).queue_session_options("temp1", 4);
        assert_eq!(options.receive_maximum(), Some(4));
        let options = settings("localhost", 1883).queue_session_options("temp1", 0);
        assert_eq!(options.receive_maximum(), Some(1));
    }

    #[test]
    fn in_flight_tags_deliveries_and_enforces_prefetch() {
        let mut in_flight = InFlight::new("smoker/temp1".to_string(), 1);
        assert!(in_flight.ensure_capacity().is_ok());

        let delivery = match in_flight.accept(publish("smoker/temp1", "t1,225.0")) {
            Inbound::Deliver(delivery) => delivery,
            other => panic!("expected a delivery, got {other:?}"),
        };
        assert_eq!(delivery.tag, 1);
        assert_eq!(delivery.body, "t1,225.0");
        assert!(!delivery.redelivered);
        assert_eq!(in_flight.len(), 1);
        assert!(matches!(
            in_flight.ensure_capacity(),
            Err(BrokerError::PrefetchExhausted(1))
        ));

        let settled = in_flight.settle(1).unwrap();
        assert_eq!(settled.payload, "t1,225.0");
        assert!(in_flight.ensure_capacity().is_ok());
        assert!(matches!(
            in_flight.settle(1),
            Err(BrokerError::UnknownDeliveryTag(1))
        ));
    }

    #[test]
    fn foreign_topics_are_not_delivered() {
        let mut in_flight = InFlight::new("smoker/temp1".to_string(), 1);
        assert!(matches!(
            in_flight.accept(publish("smoker/temp2", "t1,70.0")),
            Inbound::Foreign(_)
        ));
        assert_eq!(in_flight.len(), 0);
    }

    #[test]
    fn duplicate_flag_marks_a_redelivery() {
        let mut in_flight = InFlight::new("smoker/temp3".to_string(), 1);
        let mut redelivered = publish("smoker/temp3", "t1,70.0");
        redelivered.dup = true;
        match in_flight.accept(redelivered) {
            Inbound::Deliver(delivery) => assert!(delivery.redelivered),
            other => panic!("expected a delivery, got {other:?}"),
        }
        assert_eq!(in_flight.reset(), 1);
        assert_eq!(in_flight.len(), 0);
    }

    #[test]
    fn rejected_subscription_is_reported() {
        let accepted = SubAck {
            pkid: 1,
            return_codes: vec![SubscribeReasonCode::Success(QoS::AtLeastOnce)],
            properties: None,
        };
        assert!(check_suback("smoker/temp1", &accepted).is_ok());

        let rejected = SubAck {
            pkid: 2,
            return_codes: vec![SubscribeReasonCode::NotAuthorized],
            properties: None,
        };
        let err = check_suback("smoker/temp1", &rejected).unwrap_err();
        assert!(matches!(err, BrokerError::SubscriptionRejected(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn only_session_takeover_is_resumable() {
        let takeover = ConnectionError::MqttState(StateError::ServerDisconnect {
            reason_code: DisconnectReasonCode::SessionTakenOver,
            reason_string: None,
        });
        assert!(is_session_takeover(&takeover));

        let shutdown = ConnectionError::MqttState(StateError::ServerDisconnect {
            reason_code: DisconnectReasonCode::ServerShuttingDown,
            reason_string: None,
        });
        assert!(!is_session_takeover(&shutdown));
        assert!(!is_session_takeover(&ConnectionError::RequestsDone));
    }

    #[tokio::test]
    async fn connect_failure_reports_the_host() {
        // Nothing listens on port 1 of the loopback interface.
        let err = MqttPublisher::connect(&settings("127.0.0.1", 1))
            .await
            .err()
            .expect("connect must fail");
        assert!(err.is_fatal());
        assert!(err.to_string().contains("host=127.0.0.1"));
    }

    #[tokio::test]
    #[ignore = "needs an MQTT 5 broker at SMOKER_TEST_MQTT_HOST (default localhost:1883)"]
    async fn message_published_before_any_listener_is_delivered() {
        let host = std::env::var("SMOKER_TEST_MQTT_HOST").unwrap_or_else(|_| "localhost".into());
        let mut settings = settings(&host, 1883);
        settings.session_base = format!("smoker-test-{}", std::process::id());
        settings.client_id = format!("{}-producer", settings.session_base);
        let queue = "early";

        let mut publisher = MqttPublisher::connect(&settings).await.unwrap();
        publisher.declare_queue(queue).await.unwrap();
        publisher
            .publish(queue, Bytes::from_static(b"t1,225.0"))
            .await
            .unwrap();
        publisher.close().await.unwrap();

        let mut consumer = MqttConsumer::connect(&settings, queue, 1).await.unwrap();
        let delivery = tokio::time::timeout(Duration::from_secs(10), consumer.next_delivery())
            .await
            .expect("queued message arrives")
            .unwrap();
        assert_eq!(delivery.body, "t1,225.0");
        consumer.ack(delivery.tag).await.unwrap();
        consumer.close().await.unwrap();

        // Drop the session so repeated runs start clean.
        let mut cleanup = settings.queue_session_options(queue, 1);
        cleanup.set_clean_start(true).set_session_expiry_interval(None);
        let (client, mut eventloop) = AsyncClient::new(cleanup, REQUEST_CAPACITY);
        await_connack(&mut eventloop, &settings.host, settings.connect_timeout)
            .await
            .unwrap();
        drain_and_disconnect(&client, &mut eventloop).await.unwrap();
    }
}
