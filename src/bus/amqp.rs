// intercom-signaling-service/src/bus/amqp.rs

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::options::*;
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use parking_lot::RwLock;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bus::backoff::Backoff;
use crate::bus::{BusMessage, MessageBus, QoS, Subscription, SUBSCRIPTION_BUFFER};
use crate::error::BusError;

const RETAINED_HEADER: &str = "x-retained";
const CHANNEL_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// `devices/+/status` -> `devices.*.status`
pub fn to_routing_key(topic: &str) -> String {
    topic
        .split('/')
        .map(|level| if level == "+" { "*" } else { level })
        .collect::<Vec<_>>()
        .join(".")
}

pub fn from_routing_key(key: &str) -> String {
    key.replace('.', "/")
}

#[derive(Clone)]
struct SubscriptionSpec {
    filter: String,
    qos: QoS,
    sender: mpsc::Sender<BusMessage>,
}

/// RabbitMQ topic-exchange adapter.
///
/// A supervisor task owns the connection: it reconnects with capped
/// exponential backoff and re-binds every registered subscription each time
/// the link comes back. While it is down `publish` returns `NotConnected`.
pub struct AmqpBus {
    url: String,
    exchange: String,
    channel: RwLock<Option<Channel>>,
    subscriptions: Mutex<Vec<SubscriptionSpec>>,
}

impl AmqpBus {
    pub fn start(
        url: &str,
        exchange: &str,
        reconnect_min: Duration,
        reconnect_max: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        let bus = Arc::new(Self {
            url: url.to_string(),
            exchange: exchange.to_string(),
            channel: RwLock::new(None),
            subscriptions: Mutex::new(Vec::new()),
        });
        let supervisor = Arc::clone(&bus);
        tokio::spawn(async move {
            supervisor
                .supervise(Backoff::new(reconnect_min, reconnect_max), shutdown)
                .await;
        });
        bus
    }

    async fn supervise(self: Arc<Self>, mut backoff: Backoff, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.connect().await {
                Ok((conn, mut lost)) => {
                    backoff.reset();
                    info!(event = "BUS_CONNECTED", exchange = %self.exchange, "📡 Message bus connected");

                    let stop = tokio::select! {
                        _ = lost.recv() => false,
                        _ = self.channel_closed() => false,
                        _ = shutdown.changed() => true,
                    };
                    *self.channel.write() = None;
                    if let Err(e) = conn.close(200, "shutdown").await {
                        debug!(error = %e, "Bus close returned error");
                    }

                    if stop {
                        break;
                    }
                    warn!(event = "BUS_DISCONNECTED", "Message bus connection lost");
                }
                Err(e) => {
                    warn!(event = "BUS_CONNECT_FAILED", error = %e, "Message bus connection failed");
                }
            }

            let delay = backoff.next_delay();
            info!(event = "BUS_RECONNECT_SCHEDULED", delay_ms = delay.as_millis() as u64, "Reconnecting to message bus");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
        }
        info!(event = "BUS_STOPPED", "Message bus supervisor stopped");
    }

    /// Resolves once the broker has closed the channel while the connection
    /// itself may still be up.
    async fn channel_closed(&self) {
        let mut tick = tokio::time::interval(CHANNEL_CHECK_INTERVAL);
        loop {
            tick.tick().await;
            let alive = self
                .channel
                .read()
                .as_ref()
                .map(|channel| channel.status().connected())
                .unwrap_or(false);
            if !alive {
                warn!(event = "BUS_CHANNEL_CLOSED", "AMQP channel closed by broker");
                return;
            }
        }
    }

    async fn connect(&self) -> Result<(Connection, mpsc::Receiver<()>), lapin::Error> {
        let conn = Connection::connect(&self.url, ConnectionProperties::default()).await?;
        let (lost_tx, lost_rx) = mpsc::channel(1);
        conn.on_error(move |err| {
            error!(error = %err, "AMQP connection error");
            let _ = lost_tx.try_send(());
        });

        let channel = conn.create_channel().await?;
        channel.confirm_select(ConfirmSelectOptions::default()).await?;
        channel
            .exchange_declare(
                &self.exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        // Held across the rebinding so a concurrent subscribe cannot slip
        // between the snapshot and the channel becoming visible.
        let mut subscriptions = self.subscriptions.lock().await;
        subscriptions.retain(|spec| !spec.sender.is_closed());
        for spec in subscriptions.iter() {
            self.bind_consumer(&channel, spec.clone()).await?;
        }
        *self.channel.write() = Some(channel);
        drop(subscriptions);

        Ok((conn, lost_rx))
    }

    async fn bind_consumer(&self, channel: &Channel, spec: SubscriptionSpec) -> Result<(), lapin::Error> {
        let queue = channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        let routing_key = to_routing_key(&spec.filter);
        channel
            .queue_bind(
                queue.name().as_str(),
                &self.exchange,
                &routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;

        let no_ack = spec.qos == QoS::AtMostOnce;
        let consumer_tag = format!("intercom-{}", Uuid::new_v4().simple());
        let mut consumer = channel
            .basic_consume(
                queue.name().as_str(),
                &consumer_tag,
                BasicConsumeOptions {
                    no_ack,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        debug!(filter = %spec.filter, routing_key = %routing_key, "Subscription bound");

        tokio::spawn(async move {
            while let Some(delivery) = consumer.next().await {
                let delivery = match delivery {
                    Ok(d) => d,
                    Err(e) => {
                        warn!(filter = %spec.filter, error = %e, "Consumer stream ended");
                        break;
                    }
                };
                let message = BusMessage {
                    topic: from_routing_key(delivery.routing_key.as_str()),
                    payload: delivery.data.clone(),
                    retained: is_retained(&delivery.properties),
                };
                if spec.sender.send(message).await.is_err() {
                    break;
                }
                if !no_ack {
                    if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                        warn!(error = %e, "Delivery ack failed");
                    }
                }
            }
        });
        Ok(())
    }
}

fn is_retained(properties: &BasicProperties) -> bool {
    properties
        .headers()
        .as_ref()
        .map(|headers| {
            headers
                .inner()
                .iter()
                .any(|(key, value)| key.as_str() == RETAINED_HEADER && matches!(value, AMQPValue::Boolean(true)))
        })
        .unwrap_or(false)
}

fn check_confirmation(topic: &str, confirmation: &Confirmation) -> Result<(), BusError> {
    if confirmation.is_nack() {
        return Err(BusError::PublishFailed(format!("broker nacked message on {}", topic)));
    }
    Ok(())
}

#[async_trait]
impl MessageBus for AmqpBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS, retained: bool) -> Result<(), BusError> {
        let channel = self.channel.read().clone().ok_or(BusError::NotConnected)?;
        if !channel.status().connected() {
            return Err(BusError::NotConnected);
        }

        let delivery_mode = match qos {
            QoS::AtMostOnce => 1,
            QoS::AtLeastOnce => 2,
        };
        let mut properties = BasicProperties::default()
            .with_delivery_mode(delivery_mode)
            .with_content_type("application/json".into());
        if retained {
            let mut headers = FieldTable::default();
            headers.insert(RETAINED_HEADER.into(), AMQPValue::Boolean(true));
            properties = properties.with_headers(headers);
        }

        let confirm = channel
            .basic_publish(
                &self.exchange,
                &to_routing_key(topic),
                BasicPublishOptions::default(),
                &payload,
                properties,
            )
            .await
            .map_err(|e| BusError::PublishFailed(e.to_string()))?;
        if qos == QoS::AtLeastOnce {
            let confirmation = confirm.await.map_err(|e| BusError::PublishFailed(e.to_string()))?;
            check_confirmation(topic, &confirmation)?;
        }

        debug!(topic = %topic, bytes = payload.len(), "Message published");
        Ok(())
    }

    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<Subscription, BusError> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let spec = SubscriptionSpec {
            filter: filter.to_string(),
            qos,
            sender: tx,
        };

        let mut subscriptions = self.subscriptions.lock().await;
        let channel = self.channel.read().clone();
        if let Some(channel) = channel {
            self.bind_consumer(&channel, spec.clone())
                .await
                .map_err(|e| BusError::SubscribeFailed(e.to_string()))?;
        }
        // Bound on the next reconnect when the link is down.
        subscriptions.push(spec);

        Ok(Subscription::new(filter, rx))
    }

    fn is_connected(&self) -> bool {
        self.channel
            .read()
            .as_ref()
            .map(|channel| channel.status().connected())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_keys_follow_topic_levels() {
        assert_eq!(to_routing_key("users/res2/calls/incoming"), "users.res2.calls.incoming");
        assert_eq!(to_routing_key("devices/+/status"), "devices.*.status");
        assert_eq!(to_routing_key("system/#"), "system.#");
        assert_eq!(from_routing_key("calls.request.dev1"), "calls/request/dev1");
    }

    #[test]
    fn retained_header_detection() {
        let mut headers = FieldTable::default();
        headers.insert(RETAINED_HEADER.into(), AMQPValue::Boolean(true));
        assert!(is_retained(&BasicProperties::default().with_headers(headers)));
        assert!(!is_retained(&BasicProperties::default()));
    }

    #[test]
    fn nacked_confirmation_is_a_publish_failure() {
        assert!(check_confirmation("system/x", &Confirmation::Ack(None)).is_ok());
        assert!(check_confirmation("system/x", &Confirmation::NotRequested).is_ok());
        let err = check_confirmation("system/x", &Confirmation::Nack(None)).unwrap_err();
        assert!(matches!(err, BusError::PublishFailed(_)));
    }

    #[tokio::test]
    async fn missing_channel_counts_as_closed() {
        let bus = AmqpBus {
            url: "amqp://127.0.0.1:1/%2f".to_string(),
            exchange: "test_exchange".to_string(),
            channel: RwLock::new(None),
            subscriptions: Mutex::new(Vec::new()),
        };
        tokio::time::timeout(Duration::from_secs(2), bus.channel_closed())
            .await
            .expect("a bus without a live channel must trigger a reconnect");
    }

    #[tokio::test]
    async fn publish_before_connect_fails_fast() {
        let (_tx, rx) = watch::channel(false);
        let bus = AmqpBus::start(
            "amqp://127.0.0.1:1/%2f",
            "test_exchange",
            Duration::from_millis(50),
            Duration::from_millis(100),
            rx,
        );
        let err = bus
            .publish("system/x", b"{}".to_vec(), QoS::AtLeastOnce, false)
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::NotConnected));
        assert!(!bus.is_connected());
    }
}
