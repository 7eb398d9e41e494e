// intercom-signaling-service/src/bus/memory.rs

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::bus::topics::topic_matches;
use crate::bus::{BusMessage, MessageBus, QoS, Subscription, SUBSCRIPTION_BUFFER};
use crate::error::BusError;

/// In-process bus for local development and tests.
///
/// Retained messages are kept per topic and replayed to new subscribers;
/// publishing an empty retained payload clears the topic.
pub struct InMemoryBus {
    subscribers: Mutex<Vec<(String, mpsc::Sender<BusMessage>)>>,
    retained: DashMap<String, BusMessage>,
    connected: AtomicBool,
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            retained: DashMap::new(),
            connected: AtomicBool::new(true),
        }
    }

    /// Simulates a transport outage.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>, _qos: QoS, retained: bool) -> Result<(), BusError> {
        if !self.is_connected() {
            return Err(BusError::NotConnected);
        }

        let message = BusMessage {
            topic: topic.to_string(),
            payload,
            retained,
        };
        if retained {
            if message.payload.is_empty() {
                self.retained.remove(topic);
            } else {
                self.retained.insert(topic.to_string(), message.clone());
            }
        }

        let targets: Vec<mpsc::Sender<BusMessage>> = {
            let mut subscribers = self.subscribers.lock();
            subscribers.retain(|(_, tx)| !tx.is_closed());
            subscribers
                .iter()
                .filter(|(filter, _)| topic_matches(filter, topic))
                .map(|(_, tx)| tx.clone())
                .collect()
        };

        debug!(topic = %topic, receivers = targets.len(), "In-memory publish");
        for tx in targets {
            // A receiver dropped between collect and send is not an error.
            let _ = tx.send(message.clone()).await;
        }
        Ok(())
    }

    async fn subscribe(&self, filter: &str, _qos: QoS) -> Result<Subscription, BusError> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        for entry in self.retained.iter() {
            if topic_matches(filter, entry.key()) {
                let _ = tx.try_send(entry.value().clone());
            }
        }
        self.subscribers.lock().push((filter.to_string(), tx));
        Ok(Subscription::new(filter, rx))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_to_matching_filters_only() {
        let bus = InMemoryBus::new();
        let mut requests = bus.subscribe("calls/request/+", QoS::AtLeastOnce).await.unwrap();
        let mut control = bus.subscribe("devices/+/calls/control", QoS::AtLeastOnce).await.unwrap();

        bus.publish("calls/request/dev1", b"{}".to_vec(), QoS::AtLeastOnce, false)
            .await
            .unwrap();

        let msg = requests.recv().await.unwrap();
        assert_eq!(msg.topic, "calls/request/dev1");
        assert!(control.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn retained_message_replayed_and_cleared() {
        let bus = InMemoryBus::new();
        bus.publish("system/service_status", b"online".to_vec(), QoS::AtLeastOnce, true)
            .await
            .unwrap();

        let mut late = bus.subscribe("system/#", QoS::AtMostOnce).await.unwrap();
        let msg = late.recv().await.unwrap();
        assert!(msg.retained);
        assert_eq!(msg.payload, b"online".to_vec());

        bus.publish("system/service_status", Vec::new(), QoS::AtLeastOnce, true)
            .await
            .unwrap();
        let mut later = bus.subscribe("system/#", QoS::AtMostOnce).await.unwrap();
        assert!(later.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn publish_fails_fast_when_disconnected() {
        let bus = InMemoryBus::new();
        bus.set_connected(false);
        let err = bus
            .publish("system/x", b"1".to_vec(), QoS::AtMostOnce, false)
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::NotConnected));
    }
}
