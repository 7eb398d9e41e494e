// intercom-signaling-service/src/bus/mod.rs

//! Publish/subscribe transport used for call signaling.

pub mod amqp;
pub mod backoff;
pub mod memory;
pub mod topics;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::BusError;

pub use amqp::AmqpBus;
pub use backoff::Backoff;
pub use memory::InMemoryBus;

pub(crate) const SUBSCRIPTION_BUFFER: usize = 1024;

/// Delivery guarantee requested for a message or subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QoS {
    AtMostOnce,
    AtLeastOnce,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retained: bool,
}

/// Stream of messages matching one topic filter.
pub struct Subscription {
    filter: String,
    rx: mpsc::Receiver<BusMessage>,
}

impl Subscription {
    pub(crate) fn new(filter: impl Into<String>, rx: mpsc::Receiver<BusMessage>) -> Self {
        Self { filter: filter.into(), rx }
    }

    pub fn filter(&self) -> &str {
        &self.filter
    }

    /// `None` once the bus has dropped the subscription.
    pub async fn recv(&mut self) -> Option<BusMessage> {
        self.rx.recv().await
    }
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Fails fast with [`BusError::NotConnected`] while the transport is down.
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS, retained: bool) -> Result<(), BusError>;

    /// Subscriptions survive reconnects.
    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<Subscription, BusError>;

    fn is_connected(&self) -> bool;
}
