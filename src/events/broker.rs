//! Broker traits: a long-lived connection hands out short-lived channels, and
//! every topology or publish operation goes through a channel.

use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use super::error::BrokerError;
use super::topic::ExchangeSpec;

/// When a delivery counts as handled.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckMode {
    /// The broker forgets the message as soon as it is handed to the client.
    /// A crash during processing loses it.
    #[default]
    Auto,
    /// The consumer acks after its handler succeeds and rejects (without
    /// requeue) when it fails.
    AfterProcessing,
}

/// Settles one delivery in [`AckMode::AfterProcessing`].
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), BrokerError>;
    async fn reject(&self) -> Result<(), BrokerError>;
}

/// One message handed to a consumer.
pub struct Delivery {
    pub routing_key: String,
    pub body: Vec<u8>,
    acker: Option<Box<dyn Acknowledger>>,
}

impl Delivery {
    /// An auto-acknowledged delivery.
    pub fn new(routing_key: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            routing_key: routing_key.into(),
            body,
            acker: None,
        }
    }

    /// Attach the handle used to settle this delivery.
    pub fn with_acker(mut self, acker: Box<dyn Acknowledger>) -> Self {
        self.acker = Some(acker);
        self
    }

    /// Whether the consumer must settle this delivery.
    pub fn needs_ack(&self) -> bool {
        self.acker.is_some()
    }

    pub async fn ack(&self) -> Result<(), BrokerError> {
        match &self.acker {
            Some(acker) => acker.ack().await,
            None => Ok(()),
        }
    }

    pub async fn reject(&self) -> Result<(), BrokerError> {
        match &self.acker {
            Some(acker) => acker.reject().await,
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("routing_key", &self.routing_key)
            .field("body_len", &self.body.len())
            .field("needs_ack", &self.needs_ack())
            .finish()
    }
}

/// Deliveries for one consumer, in broker order.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, BrokerError>>;

/// A broker connection handle. Shared read-only; channels are opened per
/// operation and never shared between tasks.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    type Channel: BrokerChannel;

    async fn open_channel(&self) -> Result<Self::Channel, BrokerError>;
}

/// One channel on a broker connection.
#[async_trait]
pub trait BrokerChannel: Send + Sync + 'static {
    /// Declare an exchange. Redeclaring with identical parameters is a no-op.
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), BrokerError>;

    /// Publish `payload` with `routing_key`. Returns once the broker has the
    /// frame; nothing is known about consumers at that point.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<(), BrokerError>;

    /// Declare an exclusive, auto-deleting, non-durable queue with a
    /// broker-assigned name. Returns the name.
    async fn declare_transient_queue(&self) -> Result<String, BrokerError>;

    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str)
        -> Result<(), BrokerError>;

    async fn consume(&self, queue: &str, mode: AckMode) -> Result<DeliveryStream, BrokerError>;

    fn is_open(&self) -> bool;

    async fn close(&self) -> Result<(), BrokerError>;
}
