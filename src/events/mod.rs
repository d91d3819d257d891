//! events - topic-exchange publish/subscribe.
//!
//! The producer side ([`Emitter`]) and the consumer side ([`Consumer`]) share
//! nothing but the exchange name. Both talk to the broker through two traits:
//!
//! - [`Broker`]: the long-lived connection handle, shared read-only.
//! - [`BrokerChannel`]: a channel opened per operation and never shared.
//!
//! [`InMemoryBroker`] implements them in-process; `lapin::LapinBroker`
//! (feature `amqp`) implements them over RabbitMQ.
//!
//! ## Delivery semantics
//!
//! Publishing succeeds once the broker accepts the frame. Each consumer owns
//! an exclusive, auto-deleting queue, so every consumer with a matching
//! binding gets its own copy. With [`AckMode::Auto`] a delivery is settled
//! the moment it reaches the client; a handler failure is logged and the
//! message is gone. [`AckMode::AfterProcessing`] settles after the handler
//! runs and rejects failures without requeue.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use relay_gateway::events::{Consumer, Emitter, ExchangeSpec, InMemoryBroker, LogForwarder};
//! use relay_gateway::Severity;
//!
//! let broker = Arc::new(InMemoryBroker::new());
//! let emitter = Emitter::new(broker.clone(), ExchangeSpec::default()).await?;
//! let consumer = Consumer::new(broker, ExchangeSpec::default()).await?;
//!
//! let forwarder = Arc::new(LogForwarder::new(log_transport));
//! tokio::spawn(async move { consumer.listen(&["log.*"], forwarder).await });
//!
//! emitter.emit(&EventMessage::new("log", "x"), Severity::Info).await?;
//! ```

mod broker;
mod consumer;
mod emitter;
mod error;
mod handler;
mod memory;
mod pool;
mod topic;

#[cfg(feature = "amqp")]
pub mod lapin;

pub use broker::{AckMode, Acknowledger, Broker, BrokerChannel, Delivery, DeliveryStream};
pub use consumer::{listen_with_reconnect, Consumer, ConsumerState, Subscription};
pub use emitter::Emitter;
pub use error::{BrokerError, EventError};
pub use handler::{EventHandler, LogForwarder};
pub use memory::{Binding, BrokerStats, DeadLetter, InMemoryBroker, InMemoryChannel};
pub use pool::{ChannelPool, PooledChannel};
pub use topic::{topic_matches, ExchangeKind, ExchangeSpec, DEFAULT_EXCHANGE};
