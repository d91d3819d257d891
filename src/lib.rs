//! relay_gateway - multi-transport action dispatch and topic-exchange event gateway.
//!
//! Two request paths share one set of transports:
//!
//! - **Synchronous**: a tagged request envelope (`{"action": "auth", "auth": {...}}`)
//!   is routed by [`dispatch::Dispatcher`] to exactly one downstream call.
//! - **Asynchronous**: [`events::Emitter`] publishes onto a durable topic
//!   exchange and any number of [`events::Consumer`]s, each with its own
//!   exclusive queue, receive the messages matching their bindings.
//!
//! ```text
//!  caller ──► Dispatcher ──► JsonTransport / LogTransport ──► downstream service
//!                  │
//!                  └──► EventLogTransport ──► Emitter ──► topic exchange
//!                                                             │
//!                              Consumer (queue + bindings) ◄──┘
//!                                     │
//!                                     └──► LogForwarder ──► LogTransport
//! ```
//!
//! Connections to the broker are established once through
//! [`connect::ConnectionManager`] with bounded quadratic backoff and shared by
//! reference with everything that needs them.

pub mod config;
pub mod connect;
pub mod dispatch;
pub mod events;
pub mod gateway;
mod message;
pub mod telemetry;
pub mod transport;

pub use crate::config::{ConfigError, GatewayConfig};
pub use connect::{connect_with_backoff, ConnectError, ConnectionManager, RetryPolicy};
pub use dispatch::{DispatchError, Dispatcher, JsonResponse, RequestEnvelope};
pub use events::{Consumer, Emitter, EventHandler, ExchangeSpec, InMemoryBroker, LogForwarder};
pub use message::{EventMessage, Severity};
pub use transport::{JsonTransport, LogSink, LogTransport, TransportError, TransportKind};

/// Boxed error for opaque collaborator failures (sinks, connectors, handlers).
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
