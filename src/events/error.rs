//! Error types for the pub/sub path.

use thiserror::Error;

use crate::connect::ConnectError;

/// Failure reported by a broker connection or channel.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The connection to the broker is gone.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),
    /// The channel was closed (by us or by the broker).
    #[error("channel closed")]
    ChannelClosed,
    /// A redeclaration disagreed with the existing entity.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),
    /// The named exchange or queue does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// Any other protocol-level failure.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Failure of an emitter or consumer operation.
#[derive(Debug, Error)]
pub enum EventError {
    #[error(transparent)]
    Broker(#[from] BrokerError),
    /// A message assembled in-process could not be serialized.
    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
    /// The delivery stream ended.
    #[error("consumer delivery stream ended")]
    ConsumerClosed,
    #[error(transparent)]
    Connect(#[from] ConnectError),
}

impl BrokerError {
    /// The channel or the whole connection went away. Anything else is an
    /// answer from a live broker and will not change on retry.
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, BrokerError::ConnectionClosed(_) | BrokerError::ChannelClosed)
    }
}

impl EventError {
    /// Whether reconnecting could make the failed operation succeed.
    pub fn is_connection_loss(&self) -> bool {
        match self {
            EventError::Broker(e) => e.is_connection_loss(),
            EventError::ConsumerClosed => true,
            EventError::Encode(_) | EventError::Connect(_) => false,
        }
    }
}
