//! transport - thin clients over one wire protocol each.
//!
//! Two capability interfaces:
//!
//! - [`JsonTransport`] performs one JSON `POST` and hands back the raw status
//!   and body. Handlers decide what the status means.
//! - [`LogTransport`] delivers one [`EventMessage`] to the logging service and
//!   returns the service's acknowledgement text. Four variants implement it:
//!
//! | Variant | Wire | Accepted when |
//! |---|---|---|
//! | [`HttpLogTransport`] | JSON `POST /log` | status 202 |
//! | [`RpcLogTransport`] | length-prefixed bitcode frames over TCP | `RpcReply::Ok` |
//! | `GrpcLogTransport` | unary `logs.LogService/WriteLog` | OK status |
//! | [`EventLogTransport`] | publish onto the topic exchange | broker accepts the frame |
//!
//! The variant is chosen by configuration ([`select_log_transport`]), never by
//! the call site.

mod amqp;
pub mod http;
pub mod rpc;
mod sink;

#[cfg(feature = "grpc")]
pub mod grpc;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::events::EventError;
use crate::message::EventMessage;

pub use amqp::EventLogTransport;
pub use http::{HttpClient, HttpLogTransport};
pub use rpc::RpcLogTransport;
pub use sink::LogSink;

#[cfg(feature = "grpc")]
pub use grpc::GrpcLogTransport;

/// Failure of a single outbound call.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The target could not be reached.
    #[error("unreachable: {0}")]
    Unreachable(String),
    /// The call did not complete within its deadline.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    /// The target answered with a status outside the accepted set.
    #[error("rejected with status {0}")]
    Rejected(u16),
    /// The target answered with an application-level error.
    #[error("remote error: {0}")]
    Remote(String),
    /// The outbound payload could not be encoded.
    #[error("encode failed: {0}")]
    Encode(String),
    /// The response could not be decoded.
    #[error("decode failed: {0}")]
    Decode(String),
    /// Publishing onto the event bus failed.
    #[error("publish failed: {0}")]
    Publish(#[from] EventError),
}

/// Status and body of a downstream HTTP response.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl UpstreamResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// Decode the body as JSON.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, TransportError> {
        serde_json::from_slice(&self.body).map_err(|e| TransportError::Decode(e.to_string()))
    }
}

/// One JSON `POST` to a downstream service.
#[async_trait]
pub trait JsonTransport: Send + Sync {
    async fn post_json(&self, url: &str, body: &Value) -> Result<UpstreamResponse, TransportError>;
}

/// Delivers one log entry to the logging service.
#[async_trait]
pub trait LogTransport: Send + Sync {
    /// Send `message`, returning the acknowledgement text.
    async fn send(&self, message: &EventMessage) -> Result<String, TransportError>;

    /// Short name for logs.
    fn kind(&self) -> TransportKind;
}

/// Which [`LogTransport`] variant to use.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Http,
    Rpc,
    Grpc,
    Amqp,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Http => "http",
            TransportKind::Rpc => "rpc",
            TransportKind::Grpc => "grpc",
            TransportKind::Amqp => "amqp",
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the logging service listens on each wire.
#[derive(Clone, Debug)]
pub struct LogEndpoints {
    pub http_url: String,
    pub rpc_addr: String,
    pub grpc_url: String,
}

/// Build the configured [`LogTransport`] variant.
///
/// `events` supplies the AMQP variant, which needs a live emitter; asking for
/// `Amqp` without one is an error.
pub fn select_log_transport(
    kind: TransportKind,
    endpoints: &LogEndpoints,
    http: &HttpClient,
    timeout: Duration,
    events: Option<Arc<dyn LogTransport>>,
) -> Result<Arc<dyn LogTransport>, TransportError> {
    match kind {
        TransportKind::Http => Ok(Arc::new(HttpLogTransport::new(
            http.clone(),
            endpoints.http_url.clone(),
        ))),
        TransportKind::Rpc => Ok(Arc::new(RpcLogTransport::new(
            endpoints.rpc_addr.clone(),
            timeout,
        ))),
        #[cfg(feature = "grpc")]
        TransportKind::Grpc => Ok(Arc::new(GrpcLogTransport::new(
            endpoints.grpc_url.clone(),
            timeout,
        ))),
        #[cfg(not(feature = "grpc"))]
        TransportKind::Grpc => Err(TransportError::Unreachable(
            "grpc transport not compiled in".into(),
        )),
        TransportKind::Amqp => events.ok_or_else(|| {
            TransportError::Unreachable("amqp transport requires an event emitter".into())
        }),
    }
}
