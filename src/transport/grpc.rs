//! gRPC transport - unary `logs.LogService/WriteLog`.
//!
//! Requires the `grpc` feature. Uses tonic for client and server and prost
//! for message serialization (standard protobuf wire format, no `.proto` file).
//!
//! Every call dials its own channel. The deadline bounds the dial and the call
//! together and is also sent to the server as `grpc-timeout`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tonic::transport::Endpoint;
use tonic::{Request, Response, Status};
use tracing::warn;

use super::{LogSink, LogTransport, TransportError, TransportKind};
use crate::message::EventMessage;

// ---------------------------------------------------------------------------
// Message types (prost, standard protobuf wire format)
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, prost::Message)]
pub struct Log {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub data: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct LogRequest {
    #[prost(message, optional, tag = "1")]
    pub log_entry: Option<Log>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct LogResponse {
    #[prost(string, tag = "1")]
    pub result: String,
}

// ---------------------------------------------------------------------------
// Generated service trait + server/client
// ---------------------------------------------------------------------------

include!(concat!(env!("OUT_DIR"), "/logs.LogService.rs"));

pub use log_service_client::LogServiceClient;
pub use log_service_server::{LogService, LogServiceServer};

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// [`LogTransport`] over gRPC.
#[derive(Clone, Debug)]
pub struct GrpcLogTransport {
    url: String,
    deadline: Duration,
}

impl GrpcLogTransport {
    pub fn new(url: impl Into<String>, deadline: Duration) -> Self {
        Self {
            url: url.into(),
            deadline,
        }
    }

    async fn call(&self, message: &EventMessage) -> Result<String, TransportError> {
        let channel = Endpoint::from_shared(self.url.clone())
            .map_err(|e| TransportError::Unreachable(e.to_string()))?
            .connect()
            .await
            .map_err(|e| TransportError::Unreachable(e.to_string()))?;

        let mut client = LogServiceClient::new(channel);
        let mut request = Request::new(LogRequest {
            log_entry: Some(Log {
                name: message.name().to_string(),
                data: message.data().to_string(),
            }),
        });
        request.set_timeout(self.deadline);

        let response = client.write_log(request).await.map_err(|status| match status.code() {
            tonic::Code::DeadlineExceeded => TransportError::Timeout(self.deadline),
            tonic::Code::Unavailable => TransportError::Unreachable(status.message().to_string()),
            _ => TransportError::Remote(status.message().to_string()),
        })?;

        Ok(response.into_inner().result)
    }
}

#[async_trait]
impl LogTransport for GrpcLogTransport {
    async fn send(&self, message: &EventMessage) -> Result<String, TransportError> {
        // One deadline for dialing and the call together.
        tokio::time::timeout(self.deadline, self.call(message))
            .await
            .map_err(|_| TransportError::Timeout(self.deadline))?
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Grpc
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// Implements the generated `LogService` trait on top of a [`LogSink`].
pub struct GrpcLogServer {
    sink: Arc<dyn LogSink>,
}

impl GrpcLogServer {
    pub fn new(sink: Arc<dyn LogSink>) -> Self {
        Self { sink }
    }
}

#[tonic::async_trait]
impl LogService for GrpcLogServer {
    async fn write_log(
        &self,
        request: Request<LogRequest>,
    ) -> Result<Response<LogResponse>, Status> {
        let entry = request
            .into_inner()
            .log_entry
            .ok_or_else(|| Status::invalid_argument("missing log entry"))?;

        match self.sink.insert(EventMessage::new(entry.name, entry.data)).await {
            Ok(()) => Ok(Response::new(LogResponse {
                result: "logged".to_string(),
            })),
            Err(e) => {
                warn!(error = %e, "log insert failed");
                Err(Status::internal("failed"))
            }
        }
    }
}

/// Create a `LogServiceServer` from a shared sink.
pub fn grpc_log_server(sink: Arc<dyn LogSink>) -> LogServiceServer<GrpcLogServer> {
    LogServiceServer::new(GrpcLogServer::new(sink))
}

/// Bind and serve the gRPC log service at `addr` (e.g. `"0.0.0.0:50001"`).
pub async fn serve_grpc(sink: Arc<dyn LogSink>, addr: &str) -> Result<(), TransportError> {
    let addr = addr
        .parse()
        .map_err(|e: std::net::AddrParseError| TransportError::Unreachable(e.to_string()))?;
    tonic::transport::Server::builder()
        .add_service(grpc_log_server(sink))
        .serve(addr)
        .await
        .map_err(|e| TransportError::Unreachable(e.to_string()))
}

/// Serve the gRPC log service on an already-bound listener.
pub async fn serve_grpc_with_listener(
    sink: Arc<dyn LogSink>,
    listener: tokio::net::TcpListener,
) -> Result<(), TransportError> {
    tonic::transport::Server::builder()
        .add_service(grpc_log_server(sink))
        .serve_with_incoming(tokio_stream::wrappers::TcpListenerStream::new(listener))
        .await
        .map_err(|e| TransportError::Unreachable(e.to_string()))
}
