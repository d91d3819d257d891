//! Storage boundary for the logging service.

use async_trait::async_trait;

use crate::message::EventMessage;
use crate::BoxError;

/// Persists log entries. The document store behind it lives outside this
/// crate; the RPC, gRPC and HTTP log servers only ever call `insert`.
#[async_trait]
pub trait LogSink: Send + Sync + 'static {
    async fn insert(&self, entry: EventMessage) -> Result<(), BoxError>;
}
