use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::message::EventMessage;
use crate::transport::LogTransport;
use crate::BoxError;

/// Processes one decoded event.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn handle(&self, event: EventMessage) -> Result<(), BoxError>;
}

/// Routes events by category to the logging service.
///
/// `"log"`, `"event"` and any unrecognized category are forwarded through the
/// configured [`LogTransport`]. `"auth"` is reserved and accepted without
/// doing anything.
pub struct LogForwarder {
    transport: Arc<dyn LogTransport>,
}

impl LogForwarder {
    pub fn new(transport: Arc<dyn LogTransport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl EventHandler for LogForwarder {
    async fn handle(&self, event: EventMessage) -> Result<(), BoxError> {
        match event.name() {
            "auth" => {
                debug!("auth event accepted, no handler registered");
                Ok(())
            }
            _ => {
                let reply = self.transport.send(&event).await?;
                info!(name = %event.name(), transport = %self.transport.kind(), %reply, "forwarded event");
                Ok(())
            }
        }
    }
}
