//! Log entries published onto the topic exchange.

use std::sync::Arc;

use async_trait::async_trait;

use super::{LogTransport, TransportError, TransportKind};
use crate::events::{Broker, Emitter};
use crate::message::{EventMessage, Severity};

/// [`LogTransport`] that hands the entry to the event bus instead of calling
/// the logging service directly. "Sent" means the broker accepted the publish;
/// delivery to a consumer is not awaited.
pub struct EventLogTransport<B: Broker> {
    emitter: Arc<Emitter<B>>,
    severity: Severity,
}

impl<B: Broker> EventLogTransport<B> {
    pub fn new(emitter: Arc<Emitter<B>>) -> Self {
        Self {
            emitter,
            severity: Severity::Info,
        }
    }

    /// Publish at `severity` instead of `log.INFO`.
    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }
}

#[async_trait]
impl<B: Broker> LogTransport for EventLogTransport<B> {
    async fn send(&self, message: &EventMessage) -> Result<String, TransportError> {
        self.emitter.emit(message, self.severity).await?;
        Ok("logged via event bus".to_string())
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Amqp
    }
}
