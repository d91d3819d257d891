use std::future::Future;
use std::sync::Arc;

use tracing::{debug, instrument, warn};

use super::broker::{Broker, BrokerChannel};
use super::error::{BrokerError, EventError};
use super::pool::ChannelPool;
use super::topic::ExchangeSpec;
use crate::connect::ConnectionManager;
use crate::message::{EventMessage, Severity};

/// Retries after a lost channel or connection, for a managed emitter.
const MAX_RETRIES: usize = 2;

/// Publishes payloads onto one topic exchange.
///
/// Every publish re-declares the exchange (a no-op when it already exists)
/// and returns once the broker has accepted the frame. Messages are not
/// persistent and nothing waits for a consumer.
///
/// An emitter built with [`managed`](Self::managed) survives broker restarts:
/// when a publish finds its connection gone it asks the manager for a new
/// one and tries again.
pub struct Emitter<B: Broker> {
    exchange: ExchangeSpec,
    pool: ChannelPool<B>,
}

impl<B: Broker> Emitter<B> {
    /// Declare `exchange` and return an emitter that opens a fresh channel
    /// per publish.
    pub async fn new(broker: Arc<B>, exchange: ExchangeSpec) -> Result<Self, EventError> {
        Self::declared(ChannelPool::new(broker, 0), exchange).await
    }

    /// Like [`new`](Self::new), but every checkout uses the manager's current
    /// handle.
    pub async fn managed(
        manager: Arc<ConnectionManager<B>>,
        exchange: ExchangeSpec,
    ) -> Result<Self, EventError> {
        Self::declared(ChannelPool::managed(manager, 0), exchange).await
    }

    async fn declared(pool: ChannelPool<B>, exchange: ExchangeSpec) -> Result<Self, EventError> {
        let emitter = Self { exchange, pool };
        emitter.retrying(|| emitter.send(None)).await?;
        Ok(emitter)
    }

    /// Keep up to `max_idle` channels open between publishes.
    pub fn with_channel_pool(self, max_idle: usize) -> Self {
        Self {
            exchange: self.exchange,
            pool: self.pool.with_max_idle(max_idle),
        }
    }

    pub fn exchange(&self) -> &ExchangeSpec {
        &self.exchange
    }

    pub fn pool(&self) -> &ChannelPool<B> {
        &self.pool
    }

    /// Publish `body` with `routing_key` as the category.
    #[instrument(skip(self, body), fields(exchange = %self.exchange.name, len = body.len()))]
    pub async fn publish(&self, routing_key: &str, body: &[u8]) -> Result<(), EventError> {
        self.retrying(move || self.send(Some((routing_key, body)))).await?;
        debug!("published");
        Ok(())
    }

    /// Publish `message` as JSON with the routing key of `severity`.
    pub async fn emit(&self, message: &EventMessage, severity: Severity) -> Result<(), EventError> {
        let body = message.to_json()?;
        self.publish(severity.routing_key(), &body).await
    }

    async fn retrying<F, Fut>(&self, op: F) -> Result<(), EventError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<(), BrokerError>>,
    {
        let mut retries = 0;
        loop {
            let seen = self.pool.generation();
            let err = match op().await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };
            if !self.pool.is_managed() || !err.is_connection_loss() || retries == MAX_RETRIES {
                return Err(err.into());
            }

            retries += 1;
            warn!(generation = seen, retries, error = %err, "broker channel lost, retrying");
            if matches!(err, BrokerError::ConnectionClosed(_)) {
                self.pool.refresh(seen).await?;
            }
        }
    }

    /// Declare the exchange on a pooled channel, then publish `frame` if
    /// there is one. A channel that saw an error is closed, not returned.
    async fn send(&self, frame: Option<(&str, &[u8])>) -> Result<(), BrokerError> {
        let channel = self.pool.checkout().await?;

        let result = async {
            channel.declare_exchange(&self.exchange).await?;
            match frame {
                Some((routing_key, body)) => {
                    channel.publish(&self.exchange.name, routing_key, body).await
                }
                None => Ok(()),
            }
        }
        .await;

        if result.is_err() {
            channel.discard().await;
        }
        result
    }
}
