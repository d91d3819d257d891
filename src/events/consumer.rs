use std::fmt;
use std::sync::Arc;

use futures::StreamExt;
use tracing::{debug, info, warn};

use super::broker::{AckMode, Broker, BrokerChannel, Delivery, DeliveryStream};
use super::error::EventError;
use super::handler::EventHandler;
use super::topic::ExchangeSpec;
use crate::connect::ConnectionManager;
use crate::message::EventMessage;

/// Where a consumer is on its way to receiving messages.
///
/// `Disconnected → ChannelOpen → QueueDeclared → Bound(n) → Consuming`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConsumerState {
    Disconnected,
    ChannelOpen,
    QueueDeclared,
    Bound(usize),
    Consuming,
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsumerState::Disconnected => f.write_str("disconnected"),
            ConsumerState::ChannelOpen => f.write_str("channel-open"),
            ConsumerState::QueueDeclared => f.write_str("queue-declared"),
            ConsumerState::Bound(n) => write!(f, "bound({n})"),
            ConsumerState::Consuming => f.write_str("consuming"),
        }
    }
}

/// Subscribes to routing-key patterns on one topic exchange.
///
/// Each subscription gets its own exclusive, auto-deleting queue, so any
/// number of consumers receive their own copy of every matching message.
pub struct Consumer<B: Broker> {
    broker: Arc<B>,
    exchange: ExchangeSpec,
    ack_mode: AckMode,
}

impl<B: Broker> Consumer<B> {
    /// Declare `exchange` and return a consumer using [`AckMode::Auto`].
    pub async fn new(broker: Arc<B>, exchange: ExchangeSpec) -> Result<Self, EventError> {
        let channel = broker.open_channel().await?;
        let declared = channel.declare_exchange(&exchange).await;
        if let Err(e) = channel.close().await {
            debug!(error = %e, "closing declaration channel failed");
        }
        declared?;

        Ok(Self {
            broker,
            exchange,
            ack_mode: AckMode::Auto,
        })
    }

    pub fn with_ack_mode(mut self, ack_mode: AckMode) -> Self {
        self.ack_mode = ack_mode;
        self
    }

    pub fn ack_mode(&self) -> AckMode {
        self.ack_mode
    }

    /// Open a channel, declare a transient queue, bind it once per pattern
    /// and start consuming.
    pub async fn subscribe<S>(&self, patterns: &[S]) -> Result<Subscription<B::Channel>, EventError>
    where
        S: AsRef<str> + Sync,
    {
        let channel = self.broker.open_channel().await?;
        let mut state = ConsumerState::ChannelOpen;
        debug!(%state, "consumer");

        match self.declare_and_bind(&channel, patterns, &mut state).await {
            Ok((queue, deliveries)) => {
                info!(
                    exchange = %self.exchange.name,
                    %queue,
                    patterns = patterns.len(),
                    ack_mode = ?self.ack_mode,
                    "consuming"
                );
                Ok(Subscription {
                    channel,
                    queue,
                    patterns: patterns.iter().map(|p| p.as_ref().to_string()).collect(),
                    deliveries,
                    ack_mode: self.ack_mode,
                    state,
                })
            }
            Err(e) => {
                warn!(%state, error = %e, "subscription failed");
                let _ = channel.close().await;
                Err(e)
            }
        }
    }

    /// Subscribe and hand every delivery to `handler` until the stream ends.
    pub async fn listen<S>(
        &self,
        patterns: &[S],
        handler: Arc<dyn EventHandler>,
    ) -> Result<(), EventError>
    where
        S: AsRef<str> + Sync,
    {
        self.subscribe(patterns).await?.run(handler).await
    }

    async fn declare_and_bind<S>(
        &self,
        channel: &B::Channel,
        patterns: &[S],
        state: &mut ConsumerState,
    ) -> Result<(String, DeliveryStream), EventError>
    where
        S: AsRef<str> + Sync,
    {
        let queue = channel.declare_transient_queue().await?;
        *state = ConsumerState::QueueDeclared;
        debug!(%state, %queue, "consumer");

        for (bound, pattern) in patterns.iter().enumerate() {
            channel
                .bind_queue(&queue, &self.exchange.name, pattern.as_ref())
                .await?;
            *state = ConsumerState::Bound(bound + 1);
            debug!(%state, pattern = pattern.as_ref(), "consumer");
        }

        let deliveries = channel.consume(&queue, self.ack_mode).await?;
        *state = ConsumerState::Consuming;
        Ok((queue, deliveries))
    }
}

/// A live queue with its bindings and delivery stream.
///
/// Dropping the subscription closes nothing by itself; [`run`](Self::run)
/// closes the channel when the stream ends.
pub struct Subscription<C: BrokerChannel> {
    channel: C,
    queue: String,
    patterns: Vec<String>,
    deliveries: DeliveryStream,
    ack_mode: AckMode,
    state: ConsumerState,
}

impl<C: BrokerChannel> Subscription<C> {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn state(&self) -> ConsumerState {
        self.state
    }

    /// Next raw delivery, for callers that settle deliveries themselves.
    pub async fn next_delivery(&mut self) -> Option<Result<Delivery, EventError>> {
        self.deliveries
            .next()
            .await
            .map(|next| next.map_err(EventError::from))
    }

    /// Dispatch each delivery to `handler` on its own task.
    ///
    /// Intake never waits for a handler, so processing order across
    /// deliveries is not preserved. Returns when the delivery stream ends,
    /// which only happens when the channel or connection goes away.
    pub async fn run(mut self, handler: Arc<dyn EventHandler>) -> Result<(), EventError> {
        let mut outcome = Err(EventError::ConsumerClosed);

        while let Some(next) = self.deliveries.next().await {
            match next {
                Ok(delivery) => {
                    debug!(
                        queue = %self.queue,
                        routing_key = %delivery.routing_key,
                        "delivery"
                    );
                    tokio::spawn(process(delivery, Arc::clone(&handler), self.ack_mode));
                }
                Err(e) => {
                    warn!(queue = %self.queue, error = %e, "delivery stream failed");
                    outcome = Err(e.into());
                    break;
                }
            }
        }

        self.state = ConsumerState::Disconnected;
        info!(queue = %self.queue, state = %self.state, "consumer stopped");
        let _ = self.channel.close().await;
        outcome
    }
}

async fn process(delivery: Delivery, handler: Arc<dyn EventHandler>, ack_mode: AckMode) {
    let event = match EventMessage::from_json(&delivery.body) {
        Ok(event) => event,
        Err(e) => {
            warn!(routing_key = %delivery.routing_key, error = %e, "dropping undecodable delivery");
            settle(&delivery, false).await;
            return;
        }
    };

    match handler.handle(event).await {
        Ok(()) => settle(&delivery, true).await,
        Err(e) => {
            warn!(routing_key = %delivery.routing_key, ?ack_mode, error = %e, "event handler failed");
            settle(&delivery, false).await;
        }
    }
}

async fn settle(delivery: &Delivery, succeeded: bool) {
    let result = if succeeded {
        delivery.ack().await
    } else {
        delivery.reject().await
    };
    if let Err(e) = result {
        warn!(routing_key = %delivery.routing_key, error = %e, "failed to settle delivery");
    }
}

/// Consume from the broker owned by `manager`, re-subscribing after every
/// outage.
///
/// When the channel or connection is lost the broker connection is
/// re-established through the manager and the queue and bindings are
/// declared again. Messages published while no queue existed are lost.
///
/// Consecutive lost cycles count against the manager's [`RetryPolicy`]:
/// after the `n`th one the listener sleeps `n² × unit` before reconnecting,
/// and one more than `max_failures` ends it. A successful subscription resets
/// the count. Errors from a live broker (an inequivalent exchange, a missing
/// entity) are returned at once.
///
/// [`RetryPolicy`]: crate::connect::RetryPolicy
pub async fn listen_with_reconnect<B: Broker>(
    manager: &ConnectionManager<B>,
    exchange: ExchangeSpec,
    ack_mode: AckMode,
    patterns: &[String],
    handler: Arc<dyn EventHandler>,
) -> Result<(), EventError> {
    let mut failures: u32 = 0;

    loop {
        let (generation, broker) = manager.current();

        let outcome = async {
            let subscription = Consumer::new(broker, exchange.clone())
                .await?
                .with_ack_mode(ack_mode)
                .subscribe(patterns)
                .await?;
            failures = 0;
            subscription.run(Arc::clone(&handler)).await
        }
        .await;

        let err = match outcome {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        if !err.is_connection_loss() {
            warn!(generation, error = %err, "consumer failed on a live broker");
            return Err(err);
        }

        failures += 1;
        let policy = manager.policy();
        if failures > policy.max_failures {
            warn!(generation, failures, error = %err, "giving up on consumer");
            return Err(err);
        }

        let delay = policy.delay_after(failures);
        warn!(
            generation,
            failures,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "consumer lost its broker"
        );
        manager.pause(delay).await;
        manager.reconnect(generation).await?;
    }
}
