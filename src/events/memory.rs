//! In-memory broker for testing and single-process scenarios.
//!
//! Implements [`Broker`] with the topic-exchange semantics of an AMQP broker:
//!
//! - exchanges are declared idempotently; a redeclaration with different
//!   parameters fails with `PreconditionFailed`
//! - queues are exclusive to the channel that declared them and disappear
//!   when that channel closes or their consumer goes away
//! - a message is delivered once per queue with at least one matching binding
//! - auto-acknowledged deliveries are forgotten the moment they are handed
//!   out; there is no redelivery
//! - [`set_offline`](InMemoryBroker::set_offline) simulates a broker restart

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

use super::broker::{AckMode, Acknowledger, Broker, BrokerChannel, Delivery, DeliveryStream};
use super::error::BrokerError;
use super::topic::ExchangeSpec;
use crate::connect::Connector;
use crate::BoxError;

/// Counters kept by the in-memory broker.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub channels_opened: u64,
    pub exchange_declarations: u64,
    pub published: u64,
    pub unroutable: u64,
    pub delivered: u64,
    pub acked: u64,
    pub rejected: u64,
}

/// A queue binding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Binding {
    pub exchange: String,
    pub pattern: String,
}

/// A message rejected by its consumer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeadLetter {
    pub queue: String,
    pub routing_key: String,
    pub body: Vec<u8>,
}

#[derive(Clone)]
struct Message {
    routing_key: String,
    body: Vec<u8>,
}

type DeliverySender = mpsc::UnboundedSender<Result<Delivery, BrokerError>>;

struct QueueState {
    owner: u64,
    bindings: Vec<Binding>,
    ready: VecDeque<Message>,
    consumer: Option<(DeliverySender, AckMode)>,
    unacked: HashMap<u64, Message>,
}

impl QueueState {
    fn consumer_gone(&self) -> bool {
        matches!(&self.consumer, Some((tx, _)) if tx.is_closed())
    }
}

#[derive(Default)]
struct State {
    offline: bool,
    exchanges: HashMap<String, ExchangeSpec>,
    queues: HashMap<String, QueueState>,
    open_channels: HashSet<u64>,
    next_queue: u64,
    next_channel: u64,
    next_tag: u64,
    stats: BrokerStats,
    dead_letters: Vec<DeadLetter>,
}

impl State {
    /// Drop queues whose consumer has gone away (auto-delete).
    fn prune(&mut self) {
        self.queues.retain(|name, q| {
            let keep = !q.consumer_gone();
            if !keep {
                debug!(queue = %name, "auto-deleting queue");
            }
            keep
        });
    }
}

/// In-memory message broker.
///
/// Cheap to clone; clones share the same exchanges and queues, so a clone is
/// the equivalent of a second connection to the same broker.
///
/// ## Example
///
/// ```ignore
/// use relay_gateway::events::{Broker, BrokerChannel, ExchangeSpec, InMemoryBroker, AckMode};
///
/// let broker = InMemoryBroker::new();
/// let ch = broker.open_channel().await?;
/// ch.declare_exchange(&ExchangeSpec::topic("logs_topic")).await?;
/// let queue = ch.declare_transient_queue().await?;
/// ch.bind_queue(&queue, "logs_topic", "log.*").await?;
/// let deliveries = ch.consume(&queue, AckMode::Auto).await?;
/// ch.publish("logs_topic", "log.INFO", br#"{"name":"log","data":"x"}"#).await?;
/// ```
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<State>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the broker down (`true`) or bring it back (`false`).
    ///
    /// Going down closes every channel, drops every queue (they are all
    /// exclusive) and non-durable exchange, and ends each consumer's stream
    /// with `ConnectionClosed`.
    pub fn set_offline(&self, offline: bool) {
        let mut state = self.state.lock();
        state.offline = offline;
        if !offline {
            return;
        }

        state.open_channels.clear();
        for (_, queue) in state.queues.drain() {
            if let Some((tx, _)) = queue.consumer {
                let _ = tx.send(Err(BrokerError::ConnectionClosed("broker went away".into())));
            }
        }
        state.exchanges.retain(|_, spec| spec.durable);
    }

    pub fn is_online(&self) -> bool {
        !self.state.lock().offline
    }

    /// A [`Connector`] that hands out this broker while it is online.
    pub fn connector(&self) -> impl Connector<InMemoryBroker> + 'static {
        let broker = self.clone();
        move |_target: String| {
            let broker = broker.clone();
            async move {
                if broker.is_online() {
                    Ok(broker)
                } else {
                    Err::<InMemoryBroker, BoxError>("connection refused".into())
                }
            }
        }
    }

    pub fn stats(&self) -> BrokerStats {
        self.state.lock().stats.clone()
    }

    pub fn exchange(&self, name: &str) -> Option<ExchangeSpec> {
        self.state.lock().exchanges.get(name).cloned()
    }

    pub fn exchange_count(&self) -> usize {
        self.state.lock().exchanges.len()
    }

    /// Names of live queues, sorted.
    pub fn queue_names(&self) -> Vec<String> {
        let mut state = self.state.lock();
        state.prune();
        let mut names: Vec<String> = state.queues.keys().cloned().collect();
        names.sort();
        names
    }

    /// Messages waiting in `queue` for a consumer.
    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        self.state.lock().queues.get(queue).map(|q| q.ready.len())
    }

    /// Deliveries handed out from `queue` and not yet settled.
    pub fn unacked(&self, queue: &str) -> Option<usize> {
        self.state.lock().queues.get(queue).map(|q| q.unacked.len())
    }

    pub fn bindings(&self, queue: &str) -> Vec<Binding> {
        self.state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.bindings.clone())
            .unwrap_or_default()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state.lock().dead_letters.clone()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    type Channel = InMemoryChannel;

    async fn open_channel(&self) -> Result<InMemoryChannel, BrokerError> {
        let mut state = self.state.lock();
        if state.offline {
            return Err(BrokerError::ConnectionClosed("broker offline".into()));
        }
        state.next_channel += 1;
        let id = state.next_channel;
        state.open_channels.insert(id);
        state.stats.channels_opened += 1;

        Ok(InMemoryChannel {
            id,
            state: Arc::clone(&self.state),
            open: AtomicBool::new(true),
        })
    }
}

/// Channel on an [`InMemoryBroker`].
pub struct InMemoryChannel {
    id: u64,
    state: Arc<Mutex<State>>,
    open: AtomicBool,
}

impl InMemoryChannel {
    fn check_open(&self, state: &State) -> Result<(), BrokerError> {
        if state.offline {
            return Err(BrokerError::ConnectionClosed("broker offline".into()));
        }
        if !self.open.load(Ordering::SeqCst) || !state.open_channels.contains(&self.id) {
            return Err(BrokerError::ChannelClosed);
        }
        Ok(())
    }

    /// A channel-level error closes the channel, as on a real broker.
    fn fail(&self, state: &mut State, err: BrokerError) -> BrokerError {
        self.open.store(false, Ordering::SeqCst);
        state.open_channels.remove(&self.id);
        err
    }

    fn deliver(&self, state: &mut State, queue_name: &str, message: Message) {
        state.next_tag += 1;
        let tag = state.next_tag;
        let weak = Arc::downgrade(&self.state);

        let Some(queue) = state.queues.get_mut(queue_name) else {
            return;
        };
        let Some((tx, mode)) = &queue.consumer else {
            queue.ready.push_back(message);
            return;
        };

        let mut delivery = Delivery::new(message.routing_key.clone(), message.body.clone());
        if *mode == AckMode::AfterProcessing {
            queue.unacked.insert(tag, message);
            delivery = delivery.with_acker(Box::new(MemoryAcker {
                state: weak,
                queue: queue_name.to_string(),
                tag,
            }));
        }

        if tx.send(Ok(delivery)).is_ok() {
            state.stats.delivered += 1;
        }
    }
}

#[async_trait]
impl BrokerChannel for InMemoryChannel {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        self.check_open(&state)?;
        state.stats.exchange_declarations += 1;

        match state.exchanges.get(&spec.name) {
            Some(existing) if existing == spec => Ok(()),
            Some(_) => Err(self.fail(
                &mut state,
                BrokerError::PreconditionFailed(format!(
                    "inequivalent arguments for exchange '{}'",
                    spec.name
                )),
            )),
            None => {
                debug!(exchange = %spec.name, "declared exchange");
                state.exchanges.insert(spec.name.clone(), spec.clone());
                Ok(())
            }
        }
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        self.check_open(&state)?;

        let Some(kind) = state.exchanges.get(exchange).map(|spec| spec.kind) else {
            return Err(self.fail(
                &mut state,
                BrokerError::NotFound(format!("exchange '{}'", exchange)),
            ));
        };

        state.prune();
        state.stats.published += 1;

        let mut targets: Vec<String> = state
            .queues
            .iter()
            .filter(|(_, q)| {
                q.bindings
                    .iter()
                    .any(|b| b.exchange == exchange && kind.routes(&b.pattern, routing_key))
            })
            .map(|(name, _)| name.clone())
            .collect();
        targets.sort();

        if targets.is_empty() {
            state.stats.unroutable += 1;
            return Ok(());
        }

        let message = Message {
            routing_key: routing_key.to_string(),
            body: payload.to_vec(),
        };
        for queue in targets {
            self.deliver(&mut state, &queue, message.clone());
        }
        Ok(())
    }

    async fn declare_transient_queue(&self) -> Result<String, BrokerError> {
        let mut state = self.state.lock();
        self.check_open(&state)?;

        state.next_queue += 1;
        let name = format!("amq.gen-{}", state.next_queue);
        state.queues.insert(
            name.clone(),
            QueueState {
                owner: self.id,
                bindings: Vec::new(),
                ready: VecDeque::new(),
                consumer: None,
                unacked: HashMap::new(),
            },
        );
        Ok(name)
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        pattern: &str,
    ) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        self.check_open(&state)?;

        if !state.exchanges.contains_key(exchange) {
            return Err(self.fail(
                &mut state,
                BrokerError::NotFound(format!("exchange '{}'", exchange)),
            ));
        }
        if !state.queues.contains_key(queue) {
            return Err(self.fail(&mut state, BrokerError::NotFound(format!("queue '{}'", queue))));
        }

        let binding = Binding {
            exchange: exchange.to_string(),
            pattern: pattern.to_string(),
        };
        if let Some(q) = state.queues.get_mut(queue) {
            if !q.bindings.contains(&binding) {
                q.bindings.push(binding);
            }
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, mode: AckMode) -> Result<DeliveryStream, BrokerError> {
        let mut state = self.state.lock();
        self.check_open(&state)?;

        match state.queues.get(queue).map(|q| q.owner) {
            None => {
                return Err(self.fail(&mut state, BrokerError::NotFound(format!("queue '{}'", queue))))
            }
            Some(owner) if owner != self.id => {
                return Err(self.fail(
                    &mut state,
                    BrokerError::PreconditionFailed(format!("queue '{}' is exclusive", queue)),
                ))
            }
            Some(_) => {}
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let backlog: Vec<Message> = match state.queues.get_mut(queue) {
            Some(q) => {
                q.consumer = Some((tx, mode));
                q.ready.drain(..).collect()
            }
            None => Vec::new(),
        };
        for message in backlog {
            self.deliver(&mut state, queue, message);
        }

        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    fn is_open(&self) -> bool {
        let state = self.state.lock();
        self.check_open(&state).is_ok()
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        self.open.store(false, Ordering::SeqCst);
        state.open_channels.remove(&self.id);
        let id = self.id;
        state.queues.retain(|_, q| q.owner != id);
        Ok(())
    }
}

struct MemoryAcker {
    state: Weak<Mutex<State>>,
    queue: String,
    tag: u64,
}

impl MemoryAcker {
    fn settle(&self, rejected: bool) -> Result<(), BrokerError> {
        let state = self
            .state
            .upgrade()
            .ok_or_else(|| BrokerError::ConnectionClosed("broker dropped".into()))?;
        let mut state = state.lock();

        let message = state
            .queues
            .get_mut(&self.queue)
            .and_then(|q| q.unacked.remove(&self.tag))
            .ok_or(BrokerError::ChannelClosed)?;

        if rejected {
            state.stats.rejected += 1;
            state.dead_letters.push(DeadLetter {
                queue: self.queue.clone(),
                routing_key: message.routing_key,
                body: message.body,
            });
        } else {
            state.stats.acked += 1;
        }
        Ok(())
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.settle(false)
    }

    async fn reject(&self) -> Result<(), BrokerError> {
        self.settle(true)
    }
}
