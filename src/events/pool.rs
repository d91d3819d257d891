//! Bounded reuse of broker channels.

use std::ops::Deref;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use super::broker::{Broker, BrokerChannel};
use super::error::BrokerError;
use crate::connect::{ConnectError, ConnectionManager};

enum Source<B: Broker> {
    Fixed(Arc<B>),
    Managed(Arc<ConnectionManager<B>>),
}

impl<B: Broker> Source<B> {
    fn current(&self) -> (u64, Arc<B>) {
        match self {
            Source::Fixed(broker) => (0, Arc::clone(broker)),
            Source::Managed(manager) => manager.current(),
        }
    }
}

/// Keeps up to `max_idle` open channels for reuse.
///
/// With `max_idle == 0` every checkout opens a fresh channel and every
/// release closes it. A pool built with [`managed`](Self::managed) opens
/// channels on whatever handle its manager holds at checkout time, and idle
/// channels from an older generation are closed instead of reused.
pub struct ChannelPool<B: Broker> {
    source: Source<B>,
    idle: Mutex<Vec<(u64, B::Channel)>>,
    max_idle: usize,
}

impl<B: Broker> ChannelPool<B> {
    /// A pool over one fixed broker handle.
    pub fn new(broker: Arc<B>, max_idle: usize) -> Self {
        Self::from_source(Source::Fixed(broker), max_idle)
    }

    /// A pool that follows `manager` across reconnects.
    pub fn managed(manager: Arc<ConnectionManager<B>>, max_idle: usize) -> Self {
        Self::from_source(Source::Managed(manager), max_idle)
    }

    fn from_source(source: Source<B>, max_idle: usize) -> Self {
        Self {
            source,
            idle: Mutex::new(Vec::new()),
            max_idle,
        }
    }

    /// Change the idle capacity, closing channels beyond it.
    pub fn with_max_idle(mut self, max_idle: usize) -> Self {
        let idle = self.idle.get_mut();
        if idle.len() > max_idle {
            for (_, channel) in idle.drain(max_idle..) {
                close_in_background(channel);
            }
        }
        self.max_idle = max_idle;
        self
    }

    /// An open channel on the current handle, reused when one is idle.
    pub async fn checkout(&self) -> Result<PooledChannel<'_, B>, BrokerError> {
        let (generation, broker) = self.source.current();

        loop {
            let candidate = self.idle.lock().pop();
            match candidate {
                Some((seen, channel)) if seen == generation && channel.is_open() => {
                    return Ok(PooledChannel {
                        pool: self,
                        generation,
                        channel: Some(channel),
                    })
                }
                Some((seen, channel)) if seen != generation => {
                    debug!(stale = seen, generation, "closing idle channel from old connection");
                    close_in_background(channel);
                }
                Some(_) => debug!("dropping closed idle channel"),
                None => break,
            }
        }

        let channel = broker.open_channel().await?;
        Ok(PooledChannel {
            pool: self,
            generation,
            channel: Some(channel),
        })
    }

    /// Generation of the handle the next checkout will use. Always 0 for a
    /// fixed pool.
    pub fn generation(&self) -> u64 {
        self.source.current().0
    }

    pub fn is_managed(&self) -> bool {
        matches!(self.source, Source::Managed(_))
    }

    /// Have the manager replace a handle that went bad at `seen_generation`,
    /// then close idle channels left on older handles. A fixed pool has
    /// nothing to replace.
    pub async fn refresh(&self, seen_generation: u64) -> Result<(), ConnectError> {
        let Source::Managed(manager) = &self.source else {
            return Ok(());
        };
        manager.reconnect(seen_generation).await?;

        let generation = manager.generation();
        let stale: Vec<_> = {
            let mut idle = self.idle.lock();
            let (keep, stale) = idle.drain(..).partition(|(seen, _)| *seen == generation);
            *idle = keep;
            stale
        };
        for (_, channel) in stale {
            close_in_background(channel);
        }
        Ok(())
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    pub fn max_idle(&self) -> usize {
        self.max_idle
    }

    fn check_in(&self, generation: u64, channel: B::Channel) {
        if channel.is_open() && generation == self.generation() {
            let mut idle = self.idle.lock();
            if idle.len() < self.max_idle {
                idle.push((generation, channel));
                return;
            }
        }
        close_in_background(channel);
    }
}

/// A checked-out channel. Goes back to the pool on drop.
pub struct PooledChannel<'a, B: Broker> {
    pool: &'a ChannelPool<B>,
    generation: u64,
    channel: Option<B::Channel>,
}

impl<B: Broker> PooledChannel<'_, B> {
    /// Generation of the handle this channel was opened on.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Close the channel instead of returning it, e.g. after an error left
    /// it in an unknown state.
    pub async fn discard(mut self) {
        if let Some(channel) = self.channel.take() {
            if let Err(e) = channel.close().await {
                debug!(error = %e, "closing discarded channel failed");
            }
        }
    }
}

impl<B: Broker> Deref for PooledChannel<'_, B> {
    type Target = B::Channel;

    fn deref(&self) -> &B::Channel {
        // Only `discard` and `drop` take the channel, and both consume self.
        self.channel
            .as_ref()
            .unwrap_or_else(|| unreachable!("pooled channel used after release"))
    }
}

impl<B: Broker> Drop for PooledChannel<'_, B> {
    fn drop(&mut self) {
        if let Some(channel) = self.channel.take() {
            self.pool.check_in(self.generation, channel);
        }
    }
}

fn close_in_background<C: BrokerChannel>(channel: C) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                let _ = channel.close().await;
            });
        }
        Err(_) => drop(channel),
    }
}
