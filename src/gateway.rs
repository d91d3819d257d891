//! Assembly of the dispatcher and the event listener from a [`GatewayConfig`].
//!
//! ```ignore
//! let config = GatewayConfig::load(Some(Path::new("gateway.toml")))?;
//! telemetry::init_tracing(&config.log_level.0);
//! let manager = Arc::new(
//!     ConnectionManager::establish(
//!         config.broker.url.clone(),
//!         config.broker.retry.clone(),
//!         AmqpConnector::default(),
//!     )
//!     .await?,
//! );
//!
//! let dispatcher = gateway::dispatcher(&config, Arc::clone(&manager)).await?;
//! tokio::spawn(dispatch::serve(Arc::new(dispatcher), &config.http.listen_addr));
//!
//! let forwarder = gateway::forwarder(&config)?;
//! gateway::run_listener(&config, &manager, Arc::new(forwarder)).await?;
//! ```

use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use crate::config::GatewayConfig;
use crate::connect::ConnectionManager;
use crate::dispatch::Dispatcher;
use crate::events::{
    listen_with_reconnect, Broker, Emitter, EventError, EventHandler, LogForwarder,
};
use crate::transport::{
    select_log_transport, EventLogTransport, HttpClient, LogTransport, TransportError,
};

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Event(#[from] EventError),
}

/// Declare the configured exchange and return an emitter keeping
/// `broker.channel_pool_size` idle channels on the manager's current handle.
pub async fn emitter<B: Broker>(
    config: &GatewayConfig,
    manager: Arc<ConnectionManager<B>>,
) -> Result<Arc<Emitter<B>>, EventError> {
    let emitter = Emitter::managed(manager, config.exchange_spec())
        .await?
        .with_channel_pool(config.broker.channel_pool_size);
    Ok(Arc::new(emitter))
}

/// Build a dispatcher whose `event` action publishes through `manager`.
/// A publish that finds the connection gone has the manager reconnect.
pub async fn dispatcher<B: Broker>(
    config: &GatewayConfig,
    manager: Arc<ConnectionManager<B>>,
) -> Result<Dispatcher, GatewayError> {
    let timeout = config.request_timeout();
    let http = HttpClient::new(timeout)?;

    let events: Arc<dyn LogTransport> = Arc::new(
        EventLogTransport::new(emitter(config, manager).await?)
            .with_severity(config.dispatch.event_severity),
    );
    let log = select_log_transport(
        config.dispatch.log_transport,
        &config.log_endpoints(),
        &http,
        timeout,
        Some(events.clone()),
    )?;

    info!(
        log_transport = %log.kind(),
        exchange = %config.broker.exchange,
        "dispatcher ready"
    );
    Ok(Dispatcher::new(
        Arc::new(http),
        log,
        events,
        config.service_endpoints(),
    ))
}

/// The listener's handler: forwards every non-`auth` event over
/// `listener.forward_transport`.
pub fn forwarder(config: &GatewayConfig) -> Result<LogForwarder, GatewayError> {
    let timeout = config.request_timeout();
    let http = HttpClient::new(timeout)?;
    let transport = select_log_transport(
        config.listener.forward_transport,
        &config.log_endpoints(),
        &http,
        timeout,
        None,
    )?;
    Ok(LogForwarder::new(transport))
}

/// Consume `listener.topics` until the broker cannot be reached again.
pub async fn run_listener<B: Broker>(
    config: &GatewayConfig,
    manager: &ConnectionManager<B>,
    handler: Arc<dyn EventHandler>,
) -> Result<(), EventError> {
    info!(
        topics = ?config.listener.topics,
        ack_mode = ?config.listener.ack_mode,
        "starting listener"
    );
    listen_with_reconnect(
        manager,
        config.exchange_spec(),
        config.listener.ack_mode,
        &config.listener.topics,
        handler,
    )
    .await
}
