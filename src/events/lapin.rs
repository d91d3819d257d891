//! [`Broker`] over a RabbitMQ connection.

use async_trait::async_trait;
use futures::StreamExt;
use ::lapin::acker::Acker;
use ::lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicRejectOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use ::lapin::protocol::{AMQPErrorKind, AMQPSoftError};
use ::lapin::types::FieldTable;
use ::lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tracing::debug;

use super::broker::{AckMode, Acknowledger, Broker, BrokerChannel, Delivery, DeliveryStream};
use super::error::BrokerError;
use super::topic::{ExchangeKind, ExchangeSpec};
use crate::connect::Connector;
use crate::BoxError;

/// A live AMQP connection.
pub struct LapinBroker(Connection);

impl LapinBroker {
    pub fn new(connection: Connection) -> Self {
        Self(connection)
    }

    pub fn connection(&self) -> &Connection {
        &self.0
    }
}

#[async_trait]
impl Broker for LapinBroker {
    type Channel = LapinChannel;

    async fn open_channel(&self) -> Result<LapinChannel, BrokerError> {
        let channel = self.0.create_channel().await.map_err(map_error)?;
        debug!(channel = channel.id(), "opened channel");
        Ok(LapinChannel(channel))
    }
}

/// One AMQP channel.
pub struct LapinChannel(Channel);

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), BrokerError> {
        let kind = match spec.kind {
            ExchangeKind::Topic => ::lapin::ExchangeKind::Topic,
            ExchangeKind::Direct => ::lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => ::lapin::ExchangeKind::Fanout,
        };
        self.0
            .exchange_declare(
                &spec.name,
                kind,
                ExchangeDeclareOptions {
                    durable: spec.durable,
                    auto_delete: spec.auto_delete,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(map_error)
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<(), BrokerError> {
        // Transient delivery mode; no publisher confirm is awaited.
        self.0
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default().with_content_type("application/json".into()),
            )
            .await
            .map_err(map_error)?;
        Ok(())
    }

    async fn declare_transient_queue(&self) -> Result<String, BrokerError> {
        let queue = self
            .0
            .queue_declare(
                "",
                QueueDeclareOptions {
                    durable: false,
                    exclusive: true,
                    auto_delete: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(map_error)?;
        Ok(queue.name().as_str().to_string())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        pattern: &str,
    ) -> Result<(), BrokerError> {
        self.0
            .queue_bind(
                queue,
                exchange,
                pattern,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(map_error)
    }

    async fn consume(&self, queue: &str, mode: AckMode) -> Result<DeliveryStream, BrokerError> {
        let no_ack = mode == AckMode::Auto;
        let consumer = self
            .0
            .basic_consume(
                queue,
                &format!("relay-gateway-{queue}"),
                BasicConsumeOptions {
                    no_ack,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(map_error)?;

        let stream = consumer.map(move |next| {
            next.map(|delivery| {
                let converted =
                    Delivery::new(delivery.routing_key.as_str(), delivery.data);
                if no_ack {
                    converted
                } else {
                    converted.with_acker(Box::new(LapinAcker(delivery.acker)))
                }
            })
            .map_err(map_error)
        });
        Ok(stream.boxed())
    }

    fn is_open(&self) -> bool {
        self.0.status().connected()
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if !self.is_open() {
            return Ok(());
        }
        self.0.close(200, "closing").await.map_err(map_error)
    }
}

struct LapinAcker(Acker);

#[async_trait]
impl Acknowledger for LapinAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map_err(map_error)
    }

    async fn reject(&self) -> Result<(), BrokerError> {
        self.0
            .reject(BasicRejectOptions { requeue: false })
            .await
            .map_err(map_error)
    }
}

/// Connects to an `amqp://` URL.
#[derive(Clone, Debug)]
pub struct AmqpConnector {
    connection_name: String,
}

impl AmqpConnector {
    pub fn new(connection_name: impl Into<String>) -> Self {
        Self {
            connection_name: connection_name.into(),
        }
    }
}

impl Default for AmqpConnector {
    fn default() -> Self {
        Self::new("relay-gateway")
    }
}

#[async_trait]
impl Connector<LapinBroker> for AmqpConnector {
    async fn connect(&self, target: &str) -> Result<LapinBroker, BoxError> {
        let connection = Connection::connect(
            target,
            ConnectionProperties::default().with_connection_name(self.connection_name.clone().into()),
        )
        .await?;
        Ok(LapinBroker(connection))
    }
}

fn map_error(err: ::lapin::Error) -> BrokerError {
    match err {
        ::lapin::Error::InvalidChannelState(_) | ::lapin::Error::InvalidChannel(_) => {
            BrokerError::ChannelClosed
        }
        ::lapin::Error::InvalidConnectionState(state) => {
            BrokerError::ConnectionClosed(format!("{state:?}"))
        }
        ::lapin::Error::IOError(e) => BrokerError::ConnectionClosed(e.to_string()),
        ::lapin::Error::ProtocolError(e) => match e.kind() {
            AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED) => {
                BrokerError::PreconditionFailed(e.to_string())
            }
            AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND) => BrokerError::NotFound(e.to_string()),
            _ => BrokerError::Protocol(e.to_string()),
        },
        other => BrokerError::Protocol(other.to_string()),
    }
}
