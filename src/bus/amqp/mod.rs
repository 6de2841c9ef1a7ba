//! AMQP (RabbitMQ) transport.
//!
//! One lapin connection with one channel per supervised (service, role).
//! Publishing channels run in confirm mode; at most `max_in_flight`
//! unconfirmed publishes may be outstanding, beyond which `publish` reports
//! backpressure instead of waiting.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        BasicRejectOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    protocol::{AMQPErrorKind, AMQPSoftError},
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};

use super::{Acker, BrokerChannel, BusError, Connector, Delivery, DeliveryStream, Result, Role};
use crate::envelope::CONTENT_TYPE;
use crate::topology::{Binding, Exchange, ExchangeKind, Queue};

/// Default cap on unconfirmed publishes per channel.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 256;

/// AMQP reply code for a normal close.
const REPLY_SUCCESS: u16 = 200;

/// Opens lapin connections for the supervisor.
#[derive(Debug, Clone)]
pub struct AmqpConnector {
    max_in_flight: usize,
}

impl Default for AmqpConnector {
    fn default() -> Self {
        Self {
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
        }
    }
}

impl AmqpConnector {
    pub fn new(max_in_flight: usize) -> Self {
        Self {
            max_in_flight: max_in_flight.max(1),
        }
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(&self, url: &str, role: Role) -> Result<Arc<dyn BrokerChannel>> {
        let connection = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(|e| BusError::Connect(format!("Failed to connect: {}", e)))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BusError::Connect(format!("Failed to create channel: {}", e)))?;

        if role == Role::Publish {
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await
                .map_err(|e| BusError::Connect(format!("Failed to enable confirms: {}", e)))?;
        }

        let (closed_tx, _) = watch::channel(false);
        let on_connection_error = closed_tx.clone();
        connection.on_error(move |e| {
            error!(error = %e, "AMQP connection error");
            on_connection_error.send_replace(true);
        });
        let on_channel_error = closed_tx.clone();
        channel.on_error(move |e| {
            warn!(error = %e, "AMQP channel error");
            on_channel_error.send_replace(true);
        });

        info!(url = %url, role = %role, "Opened AMQP channel");

        Ok(Arc::new(AmqpChannel {
            connection,
            channel,
            in_flight: Arc::new(Semaphore::new(self.max_in_flight)),
            closed: closed_tx,
        }))
    }
}

/// A live lapin connection and channel.
pub struct AmqpChannel {
    connection: Connection,
    channel: Channel,
    in_flight: Arc<Semaphore>,
    closed: watch::Sender<bool>,
}

/// Map a declaration failure. `PRECONDITION_FAILED` means the name already
/// exists with another shape.
fn declare_error(what: &str, name: &str, e: lapin::Error) -> BusError {
    match &e {
        lapin::Error::ProtocolError(amqp)
            if matches!(
                amqp.kind(),
                AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED)
            ) =>
        {
            BusError::TopologyConflict(format!("{} {}: {}", what, name, amqp))
        }
        _ => BusError::Connect(format!("Failed to declare {} {}: {}", what, name, e)),
    }
}

fn exchange_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
    }
}

fn message_properties() -> BasicProperties {
    BasicProperties::default()
        .with_content_type(CONTENT_TYPE.into())
        .with_delivery_mode(2) // persistent
}

impl AmqpChannel {
    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(BusError::NotConnected)
        }
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_exchange(&self, exchange: &Exchange) -> Result<()> {
        self.ensure_open()?;
        self.channel
            .exchange_declare(
                &exchange.name,
                exchange_kind(exchange.kind),
                ExchangeDeclareOptions {
                    durable: exchange.durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| declare_error("exchange", &exchange.name, e))
    }

    async fn declare_queue(&self, queue: &Queue) -> Result<()> {
        self.ensure_open()?;
        self.channel
            .queue_declare(
                &queue.name,
                QueueDeclareOptions {
                    durable: queue.durable,
                    exclusive: queue.exclusive,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map(|_| ())
            .map_err(|e| declare_error("queue", &queue.name, e))
    }

    async fn bind(&self, binding: &Binding) -> Result<()> {
        self.ensure_open()?;
        self.channel
            .queue_bind(
                &binding.queue,
                &binding.exchange,
                &binding.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| declare_error("binding", &binding.queue, e))
    }

    async fn publish(&self, exchange: &str, routing_key: &str, body: Vec<u8>) -> Result<()> {
        self.ensure_open()?;
        let permit = self
            .in_flight
            .clone()
            .try_acquire_owned()
            .map_err(|_| BusError::Backpressure)?;

        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &body,
                message_properties(),
            )
            .await
            .map_err(|e| BusError::Publish(format!("Failed to publish: {}", e)))?;

        // The permit is held until the broker confirms (or the channel dies).
        let exchange = exchange.to_string();
        tokio::spawn(async move {
            match confirm.await {
                Ok(confirmation) if confirmation.is_nack() => {
                    warn!(exchange = %exchange, "Broker nacked published message");
                }
                Ok(_) => debug!(exchange = %exchange, "Publish confirmed"),
                Err(e) => warn!(exchange = %exchange, error = %e, "Publish confirmation failed"),
            }
            drop(permit);
        });

        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> Result<DeliveryStream> {
        self.ensure_open()?;
        self.channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to set prefetch: {}", e)))?;

        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to start consumer: {}", e)))?;

        let stream = consumer.map(|delivery| {
            delivery
                .map(|delivery| {
                    Delivery::new(
                        delivery.data,
                        delivery.routing_key.as_str(),
                        delivery.redelivered,
                        Box::new(LapinAcker {
                            acker: delivery.acker,
                        }),
                    )
                })
                .map_err(|e| BusError::Subscribe(format!("Delivery failed: {}", e)))
        });
        Ok(stream.boxed())
    }

    fn is_open(&self) -> bool {
        !*self.closed.borrow()
            && self.connection.status().connected()
            && self.channel.status().connected()
    }

    async fn closed(&self) {
        let mut closed = self.closed.subscribe();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    /// Close the connection even when only the channel has failed.
    async fn close(&self) -> Result<()> {
        self.closed.send_replace(true);
        if !self.connection.status().connected() {
            return Ok(());
        }
        self.connection
            .close(REPLY_SUCCESS, "shutdown")
            .await
            .map_err(|e| BusError::Connect(format!("Failed to close connection: {}", e)))
    }
}

struct LapinAcker {
    acker: lapin::acker::Acker,
}

#[async_trait]
impl Acker for LapinAcker {
    async fn ack(&self) -> Result<()> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| BusError::Settle(format!("Failed to ack: {}", e)))
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        self.acker
            .reject(BasicRejectOptions { requeue })
            .await
            .map_err(|e| BusError::Settle(format!("Failed to reject: {}", e)))
    }
}
