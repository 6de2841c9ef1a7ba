//! Event bus for cross-service replication.
//!
//! This module contains:
//! - `Connector` / `BrokerChannel` traits: the broker seam
//! - `Delivery`: one received message with explicit ack/reject
//! - `ConnectionSupervisor`: connection lifecycle with bounded reconnects
//! - `EventPublisher` / `EventConsumer`: the two roles a service plays
//! - Implementations: AMQP (RabbitMQ), in-process channel broker

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::topology::{Binding, Exchange, Queue};

// Implementation modules
#[cfg(feature = "amqp")]
pub mod amqp;
pub mod channel;
pub mod consumer;
pub mod dispatch;
pub mod publisher;
pub mod supervisor;

// Re-exports
#[cfg(feature = "amqp")]
pub use amqp::AmqpConnector;
pub use channel::InProcessBroker;
pub use consumer::{ConsumerHandle, ConsumerStats, EventConsumer, Subscription};
pub use dispatch::{Disposition, EnvelopeHandler, HandlerMap};
pub use publisher::{EventPublisher, PublishRoute};
pub use supervisor::{ConnectionState, ConnectionSupervisor, ReconnectPolicy};

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// Broker unreachable. Recovered by the supervisor, never surfaced to
    /// publishers beyond "not connected".
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Not connected to broker")]
    NotConnected,

    /// Exchange or queue redeclared with an incompatible shape. Fatal at startup.
    #[error("Topology conflict: {0}")]
    TopologyConflict(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    /// Outbound buffer full; the message was not handed to the broker.
    #[error("Broker is applying backpressure")]
    Backpressure,

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Settlement failed: {0}")]
    Settle(String),
}

/// Which half of the fabric a connection serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Publish,
    Consume,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Publish => f.write_str("publish"),
            Role::Consume => f.write_str("consume"),
        }
    }
}

/// Opens broker connections.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a transport connection and one channel on it.
    ///
    /// Fails with `BusError::Connect` when the broker is unreachable.
    async fn connect(&self, url: &str, role: Role) -> Result<Arc<dyn BrokerChannel>>;
}

/// Stream of deliveries from one queue subscription.
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// A live connection+channel pair.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn declare_exchange(&self, exchange: &Exchange) -> Result<()>;

    async fn declare_queue(&self, queue: &Queue) -> Result<()>;

    async fn bind(&self, binding: &Binding) -> Result<()>;

    /// Hand a message to an exchange.
    ///
    /// Must not block when the outbound buffer is full: return
    /// `BusError::Backpressure` instead.
    async fn publish(&self, exchange: &str, routing_key: &str, body: Vec<u8>) -> Result<()>;

    /// Start consuming a queue with at most `prefetch` unacknowledged
    /// deliveries outstanding.
    async fn consume(&self, queue: &str, consumer_tag: &str, prefetch: u16)
        -> Result<DeliveryStream>;

    fn is_open(&self) -> bool;

    /// Resolves once the connection or channel is lost or closed.
    async fn closed(&self);

    async fn close(&self) -> Result<()>;
}

/// Broker-side settlement of one delivery.
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> Result<()>;

    async fn reject(&self, requeue: bool) -> Result<()>;
}

/// One message received from a queue.
///
/// Exactly one of `ack` or `reject` should be called. Dropping an unsettled
/// delivery leaves it with the broker, which redelivers it when the channel
/// closes.
pub struct Delivery {
    pub body: Vec<u8>,
    pub routing_key: String,
    pub redelivered: bool,
    acker: Box<dyn Acker>,
}

impl Delivery {
    pub fn new(
        body: Vec<u8>,
        routing_key: impl Into<String>,
        redelivered: bool,
        acker: Box<dyn Acker>,
    ) -> Self {
        Self {
            body,
            routing_key: routing_key.into(),
            redelivered,
            acker,
        }
    }

    pub async fn ack(self) -> Result<()> {
        self.acker.ack().await
    }

    pub async fn reject(self, requeue: bool) -> Result<()> {
        self.acker.reject(requeue).await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("len", &self.body.len())
            .finish()
    }
}
