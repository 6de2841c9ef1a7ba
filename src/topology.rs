//! Broker topology: exchanges, durable queues and the bindings between them.
//!
//! A `Topology` is a declarative value. Every service that emits or consumes
//! a topic declares the same shape on startup; declarations are idempotent
//! and order independent, so services converge on one broker layout without
//! coordinating. Redeclaring a name with a different shape is a
//! `TopologyConflict` and must stop the service.

use serde::Deserialize;
use tracing::{debug, info};

use crate::bus::{BrokerChannel, BusError, Result};

/// Exchange routing behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    /// Deliver to every bound queue; routing keys are ignored.
    Fanout,
    /// Deliver to queues bound with a matching routing key.
    Direct,
}

impl std::fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExchangeKind::Fanout => f.write_str("fanout"),
            ExchangeKind::Direct => f.write_str("direct"),
        }
    }
}

fn durable_default() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Exchange {
    pub name: String,
    pub kind: ExchangeKind,
    #[serde(default = "durable_default")]
    pub durable: bool,
}

impl Exchange {
    pub fn fanout(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ExchangeKind::Fanout,
            durable: true,
        }
    }

    pub fn direct(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ExchangeKind::Direct,
            durable: true,
        }
    }
}

/// A queue owned by one consuming service for one topic.
///
/// Queues are non-exclusive so several instances of a service can share the
/// load of one queue.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Queue {
    pub name: String,
    #[serde(default = "durable_default")]
    pub durable: bool,
    #[serde(default)]
    pub exclusive: bool,
}

impl Queue {
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            exclusive: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
pub struct Binding {
    pub queue: String,
    pub exchange: String,
    #[serde(default)]
    pub routing_key: String,
}

/// Declarative broker layout for one service.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Topology {
    exchanges: Vec<Exchange>,
    queues: Vec<Queue>,
    bindings: Vec<Binding>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exchanges(&self) -> &[Exchange] {
        &self.exchanges
    }

    pub fn queues(&self) -> &[Queue] {
        &self.queues
    }

    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }

    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty() && self.queues.is_empty() && self.bindings.is_empty()
    }

    pub fn exchange(&self, name: &str) -> Option<&Exchange> {
        self.exchanges.iter().find(|e| e.name == name)
    }

    /// Declare an exchange. No-op when an identical exchange exists.
    pub fn declare_exchange(
        &mut self,
        name: impl Into<String>,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<&mut Self> {
        let exchange = Exchange {
            name: name.into(),
            kind,
            durable,
        };
        self.add_exchange(exchange)?;
        Ok(self)
    }

    /// Declare a queue. No-op when an identical queue exists.
    pub fn declare_queue(
        &mut self,
        name: impl Into<String>,
        durable: bool,
        exclusive: bool,
    ) -> Result<&mut Self> {
        let queue = Queue {
            name: name.into(),
            durable,
            exclusive,
        };
        self.add_queue(queue)?;
        Ok(self)
    }

    /// Bind a declared queue to a declared exchange.
    ///
    /// The routing key is dropped for fanout exchanges and must be non-empty
    /// for direct exchanges.
    pub fn bind(
        &mut self,
        queue: impl Into<String>,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Result<&mut Self> {
        let binding = Binding {
            queue: queue.into(),
            exchange: exchange.into(),
            routing_key: routing_key.into(),
        };
        self.add_binding(binding)?;
        Ok(self)
    }

    /// Fold another topology into this one.
    ///
    /// Merging is commutative: `a.merge(b)` and `b.merge(a)` declare the same
    /// set, or both fail with the same conflict.
    pub fn merge(&mut self, other: &Topology) -> Result<()> {
        for exchange in &other.exchanges {
            self.add_exchange(exchange.clone())?;
        }
        for queue in &other.queues {
            self.add_queue(queue.clone())?;
        }
        for binding in &other.bindings {
            self.add_binding(binding.clone())?;
        }
        Ok(())
    }

    /// Re-check a topology built outside the `declare_*` methods (e.g. from
    /// configuration).
    pub fn validate(&self) -> Result<Topology> {
        let mut checked = Topology::new();
        checked.merge(self)?;
        Ok(checked)
    }

    /// Declare every exchange, queue and binding on a live broker channel.
    pub async fn apply(&self, channel: &dyn BrokerChannel) -> Result<()> {
        let checked = self.validate()?;

        for exchange in &checked.exchanges {
            channel.declare_exchange(exchange).await?;
            debug!(exchange = %exchange.name, kind = %exchange.kind, "Declared exchange");
        }
        for queue in &checked.queues {
            channel.declare_queue(queue).await?;
            debug!(queue = %queue.name, "Declared queue");
        }
        for binding in &checked.bindings {
            channel.bind(binding).await?;
            debug!(
                queue = %binding.queue,
                exchange = %binding.exchange,
                routing_key = %binding.routing_key,
                "Bound queue to exchange"
            );
        }

        if !checked.is_empty() {
            info!(
                exchanges = checked.exchanges.len(),
                queues = checked.queues.len(),
                bindings = checked.bindings.len(),
                "Topology declared"
            );
        }
        Ok(())
    }

    fn add_exchange(&mut self, exchange: Exchange) -> Result<()> {
        match self.exchanges.iter().find(|e| e.name == exchange.name) {
            Some(existing) if *existing == exchange => Ok(()),
            Some(existing) => Err(BusError::TopologyConflict(format!(
                "exchange '{}' already declared as {} (durable={}), redeclared as {} (durable={})",
                exchange.name, existing.kind, existing.durable, exchange.kind, exchange.durable
            ))),
            None => {
                self.exchanges.push(exchange);
                Ok(())
            }
        }
    }

    fn add_queue(&mut self, queue: Queue) -> Result<()> {
        match self.queues.iter().find(|q| q.name == queue.name) {
            Some(existing) if *existing == queue => Ok(()),
            Some(_) => Err(BusError::TopologyConflict(format!(
                "queue '{}' redeclared with a different shape",
                queue.name
            ))),
            None => {
                self.queues.push(queue);
                Ok(())
            }
        }
    }

    fn add_binding(&mut self, mut binding: Binding) -> Result<()> {
        let kind = self
            .exchange(&binding.exchange)
            .map(|e| e.kind)
            .ok_or_else(|| {
                BusError::TopologyConflict(format!(
                    "binding of queue '{}' references undeclared exchange '{}'",
                    binding.queue, binding.exchange
                ))
            })?;

        if !self.queues.iter().any(|q| q.name == binding.queue) {
            return Err(BusError::TopologyConflict(format!(
                "binding references undeclared queue '{}'",
                binding.queue
            )));
        }

        match kind {
            ExchangeKind::Fanout => binding.routing_key.clear(),
            ExchangeKind::Direct if binding.routing_key.is_empty() => {
                return Err(BusError::TopologyConflict(format!(
                    "binding of queue '{}' to direct exchange '{}' requires a routing key",
                    binding.queue, binding.exchange
                )));
            }
            ExchangeKind::Direct => {}
        }

        if !self.bindings.contains(&binding) {
            self.bindings.push(binding);
        }
        Ok(())
    }
}
