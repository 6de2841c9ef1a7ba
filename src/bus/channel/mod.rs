//! In-process broker for standalone mode and tests.
//!
//! Implements the same exchange/queue/binding and ack/reject semantics as an
//! AMQP broker, entirely in memory:
//! - fanout exchanges copy a message to every bound queue
//! - direct exchanges copy it to queues bound with the same routing key
//! - queues are shared by competing consumers with per-consumer prefetch
//! - unacked deliveries return to the front of their queue (flagged as
//!   redelivered) when rejected with requeue or when their channel closes
//!
//! Test hooks (`sever`, `set_reachable`, `connect_attempts`) simulate broker
//! outages without any external process.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{watch, Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, info};

use super::{Acker, BrokerChannel, BusError, Connector, Delivery, DeliveryStream, Result, Role};
use crate::topology::{Binding, Exchange, ExchangeKind, Queue};

/// Ready messages a queue holds before publishers see backpressure.
const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

#[derive(Debug, Clone)]
struct Message {
    body: Vec<u8>,
    routing_key: String,
    redelivered: bool,
}

struct QueueState {
    declared: Queue,
    ready: VecDeque<Message>,
}

struct Unacked {
    queue: String,
    channel: u64,
    consumer: u64,
    message: Message,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, Exchange>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    channels: HashMap<u64, watch::Sender<bool>>,
    unacked: HashMap<u64, Unacked>,
    next_channel: u64,
    next_consumer: u64,
    next_tag: u64,
}

impl BrokerState {
    /// Return a delivery to the front of its queue.
    fn requeue(&mut self, unacked: Unacked) {
        if let Some(queue) = self.queues.get_mut(&unacked.queue) {
            let mut message = unacked.message;
            message.redelivered = true;
            queue.ready.push_front(message);
        }
    }

    fn close_channel(&mut self, id: u64) {
        if let Some(open) = self.channels.remove(&id) {
            open.send_replace(false);
        }

        let mut tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, u)| u.channel == id)
            .map(|(tag, _)| *tag)
            .collect();
        // Highest tag first so push_front restores the original order.
        tags.sort_unstable_by(|a, b| b.cmp(a));
        for tag in tags {
            if let Some(unacked) = self.unacked.remove(&tag) {
                self.requeue(unacked);
            }
        }
    }
}

struct Inner {
    state: Mutex<BrokerState>,
    changed: Notify,
    reachable: AtomicBool,
    queue_capacity: usize,
    connect_attempts: Mutex<Vec<Instant>>,
}

/// In-memory broker shared by every service in one process.
///
/// Cloning yields another handle to the same broker.
#[derive(Clone)]
pub struct InProcessBroker {
    inner: Arc<Inner>,
}

impl Default for InProcessBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InProcessBroker {
    pub fn new() -> Self {
        Self::with_queue_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    /// Create a broker whose queues refuse new messages past `capacity`.
    pub fn with_queue_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(BrokerState::default()),
                changed: Notify::new(),
                reachable: AtomicBool::new(true),
                queue_capacity: capacity,
                connect_attempts: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Drop every open connection, as a broker restart or network cut would.
    ///
    /// Unacked deliveries go back to their queues.
    pub async fn sever(&self) {
        let mut state = self.inner.state.lock().await;
        let ids: Vec<u64> = state.channels.keys().copied().collect();
        for id in ids {
            state.close_channel(id);
        }
        drop(state);
        self.inner.changed.notify_waiters();
        info!("In-process broker severed all connections");
    }

    /// Control whether new connections succeed.
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Instants at which `connect` was called, successful or not.
    pub async fn connect_attempts(&self) -> Vec<Instant> {
        self.inner.connect_attempts.lock().await.clone()
    }

    /// Messages waiting in a queue (not counting unacked deliveries).
    pub async fn queue_depth(&self, queue: &str) -> usize {
        let state = self.inner.state.lock().await;
        state.queues.get(queue).map(|q| q.ready.len()).unwrap_or(0)
    }

    /// Deliveries from a queue that are still awaiting ack or reject.
    pub async fn unacked_count(&self, queue: &str) -> usize {
        let state = self.inner.state.lock().await;
        state.unacked.values().filter(|u| u.queue == queue).count()
    }

    pub async fn open_channels(&self) -> usize {
        self.inner.state.lock().await.channels.len()
    }
}

#[async_trait]
impl Connector for InProcessBroker {
    async fn connect(&self, url: &str, role: Role) -> Result<Arc<dyn BrokerChannel>> {
        self.inner.connect_attempts.lock().await.push(Instant::now());

        if !self.inner.reachable.load(Ordering::SeqCst) {
            return Err(BusError::Connect(format!("broker at {} is unreachable", url)));
        }

        let mut state = self.inner.state.lock().await;
        let id = state.next_channel;
        state.next_channel += 1;
        let (open_tx, open_rx) = watch::channel(true);
        state.channels.insert(id, open_tx);

        debug!(channel = id, role = %role, "Opened in-process channel");

        Ok(Arc::new(InProcessChannel {
            id,
            inner: self.inner.clone(),
            open: open_rx,
        }))
    }
}

/// One connection+channel on the in-process broker.
pub struct InProcessChannel {
    id: u64,
    inner: Arc<Inner>,
    open: watch::Receiver<bool>,
}

impl InProcessChannel {
    fn ensure_open(&self) -> Result<()> {
        if *self.open.borrow() {
            Ok(())
        } else {
            Err(BusError::NotConnected)
        }
    }
}

#[async_trait]
impl BrokerChannel for InProcessChannel {
    async fn declare_exchange(&self, exchange: &Exchange) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.inner.state.lock().await;
        match state.exchanges.get(&exchange.name) {
            Some(existing) if existing == exchange => Ok(()),
            Some(existing) => Err(BusError::TopologyConflict(format!(
                "exchange '{}' exists as {}, cannot redeclare as {}",
                exchange.name, existing.kind, exchange.kind
            ))),
            None => {
                state
                    .exchanges
                    .insert(exchange.name.clone(), exchange.clone());
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, queue: &Queue) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.inner.state.lock().await;
        match state.queues.get(&queue.name) {
            Some(existing) if existing.declared == *queue => Ok(()),
            Some(_) => Err(BusError::TopologyConflict(format!(
                "queue '{}' exists with a different shape",
                queue.name
            ))),
            None => {
                state.queues.insert(
                    queue.name.clone(),
                    QueueState {
                        declared: queue.clone(),
                        ready: VecDeque::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn bind(&self, binding: &Binding) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.inner.state.lock().await;

        let kind = state
            .exchanges
            .get(&binding.exchange)
            .map(|e| e.kind)
            .ok_or_else(|| {
                BusError::TopologyConflict(format!("no exchange '{}'", binding.exchange))
            })?;
        if !state.queues.contains_key(&binding.queue) {
            return Err(BusError::TopologyConflict(format!(
                "no queue '{}'",
                binding.queue
            )));
        }

        let mut binding = binding.clone();
        if kind == ExchangeKind::Fanout {
            binding.routing_key.clear();
        }
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, body: Vec<u8>) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.inner.state.lock().await;

        let kind = state
            .exchanges
            .get(exchange)
            .map(|e| e.kind)
            .ok_or_else(|| BusError::Publish(format!("no exchange '{}'", exchange)))?;

        let mut targets: Vec<String> = state
            .bindings
            .iter()
            .filter(|b| b.exchange == exchange)
            .filter(|b| kind == ExchangeKind::Fanout || b.routing_key == routing_key)
            .map(|b| b.queue.clone())
            .collect();
        targets.sort();
        targets.dedup();

        let full = targets.iter().any(|name| {
            state
                .queues
                .get(name)
                .is_some_and(|q| q.ready.len() >= self.inner.queue_capacity)
        });
        if full {
            return Err(BusError::Backpressure);
        }

        for name in &targets {
            if let Some(queue) = state.queues.get_mut(name) {
                queue.ready.push_back(Message {
                    body: body.clone(),
                    routing_key: routing_key.to_string(),
                    redelivered: false,
                });
            }
        }
        drop(state);

        if targets.is_empty() {
            debug!(exchange = %exchange, routing_key = %routing_key, "Message unroutable, dropped");
        }
        self.inner.changed.notify_waiters();
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> Result<DeliveryStream> {
        self.ensure_open()?;
        let consumer = {
            let mut state = self.inner.state.lock().await;
            if !state.queues.contains_key(queue) {
                return Err(BusError::Subscribe(format!("no queue '{}'", queue)));
            }
            let consumer = state.next_consumer;
            state.next_consumer += 1;
            consumer
        };

        debug!(queue = %queue, consumer_tag = %consumer_tag, "In-process consumer started");

        let cursor = Cursor {
            inner: self.inner.clone(),
            channel: self.id,
            consumer,
            queue: queue.to_string(),
            prefetch: usize::from(prefetch),
            open: self.open.clone(),
        };

        let stream = futures::stream::unfold(cursor, |cursor| async move {
            let delivery = cursor.next_delivery().await?;
            Some((Ok(delivery), cursor))
        });
        Ok(stream.boxed())
    }

    fn is_open(&self) -> bool {
        *self.open.borrow()
    }

    async fn closed(&self) {
        let mut open = self.open.clone();
        let _ = open.wait_for(|open| !*open).await;
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        state.close_channel(self.id);
        drop(state);
        self.inner.changed.notify_waiters();
        Ok(())
    }
}

/// Consumer position on one queue.
struct Cursor {
    inner: Arc<Inner>,
    channel: u64,
    consumer: u64,
    queue: String,
    prefetch: usize,
    open: watch::Receiver<bool>,
}

impl Cursor {
    /// Wait for the next ready message within the prefetch window.
    ///
    /// Returns `None` once the channel closes.
    async fn next_delivery(&self) -> Option<Delivery> {
        loop {
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !*self.open.borrow() {
                return None;
            }

            {
                let mut state = self.inner.state.lock().await;
                let outstanding = state
                    .unacked
                    .values()
                    .filter(|u| u.consumer == self.consumer)
                    .count();

                if self.prefetch == 0 || outstanding < self.prefetch {
                    let message = state
                        .queues
                        .get_mut(&self.queue)
                        .and_then(|q| q.ready.pop_front());

                    if let Some(message) = message {
                        let tag = state.next_tag;
                        state.next_tag += 1;
                        state.unacked.insert(
                            tag,
                            Unacked {
                                queue: self.queue.clone(),
                                channel: self.channel,
                                consumer: self.consumer,
                                message: message.clone(),
                            },
                        );
                        return Some(Delivery::new(
                            message.body,
                            message.routing_key,
                            message.redelivered,
                            Box::new(InProcessAcker {
                                inner: self.inner.clone(),
                                tag,
                            }),
                        ));
                    }
                }
            }

            notified.await;
        }
    }
}

struct InProcessAcker {
    inner: Arc<Inner>,
    tag: u64,
}

#[async_trait]
impl Acker for InProcessAcker {
    async fn ack(&self) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        state
            .unacked
            .remove(&self.tag)
            .ok_or_else(|| BusError::Settle(format!("unknown delivery tag {}", self.tag)))?;
        drop(state);
        self.inner.changed.notify_waiters();
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        let unacked = state
            .unacked
            .remove(&self.tag)
            .ok_or_else(|| BusError::Settle(format!("unknown delivery tag {}", self.tag)))?;
        if requeue {
            state.requeue(unacked);
        }
        drop(state);
        self.inner.changed.notify_waiters();
        Ok(())
    }
}
