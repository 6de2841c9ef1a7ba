//! Event consumer.
//!
//! Each subscription runs two tasks joined by a bounded channel:
//!
//! ```text
//! [broker channel] -> delivery loop -> mpsc -> processing task -> handler
//!                                                      |
//!                                              ack / reject(requeue?)
//! ```
//!
//! The delivery loop follows the supervisor's channel, so consumption pauses
//! while disconnected and resumes on the next channel. The processing task
//! settles each message before taking the next one. Several subscriptions
//! (in one or several processes) may share a durable queue; ordering across
//! them is not guaranteed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::dispatch::{process_delivery, Disposition, HandlerMap};
use super::supervisor::ConnectionSupervisor;
use super::Delivery;

fn default_prefetch() -> u16 {
    16
}

/// One queue subscription.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Subscription {
    pub queue: String,
    /// Unacked deliveries the broker may push ahead of processing.
    #[serde(default = "default_prefetch")]
    pub prefetch: u16,
    /// Restrict the registered handlers to these entities.
    #[serde(default)]
    pub entities: Option<Vec<String>>,
}

impl Subscription {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            prefetch: default_prefetch(),
            entities: None,
        }
    }

    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    /// Local buffer between the delivery loop and the processing task.
    fn buffer(&self) -> usize {
        usize::from(self.prefetch.max(1))
    }
}

/// Settlement counters for one subscription.
#[derive(Debug, Default)]
pub struct ConsumerStats {
    acked: AtomicU64,
    requeued: AtomicU64,
    dropped: AtomicU64,
}

impl ConsumerStats {
    fn record(&self, disposition: Disposition) {
        let counter = match disposition {
            Disposition::Acked => &self.acked,
            Disposition::Requeued => &self.requeued,
            Disposition::Dropped => &self.dropped,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn acked(&self) -> u64 {
        self.acked.load(Ordering::Relaxed)
    }

    pub fn requeued(&self) -> u64 {
        self.requeued.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn settled(&self) -> u64 {
        self.acked() + self.requeued() + self.dropped()
    }
}

/// Running subscription.
pub struct ConsumerHandle {
    queue: String,
    stats: Arc<ConsumerStats>,
    shutdown: watch::Sender<bool>,
    delivery_task: JoinHandle<()>,
    processing_task: JoinHandle<()>,
}

impl ConsumerHandle {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn stats(&self) -> Arc<ConsumerStats> {
        self.stats.clone()
    }

    /// Stop taking deliveries, let the in-flight message settle, requeue
    /// anything buffered but not yet started, then return.
    pub async fn shutdown(self) {
        self.shutdown.send_replace(true);
        if let Err(e) = self.delivery_task.await {
            error!(queue = %self.queue, error = %e, "Delivery loop panicked");
        }
        if let Err(e) = self.processing_task.await {
            error!(queue = %self.queue, error = %e, "Processing task panicked");
        }
        info!(queue = %self.queue, "Consumer stopped");
    }
}

/// Entry point for queue subscriptions.
pub struct EventConsumer;

impl EventConsumer {
    /// Subscribe `handlers` to a queue on the supervisor's connection.
    ///
    /// The queue must be part of the supervisor's topology (or otherwise
    /// declared). Consumption starts as soon as a channel is available.
    pub fn subscribe(
        supervisor: Arc<ConnectionSupervisor>,
        subscription: Subscription,
        mut handlers: HandlerMap,
    ) -> ConsumerHandle {
        if let Some(entities) = &subscription.entities {
            handlers.retain_entities(entities);
        }

        let (tx, rx) = mpsc::channel(subscription.buffer());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(ConsumerStats::default());
        let consumer_tag = format!(
            "{}-{}-{}",
            supervisor.service(),
            subscription.queue,
            uuid::Uuid::new_v4()
        );

        info!(
            queue = %subscription.queue,
            prefetch = subscription.prefetch,
            handlers = ?handlers,
            "Subscribing to queue"
        );

        let delivery_task = tokio::spawn(delivery_loop(
            supervisor,
            subscription.clone(),
            consumer_tag,
            tx,
            shutdown_rx.clone(),
        ));
        let processing_task = tokio::spawn(processing_loop(
            subscription.queue.clone(),
            handlers,
            rx,
            shutdown_rx,
            stats.clone(),
        ));

        ConsumerHandle {
            queue: subscription.queue,
            stats,
            shutdown: shutdown_tx,
            delivery_task,
            processing_task,
        }
    }
}

/// Pull deliveries off the broker into the local buffer, following channel
/// replacements made by the supervisor.
async fn delivery_loop(
    supervisor: Arc<ConnectionSupervisor>,
    subscription: Subscription,
    consumer_tag: String,
    tx: mpsc::Sender<Delivery>,
    mut shutdown: watch::Receiver<bool>,
) {
    let queue = subscription.queue.as_str();
    let mut channels = supervisor.channels();

    loop {
        if *shutdown.borrow() {
            return;
        }

        let channel = channels.borrow_and_update().clone();
        if let Some(channel) = channel.filter(|c| c.is_open()) {
            match channel
                .consume(queue, &consumer_tag, subscription.prefetch)
                .await
            {
                Ok(mut stream) => {
                    info!(queue = %queue, consumer_tag = %consumer_tag, "Consumer connected");
                    loop {
                        tokio::select! {
                            _ = shutdown.changed() => return,
                            next = stream.next() => match next {
                                Some(Ok(delivery)) => {
                                    if let Err(mpsc::error::SendError(delivery)) = tx.send(delivery).await {
                                        // Processing already stopped.
                                        if let Err(e) = delivery.reject(true).await {
                                            warn!(queue = %queue, error = %e, "Failed to return delivery");
                                        }
                                        return;
                                    }
                                }
                                Some(Err(e)) => {
                                    warn!(queue = %queue, error = %e, "Delivery error, waiting for reconnect");
                                    break;
                                }
                                None => {
                                    info!(queue = %queue, "Delivery stream ended, waiting for reconnect");
                                    break;
                                }
                            }
                        }
                    }
                }
                Err(e) => {
                    error!(queue = %queue, error = %e, "Failed to start consuming");
                }
            }
        }

        tokio::select! {
            _ = shutdown.changed() => return,
            changed = channels.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}

/// Settle buffered deliveries one at a time.
async fn processing_loop(
    queue: String,
    handlers: HandlerMap,
    mut rx: mpsc::Receiver<Delivery>,
    mut shutdown: watch::Receiver<bool>,
    stats: Arc<ConsumerStats>,
) {
    loop {
        let delivery = tokio::select! {
            biased;
            _ = shutdown.wait_for(|stop| *stop) => break,
            delivery = rx.recv() => match delivery {
                Some(delivery) => delivery,
                None => break,
            },
        };

        let disposition = process_delivery(delivery, &handlers).await;
        stats.record(disposition);
    }

    rx.close();
    let mut returned = 0usize;
    while let Ok(delivery) = rx.try_recv() {
        if let Err(e) = delivery.reject(true).await {
            warn!(queue = %queue, error = %e, "Failed to return buffered delivery");
        }
        returned += 1;
    }
    if returned > 0 {
        info!(queue = %queue, returned, "Returned buffered deliveries to the broker");
    }
}
