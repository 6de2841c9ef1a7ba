//! Handler dispatch.
//!
//! Routes a received envelope to the handler registered for its
//! `(entity, event_type)` and turns the outcome into a broker settlement:
//!
//! | outcome                       | settlement        |
//! |-------------------------------|-------------------|
//! | handler succeeded             | ack               |
//! | no handler registered         | ack (ignored)     |
//! | malformed envelope            | reject, drop      |
//! | `ApplyError::Transient`       | reject, requeue   |
//! | `ApplyError::Permanent`       | reject, drop      |
//!
//! Dropped messages are only logged; there is no dead-letter exchange.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, error, warn, Instrument};

use super::Delivery;
use crate::envelope::{EventEnvelope, EventType};
use crate::projection::ApplyError;

/// Handler for one kind of replicated event.
pub trait EnvelopeHandler: Send + Sync {
    /// Apply an envelope. Errors decide between requeue and drop.
    fn handle(&self, envelope: Arc<EventEnvelope>) -> BoxFuture<'static, Result<(), ApplyError>>;
}

impl<F, Fut> EnvelopeHandler for F
where
    F: Fn(Arc<EventEnvelope>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), ApplyError>> + Send + 'static,
{
    fn handle(&self, envelope: Arc<EventEnvelope>) -> BoxFuture<'static, Result<(), ApplyError>> {
        Box::pin(self(envelope))
    }
}

/// Handlers keyed by `(entity, event_type)`.
#[derive(Clone, Default)]
pub struct HandlerMap {
    handlers: HashMap<(String, EventType), Arc<dyn EnvelopeHandler>>,
}

impl HandlerMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one for the same key.
    pub fn register(
        &mut self,
        entity: impl Into<String>,
        event_type: impl Into<EventType>,
        handler: Arc<dyn EnvelopeHandler>,
    ) -> &mut Self {
        self.handlers
            .insert((entity.into(), event_type.into()), handler);
        self
    }

    pub fn with(
        mut self,
        entity: impl Into<String>,
        event_type: impl Into<EventType>,
        handler: Arc<dyn EnvelopeHandler>,
    ) -> Self {
        self.register(entity, event_type, handler);
        self
    }

    pub fn get(&self, entity: &str, event_type: &EventType) -> Option<&Arc<dyn EnvelopeHandler>> {
        self.handlers
            .get(&(entity.to_string(), event_type.clone()))
    }

    /// Keep only handlers for the given entities.
    pub fn retain_entities(&mut self, entities: &[String]) {
        self.handlers
            .retain(|(entity, _), _| entities.iter().any(|e| e == entity));
    }

    pub fn extend(&mut self, other: HandlerMap) {
        self.handlers.extend(other.handlers);
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<String> = self
            .handlers
            .keys()
            .map(|(entity, event_type)| format!("{}:{}", entity, event_type))
            .collect();
        keys.sort();
        f.debug_struct("HandlerMap").field("handlers", &keys).finish()
    }
}

/// Final state of one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Handled, or deliberately ignored.
    Acked,
    /// Returned to the queue for another attempt.
    Requeued,
    /// Discarded: poison message or permanent failure.
    Dropped,
}

/// Decode, dispatch and settle one delivery.
///
/// Settlement errors are logged; the broker redelivers unsettled messages
/// once the channel closes.
pub async fn process_delivery(delivery: Delivery, handlers: &HandlerMap) -> Disposition {
    let envelope = match EventEnvelope::decode(&delivery.body) {
        Ok(envelope) => Arc::new(envelope),
        Err(e) => {
            error!(
                routing_key = %delivery.routing_key,
                error = %e,
                "Dropping malformed message"
            );
            settle(delivery, Disposition::Dropped).await;
            return Disposition::Dropped;
        }
    };

    let span = tracing::info_span!(
        "bus.consume",
        entity = %envelope.entity,
        event_type = %envelope.event_type,
        redelivered = delivery.redelivered,
    );

    let disposition = dispatch(envelope, handlers).instrument(span).await;
    settle(delivery, disposition).await;
    disposition
}

async fn dispatch(envelope: Arc<EventEnvelope>, handlers: &HandlerMap) -> Disposition {
    let handler = match handlers.get(&envelope.entity, &envelope.event_type) {
        Some(handler) => Arc::clone(handler),
        None => {
            debug!("No handler registered, acknowledging");
            return Disposition::Acked;
        }
    };

    match handler.handle(Arc::clone(&envelope)).await {
        Ok(()) => {
            debug!("Event applied");
            Disposition::Acked
        }
        Err(ApplyError::Transient(message)) => {
            warn!(error = %message, "Transient apply failure, requeueing");
            Disposition::Requeued
        }
        Err(ApplyError::Permanent(message)) => {
            error!(
                error = %message,
                payload = %envelope.payload,
                "Permanent apply failure, dropping message"
            );
            Disposition::Dropped
        }
    }
}

async fn settle(delivery: Delivery, disposition: Disposition) {
    let result = match disposition {
        Disposition::Acked => delivery.ack().await,
        Disposition::Requeued => delivery.reject(true).await,
        Disposition::Dropped => delivery.reject(false).await,
    };
    if let Err(e) = result {
        error!(?disposition, error = %e, "Failed to settle delivery");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{Acker, Result as BusResult};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingAcker {
        settled: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Acker for RecordingAcker {
        async fn ack(&self) -> BusResult<()> {
            self.settled.lock().unwrap().push("ack");
            Ok(())
        }

        async fn reject(&self, requeue: bool) -> BusResult<()> {
            self.settled
                .lock()
                .unwrap()
                .push(if requeue { "requeue" } else { "drop" });
            Ok(())
        }
    }

    fn delivery(body: Vec<u8>) -> (Delivery, Arc<Mutex<Vec<&'static str>>>) {
        let settled = Arc::new(Mutex::new(Vec::new()));
        let acker = RecordingAcker {
            settled: settled.clone(),
        };
        (Delivery::new(body, "", false, Box::new(acker)), settled)
    }

    fn envelope_bytes(entity: &str, event_type: &str) -> Vec<u8> {
        EventEnvelope::new(entity, event_type, json!({"id": 1}))
            .encode()
            .unwrap()
    }

    fn counting(count: Arc<AtomicUsize>, result: fn() -> Result<(), ApplyError>) -> HandlerMap {
        HandlerMap::new().with(
            "course",
            EventType::Updated,
            Arc::new(move |_envelope: Arc<EventEnvelope>| {
                count.fetch_add(1, Ordering::SeqCst);
                async move { result() }
            }),
        )
    }

    #[tokio::test]
    async fn test_success_acks() {
        let count = Arc::new(AtomicUsize::new(0));
        let handlers = counting(count.clone(), || Ok(()));
        let (delivery, settled) = delivery(envelope_bytes("course", "UPDATED"));

        let disposition = process_delivery(delivery, &handlers).await;

        assert_eq!(disposition, Disposition::Acked);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(*settled.lock().unwrap(), vec!["ack"]);
    }

    #[tokio::test]
    async fn test_unregistered_event_is_acked_without_handling() {
        let count = Arc::new(AtomicUsize::new(0));
        let handlers = counting(count.clone(), || Ok(()));
        let (delivery, settled) = delivery(envelope_bytes("course", "COURSE_ARCHIVED"));

        let disposition = process_delivery(delivery, &handlers).await;

        assert_eq!(disposition, Disposition::Acked);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(*settled.lock().unwrap(), vec!["ack"]);
    }

    #[tokio::test]
    async fn test_malformed_message_is_dropped() {
        let handlers = HandlerMap::new();
        let (delivery, settled) = delivery(b"not json at all".to_vec());

        let disposition = process_delivery(delivery, &handlers).await;

        assert_eq!(disposition, Disposition::Dropped);
        assert_eq!(*settled.lock().unwrap(), vec!["drop"]);
    }

    #[tokio::test]
    async fn test_transient_failure_requeues() {
        let count = Arc::new(AtomicUsize::new(0));
        let handlers = counting(count, || {
            Err(ApplyError::Transient("database is locked".to_string()))
        });
        let (delivery, settled) = delivery(envelope_bytes("course", "UPDATED"));

        assert_eq!(
            process_delivery(delivery, &handlers).await,
            Disposition::Requeued
        );
        assert_eq!(*settled.lock().unwrap(), vec!["requeue"]);
    }

    #[tokio::test]
    async fn test_permanent_failure_drops() {
        let count = Arc::new(AtomicUsize::new(0));
        let handlers = counting(count, || {
            Err(ApplyError::Permanent("missing key field".to_string()))
        });
        let (delivery, settled) = delivery(envelope_bytes("course", "UPDATED"));

        assert_eq!(
            process_delivery(delivery, &handlers).await,
            Disposition::Dropped
        );
        assert_eq!(*settled.lock().unwrap(), vec!["drop"]);
    }

    #[test]
    fn test_retain_entities() {
        let noop = Arc::new(|_e: Arc<EventEnvelope>| async { Ok::<(), ApplyError>(()) });
        let mut handlers = HandlerMap::new()
            .with("course", EventType::Created, noop.clone())
            .with("user", EventType::Created, noop);

        handlers.retain_entities(&["course".to_string()]);

        assert_eq!(handlers.len(), 1);
        assert!(handlers.get("course", &EventType::Created).is_some());
        assert!(handlers.get("user", &EventType::Created).is_none());
    }
}
