//! Event publisher.
//!
//! Hands domain events to their exchange after the caller has committed its
//! own local write. Publishing is best effort: the result is a plain `bool`
//! so a broker outage can never abort or block the caller's request path.
//! `false` means "not guaranteed delivered" and covers three cases:
//! - the payload could not be serialized (checked before any network call)
//! - the supervisor has no live channel
//! - the transport is applying backpressure
//!
//! There is no outbox: a crash between the caller's commit and `publish`
//! loses that event.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use super::supervisor::ConnectionSupervisor;
use super::BusError;
use crate::envelope::{EnvelopeError, EventEnvelope, EventType};

/// Where events for one entity are published.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PublishRoute {
    pub entity: String,
    pub exchange: String,
    /// Required for direct exchanges; ignored by fanout exchanges.
    #[serde(default)]
    pub routing_key: String,
}

impl PublishRoute {
    pub fn fanout(entity: impl Into<String>, exchange: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            exchange: exchange.into(),
            routing_key: String::new(),
        }
    }

    pub fn direct(
        entity: impl Into<String>,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        Self {
            entity: entity.into(),
            exchange: exchange.into(),
            routing_key: routing_key.into(),
        }
    }
}

/// Publishes envelopes through a supervised connection.
pub struct EventPublisher {
    supervisor: Arc<ConnectionSupervisor>,
    routes: HashMap<String, PublishRoute>,
    default_exchange: Option<String>,
}

impl EventPublisher {
    pub fn new(supervisor: Arc<ConnectionSupervisor>) -> Self {
        Self {
            supervisor,
            routes: HashMap::new(),
            default_exchange: None,
        }
    }

    pub fn with_route(mut self, route: PublishRoute) -> Self {
        self.routes.insert(route.entity.clone(), route);
        self
    }

    pub fn with_routes(mut self, routes: impl IntoIterator<Item = PublishRoute>) -> Self {
        for route in routes {
            self.routes.insert(route.entity.clone(), route);
        }
        self
    }

    /// Fanout exchange used for entities without an explicit route.
    pub fn with_default_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.default_exchange = Some(exchange.into());
        self
    }

    /// Build and encode an envelope without sending it.
    ///
    /// Exposes the synchronous serialization failure that `publish` only logs.
    pub fn encode<T: Serialize + ?Sized>(
        entity: &str,
        event_type: impl Into<EventType>,
        payload: &T,
    ) -> Result<Vec<u8>, EnvelopeError> {
        EventEnvelope::from_payload(entity, event_type, payload)?.encode()
    }

    /// Publish one domain event. Returns `false` if delivery is not
    /// guaranteed; never blocks on a full or absent broker.
    #[tracing::instrument(name = "bus.publish", skip_all, fields(entity = %entity))]
    pub async fn publish<T: Serialize + ?Sized>(
        &self,
        entity: &str,
        event_type: impl Into<EventType>,
        payload: &T,
    ) -> bool {
        match EventEnvelope::from_payload(entity, event_type, payload) {
            Ok(envelope) => self.publish_envelope(&envelope).await,
            Err(e) => {
                error!(error = %e, "Rejected unserializable payload");
                false
            }
        }
    }

    /// Publish a prebuilt envelope.
    pub async fn publish_envelope(&self, envelope: &EventEnvelope) -> bool {
        let body = match envelope.encode() {
            Ok(body) => body,
            Err(e) => {
                error!(entity = %envelope.entity, error = %e, "Rejected unserializable envelope");
                return false;
            }
        };

        let Some((exchange, routing_key)) = self.route(&envelope.entity) else {
            warn!(entity = %envelope.entity, "No route for entity, event not published");
            return false;
        };

        let Some(channel) = self.supervisor.channel() else {
            warn!(
                entity = %envelope.entity,
                event_type = %envelope.event_type,
                "Not connected to broker, event not published"
            );
            return false;
        };

        match channel.publish(exchange, routing_key, body).await {
            Ok(()) => {
                debug!(
                    exchange = %exchange,
                    routing_key = %routing_key,
                    event_type = %envelope.event_type,
                    "Published event"
                );
                true
            }
            Err(BusError::Backpressure) => {
                warn!(exchange = %exchange, "Broker buffer full, event not published");
                false
            }
            Err(e) => {
                warn!(exchange = %exchange, error = %e, "Publish failed");
                false
            }
        }
    }

    fn route(&self, entity: &str) -> Option<(&str, &str)> {
        match self.routes.get(entity) {
            Some(route) => Some((route.exchange.as_str(), route.routing_key.as_str())),
            None => self.default_exchange.as_deref().map(|exchange| (exchange, "")),
        }
    }
}
