//! Projection applier.
//!
//! Applies received events to the service's local copies of foreign
//! entities. Every operation is idempotent so redelivery is harmless:
//! - upsert inserts an unseen key, otherwise merges the carried fields
//! - delete removes the row if present; a missing row is not an error
//! - a reference to a row that does not exist yet creates a stub for it
//!
//! Events are applied in arrival order. Nothing reorders them, so an older
//! `UPDATED` arriving after a newer one wins.

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::bus::dispatch::HandlerMap;
use crate::envelope::EventEnvelope;
use crate::storage::{ProjectionStore, StorageError, UpsertOutcome};

mod schema;

pub use crate::storage::NaturalKey;
pub use schema::{Catalog, EntitySchema, Reference};

/// Failure to apply an event, classified for the consumer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApplyError {
    /// Retrying later may succeed (database busy, pool exhausted).
    #[error("Transient apply failure: {0}")]
    Transient(String),

    /// Retrying cannot succeed (missing key, payload of the wrong shape).
    #[error("Permanent apply failure: {0}")]
    Permanent(String),
}

impl ApplyError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ApplyError::Transient(_))
    }
}

impl From<StorageError> for ApplyError {
    fn from(e: StorageError) -> Self {
        if e.is_transient() {
            ApplyError::Transient(e.to_string())
        } else {
            ApplyError::Permanent(e.to_string())
        }
    }
}

/// What applying one envelope did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Upserted(UpsertOutcome),
    /// `true` if a row was removed.
    Deleted(bool),
    /// Entity or event type not projected by this service.
    Ignored,
}

/// Writes replicated events into a projection store.
pub struct ProjectionApplier {
    store: Arc<dyn ProjectionStore>,
    catalog: Arc<Catalog>,
}

impl ProjectionApplier {
    pub fn new(store: Arc<dyn ProjectionStore>, catalog: Arc<Catalog>) -> Self {
        Self { store, catalog }
    }

    pub fn store(&self) -> &Arc<dyn ProjectionStore> {
        &self.store
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Insert the row if absent, else overwrite only the fields present.
    pub async fn apply_upsert(
        &self,
        entity: &str,
        key: &NaturalKey,
        fields: &Map<String, Value>,
    ) -> Result<UpsertOutcome, ApplyError> {
        let outcome = self.store.upsert(entity, key, fields).await?;
        debug!(entity = %entity, key = %key, ?outcome, "Applied upsert");
        Ok(outcome)
    }

    /// Delete the row if present.
    pub async fn apply_delete(&self, entity: &str, key: &NaturalKey) -> Result<bool, ApplyError> {
        let removed = self.store.delete(entity, key).await?;
        if !removed {
            debug!(entity = %entity, key = %key, "Delete for absent row");
        }
        Ok(removed)
    }

    /// Apply an envelope according to its entity's schema.
    pub async fn apply(&self, envelope: &EventEnvelope) -> Result<ApplyOutcome, ApplyError> {
        let Some(schema) = self.catalog.get(&envelope.entity) else {
            return Ok(ApplyOutcome::Ignored);
        };
        let upsert = schema.upserts(&envelope.event_type);
        if !upsert && !schema.deletes(&envelope.event_type) {
            return Ok(ApplyOutcome::Ignored);
        }

        let fields = envelope.fields().ok_or_else(|| {
            ApplyError::Permanent(format!(
                "{} {} payload is not an object",
                envelope.entity, envelope.event_type
            ))
        })?;
        let key = NaturalKey::from_fields(fields, &schema.key_fields).ok_or_else(|| {
            ApplyError::Permanent(format!(
                "{} {} payload lacks key fields {:?}",
                envelope.entity, envelope.event_type, schema.key_fields
            ))
        })?;

        if !upsert {
            return Ok(ApplyOutcome::Deleted(
                self.apply_delete(&schema.name, &key).await?,
            ));
        }

        self.ensure_references(schema, fields).await?;
        Ok(ApplyOutcome::Upserted(
            self.apply_upsert(&schema.name, &key, fields).await?,
        ))
    }

    /// Create stub rows for referenced entities that are not present yet.
    async fn ensure_references(
        &self,
        schema: &EntitySchema,
        fields: &Map<String, Value>,
    ) -> Result<(), ApplyError> {
        for reference in &schema.references {
            let value = match fields.get(&reference.field) {
                None | Some(Value::Null) => continue,
                Some(value) => value,
            };
            let rendered = NaturalKey::render(value).ok_or_else(|| {
                ApplyError::Permanent(format!(
                    "{} reference {} is not a scalar",
                    schema.name, reference.field
                ))
            })?;
            let key = NaturalKey::new(rendered);
            let mut stub = Map::new();
            stub.insert(reference.key_field.clone(), value.clone());

            if self.store.insert_stub(&reference.entity, &key, &stub).await? {
                info!(
                    entity = %reference.entity,
                    key = %key,
                    referenced_by = %schema.name,
                    "Created stub row for missing reference"
                );
            }
        }
        Ok(())
    }

    /// Handlers for every `(entity, event_type)` the catalog projects.
    pub fn handlers(self: &Arc<Self>) -> HandlerMap {
        let mut handlers = HandlerMap::new();
        for schema in self.catalog.iter() {
            for event_type in schema.event_types() {
                let applier = Arc::clone(self);
                handlers.register(
                    schema.name.clone(),
                    event_type.clone(),
                    Arc::new(move |envelope: Arc<EventEnvelope>| {
                        let applier = Arc::clone(&applier);
                        async move { applier.apply(&envelope).await.map(|_| ()) }
                    }),
                );
            }
        }
        handlers
    }
}
