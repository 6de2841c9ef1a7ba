//! In-memory projection store.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::RwLock;

use super::{merge_fields, NaturalKey, ProjectionRow, ProjectionStore, Result, StorageError, UpsertOutcome};

type RowKey = (String, NaturalKey);

/// Projection store backed by a map. Used by tests and ephemeral replicas.
#[derive(Default)]
pub struct MemoryProjectionStore {
    rows: RwLock<BTreeMap<RowKey, ProjectionRow>>,
    unavailable: RwLock<bool>,
}

impl MemoryProjectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail with a transient error.
    pub async fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.write().await = unavailable;
    }

    async fn check_available(&self) -> Result<()> {
        if *self.unavailable.read().await {
            return Err(StorageError::Unavailable("memory store offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ProjectionStore for MemoryProjectionStore {
    async fn get(&self, entity: &str, key: &NaturalKey) -> Result<Option<ProjectionRow>> {
        self.check_available().await?;
        let rows = self.rows.read().await;
        Ok(rows.get(&(entity.to_string(), key.clone())).cloned())
    }

    async fn upsert(
        &self,
        entity: &str,
        key: &NaturalKey,
        fields: &Map<String, Value>,
    ) -> Result<UpsertOutcome> {
        self.check_available().await?;
        let mut rows = self.rows.write().await;
        let now = chrono::Utc::now();

        match rows.get_mut(&(entity.to_string(), key.clone())) {
            Some(row) => {
                let changed = merge_fields(&mut row.fields, fields);
                if !changed && !row.stub {
                    return Ok(UpsertOutcome::Unchanged);
                }
                row.stub = false;
                row.updated_at = now;
                Ok(UpsertOutcome::Updated)
            }
            None => {
                rows.insert(
                    (entity.to_string(), key.clone()),
                    ProjectionRow {
                        entity: entity.to_string(),
                        key: key.clone(),
                        fields: fields.clone(),
                        stub: false,
                        updated_at: now,
                    },
                );
                Ok(UpsertOutcome::Inserted)
            }
        }
    }

    async fn insert_stub(
        &self,
        entity: &str,
        key: &NaturalKey,
        fields: &Map<String, Value>,
    ) -> Result<bool> {
        self.check_available().await?;
        let mut rows = self.rows.write().await;
        let row_key = (entity.to_string(), key.clone());
        if rows.contains_key(&row_key) {
            return Ok(false);
        }
        rows.insert(
            row_key,
            ProjectionRow {
                entity: entity.to_string(),
                key: key.clone(),
                fields: fields.clone(),
                stub: true,
                updated_at: chrono::Utc::now(),
            },
        );
        Ok(true)
    }

    async fn delete(&self, entity: &str, key: &NaturalKey) -> Result<bool> {
        self.check_available().await?;
        let mut rows = self.rows.write().await;
        Ok(rows.remove(&(entity.to_string(), key.clone())).is_some())
    }

    async fn list(&self, entity: &str) -> Result<Vec<ProjectionRow>> {
        self.check_available().await?;
        let rows = self.rows.read().await;
        Ok(rows
            .values()
            .filter(|row| row.entity == entity)
            .cloned()
            .collect())
    }
}
