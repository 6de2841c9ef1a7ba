//! Projection storage.
//!
//! A projection store holds the consuming service's local copies of foreign
//! entities, one row per `(entity, natural key)`. Writes are merges: an
//! upsert overwrites only the fields it carries, so replaying the same event
//! leaves the row unchanged.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
#[cfg(not(feature = "sqlite"))]
use tracing::error;
use tracing::info;

use crate::config::{StorageConfig, StorageType};

pub mod mock;
#[cfg(feature = "sqlite")]
pub mod schema;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use mock::MemoryProjectionStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteProjectionStore;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors raised by projection stores.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[cfg(feature = "sqlite")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Corrupt row {entity}/{key}: {reason}")]
    Corrupt {
        entity: String,
        key: String,
        reason: String,
    },

    #[error("Unknown storage type: {0}")]
    UnknownType(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    /// Whether retrying the same write later may succeed.
    ///
    /// Pool exhaustion, I/O failures and SQLite `BUSY`/`LOCKED` are
    /// transient; constraint violations and corrupt rows are not.
    pub fn is_transient(&self) -> bool {
        match self {
            #[cfg(feature = "sqlite")]
            StorageError::Database(e) => match e {
                sqlx::Error::PoolTimedOut
                | sqlx::Error::PoolClosed
                | sqlx::Error::Io(_)
                | sqlx::Error::WorkerCrashed => true,
                sqlx::Error::Database(db) => db
                    .code()
                    .and_then(|code| code.parse::<i32>().ok())
                    .map(|code| matches!(code & 0xff, SQLITE_BUSY | SQLITE_LOCKED))
                    .unwrap_or(false),
                _ => false,
            },
            StorageError::Unavailable(_) | StorageError::Io(_) => true,
            StorageError::Corrupt { .. } | StorageError::UnknownType(_) => false,
        }
    }
}

#[cfg(feature = "sqlite")]
const SQLITE_BUSY: i32 = 5;
#[cfg(feature = "sqlite")]
const SQLITE_LOCKED: i32 = 6;

/// Natural key of a projected row.
///
/// Built from the entity's key fields. Strings are used verbatim, numbers
/// and booleans as their JSON text, so `7` and `"7"` address the same row.
/// Composite keys join their components with `/` after escaping `\` and
/// `/` inside each component, so distinct tuples never share a key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NaturalKey(String);

impl NaturalKey {
    pub const SEPARATOR: &'static str = "/";
    const ESCAPE: char = '\\';

    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Render the key from `fields`. `None` if any key field is missing,
    /// null, or not a scalar.
    pub fn from_fields(fields: &Map<String, Value>, key_fields: &[String]) -> Option<Self> {
        if key_fields.is_empty() {
            return None;
        }
        if let [field] = key_fields {
            return Self::render(fields.get(field)?).map(Self);
        }
        let mut parts = Vec::with_capacity(key_fields.len());
        for field in key_fields {
            parts.push(Self::escape(&Self::render(fields.get(field)?)?));
        }
        Some(Self(parts.join(Self::SEPARATOR)))
    }

    fn escape(component: &str) -> String {
        let mut escaped = String::with_capacity(component.len());
        for c in component.chars() {
            if c == Self::ESCAPE || Self::SEPARATOR.starts_with(c) {
                escaped.push(Self::ESCAPE);
            }
            escaped.push(c);
        }
        escaped
    }

    /// Render a single scalar as a key component.
    pub fn render(value: &Value) -> Option<String> {
        match value {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NaturalKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

impl From<String> for NaturalKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

/// Local copy of a foreign entity.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectionRow {
    pub entity: String,
    pub key: NaturalKey,
    pub fields: Map<String, Value>,
    /// Placeholder created for a reference before the entity itself arrived.
    pub stub: bool,
    pub updated_at: DateTime<Utc>,
}

/// What an upsert did to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    /// Row already held these values; nothing was written.
    Unchanged,
}

/// Storage backend for projection rows.
///
/// Implementations:
/// - `MemoryProjectionStore`: in-process map, for tests and ephemeral replicas
/// - `SqliteProjectionStore`: SQLite table `projections`
#[async_trait]
pub trait ProjectionStore: Send + Sync {
    async fn get(&self, entity: &str, key: &NaturalKey) -> Result<Option<ProjectionRow>>;

    /// Insert the row, or merge `fields` into the existing one.
    ///
    /// Fields absent from `fields` keep their stored values. A successful
    /// upsert clears the stub flag.
    async fn upsert(
        &self,
        entity: &str,
        key: &NaturalKey,
        fields: &Map<String, Value>,
    ) -> Result<UpsertOutcome>;

    /// Insert a stub row if no row exists for the key. Returns whether one
    /// was inserted.
    async fn insert_stub(
        &self,
        entity: &str,
        key: &NaturalKey,
        fields: &Map<String, Value>,
    ) -> Result<bool>;

    /// Delete the row. Returns whether one existed.
    async fn delete(&self, entity: &str, key: &NaturalKey) -> Result<bool>;

    /// All rows of an entity, ordered by key.
    async fn list(&self, entity: &str) -> Result<Vec<ProjectionRow>>;

    async fn count(&self, entity: &str) -> Result<usize> {
        Ok(self.list(entity).await?.len())
    }
}

/// Merge `incoming` into `existing`. Returns whether any value changed.
pub fn merge_fields(existing: &mut Map<String, Value>, incoming: &Map<String, Value>) -> bool {
    let mut changed = false;
    for (field, value) in incoming {
        if existing.get(field) != Some(value) {
            existing.insert(field.clone(), value.clone());
            changed = true;
        }
    }
    changed
}

/// Initialize storage based on configuration.
pub async fn init_storage(config: &StorageConfig) -> Result<Arc<dyn ProjectionStore>> {
    info!("Storage: {} at {}", config.storage_type, config.path);

    match config.storage_type {
        StorageType::Memory => Ok(Arc::new(MemoryProjectionStore::new())),
        #[cfg(feature = "sqlite")]
        StorageType::Sqlite => {
            let store = SqliteProjectionStore::open(&config.path).await?;
            store.init().await?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "sqlite"))]
        StorageType::Sqlite => {
            error!("SQLite storage requested but 'sqlite' feature is not enabled");
            Err(StorageError::UnknownType(config.storage_type.to_string()))
        }
    }
}
