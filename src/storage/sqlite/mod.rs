//! SQLite ProjectionStore implementation.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_query::{Expr, Func, OnConflict, Order, Query, SqliteQueryBuilder};
use serde_json::{Map, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqliteConnection, SqlitePool};

use crate::storage::schema::{Projections, CREATE_PROJECTIONS_TABLE};
use crate::storage::{
    merge_fields, NaturalKey, ProjectionRow, ProjectionStore, Result, StorageError, UpsertOutcome,
};

/// SQLite implementation of ProjectionStore.
pub struct SqliteProjectionStore {
    pool: SqlitePool,
}

impl SqliteProjectionStore {
    /// Create a new SQLite projection store.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) the database at `path`.
    ///
    /// `:memory:` opens a private in-memory database on a single connection.
    pub async fn open(path: &str) -> Result<Self> {
        if path == ":memory:" {
            let pool = SqlitePoolOptions::new()
                .max_connections(1)
                .connect("sqlite::memory:")
                .await?;
            return Ok(Self::new(pool));
        }

        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        Ok(Self::new(pool))
    }

    /// Initialize the database schema.
    pub async fn init(&self) -> Result<()> {
        sqlx::query(CREATE_PROJECTIONS_TABLE)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn fetch(
        conn: &mut SqliteConnection,
        entity: &str,
        key: &NaturalKey,
    ) -> Result<Option<ProjectionRow>> {
        let query = Query::select()
            .columns([
                Projections::Entity,
                Projections::NaturalKey,
                Projections::Fields,
                Projections::Stub,
                Projections::UpdatedAt,
            ])
            .from(Projections::Table)
            .and_where(Expr::col(Projections::Entity).eq(entity))
            .and_where(Expr::col(Projections::NaturalKey).eq(key.as_str()))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&mut *conn).await?;
        row.map(|row| decode_row(&row)).transpose()
    }

    async fn write_upsert(
        conn: &mut SqliteConnection,
        entity: &str,
        key: &NaturalKey,
        fields: &Map<String, Value>,
    ) -> Result<UpsertOutcome> {
        let (merged, outcome) = match Self::fetch(conn, entity, key).await? {
            Some(mut row) => {
                let changed = merge_fields(&mut row.fields, fields);
                if !changed && !row.stub {
                    return Ok(UpsertOutcome::Unchanged);
                }
                (row.fields, UpsertOutcome::Updated)
            }
            None => (fields.clone(), UpsertOutcome::Inserted),
        };

        let fields_json = encode_fields(entity, key, &merged)?;
        let updated_at = Utc::now().to_rfc3339();

        let query = Query::insert()
            .into_table(Projections::Table)
            .columns([
                Projections::Entity,
                Projections::NaturalKey,
                Projections::Fields,
                Projections::Stub,
                Projections::UpdatedAt,
            ])
            .values_panic([
                entity.into(),
                key.as_str().into(),
                fields_json.into(),
                0i32.into(),
                updated_at.into(),
            ])
            .on_conflict(
                OnConflict::columns([Projections::Entity, Projections::NaturalKey])
                    .update_columns([
                        Projections::Fields,
                        Projections::Stub,
                        Projections::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .to_string(SqliteQueryBuilder);

        sqlx::query(&query).execute(&mut *conn).await?;

        Ok(outcome)
    }
}

#[async_trait]
impl ProjectionStore for SqliteProjectionStore {
    async fn get(&self, entity: &str, key: &NaturalKey) -> Result<Option<ProjectionRow>> {
        let mut conn = self.pool.acquire().await?;
        Self::fetch(&mut conn, entity, key).await
    }

    async fn upsert(
        &self,
        entity: &str,
        key: &NaturalKey,
        fields: &Map<String, Value>,
    ) -> Result<UpsertOutcome> {
        // BEGIN IMMEDIATE takes the write lock before the read so the
        // merge cannot race another writer for the same row.
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        let result = Self::write_upsert(&mut conn, entity, key, fields).await;

        match result {
            Ok(outcome) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
                Ok(outcome)
            }
            Err(e) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(e)
            }
        }
    }

    async fn insert_stub(
        &self,
        entity: &str,
        key: &NaturalKey,
        fields: &Map<String, Value>,
    ) -> Result<bool> {
        let fields_json = encode_fields(entity, key, fields)?;
        let updated_at = Utc::now().to_rfc3339();

        let query = Query::insert()
            .into_table(Projections::Table)
            .columns([
                Projections::Entity,
                Projections::NaturalKey,
                Projections::Fields,
                Projections::Stub,
                Projections::UpdatedAt,
            ])
            .values_panic([
                entity.into(),
                key.as_str().into(),
                fields_json.into(),
                1i32.into(),
                updated_at.into(),
            ])
            .on_conflict(
                OnConflict::columns([Projections::Entity, Projections::NaturalKey])
                    .do_nothing()
                    .to_owned(),
            )
            .to_string(SqliteQueryBuilder);

        let result = sqlx::query(&query).execute(&self.pool).await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete(&self, entity: &str, key: &NaturalKey) -> Result<bool> {
        let query = Query::delete()
            .from_table(Projections::Table)
            .and_where(Expr::col(Projections::Entity).eq(entity))
            .and_where(Expr::col(Projections::NaturalKey).eq(key.as_str()))
            .to_string(SqliteQueryBuilder);

        let result = sqlx::query(&query).execute(&self.pool).await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list(&self, entity: &str) -> Result<Vec<ProjectionRow>> {
        let query = Query::select()
            .columns([
                Projections::Entity,
                Projections::NaturalKey,
                Projections::Fields,
                Projections::Stub,
                Projections::UpdatedAt,
            ])
            .from(Projections::Table)
            .and_where(Expr::col(Projections::Entity).eq(entity))
            .order_by(Projections::NaturalKey, Order::Asc)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;

        rows.iter().map(decode_row).collect()
    }

    async fn count(&self, entity: &str) -> Result<usize> {
        let query = Query::select()
            .expr(Func::count(Expr::col(Projections::NaturalKey)))
            .from(Projections::Table)
            .and_where(Expr::col(Projections::Entity).eq(entity))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_one(&self.pool).await?;
        let count: i64 = row.get(0);

        Ok(count as usize)
    }
}

fn encode_fields(entity: &str, key: &NaturalKey, fields: &Map<String, Value>) -> Result<String> {
    serde_json::to_string(fields).map_err(|e| StorageError::Corrupt {
        entity: entity.to_string(),
        key: key.to_string(),
        reason: e.to_string(),
    })
}

fn decode_row(row: &SqliteRow) -> Result<ProjectionRow> {
    let entity: String = row.get("entity");
    let key = NaturalKey::new(row.get::<String, _>("natural_key"));
    let fields_json: String = row.get("fields");
    let stub: i64 = row.get("stub");
    let updated_at: String = row.get("updated_at");

    let corrupt = |reason: String| StorageError::Corrupt {
        entity: entity.clone(),
        key: key.to_string(),
        reason,
    };

    let fields = serde_json::from_str::<Map<String, Value>>(&fields_json)
        .map_err(|e| corrupt(e.to_string()))?;
    let updated_at = DateTime::parse_from_rfc3339(&updated_at)
        .map_err(|e| corrupt(e.to_string()))?
        .with_timezone(&Utc);

    Ok(ProjectionRow {
        entity: entity.clone(),
        key: key.clone(),
        fields,
        stub: stub != 0,
        updated_at,
    })
}
