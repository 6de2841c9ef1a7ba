//! Database schema definitions using sea-query.

use sea_query::Iden;

/// Projections table schema.
#[derive(Iden)]
pub enum Projections {
    Table,
    #[iden = "entity"]
    Entity,
    #[iden = "natural_key"]
    NaturalKey,
    #[iden = "fields"]
    Fields,
    #[iden = "stub"]
    Stub,
    #[iden = "updated_at"]
    UpdatedAt,
}

/// SQL for creating the projections table.
pub const CREATE_PROJECTIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS projections (
    entity TEXT NOT NULL,
    natural_key TEXT NOT NULL,
    fields TEXT NOT NULL,
    stub INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (entity, natural_key)
);
"#;
