//! Replica - cross-service event replication
//!
//! Services publish domain events (`CREATED`, `UPDATED`, `DELETED`, ...) to
//! broker exchanges; other services consume them from durable queues and
//! keep idempotent local projections of the entities they care about.
//!
//! - `bus`: connection supervision, publishing, consuming
//! - `topology`: exchanges, queues and bindings declared on connect
//! - `projection`: entity catalog and the applier that mutates projections
//! - `storage`: projection stores (in-memory, SQLite)

pub mod bus;
pub mod config;
pub mod envelope;
pub mod projection;
pub mod storage;
pub mod topology;
pub mod utils;
