//! Batched PostgreSQL ingestion with dynamic schema reconciliation.
//!
//! Metrics (name + tag map + field map + timestamp) are grouped by
//! measurement, the target tables are created or widened on the fly, tag
//! sets are deduplicated into a paired tag table when configured, and the
//! surviving rows are bulk inserted. Multiple writers in one process and
//! multiple processes sharing one schema are both supported; DDL is
//! serialized through a transaction-scoped advisory lock.

pub mod config;
pub mod db;
pub mod error;
pub mod layout;
pub mod sqltemplate;
pub mod table_manager;
pub mod table_source;
pub mod tags_cache;
pub mod writer;

pub use config::SinkConfig;
pub use error::{Error, Result};
pub use writer::PgSink;
