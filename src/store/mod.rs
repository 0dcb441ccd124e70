//! Persistence layer: libSQL-backed append-only activity log.

mod libsql_backend;
mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{ActivityFilter, ActivityStore};
