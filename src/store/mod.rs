//! Persistence layer: libSQL-backed storage for analyzed log entries.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{LogEntry, LogStore, NewLogEntry};
