//! libSQL backend: async `LogStore` implementation.
//!
//! Supports local file and in-memory databases. Migrations run in the
//! constructor, so a backend that exists is ready to use.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};

use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::{LogEntry, LogStore, NewLogEntry};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    // SQLite datetime() output, with or without fractional seconds
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_integer(v: Option<u64>) -> libsql::Value {
    match v {
        Some(v) => libsql::Value::Integer(v as i64),
        None => libsql::Value::Null,
    }
}

const LOG_COLUMNS: &str =
    "id, timestamp, hostname, severity, service, message, context, analysis, stream_sequence, created_at";

fn row_to_entry(row: &libsql::Row) -> Result<LogEntry, libsql::Error> {
    let created_str: String = row.get(9)?;
    Ok(LogEntry {
        id: row.get(0)?,
        timestamp: row.get(1)?,
        hostname: row.get(2)?,
        severity: row.get(3)?,
        service: row.get(4)?,
        message: row.get(5)?,
        context: row.get::<String>(6).ok(),
        analysis: row.get::<String>(7).ok(),
        stream_sequence: row.get::<i64>(8).ok().map(|s| s as u64),
        created_at: parse_datetime(&created_str),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl LogStore for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    async fn insert_log_entry(&self, entry: &NewLogEntry) -> Result<i64, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "INSERT INTO agent_logs (timestamp, hostname, severity, service, message, context, analysis, stream_sequence, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 RETURNING id",
                params![
                    entry.timestamp.as_str(),
                    entry.hostname.as_str(),
                    entry.severity.as_str(),
                    entry.service.as_str(),
                    entry.message.as_str(),
                    opt_text(entry.context.as_deref()),
                    opt_text(entry.analysis.as_deref()),
                    opt_integer(entry.stream_sequence),
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_log_entry: {e}")))?;

        let row = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_log_entry: {e}")))?
            .ok_or_else(|| DatabaseError::Query("insert_log_entry: no id returned".into()))?;
        let id: i64 = row
            .get(0)
            .map_err(|e| DatabaseError::Query(format!("insert_log_entry: {e}")))?;

        debug!(id, severity = %entry.severity, service = %entry.service, "Stored log entry");
        Ok(id)
    }

    async fn get_log_entries(
        &self,
        limit: usize,
        severity: Option<&str>,
    ) -> Result<Vec<LogEntry>, DatabaseError> {
        let severity = severity.unwrap_or("");
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {LOG_COLUMNS} FROM agent_logs
                     WHERE (?1 = '' OR severity = ?1)
                     ORDER BY timestamp DESC, id DESC
                     LIMIT ?2"
                ),
                params![severity, limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_log_entries: {e}")))?;

        let mut entries = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_entry(&row) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    tracing::warn!("Skipping log row: {e}");
                }
            }
        }
        Ok(entries)
    }

    async fn has_stream_sequence(&self, sequence: u64) -> Result<bool, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM agent_logs WHERE stream_sequence = ?1",
                params![sequence as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("has_stream_sequence: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let count: i64 = row.get(0).unwrap_or(0);
                Ok(count > 0)
            }
            Ok(None) => Ok(false),
            Err(e) => Err(DatabaseError::Query(format!("has_stream_sequence: {e}"))),
        }
    }

    async fn count_log_entries(&self) -> Result<u64, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT COUNT(*) FROM agent_logs", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("count_log_entries: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let count: i64 = row.get(0).unwrap_or(0);
                Ok(count.max(0) as u64)
            }
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(format!("count_log_entries: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn make_entry(timestamp: &str, severity: &str, sequence: Option<u64>) -> NewLogEntry {
        NewLogEntry {
            timestamp: timestamp.to_string(),
            hostname: "web-1".to_string(),
            severity: severity.to_string(),
            service: "checkout".to_string(),
            message: "payment gateway timeout".to_string(),
            context: Some(r#"{"region":"eu-west-1"}"#.to_string()),
            analysis: Some("Upstream gateway is slow.".to_string()),
            stream_sequence: sequence,
        }
    }

    #[tokio::test]
    async fn insert_and_read_back() {
        let db = test_db().await;
        let id = db
            .insert_log_entry(&make_entry("2025-01-01T00:00:00Z", "error", Some(7)))
            .await
            .unwrap();
        assert!(id > 0);

        let entries = db.get_log_entries(10, None).await.unwrap();
        assert_eq!(entries.len(), 1);
        let entry = &entries[0];
        assert_eq!(entry.id, id);
        assert_eq!(entry.hostname, "web-1");
        assert_eq!(entry.context.as_deref(), Some(r#"{"region":"eu-west-1"}"#));
        assert_eq!(entry.analysis.as_deref(), Some("Upstream gateway is slow."));
        assert_eq!(entry.stream_sequence, Some(7));
        assert!(entry.created_at > DateTime::<Utc>::MIN_UTC);
    }

    #[tokio::test]
    async fn null_columns_read_as_none() {
        let db = test_db().await;
        let mut entry = make_entry("2025-01-01T00:00:00Z", "info", None);
        entry.context = None;
        entry.analysis = None;
        db.insert_log_entry(&entry).await.unwrap();

        let stored = &db.get_log_entries(1, None).await.unwrap()[0];
        assert!(stored.context.is_none());
        assert!(stored.analysis.is_none());
        assert!(stored.stream_sequence.is_none());
    }

    #[tokio::test]
    async fn entries_are_newest_first_and_filterable() {
        let db = test_db().await;
        db.insert_log_entry(&make_entry("2025-01-01T00:00:00Z", "info", Some(1)))
            .await
            .unwrap();
        db.insert_log_entry(&make_entry("2025-01-03T00:00:00Z", "error", Some(2)))
            .await
            .unwrap();
        db.insert_log_entry(&make_entry("2025-01-02T00:00:00Z", "error", Some(3)))
            .await
            .unwrap();

        let all = db.get_log_entries(10, None).await.unwrap();
        let sequences: Vec<_> = all.iter().map(|e| e.stream_sequence).collect();
        assert_eq!(sequences, vec![Some(2), Some(3), Some(1)]);

        let errors = db.get_log_entries(10, Some("error")).await.unwrap();
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().all(|e| e.severity == "error"));

        assert_eq!(db.get_log_entries(1, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stream_sequence_lookup_and_uniqueness() {
        let db = test_db().await;
        assert!(!db.has_stream_sequence(42).await.unwrap());

        db.insert_log_entry(&make_entry("t", "warning", Some(42)))
            .await
            .unwrap();
        assert!(db.has_stream_sequence(42).await.unwrap());

        let duplicate = db.insert_log_entry(&make_entry("t", "warning", Some(42))).await;
        assert!(duplicate.is_err());

        // Entries without a sequence never collide.
        db.insert_log_entry(&make_entry("t", "warning", None))
            .await
            .unwrap();
        db.insert_log_entry(&make_entry("t", "warning", None))
            .await
            .unwrap();
        assert_eq!(db.count_log_entries().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn local_file_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("agent.db");
        {
            let db = LibSqlBackend::new_local(&path).await.unwrap();
            db.insert_log_entry(&make_entry("t", "info", Some(1)))
                .await
                .unwrap();
        }
        let reopened = LibSqlBackend::new_local(&path).await.unwrap();
        assert_eq!(reopened.count_log_entries().await.unwrap(), 1);
        assert!(reopened.has_stream_sequence(1).await.unwrap());
    }
}
