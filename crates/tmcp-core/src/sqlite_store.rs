//! SQLite identity backend.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::sync::Mutex;
use uuid::Uuid;

use tmcp_transport::TransportKind;

use crate::store::{IdentityBackend, IdentityRecord, StoreError};

// ============================================================================
// Schema
// ============================================================================

const SCHEMA_VERSION: i32 = 1;

const COLUMNS: &str = "id, alias, did, transport_kind, endpoint, document_version, published, \
                       sign_seed, kex_secret, created_at, retired_at";

pub struct SqliteIdentityBackend {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteIdentityBackend {
    /// Open (or create) the database at `path` and bring its schema up to date.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)
            .map_err(|e| StoreError::OperationFailed(format!("failed to open database: {e}")))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| StoreError::OperationFailed(format!("failed to set pragmas: {e}")))?;
        Self::from_connection(conn)
    }

    pub fn new_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(|e| {
            StoreError::OperationFailed(format!("failed to open in-memory database: {e}"))
        })?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        Self::run_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY)",
            [],
        )
        .map_err(|e| StoreError::OperationFailed(format!("failed to create schema_version: {e}")))?;

        let current: i32 = conn
            .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |row| row.get(0))
            .map_err(|e| StoreError::OperationFailed(format!("failed to read schema version: {e}")))?;

        if current < 1 {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS identities (
                    id TEXT PRIMARY KEY,
                    alias TEXT NOT NULL,
                    did TEXT,
                    transport_kind TEXT NOT NULL,
                    endpoint TEXT NOT NULL,
                    document_version INTEGER NOT NULL,
                    published INTEGER NOT NULL,
                    sign_seed TEXT NOT NULL,
                    kex_secret TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    retired_at TEXT
                );
                CREATE INDEX IF NOT EXISTS idx_identities_alias ON identities(alias);
                "#,
            )
            .map_err(|e| StoreError::OperationFailed(format!("migration v1 failed: {e}")))?;
            conn.execute(
                "INSERT INTO schema_version (version) VALUES (?1)",
                params![SCHEMA_VERSION],
            )
            .map_err(|e| StoreError::OperationFailed(format!("migration v1 failed: {e}")))?;
        }
        Ok(())
    }
}

/// Raw column values; parsing happens outside the rusqlite closure so
/// corruption surfaces as [`StoreError::DataCorruption`].
struct RawRecord {
    id: String,
    alias: String,
    did: Option<String>,
    transport_kind: String,
    endpoint: String,
    document_version: i64,
    published: bool,
    sign_seed: String,
    kex_secret: String,
    created_at: String,
    retired_at: Option<String>,
}

impl RawRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            alias: row.get(1)?,
            did: row.get(2)?,
            transport_kind: row.get(3)?,
            endpoint: row.get(4)?,
            document_version: row.get(5)?,
            published: row.get(6)?,
            sign_seed: row.get(7)?,
            kex_secret: row.get(8)?,
            created_at: row.get(9)?,
            retired_at: row.get(10)?,
        })
    }

    fn into_record(self) -> Result<IdentityRecord, StoreError> {
        let corrupt = |field: &str| StoreError::DataCorruption(format!("bad {field} in identity row"));
        let timestamp = |s: &str, field: &str| {
            DateTime::parse_from_rfc3339(s)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|_| corrupt(field))
        };
        Ok(IdentityRecord {
            id: Uuid::parse_str(&self.id).map_err(|_| corrupt("id"))?,
            alias: self.alias,
            did: self.did,
            transport_kind: self
                .transport_kind
                .parse::<TransportKind>()
                .map_err(|_| corrupt("transport_kind"))?,
            endpoint: self.endpoint,
            document_version: u64::try_from(self.document_version).map_err(|_| corrupt("document_version"))?,
            published: self.published,
            sign_seed: self.sign_seed,
            kex_secret: self.kex_secret,
            created_at: timestamp(&self.created_at, "created_at")?,
            retired_at: self
                .retired_at
                .as_deref()
                .map(|s| timestamp(s, "retired_at"))
                .transpose()?,
        })
    }
}

/// Fixed-width UTC timestamps, so text ordering is time ordering.
fn timestamp(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn query_failed(e: rusqlite::Error) -> StoreError {
    StoreError::OperationFailed(e.to_string())
}

#[async_trait]
impl IdentityBackend for SqliteIdentityBackend {
    async fn save(&self, record: &IdentityRecord) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            &format!("INSERT OR REPLACE INTO identities ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"),
            params![
                record.id.to_string(),
                record.alias,
                record.did,
                record.transport_kind.as_str(),
                record.endpoint,
                record.document_version as i64,
                record.published,
                record.sign_seed,
                record.kex_secret,
                timestamp(&record.created_at),
                record.retired_at.as_ref().map(timestamp),
            ],
        )
        .map_err(|e| StoreError::OperationFailed(format!("failed to save identity: {e}")))?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<IdentityRecord>, StoreError> {
        let conn = self.conn.lock().await;
        conn.query_row(
            &format!("SELECT {COLUMNS} FROM identities WHERE id = ?1"),
            params![id.to_string()],
            RawRecord::from_row,
        )
        .optional()
        .map_err(query_failed)?
        .map(RawRecord::into_record)
        .transpose()
    }

    async fn active(&self, alias: &str) -> Result<Option<IdentityRecord>, StoreError> {
        let conn = self.conn.lock().await;
        conn.query_row(
            &format!(
                "SELECT {COLUMNS} FROM identities WHERE alias = ?1 AND retired_at IS NULL \
                 ORDER BY created_at DESC LIMIT 1"
            ),
            params![alias],
            RawRecord::from_row,
        )
        .optional()
        .map_err(query_failed)?
        .map(RawRecord::into_record)
        .transpose()
    }

    async fn list(&self) -> Result<Vec<IdentityRecord>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(&format!("SELECT {COLUMNS} FROM identities ORDER BY created_at ASC"))
            .map_err(query_failed)?;
        let rows = stmt
            .query_map([], RawRecord::from_row)
            .map_err(query_failed)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(query_failed)?;
        rows.into_iter().map(RawRecord::into_record).collect()
    }

    async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let deleted = conn
            .execute("DELETE FROM identities WHERE id = ?1", params![id.to_string()])
            .map_err(|e| StoreError::OperationFailed(format!("failed to delete identity: {e}")))?;
        if deleted == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }
}
