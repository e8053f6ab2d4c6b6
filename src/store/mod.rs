//! SQLite persistence shared by every engine component.
//!
//! The engine needs durable append-only storage for trust profiles, tokens,
//! lineage nodes/edges, audit receipts and HITL requests. Each component owns
//! its own tables; this module only opens the pool, applies the schema and
//! provides the error type and timestamp encoding everyone shares.

use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

/// Inline schema applied on every open (idempotent).
const SCHEMA_SQL: &str = include_str!("../../migrations/001_schema.sql");

/// Errors from the backing store.
///
/// These are transient "could not decide" failures and are always kept
/// separate from policy outcomes such as denials or invalid tokens.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A JSON column could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An invalid enum value was read from the database.
    #[error("invalid {field} value: {value:?}")]
    InvalidEnum {
        /// Which field contained the bad value.
        field: &'static str,
        /// The unexpected value.
        value: String,
    },

    /// A stored timestamp could not be parsed.
    #[error("invalid timestamp {value:?}: {reason}")]
    InvalidTimestamp {
        /// Raw stored value.
        value: String,
        /// Parser message.
        reason: String,
    },

    /// Schema could not be applied.
    #[error("migration failed: {0}")]
    Migration(String),
}

/// Handle to the engine database.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (or create) the database at `path` and apply the schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or the schema fails.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::Migration(format!(
                        "failed to create database directory {}: {e}",
                        parent.display()
                    ))
                })?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .pragma("trusted_schema", "OFF")
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        info!(path = %path.display(), "engine store opened");
        Ok(store)
    }

    /// Open a private in-memory database (tests, dry runs).
    ///
    /// Uses a single pinned connection; an in-memory SQLite database lives
    /// only as long as its connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool cannot connect or the schema fails.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(":memory:")
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Wrap an existing pool whose schema has already been applied.
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Returns a reference to the underlying SQLite pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA_SQL)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Migration(e.to_string()))?;
        Ok(())
    }
}

/// Encode a timestamp for storage.
///
/// Fixed microsecond precision so the stored text is byte-stable; hashes of
/// receipts and signatures of tokens are computed over this exact string.
pub fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Decode a stored timestamp.
///
/// # Errors
///
/// Returns [`StoreError::InvalidTimestamp`] if the value is not RFC 3339.
pub fn parse_ts(value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::InvalidTimestamp {
            value: value.to_owned(),
            reason: e.to_string(),
        })
}

/// Decode an optional stored timestamp.
///
/// # Errors
///
/// Returns [`StoreError::InvalidTimestamp`] if a present value is malformed.
pub fn parse_ts_opt(value: Option<&str>) -> Result<Option<DateTime<Utc>>, StoreError> {
    value.map(parse_ts).transpose()
}

/// Truncate a timestamp to the precision it will have after a storage round trip.
pub fn storage_precision(ts: DateTime<Utc>) -> DateTime<Utc> {
    parse_ts(&format_ts(&ts)).unwrap_or(ts)
}

/// Convert a caller-supplied `usize` limit into a SQLite bind value.
pub(crate) fn limit_param(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}
