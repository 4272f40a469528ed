//! SQLite persistence for signature state.
//!
//! ## Tables
//!
//! - `document_versions` - registry view: canonical/original storage keys, status
//! - `signature_stamps` - stamp catalogue, names unique case-insensitively
//! - `signature_requests` - request lifecycle rows
//! - `digital_signatures` - one row per (version, signer)
//!
//! Every workflow mutation runs through [`SignatureDb::with_tx`], so the
//! signature upsert, request transition and version update commit together.

pub mod schema;
pub mod requests;
pub mod signatures;
pub mod stamps;
pub mod versions;

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, Row, Transaction};
use tracing::{debug, info};

use crate::error::SealError;

/// SQLite database holding requests, signatures, stamps and versions
pub struct SignatureDb {
    conn: Mutex<Connection>,
}

impl SignatureDb {
    /// Open or create the database file
    pub fn open(path: &Path) -> Result<Self, SealError> {
        info!(path = %path.display(), "Opening SQLite database");

        let conn = Connection::open(path)?;

        // WAL keeps readers off the writer's back
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        Self::from_connection(conn)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self, SealError> {
        debug!("Opening in-memory SQLite database");
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, SealError> {
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        schema::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, SealError> {
        self.conn
            .lock()
            .map_err(|e| SealError::Unexpected(eyre::eyre!("database lock poisoned: {e}")))
    }

    /// Run read-only work against the connection
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, SealError>
    where
        F: FnOnce(&Connection) -> Result<T, SealError>,
    {
        let conn = self.lock()?;
        f(&conn)
    }

    /// Run `f` in a transaction. Any error rolls the whole unit back.
    pub fn with_tx<F, T>(&self, f: F) -> Result<T, SealError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, SealError>,
    {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }
}

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn time_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let millis: i64 = row.get(idx)?;
    DateTime::from_timestamp_millis(millis)
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, millis))
}

pub(crate) fn optional_time_column(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let millis: Option<i64> = row.get(idx)?;
    millis
        .map(|millis| {
            DateTime::from_timestamp_millis(millis)
                .ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, millis))
        })
        .transpose()
}

pub(crate) fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.code == rusqlite::ErrorCode::ConstraintViolation
    )
}
