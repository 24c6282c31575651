//! SQLite persistence for documents, reports, history and categories.

pub mod categories;
pub mod documents;
pub mod reports;

use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

use rusqlite::types::Type;
use rusqlite::{Connection, Row, Transaction, TransactionBehavior};
use time::macros::format_description;
use time::{Date, OffsetDateTime};
use tracing::info;

use crate::error::Result;

/// Single-connection store. Writers run inside one IMMEDIATE transaction
/// each, so check-then-insert sequences are atomic.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database file and ensure the schema exists.
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS categories (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                -- lowercased name; SQLite's NOCASE only folds ASCII
                name_key TEXT NOT NULL UNIQUE,
                description TEXT,
                created_at INTEGER NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS invoice_documents (
                id TEXT PRIMARY KEY,
                fingerprint TEXT NOT NULL,
                filename TEXT NOT NULL,
                storage_handle TEXT,
                carrier TEXT,
                invoice_number TEXT,
                due_date TEXT,
                total_value TEXT,
                confidence_score INTEGER NOT NULL DEFAULT 0
                    CHECK (confidence_score BETWEEN 0 AND 100),
                status TEXT NOT NULL,
                error_code TEXT,
                error_message TEXT,
                duplicate_of TEXT,
                revision INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS reports (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                reference_date TEXT NOT NULL,
                due_date TEXT,
                category_id TEXT NOT NULL REFERENCES categories(id) ON DELETE RESTRICT,
                total_value TEXT NOT NULL,
                status TEXT NOT NULL,
                invoice_source_id TEXT UNIQUE,
                confidence_score INTEGER,
                requires_attention INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS report_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                report_id TEXT NOT NULL REFERENCES reports(id) ON DELETE RESTRICT,
                action TEXT NOT NULL,
                from_status TEXT NOT NULL,
                to_status TEXT NOT NULL,
                actor TEXT NOT NULL,
                comment TEXT,
                created_at INTEGER NOT NULL,
                CHECK (
                    (action = 'CANCEL' AND comment IS NOT NULL AND length(trim(comment)) > 0)
                    OR (action <> 'CANCEL' AND comment IS NULL)
                )
            )",
            [],
        )?;

        // one live document per fingerprint; skipped uploads are exempt
        conn.execute(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_documents_active_fingerprint
             ON invoice_documents(fingerprint) WHERE status <> 'SKIPPED'",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_documents_status ON invoice_documents(status)",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_reports_status ON reports(status)",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_history_report ON report_history(report_id)",
            [],
        )?;

        info!("Database initialized successfully");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        // a panic mid-transaction rolls back on drop, so the connection is reusable
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run read-only queries.
    pub fn read<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.lock();
        f(&conn)
    }

    /// Run `f` in one transaction; commits on `Ok`, rolls back otherwise.
    pub fn write<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }
}

// ---------------------------------------------------------------------------
// Column codecs shared by the repositories
// ---------------------------------------------------------------------------

/// Current time truncated to the millisecond precision stored on disk.
pub fn now() -> OffsetDateTime {
    let t = OffsetDateTime::now_utc();
    t.replace_nanosecond(u32::from(t.millisecond()) * 1_000_000)
        .unwrap_or(t)
}

pub(crate) fn to_millis(ts: OffsetDateTime) -> i64 {
    (ts.unix_timestamp_nanos() / 1_000_000) as i64
}

pub(crate) fn format_date(date: Date) -> String {
    date.to_string()
}

pub(crate) fn parse_date(raw: &str) -> std::result::Result<Date, time::error::Parse> {
    Date::parse(raw, format_description!("[year]-[month]-[day]"))
}

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

/// Text column parsed through `FromStr` (ids, statuses, decimals).
pub(crate) fn parsed<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>().map_err(|e| conversion_error(idx, e))
}

pub(crate) fn parsed_opt<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: Option<String> = row.get(idx)?;
    raw.map(|r| r.parse::<T>().map_err(|e| conversion_error(idx, e)))
        .transpose()
}

pub(crate) fn date_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Date> {
    let raw: String = row.get(idx)?;
    parse_date(&raw).map_err(|e| conversion_error(idx, e))
}

pub(crate) fn date_opt_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Date>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|r| parse_date(&r).map_err(|e| conversion_error(idx, e)))
        .transpose()
}

pub(crate) fn timestamp_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<OffsetDateTime> {
    let millis: i64 = row.get(idx)?;
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Integer, Box::new(e)))
}
