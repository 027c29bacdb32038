use chrono::{DateTime, SecondsFormat, Utc};
use rand::Rng;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
    Pool, Sqlite,
};
use std::future::Future;
use std::str::FromStr;
use tokio::time::{sleep, Duration};
use tracing::{info, instrument, warn};

use crate::TARGET_DB;

const MAX_LOCK_RETRIES: u32 = 5;

#[derive(Clone)]
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    /// Get access to the database pool
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

// Helper method to check if an sqlx error is a database lock error
pub trait DbLockErrorExt {
    fn is_database_lock_error(&self) -> bool;
}

impl DbLockErrorExt for sqlx::Error {
    fn is_database_lock_error(&self) -> bool {
        match self {
            // SQLITE_BUSY and SQLITE_LOCKED, including extended codes.
            sqlx::Error::Database(err) => err
                .code()
                .and_then(|c| c.parse::<i32>().ok())
                .is_some_and(|code| matches!(code & 0xff, 5 | 6)),
            _ => false,
        }
    }
}

impl Database {
    /// Opens (creating if needed) the SQLite database at `database_path` and
    /// ensures the schema exists.
    #[instrument(target = "db", level = "info")]
    pub async fn new(database_path: &str) -> Result<Self, sqlx::Error> {
        info!(target: TARGET_DB, "Creating database pool for: {}", database_path);

        let connect_options =
            SqliteConnectOptions::from_str(&format!("sqlite://{}", database_path))?
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
                .busy_timeout(Duration::from_secs(5))
                .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;

        info!(target: TARGET_DB, "Database pool created");

        let db = Database { pool };
        db.initialize_schema().await?;

        Ok(db)
    }

    /// A private in-memory database. One connection, because every SQLite
    /// memory connection is its own database.
    pub async fn in_memory() -> Result<Self, sqlx::Error> {
        let connect_options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(connect_options)
            .await?;

        let db = Database { pool };
        db.initialize_schema().await?;
        Ok(db)
    }
}

/// Runs `operation`, retrying with jittered exponential backoff while SQLite
/// reports the database as locked.
pub(crate) async fn retry_on_lock<T, F, Fut>(label: &str, mut operation: F) -> Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, sqlx::Error>>,
{
    let mut backoff = 100; // initial delay in milliseconds
    let mut attempt = 1;
    loop {
        match operation().await {
            Err(e) if e.is_database_lock_error() && attempt < MAX_LOCK_RETRIES => {
                let jitter = rand::rng().random_range(0..50);
                warn!(target: TARGET_DB, "{}: database locked (attempt {}), retrying in {} ms", label, attempt, backoff + jitter);
                sleep(Duration::from_millis(backoff + jitter)).await;
                backoff *= 2;
                attempt += 1;
            }
            other => return other,
        }
    }
}

/// Fixed-width UTC timestamps so stored values sort lexically.
pub(crate) fn format_time(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_time(value: &str) -> Result<DateTime<Utc>, sqlx::Error> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| sqlx::Error::Decode(Box::new(e)))
}

pub(crate) fn to_db_int(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

pub(crate) fn from_db_int(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}
