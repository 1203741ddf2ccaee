use crate::error::{is_busy_error, StoreError};
use futures::future::{BoxFuture, FutureExt, Shared};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Bump when the schema below changes; older databases are upgraded on open.
pub const SCHEMA_VERSION: i64 = 1;

// Define the database schema using CREATE TABLE IF NOT EXISTS statements
const MIGRATIONS_SQL: &str = "
-- Binary payloads (images, audio) keyed by generated id
CREATE TABLE IF NOT EXISTS blobs (
    id TEXT PRIMARY KEY NOT NULL, -- UUID
    data BLOB NOT NULL
);

-- Structured documents (the project list lives under one well-known key)
CREATE TABLE IF NOT EXISTS documents (
    key TEXT PRIMARY KEY NOT NULL,
    value TEXT NOT NULL -- JSON
);

-- Application Settings Table (Key-Value)
CREATE TABLE IF NOT EXISTS settings (
    key TEXT PRIMARY KEY NOT NULL,
    value TEXT NOT NULL
);
";

type OpenResult = Result<SqlitePool, Arc<sqlx::Error>>;
type PendingOpen = Shared<BoxFuture<'static, OpenResult>>;

enum ConnState {
    Closed,
    // Every caller arriving while the open is in flight awaits the same future
    Opening { attempt: u64, pending: PendingOpen },
    Open(SqlitePool),
}

/// Owns the process-wide connection pool to the embedded database.
///
/// The pool is opened lazily on first use and shared by every store. If the pool
/// is found closed (or a caller reports it stale via [`invalidate`](Self::invalidate))
/// the next request opens a fresh one.
pub struct ConnectionManager {
    db_path: PathBuf,
    options: SqliteConnectOptions,
    pool_size: u32,
    state: Mutex<ConnState>,
    attempts: std::sync::atomic::AtomicU64,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("db_path", &self.db_path)
            .field("pool_size", &self.pool_size)
            .finish()
    }
}

impl ConnectionManager {
    pub fn new(db_path: &Path, pool_size: u32, max_page_count: Option<u64>) -> Self {
        let mut options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        if let Some(pages) = max_page_count {
            options = options.pragma("max_page_count", pages.to_string());
        }

        Self {
            db_path: db_path.to_path_buf(),
            options,
            pool_size: pool_size.max(1),
            state: Mutex::new(ConnState::Closed),
            attempts: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Returns the shared pool, opening it if needed. Concurrent callers share one open.
    pub async fn get_connection(&self) -> Result<SqlitePool, StoreError> {
        let (attempt, pending) = {
            let mut state = self.state.lock().await;

            if let ConnState::Open(pool) = &*state {
                if !pool.is_closed() {
                    return Ok(pool.clone());
                }
                log::warn!("Database connection closed unexpectedly, reopening");
                *state = ConnState::Closed;
            }

            match &*state {
                ConnState::Opening { attempt, pending } => (*attempt, pending.clone()),
                _ => {
                    let attempt = self
                        .attempts
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
                        + 1;
                    log::info!(
                        "Opening database {} (attempt {})",
                        self.db_path.display(),
                        attempt
                    );
                    let pending =
                        open_pool(self.options.clone(), self.pool_size).boxed().shared();
                    *state = ConnState::Opening {
                        attempt,
                        pending: pending.clone(),
                    };
                    (attempt, pending)
                }
            }
        };

        let result = pending.await;

        let mut state = self.state.lock().await;
        // Only the open that is still current may settle the state
        if matches!(&*state, ConnState::Opening { attempt: current, .. } if *current == attempt) {
            *state = match &result {
                Ok(pool) => ConnState::Open(pool.clone()),
                Err(_) => ConnState::Closed,
            };
        }
        drop(state);

        result.map_err(|e| match schema_too_new(&e) {
            Some(found) => StoreError::SchemaTooNew {
                found,
                supported: SCHEMA_VERSION,
            },
            None => StoreError::Open(e),
        })
    }

    /// Drops the cached pool and any in-flight open so the next call reconnects.
    pub async fn invalidate(&self) {
        let mut state = self.state.lock().await;
        if !matches!(&*state, ConnState::Closed) {
            log::warn!("Invalidating cached database connection");
        }
        *state = ConnState::Closed;
    }

    /// Closes the pool if one is open.
    pub async fn close(&self) {
        let previous = std::mem::replace(&mut *self.state.lock().await, ConnState::Closed);
        if let ConnState::Open(pool) = previous {
            log::info!("Closing database connection");
            pool.close().await;
        }
    }

    pub fn open_attempts(&self) -> u64 {
        self.attempts.load(std::sync::atomic::Ordering::Relaxed)
    }
}

// Marker carried through sqlx::Error::Protocol when the on-disk schema is ahead of us
const SCHEMA_TOO_NEW_PREFIX: &str = "schema version too new: ";

fn schema_too_new(err: &sqlx::Error) -> Option<i64> {
    match err {
        sqlx::Error::Protocol(msg) => msg.strip_prefix(SCHEMA_TOO_NEW_PREFIX)?.parse().ok(),
        _ => None,
    }
}

async fn open_pool(options: SqliteConnectOptions, pool_size: u32) -> OpenResult {
    let pool = SqlitePoolOptions::new()
        .max_connections(pool_size)
        .connect_with(options)
        .await
        .map_err(|e| {
            log::error!("Database open failed: {}", e);
            Arc::new(e)
        })?;

    if let Err(e) = run_migrations(&pool).await {
        if is_busy_error(&e) {
            log::warn!("Database upgrade is blocked by another open connection");
        }
        log::error!("Database migration failed: {}", e);
        pool.close().await;
        return Err(Arc::new(e));
    }

    Ok(pool)
}

/// Applies the schema when the stored `user_version` is behind [`SCHEMA_VERSION`].
async fn run_migrations(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    let current = sqlx::query_scalar::<_, i64>("PRAGMA user_version")
        .fetch_one(pool)
        .await?;

    if current > SCHEMA_VERSION {
        log::error!(
            "Database schema version {} is newer than supported {}",
            current,
            SCHEMA_VERSION
        );
        return Err(sqlx::Error::Protocol(format!(
            "{}{}",
            SCHEMA_TOO_NEW_PREFIX, current
        )));
    }
    if current == SCHEMA_VERSION {
        log::debug!("Database schema is current (version {})", current);
        return Ok(());
    }

    log::info!(
        "Upgrading database schema from version {} to {}",
        current,
        SCHEMA_VERSION
    );
    let mut tx = pool.begin().await?;
    sqlx::query(MIGRATIONS_SQL).execute(&mut *tx).await?;
    // PRAGMA does not accept bound parameters
    sqlx::query(&format!("PRAGMA user_version = {}", SCHEMA_VERSION))
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    log::info!("Database migrations completed.");
    Ok(())
}
