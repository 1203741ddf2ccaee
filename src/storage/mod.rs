//! Local persistence on top of an embedded SQLite database.
//!
//! [`StorageManager`] wraps every store operation in a transaction scoped to one
//! logical store and transparently retries once when the shared connection turns
//! out to be stale. The blob, document and settings stores are thin typed views
//! over it.

pub mod blobs;
pub mod connection;
pub mod documents;
pub mod settings;

pub use blobs::BlobStore;
pub use connection::{ConnectionManager, SCHEMA_VERSION};
pub use documents::DocumentStore;
pub use settings::SettingsStore;

use crate::config::AppConfig;
use crate::error::{is_quota_error, is_stale_connection, StoreError};
use futures::future::BoxFuture;
use sqlx::SqliteConnection;
use std::sync::Arc;

/// Logical stores kept in the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreName {
    Blobs,
    Documents,
    Settings,
}

impl StoreName {
    pub fn as_str(self) -> &'static str {
        match self {
            StoreName::Blobs => "blobs",
            StoreName::Documents => "documents",
            StoreName::Settings => "settings",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxMode {
    /// Runs inside a transaction that is always rolled back.
    ReadOnly,
    ReadWrite,
}

/// Future returned by a store operation; borrows the connection it runs on.
pub type OpFuture<'c, T> = BoxFuture<'c, Result<T, sqlx::Error>>;

/// Bytes used versus the configured quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageUsage {
    pub used_bytes: u64,
    pub quota_bytes: Option<u64>,
}

impl StorageUsage {
    pub const WARN_RATIO: f64 = 0.8;

    pub fn ratio(&self) -> Option<f64> {
        self.quota_bytes
            .filter(|quota| *quota > 0)
            .map(|quota| self.used_bytes as f64 / quota as f64)
    }

    /// Above 80% of the quota; callers should suggest deleting old projects.
    pub fn is_near_quota(&self) -> bool {
        self.ratio().is_some_and(|ratio| ratio > Self::WARN_RATIO)
    }
}

enum AttemptError {
    Stale(sqlx::Error),
    Fatal(StoreError),
}

#[derive(Debug)]
pub struct StorageManager {
    connections: ConnectionManager,
    max_page_count: Option<u64>,
}

impl StorageManager {
    /// Creates the manager without touching the database; the connection opens on first use.
    pub fn new(config: &AppConfig) -> Self {
        Self {
            connections: ConnectionManager::new(
                &config.db_path,
                config.pool_size,
                config.max_page_count,
            ),
            max_page_count: config.max_page_count,
        }
    }

    /// Opens the database eagerly so schema problems surface at startup.
    pub async fn open(config: &AppConfig) -> Result<Arc<Self>, StoreError> {
        let manager = Arc::new(Self::new(config));
        manager.connections.get_connection().await?;
        Ok(manager)
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    /// Runs `op` in a transaction against `store`.
    ///
    /// A stale-connection failure invalidates the cached connection and retries the
    /// whole operation once; a second stale failure is returned as
    /// [`StoreError::ConnectionLost`]. Every other failure is returned immediately.
    pub async fn run_op<T, F>(&self, store: StoreName, mode: TxMode, mut op: F) -> Result<T, StoreError>
    where
        F: for<'c> FnMut(&'c mut SqliteConnection) -> OpFuture<'c, T> + Send,
        T: Send,
    {
        let mut retried = false;
        loop {
            match self.attempt(store, mode, &mut op).await {
                Ok(value) => return Ok(value),
                Err(AttemptError::Fatal(err)) => return Err(err),
                Err(AttemptError::Stale(source)) if retried => {
                    log::error!(
                        "{} store operation failed again on a stale connection: {}",
                        store.as_str(),
                        source
                    );
                    return Err(StoreError::ConnectionLost {
                        store: store.as_str(),
                        source,
                    });
                }
                Err(AttemptError::Stale(source)) => {
                    log::warn!(
                        "{} store operation hit a closed connection ({}), reconnecting and retrying",
                        store.as_str(),
                        source
                    );
                    self.connections.invalidate().await;
                    retried = true;
                }
            }
        }
    }

    async fn attempt<T, F>(&self, store: StoreName, mode: TxMode, op: &mut F) -> Result<T, AttemptError>
    where
        F: for<'c> FnMut(&'c mut SqliteConnection) -> OpFuture<'c, T> + Send,
        T: Send,
    {
        let classify = |err: sqlx::Error| classify_error(store, mode, err);

        let pool = self
            .connections
            .get_connection()
            .await
            .map_err(AttemptError::Fatal)?;
        let mut tx = pool.begin().await.map_err(classify)?;
        let value = op(&mut *tx).await.map_err(classify)?;
        match mode {
            TxMode::ReadWrite => tx.commit().await.map_err(classify)?,
            TxMode::ReadOnly => tx.rollback().await.map_err(classify)?,
        }
        Ok(value)
    }

    /// Estimates how much of the storage quota is in use.
    pub async fn usage(&self) -> Result<StorageUsage, StoreError> {
        let (page_count, page_size) = self
            .run_op::<(i64, i64), _>(StoreName::Settings, TxMode::ReadOnly, |conn| {
                Box::pin(async move {
                    let count = sqlx::query_scalar::<_, i64>("PRAGMA page_count")
                        .fetch_one(&mut *conn)
                        .await?;
                    let size = sqlx::query_scalar::<_, i64>("PRAGMA page_size")
                        .fetch_one(&mut *conn)
                        .await?;
                    Ok::<_, sqlx::Error>((count, size))
                })
            })
            .await?;

        let page_size = page_size.max(0) as u64;
        Ok(StorageUsage {
            used_bytes: page_count.max(0) as u64 * page_size,
            quota_bytes: self.max_page_count.map(|pages| pages * page_size),
        })
    }

    pub async fn close(&self) {
        self.connections.close().await;
    }
}

fn classify_error(store: StoreName, mode: TxMode, err: sqlx::Error) -> AttemptError {
    if is_stale_connection(&err) {
        return AttemptError::Stale(err);
    }
    if mode == TxMode::ReadWrite && is_quota_error(&err) {
        log::error!("Storage quota exhausted writing to the {} store", store.as_str());
        return AttemptError::Fatal(StoreError::QuotaExceeded {
            store: store.as_str(),
            source: err,
        });
    }
    log::error!("{} store operation failed: {}", store.as_str(), err);
    AttemptError::Fatal(StoreError::Database {
        store: store.as_str(),
        source: err,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_without_quota_is_never_near() {
        let usage = StorageUsage {
            used_bytes: 10_000,
            quota_bytes: None,
        };
        assert_eq!(usage.ratio(), None);
        assert!(!usage.is_near_quota());
    }

    #[test]
    fn usage_over_eighty_percent_is_near_quota() {
        let usage = StorageUsage {
            used_bytes: 81,
            quota_bytes: Some(100),
        };
        assert!(usage.is_near_quota());
        let usage = StorageUsage {
            used_bytes: 80,
            quota_bytes: Some(100),
        };
        assert!(!usage.is_near_quota());
    }

    #[test]
    fn stale_errors_are_retryable_and_quota_is_not() {
        assert!(matches!(
            classify_error(StoreName::Blobs, TxMode::ReadWrite, sqlx::Error::PoolClosed),
            AttemptError::Stale(_)
        ));
        assert!(matches!(
            classify_error(StoreName::Blobs, TxMode::ReadOnly, sqlx::Error::RowNotFound),
            AttemptError::Fatal(StoreError::Database { store: "blobs", .. })
        ));
    }
}
