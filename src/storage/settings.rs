use super::{StorageManager, StoreName, TxMode};
use crate::error::StoreError;
use std::sync::Arc;

/// Simple persistent key → string store for small app settings.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    storage: Arc<StorageManager>,
}

impl SettingsStore {
    pub fn new(storage: Arc<StorageManager>) -> Self {
        Self { storage }
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let key = key.to_string();
        self.storage
            .run_op(StoreName::Settings, TxMode::ReadOnly, move |conn| {
                let key = key.clone();
                Box::pin(async move {
                    sqlx::query_scalar::<_, String>("SELECT value FROM settings WHERE key = ?")
                        .bind(key)
                        .fetch_optional(conn)
                        .await
                })
            })
            .await
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        log::debug!("Updating setting {}", key);
        let key = key.to_string();
        let value = value.to_string();
        self.storage
            .run_op(StoreName::Settings, TxMode::ReadWrite, move |conn| {
                let key = key.clone();
                let value = value.clone();
                Box::pin(async move {
                    sqlx::query(
                        "INSERT INTO settings (key, value) VALUES (?, ?)
                         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                    )
                    .bind(key)
                    .bind(value)
                    .execute(conn)
                    .await
                    .map(|_| ())
                })
            })
            .await
    }

    /// Reads `key`, hands the stored value to `change` and writes back what it
    /// returns, all inside one write transaction.
    ///
    /// `change` returns the replacement value (`None` leaves the row as it is) and
    /// the result for the caller. It runs again if the connection has to be reopened.
    pub async fn update<T, F>(&self, key: &str, change: F) -> Result<T, StoreError>
    where
        F: Fn(Option<String>) -> Result<(Option<String>, T), serde_json::Error>
            + Send
            + Sync
            + 'static,
        T: Send + 'static,
    {
        let key = key.to_string();
        let change = Arc::new(change);
        self.storage
            .run_op::<T, _>(StoreName::Settings, TxMode::ReadWrite, move |conn| {
                let key = key.clone();
                let change = change.clone();
                Box::pin(async move {
                    // A no-op write takes the write lock before the read
                    sqlx::query("UPDATE settings SET value = value WHERE key = ?")
                        .bind(key.as_str())
                        .execute(&mut *conn)
                        .await?;
                    let current = sqlx::query_scalar::<_, String>(
                        "SELECT value FROM settings WHERE key = ?",
                    )
                    .bind(key.as_str())
                    .fetch_optional(&mut *conn)
                    .await?;

                    let (next, output) =
                        (*change)(current).map_err(|e| sqlx::Error::Encode(Box::new(e)))?;
                    if let Some(value) = next {
                        sqlx::query(
                            "INSERT INTO settings (key, value) VALUES (?, ?)
                             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                        )
                        .bind(key.as_str())
                        .bind(value)
                        .execute(&mut *conn)
                        .await?;
                    }
                    Ok(output)
                })
            })
            .await
    }

    pub async fn remove(&self, key: &str) -> Result<(), StoreError> {
        let key = key.to_string();
        self.storage
            .run_op(StoreName::Settings, TxMode::ReadWrite, move |conn| {
                let key = key.clone();
                Box::pin(async move {
                    sqlx::query("DELETE FROM settings WHERE key = ?")
                        .bind(key)
                        .execute(conn)
                        .await
                        .map(|_| ())
                })
            })
            .await
    }

    /// All keys starting with `prefix`, in key order.
    pub async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        // Escape LIKE wildcards so the prefix matches literally
        let pattern = format!(
            "{}%",
            prefix
                .replace('\\', "\\\\")
                .replace('%', "\\%")
                .replace('_', "\\_")
        );
        self.storage
            .run_op(StoreName::Settings, TxMode::ReadOnly, move |conn| {
                let pattern = pattern.clone();
                Box::pin(async move {
                    sqlx::query_scalar::<_, String>(
                        "SELECT key FROM settings WHERE key LIKE ? ESCAPE '\\' ORDER BY key",
                    )
                    .bind(pattern)
                    .fetch_all(conn)
                    .await
                })
            })
            .await
    }
}
