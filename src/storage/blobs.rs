use super::{StorageManager, StoreName, TxMode};
use crate::error::StoreError;
use crate::models::BlobId;
use std::sync::Arc;
use uuid::Uuid;

/// Key → binary payload store for images and audio.
///
/// Blobs carry no metadata. Whoever references a blob owns its lifecycle and must
/// delete it before dropping the reference.
#[derive(Debug, Clone)]
pub struct BlobStore {
    storage: Arc<StorageManager>,
}

impl BlobStore {
    pub fn new(storage: Arc<StorageManager>) -> Self {
        Self { storage }
    }

    /// Stores `data` under a fresh random id and returns the id.
    pub async fn save(&self, data: Vec<u8>) -> Result<BlobId, StoreError> {
        let id = Uuid::new_v4().to_string();
        log::debug!("Saving blob {} ({} bytes)", id, data.len());

        let key = id.clone();
        self.storage
            .run_op::<(), _>(StoreName::Blobs, TxMode::ReadWrite, move |conn| {
                let key = key.clone();
                let data = data.clone();
                Box::pin(async move {
                    sqlx::query("INSERT OR REPLACE INTO blobs (id, data) VALUES (?, ?)")
                        .bind(key)
                        .bind(data)
                        .execute(conn)
                        .await
                        .map(|_| ())
                })
            })
            .await?;

        Ok(id)
    }

    /// Returns the payload, or `None` when no blob has that id.
    pub async fn get(&self, id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        log::debug!("Fetching blob {}", id);
        let key = id.to_string();
        self.storage
            .run_op(StoreName::Blobs, TxMode::ReadOnly, move |conn| {
                let key = key.clone();
                Box::pin(async move {
                    sqlx::query_scalar::<_, Vec<u8>>("SELECT data FROM blobs WHERE id = ?")
                        .bind(key)
                        .fetch_optional(conn)
                        .await
                })
            })
            .await
    }

    /// Removes the blob. Deleting an id that does not exist is not an error.
    pub async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let key = id.to_string();
        let removed = self
            .storage
            .run_op::<u64, _>(StoreName::Blobs, TxMode::ReadWrite, move |conn| {
                let key = key.clone();
                Box::pin(async move {
                    sqlx::query("DELETE FROM blobs WHERE id = ?")
                        .bind(key)
                        .execute(conn)
                        .await
                        .map(|result| result.rows_affected())
                })
            })
            .await?;

        if removed == 0 {
            log::debug!("Blob {} was already absent", id);
        } else {
            log::debug!("Deleted blob {}", id);
        }
        Ok(())
    }

    /// Deletes every id concurrently. Failures are logged and skipped; returns how many failed.
    pub async fn delete_all_best_effort<I>(&self, ids: I) -> usize
    where
        I: IntoIterator<Item = BlobId>,
    {
        let results = futures::future::join_all(ids.into_iter().map(|id| async move {
            let result = self.delete(&id).await;
            if let Err(e) = &result {
                log::error!("Failed to delete asset {}: {}", id, e);
            }
            result
        }))
        .await;
        results.iter().filter(|result| result.is_err()).count()
    }

    /// Every stored blob id, for maintenance sweeps.
    pub async fn list_ids(&self) -> Result<Vec<BlobId>, StoreError> {
        self.storage
            .run_op(StoreName::Blobs, TxMode::ReadOnly, |conn| {
                Box::pin(async move {
                    sqlx::query_scalar::<_, String>("SELECT id FROM blobs ORDER BY id")
                        .fetch_all(conn)
                        .await
                })
            })
            .await
    }
}
