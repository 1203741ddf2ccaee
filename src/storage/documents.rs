use super::{StorageManager, StoreName, TxMode};
use crate::error::StoreError;
use crate::models::Project;
use std::sync::Arc;

/// Key of the single document holding the whole project list.
pub const PROJECTS_KEY: &str = "projects";

/// Structured document store. Holds the full project list as one JSON document.
#[derive(Debug, Clone)]
pub struct DocumentStore {
    storage: Arc<StorageManager>,
}

impl DocumentStore {
    pub fn new(storage: Arc<StorageManager>) -> Self {
        Self { storage }
    }

    /// Overwrites the stored list with `projects` (last writer wins).
    pub async fn save_project_list(&self, projects: &[Project]) -> Result<(), StoreError> {
        let json = serde_json::to_string(projects).map_err(|source| StoreError::Encode {
            what: "project list",
            source,
        })?;
        log::debug!(
            "Saving {} projects ({} bytes of JSON)",
            projects.len(),
            json.len()
        );
        self.put(PROJECTS_KEY, json).await
    }

    /// Loads the stored list. Records that fail validation are logged and dropped;
    /// a missing or unreadable document loads as an empty list.
    pub async fn load_project_list(&self) -> Result<Vec<Project>, StoreError> {
        let Some(raw) = self.fetch(PROJECTS_KEY).await? else {
            log::info!("No stored project list found, starting empty");
            return Ok(Vec::new());
        };

        let records = match serde_json::from_str::<serde_json::Value>(&raw) {
            Ok(serde_json::Value::Array(records)) => records,
            Ok(_) => {
                log::warn!("Stored project list is not an array, ignoring it");
                return Ok(Vec::new());
            }
            Err(e) => {
                log::warn!("Stored project list is not valid JSON ({}), ignoring it", e);
                return Ok(Vec::new());
            }
        };

        let total = records.len();
        let projects: Vec<Project> = records
            .into_iter()
            .enumerate()
            .filter_map(|(index, record)| match Project::from_value(record) {
                Ok(project) => Some(project),
                Err(e) => {
                    log::warn!("Discarding invalid stored project at index {}: {}", index, e);
                    None
                }
            })
            .collect();

        log::info!("Loaded {} of {} stored projects", projects.len(), total);
        Ok(projects)
    }

    async fn put(&self, key: &str, value: String) -> Result<(), StoreError> {
        let key = key.to_string();
        self.storage
            .run_op(StoreName::Documents, TxMode::ReadWrite, move |conn| {
                let key = key.clone();
                let value = value.clone();
                Box::pin(async move {
                    sqlx::query(
                        "INSERT INTO documents (key, value) VALUES (?, ?)
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

    async fn fetch(&self, key: &str) -> Result<Option<String>, StoreError> {
        let key = key.to_string();
        self.storage
            .run_op(StoreName::Documents, TxMode::ReadOnly, move |conn| {
                let key = key.clone();
                Box::pin(async move {
                    sqlx::query_scalar::<_, String>("SELECT value FROM documents WHERE key = ?")
                        .bind(key)
                        .fetch_optional(conn)
                        .await
                })
            })
            .await
    }

    /// Writes raw text under the project-list key. Used by tests and repair tooling.
    pub async fn put_raw_project_list(&self, raw: String) -> Result<(), StoreError> {
        self.put(PROJECTS_KEY, raw).await
    }
}
