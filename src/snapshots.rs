use crate::error::{StoreError, ValidationError};
use crate::history::BoundedHistory;
use crate::models::{BlobId, Project, ProjectSnapshot};
use crate::storage::SettingsStore;
use chrono::Utc;
use std::collections::HashSet;

pub const MAX_SNAPSHOTS: usize = 3;

const SNAPSHOT_KEY_PREFIX: &str = "projectSnapshots_";

type SnapshotList = BoundedHistory<ProjectSnapshot, MAX_SNAPSHOTS>;

fn snapshot_key(project_id: i64) -> String {
    format!("{}{}", SNAPSHOT_KEY_PREFIX, project_id)
}

/// Keeps the last few copies of each project so destructive regeneration can be undone.
///
/// Snapshot lists live in the settings store, one JSON list per project id, and are
/// not schema-checked on write; anything popped must go through
/// [`validate_snapshot`] before use.
#[derive(Debug, Clone)]
pub struct SnapshotManager {
    settings: SettingsStore,
}

impl SnapshotManager {
    pub fn new(settings: SettingsStore) -> Self {
        Self { settings }
    }

    /// Stores a timestamped deep copy of `project`, dropping the oldest beyond three.
    ///
    /// The list is read and rewritten in one transaction, so concurrent pushes for
    /// the same project all land.
    pub async fn push_snapshot(&self, project_id: i64, project: &Project) -> Result<(), StoreError> {
        let body = serde_json::to_value(project).map_err(|source| StoreError::Encode {
            what: "project snapshot",
            source,
        })?;
        let snapshot = ProjectSnapshot {
            timestamp: Utc::now().timestamp_millis(),
            project: body,
        };

        let key = snapshot_key(project_id);
        let list_key = key.clone();
        let kept = self
            .settings
            .update(&key, move |raw| {
                let mut list = read_list(&list_key, raw);
                list.push_with(snapshot.clone(), |dropped| {
                    log::debug!(
                        "Dropping oldest snapshot of project {} taken at {}",
                        project_id,
                        dropped.timestamp
                    )
                });
                Ok((Some(serde_json::to_string(&list)?), list.len()))
            })
            .await?;
        log::info!("Saved snapshot of project {} ({} kept)", project_id, kept);
        Ok(())
    }

    /// Removes and returns the most recent snapshot, or `None` if there are none.
    pub async fn pop_latest_snapshot(
        &self,
        project_id: i64,
    ) -> Result<Option<ProjectSnapshot>, StoreError> {
        let key = snapshot_key(project_id);
        let list_key = key.clone();
        let latest = self
            .settings
            .update(&key, move |raw| {
                let mut list = read_list(&list_key, raw);
                match list.pop_latest() {
                    Some(latest) => Ok((Some(serde_json::to_string(&list)?), Some(latest))),
                    None => Ok((None, None)),
                }
            })
            .await?;
        if latest.is_none() {
            log::debug!("No snapshots stored for project {}", project_id);
        }
        Ok(latest)
    }

    /// Blob ids referenced by any readable snapshot of one project.
    pub async fn referenced_blobs(&self, project_id: i64) -> Result<HashSet<BlobId>, StoreError> {
        Ok(self
            .list(project_id)
            .await?
            .into_iter()
            .filter_map(|snapshot| serde_json::from_value::<Project>(snapshot.project).ok())
            .flat_map(|project| project.blob_ids())
            .collect())
    }

    /// Snapshots for one project, oldest first.
    pub async fn list(&self, project_id: i64) -> Result<Vec<ProjectSnapshot>, StoreError> {
        Ok(self.load(project_id).await?.into_vec())
    }

    /// Every stored snapshot across all projects.
    pub async fn all(&self) -> Result<Vec<ProjectSnapshot>, StoreError> {
        let mut snapshots = Vec::new();
        for key in self.settings.keys_with_prefix(SNAPSHOT_KEY_PREFIX).await? {
            if let Some(raw) = self.settings.get(&key).await? {
                snapshots.extend(parse_list(&key, &raw).into_vec());
            }
        }
        Ok(snapshots)
    }

    pub async fn clear(&self, project_id: i64) -> Result<(), StoreError> {
        self.settings.remove(&snapshot_key(project_id)).await
    }

    async fn load(&self, project_id: i64) -> Result<SnapshotList, StoreError> {
        let key = snapshot_key(project_id);
        Ok(read_list(&key, self.settings.get(&key).await?))
    }
}

fn read_list(key: &str, raw: Option<String>) -> SnapshotList {
    raw.map(|raw| parse_list(key, &raw)).unwrap_or_default()
}

// Corrupt lists are treated as empty rather than failing the caller
fn parse_list(key: &str, raw: &str) -> SnapshotList {
    serde_json::from_str(raw).unwrap_or_else(|e| {
        log::warn!("Ignoring unreadable snapshot list {}: {}", key, e);
        SnapshotList::new()
    })
}

/// Checks a popped snapshot before it is allowed to replace a project.
pub fn validate_snapshot(snapshot: &ProjectSnapshot) -> Result<Project, ValidationError> {
    Project::from_value(snapshot.project.clone())
}
