use std::sync::Arc;

use thiserror::Error;

// SQLite primary result codes we care about (extended codes share the low byte)
const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;
const SQLITE_FULL: i32 = 13;

/// Errors surfaced by the local stores.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to open storyboard database: {0}")]
    Open(#[source] Arc<sqlx::Error>),

    #[error("Database schema version {found} is newer than supported version {supported}")]
    SchemaTooNew { found: i64, supported: i64 },

    /// The embedded database ran out of room. Never retried.
    #[error("Storage quota exhausted while writing to the {store} store")]
    QuotaExceeded {
        store: &'static str,
        #[source]
        source: sqlx::Error,
    },

    /// The connection went stale twice in a row.
    #[error("Connection to the {store} store was lost and could not be re-established: {source}")]
    ConnectionLost {
        store: &'static str,
        #[source]
        source: sqlx::Error,
    },

    #[error("Operation on the {store} store failed: {source}")]
    Database {
        store: &'static str,
        #[source]
        source: sqlx::Error,
    },

    #[error("Failed to encode {what}: {source}")]
    Encode {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, StoreError::QuotaExceeded { .. })
    }
}

/// True when the error means the cached connection can no longer be used.
pub(crate) fn is_stale_connection(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::PoolClosed | sqlx::Error::WorkerCrashed)
}

fn primary_code(err: &sqlx::Error) -> Option<i32> {
    match err {
        sqlx::Error::Database(db_err) => db_err
            .code()
            .and_then(|code| code.parse::<i32>().ok())
            .map(|code| code & 0xff),
        _ => None,
    }
}

pub(crate) fn is_quota_error(err: &sqlx::Error) -> bool {
    primary_code(err) == Some(SQLITE_FULL)
}

pub(crate) fn is_busy_error(err: &sqlx::Error) -> bool {
    matches!(primary_code(err), Some(SQLITE_BUSY) | Some(SQLITE_LOCKED))
}

/// Reasons a stored record is rejected as a project.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Record does not have the project shape: {0}")]
    Shape(String),

    #[error("Project id must be positive, got {0}")]
    InvalidId(i64),

    #[error("Variant count must be between 1 and 3, got {0}")]
    VariantCount(u8),

    #[error("Scene {0} references an empty image id")]
    EmptyImageId(usize),
}

/// Failures reported by the generative collaborator. Passed through untouched.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("Request blocked by content policy: {0}")]
    ContentPolicy(String),

    #[error("Rate limit or quota reached: {0}")]
    RateLimited(String),

    #[error("Malformed response from generator: {0}")]
    MalformedResponse(String),

    #[error("Generator request failed: {0}")]
    Other(String),
}

/// Errors returned by the workspace commands.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("No project is currently selected")]
    NoCurrentProject,

    #[error("Project index {0} is out of range")]
    ProjectIndexOutOfRange(usize),

    #[error("Project {0} not found")]
    ProjectNotFound(i64),

    #[error("Scene index {0} is out of range")]
    SceneIndexOutOfRange(usize),

    #[error("Daily request limit of {limit} reached. Please wait until tomorrow.")]
    DailyLimitReached { limit: u32 },

    #[error("Invalid upload: {0}")]
    InvalidUpload(String),

    #[error("Generate a concept before generating the storyboard")]
    MissingConcept,

    #[error("Add lyrics before generating an idea")]
    MissingLyrics,

    #[error("No image to edit for scene {0}")]
    NothingToEdit(usize),

    #[error("Image {0} not found in the blob store")]
    ImageMissing(String),

    #[error("Only the current project can be reverted")]
    RevertNotCurrent,

    #[error("Nothing to export: {0}")]
    NothingToExport(&'static str),

    #[error("Failed to build export archive: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("Failed to serialize export: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Generation(#[from] GenerationError),
}

impl AppError {
    /// Quota exhaustion is reported separately so callers can ask the user to free space.
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, AppError::Store(err) if err.is_quota_exceeded())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_closed_is_stale() {
        assert!(is_stale_connection(&sqlx::Error::PoolClosed));
        assert!(is_stale_connection(&sqlx::Error::WorkerCrashed));
        assert!(!is_stale_connection(&sqlx::Error::RowNotFound));
    }

    #[test]
    fn non_database_errors_have_no_code() {
        assert!(!is_quota_error(&sqlx::Error::PoolTimedOut));
        assert!(!is_busy_error(&sqlx::Error::PoolTimedOut));
    }

    #[test]
    fn app_error_detects_wrapped_quota() {
        let err = AppError::Store(StoreError::QuotaExceeded {
            store: "blobs",
            source: sqlx::Error::PoolTimedOut,
        });
        assert!(err.is_quota_exceeded());
        assert!(!AppError::NoCurrentProject.is_quota_exceeded());
    }
}
