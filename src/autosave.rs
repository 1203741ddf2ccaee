use crate::error::StoreError;
use crate::models::Project;
use crate::storage::DocumentStore;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;

/// Save state shown to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveStatus {
    Saved,
    Saving,
    Error(SaveFailure),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveFailure {
    /// Storage is full; the user has to delete projects or images.
    QuotaExceeded,
    Other(String),
}

/// Destination of autosaved project lists.
#[async_trait]
pub trait ProjectSink: Send + Sync {
    async fn save_project_list(&self, projects: &[Project]) -> Result<(), StoreError>;
}

#[async_trait]
impl ProjectSink for DocumentStore {
    async fn save_project_list(&self, projects: &[Project]) -> Result<(), StoreError> {
        DocumentStore::save_project_list(self, projects).await
    }
}

/// Debounced writer keeping the persisted project list in step with memory.
///
/// Every observed list replaces the pending one; a single background task writes
/// the latest list once no new list has arrived for the debounce period. The very
/// first observation is taken to be the initial load and is not saved.
///
/// Call [`shutdown`](Self::shutdown) before dropping the controller: dropping it
/// stops the flush task and discards a list still waiting for its debounce.
pub struct AutosaveController {
    pending: watch::Sender<Vec<Project>>,
    status: Arc<watch::Sender<SaveStatus>>,
    initial_seen: AtomicBool,
    shutdown: Arc<Notify>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl AutosaveController {
    /// Starts the flush task on the current tokio runtime.
    pub fn spawn(sink: Arc<dyn ProjectSink>, debounce: Duration) -> Self {
        let (pending, pending_rx) = watch::channel(Vec::new());
        let (status, _) = watch::channel(SaveStatus::Saved);
        let status = Arc::new(status);
        let shutdown = Arc::new(Notify::new());

        let task = tokio::spawn(flush_loop(
            sink,
            debounce,
            pending_rx,
            status.clone(),
            shutdown.clone(),
        ));

        Self {
            pending,
            status,
            initial_seen: AtomicBool::new(false),
            shutdown,
            task: Mutex::new(Some(task)),
        }
    }

    /// Records the latest in-memory list and (re)starts the debounce timer.
    pub fn observe(&self, projects: Vec<Project>) {
        if !self.initial_seen.swap(true, Ordering::SeqCst) {
            log::debug!("Skipping autosave for the initial project load");
            return;
        }
        // The list goes out first so a save finishing in between sees it as superseded
        self.pending.send_replace(projects);
        self.status.send_replace(SaveStatus::Saving);
    }

    /// True while an observed list has not been written yet.
    pub fn has_unsaved_changes(&self) -> bool {
        *self.status.borrow() == SaveStatus::Saving
    }

    pub fn status(&self) -> SaveStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SaveStatus> {
        self.status.subscribe()
    }

    /// Writes any pending list immediately and stops the flush task.
    pub async fn shutdown(&self) {
        let Some(task) = self.task.lock().await.take() else {
            return;
        };
        self.shutdown.notify_one();
        if let Err(e) = task.await {
            log::error!("Autosave task ended abnormally: {}", e);
        }
    }
}

impl Drop for AutosaveController {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            if self.has_unsaved_changes() {
                log::warn!("Autosave dropped before shutdown; the latest project changes were not saved");
            }
            task.abort();
        }
    }
}

async fn flush_loop(
    sink: Arc<dyn ProjectSink>,
    debounce: Duration,
    mut pending: watch::Receiver<Vec<Project>>,
    status: Arc<watch::Sender<SaveStatus>>,
    shutdown: Arc<Notify>,
) {
    loop {
        tokio::select! {
            // Pending changes win over shutdown so nothing observed is lost
            biased;
            changed = pending.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            _ = shutdown.notified() => return,
        }

        // Restart the timer on every change until the list stays quiet
        let mut stopping = false;
        loop {
            tokio::select! {
                biased;
                _ = shutdown.notified() => {
                    stopping = true;
                    break;
                }
                changed = pending.changed() => {
                    if changed.is_err() {
                        stopping = true;
                        break;
                    }
                }
                _ = tokio::time::sleep(debounce) => break,
            }
        }

        let projects = pending.borrow_and_update().clone();
        let outcome = sink.save_project_list(&projects).await;

        // A newer list is already waiting; leave the status at Saving for it
        let superseded = pending.has_changed().unwrap_or(false);
        match outcome {
            Ok(()) => {
                log::debug!("Autosaved {} projects", projects.len());
                if !superseded {
                    status.send_replace(SaveStatus::Saved);
                }
            }
            Err(e) => {
                let failure = if e.is_quota_exceeded() {
                    log::error!("Storage limit reached. Could not save project changes: {}", e);
                    SaveFailure::QuotaExceeded
                } else {
                    log::error!("Failed to auto-save projects: {}", e);
                    SaveFailure::Other(e.to_string())
                };
                if !superseded {
                    status.send_replace(SaveStatus::Error(failure));
                }
            }
        }

        if stopping {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingSink {
        saves: StdMutex<Vec<Vec<Project>>>,
        fail_with_quota: AtomicBool,
        fail_with_other: AtomicBool,
    }

    impl RecordingSink {
        fn saves(&self) -> Vec<Vec<Project>> {
            self.saves.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ProjectSink for RecordingSink {
        async fn save_project_list(&self, projects: &[Project]) -> Result<(), StoreError> {
            if self.fail_with_quota.load(Ordering::SeqCst) {
                return Err(StoreError::QuotaExceeded {
                    store: "documents",
                    source: sqlx::Error::PoolTimedOut,
                });
            }
            if self.fail_with_other.load(Ordering::SeqCst) {
                return Err(StoreError::Database {
                    store: "documents",
                    source: sqlx::Error::RowNotFound,
                });
            }
            self.saves.lock().unwrap().push(projects.to_vec());
            Ok(())
        }
    }

    // Holds the first save until released
    #[derive(Default)]
    struct GatedSink {
        release: Notify,
        held_once: AtomicBool,
        names: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl ProjectSink for GatedSink {
        async fn save_project_list(&self, projects: &[Project]) -> Result<(), StoreError> {
            if !self.held_once.swap(true, Ordering::SeqCst) {
                self.release.notified().await;
            }
            self.names
                .lock()
                .unwrap()
                .extend(projects.iter().map(|p| p.name.clone()));
            Ok(())
        }
    }

    fn named(id: i64, name: &str) -> Project {
        let mut project = Project::new(id);
        project.name = name.to_string();
        project
    }

    const DEBOUNCE: Duration = Duration::from_millis(1000);

    #[tokio::test(start_paused = true)]
    async fn initial_load_is_not_saved() {
        let sink = Arc::new(RecordingSink::default());
        let autosave = AutosaveController::spawn(sink.clone(), DEBOUNCE);

        autosave.observe(vec![named(1, "loaded")]);
        tokio::time::sleep(DEBOUNCE * 3).await;

        assert!(sink.saves().is_empty());
        assert_eq!(autosave.status(), SaveStatus::Saved);
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_mutations_collapse_into_one_save_of_the_last_state() {
        let sink = Arc::new(RecordingSink::default());
        let autosave = AutosaveController::spawn(sink.clone(), DEBOUNCE);
        autosave.observe(Vec::new());

        for i in 0..10 {
            autosave.observe(vec![named(1, &format!("draft {}", i))]);
            assert_eq!(autosave.status(), SaveStatus::Saving);
            tokio::time::sleep(Duration::from_millis(300)).await;
        }
        assert!(sink.saves().is_empty(), "no write may happen inside the window");

        tokio::time::sleep(DEBOUNCE + Duration::from_millis(100)).await;

        let saves = sink.saves();
        assert_eq!(saves.len(), 1);
        assert_eq!(saves[0][0].name, "draft 9");
        assert_eq!(autosave.status(), SaveStatus::Saved);
    }

    #[tokio::test(start_paused = true)]
    async fn separate_windows_save_separately() {
        let sink = Arc::new(RecordingSink::default());
        let autosave = AutosaveController::spawn(sink.clone(), DEBOUNCE);
        autosave.observe(Vec::new());

        autosave.observe(vec![named(1, "first")]);
        tokio::time::sleep(DEBOUNCE * 2).await;
        autosave.observe(vec![named(1, "second")]);
        tokio::time::sleep(DEBOUNCE * 2).await;

        let names: Vec<String> = sink
            .saves()
            .into_iter()
            .map(|list| list[0].name.clone())
            .collect();
        assert_eq!(names, vec!["first", "second"]);
    }

    #[tokio::test(start_paused = true)]
    async fn quota_failure_is_reported_distinctly() {
        let sink = Arc::new(RecordingSink::default());
        sink.fail_with_quota.store(true, Ordering::SeqCst);
        let autosave = AutosaveController::spawn(sink.clone(), DEBOUNCE);
        autosave.observe(Vec::new());

        autosave.observe(vec![named(1, "too big")]);
        tokio::time::sleep(DEBOUNCE * 2).await;

        assert_eq!(
            autosave.status(),
            SaveStatus::Error(SaveFailure::QuotaExceeded)
        );

        // The next mutation triggers a fresh attempt
        sink.fail_with_quota.store(false, Ordering::SeqCst);
        autosave.observe(vec![named(1, "smaller")]);
        tokio::time::sleep(DEBOUNCE * 2).await;
        assert_eq!(autosave.status(), SaveStatus::Saved);
        assert_eq!(sink.saves().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_flushes_pending_state() {
        let sink = Arc::new(RecordingSink::default());
        let autosave = AutosaveController::spawn(sink.clone(), DEBOUNCE);
        autosave.observe(Vec::new());

        autosave.observe(vec![named(1, "unsaved")]);
        autosave.shutdown().await;

        let saves = sink.saves();
        assert_eq!(saves.len(), 1);
        assert_eq!(saves[0][0].name, "unsaved");
    }

    #[tokio::test(start_paused = true)]
    async fn other_failures_set_a_generic_error() {
        let sink = Arc::new(RecordingSink::default());
        sink.fail_with_other.store(true, Ordering::SeqCst);
        let autosave = AutosaveController::spawn(sink.clone(), DEBOUNCE);
        autosave.observe(Vec::new());

        autosave.observe(vec![named(1, "lost")]);
        tokio::time::sleep(DEBOUNCE * 2).await;

        match autosave.status() {
            SaveStatus::Error(SaveFailure::Other(message)) => {
                assert!(message.contains("documents"), "unexpected message: {}", message)
            }
            other => panic!("expected a generic save error, got {:?}", other),
        }
        assert!(!autosave.has_unsaved_changes());
    }

    #[tokio::test(start_paused = true)]
    async fn change_during_a_save_keeps_the_status_saving() {
        let sink = Arc::new(GatedSink::default());
        let autosave = AutosaveController::spawn(sink.clone(), DEBOUNCE);
        autosave.observe(Vec::new());

        autosave.observe(vec![named(1, "first")]);
        tokio::time::sleep(DEBOUNCE + Duration::from_millis(10)).await;

        // The first save is still in flight when the next change arrives
        autosave.observe(vec![named(1, "second")]);
        sink.release.notify_one();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(autosave.status(), SaveStatus::Saving);
        assert!(autosave.has_unsaved_changes());

        tokio::time::sleep(DEBOUNCE * 2).await;
        assert_eq!(*sink.names.lock().unwrap(), vec!["first", "second"]);
        assert_eq!(autosave.status(), SaveStatus::Saved);
    }

    #[tokio::test(start_paused = true)]
    async fn pending_changes_are_reported_until_shutdown() {
        let sink = Arc::new(RecordingSink::default());
        let autosave = AutosaveController::spawn(sink.clone(), DEBOUNCE);
        autosave.observe(Vec::new());
        assert!(!autosave.has_unsaved_changes());

        autosave.observe(vec![named(1, "pending")]);
        assert!(autosave.has_unsaved_changes());

        autosave.shutdown().await;
        assert!(!autosave.has_unsaved_changes());
        assert_eq!(sink.saves().len(), 1);
    }
}
