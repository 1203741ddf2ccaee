use crate::api::StoryboardGenerator;
use crate::autosave::{AutosaveController, SaveStatus};
use crate::config::AppConfig;
use crate::error::{AppError, StoreError};
use crate::media::BlobUrlRegistry;
use crate::models::Project;
use crate::snapshots::SnapshotManager;
use crate::storage::{BlobStore, DocumentStore, SettingsStore, StorageManager};
use crate::usage::DailyRequestCounter;
use std::sync::Arc;
use tokio::sync::Mutex;

/// The in-memory project list and the selected entry.
#[derive(Debug, Clone, Default)]
pub struct Workspace {
    pub projects: Vec<Project>,
    pub current: Option<usize>, // index into `projects`
}

impl Workspace {
    pub fn current_project(&self) -> Option<&Project> {
        self.current.and_then(|index| self.projects.get(index))
    }

    pub fn position(&self, project_id: i64) -> Option<usize> {
        self.projects.iter().position(|p| p.id == project_id)
    }

    pub fn project_mut(&mut self, project_id: i64) -> Option<&mut Project> {
        self.projects.iter_mut().find(|p| p.id == project_id)
    }
}

// Core application state shared by every command
#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<StorageManager>,
    pub blobs: BlobStore,
    pub documents: DocumentStore,
    pub settings: SettingsStore,
    pub snapshots: SnapshotManager,
    pub usage: DailyRequestCounter,
    pub generator: Arc<dyn StoryboardGenerator>, // Hold the trait object
    pub blob_urls: BlobUrlRegistry,
    pub workspace: Arc<Mutex<Workspace>>,
    pub autosave: Arc<AutosaveController>,
    pub config: Arc<AppConfig>,
}

impl AppState {
    /// Opens storage, loads the saved projects and starts autosave.
    ///
    /// Nothing is selected after loading; callers pick a project with
    /// [`crate::commands::select_project`].
    pub async fn new(
        config: AppConfig,
        generator: Arc<dyn StoryboardGenerator>,
    ) -> Result<Self, StoreError> {
        let storage = StorageManager::open(&config).await?;
        let blobs = BlobStore::new(storage.clone());
        let documents = DocumentStore::new(storage.clone());
        let settings = SettingsStore::new(storage.clone());

        let projects = documents.load_project_list().await?;
        log::info!("Loaded {} projects from {}", projects.len(), config.db_path.display());

        let autosave = AutosaveController::spawn(Arc::new(documents.clone()), config.autosave_debounce);
        // The initial load counts as the first observed change and is not written back
        autosave.observe(projects.clone());

        Ok(Self {
            blobs,
            documents,
            snapshots: SnapshotManager::new(settings.clone()),
            usage: DailyRequestCounter::new(settings.clone(), config.daily_request_limit),
            settings,
            storage,
            generator,
            blob_urls: BlobUrlRegistry::new(),
            workspace: Arc::new(Mutex::new(Workspace {
                projects,
                current: None,
            })),
            autosave: Arc::new(autosave),
            config: Arc::new(config),
        })
    }

    pub async fn projects(&self) -> Vec<Project> {
        self.workspace.lock().await.projects.clone()
    }

    pub async fn current_project(&self) -> Result<Project, AppError> {
        self.workspace
            .lock()
            .await
            .current_project()
            .cloned()
            .ok_or(AppError::NoCurrentProject)
    }

    pub fn save_status(&self) -> SaveStatus {
        self.autosave.status()
    }

    /// Applies `change` to the workspace. A successful change is handed to autosave.
    pub async fn mutate<R, F>(&self, change: F) -> Result<R, AppError>
    where
        F: FnOnce(&mut Workspace) -> Result<R, AppError>,
    {
        let mut workspace = self.workspace.lock().await;
        let result = change(&mut workspace)?;
        self.autosave.observe(workspace.projects.clone());
        Ok(result)
    }

    pub async fn project(&self, project_id: i64) -> Result<Project, AppError> {
        let workspace = self.workspace.lock().await;
        workspace
            .position(project_id)
            .map(|index| workspace.projects[index].clone())
            .ok_or(AppError::ProjectNotFound(project_id))
    }

    /// Applies `change` to the project with `project_id`, wherever it now sits in the list.
    pub async fn update_project<R, F>(&self, project_id: i64, change: F) -> Result<R, AppError>
    where
        F: FnOnce(&mut Project) -> Result<R, AppError>,
    {
        self.mutate(|workspace| {
            let project = workspace
                .project_mut(project_id)
                .ok_or(AppError::ProjectNotFound(project_id))?;
            let result = change(project);
            // The id is immutable whatever the change did
            project.id = project_id;
            result
        })
        .await
    }

    /// Flushes pending autosave work and closes the database.
    pub async fn shutdown(&self) {
        log::info!("Shutting down: flushing pending project changes");
        self.autosave.shutdown().await;
        self.storage.close().await;
    }
}
