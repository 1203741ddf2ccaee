// Maintenance tool for a storyboard database: inspect, export and clean up projects
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use storyboard_store::commands::{delete_project_assets, sweep_orphans};
use storyboard_store::config::AppConfig;
use storyboard_store::export;
use storyboard_store::models::Project;
use storyboard_store::snapshots::SnapshotManager;
use storyboard_store::storage::{BlobStore, DocumentStore, SettingsStore, StorageManager};

#[derive(Parser, Debug)]
#[command(name = "storyboard-store", version, about = "Inspect and maintain a storyboard database")]
struct Cli {
    /// Database file; overrides STORYBOARD_DB_PATH
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List stored projects
    List,
    /// Write the storyboard of a project as JSON
    ExportJson {
        project_id: i64,
        /// Output directory
        #[arg(long, default_value = ".")]
        out: PathBuf,
    },
    /// Write every image of a project into a ZIP archive
    ExportImages {
        project_id: i64,
        #[arg(long, default_value = ".")]
        out: PathBuf,
    },
    /// Delete a project with all of its images, audio and snapshots
    Delete { project_id: i64 },
    /// Delete blobs no project or snapshot refers to
    Sweep,
    /// Show storage and daily request usage
    Usage,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    env_logger::init();

    let cli = Cli::parse();
    let mut config = AppConfig::from_env().context("Invalid configuration")?;
    if let Some(db) = cli.db {
        config.db_path = db;
    }

    let storage = StorageManager::open(&config)
        .await
        .with_context(|| format!("Failed to open {}", config.db_path.display()))?;
    let blobs = BlobStore::new(storage.clone());
    let documents = DocumentStore::new(storage.clone());
    let settings = SettingsStore::new(storage.clone());
    let snapshots = SnapshotManager::new(settings.clone());

    let projects = documents
        .load_project_list()
        .await
        .context("Failed to load projects")?;

    let outcome = match cli.command {
        Command::List => {
            for project in &projects {
                let images: usize = project
                    .storyboard
                    .iter()
                    .map(|scene| scene.image_history.iter().map(Vec::len).sum::<usize>())
                    .sum();
                println!(
                    "{}\t{}\t{} scenes\t{} images",
                    project.id,
                    project.name,
                    project.storyboard.len(),
                    images
                );
            }
            Ok(())
        }
        Command::ExportJson { project_id, out } => {
            let project = find_project(&projects, project_id)?;
            let json = export::storyboard_json(project)?;
            let path = out.join(export::storyboard_file_name(&project.name));
            tokio::fs::write(&path, json)
                .await
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Wrote {}", path.display());
            Ok(())
        }
        Command::ExportImages { project_id, out } => {
            let project = find_project(&projects, project_id)?;
            let archive = export::image_archive(&blobs, project).await?;
            let path = out.join(&archive.file_name);
            tokio::fs::write(&path, &archive.bytes)
                .await
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!(
                "Wrote {} ({} images, {} missing)",
                path.display(),
                archive.written,
                archive.skipped
            );
            Ok(())
        }
        Command::Delete { project_id } => {
            let project = find_project(&projects, project_id)?.clone();
            let failed = delete_project_assets(&blobs, &project).await;
            snapshots.clear(project_id).await?;
            let remaining: Vec<Project> = projects
                .into_iter()
                .filter(|p| p.id != project_id)
                .collect();
            documents.save_project_list(&remaining).await?;
            println!(
                "Deleted project {} ({} assets could not be removed)",
                project_id, failed
            );
            Ok(())
        }
        Command::Sweep => {
            let removed = sweep_orphans(&blobs, &snapshots, &projects).await?;
            println!("Removed {} orphaned blobs", removed);
            Ok(())
        }
        Command::Usage => {
            let usage = storage.usage().await?;
            match usage.quota_bytes {
                Some(quota) => println!(
                    "Storage: {} of {} bytes ({:.1}%)",
                    usage.used_bytes,
                    quota,
                    usage.ratio().unwrap_or_default() * 100.0
                ),
                None => println!("Storage: {} bytes (no quota)", usage.used_bytes),
            }
            if usage.is_near_quota() {
                println!("Warning: storage is nearly full, delete old projects to free space");
            }
            let counter = storyboard_store::usage::DailyRequestCounter::new(
                settings,
                config.daily_request_limit,
            );
            println!(
                "Requests today: {} of {}",
                counter.current().await?,
                counter.limit()
            );
            Ok(())
        }
    };

    storage.close().await;
    outcome
}

fn find_project(projects: &[Project], project_id: i64) -> Result<&Project> {
    projects
        .iter()
        .find(|p| p.id == project_id)
        .with_context(|| format!("Project {} not found", project_id))
}
