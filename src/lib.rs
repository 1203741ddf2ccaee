// Local persistence, autosave and versioning for a music-video storyboard generator

// Declare the modules
pub mod api;
pub mod autosave;
pub mod commands;
pub mod config;
pub mod error;
pub mod export;
pub mod history;
pub mod media;
pub mod models;
pub mod snapshots;
pub mod state;
pub mod storage;
pub mod usage;

pub use api::StoryboardGenerator;
pub use config::AppConfig;
pub use error::{AppError, GenerationError, StoreError};
pub use state::AppState;
