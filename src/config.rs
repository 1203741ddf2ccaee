use anyhow::{Context, Result};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

// --- Environment keys ---

const ENV_DB_PATH: &str = "STORYBOARD_DB_PATH";
const ENV_AUTOSAVE_MS: &str = "STORYBOARD_AUTOSAVE_MS";
const ENV_DAILY_LIMIT: &str = "STORYBOARD_DAILY_LIMIT";
const ENV_BATCH_DELAY_MS: &str = "STORYBOARD_BATCH_DELAY_MS";
const ENV_MAX_PAGES: &str = "STORYBOARD_MAX_PAGES";
const ENV_POOL_SIZE: &str = "STORYBOARD_POOL_SIZE";

const DEFAULT_DB_FILE: &str = "storyboard.sqlite";

/// Runtime settings for the stores and the workspace built on top of them.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Location of the SQLite file holding blobs, documents and settings.
    pub db_path: PathBuf,
    /// Quiet period after the last mutation before the project list is written.
    pub autosave_debounce: Duration,
    /// Generation calls allowed per calendar day.
    pub daily_request_limit: u32,
    /// Pause between scenes during batch image generation.
    pub batch_delay: Duration,
    /// Optional storage quota, as SQLite `max_page_count`.
    pub max_page_count: Option<u64>,
    pub pool_size: u32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(DEFAULT_DB_FILE),
            autosave_debounce: Duration::from_millis(1000),
            daily_request_limit: 50,
            batch_delay: Duration::from_millis(1000),
            max_page_count: None,
            pool_size: 4,
        }
    }
}

impl AppConfig {
    /// Builds a config with defaults and a specific database file.
    pub fn with_db_path(path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: path.into(),
            ..Self::default()
        }
    }

    /// Reads settings from the environment, falling back to defaults for unset keys.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let db_path = std::env::var_os(ENV_DB_PATH)
            .map(PathBuf::from)
            .unwrap_or(defaults.db_path);
        let autosave_debounce = read_env::<u64>(ENV_AUTOSAVE_MS)?
            .map(Duration::from_millis)
            .unwrap_or(defaults.autosave_debounce);
        let daily_request_limit =
            read_env::<u32>(ENV_DAILY_LIMIT)?.unwrap_or(defaults.daily_request_limit);
        let batch_delay = read_env::<u64>(ENV_BATCH_DELAY_MS)?
            .map(Duration::from_millis)
            .unwrap_or(defaults.batch_delay);
        let max_page_count = read_env::<u64>(ENV_MAX_PAGES)?;
        let pool_size = read_env::<u32>(ENV_POOL_SIZE)?.unwrap_or(defaults.pool_size);

        if pool_size == 0 {
            anyhow::bail!("{} must be at least 1", ENV_POOL_SIZE);
        }

        log::debug!(
            "Loaded config: db={} debounce={:?} daily_limit={} quota_pages={:?}",
            db_path.display(),
            autosave_debounce,
            daily_request_limit,
            max_page_count
        );

        Ok(Self {
            db_path,
            autosave_debounce,
            daily_request_limit,
            batch_delay,
            max_page_count,
            pool_size,
        })
    }
}

fn read_env<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .context(format!("Invalid value '{}' for environment variable {}", raw, key)),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(anyhow::Error::from(e).context(format!("Failed to read {}", key))),
    }
}
