//! Shared helpers for integration tests: throwaway databases and a scripted generator.

#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use storyboard_store::api::{
    Concept, CreativeBrief, EditRequest, ImageRequest, MediaPayload, StoryboardGenerator,
    StoryboardRequest,
};
use storyboard_store::config::AppConfig;
use storyboard_store::error::GenerationError;
use storyboard_store::models::Scene;
use storyboard_store::storage::StorageManager;
use storyboard_store::AppState;
use tempfile::TempDir;

pub const PNG_MAGIC: [u8; 4] = [0x89, b'P', b'N', b'G'];

/// Config pointing at a fresh database inside `dir`, with short timers.
pub fn test_config(dir: &TempDir) -> AppConfig {
    AppConfig {
        autosave_debounce: Duration::from_millis(50),
        batch_delay: Duration::ZERO,
        ..AppConfig::with_db_path(dir.path().join("storyboard.sqlite"))
    }
}

pub async fn open_storage(config: &AppConfig) -> Arc<StorageManager> {
    StorageManager::open(config)
        .await
        .expect("test database should open")
}

/// Generator returning deterministic PNG-looking payloads.
#[derive(Default)]
pub struct ScriptedGenerator {
    pub image_calls: AtomicUsize,
    pub edit_calls: AtomicUsize,
    pub fail_transcription: AtomicBool,
    pub fail_text: AtomicBool,
    pub reject_images: AtomicBool,
    /// Bytes of padding added to every generated image.
    pub image_padding: AtomicUsize,
}

impl ScriptedGenerator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn image(&self, call: usize, variant: usize) -> Vec<u8> {
        let mut data = PNG_MAGIC.to_vec();
        data.extend_from_slice(format!("call-{}-variant-{}", call, variant).as_bytes());
        data.resize(data.len() + self.image_padding.load(Ordering::SeqCst), 0);
        data
    }
}

pub fn scene(timestamp: &str, description: &str) -> Scene {
    Scene {
        timestamp: timestamp.to_string(),
        description: description.to_string(),
        actions: "walks toward camera".to_string(),
        camera_angle: "Wide shot".to_string(),
        lyric: "la la la".to_string(),
        section: "Verse 1".to_string(),
        ..Scene::default()
    }
}

#[async_trait]
impl StoryboardGenerator for ScriptedGenerator {
    async fn transcribe(&self, audio: &MediaPayload) -> Result<String, GenerationError> {
        if self.fail_transcription.load(Ordering::SeqCst) {
            return Err(GenerationError::Other("transcription service unavailable".into()));
        }
        Ok(format!("[00:00.000] transcribed {} bytes", audio.data.len()))
    }

    async fn generate_idea(&self, lyrics: &str) -> Result<String, GenerationError> {
        if self.fail_text.load(Ordering::SeqCst) {
            return Err(GenerationError::RateLimited("429".into()));
        }
        Ok(format!("  A video for {} lines of lyrics  ", lyrics.lines().count()))
    }

    async fn enhance_text(&self, text: &str, context: &str) -> Result<String, GenerationError> {
        if self.fail_text.load(Ordering::SeqCst) {
            return Err(GenerationError::RateLimited("429".into()));
        }
        Ok(format!("Vivid: {} ({} chars of context)", text, context.len()))
    }

    async fn generate_concept(&self, brief: &CreativeBrief) -> Result<Concept, GenerationError> {
        Ok(Concept {
            logline: format!("A story about {}", brief.idea_prompt),
            narrative_arc: "Setup, conflict, release".to_string(),
        })
    }

    async fn generate_storyboard(
        &self,
        _request: &StoryboardRequest,
    ) -> Result<Vec<Scene>, GenerationError> {
        Ok(vec![
            scene("[00:00.000]", "Empty highway at dusk"),
            scene("[00:12.500]", "Neon diner"),
            scene("[00:30.250]", "Sunrise over the coast"),
        ])
    }

    async fn generate_images(
        &self,
        request: &ImageRequest,
    ) -> Result<Vec<Vec<u8>>, GenerationError> {
        if self.reject_images.load(Ordering::SeqCst) {
            return Err(GenerationError::ContentPolicy("prompt blocked".into()));
        }
        let call = self.image_calls.fetch_add(1, Ordering::SeqCst);
        Ok((0..request.variant_count as usize)
            .map(|variant| self.image(call, variant))
            .collect())
    }

    async fn edit_image(&self, request: &EditRequest) -> Result<Vec<Vec<u8>>, GenerationError> {
        assert!(request.base_image.data.starts_with(&PNG_MAGIC));
        let call = 1000 + self.edit_calls.fetch_add(1, Ordering::SeqCst);
        Ok(vec![self.image(call, 0)])
    }
}

/// Workspace backed by a fresh database, with one current project that has a storyboard.
pub async fn workspace_with_storyboard(
    config: AppConfig,
    generator: Arc<ScriptedGenerator>,
) -> AppState {
    let state = AppState::new(config, generator)
        .await
        .expect("workspace should open");
    storyboard_store::commands::create_project(&state)
        .await
        .unwrap();
    storyboard_store::commands::update_current_project(&state, |p| {
        p.idea_prompt = "a night drive".to_string();
    })
    .await
    .unwrap();
    storyboard_store::commands::generate_concept(&state)
        .await
        .unwrap();
    storyboard_store::commands::generate_storyboard(&state)
        .await
        .unwrap();
    state
}
