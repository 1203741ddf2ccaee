use crate::error::GenerationError;
use crate::models::{Project, Scene};
use async_trait::async_trait;

// Binary input handed to the generator (audio for transcription, reference/mask images)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaPayload {
    pub data: Vec<u8>,
    pub mime_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreativeBrief {
    pub idea_prompt: String,
    pub lyrics: String,
    pub character_prompt: String,
    pub style_prompt: String,
}

impl CreativeBrief {
    pub fn from_project(project: &Project) -> Self {
        Self {
            idea_prompt: project.idea_prompt.clone(),
            lyrics: project.lyrics.clone(),
            character_prompt: project.character_prompt.clone(),
            style_prompt: project.style_prompt().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Concept {
    pub logline: String,
    pub narrative_arc: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoryboardRequest {
    pub concept: Concept,
    pub lyrics: String,
    pub character_prompt: String,
    pub style_prompt: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageRequest {
    pub scene: Scene,
    pub scene_index: usize,
    /// Whole storyboard, for continuity between neighbouring scenes.
    pub storyboard: Vec<Scene>,
    pub style_prompt: String,
    pub character_prompt: String,
    pub variant_count: u8,
    pub character_reference: Option<MediaPayload>,
    pub style_reference: Option<MediaPayload>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EditRequest {
    pub base_image: MediaPayload,
    pub mask: MediaPayload,
    pub edit_prompt: String,
    pub scene: Scene,
    pub style_prompt: String,
    pub character_prompt: String,
    pub character_reference: Option<MediaPayload>,
    pub style_reference: Option<MediaPayload>,
}

// Trait defining the generative collaborator. Implementations talk to whatever
// model service is configured; failures are passed through to the caller as-is.
#[async_trait]
pub trait StoryboardGenerator: Send + Sync {
    async fn transcribe(&self, audio: &MediaPayload) -> Result<String, GenerationError>;

    /// A short video idea (a few sentences) drawn from the lyrics.
    async fn generate_idea(&self, lyrics: &str) -> Result<String, GenerationError>;

    /// Rewrites `text` to be more vivid. `context` says what the text describes.
    async fn enhance_text(&self, text: &str, context: &str) -> Result<String, GenerationError>;

    async fn generate_concept(&self, brief: &CreativeBrief) -> Result<Concept, GenerationError>;

    async fn generate_storyboard(
        &self,
        request: &StoryboardRequest,
    ) -> Result<Vec<Scene>, GenerationError>;

    /// One encoded image per requested variant.
    async fn generate_images(&self, request: &ImageRequest)
        -> Result<Vec<Vec<u8>>, GenerationError>;

    async fn edit_image(&self, request: &EditRequest) -> Result<Vec<Vec<u8>>, GenerationError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StyleChoice;

    #[test]
    fn brief_resolves_the_style_prompt() {
        let mut project = Project::new(1);
        project.idea_prompt = "a road trip".into();
        project.selected_style = StyleChoice::Anime;

        let brief = CreativeBrief::from_project(&project);
        assert_eq!(brief.idea_prompt, "a road trip");
        assert!(brief.style_prompt.starts_with("Modern anime style"));
    }
}
