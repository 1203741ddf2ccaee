use crate::error::ValidationError;
use crate::history::BoundedHistory;
use serde::{Deserialize, Serialize};

/// Key of a record in the blob store (a v4 UUID string).
pub type BlobId = String;

/// One batch of images produced by a single generate or edit call, one id per variant.
pub type ImageRound = Vec<BlobId>;

pub const MAX_IMAGE_ROUNDS: usize = 5;
pub const MAX_VARIANTS: u8 = 3;

pub type ImageHistory = BoundedHistory<ImageRound, MAX_IMAGE_ROUNDS>;

// Visual style presets offered for new projects
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum StyleChoice {
    #[default]
    #[serde(rename = "Cinematic Realism")]
    CinematicRealism,
    #[serde(rename = "Anime")]
    Anime,
    #[serde(rename = "90s VHS")]
    Vhs90s,
    #[serde(rename = "Oil Painting")]
    OilPainting,
    #[serde(rename = "Custom")]
    Custom,
}

impl StyleChoice {
    pub const PRESETS: [StyleChoice; 4] = [
        StyleChoice::CinematicRealism,
        StyleChoice::Anime,
        StyleChoice::Vhs90s,
        StyleChoice::OilPainting,
    ];

    /// Prompt text for a preset; `None` for `Custom`.
    pub fn preset_prompt(self) -> Option<&'static str> {
        match self {
            StyleChoice::CinematicRealism => Some("Photorealistic, cinematic lighting, 8K resolution, shot on Arri Alexa, shallow depth of field, moody color grade."),
            StyleChoice::Anime => Some("Modern anime style, vibrant colors, clean lines, dynamic angles, highly detailed backgrounds, inspired by Makoto Shinkai."),
            StyleChoice::Vhs90s => Some("Authentic 90s VHS aesthetic, slightly grainy, soft focus, aspect ratio 4:3, color bleeding, timestamp overlay in corner."),
            StyleChoice::OilPainting => Some("Classic oil painting style, visible brushstrokes, rich textures, dramatic chiaroscuro lighting, reminiscent of Rembrandt or Caravaggio."),
            StyleChoice::Custom => None,
        }
    }
}

// One timestamped storyboard entry
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Scene {
    pub timestamp: String, // "[mm:ss.mmm]"
    pub description: String,
    #[serde(default)]
    pub actions: String,
    #[serde(default)]
    pub camera_angle: String,
    #[serde(default)]
    pub lyric: String,
    #[serde(default)]
    pub section: String,
    #[serde(default)]
    pub image_history: ImageHistory,
}

impl Scene {
    /// Appends a generation round. Returns the round evicted to stay within
    /// [`MAX_IMAGE_ROUNDS`]; its blobs must be deleted by the caller.
    pub fn append_round(&mut self, round: ImageRound) -> Option<ImageRound> {
        self.image_history.push(round)
    }

    pub fn latest_image(&self) -> Option<&BlobId> {
        self.image_history.latest().and_then(|round| round.first())
    }

    /// Timestamp with the `[`, `]`, `:` and `.` separators removed.
    pub fn timestamp_slug(&self) -> String {
        self.timestamp
            .chars()
            .filter(|c| !matches!(c, '[' | ']' | ':' | '.'))
            .collect()
    }

    fn image_ids(&self) -> impl Iterator<Item = &BlobId> {
        self.image_history.iter().flatten()
    }
}

// A user's music-video working document
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: i64, // creation time in epoch millis, never changes
    pub name: String,
    #[serde(default)]
    pub idea_prompt: String,
    #[serde(default)]
    pub lyrics: String,
    #[serde(default)]
    pub audio_id: Option<BlobId>,
    #[serde(default)]
    pub concept: String, // logline
    #[serde(default)]
    pub narrative_arc: String,
    #[serde(default)]
    pub character_prompt: String,
    #[serde(default)]
    pub selected_style: StyleChoice,
    #[serde(default)]
    pub custom_style: String,
    #[serde(default = "default_variants")]
    pub num_variants: u8,
    #[serde(default)]
    pub character_reference_image_id: Option<BlobId>,
    #[serde(default)]
    pub style_reference_image_id: Option<BlobId>,
    #[serde(default)]
    pub storyboard: Vec<Scene>,
}

fn default_variants() -> u8 {
    1
}

/// Which reference image slot of a project an upload targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReferenceSlot {
    Character,
    Style,
}

/// Free-text brief fields that can be rewritten by the generator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BriefField {
    Concept,
    CustomStyle,
    CharacterPrompt,
}

/// Editable text fields of a scene.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SceneField {
    Description,
    Actions,
}

impl Scene {
    pub fn field(&self, field: SceneField) -> &str {
        match field {
            SceneField::Description => &self.description,
            SceneField::Actions => &self.actions,
        }
    }

    pub fn field_mut(&mut self, field: SceneField) -> &mut String {
        match field {
            SceneField::Description => &mut self.description,
            SceneField::Actions => &mut self.actions,
        }
    }
}

impl Project {
    pub fn new(id: i64) -> Self {
        Self {
            id,
            name: "Untitled Project".to_string(),
            idea_prompt: String::new(),
            lyrics: String::new(),
            audio_id: None,
            concept: String::new(),
            narrative_arc: String::new(),
            character_prompt: String::new(),
            selected_style: StyleChoice::default(),
            custom_style: String::new(),
            num_variants: default_variants(),
            character_reference_image_id: None,
            style_reference_image_id: None,
            storyboard: Vec::new(),
        }
    }

    /// The style text sent to the generator.
    pub fn style_prompt(&self) -> &str {
        self.selected_style
            .preset_prompt()
            .unwrap_or(self.custom_style.as_str())
    }

    pub fn reference(&self, slot: ReferenceSlot) -> Option<&BlobId> {
        match slot {
            ReferenceSlot::Character => self.character_reference_image_id.as_ref(),
            ReferenceSlot::Style => self.style_reference_image_id.as_ref(),
        }
    }

    pub fn brief_field(&self, field: BriefField) -> &str {
        match field {
            BriefField::Concept => &self.concept,
            BriefField::CustomStyle => &self.custom_style,
            BriefField::CharacterPrompt => &self.character_prompt,
        }
    }

    pub fn brief_field_mut(&mut self, field: BriefField) -> &mut String {
        match field {
            BriefField::Concept => &mut self.concept,
            BriefField::CustomStyle => &mut self.custom_style,
            BriefField::CharacterPrompt => &mut self.character_prompt,
        }
    }

    pub fn reference_mut(&mut self, slot: ReferenceSlot) -> &mut Option<BlobId> {
        match slot {
            ReferenceSlot::Character => &mut self.character_reference_image_id,
            ReferenceSlot::Style => &mut self.style_reference_image_id,
        }
    }

    /// Every blob this project owns: reference images, audio and every image round.
    pub fn blob_ids(&self) -> Vec<BlobId> {
        let mut ids: Vec<BlobId> = [
            &self.character_reference_image_id,
            &self.style_reference_image_id,
            &self.audio_id,
        ]
        .into_iter()
        .flatten()
        .cloned()
        .collect();
        ids.extend(
            self.storyboard
                .iter()
                .flat_map(|scene| scene.image_ids())
                .cloned(),
        );
        ids
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id <= 0 {
            return Err(ValidationError::InvalidId(self.id));
        }
        if !(1..=MAX_VARIANTS).contains(&self.num_variants) {
            return Err(ValidationError::VariantCount(self.num_variants));
        }
        for (index, scene) in self.storyboard.iter().enumerate() {
            if scene.image_ids().any(|id| id.is_empty()) {
                return Err(ValidationError::EmptyImageId(index));
            }
        }
        Ok(())
    }

    /// Parses an untrusted stored record and checks it before use.
    pub fn from_value(value: serde_json::Value) -> Result<Self, ValidationError> {
        let project: Project =
            serde_json::from_value(value).map_err(|e| ValidationError::Shape(e.to_string()))?;
        project.validate()?;
        Ok(project)
    }
}

// A stored copy of a project, taken before destructive regeneration.
// The project body is kept untyped: the side store is not schema-enforced.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ProjectSnapshot {
    pub timestamp: i64, // epoch millis
    pub project: serde_json::Value,
}

// Persisted daily request counter
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct DailyUsage {
    pub date: String, // YYYY-MM-DD
    pub count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scene_with_rounds(rounds: &[&[&str]]) -> Scene {
        let mut scene = Scene {
            timestamp: "[00:12.500]".to_string(),
            description: "Neon alley".to_string(),
            ..Scene::default()
        };
        for round in rounds {
            scene.append_round(round.iter().map(|s| s.to_string()).collect());
        }
        scene
    }

    #[test]
    fn new_project_has_original_defaults() {
        let project = Project::new(1_700_000_000_000);
        assert_eq!(project.name, "Untitled Project");
        assert_eq!(project.selected_style, StyleChoice::CinematicRealism);
        assert_eq!(project.num_variants, 1);
        assert!(project.storyboard.is_empty());
        assert!(project.validate().is_ok());
    }

    #[test]
    fn style_prompt_uses_custom_text_only_for_custom() {
        let mut project = Project::new(1);
        project.custom_style = "Shot on 35mm film".to_string();
        assert!(project.style_prompt().starts_with("Photorealistic"));
        project.selected_style = StyleChoice::Custom;
        assert_eq!(project.style_prompt(), "Shot on 35mm film");
    }

    #[test]
    fn sixth_round_evicts_the_first() {
        let mut scene = scene_with_rounds(&[&["a"], &["b"], &["c"], &["d"], &["e"]]);
        let evicted = scene.append_round(vec!["f1".into(), "f2".into()]);
        assert_eq!(evicted, Some(vec!["a".to_string()]));
        assert_eq!(scene.image_history.len(), MAX_IMAGE_ROUNDS);
        assert_eq!(scene.latest_image().map(String::as_str), Some("f1"));
    }

    #[test]
    fn timestamp_slug_strips_separators() {
        let scene = scene_with_rounds(&[]);
        assert_eq!(scene.timestamp_slug(), "0012500");
    }

    #[test]
    fn blob_ids_cover_references_audio_and_history() {
        let mut project = Project::new(5);
        project.character_reference_image_id = Some("char".into());
        project.style_reference_image_id = Some("style".into());
        project.audio_id = Some("audio".into());
        project.storyboard = vec![
            scene_with_rounds(&[&["s1r1v1", "s1r1v2"], &["s1r2v1"]]),
            scene_with_rounds(&[&["s2r1v1"]]),
        ];

        let mut ids = project.blob_ids();
        ids.sort();
        assert_eq!(
            ids,
            vec!["audio", "char", "s1r1v1", "s1r1v2", "s1r2v1", "s2r1v1", "style"]
        );
    }

    #[test]
    fn deserializes_camel_case_records_with_missing_optionals() {
        let value = json!({
            "id": 1712345678901i64,
            "name": "Night Drive",
            "selectedStyle": "90s VHS",
            "storyboard": [{
                "timestamp": "[00:01.000]",
                "description": "Headlights",
                "imageHistory": [["id-1"]]
            }]
        });
        let project = Project::from_value(value).unwrap();
        assert_eq!(project.selected_style, StyleChoice::Vhs90s);
        assert_eq!(project.num_variants, 1);
        assert_eq!(project.storyboard[0].image_history.len(), 1);
    }

    #[test]
    fn from_value_rejects_bad_records() {
        assert!(matches!(
            Project::from_value(json!({"name": "no id"})),
            Err(ValidationError::Shape(_))
        ));
        assert_eq!(
            Project::from_value(json!({"id": 3, "name": "x", "numVariants": 4})),
            Err(ValidationError::VariantCount(4))
        );
        assert_eq!(
            Project::from_value(json!({"id": 0, "name": "x"})),
            Err(ValidationError::InvalidId(0))
        );
    }
}
