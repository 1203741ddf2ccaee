// Workspace commands: everything a front end calls to change projects

use crate::api::{
    Concept, CreativeBrief, EditRequest, ImageRequest, MediaPayload, StoryboardRequest,
};
use crate::error::{AppError, GenerationError, StoreError, ValidationError};
use crate::media::sniff_mime;
use crate::models::{
    BlobId, BriefField, ImageHistory, ImageRound, Project, ReferenceSlot, SceneField,
};
use crate::snapshots::{validate_snapshot, SnapshotManager};
use crate::state::AppState;
use crate::storage::{BlobStore, StorageUsage};
use chrono::Utc;
use std::collections::HashSet;

pub const MAX_AUDIO_BYTES: usize = 20 * 1024 * 1024;

const TRANSCRIPTION_FAILED: &str = "Error during transcription. Please try again.";
const IDEA_FAILED: &str = "Error: Could not generate an idea. Please try again.";

/// Result of trying to restore the previous version of a project.
#[derive(Debug, Clone, PartialEq)]
pub enum RevertOutcome {
    /// The project was replaced by the snapshot taken at `timestamp`.
    Reverted { timestamp: i64 },
    NoSnapshot,
    /// The latest snapshot was unusable and has been thrown away.
    Discarded(ValidationError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub generated: Vec<usize>, // scene indices that got a first round
    pub failed: Vec<usize>,
    pub stopped_at_limit: bool,
}

// --- Project lifecycle ---

pub async fn list_projects(state: &AppState) -> Vec<Project> {
    state.projects().await
}

/// Appends a fresh project and makes it current.
pub async fn create_project(state: &AppState) -> Result<Project, AppError> {
    state
        .mutate(|workspace| {
            // Ids derive from creation time but must stay unique and never repeat
            let id = workspace
                .projects
                .iter()
                .map(|p| p.id + 1)
                .fold(Utc::now().timestamp_millis(), i64::max);
            let project = Project::new(id);
            workspace.projects.push(project.clone());
            workspace.current = Some(workspace.projects.len() - 1);
            log::info!("Created project {}", id);
            Ok(project)
        })
        .await
}

pub async fn select_project(state: &AppState, index: usize) -> Result<Project, AppError> {
    let mut workspace = state.workspace.lock().await;
    let project = workspace
        .projects
        .get(index)
        .cloned()
        .ok_or(AppError::ProjectIndexOutOfRange(index))?;
    workspace.current = Some(index);
    log::debug!("Selected project {} at index {}", project.id, index);
    Ok(project)
}

pub async fn rename_project(state: &AppState, index: usize, name: &str) -> Result<(), AppError> {
    state
        .mutate(|workspace| {
            let project = workspace
                .projects
                .get_mut(index)
                .ok_or(AppError::ProjectIndexOutOfRange(index))?;
            log::info!("Renaming project {} to {:?}", project.id, name);
            project.name = name.to_string();
            Ok(())
        })
        .await
}

/// Applies an arbitrary edit to the current project. The id is restored afterwards.
pub async fn update_current_project<F>(state: &AppState, change: F) -> Result<Project, AppError>
where
    F: FnOnce(&mut Project),
{
    state
        .mutate(|workspace| {
            let index = workspace.current.ok_or(AppError::NoCurrentProject)?;
            let project = workspace
                .projects
                .get_mut(index)
                .ok_or(AppError::NoCurrentProject)?;
            let id = project.id;
            change(project);
            project.id = id;
            Ok(project.clone())
        })
        .await
}

/// Deletes every blob `project` references. Failures are logged; returns how many failed.
pub async fn delete_project_assets(blobs: &BlobStore, project: &Project) -> usize {
    let assets = project.blob_ids();
    log::info!(
        "Deleting {} assets of project {}",
        assets.len(),
        project.id
    );
    blobs.delete_all_best_effort(assets).await
}

/// Removes the project at `index` together with its blobs and snapshots.
pub async fn delete_project(state: &AppState, index: usize) -> Result<Project, AppError> {
    let project = state
        .workspace
        .lock()
        .await
        .projects
        .get(index)
        .cloned()
        .ok_or(AppError::ProjectIndexOutOfRange(index))?;
    log::warn!("Deleting project {} ({:?})", project.id, project.name);

    let failed = delete_project_assets(&state.blobs, &project).await;
    if failed > 0 {
        log::warn!("{} assets of project {} could not be deleted", failed, project.id);
    }
    if let Err(e) = state.snapshots.clear(project.id).await {
        log::error!("Failed to clear snapshots of project {}: {}", project.id, e);
    }

    state
        .mutate(|workspace| {
            let removed_at = workspace
                .position(project.id)
                .ok_or(AppError::ProjectNotFound(project.id))?;
            workspace.projects.remove(removed_at);
            workspace.current = match workspace.current {
                Some(current) if current == removed_at => {
                    (!workspace.projects.is_empty()).then_some(0)
                }
                Some(current) if current > removed_at => Some(current - 1),
                other => other,
            };
            Ok(())
        })
        .await?;
    Ok(project)
}

/// Replaces the current project with its most recent snapshot.
///
/// Only the selected project may be reverted. A snapshot that fails validation is
/// dropped from the list and reported, never applied.
pub async fn revert_project(state: &AppState, index: usize) -> Result<RevertOutcome, AppError> {
    let project_id = {
        let workspace = state.workspace.lock().await;
        if workspace.current != Some(index) {
            return Err(AppError::RevertNotCurrent);
        }
        workspace
            .projects
            .get(index)
            .map(|p| p.id)
            .ok_or(AppError::ProjectIndexOutOfRange(index))?
    };

    let Some(snapshot) = state.snapshots.pop_latest_snapshot(project_id).await? else {
        log::info!("No previous versions of project {} to revert to", project_id);
        return Ok(RevertOutcome::NoSnapshot);
    };

    match validate_snapshot(&snapshot) {
        Ok(restored) => {
            state
                .update_project(project_id, move |project| {
                    *project = restored;
                    Ok(())
                })
                .await?;
            log::info!(
                "Reverted project {} to snapshot from {}",
                project_id,
                snapshot.timestamp
            );
            Ok(RevertOutcome::Reverted {
                timestamp: snapshot.timestamp,
            })
        }
        Err(e) => {
            log::warn!("Discarding invalid snapshot of project {}: {}", project_id, e);
            Ok(RevertOutcome::Discarded(e))
        }
    }
}

// --- Reference media ---

/// Stores an uploaded image as the character or style reference of the current project.
pub async fn set_reference_image(
    state: &AppState,
    slot: ReferenceSlot,
    data: Vec<u8>,
    mime_type: &str,
) -> Result<BlobId, AppError> {
    if !mime_type.starts_with("image/") {
        return Err(AppError::InvalidUpload(format!(
            "expected an image file, got {}",
            mime_type
        )));
    }
    let project = state.current_project().await?;
    replace_blob(state, project.id, project.reference(slot).cloned()).await;

    let saved = state.blobs.save(data).await;
    let id = match saved {
        Ok(id) => id,
        Err(e) => {
            // The old blob may already be gone; do not leave a dangling reference behind
            state
                .update_project(project.id, |p| {
                    *p.reference_mut(slot) = None;
                    Ok(())
                })
                .await?;
            return Err(e.into());
        }
    };

    let new_id = id.clone();
    state
        .update_project(project.id, move |p| {
            *p.reference_mut(slot) = Some(new_id);
            Ok(())
        })
        .await?;
    log::info!("Set {:?} reference of project {} to {}", slot, project.id, id);
    Ok(id)
}

pub async fn clear_reference_image(state: &AppState, slot: ReferenceSlot) -> Result<(), AppError> {
    let project = state.current_project().await?;
    replace_blob(state, project.id, project.reference(slot).cloned()).await;
    state
        .update_project(project.id, |p| {
            *p.reference_mut(slot) = None;
            Ok(())
        })
        .await
}

/// Stores the song audio on the current project and fills the lyrics with its transcription.
///
/// Transcription failures do not fail the upload; the lyrics field receives an
/// error message instead. Returns the final lyrics text.
pub async fn upload_audio(
    state: &AppState,
    file_name: &str,
    data: Vec<u8>,
    mime_type: &str,
) -> Result<String, AppError> {
    if !mime_type.starts_with("audio/") {
        return Err(AppError::InvalidUpload(format!(
            "expected an audio file, got {}",
            mime_type
        )));
    }
    if data.len() > MAX_AUDIO_BYTES {
        return Err(AppError::InvalidUpload(format!(
            "audio file is {} bytes, the limit is {}",
            data.len(),
            MAX_AUDIO_BYTES
        )));
    }

    let project = state.current_project().await?;
    replace_blob(state, project.id, project.audio_id.clone()).await;

    let payload = MediaPayload {
        data,
        mime_type: mime_type.to_string(),
    };
    let audio_id = match state.blobs.save(payload.data.clone()).await {
        Ok(id) => id,
        Err(e) => {
            state
                .update_project(project.id, |p| {
                    p.audio_id = None;
                    Ok(())
                })
                .await?;
            return Err(e.into());
        }
    };

    let placeholder = format!("[Transcribing {}...]", file_name);
    state
        .update_project(project.id, move |p| {
            p.audio_id = Some(audio_id);
            p.lyrics = placeholder;
            Ok(())
        })
        .await?;

    let lyrics = match state.generator.transcribe(&payload).await {
        Ok(text) => text,
        Err(e) => {
            log::error!("Transcription of {} failed: {}", file_name, e);
            TRANSCRIPTION_FAILED.to_string()
        }
    };
    let stored = lyrics.clone();
    state
        .update_project(project.id, move |p| {
            p.lyrics = stored;
            Ok(())
        })
        .await?;
    Ok(lyrics)
}

// Deletes the blob a reference field is about to stop pointing at. Blobs a stored
// snapshot still references are kept for revert; the orphan sweep reclaims them later.
async fn replace_blob(state: &AppState, project_id: i64, old: Option<BlobId>) {
    let Some(old) = old else { return };
    match state.snapshots.referenced_blobs(project_id).await {
        Ok(kept) if kept.contains(&old) => {
            log::debug!("Keeping replaced blob {}, a snapshot still uses it", old);
            return;
        }
        Ok(_) => {}
        Err(e) => {
            log::error!(
                "Could not read snapshots of project {}, keeping blob {}: {}",
                project_id,
                old,
                e
            );
            return;
        }
    }
    if let Err(e) = state.blobs.delete(&old).await {
        log::error!("Failed to delete replaced blob {}: {}", old, e);
    }
}

// --- Generation ---

/// Asks the generator for a logline and narrative arc for the current project.
///
/// The previous concept is only replaced once the generator succeeds.
pub async fn generate_concept(state: &AppState) -> Result<Concept, AppError> {
    let project = state.current_project().await?;
    log::info!("Generating concept for project {}", project.id);

    let concept = state
        .generator
        .generate_concept(&CreativeBrief::from_project(&project))
        .await?;

    let stored = concept.clone();
    state
        .update_project(project.id, move |p| {
            p.concept = stored.logline;
            p.narrative_arc = stored.narrative_arc;
            Ok(())
        })
        .await?;
    Ok(concept)
}

/// Fills the idea prompt of the current project with an idea drawn from its lyrics.
///
/// Like transcription, a generator failure does not fail the command: the idea
/// field receives an error message instead. Returns the text written.
pub async fn generate_idea(state: &AppState) -> Result<String, AppError> {
    let project = state.current_project().await?;
    if project.lyrics.trim().is_empty() {
        return Err(AppError::MissingLyrics);
    }
    log::info!("Generating idea from lyrics for project {}", project.id);

    let idea = match state.generator.generate_idea(&project.lyrics).await {
        Ok(idea) => idea.trim().to_string(),
        Err(e) => {
            log::error!("Idea generation for project {} failed: {}", project.id, e);
            IDEA_FAILED.to_string()
        }
    };
    let stored = idea.clone();
    state
        .update_project(project.id, move |p| {
            p.idea_prompt = stored;
            Ok(())
        })
        .await?;
    Ok(idea)
}

/// Rewrites one brief field of the current project through the generator.
///
/// The field keeps its text when the generator fails.
pub async fn enhance_brief_field(state: &AppState, field: BriefField) -> Result<String, AppError> {
    let project = state.current_project().await?;
    let context = match field {
        BriefField::Concept => "a music video concept logline",
        BriefField::CustomStyle => "a music video's visual style guide",
        BriefField::CharacterPrompt => "descriptions of characters and props",
    };
    log::info!("Enhancing {:?} of project {}", field, project.id);

    let enhanced = state
        .generator
        .enhance_text(project.brief_field(field), context)
        .await?;
    let stored = enhanced.clone();
    state
        .update_project(project.id, move |p| {
            *p.brief_field_mut(field) = stored;
            Ok(())
        })
        .await?;
    Ok(enhanced)
}

/// Overwrites a text field of one scene of the current project.
pub async fn update_scene_field(
    state: &AppState,
    scene_index: usize,
    field: SceneField,
    value: &str,
) -> Result<(), AppError> {
    let project = state.current_project().await?;
    write_scene_field(state, project.id, scene_index, field, value.to_string()).await
}

async fn write_scene_field(
    state: &AppState,
    project_id: i64,
    scene_index: usize,
    field: SceneField,
    value: String,
) -> Result<(), AppError> {
    state
        .update_project(project_id, move |p| {
            let scene = p
                .storyboard
                .get_mut(scene_index)
                .ok_or(AppError::SceneIndexOutOfRange(scene_index))?;
            *scene.field_mut(field) = value;
            Ok(())
        })
        .await
}

/// Rewrites a scene's description or actions with the rest of the project as context.
pub async fn enhance_scene_field(
    state: &AppState,
    scene_index: usize,
    field: SceneField,
) -> Result<String, AppError> {
    let project = state.current_project().await?;
    let scene = project
        .storyboard
        .get(scene_index)
        .ok_or(AppError::SceneIndexOutOfRange(scene_index))?;
    let context = match field {
        SceneField::Description => format!(
            "For a music video scene, enhance this visual description. Concept: {} | Narrative Arc: {} | Style: {} | Characters: {}. The corresponding lyric is \"{}\".",
            project.concept,
            project.narrative_arc,
            project.style_prompt(),
            project.character_prompt,
            scene.lyric
        ),
        SceneField::Actions => format!(
            "For a music video scene, enhance these character/object actions to be more dynamic and cinematic. The scene's visual description is \"{}\". The style is \"{}\". The lyric is \"{}\". Focus on vivid verbs and impactful movements.",
            scene.description,
            project.style_prompt(),
            scene.lyric
        ),
    };
    log::info!(
        "Enhancing {:?} of scene {} in project {}",
        field,
        scene_index,
        project.id
    );

    let enhanced = state
        .generator
        .enhance_text(scene.field(field), &context)
        .await?;
    write_scene_field(state, project.id, scene_index, field, enhanced.clone()).await?;
    Ok(enhanced)
}

/// Replaces the storyboard of the current project with freshly generated scenes.
///
/// A snapshot is pushed first so the previous storyboard can be restored with
/// [`revert_project`]. Returns the number of scenes generated.
pub async fn generate_storyboard(state: &AppState) -> Result<usize, AppError> {
    let project = state.current_project().await?;
    if project.concept.trim().is_empty() {
        return Err(AppError::MissingConcept);
    }

    state.snapshots.push_snapshot(project.id, &project).await?;

    let request = StoryboardRequest {
        concept: Concept {
            logline: project.concept.clone(),
            narrative_arc: project.narrative_arc.clone(),
        },
        lyrics: project.lyrics.clone(),
        character_prompt: project.character_prompt.clone(),
        style_prompt: project.style_prompt().to_string(),
    };
    let mut scenes = state.generator.generate_storyboard(&request).await?;
    // New scenes start without images; the generator cannot own blobs
    for scene in &mut scenes {
        scene.image_history = ImageHistory::new();
    }

    let count = scenes.len();
    state
        .update_project(project.id, move |p| {
            p.storyboard = scenes;
            Ok(())
        })
        .await?;
    log::info!("Generated {} scenes for project {}", count, project.id);
    Ok(count)
}

/// Generates a new round of images for one scene of the current project.
pub async fn generate_scene_images(
    state: &AppState,
    scene_index: usize,
) -> Result<ImageRound, AppError> {
    let project = state.current_project().await?;
    generate_images_for(state, project.id, scene_index).await
}

async fn generate_images_for(
    state: &AppState,
    project_id: i64,
    scene_index: usize,
) -> Result<ImageRound, AppError> {
    state.usage.ensure_available().await?;

    let project = state.project(project_id).await?;
    let scene = project
        .storyboard
        .get(scene_index)
        .cloned()
        .ok_or(AppError::SceneIndexOutOfRange(scene_index))?;

    let (character_reference, style_reference) = load_references(&state.blobs, &project).await;
    let request = ImageRequest {
        scene,
        scene_index,
        storyboard: project.storyboard.clone(),
        style_prompt: project.style_prompt().to_string(),
        character_prompt: project.character_prompt.clone(),
        variant_count: project.num_variants,
        character_reference,
        style_reference,
    };

    log::info!(
        "Generating {} image variant(s) for scene {} of project {}",
        project.num_variants,
        scene_index,
        project_id
    );
    let images = state.generator.generate_images(&request).await?;
    record_generated_round(state, project_id, scene_index, images).await
}

/// Edits the latest image of a scene with a mask and an instruction.
pub async fn edit_scene_image(
    state: &AppState,
    scene_index: usize,
    mask: MediaPayload,
    edit_prompt: &str,
) -> Result<ImageRound, AppError> {
    state.usage.ensure_available().await?;

    let project = state.current_project().await?;
    let scene = project
        .storyboard
        .get(scene_index)
        .cloned()
        .ok_or(AppError::SceneIndexOutOfRange(scene_index))?;
    let base_id = scene
        .latest_image()
        .cloned()
        .ok_or(AppError::NothingToEdit(scene_index))?;
    let base = state
        .blobs
        .get(&base_id)
        .await?
        .ok_or_else(|| AppError::ImageMissing(base_id.clone()))?;

    let (character_reference, style_reference) = load_references(&state.blobs, &project).await;
    let request = EditRequest {
        base_image: MediaPayload {
            mime_type: sniff_mime(&base).to_string(),
            data: base,
        },
        mask,
        edit_prompt: edit_prompt.to_string(),
        scene,
        style_prompt: project.style_prompt().to_string(),
        character_prompt: project.character_prompt.clone(),
        character_reference,
        style_reference,
    };

    log::info!("Editing image {} of scene {}", base_id, scene_index);
    let images = state.generator.edit_image(&request).await?;
    record_generated_round(state, project.id, scene_index, images).await
}

/// Generates a first round for every scene of the current project that has none.
///
/// Scenes are processed one at a time with the configured delay after each success.
/// Other failures are recorded and skipped; hitting the daily limit stops the batch.
pub async fn batch_generate_images(state: &AppState) -> Result<BatchReport, AppError> {
    let project = state.current_project().await?;
    let pending: Vec<usize> = project
        .storyboard
        .iter()
        .enumerate()
        .filter(|(_, scene)| scene.image_history.is_empty())
        .map(|(index, _)| index)
        .collect();

    let mut report = BatchReport::default();
    if pending.is_empty() {
        log::info!("Every scene of project {} already has images", project.id);
        return Ok(report);
    }

    log::info!("Batch generating images for {} scenes", pending.len());
    for index in pending {
        match generate_images_for(state, project.id, index).await {
            Ok(_) => {
                report.generated.push(index);
                tokio::time::sleep(state.config.batch_delay).await;
            }
            Err(AppError::DailyLimitReached { limit }) => {
                log::warn!("Batch generation stopped: daily limit of {} reached", limit);
                report.stopped_at_limit = true;
                break;
            }
            Err(e) => {
                log::error!("Failed to generate image for scene {} during batch: {}", index, e);
                report.failed.push(index);
            }
        }
    }
    Ok(report)
}

async fn load_references(
    blobs: &BlobStore,
    project: &Project,
) -> (Option<MediaPayload>, Option<MediaPayload>) {
    tokio::join!(
        load_reference(blobs, project.reference(ReferenceSlot::Character)),
        load_reference(blobs, project.reference(ReferenceSlot::Style)),
    )
}

async fn load_reference(blobs: &BlobStore, id: Option<&BlobId>) -> Option<MediaPayload> {
    let id = id?;
    match blobs.get(id).await {
        Ok(Some(data)) => Some(MediaPayload {
            mime_type: sniff_mime(&data).to_string(),
            data,
        }),
        Ok(None) => {
            log::warn!("Reference image {} is missing, generating without it", id);
            None
        }
        Err(e) => {
            log::error!("Failed to load reference image {}: {}", id, e);
            None
        }
    }
}

// Saves every image of a round. On failure the images already written are removed again.
async fn save_round(blobs: &BlobStore, images: Vec<Vec<u8>>) -> Result<ImageRound, StoreError> {
    let results = futures::future::join_all(images.into_iter().map(|image| blobs.save(image))).await;

    let mut saved = Vec::with_capacity(results.len());
    let mut failure: Option<StoreError> = None;
    for result in results {
        match result {
            Ok(id) => saved.push(id),
            // Quota exhaustion is the most useful thing to report
            Err(e) if failure.as_ref().map_or(true, |f| !f.is_quota_exceeded()) => {
                failure = Some(e)
            }
            Err(e) => log::error!("Additional image save failure: {}", e),
        }
    }

    match failure {
        None => Ok(saved),
        Some(e) => {
            log::error!(
                "Could not save generated images ({}); removing {} already saved",
                e,
                saved.len()
            );
            blobs.delete_all_best_effort(saved).await;
            Err(e)
        }
    }
}

async fn record_generated_round(
    state: &AppState,
    project_id: i64,
    scene_index: usize,
    images: Vec<Vec<u8>>,
) -> Result<ImageRound, AppError> {
    if images.is_empty() {
        return Err(GenerationError::MalformedResponse("no images returned".to_string()).into());
    }
    let round = save_round(&state.blobs, images).await?;

    // The counter is advisory; a failed update must not lose the images
    if let Err(e) = state.usage.record_request().await {
        log::warn!("Failed to record generation request: {}", e);
    }

    let appended = round.clone();
    let result = state
        .update_project(project_id, move |project| {
            let scene = project
                .storyboard
                .get_mut(scene_index)
                .ok_or(AppError::SceneIndexOutOfRange(scene_index))?;
            Ok(scene.append_round(appended))
        })
        .await;

    match result {
        Ok(Some(evicted)) => {
            log::info!(
                "Scene {} history full, deleting {} images of the oldest round",
                scene_index,
                evicted.len()
            );
            state.blobs.delete_all_best_effort(evicted).await;
            Ok(round)
        }
        Ok(None) => Ok(round),
        Err(e) => {
            // The scene or project went away while generating
            state.blobs.delete_all_best_effort(round).await;
            Err(e)
        }
    }
}

// --- Maintenance ---

pub async fn requests_today(state: &AppState) -> Result<u32, AppError> {
    Ok(state.usage.current().await?)
}

pub async fn storage_usage(state: &AppState) -> Result<StorageUsage, AppError> {
    let usage = state.storage.usage().await?;
    if usage.is_near_quota() {
        log::warn!(
            "Storage is {:.0}% full, consider deleting old projects",
            usage.ratio().unwrap_or_default() * 100.0
        );
    }
    Ok(usage)
}

/// Deletes blobs referenced by no project in the workspace and no stored snapshot.
///
/// Meant for idle moments: a generation in flight may own blobs that no project
/// references yet.
pub async fn sweep_orphaned_blobs(state: &AppState) -> Result<usize, AppError> {
    let projects = state.projects().await;
    sweep_orphans(&state.blobs, &state.snapshots, &projects).await
}

pub async fn sweep_orphans(
    blobs: &BlobStore,
    snapshots: &SnapshotManager,
    projects: &[Project],
) -> Result<usize, AppError> {
    let mut referenced: HashSet<BlobId> = projects.iter().flat_map(Project::blob_ids).collect();
    for snapshot in snapshots.all().await? {
        match serde_json::from_value::<Project>(snapshot.project) {
            Ok(project) => referenced.extend(project.blob_ids()),
            Err(e) => log::warn!("Skipping unreadable snapshot during sweep: {}", e),
        }
    }

    let orphans: Vec<BlobId> = blobs
        .list_ids()
        .await?
        .into_iter()
        .filter(|id| !referenced.contains(id))
        .collect();
    if orphans.is_empty() {
        log::info!("No orphaned blobs found");
        return Ok(0);
    }

    let total = orphans.len();
    let failed = blobs.delete_all_best_effort(orphans).await;
    log::info!("Removed {} orphaned blobs ({} failed)", total - failed, failed);
    Ok(total - failed)
}
