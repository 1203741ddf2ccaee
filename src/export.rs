//! One-way exports of a project: the storyboard as JSON text and its images as a ZIP archive.

use crate::error::AppError;
use crate::models::{BlobId, Project, Scene};
use crate::storage::BlobStore;
use serde::Serialize;
use std::io::{Cursor, Write};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StoryboardExport<'a> {
    pub logline: &'a str,
    pub narrative_arc: &'a str,
    pub storyboard: Vec<SceneExport<'a>>,
}

// Text-only view of a scene; image references are never exported
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SceneExport<'a> {
    pub timestamp: &'a str,
    pub description: &'a str,
    pub actions: &'a str,
    pub camera_angle: &'a str,
    pub lyric: &'a str,
    pub section: &'a str,
}

impl<'a> StoryboardExport<'a> {
    pub fn from_project(project: &'a Project) -> Self {
        Self {
            logline: &project.concept,
            narrative_arc: &project.narrative_arc,
            storyboard: project.storyboard.iter().map(SceneExport::from).collect(),
        }
    }
}

impl<'a> From<&'a Scene> for SceneExport<'a> {
    fn from(scene: &'a Scene) -> Self {
        Self {
            timestamp: &scene.timestamp,
            description: &scene.description,
            actions: &scene.actions,
            camera_angle: &scene.camera_angle,
            lyric: &scene.lyric,
            section: &scene.section,
        }
    }
}

/// Pretty-printed storyboard JSON for `project`.
pub fn storyboard_json(project: &Project) -> Result<String, AppError> {
    if project.storyboard.is_empty() {
        return Err(AppError::NothingToExport("no storyboard available to export"));
    }
    Ok(serde_json::to_string_pretty(&StoryboardExport::from_project(project))?)
}

/// `Night Drive` → `Night_Drive_storyboard.json`; each whitespace run becomes one underscore.
pub fn storyboard_file_name(project_name: &str) -> String {
    let mut name = String::with_capacity(project_name.len());
    let mut in_whitespace = false;
    for c in project_name.chars() {
        if c.is_whitespace() {
            if !in_whitespace {
                name.push('_');
            }
            in_whitespace = true;
        } else {
            name.push(c);
            in_whitespace = false;
        }
    }
    format!("{}_storyboard.json", name)
}

/// `Night Drive!` → `night_drive__images.zip`.
pub fn image_archive_file_name(project_name: &str) -> String {
    let name: String = project_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("{}_images.zip", name)
}

/// Archive entry name; all indices are zero-based and printed one-based.
pub fn image_entry_name(scene_index: usize, scene: &Scene, round: usize, variant: usize) -> String {
    format!(
        "scene-{:02}_ts-{}_regen-{:02}_var-{:02}.png",
        scene_index + 1,
        scene.timestamp_slug(),
        round + 1,
        variant + 1
    )
}

/// Every image of the project paired with its archive entry name, in scene/round/variant order.
pub fn image_entries(project: &Project) -> Vec<(String, &BlobId)> {
    let mut entries = Vec::new();
    for (scene_index, scene) in project.storyboard.iter().enumerate() {
        for (round_index, round) in scene.image_history.iter().enumerate() {
            for (variant_index, id) in round.iter().enumerate() {
                entries.push((
                    image_entry_name(scene_index, scene, round_index, variant_index),
                    id,
                ));
            }
        }
    }
    entries
}

#[derive(Debug)]
pub struct ImageArchive {
    pub file_name: String,
    pub bytes: Vec<u8>,
    pub written: usize,
    pub skipped: usize, // referenced blobs that no longer exist
}

/// Builds a ZIP of every stored image referenced by `project`.
pub async fn image_archive(blobs: &BlobStore, project: &Project) -> Result<ImageArchive, AppError> {
    let entries = image_entries(project);
    if entries.is_empty() {
        return Err(AppError::NothingToExport(
            "no images have been generated for this project yet",
        ));
    }

    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut written = 0;
    let mut skipped = 0;

    for (name, id) in entries {
        let Some(data) = blobs.get(id).await? else {
            log::warn!("Image {} for {} is missing, leaving it out", id, name);
            skipped += 1;
            continue;
        };
        zip.start_file(name.as_str(), options)?;
        zip.write_all(&data).map_err(zip::result::ZipError::from)?;
        written += 1;
    }

    let bytes = zip.finish()?.into_inner();
    log::info!(
        "Exported {} images of project {} ({} missing, {} bytes)",
        written,
        project.id,
        skipped,
        bytes.len()
    );
    Ok(ImageArchive {
        file_name: image_archive_file_name(&project.name),
        bytes,
        written,
        skipped,
    })
}
