//! Merges filesystem facts, sidecar metadata and cached state into one record.
//!
//! Precedence, per field:
//! - tags: sidecar (when non-empty after normalization), then cache
//! - rating: sidecar, then cache
//! - preview: pinned override, then sidecar file, then first image on disk
//! - created: sidecar `added_at`, then earliest image creation, then folder creation
//! - modified: sidecar `modified_at`, then cache
//! - counts and activity: always the current scan

use crate::classify::MediaExtensions;
use crate::models::FolderRecord;
use crate::sidecar::Sidecar;
use crate::walker::FolderScan;
use chrono::{SecondsFormat, TimeZone, Utc};
use std::path::{Component, Path, PathBuf};

/// Identity and filesystem facts of one folder.
#[derive(Debug, Clone)]
pub struct FolderFacts {
    pub path: String,
    pub name: String,
    pub relative_path: String,
    pub scan: FolderScan,
}

impl FolderFacts {
    pub fn new(root: &Path, folder: &Path, scan: FolderScan) -> Self {
        let name = folder
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let relative_path = folder
            .strip_prefix(root)
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|_| name.clone());
        Self {
            path: folder.to_string_lossy().into_owned(),
            name,
            relative_path,
            scan,
        }
    }
}

/// Values read from the sidecar, with the preview already resolved to an existing file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SidecarFacts {
    pub tags: Vec<String>,
    pub rating: Option<u8>,
    pub preview: Option<String>,
    pub added_at: Option<String>,
    pub modified_at: Option<String>,
}

impl SidecarFacts {
    pub fn from_sidecar(sidecar: &Sidecar, folder: &Path, media: &MediaExtensions) -> Self {
        Self {
            tags: sidecar.tags(),
            rating: sidecar.rating(),
            preview: sidecar
                .preview_name()
                .and_then(|name| resolve_preview(folder, name, media))
                .map(|p| p.to_string_lossy().into_owned()),
            added_at: sidecar.added_at().map(str::to_string),
            modified_at: sidecar.modified_at().map(str::to_string),
        }
    }
}

/// Resolves a preview file name relative to `folder`.
///
/// The name must stay inside the folder and point to an existing image or
/// animated image.
pub fn resolve_preview(folder: &Path, name: &str, media: &MediaExtensions) -> Option<PathBuf> {
    let relative = Path::new(name);
    if !relative
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
    {
        log::debug!("Ignoring preview {:?} outside of {:?}", name, folder);
        return None;
    }

    let candidate = folder.join(relative);
    if candidate.is_file() && media.classify(&candidate).is_previewable() {
        Some(candidate)
    } else {
        None
    }
}

pub fn format_epoch(secs: f64) -> Option<String> {
    let whole = secs.floor();
    let nanos = ((secs - whole) * 1e9) as u32;
    Utc.timestamp_opt(whole as i64, nanos)
        .single()
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
}

pub fn pick_tags(sidecar: &[String], cached: Option<&[String]>) -> Vec<String> {
    if !sidecar.is_empty() {
        sidecar.to_vec()
    } else {
        cached.map(<[String]>::to_vec).unwrap_or_default()
    }
}

pub fn pick_rating(sidecar: Option<u8>, cached: Option<u8>) -> Option<u8> {
    sidecar.or(cached)
}

pub fn pick_preview(
    pinned: Option<&str>,
    sidecar: Option<&str>,
    first_image: Option<&Path>,
) -> Option<String> {
    pinned
        .or(sidecar)
        .map(str::to_string)
        .or_else(|| first_image.map(|p| p.to_string_lossy().into_owned()))
}

pub fn pick_created(
    added_at: Option<&str>,
    earliest_image: Option<f64>,
    folder_created: Option<f64>,
) -> Option<String> {
    added_at
        .map(str::to_string)
        .or_else(|| earliest_image.and_then(format_epoch))
        .or_else(|| folder_created.and_then(format_epoch))
}

pub fn pick_modified(sidecar: Option<&str>, cached: Option<&str>) -> Option<String> {
    sidecar.or(cached).map(str::to_string)
}

/// Builds the authoritative record for one folder. Pure: no filesystem access.
///
/// `pinned` must already be known to exist on disk.
pub fn reconcile(
    facts: &FolderFacts,
    sidecar: Option<&SidecarFacts>,
    cached: Option<&FolderRecord>,
    pinned: Option<&str>,
) -> FolderRecord {
    let empty = SidecarFacts::default();
    let meta = sidecar.unwrap_or(&empty);

    FolderRecord {
        path: facts.path.clone(),
        name: facts.name.clone(),
        relative_path: facts.relative_path.clone(),
        last_activity: facts.scan.last_activity,
        counts: facts.scan.counts,
        tags: pick_tags(&meta.tags, cached.map(|c| c.tags.as_slice())),
        rating: pick_rating(meta.rating, cached.and_then(|c| c.rating)),
        preview_path: pick_preview(
            pinned,
            meta.preview.as_deref(),
            facts.scan.first_image.as_deref(),
        ),
        created_at: pick_created(
            meta.added_at.as_deref(),
            facts.scan.earliest_image_created,
            facts.scan.folder_created,
        ),
        modified_at: pick_modified(
            meta.modified_at.as_deref(),
            cached.and_then(|c| c.modified_at.as_deref()),
        ),
    }
}
