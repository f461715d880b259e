use crate::classify::{MediaExtensions, MediaKind};
use crate::error::AppError;
use crate::models::MediaCounts;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use walkdir::{DirEntry, WalkDir};

/// Filesystem facts gathered for one project folder.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FolderScan {
    pub counts: MediaCounts,
    pub last_activity: f64,
    /// First image-category file in file-name order.
    pub first_image: Option<PathBuf>,
    /// Earliest creation time among image and animated-image files.
    pub earliest_image_created: Option<f64>,
    pub folder_created: Option<f64>,
    /// Entries (the folder itself included) that could not be read.
    pub unreadable: usize,
}

pub fn epoch_secs(time: SystemTime) -> f64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .map(|s| s.starts_with('.'))
        .unwrap_or(false)
}

/// Lists the project folders directly under the collection root, skipping hidden ones.
pub fn list_project_folders(root: &Path) -> Result<Vec<PathBuf>, AppError> {
    log::debug!("Listing project folders in {:?}", root);

    let mut folders = Vec::new();
    for entry in WalkDir::new(root)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !is_hidden(e))
    {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if e.depth() == 0 => return Err(e.into()),
            Err(e) => {
                log::warn!("Skipping unreadable entry in {:?}: {}", root, e);
                continue;
            }
        };

        if entry.file_type().is_dir() || entry.path().is_dir() {
            folders.push(entry.into_path());
        } else {
            log::trace!("Skipping non-directory entry: {:?}", entry.path());
        }
    }

    log::debug!("Found {} project folders", folders.len());
    Ok(folders)
}

/// Counts media files in `folder` and computes its activity time.
///
/// Only direct children are visited unless `recursive` is set. Never fails: an
/// unreadable folder yields zero counts and the folder's own modification time,
/// unreadable entries deeper down are skipped. Both are tallied in `unreadable`.
pub fn scan_folder(folder: &Path, recursive: bool, media: &MediaExtensions) -> FolderScan {
    let own = std::fs::metadata(folder).ok();
    let folder_mtime = own
        .as_ref()
        .and_then(|m| m.modified().ok())
        .map(epoch_secs)
        .unwrap_or(0.0);
    let folder_created = own.as_ref().and_then(|m| m.created().ok()).map(epoch_secs);

    let mut scan = FolderScan {
        folder_created,
        ..FolderScan::default()
    };
    let mut newest: Option<f64> = None;

    let max_depth = if recursive { usize::MAX } else { 1 };
    for entry in WalkDir::new(folder)
        .min_depth(1)
        .max_depth(max_depth)
        .sort_by_file_name()
    {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if e.depth() == 0 => {
                log::warn!("Cannot read folder {:?}: {}", folder, e);
                return FolderScan {
                    last_activity: folder_mtime,
                    folder_created,
                    unreadable: 1,
                    ..FolderScan::default()
                };
            }
            Err(e) => {
                log::warn!("Skipping unreadable entry under {:?}: {}", folder, e);
                scan.unreadable += 1;
                continue;
            }
        };

        if !entry.file_type().is_file() {
            continue;
        }

        let metadata = match entry.metadata() {
            Ok(m) => m,
            Err(e) => {
                log::warn!("Cannot stat {:?}: {}", entry.path(), e);
                scan.unreadable += 1;
                continue;
            }
        };
        if let Ok(modified) = metadata.modified() {
            let secs = epoch_secs(modified);
            newest = Some(newest.map_or(secs, |n| n.max(secs)));
        }

        let kind = media.classify(entry.path());
        log::trace!("Classified {:?} as {:?}", entry.path(), kind);
        match kind {
            MediaKind::Image => scan.counts.images += 1,
            MediaKind::AnimatedImage => scan.counts.animated_images += 1,
            MediaKind::Video => scan.counts.videos += 1,
            MediaKind::Archive => scan.counts.archives += 1,
            MediaKind::ModelFile => scan.counts.model_files += 1,
            MediaKind::Other => {}
        }

        if kind == MediaKind::Image && scan.first_image.is_none() {
            scan.first_image = Some(entry.path().to_path_buf());
        }
        if kind.is_previewable() {
            if let Ok(created) = metadata.created() {
                let secs = epoch_secs(created);
                scan.earliest_image_created =
                    Some(scan.earliest_image_created.map_or(secs, |e| e.min(secs)));
            }
        }
    }

    scan.last_activity = newest.unwrap_or(folder_mtime);
    scan
}
