use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    AnimatedImage,
    Video,
    Archive,
    ModelFile,
    Other,
}

impl MediaKind {
    /// Kinds that may be used as a folder preview.
    pub fn is_previewable(self) -> bool {
        matches!(self, MediaKind::Image | MediaKind::AnimatedImage)
    }
}

/// Extension sets per media kind, lowercase and without the leading dot.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MediaExtensions {
    pub images: HashSet<String>,
    pub animated_images: HashSet<String>,
    pub videos: HashSet<String>,
    pub archives: HashSet<String>,
    pub model_files: HashSet<String>,
}

fn set(exts: &[&str]) -> HashSet<String> {
    exts.iter().map(|e| e.to_string()).collect()
}

impl Default for MediaExtensions {
    fn default() -> Self {
        Self {
            images: set(&["jpg", "jpeg", "png", "webp", "bmp"]),
            animated_images: set(&["gif"]),
            videos: set(&["mp4", "webm", "mov", "m4v"]),
            archives: set(&["zip", "7z", "rar"]),
            model_files: set(&["stl"]),
        }
    }
}

impl MediaExtensions {
    pub fn classify(&self, path: &Path) -> MediaKind {
        let ext = match path.extension().and_then(|s| s.to_str()) {
            Some(ext) => ext.to_lowercase(),
            None => return MediaKind::Other,
        };

        if self.images.contains(&ext) {
            MediaKind::Image
        } else if self.animated_images.contains(&ext) {
            MediaKind::AnimatedImage
        } else if self.videos.contains(&ext) {
            MediaKind::Video
        } else if self.archives.contains(&ext) {
            MediaKind::Archive
        } else if self.model_files.contains(&ext) {
            MediaKind::ModelFile
        } else {
            MediaKind::Other
        }
    }
}
