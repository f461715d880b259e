// src/models.rs

use serde::Serialize;

#[derive(Debug, Serialize, Clone, Copy, Default, PartialEq, Eq)]
pub struct MediaCounts {
    pub images: u32,
    pub animated_images: u32,
    pub videos: u32,
    pub archives: u32,
    pub model_files: u32,
}

/// One reconciled project folder, keyed by its absolute path.
#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct FolderRecord {
    pub path: String,
    pub name: String,
    pub relative_path: String,
    pub last_activity: f64,
    pub counts: MediaCounts,
    pub tags: Vec<String>,
    pub rating: Option<u8>,
    pub preview_path: Option<String>,
    pub created_at: Option<String>,
    pub modified_at: Option<String>,
}

#[derive(Debug, Serialize, Clone, Copy, Default, PartialEq, Eq)]
pub struct FullReindexStats {
    pub indexed: usize,
    pub failed: usize,
}

#[derive(Debug, Serialize, Clone, Copy, Default, PartialEq, Eq)]
pub struct IncrementalStats {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug, Serialize, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepairStats {
    pub checked: usize,
    pub fixed: usize,
    pub failed: usize,
}

#[derive(Debug, Serialize, Clone)]
pub struct FolderPage {
    pub items: Vec<FolderRecord>,
    pub total: u64,
}
