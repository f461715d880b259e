//! User-facing mutations of project folders.
//!
//! Each mutation writes the sidecar first and surfaces any write failure, then
//! brings the cached record back in line with a single-folder rebuild.

use crate::cache::CacheBatch;
use crate::error::AppError;
use crate::indexer::Indexer;
use crate::models::FolderRecord;
use crate::paths::{ensure_inside_root, project_folder_of, resolve_project_folder, validate_folder_name};
use crate::sidecar::Sidecar;
use crate::tags::clean_tag;
use std::fs;
use std::path::Path;

impl Indexer {
    /// Tags a mutation starts from: the sidecar's, else the cached ones.
    fn current_tags(&self, folder: &Path, sidecar: &Sidecar) -> Result<Vec<String>, AppError> {
        let tags = sidecar.tags();
        if !tags.is_empty() {
            return Ok(tags);
        }
        let key = folder.to_string_lossy();
        Ok(self
            .cache()
            .get_record(&key)?
            .map(|record| record.tags)
            .unwrap_or_default())
    }

    fn write_tags(&self, folder: &Path, mut sidecar: Sidecar, tags: &[String]) -> Result<(), AppError> {
        sidecar.set_tags(tags);
        sidecar.touch();
        self.sidecars().write(folder, &sidecar)?;
        self.cache().update_tags(&folder.to_string_lossy(), tags)?;
        Ok(())
    }

    /// Pins `file` as the preview of its project folder.
    pub fn set_preview(&self, folder: &Path, file: &Path) -> Result<FolderRecord, AppError> {
        let root = self.root()?;
        let folder = resolve_project_folder(&root, folder)?;
        let file = ensure_inside_root(&root, file)?;

        if !file.starts_with(&folder) || !file.is_file() {
            return Err(AppError::InvalidInput(format!(
                "{} is not a file inside {}",
                file.display(),
                folder.display()
            )));
        }
        if !self.config().media.classify(&file).is_previewable() {
            return Err(AppError::InvalidInput(format!(
                "{} is not an image",
                file.display()
            )));
        }

        let _guard = self.lock_writes();
        self.cache()
            .set_override(&folder.to_string_lossy(), &file.to_string_lossy())?;
        log::info!("Pinned preview {:?} for {:?}", file, folder);
        self.rebuild_folder_locked(&root, &folder)
    }

    pub fn set_rating(&self, folder: &Path, rating: u8) -> Result<FolderRecord, AppError> {
        if rating > 5 {
            return Err(AppError::InvalidInput(format!(
                "rating must be between 0 and 5, got {}",
                rating
            )));
        }
        let root = self.root()?;
        let folder = resolve_project_folder(&root, folder)?;
        let _guard = self.lock_writes();

        let mut sidecar = self.sidecars().read(&folder).unwrap_or_default();
        sidecar.set_rating(rating);
        sidecar.touch();
        self.sidecars().write(&folder, &sidecar)?;

        self.cache()
            .update_rating(&folder.to_string_lossy(), rating, sidecar.modified_at())?;
        self.rebuild_folder_locked(&root, &folder)
    }

    pub fn add_tag(&self, folder: &Path, tag: &str) -> Result<FolderRecord, AppError> {
        let tag = clean_tag(tag)
            .ok_or_else(|| AppError::InvalidInput(format!("invalid tag {:?}", tag)))?;
        let root = self.root()?;
        let folder = resolve_project_folder(&root, folder)?;
        let _guard = self.lock_writes();

        let sidecar = self.sidecars().read(&folder).unwrap_or_default();
        let mut tags = self.current_tags(&folder, &sidecar)?;
        if !tags.contains(&tag) {
            tags.push(tag.clone());
        }

        self.write_tags(&folder, sidecar, &tags)?;
        self.cache().add_catalog_tags(&[tag])?;
        self.rebuild_folder_locked(&root, &folder)
    }

    /// Removes `tag` from a folder. The catalog keeps it until the next rebuild.
    pub fn remove_tag(&self, folder: &Path, tag: &str) -> Result<FolderRecord, AppError> {
        let root = self.root()?;
        let folder = resolve_project_folder(&root, folder)?;
        let _guard = self.lock_writes();

        let sidecar = self.sidecars().read(&folder).unwrap_or_default();
        let mut tags = self.current_tags(&folder, &sidecar)?;
        let wanted = clean_tag(tag).unwrap_or_else(|| tag.trim().to_string());
        let before = tags.len();
        tags.retain(|t| *t != wanted);

        if tags.len() != before {
            self.write_tags(&folder, sidecar, &tags)?;
        } else {
            log::debug!("Tag {:?} not present on {:?}", wanted, folder);
        }
        self.rebuild_folder_locked(&root, &folder)
    }

    /// Renames a project folder in place, keeping its pinned preview.
    pub fn rename_folder(&self, folder: &Path, new_name: &str) -> Result<FolderRecord, AppError> {
        let root = self.root()?;
        let folder = resolve_project_folder(&root, folder)?;
        let new_name = validate_folder_name(new_name)?;
        let target = root.join(new_name);
        if target.exists() {
            return Err(AppError::AlreadyExists(format!("folder {}", new_name)));
        }

        let _guard = self.lock_writes();
        let cached = self.cache().get_record(&folder.to_string_lossy())?;
        fs::rename(&folder, &target)?;
        log::info!("Renamed {:?} to {:?}", folder, target);
        self.cache()
            .move_folder(&folder.to_string_lossy(), &target.to_string_lossy())?;
        self.rebuild_folder_from(&root, &target, cached)
    }

    /// Deletes one file and rebuilds the project folder that held it.
    pub fn delete_file(&self, file: &Path) -> Result<FolderRecord, AppError> {
        let root = self.root()?;
        let file = ensure_inside_root(&root, file)?;
        if !file.is_file() {
            return Err(AppError::InvalidInput(format!("{} is not a file", file.display())));
        }
        let folder = project_folder_of(&root, &file)?;
        if folder == file {
            return Err(AppError::InvalidInput(format!(
                "{} is not inside a project folder",
                file.display()
            )));
        }

        let _guard = self.lock_writes();
        fs::remove_file(&file)?;
        log::info!("Deleted {:?}", file);
        let dropped = self.cache().delete_overrides_targeting(&file.to_string_lossy())?;
        if dropped > 0 {
            log::debug!("Dropped {} preview override(s) pointing at {:?}", dropped, file);
        }
        self.rebuild_folder_locked(&root, &folder)
    }

    /// Removes a project folder from disk and from the cache.
    pub fn delete_project(&self, folder: &Path) -> Result<(), AppError> {
        let root = self.root()?;
        let folder = resolve_project_folder(&root, folder)?;

        let _guard = self.lock_writes();
        fs::remove_dir_all(&folder)?;
        log::info!("Deleted project {:?}", folder);
        self.cache().apply(&CacheBatch {
            removals: vec![folder.to_string_lossy().into_owned()],
            ..CacheBatch::default()
        })?;
        Ok(())
    }
}
