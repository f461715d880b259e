use crate::cache::{CacheBatch, CatalogUpdate, IndexCache};
use crate::config::AppConfig;
use crate::error::AppError;
use crate::models::{FolderPage, FolderRecord, FullReindexStats, IncrementalStats, RepairStats};
use crate::paths::{ensure_inside_root, resolve_project_folder};
use crate::query::FolderQuery;
use crate::reconcile::{reconcile, FolderFacts, SidecarFacts};
use crate::sidecar::SidecarStore;
use crate::tags::needs_rewrite;
use crate::walker::{list_project_folders, scan_folder, FolderScan};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

/// Activity times closer than this are considered unchanged.
const ACTIVITY_EPSILON: f64 = 1e-6;

/// Result of reconciling one folder, before it reaches the cache.
#[derive(Debug)]
struct Reconciled {
    record: FolderRecord,
    /// The folder had an override whose target no longer exists.
    stale_override: bool,
    /// Part of the folder could not be read; the record is best effort.
    partial: bool,
}

#[derive(Debug)]
enum SyncOutcome {
    Skipped,
    Changed { reconciled: Reconciled, is_new: bool },
}

/// Folds the per-folder results of a full reindex into one cache batch.
///
/// Returns the batch and the number of failed folders. A partly unreadable
/// folder is still upserted but counts as failed.
fn fold_full(results: Vec<(PathBuf, Result<Reconciled, AppError>)>) -> (CacheBatch, usize) {
    let mut failed = 0;
    let mut batch = CacheBatch {
        clear_records: true,
        catalog: CatalogUpdate::Rebuild,
        ..CacheBatch::default()
    };
    for (folder, result) in results {
        match result {
            Ok(reconciled) => {
                if reconciled.partial {
                    failed += 1;
                }
                if reconciled.stale_override {
                    batch.stale_overrides.push(reconciled.record.path.clone());
                }
                batch.upserts.push(reconciled.record);
            }
            Err(e) => {
                log::warn!("Failed to index {:?}: {}", folder, e);
                failed += 1;
            }
        }
    }
    (batch, failed)
}

/// Per-folder results of an incremental reindex, ready to commit.
#[derive(Debug, Default)]
struct IncrementalFold {
    batch: CacheBatch,
    /// Only `skipped` and `failed` are known before the commit.
    stats: IncrementalStats,
    new_paths: HashSet<String>,
    seen: HashSet<String>,
}

fn fold_incremental(results: Vec<(String, Result<SyncOutcome, AppError>)>) -> IncrementalFold {
    let mut fold = IncrementalFold {
        batch: CacheBatch {
            catalog: CatalogUpdate::AddMissing,
            ..CacheBatch::default()
        },
        ..IncrementalFold::default()
    };
    for (key, result) in results {
        fold.seen.insert(key.clone());
        match result {
            Ok(SyncOutcome::Skipped) => fold.stats.skipped += 1,
            Ok(SyncOutcome::Changed { reconciled, is_new }) => {
                if reconciled.partial {
                    fold.stats.failed += 1;
                }
                if is_new {
                    fold.new_paths.insert(key);
                }
                if reconciled.stale_override {
                    fold.batch.stale_overrides.push(reconciled.record.path.clone());
                }
                fold.batch.upserts.push(reconciled.record);
            }
            Err(e) => {
                log::warn!("Failed to sync {}: {}", key, e);
                fold.stats.failed += 1;
            }
        }
    }
    fold
}

/// Outcome of repairing the tags of one folder.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TagRepair {
    pub path: String,
    pub tags: Vec<String>,
    pub rewritten: bool,
    pub write_failed: bool,
}

/// The synchronization engine: keeps the cache in line with the collection on disk.
pub struct Indexer {
    config: Arc<AppConfig>,
    cache: Arc<IndexCache>,
    sidecars: SidecarStore,
    pool: rayon::ThreadPool,
    write_lock: Mutex<()>,
}

impl Indexer {
    pub fn new(config: Arc<AppConfig>, cache: Arc<IndexCache>) -> Result<Self, AppError> {
        log::info!("Creating indexer with {} workers", config.num_workers);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.num_workers.max(1))
            .build()?;
        let sidecars = SidecarStore::new(config.sidecar_file_name.clone());
        Ok(Self {
            config,
            cache,
            sidecars,
            pool,
            write_lock: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn cache(&self) -> &IndexCache {
        &self.cache
    }

    pub(crate) fn sidecars(&self) -> &SidecarStore {
        &self.sidecars
    }

    pub(crate) fn root(&self) -> Result<PathBuf, AppError> {
        self.config.collection_root()
    }

    /// Serializes every operation that writes to the cache or to sidecars.
    pub(crate) fn lock_writes(&self) -> MutexGuard<'_, ()> {
        self.write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Reconciles one folder from an existing scan.
    fn reconcile_scanned(
        &self,
        root: &Path,
        folder: &Path,
        scan: FolderScan,
        cached: Option<&FolderRecord>,
        pinned: Option<&String>,
    ) -> Result<Reconciled, AppError> {
        if !folder.is_dir() {
            return Err(AppError::NotFound(format!("folder {}", folder.display())));
        }

        let media = &self.config.media;
        let sidecar = self
            .sidecars
            .read(folder)
            .map(|s| SidecarFacts::from_sidecar(&s, folder, media));

        let live_pin = pinned.filter(|target| Path::new(target.as_str()).is_file());
        let stale_override = pinned.is_some() && live_pin.is_none();
        if stale_override {
            log::info!("Dropping preview override of {:?}: target is gone", folder);
        }

        let partial = scan.unreadable > 0;
        if partial {
            log::warn!(
                "{} unreadable entries in {:?}, indexing what was readable",
                scan.unreadable,
                folder
            );
        }

        let facts = FolderFacts::new(root, folder, scan);
        let record = reconcile(&facts, sidecar.as_ref(), cached, live_pin.map(String::as_str));
        log::debug!("Reconciled {}: {:?}", record.path, record.counts);
        Ok(Reconciled {
            record,
            stale_override,
            partial,
        })
    }

    /// Clears the cache and indexes every project folder from scratch.
    pub fn full_reindex(&self, recursive: bool) -> Result<FullReindexStats, AppError> {
        let root = self.root()?;
        let _guard = self.lock_writes();
        log::info!("Starting full reindex of {} (recursive: {})", root.display(), recursive);

        let folders = list_project_folders(&root)?;
        let overrides = self.cache.overrides()?;

        let results: Vec<(PathBuf, Result<Reconciled, AppError>)> = self.pool.install(|| {
            folders
                .par_iter()
                .map(|folder| {
                    let key = folder.to_string_lossy();
                    let scan = scan_folder(folder, recursive, &self.config.media);
                    let result =
                        self.reconcile_scanned(&root, folder, scan, None, overrides.get(&*key));
                    (folder.clone(), result)
                })
                .collect()
        });

        let (mut batch, failed) = fold_full(results);
        let mut stats = FullReindexStats {
            failed,
            ..FullReindexStats::default()
        };

        let seen: HashSet<&str> = batch.upserts.iter().map(|r| r.path.as_str()).collect();
        let orphaned: Vec<String> = overrides
            .keys()
            .filter(|path| !seen.contains(path.as_str()))
            .cloned()
            .collect();
        batch.stale_overrides.extend(orphaned);

        let failed_rows = self.cache.apply(&batch)?;
        stats.failed += failed_rows.len();
        stats.indexed = batch.upserts.len() - failed_rows.len();

        log::info!(
            "Full reindex complete: {} indexed, {} failed",
            stats.indexed,
            stats.failed
        );
        Ok(stats)
    }

    /// Re-reconciles only folders whose activity time changed, and drops vanished ones.
    pub fn incremental_reindex(&self) -> Result<IncrementalStats, AppError> {
        let root = self.root()?;
        let _guard = self.lock_writes();
        log::info!("Starting incremental reindex of {}", root.display());

        let activity = self.cache.activity_map()?;
        let overrides = self.cache.overrides()?;
        let folders = list_project_folders(&root)?;
        log::debug!(
            "{} folders on disk, {} in cache",
            folders.len(),
            activity.len()
        );

        let results: Vec<(String, Result<SyncOutcome, AppError>)> = self.pool.install(|| {
            folders
                .par_iter()
                .map(|folder| {
                    let key = folder.to_string_lossy().into_owned();
                    let result = self.sync_folder(&root, folder, &key, &activity, &overrides);
                    (key, result)
                })
                .collect()
        });

        let IncrementalFold {
            mut batch,
            mut stats,
            new_paths,
            seen,
        } = fold_incremental(results);

        batch.removals = activity
            .keys()
            .filter(|path| !seen.contains(*path))
            .cloned()
            .collect();
        for path in &batch.removals {
            log::debug!("Removing vanished folder {}", path);
        }

        let failed_rows: HashSet<String> = self.cache.apply(&batch)?.into_iter().collect();
        stats.failed += failed_rows.len();
        stats.removed = batch.removals.len();
        for record in batch.upserts.iter().filter(|r| !failed_rows.contains(&r.path)) {
            if new_paths.contains(&record.path) {
                stats.added += 1;
            } else {
                stats.updated += 1;
            }
        }

        log::info!(
            "Incremental reindex complete: {} added, {} updated, {} removed, {} skipped, {} failed",
            stats.added,
            stats.updated,
            stats.removed,
            stats.skipped,
            stats.failed
        );
        Ok(stats)
    }

    fn sync_folder(
        &self,
        root: &Path,
        folder: &Path,
        key: &str,
        activity: &HashMap<String, f64>,
        overrides: &HashMap<String, String>,
    ) -> Result<SyncOutcome, AppError> {
        let scan = scan_folder(folder, false, &self.config.media);
        let previous = activity.get(key).copied();

        if let Some(previous) = previous {
            if (previous - scan.last_activity).abs() <= ACTIVITY_EPSILON {
                log::trace!("Unchanged: {}", key);
                return Ok(SyncOutcome::Skipped);
            }
        }

        let cached = match previous {
            Some(_) => self.cache.get_record(key)?,
            None => None,
        };
        let reconciled =
            self.reconcile_scanned(root, folder, scan, cached.as_ref(), overrides.get(key))?;
        Ok(SyncOutcome::Changed {
            reconciled,
            is_new: previous.is_none(),
        })
    }

    /// Recomputes the record of one project folder and upserts it.
    ///
    /// A cached rating is kept when the recomputed record has none.
    pub fn rebuild_folder(&self, folder: &Path) -> Result<FolderRecord, AppError> {
        let root = self.root()?;
        let folder = resolve_project_folder(&root, folder)?;
        let _guard = self.lock_writes();
        self.rebuild_folder_locked(&root, &folder)
    }

    /// Same as [`Indexer::rebuild_folder`], for callers already holding the write lock.
    pub(crate) fn rebuild_folder_locked(
        &self,
        root: &Path,
        folder: &Path,
    ) -> Result<FolderRecord, AppError> {
        let cached = self.cache.get_record(&folder.to_string_lossy())?;
        self.rebuild_folder_from(root, folder, cached)
    }

    /// Rebuilds `folder` using `cached` as the cache-side fallback for its fields.
    pub(crate) fn rebuild_folder_from(
        &self,
        root: &Path,
        folder: &Path,
        cached: Option<FolderRecord>,
    ) -> Result<FolderRecord, AppError> {
        let key = folder.to_string_lossy().into_owned();
        let pinned = self.cache.get_override(&key)?;

        let scan = scan_folder(folder, false, &self.config.media);
        let reconciled = self.reconcile_scanned(root, folder, scan, cached.as_ref(), pinned.as_ref())?;

        let mut batch = CacheBatch {
            preserve_rating: true,
            catalog: CatalogUpdate::AddMissing,
            ..CacheBatch::default()
        };
        if reconciled.stale_override {
            batch.stale_overrides.push(key.clone());
        }
        batch.upserts.push(reconciled.record);

        if !self.cache.apply(&batch)?.is_empty() {
            return Err(AppError::Generic(format!("failed to cache folder {}", key)));
        }
        self.cache
            .get_record(&key)?
            .ok_or_else(|| AppError::NotFound(format!("cached folder {}", key)))
    }

    /// Normalizes the sidecar tags of one folder, rewriting the file when needed.
    ///
    /// The cache and catalog are updated even when the rewrite fails.
    fn repair_folder_tags_locked(&self, folder: &Path) -> Result<Option<TagRepair>, AppError> {
        let mut sidecar = match self.sidecars.read(folder) {
            Some(sidecar) => sidecar,
            None => return Ok(None),
        };

        let tags = sidecar.tags();
        let mut repair = TagRepair {
            path: folder.to_string_lossy().into_owned(),
            tags: tags.clone(),
            rewritten: false,
            write_failed: false,
        };

        if needs_rewrite(sidecar.raw_tags(), &tags) {
            sidecar.set_tags(&tags);
            match self.sidecars.write(folder, &sidecar) {
                Ok(()) => {
                    log::info!("Fixed tags in {:?}", folder);
                    repair.rewritten = true;
                }
                Err(e) => {
                    log::warn!("Could not rewrite tags in {:?}: {}", folder, e);
                    repair.write_failed = true;
                }
            }
        }

        self.cache.update_tags(&repair.path, &tags)?;
        if !tags.is_empty() {
            self.cache.add_catalog_tags(&tags)?;
        }
        Ok(Some(repair))
    }

    /// Repairs the tags of a single project folder. `None` when it has no sidecar.
    pub fn repair_folder_tags(&self, folder: &Path) -> Result<Option<TagRepair>, AppError> {
        let root = self.root()?;
        let folder = resolve_project_folder(&root, folder)?;
        let _guard = self.lock_writes();
        self.repair_folder_tags_locked(&folder)
    }

    /// Repairs the tags of every project folder that has a sidecar.
    pub fn repair_all_tags(&self) -> Result<RepairStats, AppError> {
        let root = self.root()?;
        let _guard = self.lock_writes();
        log::info!("Repairing tags under {}", root.display());

        let mut stats = RepairStats::default();
        for folder in list_project_folders(&root)? {
            match self.repair_folder_tags_locked(&folder) {
                Ok(Some(repair)) => {
                    stats.checked += 1;
                    if repair.rewritten {
                        stats.fixed += 1;
                    }
                    if repair.write_failed {
                        stats.failed += 1;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    log::warn!("Tag repair failed for {:?}: {}", folder, e);
                    stats.checked += 1;
                    stats.failed += 1;
                }
            }
        }

        log::info!(
            "Tag repair complete: {} checked, {} fixed, {} failed",
            stats.checked,
            stats.fixed,
            stats.failed
        );
        Ok(stats)
    }

    /// Repairs tags for a sidecar file, a project folder or the whole collection.
    pub fn repair_tags_at(&self, target: &Path) -> Result<RepairStats, AppError> {
        let root = self.root()?;
        let real = ensure_inside_root(&root, target)?;

        let folder = if real.is_file() {
            if real.file_name().and_then(|n| n.to_str()) != Some(self.sidecars.file_name()) {
                return Err(AppError::InvalidInput(format!(
                    "{} is not a sidecar file",
                    target.display()
                )));
            }
            real.parent().map(Path::to_path_buf)
        } else if real == root {
            None
        } else {
            Some(real)
        };

        match folder {
            None => self.repair_all_tags(),
            Some(folder) => {
                let repair = self.repair_folder_tags(&folder)?;
                Ok(RepairStats {
                    checked: usize::from(repair.is_some()),
                    fixed: usize::from(repair.as_ref().map_or(false, |r| r.rewritten)),
                    failed: usize::from(repair.as_ref().map_or(false, |r| r.write_failed)),
                })
            }
        }
    }

    /// Recomputes the tag catalog from scratch.
    pub fn rebuild_tag_catalog(&self) -> Result<usize, AppError> {
        self.root()?;
        let _guard = self.lock_writes();
        let count = self.cache.rebuild_tag_catalog()?;
        log::info!("Tag catalog rebuilt with {} tags", count);
        Ok(count)
    }

    /// Adds folder tags missing from the catalog.
    pub fn add_missing_catalog_tags(&self) -> Result<usize, AppError> {
        self.root()?;
        let _guard = self.lock_writes();
        let count = self.cache.add_missing_tags_to_catalog()?;
        log::info!("Added {} tags to the catalog", count);
        Ok(count)
    }

    pub fn list_tags(&self) -> Result<Vec<String>, AppError> {
        self.root()?;
        self.cache.list_tags()
    }

    pub fn query(&self, request: &FolderQuery) -> Result<FolderPage, AppError> {
        self.root()?;
        self.cache.query(request)
    }

    pub fn get_folder(&self, path: &str) -> Result<FolderRecord, AppError> {
        self.root()?;
        self.cache
            .get_record(path)?
            .ok_or_else(|| AppError::NotFound(format!("folder {}", path)))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::query::SortKey;
    use serde_json::json;
    use std::fs;

    pub(crate) struct Fixture {
        _tmp: tempfile::TempDir,
        pub root: PathBuf,
        pub indexer: Arc<Indexer>,
    }

    pub(crate) fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().canonicalize().unwrap();
        let config = AppConfig {
            collection_root: Some(root.to_string_lossy().into_owned()),
            num_workers: 2,
            ..AppConfig::default()
        };
        let cache = Arc::new(IndexCache::open_in_memory().unwrap());
        let indexer = Arc::new(Indexer::new(Arc::new(config), cache).unwrap());
        Fixture {
            _tmp: tmp,
            root,
            indexer,
        }
    }

    impl Fixture {
        pub(crate) fn folder(&self, name: &str) -> PathBuf {
            let path = self.root.join(name);
            fs::create_dir_all(&path).unwrap();
            path
        }

        pub(crate) fn sidecar(&self, name: &str, value: serde_json::Value) {
            fs::write(
                self.folder(name).join(".stl_collect.json"),
                serde_json::to_string(&value).unwrap(),
            )
            .unwrap();
        }

        pub(crate) fn record(&self, name: &str) -> Option<FolderRecord> {
            let key = self.root.join(name).to_string_lossy().into_owned();
            self.indexer.cache().get_record(&key).unwrap()
        }

        pub(crate) fn key(&self, name: &str) -> String {
            self.root.join(name).to_string_lossy().into_owned()
        }
    }

    fn names(page: &FolderPage) -> Vec<&str> {
        page.items.iter().map(|r| r.name.as_str()).collect()
    }

    #[test]
    fn end_to_end_full_reindex_and_query() {
        let fx = fixture();
        fs::write(fx.folder("A").join("photo.jpg"), "x").unwrap();
        fx.sidecar("A", json!({"tags": ["red", "blue"], "rating": 4}));
        fx.folder("B");

        let stats = fx.indexer.full_reindex(false).unwrap();
        assert_eq!(stats, FullReindexStats { indexed: 2, failed: 0 });

        let page = fx
            .indexer
            .query(&FolderQuery {
                sort: SortKey::Name,
                ..FolderQuery::default()
            })
            .unwrap();
        assert_eq!(names(&page), vec!["A", "B"]);

        let page = fx
            .indexer
            .query(&FolderQuery {
                tags: vec!["red".into()],
                ..FolderQuery::default()
            })
            .unwrap();
        assert_eq!(names(&page), vec!["A"]);
        assert_eq!(page.items[0].rating, Some(4));
        assert_eq!(page.items[0].counts.images, 1);
        assert_eq!(
            page.items[0].preview_path,
            Some(fx.root.join("A").join("photo.jpg").to_string_lossy().into_owned())
        );
        assert_eq!(fx.indexer.list_tags().unwrap(), vec!["blue", "red"]);
    }

    #[test]
    fn full_reindex_skips_hidden_folders() {
        let fx = fixture();
        fx.folder("A");
        fx.folder(".TS");

        let stats = fx.indexer.full_reindex(false).unwrap();
        assert_eq!(stats.indexed, 1);
        assert!(fx.record(".TS").is_none());
    }

    #[test]
    fn recursive_full_reindex_counts_subfolders() {
        let fx = fixture();
        let a = fx.folder("A");
        fs::create_dir_all(a.join("parts")).unwrap();
        fs::write(a.join("parts").join("arm.stl"), "x").unwrap();
        fs::write(a.join("body.stl"), "x").unwrap();

        fx.indexer.full_reindex(true).unwrap();
        assert_eq!(fx.record("A").unwrap().counts.model_files, 2);

        fx.indexer.full_reindex(false).unwrap();
        assert_eq!(fx.record("A").unwrap().counts.model_files, 1);
    }

    #[test]
    fn incremental_reindex_is_idempotent() {
        let fx = fixture();
        fs::write(fx.folder("A").join("a.stl"), "x").unwrap();
        fx.folder("B");
        fx.folder("C");

        let first = fx.indexer.incremental_reindex().unwrap();
        assert_eq!(first.added, 3);
        assert_eq!(first.skipped, 0);

        let second = fx.indexer.incremental_reindex().unwrap();
        assert_eq!(
            second,
            IncrementalStats {
                added: 0,
                updated: 0,
                removed: 0,
                skipped: 3,
                failed: 0,
            }
        );
    }

    #[test]
    fn incremental_reindex_updates_changed_folders() {
        let fx = fixture();
        let a = fx.folder("A");
        fs::write(a.join("a.stl"), "x").unwrap();
        fx.folder("B");
        fx.indexer.incremental_reindex().unwrap();

        let newer = std::time::SystemTime::now() + std::time::Duration::from_secs(60);
        let file = fs::File::create(a.join("b.stl")).unwrap();
        file.set_modified(newer).unwrap();
        drop(file);

        let stats = fx.indexer.incremental_reindex().unwrap();
        assert_eq!(stats.updated, 1);
        assert_eq!(stats.skipped, 1);
        assert_eq!(fx.record("A").unwrap().counts.model_files, 2);
    }

    #[test]
    fn vanished_folders_and_their_overrides_are_removed() {
        let fx = fixture();
        let a = fx.folder("A");
        fs::write(a.join("pin.png"), "x").unwrap();
        fx.folder("B");
        fx.indexer.incremental_reindex().unwrap();
        fx.indexer
            .cache()
            .set_override(&fx.key("A"), &a.join("pin.png").to_string_lossy())
            .unwrap();

        fs::remove_dir_all(&a).unwrap();
        let stats = fx.indexer.incremental_reindex().unwrap();
        assert_eq!(stats.removed, 1);
        assert_eq!(stats.skipped, 1);
        assert!(fx.record("A").is_none());
        assert!(fx.indexer.cache().get_override(&fx.key("A")).unwrap().is_none());
    }

    #[test]
    fn override_beats_sidecar_preview() {
        let fx = fixture();
        let a = fx.folder("A");
        fs::write(a.join("a.png"), "x").unwrap();
        fs::write(a.join("b.png"), "x").unwrap();
        fx.sidecar("A", json!({"thumbnail": "b.png"}));
        fx.indexer.full_reindex(false).unwrap();
        assert_eq!(
            fx.record("A").unwrap().preview_path,
            Some(a.join("b.png").to_string_lossy().into_owned())
        );

        fx.indexer
            .cache()
            .set_override(&fx.key("A"), &a.join("a.png").to_string_lossy())
            .unwrap();
        fx.indexer.full_reindex(false).unwrap();
        assert_eq!(
            fx.record("A").unwrap().preview_path,
            Some(a.join("a.png").to_string_lossy().into_owned())
        );
    }

    #[test]
    fn stale_override_is_dropped_on_rebuild() {
        let fx = fixture();
        let a = fx.folder("A");
        fs::write(a.join("first.png"), "x").unwrap();
        fx.indexer
            .cache()
            .set_override(&fx.key("A"), &a.join("gone.png").to_string_lossy())
            .unwrap();

        let record = fx.indexer.rebuild_folder(&a).unwrap();
        assert_eq!(
            record.preview_path,
            Some(a.join("first.png").to_string_lossy().into_owned())
        );
        assert!(fx.indexer.cache().get_override(&fx.key("A")).unwrap().is_none());
    }

    #[test]
    fn rebuild_preserves_cached_rating_without_sidecar_rating() {
        let fx = fixture();
        let a = fx.folder("A");
        fs::write(a.join("one.stl"), "x").unwrap();
        fs::write(a.join("two.stl"), "x").unwrap();
        fx.indexer.full_reindex(false).unwrap();
        fx.indexer
            .cache()
            .update_rating(&fx.key("A"), 4, None)
            .unwrap();

        fs::remove_file(a.join("two.stl")).unwrap();
        let record = fx.indexer.rebuild_folder(&a).unwrap();
        assert_eq!(record.rating, Some(4));
        assert_eq!(record.counts.model_files, 1);
    }

    #[test]
    fn malformed_sidecar_does_not_abort_scan() {
        let fx = fixture();
        fs::write(fx.folder("A").join(".stl_collect.json"), "{ nope").unwrap();
        fx.folder("B");

        let stats = fx.indexer.full_reindex(false).unwrap();
        assert_eq!(stats, FullReindexStats { indexed: 2, failed: 0 });
        assert!(fx.record("A").unwrap().tags.is_empty());
    }

    #[test]
    fn repair_rewrites_corrupted_tags_and_updates_cache() {
        let fx = fixture();
        fx.sidecar("A", json!({"tags": ["[\"Tag1\"", "\"Tag2\"]"], "rating": 2}));
        fx.sidecar("B", json!({"tags": ["clean"]}));
        fx.folder("C");
        fx.indexer.full_reindex(false).unwrap();

        let stats = fx.indexer.repair_all_tags().unwrap();
        assert_eq!(stats, RepairStats { checked: 2, fixed: 1, failed: 0 });

        let stored: serde_json::Value = serde_json::from_str(
            &fs::read_to_string(fx.root.join("A").join(".stl_collect.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(stored["tags"], json!(["Tag1", "Tag2"]));
        assert_eq!(stored["rating"], json!(2));
        assert!(fx.root.join("A").join(".stl_collect.json.bak").exists());
        assert!(!fx.root.join("B").join(".stl_collect.json.bak").exists());

        assert_eq!(fx.record("A").unwrap().tags, vec!["Tag1", "Tag2"]);
        let tags = fx.indexer.list_tags().unwrap();
        assert!(tags.contains(&"Tag1".to_string()));
    }

    #[test]
    fn repair_to_empty_tags_clears_cached_tags() {
        let fx = fixture();
        fx.sidecar("A", json!({"tags": ["red"]}));
        fx.indexer.full_reindex(false).unwrap();
        assert_eq!(fx.record("A").unwrap().tags, vec!["red"]);

        fx.sidecar("A", json!({"tags": "[]"}));
        let stats = fx.indexer.repair_all_tags().unwrap();
        assert_eq!(stats, RepairStats { checked: 1, fixed: 1, failed: 0 });

        let stored: serde_json::Value = serde_json::from_str(
            &fs::read_to_string(fx.root.join("A").join(".stl_collect.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(stored["tags"], json!([]));
        assert!(fx.record("A").unwrap().tags.is_empty());

        let rebuilt = fx.indexer.rebuild_folder(&fx.root.join("A")).unwrap();
        assert!(rebuilt.tags.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn repair_updates_cache_when_sidecar_write_fails() {
        let fx = fixture();
        fx.sidecar("A", json!({"tags": "alpha, beta"}));
        fx.indexer.full_reindex(false).unwrap();
        fx.indexer
            .cache()
            .update_tags(&fx.key("A"), &["stale".to_string()])
            .unwrap();
        fx.indexer.rebuild_tag_catalog().unwrap();

        // A dangling backup link makes the pre-write backup copy fail.
        let sidecar = fx.root.join("A").join(".stl_collect.json");
        std::os::unix::fs::symlink(
            fx.root.join("missing").join("backup"),
            fx.root.join("A").join(".stl_collect.json.bak"),
        )
        .unwrap();

        let stats = fx.indexer.repair_all_tags().unwrap();
        assert_eq!(stats, RepairStats { checked: 1, fixed: 0, failed: 1 });

        let stored: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&sidecar).unwrap()).unwrap();
        assert_eq!(stored["tags"], json!("alpha, beta"));
        assert_eq!(fx.record("A").unwrap().tags, vec!["alpha", "beta"]);
        assert_eq!(fx.indexer.list_tags().unwrap(), vec!["alpha", "beta", "stale"]);
    }

    fn reconciled(name: &str, partial: bool) -> Reconciled {
        let facts = FolderFacts::new(Path::new("/c"), &Path::new("/c").join(name), FolderScan::default());
        Reconciled {
            record: reconcile(&facts, None, None, None),
            stale_override: false,
            partial,
        }
    }

    #[test]
    fn full_fold_counts_errors_and_partial_scans_as_failed() {
        let results = vec![
            (PathBuf::from("/c/A"), Ok(reconciled("A", false))),
            (PathBuf::from("/c/B"), Ok(reconciled("B", true))),
            (
                PathBuf::from("/c/C"),
                Err(AppError::NotFound("folder /c/C".into())),
            ),
        ];

        let (batch, failed) = fold_full(results);
        assert_eq!(failed, 2);
        let paths: Vec<&str> = batch.upserts.iter().map(|r| r.path.as_str()).collect();
        assert_eq!(paths, vec!["/c/A", "/c/B"]);
        assert!(batch.clear_records);
        assert_eq!(batch.catalog, CatalogUpdate::Rebuild);
    }

    #[test]
    fn incremental_fold_counts_errors_and_partial_scans_as_failed() {
        let results = vec![
            ("/c/A".to_string(), Ok(SyncOutcome::Skipped)),
            (
                "/c/B".to_string(),
                Ok(SyncOutcome::Changed {
                    reconciled: reconciled("B", true),
                    is_new: true,
                }),
            ),
            (
                "/c/C".to_string(),
                Ok(SyncOutcome::Changed {
                    reconciled: reconciled("C", false),
                    is_new: false,
                }),
            ),
            (
                "/c/D".to_string(),
                Err(AppError::NotFound("folder /c/D".into())),
            ),
        ];

        let fold = fold_incremental(results);
        assert_eq!(fold.stats.skipped, 1);
        assert_eq!(fold.stats.failed, 2);
        assert_eq!(fold.batch.upserts.len(), 2);
        assert_eq!(fold.seen.len(), 4);
        assert!(fold.new_paths.contains("/c/B"));
        assert!(!fold.new_paths.contains("/c/C"));
    }

    #[test]
    fn repair_at_accepts_sidecar_file_folder_or_root() {
        let fx = fixture();
        fx.sidecar("A", json!({"tags": "x, y"}));
        fx.sidecar("B", json!({"tags": "z"}));

        let sidecar = fx.root.join("A").join(".stl_collect.json");
        let stats = fx.indexer.repair_tags_at(&sidecar).unwrap();
        assert_eq!(stats, RepairStats { checked: 1, fixed: 1, failed: 0 });

        let stats = fx.indexer.repair_tags_at(&fx.root.join("A")).unwrap();
        assert_eq!(stats, RepairStats { checked: 1, fixed: 0, failed: 0 });

        let stats = fx.indexer.repair_tags_at(&fx.root).unwrap();
        assert_eq!(stats, RepairStats { checked: 2, fixed: 1, failed: 0 });
    }

    #[test]
    fn operations_fail_without_collection_root() {
        let config = AppConfig::default();
        let cache = Arc::new(IndexCache::open_in_memory().unwrap());
        let indexer = Indexer::new(Arc::new(config), cache).unwrap();

        assert!(matches!(
            indexer.full_reindex(false),
            Err(AppError::Configuration(_))
        ));
        assert!(matches!(
            indexer.incremental_reindex(),
            Err(AppError::Configuration(_))
        ));
        assert!(matches!(
            indexer.query(&FolderQuery::default()),
            Err(AppError::Configuration(_))
        ));
    }

    #[test]
    fn catalog_keeps_unused_tags_until_rebuild() {
        let fx = fixture();
        fx.sidecar("A", json!({"tags": ["red", "old"]}));
        fx.indexer.incremental_reindex().unwrap();
        assert_eq!(fx.indexer.list_tags().unwrap(), vec!["old", "red"]);

        fx.indexer
            .cache()
            .update_tags(&fx.key("A"), &["red".to_string()])
            .unwrap();
        assert_eq!(fx.indexer.add_missing_catalog_tags().unwrap(), 0);
        assert_eq!(fx.indexer.list_tags().unwrap(), vec!["old", "red"]);

        assert_eq!(fx.indexer.rebuild_tag_catalog().unwrap(), 1);
        assert_eq!(fx.indexer.list_tags().unwrap(), vec!["red"]);
    }
}
