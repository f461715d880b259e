//! SQLite-backed cache of reconciled project folders.
//!
//! Holds three tables:
//! - `folder_index`: one row per project folder, keyed by absolute path
//! - `preview_overrides`: user-pinned preview files, keyed by folder path
//! - `tag_catalog`: every distinct tag seen across folders
//!
//! Batch writes go through [`IndexCache::apply`], which runs in a single
//! transaction so readers see either the old or the new state.

use crate::error::AppError;
use crate::models::{FolderPage, FolderRecord, MediaCounts};
use crate::query::{self, FolderQuery};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

const RECORD_COLUMNS: &str = "path, name, rel, mtime, images, gifs, videos, archives, stls, \
                              tags, rating, thumbnail_path, created_at, modified_at";

/// What to do with the tag catalog when a batch commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CatalogUpdate {
    #[default]
    None,
    AddMissing,
    Rebuild,
}

/// A set of cache mutations committed together.
#[derive(Debug, Default)]
pub struct CacheBatch {
    pub clear_records: bool,
    pub upserts: Vec<FolderRecord>,
    /// Keep the cached rating when an upserted record has none.
    pub preserve_rating: bool,
    /// Folder paths whose row and override are deleted.
    pub removals: Vec<String>,
    /// Folder paths whose override alone is deleted.
    pub stale_overrides: Vec<String>,
    pub catalog: CatalogUpdate,
}

pub struct IndexCache {
    conn: Mutex<Connection>,
    db_path: Option<PathBuf>,
}

impl IndexCache {
    /// Opens (or creates) the cache database at `db_path`.
    pub fn open(db_path: &Path) -> Result<Self, AppError> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(db_path)?;
        log::info!("Cache database opened at {}", db_path.display());
        Self::with_connection(conn, Some(db_path.to_path_buf()))
    }

    pub fn open_in_memory() -> Result<Self, AppError> {
        Self::with_connection(Connection::open_in_memory()?, None)
    }

    fn with_connection(conn: Connection, db_path: Option<PathBuf>) -> Result<Self, AppError> {
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            db_path,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Cached `path -> last activity` for every indexed folder.
    pub fn activity_map(&self) -> Result<HashMap<String, f64>, AppError> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT path, COALESCE(mtime, 0) FROM folder_index")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?)))?;

        let mut map = HashMap::new();
        for row in rows {
            let (path, mtime) = row?;
            map.insert(path, mtime);
        }
        Ok(map)
    }

    pub fn record_count(&self) -> Result<u64, AppError> {
        let count: i64 = self
            .lock()
            .query_row("SELECT COUNT(*) FROM folder_index", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub fn get_record(&self, path: &str) -> Result<Option<FolderRecord>, AppError> {
        let conn = self.lock();
        let record = conn
            .query_row(
                &format!("SELECT {} FROM folder_index WHERE path = ?1", RECORD_COLUMNS),
                params![path],
                record_from_row,
            )
            .optional()?;
        Ok(record)
    }

    pub fn get_override(&self, path: &str) -> Result<Option<String>, AppError> {
        let conn = self.lock();
        let target = conn
            .query_row(
                "SELECT thumbnail_path FROM preview_overrides WHERE path = ?1",
                params![path],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?;
        Ok(target.flatten())
    }

    pub fn overrides(&self) -> Result<HashMap<String, String>, AppError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT path, thumbnail_path FROM preview_overrides WHERE thumbnail_path IS NOT NULL",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;

        let mut map = HashMap::new();
        for row in rows {
            let (path, target) = row?;
            map.insert(path, target);
        }
        Ok(map)
    }

    /// Pins `target` as the preview of `path` and mirrors it into the folder row.
    pub fn set_override(&self, path: &str, target: &str) -> Result<(), AppError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO preview_overrides (path, thumbnail_path) VALUES (?1, ?2)
             ON CONFLICT(path) DO UPDATE SET thumbnail_path = excluded.thumbnail_path",
            params![path, target],
        )?;
        tx.execute(
            "UPDATE folder_index SET thumbnail_path = ?2 WHERE path = ?1",
            params![path, target],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Deletes every override pointing at `target`. Returns how many were removed.
    pub fn delete_overrides_targeting(&self, target: &str) -> Result<usize, AppError> {
        let removed = self.lock().execute(
            "DELETE FROM preview_overrides WHERE thumbnail_path = ?1",
            params![target],
        )?;
        Ok(removed)
    }

    /// Drops the row of a renamed folder and carries its override over to
    /// `new_path`, rewriting the pinned file's path prefix.
    pub fn move_folder(&self, old_path: &str, new_path: &str) -> Result<(), AppError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let target: Option<String> = tx
            .query_row(
                "SELECT thumbnail_path FROM preview_overrides WHERE path = ?1",
                params![old_path],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        tx.execute("DELETE FROM preview_overrides WHERE path = ?1", params![old_path])?;
        tx.execute("DELETE FROM folder_index WHERE path = ?1", params![old_path])?;

        if let Some(target) = target {
            let moved = match Path::new(&target).strip_prefix(old_path) {
                Ok(rest) => Path::new(new_path).join(rest).to_string_lossy().into_owned(),
                Err(_) => target,
            };
            tx.execute(
                "INSERT OR REPLACE INTO preview_overrides (path, thumbnail_path) VALUES (?1, ?2)",
                params![new_path, moved],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Replaces the cached tags of `path`. Returns false when the folder has no row.
    pub fn update_tags(&self, path: &str, tags: &[String]) -> Result<bool, AppError> {
        let tags_json = serde_json::to_string(tags)?;
        let changed = self.lock().execute(
            "UPDATE folder_index SET tags = ?2 WHERE path = ?1",
            params![path, tags_json],
        )?;
        Ok(changed > 0)
    }

    pub fn update_rating(
        &self,
        path: &str,
        rating: u8,
        modified_at: Option<&str>,
    ) -> Result<bool, AppError> {
        let changed = self.lock().execute(
            "UPDATE folder_index SET rating = ?2, modified_at = COALESCE(?3, modified_at)
             WHERE path = ?1",
            params![path, rating, modified_at],
        )?;
        Ok(changed > 0)
    }

    /// Commits `batch` in one transaction.
    ///
    /// A row that fails to upsert is logged and reported back by path; it does
    /// not abort the rest of the batch. Failing to commit is an error.
    pub fn apply(&self, batch: &CacheBatch) -> Result<Vec<String>, AppError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        if batch.clear_records {
            tx.execute("DELETE FROM folder_index", [])?;
        }

        let mut failed = Vec::new();
        for record in &batch.upserts {
            if let Err(e) = upsert_row(&tx, record, batch.preserve_rating) {
                log::warn!("Failed to cache folder {}: {}", record.path, e);
                failed.push(record.path.clone());
            }
        }

        for path in &batch.removals {
            tx.execute("DELETE FROM folder_index WHERE path = ?1", params![path])?;
            tx.execute("DELETE FROM preview_overrides WHERE path = ?1", params![path])?;
        }
        for path in &batch.stale_overrides {
            tx.execute("DELETE FROM preview_overrides WHERE path = ?1", params![path])?;
        }

        match batch.catalog {
            CatalogUpdate::None => {}
            CatalogUpdate::AddMissing => {
                add_missing_catalog_tags(&tx)?;
            }
            CatalogUpdate::Rebuild => {
                rebuild_catalog(&tx)?;
            }
        }

        tx.commit()?;
        Ok(failed)
    }

    /// Clears the catalog and refills it from every cached folder's tags.
    pub fn rebuild_tag_catalog(&self) -> Result<usize, AppError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let inserted = rebuild_catalog(&tx)?;
        tx.commit()?;
        Ok(inserted)
    }

    /// Inserts cached folder tags the catalog does not know yet.
    pub fn add_missing_tags_to_catalog(&self) -> Result<usize, AppError> {
        let conn = self.lock();
        add_missing_catalog_tags(&conn)
    }

    pub fn add_catalog_tags(&self, tags: &[String]) -> Result<usize, AppError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let mut inserted = 0;
        for tag in tags {
            inserted += tx.execute(
                "INSERT OR IGNORE INTO tag_catalog (name) VALUES (?1)",
                params![tag],
            )?;
        }
        tx.commit()?;
        Ok(inserted)
    }

    pub fn list_tags(&self) -> Result<Vec<String>, AppError> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT name FROM tag_catalog ORDER BY name COLLATE NOCASE")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut tags = Vec::new();
        for tag in rows {
            tags.push(tag?);
        }
        Ok(tags)
    }

    pub fn query(&self, request: &FolderQuery) -> Result<FolderPage, AppError> {
        let conn = self.lock();
        query::run(&conn, request)
    }
}

impl std::fmt::Debug for IndexCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexCache")
            .field("db_path", &self.db_path)
            .finish()
    }
}

fn init_schema(conn: &Connection) -> Result<(), AppError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS folder_index (
            path            TEXT PRIMARY KEY,
            name            TEXT NOT NULL,
            rel             TEXT NOT NULL,
            mtime           REAL,
            images          INTEGER DEFAULT 0,
            gifs            INTEGER DEFAULT 0,
            videos          INTEGER DEFAULT 0,
            archives        INTEGER DEFAULT 0,
            stls            INTEGER DEFAULT 0,
            tags            TEXT,
            rating          INTEGER,
            thumbnail_path  TEXT,
            created_at      TEXT,
            modified_at     TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_folder_index_name ON folder_index(name);
        CREATE INDEX IF NOT EXISTS idx_folder_index_mtime ON folder_index(mtime);
        CREATE INDEX IF NOT EXISTS idx_folder_index_rating ON folder_index(rating);
        CREATE TABLE IF NOT EXISTS tag_catalog (
            name            TEXT PRIMARY KEY
        );
        CREATE TABLE IF NOT EXISTS preview_overrides (
            path            TEXT PRIMARY KEY,
            thumbnail_path  TEXT
        );",
    )?;

    // Caches created before created/modified tracking lack these columns.
    for column in ["created_at", "modified_at"] {
        match conn.execute(
            &format!("ALTER TABLE folder_index ADD COLUMN {} TEXT", column),
            [],
        ) {
            Ok(_) => log::info!("Added column {} to folder_index", column),
            Err(rusqlite::Error::SqliteFailure(_, Some(msg)))
                if msg.contains("duplicate column name") => {}
            Err(e) => return Err(e.into()),
        }
    }

    log::debug!("Cache schema initialized");
    Ok(())
}

pub(crate) fn record_columns() -> &'static str {
    RECORD_COLUMNS
}

pub(crate) fn record_from_row(row: &Row<'_>) -> rusqlite::Result<FolderRecord> {
    let tags_json: Option<String> = row.get(9)?;
    let tags = tags_json
        .and_then(|json| serde_json::from_str::<Vec<String>>(&json).ok())
        .unwrap_or_default();

    Ok(FolderRecord {
        path: row.get(0)?,
        name: row.get(1)?,
        relative_path: row.get(2)?,
        last_activity: row.get::<_, Option<f64>>(3)?.unwrap_or(0.0),
        counts: MediaCounts {
            images: row.get::<_, Option<u32>>(4)?.unwrap_or(0),
            animated_images: row.get::<_, Option<u32>>(5)?.unwrap_or(0),
            videos: row.get::<_, Option<u32>>(6)?.unwrap_or(0),
            archives: row.get::<_, Option<u32>>(7)?.unwrap_or(0),
            model_files: row.get::<_, Option<u32>>(8)?.unwrap_or(0),
        },
        tags,
        rating: row.get(10)?,
        preview_path: row.get(11)?,
        created_at: row.get(12)?,
        modified_at: row.get(13)?,
    })
}

fn upsert_row(conn: &Connection, record: &FolderRecord, preserve_rating: bool) -> Result<(), AppError> {
    let rating_update = if preserve_rating {
        "COALESCE(excluded.rating, folder_index.rating)"
    } else {
        "excluded.rating"
    };
    let sql = format!(
        "INSERT INTO folder_index ({})
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
         ON CONFLICT(path) DO UPDATE SET
            name = excluded.name,
            rel = excluded.rel,
            mtime = excluded.mtime,
            images = excluded.images,
            gifs = excluded.gifs,
            videos = excluded.videos,
            archives = excluded.archives,
            stls = excluded.stls,
            tags = excluded.tags,
            rating = {},
            thumbnail_path = excluded.thumbnail_path,
            created_at = excluded.created_at,
            modified_at = excluded.modified_at",
        RECORD_COLUMNS, rating_update
    );

    conn.execute(
        &sql,
        params![
            record.path,
            record.name,
            record.relative_path,
            record.last_activity,
            record.counts.images,
            record.counts.animated_images,
            record.counts.videos,
            record.counts.archives,
            record.counts.model_files,
            serde_json::to_string(&record.tags)?,
            record.rating,
            record.preview_path,
            record.created_at,
            record.modified_at,
        ],
    )?;
    Ok(())
}

const CATALOG_FROM_FOLDERS: &str = "INSERT OR IGNORE INTO tag_catalog (name)
     SELECT DISTINCT tag.value
     FROM folder_index, json_each(folder_index.tags) AS tag
     WHERE folder_index.tags IS NOT NULL
       AND tag.type = 'text' AND TRIM(tag.value) <> ''";

fn add_missing_catalog_tags(conn: &Connection) -> Result<usize, AppError> {
    Ok(conn.execute(CATALOG_FROM_FOLDERS, [])?)
}

fn rebuild_catalog(conn: &Connection) -> Result<usize, AppError> {
    conn.execute("DELETE FROM tag_catalog", [])?;
    Ok(conn.execute(CATALOG_FROM_FOLDERS, [])?)
}
