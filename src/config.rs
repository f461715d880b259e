use crate::classify::MediaExtensions;
use crate::error::AppError;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AppConfig {
    pub collection_root: Option<String>,
    pub cache_db_path: String,
    pub sidecar_file_name: String,
    pub media: MediaExtensions,
    pub num_workers: usize,
    pub web_port: u16,
    pub log_level: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            collection_root: None,
            cache_db_path: "data/cache.db".into(),
            sidecar_file_name: ".stl_collect.json".into(),
            media: MediaExtensions::default(),
            num_workers: 4,
            web_port: 8000,
            log_level: "info".into(),
        }
    }
}

impl AppConfig {
    pub fn new() -> Result<Self, ConfigError> {
        let env = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", env)).required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(Environment::with_prefix("STL_INDEXER").try_parsing(true))
            .set_override_option("collection_root", std::env::var("COLLECTION_ROOT").ok())?
            .set_override_option("cache_db_path", std::env::var("CACHE_DB_PATH").ok())?
            .build()?;

        s.try_deserialize()
    }

    /// Resolves the collection root, failing when it is unset, missing or not a directory.
    ///
    /// The returned path is canonical so every cache key derived from it is stable.
    pub fn collection_root(&self) -> Result<PathBuf, AppError> {
        let raw = self
            .collection_root
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| AppError::Configuration("COLLECTION_ROOT is not set".into()))?;

        let root = PathBuf::from(raw);
        if !root.is_dir() {
            return Err(AppError::Configuration(format!(
                "COLLECTION_ROOT {} does not exist or is not a directory",
                root.display()
            )));
        }
        Ok(root.canonicalize()?)
    }
}
