mod cache;
mod classify;
mod config;
mod error;
mod folder_ops;
mod indexer;
mod models;
mod paths;
mod query;
mod reconcile;
mod sidecar;
mod tags;
mod walker;
mod web_server;

use crate::cache::IndexCache;
use crate::config::AppConfig;
use crate::indexer::Indexer;
use anyhow::Result;
use clap::{Parser, Subcommand};
use log::info;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "stl_indexer", about = "Indexes a collection of 3D-model project folders")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the JSON API (default)
    Serve,
    /// Synchronize the cache with the collection
    Reindex {
        /// Clear the cache and rebuild every record
        #[arg(long)]
        full: bool,
        /// Count media in subfolders too (full reindex only)
        #[arg(long)]
        recursive: bool,
    },
    /// Normalize sidecar tags for the root, one project folder or one sidecar file
    RepairTags {
        path: Option<PathBuf>,
    },
    /// Recompute the tag catalog
    RebuildTags {
        /// Only add tags missing from the catalog
        #[arg(long)]
        incremental: bool,
    },
}

fn build_indexer(config: Arc<AppConfig>) -> Result<Arc<Indexer>> {
    let cache = Arc::new(IndexCache::open(Path::new(&config.cache_db_path))?);
    info!(
        "Cache {:?} holds {} folders",
        cache.path().unwrap_or_else(|| Path::new(":memory:")),
        cache.record_count()?
    );
    Ok(Arc::new(Indexer::new(config, cache)?))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Arc::new(AppConfig::new()?);

    // Initialize env_logger based on config.log_level
    env_logger::Builder::new()
        .filter_level(config.log_level.parse().unwrap_or(log::LevelFilter::Info))
        .init();

    info!("Starting stl_indexer");
    let indexer = build_indexer(config.clone())?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            if let Err(e) = web_server::start_web_server(config, indexer).await {
                log::error!("Web server error: {}", e);
            }
        }
        Command::Reindex { full, recursive } => {
            if full {
                let stats =
                    tokio::task::spawn_blocking(move || indexer.full_reindex(recursive)).await??;
                println!("Indexed: {}  Failed: {}", stats.indexed, stats.failed);
            } else {
                if recursive {
                    log::warn!("--recursive only applies to a full reindex");
                }
                let stats = tokio::task::spawn_blocking(move || indexer.incremental_reindex()).await??;
                println!(
                    "Added: {}  Updated: {}  Removed: {}  Skipped: {}  Failed: {}",
                    stats.added, stats.updated, stats.removed, stats.skipped, stats.failed
                );
            }
        }
        Command::RepairTags { path } => {
            let stats = tokio::task::spawn_blocking(move || match path {
                Some(path) => indexer.repair_tags_at(&path),
                None => indexer.repair_all_tags(),
            })
            .await??;
            println!("Checked: {}", stats.checked);
            println!("Fixed: {}", stats.fixed);
            if stats.failed > 0 {
                println!("Failed: {}", stats.failed);
            }
        }
        Command::RebuildTags { incremental } => {
            let count = tokio::task::spawn_blocking(move || {
                if incremental {
                    indexer.add_missing_catalog_tags()
                } else {
                    indexer.rebuild_tag_catalog()
                }
            })
            .await??;
            println!("Tags: {}", count);
        }
    }

    info!("stl_indexer finished");
    Ok(())
}
