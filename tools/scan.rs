mod config;

use std::env;
use std::sync::Arc;

use library::{Catalog, ScanOptions, Scanner};
use metadata::LoftyTagReader;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::{config_path_from_env, load_or_create_config, resolve_music_root, resolve_path};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut options = ScanOptions::default();
    let mut json = false;
    for arg in env::args().skip(1) {
        match arg.as_str() {
            "--full" => options.full_rescan = true,
            "--json" => json = true,
            other => return Err(format!("unknown argument: {}", other).into()),
        }
    }

    let config_path = config_path_from_env();
    let (config, created) = load_or_create_config(&config_path)?;
    if created {
        info!("Wrote default config to {:?}", config_path);
    }
    let music_root = resolve_music_root(&config_path, &config.music_root)
        .ok_or("music_root is not set in the config")?;
    let index_path = resolve_path(&config_path, &config.index_path);

    let catalog = Catalog::open(&index_path)?;
    let scanner = Scanner::new(
        music_root,
        catalog,
        Arc::new(LoftyTagReader),
        config.scan.clone(),
    );
    let summary = scanner.start(options)?;
    let stats = scanner.catalog().stats()?;

    if json {
        let report = serde_json::json!({ "summary": summary, "catalog": stats });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "Scanned {:?}: {} new tracks, {} errors, removed {} tracks, {} folders, {} artists, {} genres",
            scanner.root(),
            summary.new_tracks,
            summary.errors,
            summary.cleaned.tracks,
            summary.cleaned.folders,
            summary.cleaned.artists,
            summary.cleaned.genres
        );
        println!(
            "Catalog: {} folders, {} tracks, {} artists, {} genres",
            stats.folders, stats.tracks, stats.artists, stats.genres
        );
    }

    Ok(())
}
