use std::collections::HashSet;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::catalog::Catalog;
use crate::scanner::{truncate_elapsed, ScanError};
use crate::LibraryError;

/// Rows removed by the post-walk cleanup, per entity kind.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub tracks: usize,
    pub folders: usize,
    pub artists: usize,
    pub genres: usize,
    /// Passes that failed and removed nothing.
    pub failed: Vec<String>,
}

impl CleanupReport {
    pub fn total(&self) -> usize {
        self.tracks + self.folders + self.artists + self.genres
    }
}

/// Runs the tracks, folders, artists and genres passes in that order. A
/// failing pass is logged and recorded without stopping the others.
pub(crate) fn run_cleanup(
    catalog: &Catalog,
    seen_tracks: &HashSet<u64>,
    seen_folders: &HashSet<u64>,
    chunk_size: usize,
) -> CleanupReport {
    let mut failed = Vec::new();

    let tracks = run_pass("tracks", &mut failed, || {
        let orphans = unseen(catalog.track_ids()?, seen_tracks);
        catalog.delete_tracks(&orphans, chunk_size)
    });
    let folders = run_pass("folders", &mut failed, || {
        let orphans = unseen(catalog.folder_ids()?, seen_folders);
        catalog.delete_folders(&orphans, chunk_size)
    });
    let artists = run_pass("artists", &mut failed, || {
        catalog.delete_unreferenced_artists()
    });
    let genres = run_pass("genres", &mut failed, || catalog.delete_unreferenced_genres());

    CleanupReport {
        tracks,
        folders,
        artists,
        genres,
        failed,
    }
}

fn run_pass<F>(pass: &'static str, failed: &mut Vec<String>, op: F) -> usize
where
    F: FnOnce() -> Result<usize, LibraryError>,
{
    let started = Instant::now();
    match op() {
        Ok(removed) => {
            info!(
                "Cleanup {}: removed {} in {:?}",
                pass,
                removed,
                truncate_elapsed(started.elapsed())
            );
            removed
        }
        Err(source) => {
            warn!("{}", ScanError::Cleanup { pass, source });
            failed.push(pass.to_string());
            0
        }
    }
}

fn unseen(ids: Vec<u64>, seen: &HashSet<u64>) -> Vec<u64> {
    ids.into_iter().filter(|id| !seen.contains(id)).collect()
}
