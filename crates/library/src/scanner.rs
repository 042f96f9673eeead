use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use metadata::{MetadataError, TagReader};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::catalog::{Catalog, LAST_SCAN_TIME_KEY};
use crate::cleanup::{run_cleanup, CleanupReport};
use crate::config::ScanConfig;
use crate::walk::Walk;
use crate::LibraryError;

#[derive(Debug)]
pub enum ScanError {
    /// Another scan holds the scanner.
    AlreadyScanning,
    Stat {
        path: PathBuf,
        source: io::Error,
    },
    TagRead {
        path: PathBuf,
        source: MetadataError,
    },
    /// The library root could not be traversed.
    Walk {
        path: PathBuf,
        source: io::Error,
    },
    Cleanup {
        pass: &'static str,
        source: LibraryError,
    },
    Catalog(LibraryError),
}

impl std::fmt::Display for ScanError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanError::AlreadyScanning => write!(f, "already scanning"),
            ScanError::Stat { path, source } => write!(f, "stat {:?}: {}", path, source),
            ScanError::TagRead { path, source } => {
                write!(f, "failed to read tags for {:?}: {}", path, source)
            }
            ScanError::Walk { path, source } => write!(f, "walk {:?}: {}", path, source),
            ScanError::Cleanup { pass, source } => {
                write!(f, "cleanup of {} failed: {}", pass, source)
            }
            ScanError::Catalog(err) => write!(f, "catalog error: {}", err),
        }
    }
}

impl std::error::Error for ScanError {}

impl From<LibraryError> for ScanError {
    fn from(err: LibraryError) -> Self {
        ScanError::Catalog(err)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanOptions {
    /// Re-read every file even when the catalog row is newer.
    pub full_rescan: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanSummary {
    pub new_tracks: usize,
    pub seen_tracks: usize,
    pub seen_folders: usize,
    pub errors: usize,
    pub cleaned: CleanupReport,
    pub elapsed: Duration,
}

/// Keeps one library in sync with its catalog. Clones share the running flag,
/// so at most one scan runs across all of them.
#[derive(Clone)]
pub struct Scanner {
    root: PathBuf,
    catalog: Catalog,
    tags: Arc<dyn TagReader>,
    config: ScanConfig,
    running: Arc<AtomicBool>,
    last: Arc<RwLock<Option<ScanSummary>>>,
}

impl Scanner {
    pub fn new(
        root: PathBuf,
        catalog: Catalog,
        tags: Arc<dyn TagReader>,
        config: ScanConfig,
    ) -> Self {
        Self {
            root,
            catalog,
            tags,
            config,
            running: Arc::new(AtomicBool::new(false)),
            last: Arc::new(RwLock::new(None)),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Walks the library, then removes catalog rows nothing on disk backs any
    /// more. Fails right away with [`ScanError::AlreadyScanning`] when a scan
    /// is in progress, and with [`ScanError::Walk`] when the root cannot be
    /// read; every other error is counted in the summary.
    pub fn start(&self, options: ScanOptions) -> Result<ScanSummary, ScanError> {
        let _guard = ScanGuard::acquire(&self.running).ok_or(ScanError::AlreadyScanning)?;
        let started = Instant::now();
        info!(
            "Scan started: {:?} (full rescan: {})",
            self.root, options.full_rescan
        );

        let walk = Walk::new(
            &self.root,
            &self.catalog,
            self.tags.as_ref(),
            options.full_rescan,
        );
        let outcome = match walk.run() {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!("Scan failed: {}", err);
                return Err(err);
            }
        };
        info!(
            "Walk finished in {:?}: {} new tracks, {} tracks seen, {} errors",
            truncate_elapsed(started.elapsed()),
            outcome.new_tracks,
            outcome.seen_tracks.len(),
            outcome.errors
        );

        let cleaned = run_cleanup(
            &self.catalog,
            &outcome.seen_tracks,
            &outcome.seen_folders,
            self.config.delete_chunk_size(),
        );

        let finished_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|value| value.as_secs())
            .unwrap_or(0);
        if let Err(err) = self
            .catalog
            .set_setting(LAST_SCAN_TIME_KEY, &finished_at.to_string())
        {
            warn!("Failed to record scan time: {}", err);
        }

        let summary = ScanSummary {
            new_tracks: outcome.new_tracks,
            seen_tracks: outcome.seen_tracks.len(),
            seen_folders: outcome.seen_folders.len(),
            errors: outcome.errors,
            cleaned,
            elapsed: truncate_elapsed(started.elapsed()),
        };
        info!(
            "Scan finished in {:?}: {} new tracks, {} removed",
            summary.elapsed,
            summary.new_tracks,
            summary.cleaned.total()
        );
        *self.last.write() = Some(summary.clone());
        Ok(summary)
    }

    pub fn is_scanning(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn last_summary(&self) -> Option<ScanSummary> {
        self.last.read().clone()
    }

    /// Unix seconds at which the last scan completed, if any scan ever did.
    pub fn last_scan_time(&self) -> Result<Option<u64>, LibraryError> {
        let value = self.catalog.setting(LAST_SCAN_TIME_KEY)?;
        Ok(value.and_then(|text| text.parse().ok()))
    }
}

struct ScanGuard<'a> {
    running: &'a AtomicBool,
}

impl<'a> ScanGuard<'a> {
    fn acquire(running: &'a AtomicBool) -> Option<Self> {
        running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { running })
    }
}

impl Drop for ScanGuard<'_> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

pub(crate) fn truncate_elapsed(elapsed: Duration) -> Duration {
    let micros = elapsed.as_micros().min(u128::from(u64::MAX)) as u64;
    Duration::from_micros(micros - micros % 10)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeTagReader, Fixture};
    use std::thread;

    const SONG: &str = "ArtistA/AlbumX/01 - Song.mp3";

    fn full() -> ScanOptions {
        ScanOptions { full_rescan: true }
    }

    fn quick() -> ScanOptions {
        ScanOptions { full_rescan: false }
    }

    fn scenario_library(fx: &Fixture) {
        fx.write(SONG, "title=Song\nartist=ArtistA\nalbum=AlbumX\n");
        fx.write("ArtistA/AlbumX/cover.jpg", "not audio");
    }

    #[test]
    fn fresh_scan_catalogs_album() {
        let fx = Fixture::new();
        scenario_library(&fx);

        let summary = fx.scanner.start(full()).unwrap();
        assert_eq!(summary.new_tracks, 1);
        assert_eq!(summary.errors, 0);
        assert_eq!(summary.cleaned, CleanupReport::default());

        let album_stamp = fx.catalog.find_folder("ArtistA", "AlbumX").unwrap().unwrap();
        let album = fx.catalog.get_folder(album_stamp.id).unwrap().unwrap();
        assert_eq!(album.cover.as_deref(), Some("cover.jpg"));
        assert_eq!(album.tag_title.as_deref(), Some("AlbumX"));

        let artist = fx.catalog.find_artist("ArtistA").unwrap().unwrap();
        let genre = fx.catalog.find_genre(common::UNKNOWN_GENRE).unwrap().unwrap();
        assert_eq!(album.tag_artist_id, Some(artist.id));
        assert_eq!(album.tag_genre_id, Some(genre.id));

        let tracks = fx.catalog.tracks().unwrap();
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].folder_id, album.id);
        assert_eq!(tracks[0].artist_id, artist.id);
        assert_eq!(tracks[0].genre_id, genre.id);
        assert_eq!(tracks[0].title.as_deref(), Some("Song"));
        assert_eq!(fx.catalog.get_track(tracks[0].id).unwrap().as_ref(), Some(&tracks[0]));

        let genres: Vec<_> = fx.catalog.genres().unwrap().into_iter().map(|g| g.name).collect();
        assert_eq!(genres, vec![common::UNKNOWN_GENRE.to_string()]);
        let mut folders: Vec<_> = fx
            .catalog
            .folders()
            .unwrap()
            .into_iter()
            .map(|folder| folder.relpath())
            .collect();
        folders.sort();
        assert_eq!(folders, vec![".", "ArtistA", "ArtistA/AlbumX"]);

        let stats = fx.catalog.stats().unwrap();
        assert_eq!(stats.tracks, 1);
        assert_eq!(stats.artists, 1);
        assert_eq!(stats.genres, 1);
        // root, artist directory and album directory
        assert_eq!(stats.folders, 3);
    }

    #[test]
    fn folders_link_to_their_parents() {
        let fx = Fixture::new();
        scenario_library(&fx);
        fx.scanner.start(full()).unwrap();

        let root = fx.catalog.find_folder("", ".").unwrap().unwrap();
        let artist = fx.catalog.find_folder("", "ArtistA").unwrap().unwrap();
        let album = fx.catalog.find_folder("ArtistA", "AlbumX").unwrap().unwrap();
        let root_row = fx.catalog.get_folder(root.id).unwrap().unwrap();
        let artist_row = fx.catalog.get_folder(artist.id).unwrap().unwrap();
        let album_row = fx.catalog.get_folder(album.id).unwrap().unwrap();
        assert_eq!(root_row.parent_id, None);
        assert_eq!(artist_row.parent_id, Some(root.id));
        assert_eq!(album_row.parent_id, Some(artist.id));
        assert_eq!(artist_row.tag_artist_id, None);
    }

    #[test]
    fn deleted_song_is_cleaned_up() {
        let fx = Fixture::new();
        scenario_library(&fx);
        fx.scanner.start(full()).unwrap();

        fx.remove(SONG);
        fx.touch("ArtistA/AlbumX", 60);
        let summary = fx.scanner.start(quick()).unwrap();

        assert_eq!(summary.new_tracks, 0);
        assert_eq!(summary.cleaned.tracks, 1);
        assert_eq!(summary.cleaned.artists, 1);
        assert_eq!(summary.cleaned.genres, 1);
        // album, artist directory and root all lost their content
        assert_eq!(summary.cleaned.folders, 3);
        assert!(fx.catalog.find_folder("ArtistA", "AlbumX").unwrap().is_none());
        assert!(fx.catalog.find_artist("ArtistA").unwrap().is_none());
        assert_eq!(fx.catalog.stats().unwrap(), crate::CatalogStats::default());
    }

    #[test]
    fn second_scan_without_changes_is_a_no_op() {
        let fx = Fixture::new();
        scenario_library(&fx);
        fx.write("ArtistB/Album/01.flac", "artist=ArtistB\ngenre=Jazz\n");
        fx.scanner.start(quick()).unwrap();
        let before = fx.catalog.stats().unwrap();
        let reads = fx.tags.calls();

        for path in ["", "ArtistA", "ArtistA/AlbumX", SONG, "ArtistB", "ArtistB/Album"] {
            fx.touch(path, -60);
        }
        fx.touch("ArtistB/Album/01.flac", -60);
        let summary = fx.scanner.start(quick()).unwrap();

        assert_eq!(summary.new_tracks, 0);
        assert_eq!(summary.cleaned.total(), 0);
        assert_eq!(summary.seen_tracks, 2);
        assert_eq!(fx.tags.calls(), reads);
        assert_eq!(fx.catalog.stats().unwrap(), before);
    }

    #[test]
    fn changed_file_is_reread_and_full_rescan_rereads_everything() {
        let fx = Fixture::new();
        fx.write("Album/a.mp3", "title=A\n");
        fx.write("Album/b.mp3", "title=B\n");
        fx.scanner.start(quick()).unwrap();
        assert_eq!(fx.tags.calls(), 2);

        fx.touch("Album/a.mp3", -60);
        fx.write("Album/b.mp3", "title=B2\n");
        fx.touch("Album/b.mp3", 60);
        let summary = fx.scanner.start(quick()).unwrap();
        assert_eq!(fx.tags.calls(), 3);
        assert_eq!(summary.new_tracks, 1);

        let titles: Vec<_> = fx
            .catalog
            .tracks()
            .unwrap()
            .into_iter()
            .filter_map(|track| track.title)
            .collect();
        assert!(titles.contains(&"B2".to_string()));
        assert_eq!(fx.catalog.stats().unwrap().tracks, 2);

        fx.touch("Album/a.mp3", -60);
        fx.touch("Album/b.mp3", -60);
        fx.scanner.start(full()).unwrap();
        assert_eq!(fx.tags.calls(), 5);
        assert_eq!(fx.catalog.stats().unwrap().tracks, 2);
    }

    #[test]
    fn shared_artist_is_stored_once() {
        let fx = Fixture::new();
        fx.write("One/a.mp3", "artist=Björk\n");
        fx.write("One/b.mp3", "artist=Björk\n");
        fx.write("Two/c.ogg", "album_artist=Björk\nartist=Guest\n");
        fx.write("Three/d.mp3", "");
        fx.scanner.start(full()).unwrap();

        let bjork = fx.catalog.find_artist("Björk").unwrap().unwrap();
        assert_eq!(bjork.name_ascii.as_deref(), Some("Bjork"));
        let unknown = fx.catalog.find_artist(common::UNKNOWN_ARTIST).unwrap().unwrap();
        assert_eq!(fx.catalog.artists().unwrap().len(), 2);

        let tracks = fx.catalog.tracks().unwrap();
        assert_eq!(tracks.len(), 4);
        for track in &tracks {
            if track.filename == "d.mp3" {
                assert_eq!(track.artist_id, unknown.id);
            } else {
                assert_eq!(track.artist_id, bjork.id);
            }
        }
        let guest = tracks.iter().find(|track| track.filename == "c.ogg").unwrap();
        assert_eq!(guest.track_artist.as_deref(), Some("Guest"));
    }

    #[test]
    fn empty_directories_are_not_cataloged() {
        let fx = Fixture::new();
        fx.mkdir("Outer/Inner");
        fx.write("Outer/notes.txt", "hello");
        fx.write("Album/01.mp3", "title=One\n");
        fx.scanner.start(full()).unwrap();

        assert!(fx.catalog.find_folder("", "Outer").unwrap().is_none());
        assert!(fx.catalog.find_folder("Outer", "Inner").unwrap().is_none());
        assert!(fx.catalog.find_folder("", "Album").unwrap().is_some());
        assert_eq!(fx.catalog.stats().unwrap().folders, 2);
    }

    #[test]
    fn cover_sticks_to_its_own_directory() {
        let fx = Fixture::new();
        fx.write("Box/Front.JPG", "image");
        fx.write("Box/CD1/01.mp3", "title=One\n");
        fx.write("Box/CD2/01.mp3", "title=Two\n");
        fx.scanner.start(full()).unwrap();

        let cover_of = |directory: &str, name: &str| {
            let stamp = fx.catalog.find_folder(directory, name).unwrap().unwrap();
            fx.catalog.get_folder(stamp.id).unwrap().unwrap().cover
        };
        assert_eq!(cover_of("", "Box").as_deref(), Some("Front.JPG"));
        assert_eq!(cover_of("Box", "CD1"), None);
        assert_eq!(cover_of("Box", "CD2"), None);
    }

    #[test]
    fn unreadable_tags_are_counted_and_skipped() {
        let fx = Fixture::new();
        fx.write("Album/good.mp3", "title=Good\n");
        fx.write("Album/bad.mp3", "corrupt\n");
        let summary = fx.scanner.start(full()).unwrap();

        assert_eq!(summary.errors, 1);
        assert_eq!(summary.new_tracks, 1);
        let tracks = fx.catalog.tracks().unwrap();
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].filename, "good.mp3");
    }

    #[test]
    fn known_track_survives_a_failed_reread() {
        let fx = Fixture::new();
        fx.write("Album/song.mp3", "title=Song\n");
        fx.scanner.start(full()).unwrap();

        fx.write("Album/song.mp3", "corrupt\n");
        let summary = fx.scanner.start(full()).unwrap();
        assert_eq!(summary.errors, 1);
        assert_eq!(summary.cleaned.tracks, 0);
        let tracks = fx.catalog.tracks().unwrap();
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].title.as_deref(), Some("Song"));
    }

    #[test]
    fn missing_root_fails_the_scan() {
        let fx = Fixture::new();
        std::fs::remove_dir_all(&fx.root).unwrap();
        let err = fx.scanner.start(full()).unwrap_err();
        assert!(matches!(err, ScanError::Walk { .. }));
        assert!(!fx.scanner.is_scanning());
        assert!(fx.scanner.last_summary().is_none());
        assert_eq!(fx.scanner.last_scan_time().unwrap(), None);
    }

    #[test]
    fn completed_scan_is_recorded() {
        let fx = Fixture::new();
        scenario_library(&fx);
        let summary = fx.scanner.start(full()).unwrap();
        assert_eq!(fx.scanner.last_summary(), Some(summary));
        let recorded = fx.scanner.last_scan_time().unwrap().unwrap();
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs();
        assert!(recorded <= now && now - recorded < 60);
    }

    #[test]
    fn concurrent_start_is_rejected() {
        let (reader, entered, release) = FakeTagReader::gated();
        let fx = Fixture::with_reader(reader);
        scenario_library(&fx);

        let scanner = fx.scanner.clone();
        let first = thread::spawn(move || scanner.start(full()).map_err(|err| err.to_string()));
        entered.recv().unwrap();

        assert!(fx.scanner.is_scanning());
        let second = fx.scanner.start(full());
        assert!(matches!(second, Err(ScanError::AlreadyScanning)));
        assert!(fx.scanner.is_scanning());

        release.send(()).unwrap();
        let summary = first.join().unwrap().unwrap();
        assert_eq!(summary.new_tracks, 1);
        assert!(!fx.scanner.is_scanning());
        assert_eq!(fx.catalog.stats().unwrap().tracks, 1);
    }

    #[cfg(unix)]
    #[test]
    fn broken_entries_are_counted_and_siblings_kept() {
        use std::os::unix::fs::symlink;

        let fx = Fixture::new();
        fx.write("Album/01.mp3", "title=One\n");
        fx.write("Other/02.mp3", "title=Two\n");
        symlink(fx.root.join("missing"), fx.root.join("Album/dangling")).unwrap();
        symlink(fx.root.join("Other"), fx.root.join("Other/again")).unwrap();

        let summary = fx.scanner.start(full()).unwrap();
        assert_eq!(summary.errors, 2);
        assert_eq!(summary.new_tracks, 2);
        assert_eq!(fx.catalog.stats().unwrap().tracks, 2);
        assert!(fx.catalog.find_folder("", "Album").unwrap().is_some());
        assert!(fx.catalog.find_folder("Other", "again").unwrap().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_directories_are_followed() {
        use std::os::unix::fs::symlink;

        let fx = Fixture::new();
        let outside = fx.root.parent().unwrap().join("elsewhere").join("Album");
        std::fs::create_dir_all(&outside).unwrap();
        std::fs::write(outside.join("01.mp3"), "title=Linked\n").unwrap();
        fx.mkdir("Links");
        symlink(&outside, fx.root.join("Links/Album")).unwrap();

        let summary = fx.scanner.start(quick()).unwrap();
        assert_eq!(summary.new_tracks, 1);
        assert_eq!(summary.errors, 0);
        let album = fx.catalog.find_folder("Links", "Album").unwrap().unwrap();
        let tracks = fx.catalog.tracks().unwrap();
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].folder_id, album.id);
        assert_eq!(tracks[0].title.as_deref(), Some("Linked"));

        let again = fx.scanner.start(quick()).unwrap();
        assert_eq!(again.seen_tracks, 1);
        assert_eq!(again.cleaned.total(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn non_utf8_file_names_are_cataloged() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let fx = Fixture::new();
        let album = fx.mkdir("Album");
        std::fs::write(album.join(OsStr::from_bytes(b"bad\xff.mp3")), "title=Bad\n").unwrap();

        let summary = fx.scanner.start(full()).unwrap();
        assert_eq!(summary.errors, 0);
        let tracks = fx.catalog.tracks().unwrap();
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].filename, "bad\u{FFFD}.mp3");
    }

    #[test]
    fn elapsed_is_truncated_to_ten_microseconds() {
        assert_eq!(
            truncate_elapsed(Duration::from_nanos(1_234_567)),
            Duration::from_micros(1_230)
        );
    }
}
