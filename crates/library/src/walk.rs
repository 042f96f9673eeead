use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use common::{ascii_fold, relpath_from, split_relpath, unix_nanos, Folder, Track};
use common::{UNKNOWN_ARTIST, UNKNOWN_GENRE};
use metadata::{audio_mime, TagReader};
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

use crate::catalog::{Catalog, TrackBatch};
use crate::scanner::ScanError;
use crate::stack::{FolderFrame, FolderStack};

const COVERS: &[&str] = &[
    "cover.png",
    "cover.jpg",
    "cover.jpeg",
    "folder.png",
    "folder.jpg",
    "folder.jpeg",
    "album.png",
    "album.jpg",
    "album.jpeg",
    "front.png",
    "front.jpg",
    "front.jpeg",
];

/// A filesystem entry resolved against the library root.
#[derive(Debug)]
pub(crate) struct Item {
    pub full_path: PathBuf,
    pub directory: String,
    pub filename: String,
    pub modified: u64,
    pub size: u64,
}

impl Item {
    fn resolve(root: &Path, entry: &DirEntry) -> Result<Self, ScanError> {
        let path = entry.path();
        let stat_error = |source: io::Error| ScanError::Stat {
            path: path.to_path_buf(),
            source,
        };
        if is_lossy(path) {
            warn!("Path {:?} is not valid UTF-8; its catalog key is lossy", path);
        }
        let metadata = entry.metadata().map_err(|err| stat_error(err.into()))?;
        let modified = metadata.modified().map_err(stat_error)?;
        let relpath = relpath_from(root, path)
            .ok_or_else(|| stat_error(io::Error::other("entry is outside the library root")))?;
        let (directory, filename) = split_relpath(&relpath);
        Ok(Self {
            full_path: path.to_path_buf(),
            directory,
            filename,
            modified: unix_nanos(modified),
            size: metadata.len(),
        })
    }
}

/// Decides whether an item may be skipped because the catalog row is newer
/// than the file.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ChangeDetector {
    full_rescan: bool,
}

impl ChangeDetector {
    pub fn new(full_rescan: bool) -> Self {
        Self { full_rescan }
    }

    pub fn unchanged(&self, modified: u64, updated_at: u64) -> bool {
        !self.full_rescan && modified < updated_at
    }
}

// Non UTF-8 names collapse onto U+FFFD when converted to catalog keys.
fn is_lossy(path: &Path) -> bool {
    path.to_str().is_none()
}

pub(crate) fn is_cover(filename: &str) -> bool {
    let lower = filename.to_lowercase();
    COVERS.contains(&lower.as_str())
}

pub(crate) fn is_audio(filename: &str) -> bool {
    Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .and_then(audio_mime)
        .is_some()
}

/// What a finished walk hands to the cleanup passes.
#[derive(Debug, Default)]
pub(crate) struct WalkOutcome {
    pub seen_tracks: HashSet<u64>,
    pub seen_folders: HashSet<u64>,
    pub new_tracks: usize,
    pub errors: usize,
}

/// State of one depth-first walk over the library. A fresh value is built for
/// every scan.
pub(crate) struct Walk<'a> {
    root: &'a Path,
    catalog: &'a Catalog,
    tags: &'a dyn TagReader,
    detector: ChangeDetector,
    stack: FolderStack,
    batch: Option<TrackBatch>,
    pending_new: usize,
    outcome: WalkOutcome,
}

impl<'a> Walk<'a> {
    pub fn new(
        root: &'a Path,
        catalog: &'a Catalog,
        tags: &'a dyn TagReader,
        full_rescan: bool,
    ) -> Self {
        Self {
            root,
            catalog,
            tags,
            detector: ChangeDetector::new(full_rescan),
            stack: FolderStack::default(),
            batch: None,
            pending_new: 0,
            outcome: WalkOutcome::default(),
        }
    }

    /// Walks the whole tree. Only a failure to read the root itself is
    /// returned; everything below it is logged, counted and skipped.
    pub fn run(mut self) -> Result<WalkOutcome, ScanError> {
        let root_error = |source: io::Error| ScanError::Walk {
            path: self.root.to_path_buf(),
            source,
        };
        let metadata = fs::metadata(self.root).map_err(root_error)?;
        if !metadata.is_dir() {
            return Err(root_error(io::Error::other("library root is not a directory")));
        }

        let mut entries = WalkDir::new(self.root).follow_links(true).into_iter();
        while let Some(next) = entries.next() {
            let entry = match next {
                Ok(entry) => entry,
                Err(err) => {
                    let path = err
                        .path()
                        .map(Path::to_path_buf)
                        .unwrap_or_else(|| self.root.to_path_buf());
                    if err.depth() == 0 {
                        return Err(ScanError::Walk {
                            path,
                            source: err.into(),
                        });
                    }
                    self.record_error(ScanError::Stat {
                        path,
                        source: err.into(),
                    });
                    continue;
                }
            };

            // Leaving every directory that is not an ancestor of this entry
            // is the post-order visit of that directory.
            self.leave_to(entry.depth());

            if entry.file_type().is_dir() {
                if let Err(err) = self.enter_dir(&entry) {
                    self.record_error(err);
                    entries.skip_current_dir();
                }
            } else {
                self.visit_file(&entry);
            }
        }
        self.leave_to(0);
        self.commit_batch();
        Ok(self.outcome)
    }

    fn enter_dir(&mut self, entry: &DirEntry) -> Result<(), ScanError> {
        let item = Item::resolve(self.root, entry)?;
        self.commit_batch();
        let frame = self.handle_folder(item, entry.depth())?;
        self.outcome.seen_folders.insert(frame.folder.id);
        self.stack.push(frame);
        Ok(())
    }

    fn handle_folder(&mut self, item: Item, depth: usize) -> Result<FolderFrame, ScanError> {
        let existing = self.catalog.find_folder(&item.directory, &item.filename)?;
        let mut folder = match existing {
            Some(stamp) if self.detector.unchanged(item.modified, stamp.updated_at) => {
                let folder = Folder {
                    id: stamp.id,
                    directory: item.directory,
                    name: item.filename,
                    ..Folder::default()
                };
                return Ok(FolderFrame::new(folder, depth, false));
            }
            Some(stamp) => self.catalog.get_folder(stamp.id)?.unwrap_or_default(),
            None => Folder::default(),
        };

        folder.name_ascii = ascii_fold(&item.filename);
        folder.directory = item.directory;
        folder.name = item.filename;
        folder.modified_at = item.modified;
        folder.parent_id = self.stack.peek_id();
        self.catalog.save_folder(&mut folder)?;
        Ok(FolderFrame::new(folder, depth, true))
    }

    fn leave_to(&mut self, depth: usize) {
        while self.stack.peek().is_some_and(|frame| frame.depth >= depth) {
            self.leave_dir();
        }
    }

    fn leave_dir(&mut self) {
        self.commit_batch();
        let mut frame = match self.stack.pop() {
            Some(frame) => frame,
            None => return,
        };

        if frame.has_content {
            if let Some(parent) = self.stack.peek_mut() {
                parent.has_content = true;
            }
        } else {
            self.outcome.seen_folders.remove(&frame.folder.id);
        }
        if !frame.should_persist() {
            return;
        }

        frame.folder.parent_id = self.stack.peek_id();
        frame.folder.cover = frame.cover.take();
        match self.catalog.save_folder(&mut frame.folder) {
            Ok(id) => debug!("Saved folder {} ({:?})", id, frame.folder.relpath()),
            Err(err) => self.record_error(ScanError::Catalog(err)),
        }
    }

    fn visit_file(&mut self, entry: &DirEntry) {
        let name = entry.file_name().to_string_lossy();
        if is_cover(&name) {
            if let Some(frame) = self.stack.peek_mut() {
                frame.cover = Some(name.into_owned());
            }
            return;
        }
        if !is_audio(&name) || self.stack.is_empty() {
            return;
        }

        let item = match Item::resolve(self.root, entry) {
            Ok(item) => item,
            Err(err) => {
                self.record_error(err);
                return;
            }
        };
        if let Some(frame) = self.stack.peek_mut() {
            frame.has_content = true;
        }
        if let Err(err) = self.handle_track(item) {
            self.record_error(err);
        }
    }

    fn handle_track(&mut self, item: Item) -> Result<(), ScanError> {
        let folder_id = match self.stack.peek_id() {
            Some(id) => id,
            None => return Ok(()),
        };
        if self.batch.is_none() {
            self.batch = Some(self.catalog.begin_batch()?);
        }
        let batch = match self.batch.as_ref() {
            Some(batch) => batch,
            None => return Ok(()),
        };

        let existing = batch.find_track(folder_id, &item.filename)?;
        if let Some(stamp) = existing {
            self.outcome.seen_tracks.insert(stamp.id);
            if self.detector.unchanged(item.modified, stamp.updated_at) {
                return Ok(());
            }
        }

        let info = self.tags.read(&item.full_path).map_err(|source| ScanError::TagRead {
            path: item.full_path.clone(),
            source,
        })?;

        let artist_name = info
            .album_artist
            .as_deref()
            .or(info.artist.as_deref())
            .unwrap_or(UNKNOWN_ARTIST);
        let artist_id = batch.find_or_create_artist(artist_name)?;
        let genre_id = batch.find_or_create_genre(info.genre.as_deref().unwrap_or(UNKNOWN_GENRE))?;

        let mut track = Track {
            id: existing.map(|stamp| stamp.id).unwrap_or_default(),
            folder_id,
            filename_ascii: ascii_fold(&item.filename),
            filename: item.filename,
            size: item.size,
            artist_id,
            genre_id,
            title_ascii: info.title.as_deref().and_then(ascii_fold),
            title: info.title,
            track_artist: info.artist,
            track_no: info.track_no,
            disc_no: info.disc_no,
            mbid: info.track_mbid,
            duration_ms: info.duration_ms.unwrap_or_default(),
            bitrate: info.bitrate,
            updated_at: 0,
        };
        let track_id = batch.save_track(&mut track)?;
        self.outcome.seen_tracks.insert(track_id);
        self.pending_new += 1;

        if let Some(frame) = self.stack.peek_mut() {
            if frame.paths_resolved && !frame.tags_received {
                frame.folder.tag_title_ascii = info.album.as_deref().and_then(ascii_fold);
                frame.folder.tag_title = info.album;
                frame.folder.tag_album_mbid = info.album_mbid;
                frame.folder.tag_year = info.year;
                frame.folder.tag_artist_id = Some(artist_id);
                frame.folder.tag_genre_id = Some(genre_id);
                frame.tags_received = true;
            }
        }
        Ok(())
    }

    fn commit_batch(&mut self) {
        let batch = match self.batch.take() {
            Some(batch) => batch,
            None => return,
        };
        match batch.commit() {
            Ok(()) => self.outcome.new_tracks += self.pending_new,
            Err(err) => self.record_error(ScanError::Catalog(err)),
        }
        self.pending_new = 0;
    }

    fn record_error(&mut self, err: ScanError) {
        warn!("Scan error: {}", err);
        self.outcome.errors += 1;
    }
}
