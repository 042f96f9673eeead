use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use metadata::{MetadataError, TagInfo, TagReader};
use parking_lot::Mutex;
use tempfile::TempDir;

use crate::{Catalog, ScanConfig, Scanner};

/// Tag reader over plain text files holding `key=value` lines. A file
/// containing the line `corrupt` fails to read.
#[derive(Default)]
pub struct FakeTagReader {
    calls: AtomicUsize,
    gate: Mutex<Option<Gate>>,
}

struct Gate {
    entered: Sender<()>,
    release: Receiver<()>,
}

impl FakeTagReader {
    /// A reader whose first call signals `entered` and then blocks until
    /// `release` receives a message.
    pub fn gated() -> (Self, Receiver<()>, Sender<()>) {
        let (entered_tx, entered_rx) = channel();
        let (release_tx, release_rx) = channel();
        let reader = Self {
            calls: AtomicUsize::new(0),
            gate: Mutex::new(Some(Gate {
                entered: entered_tx,
                release: release_rx,
            })),
        };
        (reader, entered_rx, release_tx)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl TagReader for FakeTagReader {
    fn read(&self, path: &Path) -> Result<TagInfo, MetadataError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.lock().take();
        if let Some(gate) = gate {
            let _ = gate.entered.send(());
            let _ = gate.release.recv();
        }

        let text = fs::read_to_string(path)?;
        let mut info = TagInfo::default();
        for line in text.lines() {
            let line = line.trim();
            if line == "corrupt" {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "corrupt tags").into());
            }
            let (key, value) = match line.split_once('=') {
                Some((key, value)) if !value.trim().is_empty() => (key.trim(), value.trim()),
                _ => continue,
            };
            let text = Some(value.to_string());
            match key {
                "title" => info.title = text,
                "artist" => info.artist = text,
                "album_artist" => info.album_artist = text,
                "album" => info.album = text,
                "genre" => info.genre = text,
                "track" => info.track_no = value.parse().ok(),
                "disc" => info.disc_no = value.parse().ok(),
                "year" => info.year = value.parse().ok(),
                "duration_ms" => info.duration_ms = value.parse().ok(),
                "track_mbid" => info.track_mbid = text,
                "album_mbid" => info.album_mbid = text,
                _ => {}
            }
        }
        Ok(info)
    }
}

pub fn temp_catalog() -> (Catalog, TempDir) {
    let dir = TempDir::new().unwrap();
    let catalog = Catalog::open(&dir.path().join("catalog.redb")).unwrap();
    (catalog, dir)
}

/// A music root, a catalog and a scanner wired to a fake tag reader.
pub struct Fixture {
    pub root: PathBuf,
    pub catalog: Catalog,
    pub tags: Arc<FakeTagReader>,
    pub scanner: Scanner,
    _dir: TempDir,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_reader(FakeTagReader::default())
    }

    pub fn with_reader(reader: FakeTagReader) -> Self {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("music");
        fs::create_dir_all(&root).unwrap();
        let catalog = Catalog::open(&dir.path().join("catalog.redb")).unwrap();
        let tags = Arc::new(reader);
        let scanner = Scanner::new(
            root.clone(),
            catalog.clone(),
            tags.clone(),
            ScanConfig::default(),
        );
        Self {
            root,
            catalog,
            tags,
            scanner,
            _dir: dir,
        }
    }

    /// Writes `contents` to `relpath` below the music root, creating parent
    /// directories.
    pub fn write(&self, relpath: &str, contents: &str) -> PathBuf {
        let path = self.root.join(relpath);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, contents).unwrap();
        path
    }

    pub fn mkdir(&self, relpath: &str) -> PathBuf {
        let path = self.root.join(relpath);
        fs::create_dir_all(&path).unwrap();
        path
    }

    pub fn remove(&self, relpath: &str) {
        fs::remove_file(self.root.join(relpath)).unwrap();
    }

    /// Moves the modification time of `relpath` (file or directory) by
    /// `offset_secs` relative to now.
    pub fn touch(&self, relpath: &str, offset_secs: i64) {
        set_mtime(&self.root.join(relpath), offset_secs);
    }
}

pub fn set_mtime(path: &Path, offset_secs: i64) {
    let now = SystemTime::now();
    let delta = Duration::from_secs(offset_secs.unsigned_abs());
    let time = if offset_secs >= 0 { now + delta } else { now - delta };
    File::open(path).unwrap().set_modified(time).unwrap();
}
