use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use deunicode::deunicode;

pub const UNKNOWN_ARTIST: &str = "Unknown Artist";
pub const UNKNOWN_GENRE: &str = "Unknown Genre";

/// Name given to the library root when it is recorded as a folder.
pub const ROOT_FOLDER_NAME: &str = ".";

/// Catalog record for one directory. Timestamps are nanoseconds since the
/// unix epoch.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Folder {
    pub id: u64,
    pub directory: String,
    pub name: String,
    pub name_ascii: Option<String>,
    pub modified_at: u64,
    pub updated_at: u64,
    pub parent_id: Option<u64>,
    pub cover: Option<String>,
    pub tag_title: Option<String>,
    pub tag_title_ascii: Option<String>,
    pub tag_album_mbid: Option<String>,
    pub tag_year: Option<i32>,
    pub tag_artist_id: Option<u64>,
    pub tag_genre_id: Option<u64>,
}

impl Folder {
    pub fn relpath(&self) -> String {
        if self.directory.is_empty() {
            self.name.clone()
        } else {
            format!("{}/{}", self.directory, self.name)
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub id: u64,
    pub folder_id: u64,
    pub filename: String,
    pub filename_ascii: Option<String>,
    pub size: u64,
    pub artist_id: u64,
    pub genre_id: u64,
    pub title: Option<String>,
    pub title_ascii: Option<String>,
    pub track_artist: Option<String>,
    pub track_no: Option<u16>,
    pub disc_no: Option<u16>,
    pub mbid: Option<String>,
    pub duration_ms: u32,
    pub bitrate: Option<u32>,
    pub updated_at: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Artist {
    pub id: u64,
    pub name: String,
    pub name_ascii: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Genre {
    pub id: u64,
    pub name: String,
}

/// Transliterates `input` to plain ASCII for accent-insensitive search.
/// Returns `None` when the ASCII form is identical to the input.
pub fn ascii_fold(input: &str) -> Option<String> {
    let folded = deunicode(input);
    if folded == input {
        None
    } else {
        Some(folded)
    }
}

pub fn relpath_from(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    Some(path_to_slash_string(rel))
}

/// Splits a slash separated relative path into its parent directory and final
/// component. The empty path (the root itself) maps to `("", ".")`.
pub fn split_relpath(relpath: &str) -> (String, String) {
    let trimmed = relpath.trim_matches('/');
    if trimmed.is_empty() {
        return (String::new(), ROOT_FOLDER_NAME.to_string());
    }
    match trimmed.rfind('/') {
        Some(idx) => (trimmed[..idx].to_string(), trimmed[idx + 1..].to_string()),
        None => (String::new(), trimmed.to_string()),
    }
}

pub fn unix_nanos(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|value| value.as_nanos().min(u128::from(u64::MAX)) as u64)
        .unwrap_or(0)
}

pub fn now_nanos() -> u64 {
    unix_nanos(SystemTime::now())
}

fn path_to_slash_string(path: &Path) -> String {
    let parts: Vec<String> = path
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect();
    parts.join("/")
}
