use std::path::Path;

use lofty::error::LoftyError;
use lofty::prelude::{AudioFile, ItemKey, TaggedFileExt};
use mime_guess::mime;

/// Fields extracted from an audio file's tags and stream properties.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct TagInfo {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album_artist: Option<String>,
    pub album: Option<String>,
    pub genre: Option<String>,
    pub track_no: Option<u16>,
    pub disc_no: Option<u16>,
    pub year: Option<i32>,
    pub duration_ms: Option<u32>,
    pub bitrate: Option<u32>,
    pub track_mbid: Option<String>,
    pub album_mbid: Option<String>,
}

#[derive(Debug)]
pub enum MetadataError {
    Io(std::io::Error),
    Lofty(LoftyError),
}

impl std::fmt::Display for MetadataError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetadataError::Io(err) => write!(f, "io error: {}", err),
            MetadataError::Lofty(err) => write!(f, "tag error: {}", err),
        }
    }
}

impl std::error::Error for MetadataError {}

impl From<std::io::Error> for MetadataError {
    fn from(err: std::io::Error) -> Self {
        MetadataError::Io(err)
    }
}

impl From<LoftyError> for MetadataError {
    fn from(err: LoftyError) -> Self {
        MetadataError::Lofty(err)
    }
}

/// Source of tag data for the scanner.
pub trait TagReader: Send + Sync {
    fn read(&self, path: &Path) -> Result<TagInfo, MetadataError>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct LoftyTagReader;

impl TagReader for LoftyTagReader {
    fn read(&self, path: &Path) -> Result<TagInfo, MetadataError> {
        read_tags(path)
    }
}

pub fn read_tags(path: &Path) -> Result<TagInfo, MetadataError> {
    let tagged_file = lofty::read_from_path(path)?;
    let properties = tagged_file.properties();

    let mut info = TagInfo::default();

    let duration_ms = properties.duration().as_millis();
    if duration_ms > 0 {
        let clamped = duration_ms.min(u128::from(u32::MAX)) as u32;
        info.duration_ms = Some(clamped);
    }
    info.bitrate = properties.audio_bitrate().or(properties.overall_bitrate());

    if let Some(tag) = tagged_file.primary_tag().or_else(|| tagged_file.first_tag()) {
        info.title = tag_string(tag.get_string(&ItemKey::TrackTitle));
        info.artist = tag_string(tag.get_string(&ItemKey::TrackArtist));
        info.album_artist = tag_string(tag.get_string(&ItemKey::AlbumArtist));
        info.album = tag_string(tag.get_string(&ItemKey::AlbumTitle));
        info.genre = tag_string(tag.get_string(&ItemKey::Genre));
        info.track_no = tag
            .get_string(&ItemKey::TrackNumber)
            .and_then(parse_u16);
        info.disc_no = tag
            .get_string(&ItemKey::DiscNumber)
            .and_then(parse_u16);
        info.year = tag
            .get_string(&ItemKey::Year)
            .or_else(|| tag.get_string(&ItemKey::RecordingDate))
            .and_then(parse_year);
        info.track_mbid = tag_string(tag.get_string(&ItemKey::MusicBrainzRecordingId));
        info.album_mbid = tag_string(tag.get_string(&ItemKey::MusicBrainzReleaseId));
    }

    Ok(info)
}

/// Maps a file extension (without the dot) to its audio MIME type. Returns
/// `None` for anything that is not audio.
pub fn audio_mime(ext: &str) -> Option<String> {
    let guess = mime_guess::from_ext(&ext.to_ascii_lowercase()).first()?;
    if guess.type_() == mime::AUDIO {
        Some(guess.essence_str().to_string())
    } else {
        None
    }
}

fn tag_string(value: Option<&str>) -> Option<String> {
    let trimmed = value?.trim_matches(|c: char| c.is_whitespace() || c == '\0');
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn parse_u16(text: &str) -> Option<u16> {
    let head = text.split('/').next().unwrap_or(text).trim();
    head.parse().ok()
}

fn parse_year(text: &str) -> Option<i32> {
    let mut digits = String::new();
    for ch in text.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            if digits.len() == 4 {
                break;
            }
        } else if !digits.is_empty() {
            break;
        }
    }
    if digits.is_empty() {
        None
    } else {
        digits.parse().ok()
    }
}
