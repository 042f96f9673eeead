use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use common::{ascii_fold, now_nanos, Artist, Folder, Genre, Track};
use redb::{Database, ReadTransaction, ReadableTable, TableDefinition, WriteTransaction};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::LibraryError;

const KEY_SEP: char = '\x1f';

const FOLDERS_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("folders");
const FOLDERS_BY_PATH_TABLE: TableDefinition<&str, (u64, u64)> =
    TableDefinition::new("folders_by_path");
const TRACKS_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("tracks");
const TRACKS_BY_NAME_TABLE: TableDefinition<&str, (u64, u64)> =
    TableDefinition::new("tracks_by_name");
const ARTISTS_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("artists");
const ARTISTS_BY_NAME_TABLE: TableDefinition<&str, u64> = TableDefinition::new("artists_by_name");
const GENRES_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("genres");
const GENRES_BY_NAME_TABLE: TableDefinition<&str, u64> = TableDefinition::new("genres_by_name");
const SEQUENCES_TABLE: TableDefinition<&str, u64> = TableDefinition::new("sequences");
const SETTINGS_TABLE: TableDefinition<&str, &str> = TableDefinition::new("settings");

const FOLDER_SEQUENCE: &str = "folders";
const TRACK_SEQUENCE: &str = "tracks";
const ARTIST_SEQUENCE: &str = "artists";
const GENRE_SEQUENCE: &str = "genres";

pub const LAST_SCAN_TIME_KEY: &str = "last_scan_time";

/// Identifier and last update time of a catalog row, as kept in the unique
/// key indexes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Stamp {
    pub id: u64,
    pub updated_at: u64,
}

impl From<(u64, u64)> for Stamp {
    fn from((id, updated_at): (u64, u64)) -> Self {
        Self { id, updated_at }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogStats {
    pub folders: usize,
    pub tracks: usize,
    pub artists: usize,
    pub genres: usize,
}

#[derive(Clone)]
pub struct Catalog {
    db: Arc<Database>,
}

impl Catalog {
    pub fn open(path: &Path) -> Result<Self, LibraryError> {
        let db = open_or_create_db(path)?;
        let catalog = Self { db: Arc::new(db) };
        catalog.init_tables()?;
        Ok(catalog)
    }

    fn init_tables(&self) -> Result<(), LibraryError> {
        let write_txn = self.db.begin_write()?;
        for table in [FOLDERS_TABLE, TRACKS_TABLE, ARTISTS_TABLE, GENRES_TABLE] {
            let _ = write_txn.open_table(table)?;
        }
        for table in [FOLDERS_BY_PATH_TABLE, TRACKS_BY_NAME_TABLE] {
            let _ = write_txn.open_table(table)?;
        }
        for table in [ARTISTS_BY_NAME_TABLE, GENRES_BY_NAME_TABLE, SEQUENCES_TABLE] {
            let _ = write_txn.open_table(table)?;
        }
        let _ = write_txn.open_table(SETTINGS_TABLE)?;
        write_txn.commit()?;
        Ok(())
    }

    pub fn find_folder(&self, directory: &str, name: &str) -> Result<Option<Stamp>, LibraryError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(FOLDERS_BY_PATH_TABLE)?;
        let key = folder_key(directory, name);
        let stamp = table.get(key.as_str())?.map(|value| Stamp::from(value.value()));
        Ok(stamp)
    }

    pub fn get_folder(&self, folder_id: u64) -> Result<Option<Folder>, LibraryError> {
        self.get(FOLDERS_TABLE, folder_id)
    }

    /// Writes `folder` in its own transaction, assigning an id when it has
    /// none and stamping its update time.
    pub fn save_folder(&self, folder: &mut Folder) -> Result<u64, LibraryError> {
        let write_txn = self.db.begin_write()?;
        write_folder(&write_txn, folder)?;
        write_txn.commit()?;
        Ok(folder.id)
    }

    pub fn begin_batch(&self) -> Result<TrackBatch, LibraryError> {
        let txn = self.db.begin_write()?;
        Ok(TrackBatch { txn })
    }

    pub fn get_track(&self, track_id: u64) -> Result<Option<Track>, LibraryError> {
        self.get(TRACKS_TABLE, track_id)
    }

    pub fn find_artist(&self, name: &str) -> Result<Option<Artist>, LibraryError> {
        let read_txn = self.db.begin_read()?;
        let index = read_txn.open_table(ARTISTS_BY_NAME_TABLE)?;
        let artist_id = match index.get(name)? {
            Some(value) => value.value(),
            None => return Ok(None),
        };
        self.get(ARTISTS_TABLE, artist_id)
    }

    pub fn find_genre(&self, name: &str) -> Result<Option<Genre>, LibraryError> {
        let read_txn = self.db.begin_read()?;
        let index = read_txn.open_table(GENRES_BY_NAME_TABLE)?;
        let genre_id = match index.get(name)? {
            Some(value) => value.value(),
            None => return Ok(None),
        };
        self.get(GENRES_TABLE, genre_id)
    }

    pub fn folders(&self) -> Result<Vec<Folder>, LibraryError> {
        self.all(FOLDERS_TABLE)
    }

    pub fn tracks(&self) -> Result<Vec<Track>, LibraryError> {
        self.all(TRACKS_TABLE)
    }

    pub fn artists(&self) -> Result<Vec<Artist>, LibraryError> {
        self.all(ARTISTS_TABLE)
    }

    pub fn genres(&self) -> Result<Vec<Genre>, LibraryError> {
        self.all(GENRES_TABLE)
    }

    pub fn track_ids(&self) -> Result<Vec<u64>, LibraryError> {
        self.ids(TRACKS_TABLE)
    }

    pub fn folder_ids(&self) -> Result<Vec<u64>, LibraryError> {
        self.ids(FOLDERS_TABLE)
    }

    pub fn stats(&self) -> Result<CatalogStats, LibraryError> {
        let read_txn = self.db.begin_read()?;
        Ok(CatalogStats {
            folders: count_rows(&read_txn, FOLDERS_TABLE)?,
            tracks: count_rows(&read_txn, TRACKS_TABLE)?,
            artists: count_rows(&read_txn, ARTISTS_TABLE)?,
            genres: count_rows(&read_txn, GENRES_TABLE)?,
        })
    }

    /// Deletes the given tracks, one write transaction per chunk of ids.
    /// Returns how many rows existed and were removed.
    pub fn delete_tracks(&self, ids: &[u64], chunk_size: usize) -> Result<usize, LibraryError> {
        let mut removed = 0usize;
        for chunk in ids.chunks(chunk_size.max(1)) {
            let write_txn = self.db.begin_write()?;
            {
                let mut table = write_txn.open_table(TRACKS_TABLE)?;
                let mut index = write_txn.open_table(TRACKS_BY_NAME_TABLE)?;
                for id in chunk {
                    let track: Track = match table.remove(*id)? {
                        Some(value) => decode_value(value.value())?,
                        None => continue,
                    };
                    index.remove(track_key(track.folder_id, &track.filename).as_str())?;
                    removed += 1;
                }
            }
            write_txn.commit()?;
        }
        Ok(removed)
    }

    pub fn delete_folders(&self, ids: &[u64], chunk_size: usize) -> Result<usize, LibraryError> {
        let mut removed = 0usize;
        for chunk in ids.chunks(chunk_size.max(1)) {
            let write_txn = self.db.begin_write()?;
            {
                let mut table = write_txn.open_table(FOLDERS_TABLE)?;
                let mut index = write_txn.open_table(FOLDERS_BY_PATH_TABLE)?;
                for id in chunk {
                    let folder: Folder = match table.remove(*id)? {
                        Some(value) => decode_value(value.value())?,
                        None => continue,
                    };
                    index.remove(folder_key(&folder.directory, &folder.name).as_str())?;
                    removed += 1;
                }
            }
            write_txn.commit()?;
        }
        Ok(removed)
    }

    /// Deletes every artist that no folder names as its album artist and no
    /// track references.
    pub fn delete_unreferenced_artists(&self) -> Result<usize, LibraryError> {
        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut referenced = HashSet::new();
            for folder in read_all::<Folder>(&write_txn, FOLDERS_TABLE)? {
                referenced.extend(folder.tag_artist_id);
            }
            for track in read_all::<Track>(&write_txn, TRACKS_TABLE)? {
                referenced.insert(track.artist_id);
            }

            let orphans: Vec<Artist> = read_all::<Artist>(&write_txn, ARTISTS_TABLE)?
                .into_iter()
                .filter(|artist| !referenced.contains(&artist.id))
                .collect();

            let mut table = write_txn.open_table(ARTISTS_TABLE)?;
            let mut index = write_txn.open_table(ARTISTS_BY_NAME_TABLE)?;
            for artist in &orphans {
                table.remove(artist.id)?;
                index.remove(artist.name.as_str())?;
            }
            orphans.len()
        };
        write_txn.commit()?;
        Ok(removed)
    }

    pub fn delete_unreferenced_genres(&self) -> Result<usize, LibraryError> {
        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut referenced = HashSet::new();
            for folder in read_all::<Folder>(&write_txn, FOLDERS_TABLE)? {
                referenced.extend(folder.tag_genre_id);
            }
            for track in read_all::<Track>(&write_txn, TRACKS_TABLE)? {
                referenced.insert(track.genre_id);
            }

            let orphans: Vec<Genre> = read_all::<Genre>(&write_txn, GENRES_TABLE)?
                .into_iter()
                .filter(|genre| !referenced.contains(&genre.id))
                .collect();

            let mut table = write_txn.open_table(GENRES_TABLE)?;
            let mut index = write_txn.open_table(GENRES_BY_NAME_TABLE)?;
            for genre in &orphans {
                table.remove(genre.id)?;
                index.remove(genre.name.as_str())?;
            }
            orphans.len()
        };
        write_txn.commit()?;
        Ok(removed)
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<(), LibraryError> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(SETTINGS_TABLE)?;
            table.insert(key, value)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn setting(&self, key: &str) -> Result<Option<String>, LibraryError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SETTINGS_TABLE)?;
        let value = table.get(key)?.map(|value| value.value().to_string());
        Ok(value)
    }

    fn get<T: DeserializeOwned>(
        &self,
        table: TableDefinition<u64, &[u8]>,
        id: u64,
    ) -> Result<Option<T>, LibraryError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(table)?;
        let item = match table.get(id)? {
            Some(value) => Some(decode_value(value.value())?),
            None => None,
        };
        Ok(item)
    }

    fn all<T: DeserializeOwned>(
        &self,
        table: TableDefinition<u64, &[u8]>,
    ) -> Result<Vec<T>, LibraryError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(table)?;
        let mut items = Vec::new();
        for entry in table.iter()? {
            let entry = entry?;
            items.push(decode_value(entry.1.value())?);
        }
        Ok(items)
    }

    fn ids(&self, table: TableDefinition<u64, &[u8]>) -> Result<Vec<u64>, LibraryError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(table)?;
        let mut ids = Vec::new();
        for entry in table.iter()? {
            let entry = entry?;
            ids.push(entry.0.value());
        }
        Ok(ids)
    }
}

/// Write transaction shared by every track written for one directory.
/// Dropping it without calling [`TrackBatch::commit`] discards its writes.
pub struct TrackBatch {
    txn: WriteTransaction,
}

impl TrackBatch {
    pub fn find_track(&self, folder_id: u64, filename: &str) -> Result<Option<Stamp>, LibraryError> {
        let table = self.txn.open_table(TRACKS_BY_NAME_TABLE)?;
        let key = track_key(folder_id, filename);
        let stamp = table.get(key.as_str())?.map(|value| Stamp::from(value.value()));
        Ok(stamp)
    }

    /// Returns the id of the artist called `name`, creating the row first if
    /// there is none yet.
    pub fn find_or_create_artist(&self, name: &str) -> Result<u64, LibraryError> {
        let found = {
            let index = self.txn.open_table(ARTISTS_BY_NAME_TABLE)?;
            let found = index.get(name)?.map(|value| value.value());
            found
        };
        if let Some(id) = found {
            return Ok(id);
        }

        let id = next_id(&self.txn, ARTIST_SEQUENCE)?;
        let artist = Artist {
            id,
            name: name.to_string(),
            name_ascii: ascii_fold(name),
        };
        let artist_bytes = encode_value(&artist)?;
        let mut table = self.txn.open_table(ARTISTS_TABLE)?;
        let mut index = self.txn.open_table(ARTISTS_BY_NAME_TABLE)?;
        table.insert(id, artist_bytes.as_slice())?;
        index.insert(name, id)?;
        Ok(id)
    }

    pub fn find_or_create_genre(&self, name: &str) -> Result<u64, LibraryError> {
        let found = {
            let index = self.txn.open_table(GENRES_BY_NAME_TABLE)?;
            let found = index.get(name)?.map(|value| value.value());
            found
        };
        if let Some(id) = found {
            return Ok(id);
        }

        let id = next_id(&self.txn, GENRE_SEQUENCE)?;
        let genre = Genre {
            id,
            name: name.to_string(),
        };
        let genre_bytes = encode_value(&genre)?;
        let mut table = self.txn.open_table(GENRES_TABLE)?;
        let mut index = self.txn.open_table(GENRES_BY_NAME_TABLE)?;
        table.insert(id, genre_bytes.as_slice())?;
        index.insert(name, id)?;
        Ok(id)
    }

    pub fn save_track(&self, track: &mut Track) -> Result<u64, LibraryError> {
        if track.id == 0 {
            track.id = next_id(&self.txn, TRACK_SEQUENCE)?;
        }
        track.updated_at = now_nanos();
        let track_bytes = encode_value(track)?;
        let mut table = self.txn.open_table(TRACKS_TABLE)?;
        let mut index = self.txn.open_table(TRACKS_BY_NAME_TABLE)?;
        table.insert(track.id, track_bytes.as_slice())?;
        let key = track_key(track.folder_id, &track.filename);
        index.insert(key.as_str(), (track.id, track.updated_at))?;
        Ok(track.id)
    }

    pub fn commit(self) -> Result<(), LibraryError> {
        self.txn.commit()?;
        Ok(())
    }
}

fn open_or_create_db(path: &Path) -> Result<Database, LibraryError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    if path.exists() {
        Ok(Database::open(path)?)
    } else {
        Ok(Database::create(path)?)
    }
}

fn write_folder(txn: &WriteTransaction, folder: &mut Folder) -> Result<(), LibraryError> {
    if folder.id == 0 {
        folder.id = next_id(txn, FOLDER_SEQUENCE)?;
    }
    folder.updated_at = now_nanos();
    let folder_bytes = encode_value(folder)?;
    let mut table = txn.open_table(FOLDERS_TABLE)?;
    let mut index = txn.open_table(FOLDERS_BY_PATH_TABLE)?;
    table.insert(folder.id, folder_bytes.as_slice())?;
    let key = folder_key(&folder.directory, &folder.name);
    index.insert(key.as_str(), (folder.id, folder.updated_at))?;
    Ok(())
}

// Ids come from a per-kind counter so that deleted ids are never handed out
// again.
fn next_id(txn: &WriteTransaction, sequence: &str) -> Result<u64, LibraryError> {
    let mut table = txn.open_table(SEQUENCES_TABLE)?;
    let next = match table.get(sequence)? {
        Some(value) => value.value() + 1,
        None => 1,
    };
    table.insert(sequence, next)?;
    Ok(next)
}

fn read_all<T: DeserializeOwned>(
    txn: &WriteTransaction,
    table: TableDefinition<u64, &[u8]>,
) -> Result<Vec<T>, LibraryError> {
    let table = txn.open_table(table)?;
    let mut items = Vec::new();
    for entry in table.iter()? {
        let entry = entry?;
        items.push(decode_value(entry.1.value())?);
    }
    Ok(items)
}

fn count_rows(
    txn: &ReadTransaction,
    table: TableDefinition<u64, &[u8]>,
) -> Result<usize, LibraryError> {
    let table = txn.open_table(table)?;
    let mut count = 0usize;
    for entry in table.iter()? {
        entry?;
        count += 1;
    }
    Ok(count)
}

fn encode_value<T: Serialize>(value: &T) -> Result<Vec<u8>, LibraryError> {
    Ok(bincode::serialize(value)?)
}

fn decode_value<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, LibraryError> {
    Ok(bincode::deserialize(bytes)?)
}

fn folder_key(directory: &str, name: &str) -> String {
    let mut out = String::with_capacity(directory.len() + name.len() + 1);
    out.push_str(directory);
    out.push(KEY_SEP);
    out.push_str(name);
    out
}

fn track_key(folder_id: u64, filename: &str) -> String {
    format!("{}{}{}", folder_id, KEY_SEP, filename)
}
