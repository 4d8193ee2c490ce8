mod catalog;
pub mod playlists;
pub mod scanner;

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use common::{Album, Artist, Bookmark, Track};
use metadata::{CueError, MetadataError};
use redb::{
    CommitError, Database, DatabaseError, ReadableTable, StorageError, TableDefinition, TableError,
    TransactionError,
};
use serde::{Deserialize, Serialize};
use tracing::info;

pub use catalog::Catalog;
pub use playlists::PlaylistImporter;
pub use scanner::{
    folder_has_changed, CueSource, CueSupport, FolderSummary, ScanCounters, ScanFailure,
    ScanOptions, TagScanner,
};

const KEY_SEP: char = '\x1f';

const META_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");
const USERS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("users");
const ARTISTS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("artists");
const ALBUMS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("albums");
const TRACKS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("tracks");
const TRACKS_BY_DIR_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("tracks_by_dir");
const ALBUM_TRACKS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("album_tracks");
const ARTIST_TRACKS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("artist_tracks");

const META_LAST_SCAN_PREFIX: &str = "last_scan:";

/// Catalog backed by a redb database.
#[derive(Clone)]
pub struct Library {
    db: Arc<Database>,
}

impl Library {
    pub fn open(db_path: &Path) -> Result<Self, LibraryError> {
        let db = Self::open_db(db_path)?;
        let library = Self::with_db(db)?;
        info!("Opened catalog at {:?}", db_path);
        Ok(library)
    }

    pub fn with_db(db: Arc<Database>) -> Result<Self, LibraryError> {
        let library = Self { db };
        library.init_tables()?;
        Ok(library)
    }

    pub fn open_db(path: &Path) -> Result<Arc<Database>, LibraryError> {
        let db = open_or_create_db(path)?;
        Ok(Arc::new(db))
    }

    fn init_tables(&self) -> Result<(), LibraryError> {
        let write_txn = self.db.begin_write()?;
        {
            write_txn.open_table(META_TABLE)?;
            write_txn.open_table(USERS_TABLE)?;
            write_txn.open_table(ARTISTS_TABLE)?;
            write_txn.open_table(ALBUMS_TABLE)?;
            write_txn.open_table(TRACKS_TABLE)?;
            write_txn.open_table(TRACKS_BY_DIR_TABLE)?;
            write_txn.open_table(ALBUM_TRACKS_TABLE)?;
            write_txn.open_table(ARTIST_TRACKS_TABLE)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn stats(&self) -> Result<LibraryStats, LibraryError> {
        let read_txn = self.db.begin_read()?;
        let artists = read_txn.open_table(ARTISTS_TABLE)?.len()?;
        let albums = read_txn.open_table(ALBUMS_TABLE)?.len()?;
        let tracks = read_txn.open_table(TRACKS_TABLE)?.len()?;
        Ok(LibraryStats {
            artists: artists as usize,
            albums: albums as usize,
            tracks: tracks as usize,
        })
    }

    pub fn get_album(&self, album_id: &str) -> Result<Option<Album>, LibraryError> {
        let read_txn = self.db.begin_read()?;
        let album_table = read_txn.open_table(ALBUMS_TABLE)?;
        let album = match album_table.get(album_id)? {
            Some(value) => Some(decode_value(value.value())?),
            None => None,
        };
        Ok(album)
    }

    pub fn get_artist(&self, artist_id: &str) -> Result<Option<Artist>, LibraryError> {
        let read_txn = self.db.begin_read()?;
        let artist_table = read_txn.open_table(ARTISTS_TABLE)?;
        let artist = match artist_table.get(artist_id)? {
            Some(value) => Some(decode_value(value.value())?),
            None => None,
        };
        Ok(artist)
    }

    /// Time the last completed pass over `root` started, if any.
    pub fn last_scan_at(&self, root: &Path) -> Result<Option<SystemTime>, LibraryError> {
        let read_txn = self.db.begin_read()?;
        let meta_table = read_txn.open_table(META_TABLE)?;
        let key = last_scan_key(root);
        let at = match meta_table.get(key.as_str())? {
            Some(value) => {
                let millis: u64 = decode_value(value.value())?;
                Some(UNIX_EPOCH + Duration::from_millis(millis))
            }
            None => None,
        };
        Ok(at)
    }

    pub fn record_scan(&self, root: &Path, at: SystemTime) -> Result<(), LibraryError> {
        let key = last_scan_key(root);
        let bytes = encode_value(&system_time_ms(at))?;
        let write_txn = self.db.begin_write()?;
        {
            let mut meta_table = write_txn.open_table(META_TABLE)?;
            meta_table.insert(key.as_str(), bytes.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn add_user(&self, name: &str, is_admin: bool) -> Result<User, LibraryError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(LibraryError::KeyParse("empty user name".to_string()));
        }
        let user = User {
            name: name.to_string(),
            is_admin,
        };
        let bytes = encode_value(&user)?;
        let key = name.to_lowercase();
        let write_txn = self.db.begin_write()?;
        {
            let mut users_table = write_txn.open_table(USERS_TABLE)?;
            users_table.insert(key.as_str(), bytes.as_slice())?;
        }
        write_txn.commit()?;
        Ok(user)
    }

    /// Sets a 0..=5 rating; larger values are clamped.
    pub fn set_rating(&self, track_id: &str, rating: u8) -> Result<bool, LibraryError> {
        self.update_track(track_id, |track| {
            track.annotations.rating = rating.min(5);
        })
    }

    pub fn set_starred(&self, track_id: &str, starred: bool) -> Result<bool, LibraryError> {
        let now = now_ms();
        self.update_track(track_id, |track| {
            track.annotations.starred = starred;
            track.annotations.starred_at_ms = starred.then_some(now);
        })
    }

    pub fn record_play(&self, track_id: &str) -> Result<bool, LibraryError> {
        let now = now_ms();
        self.update_track(track_id, |track| {
            track.annotations.play_count = track.annotations.play_count.saturating_add(1);
            track.annotations.play_date_ms = Some(now);
        })
    }

    pub fn set_bookmark(
        &self,
        track_id: &str,
        position_ms: u64,
        comment: &str,
    ) -> Result<bool, LibraryError> {
        let bookmark = Bookmark {
            position_ms,
            comment: comment.to_string(),
            changed_at_ms: now_ms(),
        };
        self.update_track(track_id, move |track| {
            track.bookmark = Some(bookmark);
        })
    }

    /// Applies `apply` to a stored track without touching its indexes.
    /// Returns `false` when the track does not exist.
    fn update_track<F>(&self, track_id: &str, apply: F) -> Result<bool, LibraryError>
    where
        F: FnOnce(&mut Track),
    {
        let write_txn = self.db.begin_write()?;
        let found = {
            let mut tracks_table = write_txn.open_table(TRACKS_TABLE)?;
            let existing: Option<Track> = match tracks_table.get(track_id)? {
                Some(value) => Some(decode_value(value.value())?),
                None => None,
            };
            match existing {
                Some(mut track) => {
                    apply(&mut track);
                    let bytes = encode_value(&track)?;
                    tracks_table.insert(track_id, bytes.as_slice())?;
                    true
                }
                None => false,
            }
        };
        write_txn.commit()?;
        Ok(found)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LibraryStats {
    pub artists: usize,
    pub albums: usize,
    pub tracks: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub name: String,
    pub is_admin: bool,
}

#[derive(Debug)]
pub enum LibraryError {
    Io(std::io::Error),
    Metadata(MetadataError),
    Cue(CueError),
    Redb(redb::Error),
    Bincode(Box<bincode::ErrorKind>),
    Walk(walkdir::Error),
    KeyParse(String),
    /// The pass was cancelled before it finished.
    Cancelled,
    /// The directory walker went away without reporting completion.
    WalkerStopped,
}

impl std::fmt::Display for LibraryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LibraryError::Io(err) => write!(f, "io error: {}", err),
            LibraryError::Metadata(err) => write!(f, "metadata error: {}", err),
            LibraryError::Cue(err) => write!(f, "cue sheet error: {}", err),
            LibraryError::Redb(err) => write!(f, "db error: {}", err),
            LibraryError::Bincode(err) => write!(f, "bincode error: {}", err),
            LibraryError::Walk(err) => write!(f, "walk error: {}", err),
            LibraryError::KeyParse(value) => write!(f, "key parse error: {}", value),
            LibraryError::Cancelled => write!(f, "scan cancelled"),
            LibraryError::WalkerStopped => write!(f, "directory walker stopped unexpectedly"),
        }
    }
}

impl std::error::Error for LibraryError {}

impl From<std::io::Error> for LibraryError {
    fn from(err: std::io::Error) -> Self {
        LibraryError::Io(err)
    }
}

impl From<MetadataError> for LibraryError {
    fn from(err: MetadataError) -> Self {
        LibraryError::Metadata(err)
    }
}

impl From<CueError> for LibraryError {
    fn from(err: CueError) -> Self {
        LibraryError::Cue(err)
    }
}

impl From<walkdir::Error> for LibraryError {
    fn from(err: walkdir::Error) -> Self {
        LibraryError::Walk(err)
    }
}

impl From<redb::Error> for LibraryError {
    fn from(err: redb::Error) -> Self {
        LibraryError::Redb(err)
    }
}

impl From<DatabaseError> for LibraryError {
    fn from(err: DatabaseError) -> Self {
        LibraryError::Redb(err.into())
    }
}

impl From<TableError> for LibraryError {
    fn from(err: TableError) -> Self {
        LibraryError::Redb(err.into())
    }
}

impl From<TransactionError> for LibraryError {
    fn from(err: TransactionError) -> Self {
        LibraryError::Redb(err.into())
    }
}

impl From<StorageError> for LibraryError {
    fn from(err: StorageError) -> Self {
        LibraryError::Redb(err.into())
    }
}

impl From<CommitError> for LibraryError {
    fn from(err: CommitError) -> Self {
        LibraryError::Redb(err.into())
    }
}

impl From<Box<bincode::ErrorKind>> for LibraryError {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        LibraryError::Bincode(err)
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

fn encode_value<T: Serialize>(value: &T) -> Result<Vec<u8>, LibraryError> {
    Ok(bincode::serialize(value)?)
}

fn decode_value<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, LibraryError> {
    Ok(bincode::deserialize(bytes)?)
}

fn prefix_key(prefix: &str) -> String {
    let mut out = String::new();
    out.push_str(prefix);
    out.push(KEY_SEP);
    out
}

/// Upper bound for a range scan over keys starting with `prefix`.
fn prefix_end(prefix: &str) -> String {
    let mut end = prefix.to_string();
    end.push('\u{10ffff}');
    end
}

fn join_key(prefix: &str, id: &str) -> String {
    let mut out = prefix_key(prefix);
    out.push_str(id);
    out
}

fn split_key_last(value: &str) -> Result<(&str, &str), LibraryError> {
    let idx = value
        .rfind(KEY_SEP)
        .ok_or_else(|| LibraryError::KeyParse(value.to_string()))?;
    let next = idx + KEY_SEP.len_utf8();
    Ok((&value[..idx], &value[next..]))
}

fn last_scan_key(root: &Path) -> String {
    format!("{}{}", META_LAST_SCAN_PREFIX, root.to_string_lossy())
}

pub(crate) fn system_time_ms(at: SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_millis() as u64
}

pub(crate) fn now_ms() -> u64 {
    system_time_ms(SystemTime::now())
}
