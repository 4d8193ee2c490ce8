use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const ID_SEP: char = '\x1f';

/// Sub-track index of a file that is not split by a cue sheet.
pub const NO_SUB_TRACK: i32 = -1;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Artist {
    pub id: String,
    pub name: String,
    pub album_count: u32,
    pub song_count: u32,
    pub size: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Album {
    pub id: String,
    pub name: String,
    pub album_artist_id: String,
    pub album_artist: String,
    pub song_count: u32,
    pub duration_secs: f64,
    pub size: u64,
    pub min_year: Option<i32>,
    pub max_year: Option<i32>,
    #[serde(default)]
    pub genres: Vec<String>,
    pub updated_at_ms: u64,
}

/// A catalog track. Identity is `(path, sub_track)`; `id` is derived from it
/// with [`track_id`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub id: String,
    pub path: PathBuf,
    pub sub_track: i32,
    pub title: String,
    pub album: String,
    pub artist: String,
    pub album_artist: String,
    pub album_id: String,
    pub artist_id: String,
    pub album_artist_id: String,
    pub track_no: Option<u32>,
    pub track_total: Option<u32>,
    pub disc_no: Option<u32>,
    pub disc_total: Option<u32>,
    pub year: Option<i32>,
    #[serde(default)]
    pub genres: Vec<String>,
    pub comment: Option<String>,
    pub duration_secs: f64,
    pub offset_secs: f64,
    pub bitrate: Option<u32>,
    pub channels: Option<u8>,
    pub sample_rate: Option<u32>,
    pub file_size: u64,
    pub suffix: String,
    pub has_cover_art: bool,
    #[serde(default)]
    pub replay_gain: ReplayGain,
    #[serde(default)]
    pub mbz: MusicBrainzIds,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
    #[serde(default)]
    pub annotations: Annotations,
    #[serde(default)]
    pub bookmark: Option<Bookmark>,
}

impl Track {
    pub fn is_sub_track(&self) -> bool {
        self.sub_track > NO_SUB_TRACK
    }

    /// Directory holding the backing file.
    pub fn dir(&self) -> Option<&Path> {
        self.path.parent()
    }
}

/// User-owned fields that survive re-extraction of a track.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Annotations {
    pub starred: bool,
    pub starred_at_ms: Option<u64>,
    pub rating: u8,
    pub play_count: u32,
    pub play_date_ms: Option<u64>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Bookmark {
    pub position_ms: u64,
    pub comment: String,
    pub changed_at_ms: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplayGain {
    pub album_gain: Option<f64>,
    pub album_peak: Option<f64>,
    pub track_gain: Option<f64>,
    pub track_peak: Option<f64>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MusicBrainzIds {
    pub album_id: Option<String>,
    pub artist_id: Option<String>,
    pub recording_id: Option<String>,
    pub release_track_id: Option<String>,
}

pub fn stable_id(input: &str) -> String {
    blake3::hash(input.as_bytes()).to_hex().to_string()
}

pub fn track_id(path: &Path, sub_track: i32) -> String {
    let mut key = path.to_string_lossy().to_string();
    key.push(ID_SEP);
    key.push_str(&sub_track.to_string());
    stable_id(&key)
}

pub fn album_id(album_artist: &str, album: &str) -> String {
    let mut key = album_artist.trim().to_lowercase();
    key.push(ID_SEP);
    key.push_str(&album.trim().to_lowercase());
    stable_id(&key)
}

pub fn artist_id(name: &str) -> String {
    stable_id(&name.trim().to_lowercase())
}

pub fn relpath_from(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    Some(path_to_slash_string(rel))
}

fn path_to_slash_string(path: &Path) -> String {
    let parts: Vec<String> = path
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect();
    parts.join("/")
}
