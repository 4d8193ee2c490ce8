mod cue_tracks;
pub mod cuesheet;

use std::fs;
use std::path::{Path, PathBuf};

use common::{MusicBrainzIds, ReplayGain, NO_SUB_TRACK};
use lofty::error::LoftyError;
use lofty::prelude::{AudioFile, ItemKey, TaggedFileExt};
use tracing::warn;

pub use cue_tracks::{split_tracks, AppliedCue};
pub use cuesheet::{CueError, CueFile, CueSheet, CueTrack, Remarks};

const CUESHEET_ITEM: &str = "CUESHEET";

/// Tags of one physical file, or of one cue-derived sub-track of it.
#[derive(Debug, Clone, PartialEq)]
pub struct TagInfo {
    pub path: PathBuf,
    pub sub_track: i32,
    pub file_size: u64,
    pub suffix: String,
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub album_artist: Option<String>,
    pub genres: Vec<String>,
    pub comment: Option<String>,
    pub track_no: Option<u32>,
    pub track_total: Option<u32>,
    pub disc_no: Option<u32>,
    pub disc_total: Option<u32>,
    pub year: Option<i32>,
    pub duration_secs: f64,
    pub offset_secs: f64,
    pub sample_rate: Option<u32>,
    pub channels: Option<u8>,
    pub bitrate: Option<u32>,
    pub has_embedded_cover: bool,
    pub replay_gain: ReplayGain,
    pub mbz: MusicBrainzIds,
    /// Raw text of an embedded cue sheet, if the file carries one.
    pub cue_sheet: Option<String>,
}

impl Default for TagInfo {
    fn default() -> Self {
        Self {
            path: PathBuf::new(),
            sub_track: NO_SUB_TRACK,
            file_size: 0,
            suffix: String::new(),
            title: None,
            artist: None,
            album: None,
            album_artist: None,
            genres: Vec::new(),
            comment: None,
            track_no: None,
            track_total: None,
            disc_no: None,
            disc_total: None,
            year: None,
            duration_secs: 0.0,
            offset_secs: 0.0,
            sample_rate: None,
            channels: None,
            bitrate: None,
            has_embedded_cover: false,
            replay_gain: ReplayGain::default(),
            mbz: MusicBrainzIds::default(),
            cue_sheet: None,
        }
    }
}

impl TagInfo {
    pub fn for_path(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            suffix: file_suffix(path),
            ..Self::default()
        }
    }
}

#[derive(Debug)]
pub enum MetadataError {
    Io(std::io::Error),
    Lofty(LoftyError),
    Extractor(String),
}

impl std::fmt::Display for MetadataError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetadataError::Io(err) => write!(f, "io error: {}", err),
            MetadataError::Lofty(err) => write!(f, "tag error: {}", err),
            MetadataError::Extractor(message) => write!(f, "extractor error: {}", message),
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

/// Reads raw tags for a batch of files.
///
/// Files that cannot be read are left out of the result. An `Err` means the
/// whole batch could not be processed.
pub trait Extractor: Send + Sync {
    fn extract(&self, paths: &[PathBuf]) -> Result<Vec<TagInfo>, MetadataError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LoftyExtractor;

impl Extractor for LoftyExtractor {
    fn extract(&self, paths: &[PathBuf]) -> Result<Vec<TagInfo>, MetadataError> {
        let mut out = Vec::with_capacity(paths.len());
        for path in paths {
            match read_file(path) {
                Ok(info) => out.push(info),
                Err(err) => warn!("Failed to read tags for {:?}: {}", path, err),
            }
        }
        Ok(out)
    }
}

/// Reads tags and file properties of a single file.
pub fn read_file(path: &Path) -> Result<TagInfo, MetadataError> {
    let file_size = fs::metadata(path)?.len();
    let mut info = read_tags(path)?;
    info.path = path.to_path_buf();
    info.suffix = file_suffix(path);
    info.file_size = file_size;
    Ok(info)
}

pub fn read_tags(path: &Path) -> Result<TagInfo, MetadataError> {
    let tagged_file = lofty::read_from_path(path)?;
    let properties = tagged_file.properties();

    let mut info = TagInfo::for_path(path);
    info.duration_secs = properties.duration().as_secs_f64();
    info.sample_rate = properties.sample_rate();
    info.channels = properties.channels();
    info.bitrate = properties.audio_bitrate().or(properties.overall_bitrate());

    if let Some(tag) = tagged_file.primary_tag().or_else(|| tagged_file.first_tag()) {
        let text = |key: &ItemKey| {
            tag.get_string(key)
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(|value| value.to_string())
        };

        info.title = text(&ItemKey::TrackTitle);
        info.album = text(&ItemKey::AlbumTitle);
        info.album_artist = text(&ItemKey::AlbumArtist);
        info.artist = text(&ItemKey::TrackArtist).or_else(|| info.album_artist.clone());
        info.comment = text(&ItemKey::Comment);

        let (track_no, track_total) = tag
            .get_string(&ItemKey::TrackNumber)
            .map(parse_number_pair)
            .unwrap_or((None, None));
        info.track_no = track_no;
        info.track_total = tag
            .get_string(&ItemKey::TrackTotal)
            .and_then(parse_u32)
            .or(track_total);

        let (disc_no, disc_total) = tag
            .get_string(&ItemKey::DiscNumber)
            .map(parse_number_pair)
            .unwrap_or((None, None));
        info.disc_no = disc_no;
        info.disc_total = tag
            .get_string(&ItemKey::DiscTotal)
            .and_then(parse_u32)
            .or(disc_total);

        info.year = tag
            .get_string(&ItemKey::Year)
            .or_else(|| tag.get_string(&ItemKey::RecordingDate))
            .and_then(parse_year);
        if let Some(value) = tag.get_string(&ItemKey::Genre) {
            info.genres = parse_genres(value);
        }

        info.replay_gain = ReplayGain {
            album_gain: tag.get_string(&ItemKey::ReplayGainAlbumGain).and_then(parse_gain),
            album_peak: tag.get_string(&ItemKey::ReplayGainAlbumPeak).and_then(parse_gain),
            track_gain: tag.get_string(&ItemKey::ReplayGainTrackGain).and_then(parse_gain),
            track_peak: tag.get_string(&ItemKey::ReplayGainTrackPeak).and_then(parse_gain),
        };
        info.mbz = MusicBrainzIds {
            album_id: text(&ItemKey::MusicBrainzReleaseId),
            artist_id: text(&ItemKey::MusicBrainzArtistId),
            recording_id: text(&ItemKey::MusicBrainzRecordingId),
            release_track_id: text(&ItemKey::MusicBrainzTrackId),
        };
        info.cue_sheet = text(&ItemKey::Unknown(CUESHEET_ITEM.to_string()));
        info.has_embedded_cover = !tag.pictures().is_empty();
    }

    Ok(info)
}

pub fn file_suffix(path: &Path) -> String {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default()
}

pub fn parse_u32(text: &str) -> Option<u32> {
    let head = text.split('/').next().unwrap_or(text).trim();
    head.parse().ok()
}

/// Parses `"3/12"` style values into number and total.
fn parse_number_pair(text: &str) -> (Option<u32>, Option<u32>) {
    let mut parts = text.splitn(2, '/');
    let number = parts.next().and_then(|value| value.trim().parse().ok());
    let total = parts.next().and_then(|value| value.trim().parse().ok());
    (number, total)
}

pub fn parse_year(text: &str) -> Option<i32> {
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

/// Parses replay gain values such as `"-7.89 dB"` or `"0.988"`.
pub fn parse_gain(text: &str) -> Option<f64> {
    let trimmed = text.trim();
    let unit_at = trimmed.len().saturating_sub(2);
    let number = match (trimmed.get(..unit_at), trimmed.get(unit_at..)) {
        (Some(head), Some(unit)) if unit.eq_ignore_ascii_case("db") => head.trim_end(),
        _ => trimmed,
    };
    number.parse::<f64>().ok().filter(|value| value.is_finite())
}

fn parse_genres(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    for part in text.split(&[';', ',', '/', '|', '\0'][..]) {
        let trimmed = part.trim();
        if trimmed.is_empty() {
            continue;
        }
        out.push(trimmed.to_string());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::{
        file_suffix, parse_gain, parse_genres, parse_number_pair, parse_u32, parse_year,
        Extractor, LoftyExtractor,
    };
    use std::path::Path;

    #[test]
    fn parses_numbers_with_totals() {
        assert_eq!(parse_number_pair("3/12"), (Some(3), Some(12)));
        assert_eq!(parse_number_pair(" 7 "), (Some(7), None));
        assert_eq!(parse_number_pair("x/2"), (None, Some(2)));
        assert_eq!(parse_u32("04/10"), Some(4));
    }

    #[test]
    fn parses_year_prefix() {
        assert_eq!(parse_year("1999-04-01"), Some(1999));
        assert_eq!(parse_year("  2003"), Some(2003));
        assert_eq!(parse_year("unknown"), None);
    }

    #[test]
    fn parses_gain_with_unit() {
        assert_eq!(parse_gain("-7.89 dB"), Some(-7.89));
        assert_eq!(parse_gain("+1.50 DB"), Some(1.5));
        assert_eq!(parse_gain("0.988547"), Some(0.988547));
        assert_eq!(parse_gain("loud"), None);
    }

    #[test]
    fn splits_genre_lists() {
        assert_eq!(
            parse_genres("Rock; Pop / Jazz|"),
            vec!["Rock".to_string(), "Pop".to_string(), "Jazz".to_string()]
        );
    }

    #[test]
    fn suffix_is_lowercase() {
        assert_eq!(file_suffix(Path::new("/m/Track.FLAC")), "flac");
        assert_eq!(file_suffix(Path::new("/m/README")), "");
    }

    #[test]
    fn lofty_extractor_skips_unreadable_files() {
        let dir = tempfile::tempdir().unwrap();
        let bogus = dir.path().join("broken.mp3");
        std::fs::write(&bogus, b"not really audio").unwrap();
        let missing = dir.path().join("missing.flac");

        let tags = LoftyExtractor.extract(&[bogus, missing]).unwrap();
        assert!(tags.is_empty());
    }
}
