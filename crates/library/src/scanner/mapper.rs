use common::{album_id, artist_id, track_id, Track};
use metadata::TagInfo;

pub(super) const UNKNOWN_ALBUM: &str = "[Unknown Album]";
pub(super) const UNKNOWN_ARTIST: &str = "[Unknown Artist]";

/// Builds a catalog track from extracted tags. Annotations and `created_at`
/// are left for the caller to carry over.
pub(super) fn to_track(tag: &TagInfo, now_ms: u64) -> Track {
    let title = tag
        .title
        .clone()
        .unwrap_or_else(|| file_stem(tag));
    let album = tag
        .album
        .clone()
        .unwrap_or_else(|| UNKNOWN_ALBUM.to_string());
    let artist = tag
        .artist
        .clone()
        .unwrap_or_else(|| UNKNOWN_ARTIST.to_string());
    let album_artist = tag.album_artist.clone().unwrap_or_else(|| artist.clone());

    Track {
        id: track_id(&tag.path, tag.sub_track),
        path: tag.path.clone(),
        sub_track: tag.sub_track,
        album_id: album_id(&album_artist, &album),
        artist_id: artist_id(&artist),
        album_artist_id: artist_id(&album_artist),
        title,
        album,
        artist,
        album_artist,
        track_no: tag.track_no,
        track_total: tag.track_total,
        disc_no: tag.disc_no,
        disc_total: tag.disc_total,
        year: tag.year,
        genres: tag.genres.clone(),
        comment: tag.comment.clone(),
        duration_secs: tag.duration_secs,
        offset_secs: tag.offset_secs,
        bitrate: tag.bitrate,
        channels: tag.channels,
        sample_rate: tag.sample_rate,
        file_size: tag.file_size,
        suffix: tag.suffix.clone(),
        has_cover_art: tag.has_embedded_cover,
        replay_gain: tag.replay_gain.clone(),
        mbz: tag.mbz.clone(),
        created_at_ms: now_ms,
        updated_at_ms: now_ms,
        annotations: Default::default(),
        bookmark: None,
    }
}

fn file_stem(tag: &TagInfo) -> String {
    tag.path
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_default()
}
