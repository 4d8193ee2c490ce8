use std::collections::BTreeMap;
use std::path::Path;

use crate::cuesheet::CueSheet;
use crate::{parse_gain, parse_year, TagInfo};

/// A cue sheet applied to a media file, in resolution order.
#[derive(Debug, Clone, Copy)]
pub struct AppliedCue<'a> {
    pub sheet: &'a CueSheet,
    pub embedded: bool,
}

/// Expands one file into the sub-tracks described by its cue sheets.
///
/// Earlier sheets take precedence; only the last sheet falls back to the
/// file's own tags. Returns an empty list when no sheet describes the file.
pub fn split_tracks(file: &TagInfo, cues: &[AppliedCue<'_>]) -> Vec<TagInfo> {
    let mut tracks: BTreeMap<usize, TagInfo> = BTreeMap::new();
    let media_name = file_name(&file.path);

    for (idx, cue) in cues.iter().enumerate() {
        let last = idx + 1 == cues.len();
        let sheet = cue.sheet;
        let mut position = 0usize;

        for cue_file in &sheet.files {
            if !cue.embedded && cue_file.base_name() != media_name {
                continue;
            }
            let count = cue_file.tracks.len();
            for (n, cue_track) in cue_file.tracks.iter().enumerate() {
                let fresh = !tracks.contains_key(&position);
                let entry = tracks
                    .entry(position)
                    .or_insert_with(|| blank_sub_track(file, position));
                position += 1;

                fill(&mut entry.title, Some(cue_track.title.as_str()));
                fill(&mut entry.artist, Some(cue_track.performer.as_str()));
                fill(&mut entry.artist, Some(sheet.performer.as_str()));
                fill(&mut entry.album, Some(sheet.title.as_str()));
                fill(&mut entry.album_artist, Some(sheet.performer.as_str()));
                fill(&mut entry.comment, cue_track.rem.comment());
                fill(&mut entry.comment, sheet.rem.comment());
                if last {
                    fill(&mut entry.artist, file.artist.as_deref());
                    fill(&mut entry.album, file.album.as_deref());
                }

                if let Some(genre) = sheet.rem.genre() {
                    push_genre(&mut entry.genres, genre);
                }
                if last {
                    for genre in &file.genres {
                        push_genre(&mut entry.genres, genre);
                    }
                }

                entry.track_no.get_or_insert(cue_track.number);
                entry.track_total.get_or_insert(count as u32);
                if entry.year.is_none() {
                    entry.year = sheet.rem.date().and_then(parse_year);
                }

                if entry.disc_no.is_none() && entry.disc_total.is_none() {
                    if last {
                        let disc = file.disc_no.unwrap_or(0);
                        let total = file.disc_total.unwrap_or(0);
                        if disc > 0 && total > 0 {
                            entry.disc_no = Some(disc);
                            entry.disc_total = Some(total);
                        }
                    } else {
                        let total = cue_track.rem.total_discs();
                        if total > 0 {
                            let disc = cue_track.rem.disc_number();
                            entry.disc_no = (disc > 0).then_some(disc);
                            entry.disc_total = Some(total);
                        }
                    }
                }

                let gain = &mut entry.replay_gain;
                if gain.album_gain.is_none() {
                    gain.album_gain = sheet.rem.album_gain().and_then(parse_gain);
                }
                if gain.album_peak.is_none() {
                    gain.album_peak = sheet.rem.album_peak().and_then(parse_gain);
                }
                if gain.track_gain.is_none() {
                    gain.track_gain = cue_track.rem.track_gain().and_then(parse_gain);
                }
                if gain.track_peak.is_none() {
                    gain.track_peak = cue_track.rem.track_peak().and_then(parse_gain);
                }

                if last {
                    let mbz = &mut entry.mbz;
                    mbz.album_id = mbz.album_id.take().or_else(|| file.mbz.album_id.clone());
                    mbz.artist_id = mbz.artist_id.take().or_else(|| file.mbz.artist_id.clone());
                    mbz.recording_id = mbz
                        .recording_id
                        .take()
                        .or_else(|| file.mbz.recording_id.clone());
                    mbz.release_track_id = mbz
                        .release_track_id
                        .take()
                        .or_else(|| file.mbz.release_track_id.clone());
                }

                if fresh {
                    let start = cue_track.start.as_secs_f64();
                    let end = match cue_file.tracks.get(n + 1) {
                        Some(next) => next.start.as_secs_f64(),
                        None => file.duration_secs,
                    };
                    entry.offset_secs = start;
                    entry.duration_secs = (end - start).max(0.0);
                }
            }
        }
    }

    tracks.into_values().collect()
}

fn blank_sub_track(file: &TagInfo, position: usize) -> TagInfo {
    TagInfo {
        path: file.path.clone(),
        sub_track: position as i32,
        file_size: file.file_size,
        suffix: file.suffix.clone(),
        sample_rate: file.sample_rate,
        channels: file.channels,
        bitrate: file.bitrate,
        has_embedded_cover: file.has_embedded_cover,
        ..TagInfo::default()
    }
}

fn fill(slot: &mut Option<String>, candidate: Option<&str>) {
    if slot.is_some() {
        return;
    }
    if let Some(value) = candidate.map(str::trim).filter(|value| !value.is_empty()) {
        *slot = Some(value.to_string());
    }
}

fn push_genre(genres: &mut Vec<String>, genre: &str) {
    let genre = genre.trim();
    if genre.is_empty() || genres.iter().any(|known| known.eq_ignore_ascii_case(genre)) {
        return;
    }
    genres.push(genre.to_string());
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default()
}
