use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use common::{Album, Artist, Track};
use redb::ReadableTable;
use tracing::debug;

use crate::{
    decode_value, encode_value, join_key, now_ms, prefix_end, prefix_key, split_key_last,
    Library, LibraryError, User, ALBUMS_TABLE, ALBUM_TRACKS_TABLE, ARTISTS_TABLE,
    ARTIST_TRACKS_TABLE, TRACKS_BY_DIR_TABLE, TRACKS_TABLE, USERS_TABLE,
};

/// Storage used by the scanner.
///
/// Tracks are addressed by id. Directory lookups are by exact parent
/// directory of the backing file.
pub trait Catalog: Send + Sync {
    fn get_track(&self, id: &str) -> Result<Option<Track>, LibraryError>;

    fn put_track(&self, track: &Track) -> Result<(), LibraryError>;

    fn delete_track(&self, id: &str) -> Result<(), LibraryError>;

    /// Tracks whose file sits directly in `dir`.
    fn find_tracks_in_dir(&self, dir: &Path) -> Result<Vec<Track>, LibraryError>;

    /// Every directory at or below `root` that holds at least one track.
    fn find_dirs_recursively(&self, root: &Path) -> Result<Vec<PathBuf>, LibraryError>;

    /// Removes every track directly in `dir` and returns how many were removed.
    fn delete_tracks_in_dir(&self, dir: &Path) -> Result<usize, LibraryError>;

    fn refresh_albums(&self, ids: &[String]) -> Result<(), LibraryError>;

    fn refresh_artists(&self, ids: &[String]) -> Result<(), LibraryError>;

    /// Drops tracks outside `root`, then albums and artists left without tracks.
    fn gc(&self, root: &Path) -> Result<(), LibraryError>;

    fn has_admin_user(&self) -> Result<bool, LibraryError>;
}

impl Catalog for Library {
    fn get_track(&self, id: &str) -> Result<Option<Track>, LibraryError> {
        let read_txn = self.db.begin_read()?;
        let tracks_table = read_txn.open_table(TRACKS_TABLE)?;
        let track = match tracks_table.get(id)? {
            Some(value) => Some(decode_value(value.value())?),
            None => None,
        };
        Ok(track)
    }

    fn put_track(&self, track: &Track) -> Result<(), LibraryError> {
        let bytes = encode_value(track)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut tracks_table = write_txn.open_table(TRACKS_TABLE)?;
            let mut by_dir_table = write_txn.open_table(TRACKS_BY_DIR_TABLE)?;
            let mut album_tracks_table = write_txn.open_table(ALBUM_TRACKS_TABLE)?;
            let mut artist_tracks_table = write_txn.open_table(ARTIST_TRACKS_TABLE)?;

            let previous: Option<Track> = match tracks_table.get(track.id.as_str())? {
                Some(value) => Some(decode_value(value.value())?),
                None => None,
            };
            if let Some(previous) = previous {
                // Album or artist may have changed since the last write.
                album_tracks_table
                    .remove(join_key(&previous.album_id, &previous.id).as_str())?;
                artist_tracks_table
                    .remove(join_key(&previous.album_artist_id, &previous.id).as_str())?;
                by_dir_table.remove(dir_key(&previous).as_str())?;
            }

            tracks_table.insert(track.id.as_str(), bytes.as_slice())?;
            by_dir_table.insert(dir_key(track).as_str(), track.id.as_bytes())?;
            album_tracks_table.insert(
                join_key(&track.album_id, &track.id).as_str(),
                track.id.as_bytes(),
            )?;
            artist_tracks_table.insert(
                join_key(&track.album_artist_id, &track.id).as_str(),
                track.id.as_bytes(),
            )?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn delete_track(&self, id: &str) -> Result<(), LibraryError> {
        let write_txn = self.db.begin_write()?;
        {
            let mut tracks_table = write_txn.open_table(TRACKS_TABLE)?;
            let mut by_dir_table = write_txn.open_table(TRACKS_BY_DIR_TABLE)?;
            let mut album_tracks_table = write_txn.open_table(ALBUM_TRACKS_TABLE)?;
            let mut artist_tracks_table = write_txn.open_table(ARTIST_TRACKS_TABLE)?;

            let removed: Option<Track> = match tracks_table.remove(id)? {
                Some(value) => Some(decode_value(value.value())?),
                None => None,
            };
            if let Some(track) = removed {
                by_dir_table.remove(dir_key(&track).as_str())?;
                album_tracks_table.remove(join_key(&track.album_id, &track.id).as_str())?;
                artist_tracks_table
                    .remove(join_key(&track.album_artist_id, &track.id).as_str())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    fn find_tracks_in_dir(&self, dir: &Path) -> Result<Vec<Track>, LibraryError> {
        let read_txn = self.db.begin_read()?;
        let by_dir_table = read_txn.open_table(TRACKS_BY_DIR_TABLE)?;
        let tracks_table = read_txn.open_table(TRACKS_TABLE)?;

        let prefix = prefix_key(&dir.to_string_lossy());
        let end = prefix_end(&prefix);
        let mut tracks = Vec::new();
        for entry in by_dir_table.range(prefix.as_str()..end.as_str())? {
            let entry = entry?;
            let (_, track_id) = split_key_last(entry.0.value())?;
            if let Some(value) = tracks_table.get(track_id)? {
                let track: Track = decode_value(value.value())?;
                tracks.push(track);
            }
        }
        Ok(tracks)
    }

    fn find_dirs_recursively(&self, root: &Path) -> Result<Vec<PathBuf>, LibraryError> {
        let read_txn = self.db.begin_read()?;
        let by_dir_table = read_txn.open_table(TRACKS_BY_DIR_TABLE)?;

        let prefix = root.to_string_lossy().to_string();
        let end = prefix_end(&prefix);
        let mut dirs = BTreeSet::new();
        for entry in by_dir_table.range(prefix.as_str()..end.as_str())? {
            let entry = entry?;
            let (dir, _) = split_key_last(entry.0.value())?;
            let dir = PathBuf::from(dir);
            // A plain prefix match also hits siblings such as `/music2`.
            if dir.starts_with(root) {
                dirs.insert(dir);
            }
        }
        Ok(dirs.into_iter().collect())
    }

    fn delete_tracks_in_dir(&self, dir: &Path) -> Result<usize, LibraryError> {
        let prefix = prefix_key(&dir.to_string_lossy());
        let end = prefix_end(&prefix);

        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut tracks_table = write_txn.open_table(TRACKS_TABLE)?;
            let mut by_dir_table = write_txn.open_table(TRACKS_BY_DIR_TABLE)?;
            let mut album_tracks_table = write_txn.open_table(ALBUM_TRACKS_TABLE)?;
            let mut artist_tracks_table = write_txn.open_table(ARTIST_TRACKS_TABLE)?;

            let mut keys = Vec::new();
            for entry in by_dir_table.range(prefix.as_str()..end.as_str())? {
                let entry = entry?;
                keys.push(entry.0.value().to_string());
            }

            let mut removed = 0usize;
            for key in keys {
                by_dir_table.remove(key.as_str())?;
                let (_, track_id) = split_key_last(&key)?;
                let track: Option<Track> = match tracks_table.remove(track_id)? {
                    Some(value) => Some(decode_value(value.value())?),
                    None => None,
                };
                if let Some(track) = track {
                    album_tracks_table.remove(join_key(&track.album_id, &track.id).as_str())?;
                    artist_tracks_table
                        .remove(join_key(&track.album_artist_id, &track.id).as_str())?;
                    removed += 1;
                }
            }
            removed
        };
        write_txn.commit()?;
        debug!("Removed {} tracks from {:?}", removed, dir);
        Ok(removed)
    }

    fn refresh_albums(&self, ids: &[String]) -> Result<(), LibraryError> {
        if ids.is_empty() {
            return Ok(());
        }
        let now = now_ms();
        let write_txn = self.db.begin_write()?;
        {
            let tracks_table = write_txn.open_table(TRACKS_TABLE)?;
            let album_tracks_table = write_txn.open_table(ALBUM_TRACKS_TABLE)?;
            let mut albums_table = write_txn.open_table(ALBUMS_TABLE)?;

            for album_id in ids {
                let prefix = prefix_key(album_id);
                let end = prefix_end(&prefix);
                let mut tracks: Vec<Track> = Vec::new();
                for entry in album_tracks_table.range(prefix.as_str()..end.as_str())? {
                    let entry = entry?;
                    let (_, track_id) = split_key_last(entry.0.value())?;
                    if let Some(value) = tracks_table.get(track_id)? {
                        tracks.push(decode_value(value.value())?);
                    }
                }
                // Empty albums are removed by gc.
                let Some(album) = summarize_album(album_id, &mut tracks, now) else {
                    continue;
                };
                let bytes = encode_value(&album)?;
                albums_table.insert(album_id.as_str(), bytes.as_slice())?;
            }
        }
        write_txn.commit()?;
        debug!("Refreshed {} albums", ids.len());
        Ok(())
    }

    fn refresh_artists(&self, ids: &[String]) -> Result<(), LibraryError> {
        if ids.is_empty() {
            return Ok(());
        }
        let write_txn = self.db.begin_write()?;
        {
            let tracks_table = write_txn.open_table(TRACKS_TABLE)?;
            let artist_tracks_table = write_txn.open_table(ARTIST_TRACKS_TABLE)?;
            let mut artists_table = write_txn.open_table(ARTISTS_TABLE)?;

            for artist_id in ids {
                let prefix = prefix_key(artist_id);
                let end = prefix_end(&prefix);
                let mut tracks: Vec<Track> = Vec::new();
                for entry in artist_tracks_table.range(prefix.as_str()..end.as_str())? {
                    let entry = entry?;
                    let (_, track_id) = split_key_last(entry.0.value())?;
                    if let Some(value) = tracks_table.get(track_id)? {
                        tracks.push(decode_value(value.value())?);
                    }
                }
                let Some(artist) = summarize_artist(artist_id, &tracks) else {
                    continue;
                };
                let bytes = encode_value(&artist)?;
                artists_table.insert(artist_id.as_str(), bytes.as_slice())?;
            }
        }
        write_txn.commit()?;
        debug!("Refreshed {} artists", ids.len());
        Ok(())
    }

    fn gc(&self, root: &Path) -> Result<(), LibraryError> {
        let outside: Vec<String> = {
            let read_txn = self.db.begin_read()?;
            let tracks_table = read_txn.open_table(TRACKS_TABLE)?;
            let mut outside = Vec::new();
            for entry in tracks_table.iter()? {
                let entry = entry?;
                let track: Track = decode_value(entry.1.value())?;
                if !track.path.starts_with(root) {
                    outside.push(track.id);
                }
            }
            outside
        };
        for id in &outside {
            self.delete_track(id)?;
        }

        let write_txn = self.db.begin_write()?;
        let (albums_removed, artists_removed) = {
            let album_tracks_table = write_txn.open_table(ALBUM_TRACKS_TABLE)?;
            let artist_tracks_table = write_txn.open_table(ARTIST_TRACKS_TABLE)?;
            let mut albums_table = write_txn.open_table(ALBUMS_TABLE)?;
            let mut artists_table = write_txn.open_table(ARTISTS_TABLE)?;

            let album_ids = index_owners(&album_tracks_table)?;
            let artist_ids = index_owners(&artist_tracks_table)?;

            let mut empty_albums = Vec::new();
            for entry in albums_table.iter()? {
                let entry = entry?;
                let id = entry.0.value();
                if !album_ids.contains(id) {
                    empty_albums.push(id.to_string());
                }
            }
            let mut empty_artists = Vec::new();
            for entry in artists_table.iter()? {
                let entry = entry?;
                let id = entry.0.value();
                if !artist_ids.contains(id) {
                    empty_artists.push(id.to_string());
                }
            }

            for id in &empty_albums {
                albums_table.remove(id.as_str())?;
            }
            for id in &empty_artists {
                artists_table.remove(id.as_str())?;
            }
            (empty_albums.len(), empty_artists.len())
        };
        write_txn.commit()?;

        if !outside.is_empty() || albums_removed > 0 || artists_removed > 0 {
            debug!(
                "GC under {:?}: {} tracks, {} albums, {} artists removed",
                root,
                outside.len(),
                albums_removed,
                artists_removed
            );
        }
        Ok(())
    }

    fn has_admin_user(&self) -> Result<bool, LibraryError> {
        let read_txn = self.db.begin_read()?;
        let users_table = read_txn.open_table(USERS_TABLE)?;
        for entry in users_table.iter()? {
            let entry = entry?;
            let user: User = decode_value(entry.1.value())?;
            if user.is_admin {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

fn dir_key(track: &Track) -> String {
    let dir = track
        .dir()
        .map(|dir| dir.to_string_lossy().to_string())
        .unwrap_or_default();
    join_key(&dir, &track.id)
}

/// Distinct owner ids of a `owner\x1ftrack` index table.
fn index_owners<T>(table: &T) -> Result<HashSet<String>, LibraryError>
where
    T: ReadableTable<&'static str, &'static [u8]>,
{
    let mut owners = HashSet::new();
    for entry in table.iter()? {
        let entry = entry?;
        let (owner, _) = split_key_last(entry.0.value())?;
        owners.insert(owner.to_string());
    }
    Ok(owners)
}

fn summarize_album(album_id: &str, tracks: &mut [Track], now: u64) -> Option<Album> {
    tracks.sort_by(|a, b| {
        a.disc_no
            .unwrap_or(u32::MAX)
            .cmp(&b.disc_no.unwrap_or(u32::MAX))
            .then_with(|| a.track_no.unwrap_or(u32::MAX).cmp(&b.track_no.unwrap_or(u32::MAX)))
            .then_with(|| a.path.cmp(&b.path))
            .then_with(|| a.sub_track.cmp(&b.sub_track))
    });
    let first = tracks.first()?;

    let mut album = Album {
        id: album_id.to_string(),
        name: first.album.clone(),
        album_artist_id: first.album_artist_id.clone(),
        album_artist: first.album_artist.clone(),
        updated_at_ms: now,
        ..Album::default()
    };
    for track in tracks.iter() {
        album.song_count += 1;
        album.duration_secs += track.duration_secs;
        album.size += track.file_size;
        if let Some(year) = track.year.filter(|year| *year > 0) {
            album.min_year = Some(album.min_year.map_or(year, |min| min.min(year)));
            album.max_year = Some(album.max_year.map_or(year, |max| max.max(year)));
        }
        merge_genres(&mut album.genres, &track.genres);
    }
    Some(album)
}

fn summarize_artist(artist_id: &str, tracks: &[Track]) -> Option<Artist> {
    let first = tracks.first()?;
    let albums: HashSet<&str> = tracks.iter().map(|track| track.album_id.as_str()).collect();
    Some(Artist {
        id: artist_id.to_string(),
        name: first.album_artist.clone(),
        album_count: albums.len() as u32,
        song_count: tracks.len() as u32,
        size: tracks.iter().map(|track| track.file_size).sum(),
    })
}

fn merge_genres(target: &mut Vec<String>, incoming: &[String]) {
    for genre in incoming {
        let trimmed = genre.trim();
        if trimmed.is_empty() {
            continue;
        }
        if !target.iter().any(|known| known.eq_ignore_ascii_case(trimmed)) {
            target.push(trimmed.to_string());
        }
    }
}
