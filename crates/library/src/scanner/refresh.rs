use std::collections::BTreeSet;

use common::Track;

use crate::{Catalog, LibraryError};

/// Album and artist ids touched since the last flush.
#[derive(Debug, Default)]
pub(super) struct Refresher {
    album_ids: BTreeSet<String>,
    artist_ids: BTreeSet<String>,
}

impl Refresher {
    pub fn accumulate(&mut self, track: &Track) {
        self.accumulate_ids(&track.album_id, &track.album_artist_id);
    }

    pub fn accumulate_ids(&mut self, album_id: &str, artist_id: &str) {
        if !album_id.is_empty() {
            self.album_ids.insert(album_id.to_string());
        }
        if !artist_id.is_empty() {
            self.artist_ids.insert(artist_id.to_string());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.album_ids.is_empty() && self.artist_ids.is_empty()
    }

    /// Recomputes every accumulated album, then artist, and clears the sets.
    pub fn flush(&mut self, catalog: &dyn Catalog) -> Result<(), LibraryError> {
        if self.is_empty() {
            return Ok(());
        }
        let albums: Vec<String> = std::mem::take(&mut self.album_ids).into_iter().collect();
        let artists: Vec<String> = std::mem::take(&mut self.artist_ids).into_iter().collect();
        catalog.refresh_albums(&albums)?;
        catalog.refresh_artists(&artists)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Refresher;

    #[test]
    fn deduplicates_ids() {
        let mut refresher = Refresher::default();
        assert!(refresher.is_empty());
        refresher.accumulate_ids("album", "artist");
        refresher.accumulate_ids("album", "artist");
        refresher.accumulate_ids("other", "");
        assert_eq!(refresher.album_ids.len(), 2);
        assert_eq!(refresher.artist_ids.len(), 1);
    }
}
