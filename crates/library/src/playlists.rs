use std::path::Path;

/// Imports playlist files found in a scanned directory.
///
/// The scanner decides when this runs; parsing the files is up to the
/// implementation.
pub trait PlaylistImporter: Send + Sync {
    /// Returns how many playlists were imported from `dir`.
    fn process_playlists(&self, dir: &Path) -> usize;
}
