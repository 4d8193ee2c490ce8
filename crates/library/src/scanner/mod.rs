//! Incremental reconciliation of a music folder against the catalog.
//!
//! A pass walks the folder tree, re-extracts files in directories that
//! changed since the previous pass, purges directories that disappeared and
//! refreshes the album and artist aggregates touched along the way.

mod folder;
mod loader;
mod mapper;
mod refresh;
mod walk;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use metadata::{CueSheet, Extractor};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{system_time_ms, Catalog, LibraryError, PlaylistImporter};
use folder::{FolderReconciliation, Staleness};
use refresh::Refresher;

pub use walk::{is_audio_file, is_cue_file, is_playlist_file, FolderSummary};

/// Where cue sheets may come from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CueSource {
    /// A `CUESHEET` tag inside the media file.
    Embedded,
    /// A `.cue` file next to the media file.
    External,
}

/// Ordered cue sheet sources. Earlier sources win when both describe a file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CueSupport {
    modes: Vec<CueSource>,
}

impl CueSupport {
    pub fn disabled() -> Self {
        Self { modes: Vec::new() }
    }

    pub fn modes(&self) -> &[CueSource] {
        &self.modes
    }

    pub fn includes_external(&self) -> bool {
        self.modes.contains(&CueSource::External)
    }

    pub fn includes_embedded(&self) -> bool {
        self.modes.contains(&CueSource::Embedded)
    }

    pub fn is_external_only(&self) -> bool {
        self.modes == [CueSource::External]
    }
}

impl Default for CueSupport {
    fn default() -> Self {
        Self {
            modes: vec![CueSource::Embedded, CueSource::External],
        }
    }
}

impl FromStr for CueSupport {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim().to_ascii_lowercase();
        let modes = match value.as_str() {
            "" | "disabled" | "none" | "off" => Vec::new(),
            "prefer-embedded" => vec![CueSource::Embedded, CueSource::External],
            "prefer-external" => vec![CueSource::External, CueSource::Embedded],
            list => {
                let mut modes = Vec::new();
                for part in list.split(',').map(str::trim).filter(|part| !part.is_empty()) {
                    let source = match part {
                        "embedded" => CueSource::Embedded,
                        "external" => CueSource::External,
                        other => return Err(format!("unknown cue sheet source: {}", other)),
                    };
                    if !modes.contains(&source) {
                        modes.push(source);
                    }
                }
                modes
            }
        };
        Ok(Self { modes })
    }
}

impl TryFrom<String> for CueSupport {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for CueSupport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self.modes.as_slice() {
            [] => "disabled".to_string(),
            [CueSource::Embedded, CueSource::External] => "prefer-embedded".to_string(),
            [CueSource::External, CueSource::Embedded] => "prefer-external".to_string(),
            modes => modes
                .iter()
                .map(|mode| match mode {
                    CueSource::Embedded => "embedded",
                    CueSource::External => "external",
                })
                .collect::<Vec<_>>()
                .join(","),
        };
        f.write_str(&text)
    }
}

impl From<CueSupport> for String {
    fn from(value: CueSupport) -> Self {
        value.to_string()
    }
}

#[derive(Clone, Debug)]
pub struct ScanOptions {
    pub cue_support: CueSupport,
    pub auto_import_playlists: bool,
    /// Files handed to the extractor per call.
    pub batch_size: usize,
    /// Folder summaries buffered between the walker and the scanner.
    pub walk_queue: usize,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            cue_support: CueSupport::default(),
            auto_import_playlists: true,
            batch_size: 100,
            walk_queue: 64,
        }
    }
}

/// What one pass changed in the catalog.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ScanCounters {
    pub added: u64,
    pub updated: u64,
    pub deleted: u64,
    pub playlists: u64,
}

impl ScanCounters {
    pub fn total(&self) -> u64 {
        self.added + self.updated + self.deleted
    }
}

/// A pass that stopped early, with whatever it committed before.
#[derive(Debug)]
pub struct ScanFailure {
    pub counters: ScanCounters,
    pub error: LibraryError,
}

impl fmt::Display for ScanFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (added {}, updated {}, deleted {})",
            self.error, self.counters.added, self.counters.updated, self.counters.deleted
        )
    }
}

impl std::error::Error for ScanFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// True when the folder must be reconciled. A missing `since` means every
/// folder is considered changed.
pub fn folder_has_changed(
    folder: &FolderSummary,
    catalog_dirs: &HashSet<PathBuf>,
    since: Option<SystemTime>,
) -> bool {
    let Some(since) = since else {
        return true;
    };
    (!catalog_dirs.contains(&folder.path) && folder.audio_files > 0) || folder.modified > since
}

/// State that lives for exactly one pass.
struct ScanPass {
    counters: ScanCounters,
    refresher: Refresher,
    full_scan: bool,
    cue_cache: HashMap<PathBuf, Arc<CueSheet>>,
    cue_by_media: HashMap<PathBuf, Vec<PathBuf>>,
}

impl ScanPass {
    fn new(full_scan: bool) -> Self {
        Self {
            counters: ScanCounters::default(),
            refresher: Refresher::default(),
            full_scan,
            cue_cache: HashMap::new(),
            cue_by_media: HashMap::new(),
        }
    }

    fn cache_cue(&mut self, cue_path: &Path, media: &Path, sheet: &Arc<CueSheet>) {
        self.cue_cache
            .entry(cue_path.to_path_buf())
            .or_insert_with(|| Arc::clone(sheet));
        let cues = self.cue_by_media.entry(media.to_path_buf()).or_default();
        if !cues.iter().any(|known| known == cue_path) {
            cues.push(cue_path.to_path_buf());
        }
    }

    /// External sheets that govern `media`, in discovery order.
    fn cues_for(&self, media: &Path) -> Vec<Arc<CueSheet>> {
        self.cue_by_media
            .get(media)
            .map(|paths| {
                paths
                    .iter()
                    .filter_map(|path| self.cue_cache.get(path).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Reconciles the catalog with the files under one music root.
///
/// Only one pass per root should run at a time.
pub struct TagScanner {
    root: PathBuf,
    catalog: Arc<dyn Catalog>,
    extractor: Arc<dyn Extractor>,
    playlists: Option<Arc<dyn PlaylistImporter>>,
    options: ScanOptions,
}

impl TagScanner {
    pub fn new(root: PathBuf, catalog: Arc<dyn Catalog>, extractor: Arc<dyn Extractor>) -> Self {
        Self {
            root,
            catalog,
            extractor,
            playlists: None,
            options: ScanOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ScanOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_playlists(mut self, importer: Arc<dyn PlaylistImporter>) -> Self {
        self.playlists = Some(importer);
        self
    }

    /// Runs one pass. Folders modified after `since` are reconciled; with no
    /// `since` every folder is.
    ///
    /// Audio file counts are sent on `progress` as folders are discovered.
    pub async fn scan(
        &self,
        since: Option<SystemTime>,
        progress: Option<mpsc::Sender<u32>>,
        cancel: CancellationToken,
    ) -> Result<ScanCounters, ScanFailure> {
        let mut pass = ScanPass::new(since.is_none());
        match self.run(&mut pass, since, progress, &cancel).await {
            Ok(()) => Ok(pass.counters),
            Err(error) => Err(ScanFailure {
                counters: pass.counters,
                error,
            }),
        }
    }

    async fn run(
        &self,
        pass: &mut ScanPass,
        since: Option<SystemTime>,
        progress: Option<mpsc::Sender<u32>>,
        cancel: &CancellationToken,
    ) -> Result<(), LibraryError> {
        let started = Instant::now();

        if !pass.full_scan && walk::is_dir_empty(&self.root)? {
            warn!(
                "Music folder {:?} is empty; skipping scan so the catalog is left alone",
                self.root
            );
            return Ok(());
        }

        let catalog_dirs: HashSet<PathBuf> = self
            .catalog
            .find_dirs_recursively(&self.root)?
            .into_iter()
            .collect();
        debug!("Catalog holds {} folders under {:?}", catalog_dirs.len(), self.root);

        let mut walker = walk::spawn_walker(
            self.root.clone(),
            self.options.walk_queue,
            progress,
            cancel.clone(),
        );
        let mut visited: HashSet<PathBuf> = HashSet::new();
        let mut changed = 0usize;
        let mut playlist_dirs = Vec::new();

        loop {
            let folder = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(LibraryError::Cancelled),
                folder = walker.folders.recv() => folder,
            };
            let Some(folder) = folder else {
                break;
            };
            visited.insert(folder.path.clone());
            if !folder_has_changed(&folder, &catalog_dirs, since) {
                continue;
            }

            changed += 1;
            if folder.has_playlist {
                playlist_dirs.push(folder.path.clone());
            }
            match self.process_changed_dir(pass, &folder.path, cancel).await {
                Ok(()) => {}
                Err(LibraryError::Cancelled) => return Err(LibraryError::Cancelled),
                Err(err) => error!("Error updating folder {:?}: {}", folder.path, err),
            }
        }

        match walker.done.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err),
            Err(_) => return Err(LibraryError::WalkerStopped),
        }

        let mut deleted_dirs: Vec<&PathBuf> = catalog_dirs.difference(&visited).collect();
        deleted_dirs.sort();

        if changed == 0 && deleted_dirs.is_empty() {
            debug!("No changes found in {:?} ({:?})", self.root, started.elapsed());
            return Ok(());
        }
        info!(
            "Folders changed: {}, deleted: {} under {:?}",
            changed,
            deleted_dirs.len(),
            self.root
        );

        for dir in deleted_dirs {
            if cancel.is_cancelled() {
                return Err(LibraryError::Cancelled);
            }
            if let Err(err) = self.purge_dir(pass, dir) {
                error!("Error removing deleted folder {:?}: {}", dir, err);
            }
        }

        if !playlist_dirs.is_empty() {
            pass.counters.playlists += self.import_playlists(&playlist_dirs);
        }

        pass.refresher.flush(self.catalog.as_ref())?;
        self.catalog.gc(&self.root)?;

        info!(
            "Finished processing music folder {:?}: added {}, updated {}, deleted {}, playlists {} in {:?}",
            self.root,
            pass.counters.added,
            pass.counters.updated,
            pass.counters.deleted,
            pass.counters.playlists,
            started.elapsed()
        );
        Ok(())
    }

    async fn process_changed_dir(
        &self,
        pass: &mut ScanPass,
        dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), LibraryError> {
        let tracks = self.catalog.find_tracks_in_dir(dir)?;
        let mut folder = FolderReconciliation::new(dir.to_path_buf(), tracks);

        let with_cue = self.options.cue_support.includes_external();
        for path in walk::list_media_files(dir, with_cue)? {
            if is_cue_file(&path) {
                self.handle_cue_file(pass, &mut folder, &path);
            } else {
                folder.handle_media_path(
                    &path,
                    Staleness::FileTime,
                    pass.full_scan,
                    &mut pass.refresher,
                );
            }
        }

        let queue = folder.take_queue();
        if !queue.is_empty() {
            debug!("Extracting {} files from {:?}", queue.len(), dir);
            self.load_tracks(pass, &mut folder, queue, cancel).await?;
        }

        for (track_id, orphan) in folder.take_orphans() {
            self.catalog.delete_track(&track_id)?;
            pass.refresher
                .accumulate_ids(&orphan.album_id, &orphan.album_artist_id);
            pass.counters.deleted += 1;
        }

        pass.refresher.flush(self.catalog.as_ref())
    }

    fn handle_cue_file(&self, pass: &mut ScanPass, folder: &mut FolderReconciliation, cue: &Path) {
        let sheet = match CueSheet::read_from_file(cue) {
            Ok(sheet) => Arc::new(sheet),
            Err(err) => {
                warn!("Skipping cue sheet {:?}: {}", cue, err);
                return;
            }
        };
        let cue_ms = fs::metadata(cue)
            .and_then(|meta| meta.modified())
            .map(system_time_ms)
            .unwrap_or(0);
        let staleness = Staleness::CueTime {
            cue_ms,
            include_media: !self.options.cue_support.is_external_only(),
        };
        let base = cue.parent().unwrap_or_else(|| folder.dir()).to_path_buf();

        for file in &sheet.files {
            let name = file.base_name();
            if name.is_empty() {
                continue;
            }
            let media = base.join(name);
            if !media.exists() {
                debug!("Cue sheet {:?} names missing file {:?}", cue, media);
                continue;
            }
            if folder.handle_media_path(&media, staleness, pass.full_scan, &mut pass.refresher) {
                pass.cache_cue(cue, &media, &sheet);
            }
        }
    }

    fn purge_dir(&self, pass: &mut ScanPass, dir: &Path) -> Result<(), LibraryError> {
        for track in self.catalog.find_tracks_in_dir(dir)? {
            pass.refresher.accumulate(&track);
        }
        let removed = self.catalog.delete_tracks_in_dir(dir)?;
        pass.counters.deleted += removed as u64;
        debug!("Purged {} tracks from deleted folder {:?}", removed, dir);
        pass.refresher.flush(self.catalog.as_ref())
    }

    fn import_playlists(&self, dirs: &[PathBuf]) -> u64 {
        let Some(importer) = &self.playlists else {
            return 0;
        };
        if !self.options.auto_import_playlists {
            info!("Playlists will not be imported, auto import is disabled");
            return 0;
        }
        match self.catalog.has_admin_user() {
            Ok(true) => {}
            Ok(false) => {
                warn!("Playlists will not be imported until an admin user exists");
                return 0;
            }
            Err(err) => {
                warn!("Could not look up admin users; skipping playlists: {}", err);
                return 0;
            }
        }

        let mut imported = 0u64;
        for dir in dirs {
            imported += importer.process_playlists(dir) as u64;
        }
        imported
    }
}

#[cfg(test)]
mod tests;
