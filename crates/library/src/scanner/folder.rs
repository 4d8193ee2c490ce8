use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use common::Track;
use tracing::{trace, warn};

use super::refresh::Refresher;
use crate::system_time_ms;

/// Album and artist of a catalog track that no file has claimed yet.
#[derive(Clone, Debug, PartialEq)]
pub(super) struct OrphanTrack {
    pub album_id: String,
    pub album_artist_id: String,
}

/// How to decide whether the records of a media file are out of date.
#[derive(Clone, Copy, Debug)]
pub(super) enum Staleness {
    /// The file itself was modified after its records were written.
    FileTime,
    /// The governing cue sheet changed; `include_media` also honours the
    /// media file's own time.
    CueTime { cue_ms: u64, include_media: bool },
}

impl Staleness {
    fn is_stale(self, file_ms: u64, updated_at_ms: u64) -> bool {
        match self {
            Staleness::FileTime => file_ms > updated_at_ms,
            Staleness::CueTime {
                cue_ms,
                include_media,
            } => cue_ms > updated_at_ms || (include_media && file_ms > updated_at_ms),
        }
    }
}

/// State for reconciling one changed directory against the catalog.
pub(super) struct FolderReconciliation {
    dir: PathBuf,
    current: HashMap<PathBuf, Vec<Track>>,
    orphans: BTreeMap<String, OrphanTrack>,
    to_update: Vec<PathBuf>,
    queued: HashSet<PathBuf>,
    spared: HashSet<PathBuf>,
}

impl FolderReconciliation {
    /// Seeds the orphan set with every catalog track of `dir`.
    pub fn new(dir: PathBuf, tracks: Vec<Track>) -> Self {
        let mut current: HashMap<PathBuf, Vec<Track>> = HashMap::new();
        let mut orphans = BTreeMap::new();
        for track in tracks {
            orphans.insert(
                track.id.clone(),
                OrphanTrack {
                    album_id: track.album_id.clone(),
                    album_artist_id: track.album_artist_id.clone(),
                },
            );
            current.entry(track.path.clone()).or_default().push(track);
        }
        for records in current.values_mut() {
            records.sort_by_key(|track| track.sub_track);
        }
        Self {
            dir,
            current,
            orphans,
            to_update: Vec::new(),
            queued: HashSet::new(),
            spared: HashSet::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Decides whether `path` must be re-extracted. Returns `false` when the
    /// file could not be inspected; its records are then neither updated nor
    /// deleted this pass.
    pub fn handle_media_path(
        &mut self,
        path: &Path,
        staleness: Staleness,
        full_scan: bool,
        refresher: &mut Refresher,
    ) -> bool {
        let file_ms = match fs::metadata(path).and_then(|meta| meta.modified()) {
            Ok(modified) => system_time_ms(modified),
            Err(err) => {
                warn!("Could not stat {:?}: {}", path, err);
                self.spared.insert(path.to_path_buf());
                return false;
            }
        };

        let updated_at_ms = match self.current.get(path).and_then(|records| records.first()) {
            Some(first) => {
                refresher.accumulate(first);
                first.updated_at_ms
            }
            None => {
                self.enqueue(path);
                return true;
            }
        };

        if full_scan || staleness.is_stale(file_ms, updated_at_ms) {
            trace!("Queued {:?} for extraction", path);
            self.enqueue(path);
        } else {
            self.spared.insert(path.to_path_buf());
        }
        true
    }

    fn enqueue(&mut self, path: &Path) {
        if self.queued.insert(path.to_path_buf()) {
            self.to_update.push(path.to_path_buf());
        }
    }

    /// Carries user data over from the stored record with the same id and
    /// takes it out of the orphan set. Returns whether such a record existed.
    pub fn claim(&mut self, track: &mut Track) -> bool {
        self.orphans.remove(&track.id);
        let prior = self
            .current
            .get(&track.path)
            .and_then(|records| records.iter().find(|record| record.id == track.id));
        match prior {
            Some(prior) => {
                track.annotations = prior.annotations.clone();
                track.bookmark = prior.bookmark.clone();
                track.created_at_ms = prior.created_at_ms;
                true
            }
            None => false,
        }
    }

    pub fn take_queue(&mut self) -> Vec<PathBuf> {
        std::mem::take(&mut self.to_update)
    }

    /// Records nobody claimed. Records of files judged up to date or not
    /// inspectable are kept, unless a cue sheet or the file itself queued
    /// them anyway.
    pub fn take_orphans(&mut self) -> Vec<(String, OrphanTrack)> {
        for path in std::mem::take(&mut self.spared) {
            if self.queued.contains(&path) {
                continue;
            }
            if let Some(records) = self.current.get(&path) {
                for record in records {
                    self.orphans.remove(&record.id);
                }
            }
        }
        std::mem::take(&mut self.orphans).into_iter().collect()
    }
}
