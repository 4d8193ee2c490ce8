use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

use crate::LibraryError;

const AUDIO_EXTENSIONS: &[&str] = &[
    "mp3", "flac", "ogg", "oga", "opus", "m4a", "m4b", "mp4", "aac", "alac", "wav", "aif", "aiff",
    "wv", "ape", "wma", "tak", "dsf", "dff", "mpc",
];
const PLAYLIST_EXTENSIONS: &[&str] = &["m3u", "m3u8", "pls", "nsp"];
const CUE_EXTENSION: &str = "cue";

/// What the walker saw in one directory.
#[derive(Clone, Debug, PartialEq)]
pub struct FolderSummary {
    pub path: PathBuf,
    pub audio_files: u32,
    /// Newest modification time of the directory and its direct files.
    pub modified: SystemTime,
    pub has_playlist: bool,
}

pub(super) struct Walker {
    pub folders: mpsc::Receiver<FolderSummary>,
    pub done: oneshot::Receiver<Result<(), LibraryError>>,
}

/// Walks `root` on a blocking thread, streaming one summary per directory.
pub(super) fn spawn_walker(
    root: PathBuf,
    queue: usize,
    progress: Option<mpsc::Sender<u32>>,
    cancel: CancellationToken,
) -> Walker {
    let (folder_tx, folder_rx) = mpsc::channel(queue.max(1));
    let (done_tx, done_rx) = oneshot::channel();
    tokio::task::spawn_blocking(move || {
        let result = walk_dir_tree(&root, &folder_tx, progress.as_ref(), &cancel);
        let _ = done_tx.send(result);
    });
    Walker {
        folders: folder_rx,
        done: done_rx,
    }
}

fn walk_dir_tree(
    root: &Path,
    folders: &mpsc::Sender<FolderSummary>,
    progress: Option<&mpsc::Sender<u32>>,
    cancel: &CancellationToken,
) -> Result<(), LibraryError> {
    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !is_hidden(entry));

    for entry in walker {
        if cancel.is_cancelled() {
            return Err(LibraryError::Cancelled);
        }
        // An unreadable folder must not look deleted, so any failure ends
        // the pass.
        let entry = entry?;
        if !entry.file_type().is_dir() {
            continue;
        }

        let (summary, _) = load_dir(entry.path()).map_err(|err| {
            warn!("Could not read folder {:?}: {}", entry.path(), err);
            err
        })?;

        if let Some(progress) = progress {
            let _ = progress.blocking_send(summary.audio_files);
        }
        if folders.blocking_send(summary).is_err() {
            debug!("Folder receiver dropped; stopping walk of {:?}", root);
            return Ok(());
        }
    }
    Ok(())
}

/// Summarizes the direct children of `dir`. Also returns the number of
/// visible subdirectories.
pub(super) fn load_dir(dir: &Path) -> Result<(FolderSummary, usize), LibraryError> {
    let mut summary = FolderSummary {
        path: dir.to_path_buf(),
        audio_files: 0,
        modified: std::fs::metadata(dir)?.modified().unwrap_or(UNIX_EPOCH),
        has_playlist: false,
    };
    let mut subdirs = 0usize;

    for entry in WalkDir::new(dir)
        .follow_links(false)
        .min_depth(1)
        .max_depth(1)
    {
        let entry = entry?;
        if is_hidden(&entry) {
            continue;
        }
        if entry.file_type().is_dir() {
            subdirs += 1;
            continue;
        }
        let modified = entry.metadata().ok().and_then(|meta| meta.modified().ok());
        if let Some(modified) = modified {
            if modified > summary.modified {
                summary.modified = modified;
            }
        }
        let path = entry.path();
        if entry.file_type().is_file() && is_audio_file(path) {
            summary.audio_files += 1;
        }
        if is_playlist_file(path) {
            summary.has_playlist = true;
        }
    }

    Ok((summary, subdirs))
}

/// True when `dir` has no visible subdirectories and no audio files.
pub(super) fn is_dir_empty(dir: &Path) -> Result<bool, LibraryError> {
    let (summary, subdirs) = load_dir(dir)?;
    Ok(subdirs == 0 && summary.audio_files == 0)
}

/// Visible audio files of `dir`, plus cue sheets when `with_cue` is set.
pub(super) fn list_media_files(dir: &Path, with_cue: bool) -> Result<Vec<PathBuf>, LibraryError> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir)
        .follow_links(false)
        .sort_by_file_name()
        .min_depth(1)
        .max_depth(1)
    {
        let entry = entry?;
        if is_hidden(&entry) || entry.file_type().is_dir() {
            continue;
        }
        let path = entry.path();
        if is_audio_file(path) || (with_cue && is_cue_file(path)) {
            files.push(path.to_path_buf());
        }
    }
    Ok(files)
}

pub fn is_audio_file(path: &Path) -> bool {
    has_extension(path, AUDIO_EXTENSIONS)
}

pub fn is_playlist_file(path: &Path) -> bool {
    has_extension(path, PLAYLIST_EXTENSIONS)
}

pub fn is_cue_file(path: &Path) -> bool {
    has_extension(path, &[CUE_EXTENSION])
}

fn has_extension(path: &Path, known: &[&str]) -> bool {
    match path.extension() {
        Some(ext) => {
            let ext = ext.to_string_lossy();
            known.iter().any(|candidate| ext.eq_ignore_ascii_case(candidate))
        }
        None => false,
    }
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .map(|name| name.starts_with('.'))
        .unwrap_or(false)
}
