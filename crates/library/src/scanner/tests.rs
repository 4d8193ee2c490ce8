use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use common::{album_id, artist_id, Track, NO_SUB_TRACK};
use metadata::{Extractor, MetadataError, TagInfo};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{
    folder_has_changed, CueSource, CueSupport, FolderSummary, ScanCounters, ScanOptions,
    TagScanner,
};
use crate::{Catalog, Library, LibraryError, PlaylistImporter};

const ALBUM_CUE: &str = "PERFORMER \"Boards of Canada\"
TITLE \"Side A\"
FILE \"side.flac\" WAVE
  TRACK 01 AUDIO
    TITLE \"One\"
    INDEX 01 00:00:00
  TRACK 02 AUDIO
    TITLE \"Two\"
    INDEX 01 02:00:00
  TRACK 03 AUDIO
    TITLE \"Three\"
    INDEX 01 05:30:00
";

/// Tags derived from the file name: title from the stem, album from the
/// parent directory.
#[derive(Default)]
struct FakeExtractor {
    durations: HashMap<String, f64>,
    embedded_cues: HashMap<String, String>,
}

impl FakeExtractor {
    fn with_duration(mut self, file_name: &str, secs: f64) -> Self {
        self.durations.insert(file_name.to_string(), secs);
        self
    }

    fn with_embedded_cue(mut self, file_name: &str, sheet: &str) -> Self {
        self.embedded_cues
            .insert(file_name.to_string(), sheet.to_string());
        self
    }
}

impl Extractor for FakeExtractor {
    fn extract(&self, paths: &[PathBuf]) -> Result<Vec<TagInfo>, MetadataError> {
        let mut out = Vec::new();
        for path in paths {
            let Ok(meta) = fs::metadata(path) else {
                continue;
            };
            let name = path.file_name().unwrap().to_string_lossy().to_string();
            let mut info = TagInfo::for_path(path);
            info.file_size = meta.len();
            info.title = path.file_stem().map(|s| s.to_string_lossy().to_string());
            info.album = path
                .parent()
                .and_then(|p| p.file_name())
                .map(|s| s.to_string_lossy().to_string());
            info.artist = Some("Artist".to_string());
            info.duration_secs = self.durations.get(&name).copied().unwrap_or(180.0);
            info.cue_sheet = self.embedded_cues.get(&name).cloned();
            out.push(info);
        }
        Ok(out)
    }
}

/// Wraps the real catalog, recording refreshes and failing chosen writes.
struct TestCatalog {
    inner: Library,
    album_refreshes: Mutex<Vec<String>>,
    artist_refreshes: Mutex<Vec<String>>,
    fail_put_for: Mutex<Option<String>>,
}

impl TestCatalog {
    fn new(inner: Library) -> Self {
        Self {
            inner,
            album_refreshes: Mutex::new(Vec::new()),
            artist_refreshes: Mutex::new(Vec::new()),
            fail_put_for: Mutex::new(None),
        }
    }

    fn fail_puts_of(&self, file_name: Option<&str>) {
        *self.fail_put_for.lock() = file_name.map(str::to_string);
    }

    fn clear_refreshes(&self) {
        self.album_refreshes.lock().clear();
        self.artist_refreshes.lock().clear();
    }

    fn album_refresh_count(&self, id: &str) -> usize {
        self.album_refreshes.lock().iter().filter(|known| *known == id).count()
    }

    fn artist_refresh_count(&self, id: &str) -> usize {
        self.artist_refreshes.lock().iter().filter(|known| *known == id).count()
    }
}

impl Catalog for TestCatalog {
    fn get_track(&self, id: &str) -> Result<Option<Track>, LibraryError> {
        self.inner.get_track(id)
    }

    fn put_track(&self, track: &Track) -> Result<(), LibraryError> {
        let name = track
            .path
            .file_name()
            .map(|s| s.to_string_lossy().to_string());
        if name.is_some() && *self.fail_put_for.lock() == name {
            return Err(LibraryError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "injected write failure",
            )));
        }
        self.inner.put_track(track)
    }

    fn delete_track(&self, id: &str) -> Result<(), LibraryError> {
        self.inner.delete_track(id)
    }

    fn find_tracks_in_dir(&self, dir: &Path) -> Result<Vec<Track>, LibraryError> {
        self.inner.find_tracks_in_dir(dir)
    }

    fn find_dirs_recursively(&self, root: &Path) -> Result<Vec<PathBuf>, LibraryError> {
        self.inner.find_dirs_recursively(root)
    }

    fn delete_tracks_in_dir(&self, dir: &Path) -> Result<usize, LibraryError> {
        self.inner.delete_tracks_in_dir(dir)
    }

    fn refresh_albums(&self, ids: &[String]) -> Result<(), LibraryError> {
        self.album_refreshes.lock().extend(ids.iter().cloned());
        self.inner.refresh_albums(ids)
    }

    fn refresh_artists(&self, ids: &[String]) -> Result<(), LibraryError> {
        self.artist_refreshes.lock().extend(ids.iter().cloned());
        self.inner.refresh_artists(ids)
    }

    fn gc(&self, root: &Path) -> Result<(), LibraryError> {
        self.inner.gc(root)
    }

    fn has_admin_user(&self) -> Result<bool, LibraryError> {
        self.inner.has_admin_user()
    }
}

#[derive(Default)]
struct CountingImporter {
    dirs: Mutex<Vec<PathBuf>>,
}

impl PlaylistImporter for CountingImporter {
    fn process_playlists(&self, dir: &Path) -> usize {
        self.dirs.lock().push(dir.to_path_buf());
        2
    }
}

struct Fixture {
    _tmp: tempfile::TempDir,
    root: PathBuf,
    library: Library,
    catalog: Arc<TestCatalog>,
}

impl Fixture {
    fn new() -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("music");
        fs::create_dir_all(&root).unwrap();
        let library = Library::open(&tmp.path().join("db/library.redb")).unwrap();
        let catalog = Arc::new(TestCatalog::new(library.clone()));
        Self {
            _tmp: tmp,
            root,
            library,
            catalog,
        }
    }

    fn scanner(&self, extractor: FakeExtractor) -> TagScanner {
        TagScanner::new(self.root.clone(), self.catalog.clone(), Arc::new(extractor))
    }

    fn file(&self, rel: &str) -> PathBuf {
        let path = self.root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, rel.as_bytes()).unwrap();
        path
    }

    fn tracks_in(&self, rel: &str) -> Vec<Track> {
        let mut tracks = self.library.find_tracks_in_dir(&self.root.join(rel)).unwrap();
        tracks.sort_by(|a, b| a.path.cmp(&b.path).then(a.sub_track.cmp(&b.sub_track)));
        tracks
    }
}

async fn run(scanner: &TagScanner, since: Option<SystemTime>) -> ScanCounters {
    scanner
        .scan(since, None, CancellationToken::new())
        .await
        .unwrap()
}

/// Moves a file's modification time into the future.
fn touch_later(path: &Path) {
    let later = SystemTime::now() + Duration::from_secs(120);
    File::options()
        .write(true)
        .open(path)
        .unwrap()
        .set_modified(later)
        .unwrap();
}

/// Lets the filesystem clock move past the last recorded time.
fn settle() {
    std::thread::sleep(Duration::from_millis(50));
}

fn counters(added: u64, updated: u64, deleted: u64) -> ScanCounters {
    ScanCounters {
        added,
        updated,
        deleted,
        playlists: 0,
    }
}

#[test]
fn changed_when_unknown_with_audio_or_modified() {
    let since = SystemTime::now();
    let folder = |path: &str, audio_files: u32, modified: SystemTime| FolderSummary {
        path: PathBuf::from(path),
        audio_files,
        modified,
        has_playlist: false,
    };
    let known: HashSet<PathBuf> = [PathBuf::from("/m/known")].into_iter().collect();
    let before = since - Duration::from_secs(60);
    let after = since + Duration::from_secs(60);

    assert!(folder_has_changed(&folder("/m/new", 1, before), &known, Some(since)));
    assert!(!folder_has_changed(&folder("/m/new", 0, before), &known, Some(since)));
    assert!(!folder_has_changed(&folder("/m/known", 3, before), &known, Some(since)));
    assert!(!folder_has_changed(&folder("/m/known", 0, since), &known, Some(since)));
    assert!(folder_has_changed(&folder("/m/known", 0, after), &known, Some(since)));
    assert!(folder_has_changed(&folder("/m/known", 3, before), &known, None));
}

#[test]
fn parses_cue_support_modes() {
    let parse = |text: &str| text.parse::<CueSupport>().unwrap();
    assert!(parse("disabled").modes().is_empty());
    assert_eq!(
        parse("prefer-external").modes(),
        &[CueSource::External, CueSource::Embedded]
    );
    assert_eq!(parse("external").modes(), &[CueSource::External]);
    assert!(parse("external").is_external_only());
    assert_eq!(
        parse(" Embedded , external,embedded").modes(),
        &[CueSource::Embedded, CueSource::External]
    );
    assert!("sidecar".parse::<CueSupport>().is_err());
    assert_eq!(CueSupport::default().to_string(), "prefer-embedded");
}

#[tokio::test]
async fn first_pass_adds_and_second_pass_is_idle() {
    let fx = Fixture::new();
    fx.file("Artist/Album/01.mp3");
    fx.file("Artist/Album/02.mp3");
    fx.file("Other/03.flac");
    let scanner = fx.scanner(FakeExtractor::default());

    let first = run(&scanner, Some(SystemTime::UNIX_EPOCH)).await;
    assert_eq!(first, counters(3, 0, 0));
    let stats = fx.library.stats().unwrap();
    assert_eq!((stats.tracks, stats.albums, stats.artists), (3, 2, 1));

    let since = SystemTime::now();
    let second = run(&scanner, Some(since)).await;
    assert_eq!(second, counters(0, 0, 0));
    assert_eq!(second.total(), 0);
}

#[tokio::test]
async fn removed_file_is_deleted_and_album_refreshed_once() {
    let fx = Fixture::new();
    fx.file("D/a.mp3");
    let b = fx.file("D/b.mp3");
    let scanner = fx.scanner(FakeExtractor::default());
    run(&scanner, None).await;

    let since = SystemTime::now();
    settle();
    fs::remove_file(&b).unwrap();
    fx.catalog.clear_refreshes();

    let result = run(&scanner, Some(since)).await;
    assert_eq!(result, counters(0, 0, 1));

    let album = album_id("Artist", "D");
    assert_eq!(fx.catalog.album_refresh_count(&album), 1);
    assert_eq!(fx.catalog.artist_refresh_count(&artist_id("Artist")), 1);
    assert_eq!(fx.library.get_album(&album).unwrap().unwrap().song_count, 1);
    assert_eq!(fx.tracks_in("D").len(), 1);
}

#[tokio::test]
async fn newer_file_is_updated_not_deleted() {
    let fx = Fixture::new();
    let a = fx.file("D/a.mp3");
    let scanner = fx.scanner(FakeExtractor::default());
    run(&scanner, None).await;

    let since = SystemTime::now();
    touch_later(&a);
    let result = run(&scanner, Some(since)).await;
    assert_eq!(result, counters(0, 1, 0));
    assert_eq!(fx.tracks_in("D").len(), 1);
}

#[tokio::test]
async fn removed_directory_is_purged() {
    let fx = Fixture::new();
    fx.file("Gone/1.mp3");
    fx.file("Gone/2.mp3");
    fx.file("Kept/1.mp3");
    let scanner = fx.scanner(FakeExtractor::default());
    run(&scanner, None).await;

    let since = SystemTime::now();
    settle();
    fs::remove_dir_all(fx.root.join("Gone")).unwrap();
    let result = run(&scanner, Some(since)).await;
    assert_eq!(result, counters(0, 0, 2));

    let stats = fx.library.stats().unwrap();
    assert_eq!((stats.tracks, stats.albums), (1, 1));
    assert!(fx
        .library
        .get_album(&album_id("Artist", "Gone"))
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn empty_root_leaves_catalog_alone() {
    let fx = Fixture::new();
    fx.file("D/a.mp3");
    let scanner = fx.scanner(FakeExtractor::default());
    run(&scanner, None).await;

    fs::remove_dir_all(fx.root.join("D")).unwrap();
    let result = run(&scanner, Some(SystemTime::UNIX_EPOCH)).await;
    assert_eq!(result, ScanCounters::default());
    assert_eq!(fx.library.stats().unwrap().tracks, 1);
}

#[tokio::test]
async fn external_cue_splits_file_into_sub_tracks() {
    let fx = Fixture::new();
    let media = fx.file("Cue/side.flac");
    fs::write(fx.root.join("Cue/album.cue"), ALBUM_CUE).unwrap();
    let scanner = fx.scanner(FakeExtractor::default().with_duration("side.flac", 600.0));

    let result = run(&scanner, None).await;
    assert_eq!(result, counters(3, 0, 0));

    let tracks = fx.tracks_in("Cue");
    assert_eq!(tracks.len(), 3);
    let subs: Vec<i32> = tracks.iter().map(|t| t.sub_track).collect();
    assert_eq!(subs, vec![0, 1, 2]);
    assert!(tracks.windows(2).all(|w| w[0].offset_secs < w[1].offset_secs));
    assert!(tracks.iter().map(|t| t.duration_secs).sum::<f64>() <= 600.0);
    assert!(tracks.iter().all(|t| t.path == media));
    assert_eq!(tracks[1].title, "Two");
    assert_eq!(tracks[1].album, "Side A");
    assert_eq!(tracks[1].album_artist, "Boards of Canada");
}

#[tokio::test]
async fn new_cue_sheet_replaces_whole_file_record() {
    let fx = Fixture::new();
    fx.file("Cue/side.flac");
    let scanner = fx.scanner(FakeExtractor::default().with_duration("side.flac", 600.0));
    run(&scanner, None).await;
    assert_eq!(fx.tracks_in("Cue")[0].sub_track, NO_SUB_TRACK);

    let since = SystemTime::now();
    settle();
    let cue = fx.root.join("Cue/album.cue");
    fs::write(&cue, ALBUM_CUE).unwrap();
    touch_later(&cue);

    let result = run(&scanner, Some(since)).await;
    assert_eq!(result, counters(3, 0, 1));
    assert_eq!(fx.tracks_in("Cue").len(), 3);
}

#[tokio::test]
async fn embedded_cue_is_used_when_enabled() {
    let fx = Fixture::new();
    fx.file("Cue/side.flac");
    let extractor = || {
        FakeExtractor::default()
            .with_duration("side.flac", 600.0)
            .with_embedded_cue("side.flac", ALBUM_CUE)
    };

    let disabled = fx.scanner(extractor()).with_options(ScanOptions {
        cue_support: CueSupport::disabled(),
        ..ScanOptions::default()
    });
    assert_eq!(run(&disabled, None).await, counters(1, 0, 0));

    let embedded = fx.scanner(extractor()).with_options(ScanOptions {
        cue_support: "embedded".parse().unwrap(),
        ..ScanOptions::default()
    });
    assert_eq!(run(&embedded, None).await, counters(3, 0, 1));
    assert_eq!(fx.tracks_in("Cue").len(), 3);
}

#[tokio::test]
async fn annotations_survive_reextraction() {
    let fx = Fixture::new();
    let a = fx.file("D/a.mp3");
    let scanner = fx.scanner(FakeExtractor::default());
    run(&scanner, None).await;

    let stored = fx.tracks_in("D").remove(0);
    fx.library.set_rating(&stored.id, 4).unwrap();
    fx.library.set_starred(&stored.id, true).unwrap();
    fx.library.record_play(&stored.id).unwrap();
    fx.library.set_bookmark(&stored.id, 30_000, "chorus").unwrap();

    let since = SystemTime::now();
    touch_later(&a);
    assert_eq!(run(&scanner, Some(since)).await, counters(0, 1, 0));

    let track = fx.tracks_in("D").remove(0);
    assert_eq!(track.annotations.rating, 4);
    assert!(track.annotations.starred);
    assert_eq!(track.annotations.play_count, 1);
    assert_eq!(track.bookmark.unwrap().comment, "chorus");
    assert_eq!(track.created_at_ms, stored.created_at_ms);
    assert!(track.updated_at_ms >= stored.updated_at_ms);
}

#[tokio::test]
async fn failed_write_keeps_earlier_tracks_and_retries_rest() {
    let fx = Fixture::new();
    fx.file("D/a.mp3");
    fx.file("D/b.mp3");
    fx.file("D/c.mp3");
    let scanner = fx.scanner(FakeExtractor::default());

    fx.catalog.fail_puts_of(Some("b.mp3"));
    let first = run(&scanner, None).await;
    assert_eq!(first, counters(1, 0, 0));
    let names: Vec<String> = fx
        .tracks_in("D")
        .iter()
        .map(|t| t.title.clone())
        .collect();
    assert_eq!(names, vec!["a".to_string()]);

    fx.catalog.fail_puts_of(None);
    let second = run(&scanner, None).await;
    assert_eq!(second, counters(2, 1, 0));
    assert_eq!(fx.tracks_in("D").len(), 3);
}

#[tokio::test]
async fn playlists_need_an_admin_user() {
    let fx = Fixture::new();
    fx.file("Mix/a.mp3");
    fs::write(fx.root.join("Mix/mix.m3u"), b"a.mp3\n").unwrap();
    let importer = Arc::new(CountingImporter::default());
    let scanner = fx
        .scanner(FakeExtractor::default())
        .with_playlists(importer.clone());

    let without_admin = run(&scanner, None).await;
    assert_eq!(without_admin.playlists, 0);
    assert!(importer.dirs.lock().is_empty());

    fx.library.add_user("admin", true).unwrap();
    let with_admin = run(&scanner, None).await;
    assert_eq!(with_admin.playlists, 2);
    assert_eq!(*importer.dirs.lock(), vec![fx.root.join("Mix")]);

    let disabled = fx
        .scanner(FakeExtractor::default())
        .with_playlists(importer.clone())
        .with_options(ScanOptions {
            auto_import_playlists: false,
            ..ScanOptions::default()
        });
    assert_eq!(run(&disabled, None).await.playlists, 0);
}

#[tokio::test]
async fn cancelled_pass_reports_cancelled() {
    let fx = Fixture::new();
    fx.file("D/a.mp3");
    let scanner = fx.scanner(FakeExtractor::default());

    let cancel = CancellationToken::new();
    cancel.cancel();
    let failure = scanner.scan(None, None, cancel).await.unwrap_err();
    assert!(matches!(failure.error, LibraryError::Cancelled));
    assert_eq!(failure.counters, ScanCounters::default());
    assert_eq!(fx.library.stats().unwrap().tracks, 0);
}

#[tokio::test]
async fn progress_reports_each_folder() {
    let fx = Fixture::new();
    fx.file("A/1.mp3");
    fx.file("A/2.mp3");
    fx.file("B/1.mp3");
    let scanner = fx.scanner(FakeExtractor::default());

    let (tx, mut rx) = mpsc::channel(64);
    scanner
        .scan(None, Some(tx), CancellationToken::new())
        .await
        .unwrap();

    let mut counts = Vec::new();
    while let Ok(count) = rx.try_recv() {
        counts.push(count);
    }
    assert_eq!(counts, vec![0, 2, 1]);
}

#[cfg(unix)]
#[tokio::test]
async fn unreadable_folder_fails_pass_and_keeps_tracks() {
    use std::os::unix::fs::PermissionsExt;

    let fx = Fixture::new();
    fx.file("A/1.mp3");
    fx.file("B/1.mp3");
    fx.file("B/2.mp3");
    let scanner = fx.scanner(FakeExtractor::default());
    run(&scanner, None).await;

    let locked = fx.root.join("B");
    fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();
    if fs::read_dir(&locked).is_ok() {
        // Permission bits do not apply to this user (root).
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();
        return;
    }

    let result = scanner
        .scan(Some(SystemTime::now()), None, CancellationToken::new())
        .await;
    fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();

    let failure = result.unwrap_err();
    assert!(matches!(
        failure.error,
        LibraryError::Walk(_) | LibraryError::Io(_)
    ));
    assert_eq!(failure.counters.deleted, 0);
    assert_eq!(fx.tracks_in("B").len(), 2);
}
