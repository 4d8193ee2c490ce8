mod config;

use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use library::{Library, ScanCounters, TagScanner};
use metadata::LoftyExtractor;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use config::{config_path_from_env, load_or_create_config, resolve_music_root, resolve_path};

const USAGE: &str = "usage: library_scan [--full] [--json] [MUSIC_ROOT]";

struct Args {
    full: bool,
    json: bool,
    music_root: Option<PathBuf>,
}

fn parse_args() -> Result<Args, String> {
    let mut args = Args {
        full: false,
        json: false,
        music_root: None,
    };
    for arg in env::args().skip(1) {
        match arg.as_str() {
            "--full" => args.full = true,
            "--json" => args.json = true,
            "-h" | "--help" => return Err(USAGE.to_string()),
            flag if flag.starts_with("--") => {
                return Err(format!("unknown option {}\n{}", flag, USAGE));
            }
            path if args.music_root.is_none() => args.music_root = Some(PathBuf::from(path)),
            _ => return Err(USAGE.to_string()),
        }
    }
    Ok(args)
}

fn print_counters(counters: &ScanCounters, json: bool) -> Result<(), serde_json::Error> {
    if json {
        println!("{}", serde_json::to_string(counters)?);
    } else {
        println!(
            "Added: {}, updated: {}, deleted: {}, playlists: {}",
            counters.added, counters.updated, counters.deleted, counters.playlists
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = parse_args()?;
    let config_path = config_path_from_env();
    let (config, created) = load_or_create_config(&config_path)?;
    if created {
        info!("Wrote default config to {:?}", config_path);
    }

    let music_root = args
        .music_root
        .or_else(|| resolve_music_root(&config_path, &config.music_root))
        .ok_or("music_root not configured and no path argument")?;
    let index_path = resolve_path(&config_path, &config.index_path);

    let library = Library::open(&index_path)?;
    if let Some(admin) = config.admin_user.as_deref() {
        library.add_user(admin, true)?;
    }

    let since = if args.full {
        None
    } else {
        library.last_scan_at(&music_root)?
    };
    match since {
        Some(at) => info!("Scanning {:?} for changes since {:?}", music_root, at),
        None => info!("Running full scan of {:?}", music_root),
    }

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; stopping scan");
            ctrl_c.cancel();
        }
    });

    let (progress_tx, mut progress_rx) = mpsc::channel::<u32>(256);
    let progress = tokio::spawn(async move {
        let mut folders = 0u64;
        let mut files = 0u64;
        while let Some(count) = progress_rx.recv().await {
            folders += 1;
            files += count as u64;
            if folders % 500 == 0 {
                debug!("Walked {} folders, {} audio files", folders, files);
            }
        }
        (folders, files)
    });

    let scanner = TagScanner::new(
        music_root.clone(),
        Arc::new(library.clone()),
        Arc::new(LoftyExtractor),
    )
    .with_options(config.scan_options());

    let started_at = SystemTime::now();
    let result = scanner.scan(since, Some(progress_tx), cancel).await;
    let (folders, files) = progress.await.unwrap_or_default();
    info!("Walked {} folders with {} audio files", folders, files);

    match result {
        Ok(counters) => {
            library.record_scan(&music_root, started_at)?;
            print_counters(&counters, args.json)?;
            let stats = library.stats()?;
            if !args.json {
                println!(
                    "Indexed: {} artists, {} albums, {} tracks",
                    stats.artists, stats.albums, stats.tracks
                );
            }
            Ok(())
        }
        Err(failure) => {
            print_counters(&failure.counters, args.json)?;
            Err(Box::new(failure) as Box<dyn std::error::Error>)
        }
    }
}
