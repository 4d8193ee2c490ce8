use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use library::{CueSupport, ScanOptions};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub music_root: String,
    pub index_path: String,
    pub cue_sheet_support: CueSupport,
    pub auto_import_playlists: bool,
    pub batch_size: usize,
    pub walk_queue: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_user: Option<String>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        let options = ScanOptions::default();
        Self {
            music_root: "".to_string(),
            index_path: "library.redb".to_string(),
            cue_sheet_support: options.cue_support,
            auto_import_playlists: options.auto_import_playlists,
            batch_size: options.batch_size,
            walk_queue: options.walk_queue,
            admin_user: None,
        }
    }
}

impl ScanConfig {
    pub fn scan_options(&self) -> ScanOptions {
        ScanOptions {
            cue_support: self.cue_sheet_support.clone(),
            auto_import_playlists: self.auto_import_playlists,
            batch_size: self.batch_size,
            walk_queue: self.walk_queue,
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Yaml(serde_yaml::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(err) => write!(f, "io error: {}", err),
            ConfigError::Yaml(err) => write!(f, "yaml error: {}", err),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::Io(err)
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        ConfigError::Yaml(err)
    }
}

pub fn config_path_from_env() -> PathBuf {
    match env::var("LIBRARY_SCAN_CONFIG") {
        Ok(value) if !value.trim().is_empty() => PathBuf::from(value),
        _ => default_config_path(),
    }
}

fn default_config_path() -> PathBuf {
    match env::current_exe() {
        Ok(exe) => exe
            .parent()
            .map(|dir| dir.join("config.yaml"))
            .unwrap_or_else(|| PathBuf::from("config.yaml")),
        Err(_) => PathBuf::from("config.yaml"),
    }
}

pub fn load_or_create_config(path: &Path) -> Result<(ScanConfig, bool), ConfigError> {
    if path.exists() {
        let contents = fs::read_to_string(path)?;
        let mut config: ScanConfig = serde_yaml::from_str(&contents)?;
        if config.index_path.trim().is_empty() {
            config.index_path = "library.redb".to_string();
        }
        if config.batch_size == 0 {
            config.batch_size = ScanOptions::default().batch_size;
        }
        if config.walk_queue == 0 {
            config.walk_queue = ScanOptions::default().walk_queue;
        }
        if let Some(admin) = &config.admin_user {
            if admin.trim().is_empty() {
                config.admin_user = None;
            }
        }
        return Ok((config, false));
    }

    let config = ScanConfig::default();
    save_config(path, &config)?;
    Ok((config, true))
}

pub fn save_config(path: &Path, config: &ScanConfig) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let contents = serde_yaml::to_string(config)?;
    fs::write(path, contents)?;
    Ok(())
}

pub fn resolve_path(config_path: &Path, value: &str) -> PathBuf {
    let raw = PathBuf::from(value);
    if raw.is_absolute() {
        return raw;
    }
    let base = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    base.join(raw)
}

pub fn resolve_music_root(config_path: &Path, value: &str) -> Option<PathBuf> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(resolve_path(config_path, trimmed))
    }
}

#[cfg(test)]
mod tests {
    use super::{load_or_create_config, resolve_music_root, resolve_path, ScanConfig};
    use library::CueSupport;
    use std::fs;
    use std::path::{Path, PathBuf};

    #[test]
    fn creates_default_config_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf/config.yaml");
        let (config, created) = load_or_create_config(&path).unwrap();
        assert!(created);
        assert!(path.exists());
        assert_eq!(config.cue_sheet_support, CueSupport::default());

        let (again, created) = load_or_create_config(&path).unwrap();
        assert!(!created);
        assert_eq!(again.index_path, config.index_path);
    }

    #[test]
    fn reads_partial_yaml_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(
            &path,
            "music_root: /srv/music\ncue_sheet_support: external\nbatch_size: 0\nadmin_user: \" \"\n",
        )
        .unwrap();

        let (config, created) = load_or_create_config(&path).unwrap();
        assert!(!created);
        assert_eq!(config.music_root, "/srv/music");
        assert!(config.cue_sheet_support.is_external_only());
        assert_eq!(config.batch_size, ScanConfig::default().batch_size);
        assert!(config.admin_user.is_none());
        assert!(config.scan_options().auto_import_playlists);
    }

    #[test]
    fn rejects_unknown_cue_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "cue_sheet_support: sidecar\n").unwrap();
        assert!(load_or_create_config(&path).is_err());
    }

    #[test]
    fn resolves_relative_paths_against_config_dir() {
        let config_path = Path::new("/etc/scan/config.yaml");
        assert_eq!(
            resolve_path(config_path, "library.redb"),
            PathBuf::from("/etc/scan/library.redb")
        );
        assert_eq!(resolve_path(config_path, "/abs/db"), PathBuf::from("/abs/db"));
        assert_eq!(
            resolve_path(Path::new("config.yaml"), "db"),
            PathBuf::from("./db")
        );
        assert!(resolve_music_root(config_path, "  ").is_none());
    }
}
