use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

const APP_DIR: &str = "@au-archive";
const APP_SUBDIR: &str = "desktop";
const DATABASE_FILE: &str = "au-archive.db";

/// Derived-asset directories kept at the root of the archive
pub const SUPPORT_DIRS: &[&str] = &[".thumbnails", ".previews", ".posters"];

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("No platform config directory available; set AU_ARCHIVE_CONFIG_DIR")]
    NoConfigDir,
    #[error("Archive root is not configured; set AU_ARCHIVE_ROOT")]
    MissingArchiveRoot,
}

/// Application configuration
/// In debug builds: loads .env first, then reads AU_ARCHIVE_* variables
/// In release builds: reads AU_ARCHIVE_* variables only
#[derive(Clone, Debug)]
pub struct Config {
    /// Root of the per-user config tree (database, backups, config.json)
    pub config_dir: PathBuf,
    /// SQLite metadata store
    pub database_path: PathBuf,
    /// Archive root under which `locations/` is created
    pub archive_root: Option<PathBuf>,
    pub import: ImportConfig,
    pub worker: WorkerConfig,
}

/// Knobs for the import pipeline
#[derive(Clone, Debug)]
pub struct ImportConfig {
    /// Files hashed concurrently
    pub hash_workers: usize,
    /// Files copied concurrently
    pub copy_workers: usize,
    /// Use hardlinks when source and archive share a device
    pub prefer_hardlink: bool,
    /// Try a copy-on-write clone before falling back to a byte copy
    pub allow_clone: bool,
    /// Temp files younger than this are left alone by the sweep
    pub temp_file_grace: Duration,
    /// Capacity of the progress channel handed to callers
    pub progress_buffer: usize,
}

impl Default for ImportConfig {
    fn default() -> Self {
        ImportConfig {
            hash_workers: 4,
            copy_workers: 2,
            prefer_hardlink: true,
            allow_clone: true,
            temp_file_grace: Duration::from_secs(60 * 60),
            progress_buffer: 256,
        }
    }
}

/// Knobs for the background job worker
#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub max_workers: usize,
    pub poll_interval: Duration,
    pub max_attempts: i64,
    pub retry_backoff_base: Duration,
    pub retry_backoff_cap: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            max_workers: 2,
            poll_interval: Duration::from_millis(1000),
            max_attempts: 3,
            retry_backoff_base: Duration::from_secs(2),
            retry_backoff_cap: Duration::from_secs(300),
        }
    }
}

impl Config {
    /// Load configuration based on build mode
    pub fn load() -> Result<Self, ConfigError> {
        #[cfg(debug_assertions)]
        {
            if dotenvy::dotenv().is_ok() {
                info!("Dev mode activated - loaded .env file");
            }
        }

        Self::from_env()
    }

    /// Read configuration from AU_ARCHIVE_* environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let config_dir = match std::env::var("AU_ARCHIVE_CONFIG_DIR") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => default_config_dir()?,
        };

        let database_path = std::env::var("AU_ARCHIVE_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir.join("data").join(DATABASE_FILE));

        let archive_root = std::env::var("AU_ARCHIVE_ROOT").ok().map(PathBuf::from);

        let import_defaults = ImportConfig::default();
        let import = ImportConfig {
            hash_workers: env_or("AU_ARCHIVE_HASH_WORKERS", import_defaults.hash_workers).max(1),
            copy_workers: env_or("AU_ARCHIVE_COPY_WORKERS", import_defaults.copy_workers).max(1),
            prefer_hardlink: env_or("AU_ARCHIVE_PREFER_HARDLINK", import_defaults.prefer_hardlink),
            allow_clone: env_or("AU_ARCHIVE_ALLOW_CLONE", import_defaults.allow_clone),
            ..import_defaults
        };

        let worker_defaults = WorkerConfig::default();
        let worker = WorkerConfig {
            max_workers: env_or("AU_ARCHIVE_JOB_WORKERS", worker_defaults.max_workers).max(1),
            poll_interval: Duration::from_millis(env_or(
                "AU_ARCHIVE_JOB_POLL_MS",
                worker_defaults.poll_interval.as_millis() as u64,
            )),
            max_attempts: env_or("AU_ARCHIVE_JOB_MAX_ATTEMPTS", worker_defaults.max_attempts).max(1),
            ..worker_defaults
        };

        info!(
            "Config: database at {}, archive root {:?}",
            database_path.display(),
            archive_root
        );

        Ok(Self {
            config_dir,
            database_path,
            archive_root,
            import,
            worker,
        })
    }

    /// Archive root, required before any import can start
    pub fn require_archive_root(&self) -> Result<&PathBuf, ConfigError> {
        self.archive_root
            .as_ref()
            .ok_or(ConfigError::MissingArchiveRoot)
    }

    /// Bootstrap config file written by the desktop shell
    pub fn bootstrap_config_path(&self) -> PathBuf {
        self.config_dir.join("config.json")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.config_dir.join("data")
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.config_dir.join("backups")
    }
}

/// `<platform config dir>/@au-archive/desktop`
///
/// Windows resolves to %APPDATA%, macOS to ~/Library/Application Support,
/// Linux to $XDG_CONFIG_HOME or ~/.config.
pub fn default_config_dir() -> Result<PathBuf, ConfigError> {
    dirs::config_dir()
        .map(|dir| dir.join(APP_DIR).join(APP_SUBDIR))
        .ok_or(ConfigError::NoConfigDir)
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse::<T>() {
            Ok(value) => value,
            Err(_) => {
                warn!("Config: ignoring unparseable {}={:?}", key, raw);
                default
            }
        },
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_or_falls_back_on_garbage() {
        std::env::set_var("AU_ARCHIVE_TEST_GARBAGE", "not-a-number");
        assert_eq!(env_or("AU_ARCHIVE_TEST_GARBAGE", 7usize), 7);
        std::env::remove_var("AU_ARCHIVE_TEST_GARBAGE");
    }

    #[test]
    fn test_env_or_parses_bool() {
        std::env::set_var("AU_ARCHIVE_TEST_BOOL", "false");
        assert!(!env_or("AU_ARCHIVE_TEST_BOOL", true));
        std::env::remove_var("AU_ARCHIVE_TEST_BOOL");
    }

    #[test]
    fn test_default_paths_hang_off_config_dir() {
        let config = Config {
            config_dir: PathBuf::from("/cfg"),
            database_path: PathBuf::from("/cfg/data/au-archive.db"),
            archive_root: None,
            import: ImportConfig::default(),
            worker: WorkerConfig::default(),
        };
        assert_eq!(config.backups_dir(), PathBuf::from("/cfg/backups"));
        assert_eq!(config.bootstrap_config_path(), PathBuf::from("/cfg/config.json"));
        assert!(matches!(
            config.require_archive_root(),
            Err(ConfigError::MissingArchiveRoot)
        ));
    }
}
