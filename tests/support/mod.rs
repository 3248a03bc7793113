#![allow(dead_code)]

use async_trait::async_trait;
use au_archive::config::{ImportConfig, WorkerConfig};
use au_archive::db::{Actor, Database};
use au_archive::import::{ImportRequest, ImportService, LocationInfo};
use au_archive::jobs::{JobError, JobHandler, JobKind, JobQueue, JobRecord};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tempfile::TempDir;

pub const LOC12: &str = "abcd12345678";

/// Initialize tracing for tests with proper test output handling
pub fn tracing_init() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

pub fn location() -> LocationInfo {
    LocationInfo {
        location_id: "loc-1".to_string(),
        loc12: LOC12.to_string(),
        state: "ny".to_string(),
        location_type: "factory".to_string(),
        short_name: "Mill".to_string(),
    }
}

/// Plain byte copies so results do not depend on the test filesystem
pub fn import_config() -> ImportConfig {
    ImportConfig {
        prefer_hardlink: false,
        allow_clone: false,
        ..ImportConfig::default()
    }
}

/// No backoff, fast polling
pub fn worker_config() -> WorkerConfig {
    WorkerConfig {
        max_workers: 2,
        poll_interval: Duration::from_millis(20),
        max_attempts: 3,
        retry_backoff_base: Duration::ZERO,
        retry_backoff_cap: Duration::ZERO,
    }
}

/// Temp archive, source tree and database
pub struct Fixture {
    pub dir: TempDir,
    pub archive_root: PathBuf,
    pub source: PathBuf,
    pub database: Database,
    pub queue: JobQueue,
}

impl Fixture {
    pub async fn new() -> Self {
        Self::with_worker_config(worker_config()).await
    }

    pub async fn with_worker_config(worker: WorkerConfig) -> Self {
        tracing_init();

        let dir = TempDir::new().unwrap();
        let archive_root = dir.path().join("archive");
        let source = dir.path().join("source");
        std::fs::create_dir_all(&source).unwrap();

        let database = Database::new(&dir.path().join("au-archive.db"))
            .await
            .expect("Failed to create database");
        let queue = JobQueue::new(database.clone(), worker);

        Fixture {
            dir,
            archive_root,
            source,
            database,
            queue,
        }
    }

    pub fn service(&self) -> ImportService {
        ImportService::new(self.database.clone(), self.queue.clone(), import_config())
    }

    /// Write `contents` under the source tree and return the full path
    pub fn write_source(&self, relative: &str, contents: &[u8]) -> PathBuf {
        let path = self.source.join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, contents).unwrap();
        path
    }

    pub fn request(&self, paths: Vec<PathBuf>) -> ImportRequest {
        ImportRequest {
            paths,
            location: location(),
            actor: Actor {
                id: Some("user-1".to_string()),
                name: Some("Tester".to_string()),
            },
            archive_root: self.archive_root.clone(),
            allowed_extensions: None,
        }
    }

    /// Every regular file under `locations/`, relative to the archive root
    pub fn archived_files(&self) -> Vec<String> {
        let mut found = Vec::new();
        collect_files(&self.archive_root, &self.archive_root.join("locations"), &mut found);
        found.sort();
        found
    }
}

fn collect_files(root: &Path, dir: &Path, found: &mut Vec<String>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries {
        let path = entry.unwrap().path();
        if path.is_dir() {
            collect_files(root, &path, found);
        } else {
            let relative = path.strip_prefix(root).unwrap();
            found.push(relative.to_string_lossy().replace('\\', "/"));
        }
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    hex::encode(Sha256::digest(bytes))
}

/// Succeeds and remembers every job it saw, in order
#[derive(Default)]
pub struct RecordingHandler {
    pub seen: Mutex<Vec<JobRecord>>,
}

impl RecordingHandler {
    pub fn kinds(&self) -> Vec<JobKind> {
        self.seen.lock().unwrap().iter().map(|job| job.kind()).collect()
    }
}

#[async_trait]
impl JobHandler for RecordingHandler {
    async fn handle(&self, job: &JobRecord) -> Result<(), JobError> {
        self.seen.lock().unwrap().push(job.clone());
        Ok(())
    }
}

/// Fails every job of the listed kinds, succeeds otherwise
pub struct FailingHandler {
    pub fail: HashSet<JobKind>,
    pub calls: Mutex<Vec<JobKind>>,
}

impl FailingHandler {
    pub fn new(fail: &[JobKind]) -> Self {
        FailingHandler {
            fail: fail.iter().copied().collect(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls_for(&self, kind: JobKind) -> usize {
        self.calls.lock().unwrap().iter().filter(|k| **k == kind).count()
    }
}

#[async_trait]
impl JobHandler for FailingHandler {
    async fn handle(&self, job: &JobRecord) -> Result<(), JobError> {
        self.calls.lock().unwrap().push(job.kind());
        if self.fail.contains(&job.kind()) {
            return Err(JobError::Handler(format!("{} exploded", job.kind())));
        }
        Ok(())
    }
}

pub struct PanickingHandler;

#[async_trait]
impl JobHandler for PanickingHandler {
    async fn handle(&self, _job: &JobRecord) -> Result<(), JobError> {
        panic!("handler bug");
    }
}
