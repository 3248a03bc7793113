//! Import orchestration: Scan → Hash → Copy → Validate → Finalize.
//!
//! One batch at a time per call. Per-file failures never stop the batch;
//! batch-fatal errors return `Err` and leave no trace in the database.
//! Cancellation is honored between stages and inside the scan, hash and
//! copy stages. After copy, files this batch created are removed unless a
//! database row references them.

use crate::config::ImportConfig;
use crate::db::Database;
use crate::import::copier::{self, CopyOptions};
use crate::import::finalizer::finalize_files;
use crate::import::hasher::hash_files;
use crate::import::paths;
use crate::import::progress::ProgressReporter;
use crate::import::scanner::{self, ScanOutput};
use crate::import::types::*;
use crate::import::validator::{self, SuppressionRule};
use crate::jobs::JobQueue;
use std::path::Path;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Sent after a batch commits, for collaborators such as backups
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostImportEvent {
    BatchCommitted {
        import_id: String,
        location_id: String,
        imported: usize,
    },
}

/// A batch running in the background
pub struct RunningImport {
    pub progress: ReceiverStream<ImportProgress>,
    pub cancel: CancellationToken,
    pub handle: JoinHandle<Result<ImportResult, ImportError>>,
}

impl RunningImport {
    /// Wait for the batch, ignoring any unread progress
    pub async fn wait(self) -> Result<ImportResult, ImportError> {
        self.handle.await?
    }
}

#[derive(Clone)]
pub struct ImportService {
    database: Database,
    queue: JobQueue,
    config: ImportConfig,
    rules: Vec<SuppressionRule>,
    post_import: Option<mpsc::Sender<PostImportEvent>>,
}

impl ImportService {
    pub fn new(database: Database, queue: JobQueue, config: ImportConfig) -> Self {
        ImportService {
            database,
            queue,
            config,
            rules: validator::default_rules(),
            post_import: None,
        }
    }

    pub fn with_rules(mut self, rules: Vec<SuppressionRule>) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_post_import_events(mut self, tx: mpsc::Sender<PostImportEvent>) -> Self {
        self.post_import = Some(tx);
        self
    }

    /// Spawn a batch. Progress arrives on the returned stream.
    pub fn start(&self, request: ImportRequest) -> RunningImport {
        let (tx, rx) = mpsc::channel(self.config.progress_buffer.max(1));
        let cancel = CancellationToken::new();

        let service = self.clone();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let progress = ProgressReporter::new(tx);
            service.run(request, token, &progress).await
        });

        RunningImport {
            progress: ReceiverStream::new(rx),
            cancel,
            handle,
        }
    }

    /// Run a batch to completion on the current task
    pub async fn run(
        &self,
        request: ImportRequest,
        cancel: CancellationToken,
        progress: &ProgressReporter,
    ) -> Result<ImportResult, ImportError> {
        paths::validate_location(&request.location)?;
        ensure_archive_writable(&request.archive_root).await?;

        info!(
            "Starting import of {} path(s) into {:?} for location {}",
            request.paths.len(),
            request.archive_root,
            request.location.location_id
        );

        let mut timings = StageTimings::default();

        // Scan
        let started = Instant::now();
        let scan = self.scan(&request, &cancel).await?;
        timings.scan = started.elapsed();
        progress.set_total_files(scan.files.len());
        progress.report_files(ImportPhase::Scan, 1, 1, None);

        let ScanOutput {
            files, relations, ..
        } = scan;
        if cancel.is_cancelled() {
            return Ok(cancelled_result(lift_candidates(files), timings));
        }
        if files.is_empty() {
            info!("Nothing to import");
            progress.report(ImportPhase::Finalize, 1.0, None, 0);
            return Ok(ImportResult::from_files(
                BatchOutcome::Completed,
                None,
                &[],
                0,
                timings,
            ));
        }

        // Hash
        let started = Instant::now();
        let hashed = hash_files(
            files,
            &self.database,
            self.config.hash_workers,
            &cancel,
            progress,
        )
        .await?;
        timings.hash = started.elapsed();
        if cancel.is_cancelled() {
            let lifted = hashed.into_iter().map(CopiedFile::uncopied).collect();
            return Ok(cancelled_result(lift_copied(lifted), timings));
        }

        // Copy
        match copier::sweep_stale_temp_files(&request.archive_root, self.config.temp_file_grace)
            .await
        {
            Ok(0) => {}
            Ok(removed) => info!("Swept {} stale temp file(s)", removed),
            Err(e) => warn!("Temp file sweep failed: {}", e),
        }

        let options = CopyOptions {
            workers: self.config.copy_workers,
            prefer_hardlink: self.config.prefer_hardlink,
            allow_clone: self.config.allow_clone,
        };
        let started = Instant::now();
        let copied = copier::copy_files(
            hashed,
            &request.archive_root,
            &request.location,
            &options,
            &cancel,
            progress,
        )
        .await;
        timings.copy = started.elapsed();
        if cancel.is_cancelled() {
            let lifted = lift_copied(copied);
            self.roll_back(&request.archive_root, &lifted).await;
            return Ok(cancelled_result(lifted, timings));
        }

        // Validate
        let started = Instant::now();
        let validated = validator::validate_files(
            copied,
            &request.archive_root,
            &relations,
            &self.rules,
            self.config.hash_workers,
            progress,
        )
        .await;
        timings.validate = started.elapsed();

        // Finalize
        let started = Instant::now();
        let finalized = finalize_files(
            validated.clone(),
            &request.archive_root,
            &relations,
            &self.database,
            &self.queue,
            &request.location,
            &request.actor,
            progress,
        )
        .await;
        timings.finalize = started.elapsed();

        let output = match finalized {
            Ok(output) => output,
            Err(e) => {
                error!("Finalize failed, rolling back batch: {}", e);
                let lifted: Vec<FinalizedFile> =
                    validated.into_iter().map(FinalizedFile::unfinalized).collect();
                self.roll_back(&request.archive_root, &lifted).await;
                return Err(e);
            }
        };

        let files = output.files;
        self.roll_back(&request.archive_root, &files).await;

        let result = ImportResult::from_files(
            BatchOutcome::Completed,
            Some(output.import_id.clone()),
            &files,
            output.jobs_enqueued,
            timings,
        );

        self.publish_committed(&output.import_id, &request.location, result.total_imported);

        info!(
            "Import {} finished: {} imported, {} duplicate(s), {} error(s), {} bytes in {:?}",
            output.import_id,
            result.total_imported,
            result.total_duplicates,
            result.total_errors,
            result.total_bytes_copied,
            result.timings
        );
        if progress.dropped() > 0 {
            debug!("{} progress update(s) dropped", progress.dropped());
        }

        Ok(result)
    }

    async fn scan(
        &self,
        request: &ImportRequest,
        cancel: &CancellationToken,
    ) -> Result<ScanOutput, ImportError> {
        let paths = request.paths.clone();
        let allowed = request
            .allowed_extensions
            .clone()
            .unwrap_or_else(scanner::default_allowed_extensions);
        let token = cancel.clone();

        let output =
            tokio::task::spawn_blocking(move || scanner::scan_paths(&paths, &allowed, &token))
                .await?;
        Ok(output)
    }

    /// Remove copies this batch created that no row references: unrecorded
    /// files, failed validations, and everything when the batch did not commit.
    /// A destination that already existed belongs to whoever created it.
    async fn roll_back(&self, archive_root: &Path, files: &[FinalizedFile]) {
        for file in files {
            if file.record_id.is_some() || !file.created {
                continue;
            }
            let Some(archive_path) = file.archive_path.as_deref() else {
                continue;
            };
            if let Err(e) = self.remove_unreferenced(archive_root, archive_path).await {
                warn!("Leaving {} in place, rollback failed: {}", archive_path, e);
            }
        }
    }

    /// Check and unlink under the write lock, so a concurrent finalize either
    /// commits its row first or finds the file gone.
    async fn remove_unreferenced(
        &self,
        archive_root: &Path,
        archive_path: &str,
    ) -> Result<(), ImportError> {
        let mut conn = self.database.acquire_write_lock().await?;
        let outcome = match Database::is_archive_path_referenced(&mut conn, archive_path).await {
            Ok(true) => Ok(()),
            Ok(false) => copier::remove_copied_file(archive_root, archive_path)
                .await
                .map_err(ImportError::from),
            Err(e) => Err(ImportError::from(e)),
        };
        Database::release_write_lock(conn).await;
        outcome
    }

    fn publish_committed(&self, import_id: &str, location: &LocationInfo, imported: usize) {
        let Some(tx) = &self.post_import else {
            return;
        };
        let event = PostImportEvent::BatchCommitted {
            import_id: import_id.to_string(),
            location_id: location.location_id.clone(),
            imported,
        };
        if let Err(e) = tx.try_send(event) {
            warn!("Post-import event not delivered: {}", e);
        }
    }
}

/// Create the archive root if needed and prove it accepts writes
async fn ensure_archive_writable(archive_root: &Path) -> Result<(), ImportError> {
    if archive_root.as_os_str().is_empty() {
        return Err(ImportError::MissingArchiveRoot);
    }
    let not_writable = |reason: String| ImportError::ArchiveNotWritable {
        path: archive_root.to_path_buf(),
        reason,
    };

    tokio::fs::create_dir_all(archive_root)
        .await
        .map_err(|e| not_writable(e.to_string()))?;

    let probe = archive_root.join(format!(".au-write-probe-{}", Uuid::new_v4()));
    tokio::fs::write(&probe, b"probe")
        .await
        .map_err(|e| not_writable(e.to_string()))?;
    if let Err(e) = tokio::fs::remove_file(&probe).await {
        warn!("Failed to remove write probe {:?}: {}", probe, e);
    }
    Ok(())
}

fn lift_candidates(files: Vec<CandidateFile>) -> Vec<FinalizedFile> {
    let copied = files
        .into_iter()
        .map(|file| CopiedFile::uncopied(HashedFile::not_started(file)))
        .collect();
    lift_copied(copied)
}

fn lift_copied(files: Vec<CopiedFile>) -> Vec<FinalizedFile> {
    files
        .into_iter()
        .map(|file| FinalizedFile::unfinalized(ValidatedFile::unvalidated(file)))
        .collect()
}

fn cancelled_result(files: Vec<FinalizedFile>, timings: StageTimings) -> ImportResult {
    info!("Import cancelled, {} file(s) not committed", files.len());
    ImportResult::from_files(BatchOutcome::Cancelled, None, &files, 0, timings)
}
