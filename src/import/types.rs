use crate::db::{Actor, MediaType, RelationKind};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::ops::Deref;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// At most this many per-file error messages are carried in an `ImportResult`
pub const MAX_REPORTED_ERRORS: usize = 100;

pub(crate) const NOT_STARTED: &str = "Import cancelled before this file was processed";

/// Batch-fatal failures. Per-file problems never surface here; they are
/// recorded on the file and summarized in `ImportResult`.
#[derive(Error, Debug)]
pub enum ImportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Job queue error: {0}")]
    Jobs(#[from] crate::jobs::JobError),
    #[error("Invalid location: {0}")]
    InvalidLocation(String),
    #[error("Archive root is not set")]
    MissingArchiveRoot,
    #[error("Archive root {path:?} is not writable: {reason}")]
    ArchiveNotWritable { path: PathBuf, reason: String },
    #[error("Import task failed: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
}

/// Location the batch is filed under. Supplied by the caller, read-only here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationInfo {
    pub location_id: String,
    /// 12-character short id used in folder names
    pub loc12: String,
    /// State code, upper-cased in paths
    pub state: String,
    pub location_type: String,
    pub short_name: String,
}

/// Everything needed to run one import batch
#[derive(Debug, Clone)]
pub struct ImportRequest {
    /// User-selected files and/or directories
    pub paths: Vec<PathBuf>,
    pub location: LocationInfo,
    pub actor: Actor,
    pub archive_root: PathBuf,
    /// Lower-case extensions without the dot; `None` accepts every known media extension
    pub allowed_extensions: Option<HashSet<String>>,
}

/// A file discovered by the scanner
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateFile {
    /// Absolute source path
    pub path: PathBuf,
    pub filename: String,
    pub size: u64,
    pub media_type: MediaType,
    /// Lower-case, with leading dot (".jpg")
    pub extension: String,
}

/// Two files from the same batch that belong together.
/// Indices point into the scan output and stay valid through every stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileRelation {
    pub primary: usize,
    pub companion: usize,
    pub kind: RelationKind,
}

/// Hasher output
#[derive(Debug, Clone)]
pub struct HashedFile {
    pub file: CandidateFile,
    /// Lower-case hex SHA-256 of the full byte stream
    pub hash: Option<String>,
    pub hash_error: Option<String>,
    pub is_duplicate: bool,
}

impl Deref for HashedFile {
    type Target = CandidateFile;

    fn deref(&self) -> &CandidateFile {
        &self.file
    }
}

impl HashedFile {
    pub(crate) fn not_started(file: CandidateFile) -> Self {
        HashedFile {
            file,
            hash: None,
            hash_error: Some(NOT_STARTED.to_string()),
            is_duplicate: false,
        }
    }

    /// Eligible for the copy stage
    pub fn needs_copy(&self) -> bool {
        self.hash.is_some() && self.hash_error.is_none() && !self.is_duplicate
    }
}

/// How bytes reached the archive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CopyStrategy {
    Hardlink,
    Reflink,
    Copy,
}

impl fmt::Display for CopyStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CopyStrategy::Hardlink => write!(f, "hardlink"),
            CopyStrategy::Reflink => write!(f, "reflink"),
            CopyStrategy::Copy => write!(f, "copy"),
        }
    }
}

/// Copier output
#[derive(Debug, Clone)]
pub struct CopiedFile {
    pub hashed: HashedFile,
    /// Archive-relative destination; `None` for duplicates and failed copies
    pub archive_path: Option<String>,
    pub strategy: Option<CopyStrategy>,
    /// This batch created the destination. Only such files are rolled back.
    pub created: bool,
    pub copy_error: Option<String>,
    /// Bytes placed at the destination by this batch
    pub bytes_copied: u64,
}

impl Deref for CopiedFile {
    type Target = HashedFile;

    fn deref(&self) -> &HashedFile {
        &self.hashed
    }
}

impl CopiedFile {
    pub(crate) fn uncopied(hashed: HashedFile) -> Self {
        CopiedFile {
            hashed,
            archive_path: None,
            strategy: None,
            created: false,
            copy_error: None,
            bytes_copied: 0,
        }
    }
}

/// Validator output
#[derive(Debug, Clone)]
pub struct ValidatedFile {
    pub copied: CopiedFile,
    pub validation_error: Option<String>,
    /// Set by suppression rules; the file is archived but hidden from browsing
    pub should_hide: bool,
    pub hide_reason: Option<String>,
}

impl Deref for ValidatedFile {
    type Target = CopiedFile;

    fn deref(&self) -> &CopiedFile {
        &self.copied
    }
}

impl ValidatedFile {
    pub(crate) fn unvalidated(copied: CopiedFile) -> Self {
        ValidatedFile {
            copied,
            validation_error: None,
            should_hide: false,
            hide_reason: None,
        }
    }

    /// Copied in this batch and verified; ready for a metadata row
    pub fn is_importable(&self) -> bool {
        self.archive_path.is_some()
            && self.copy_error.is_none()
            && self.validation_error.is_none()
            && self.hash.is_some()
            && !self.is_duplicate
    }
}

/// Finalizer output
#[derive(Debug, Clone)]
pub struct FinalizedFile {
    pub validated: ValidatedFile,
    /// Media row id; present iff a durable row exists
    pub record_id: Option<String>,
    pub finalize_error: Option<String>,
}

impl Deref for FinalizedFile {
    type Target = ValidatedFile;

    fn deref(&self) -> &ValidatedFile {
        &self.validated
    }
}

impl FinalizedFile {
    pub(crate) fn unfinalized(validated: ValidatedFile) -> Self {
        FinalizedFile {
            validated,
            record_id: None,
            finalize_error: None,
        }
    }

    /// First error recorded by any stage, earliest stage first
    pub fn first_error(&self) -> Option<&str> {
        self.hash_error
            .as_deref()
            .or(self.copy_error.as_deref())
            .or(self.validation_error.as_deref())
            .or(self.finalize_error.as_deref())
    }

    pub fn status(&self) -> FileStatus {
        if self.record_id.is_some() {
            FileStatus::Imported
        } else if self.is_duplicate {
            FileStatus::Duplicate
        } else if self.first_error() == Some(NOT_STARTED) {
            FileStatus::Skipped
        } else if self.first_error().is_some() {
            FileStatus::Error
        } else {
            FileStatus::Skipped
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Imported,
    Duplicate,
    Error,
    /// Not processed because the batch stopped first
    Skipped,
}

/// Per-file line of an `ImportResult`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileOutcome {
    pub path: PathBuf,
    pub filename: String,
    pub status: FileStatus,
    pub media_type: MediaType,
    pub hash: Option<String>,
    pub is_duplicate: bool,
    pub archive_path: Option<String>,
    pub strategy: Option<CopyStrategy>,
    pub bytes_copied: u64,
    pub hidden: bool,
    pub record_id: Option<String>,
    pub error: Option<String>,
}

impl From<&FinalizedFile> for FileOutcome {
    fn from(file: &FinalizedFile) -> Self {
        let status = file.status();
        FileOutcome {
            path: file.path.clone(),
            filename: file.filename.clone(),
            status,
            media_type: file.media_type,
            hash: file.hash.clone(),
            is_duplicate: file.is_duplicate,
            archive_path: if status == FileStatus::Imported {
                file.archive_path.clone()
            } else {
                None
            },
            strategy: file.strategy,
            bytes_copied: file.bytes_copied,
            hidden: file.should_hide,
            record_id: file.record_id.clone(),
            error: if status == FileStatus::Error {
                file.first_error().map(str::to_string)
            } else {
                None
            },
        }
    }
}

/// Pipeline stage, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportPhase {
    Scan,
    Hash,
    Copy,
    Validate,
    Finalize,
}

impl ImportPhase {
    /// Slice of overall batch progress owned by this phase
    pub fn percent_span(&self) -> (u8, u8) {
        match self {
            ImportPhase::Scan => (0, 5),
            ImportPhase::Hash => (5, 40),
            ImportPhase::Copy => (40, 80),
            ImportPhase::Validate => (80, 95),
            ImportPhase::Finalize => (95, 100),
        }
    }
}

impl fmt::Display for ImportPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ImportPhase::Scan => "scan",
            ImportPhase::Hash => "hash",
            ImportPhase::Copy => "copy",
            ImportPhase::Validate => "validate",
            ImportPhase::Finalize => "finalize",
        };
        f.write_str(name)
    }
}

/// Progress update for one batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportProgress {
    /// 0-100 across the whole batch
    pub percent: u8,
    pub phase: ImportPhase,
    pub current_file: Option<String>,
    pub files_processed: usize,
    pub total_files: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchOutcome {
    Completed,
    Cancelled,
}

/// Wall-clock time spent per stage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageTimings {
    pub scan: Duration,
    pub hash: Duration,
    pub copy: Duration,
    pub validate: Duration,
    pub finalize: Duration,
}

/// Summary handed back to the caller once a batch ends
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportResult {
    pub outcome: BatchOutcome,
    /// `imports` row id; `None` when nothing reached the finalize stage
    pub import_id: Option<String>,
    pub total_files: usize,
    pub total_imported: usize,
    pub total_copied: usize,
    pub total_duplicates: usize,
    pub total_errors: usize,
    pub total_bytes_copied: u64,
    pub jobs_enqueued: usize,
    pub files: Vec<FileOutcome>,
    /// "filename: message", capped at `MAX_REPORTED_ERRORS`
    pub error_messages: Vec<String>,
    pub timings: StageTimings,
}

impl ImportResult {
    pub(crate) fn from_files(
        outcome: BatchOutcome,
        import_id: Option<String>,
        files: &[FinalizedFile],
        jobs_enqueued: usize,
        timings: StageTimings,
    ) -> Self {
        let outcomes: Vec<FileOutcome> = files.iter().map(FileOutcome::from).collect();

        let count = |status: FileStatus| outcomes.iter().filter(|o| o.status == status).count();
        let error_messages = outcomes
            .iter()
            .filter_map(|o| o.error.as_ref().map(|e| format!("{}: {}", o.filename, e)))
            .take(MAX_REPORTED_ERRORS)
            .collect();

        ImportResult {
            outcome,
            import_id,
            total_files: outcomes.len(),
            total_imported: count(FileStatus::Imported),
            total_copied: outcomes
                .iter()
                .filter(|o| o.status == FileStatus::Imported && o.strategy.is_some())
                .count(),
            total_duplicates: count(FileStatus::Duplicate),
            total_errors: count(FileStatus::Error),
            total_bytes_copied: outcomes
                .iter()
                .filter(|o| o.status == FileStatus::Imported)
                .map(|o| o.bytes_copied)
                .sum(),
            jobs_enqueued,
            files: outcomes,
            error_messages,
            timings,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.outcome == BatchOutcome::Cancelled
    }
}
