// # Import Module
//
// Content-addressed ingest, one batch per call:
//
// - **Scanner**: Walks the selection, filters, detects RAW/Live Photo companions
// - **Hasher**: SHA-256 per file, duplicate detection against the archive and the batch
// - **Copier**: Hardlink / clone / copy into the archive layout via temp + link, never replacing
// - **Validator**: Re-hashes archived copies, applies hide rules
// - **Finalizer**: One transaction for rows, relations and follow-up jobs
// - **ImportService**: Orchestrates the stages, progress and cancellation
//
// Public API:
// - `ImportService`: Run or spawn a batch
// - `ImportRequest`: What to import and where
// - `ImportProgress`: Bounded, lossy progress updates
// - `ImportResult`: Per-file outcomes and batch totals

pub mod copier;
pub mod finalizer;
pub mod hasher;
pub mod paths;
pub mod progress;
pub mod scanner;
pub mod service;
pub mod types;
pub mod validator;

pub use progress::ProgressReporter;
pub use service::{ImportService, PostImportEvent, RunningImport};
pub use types::*;
