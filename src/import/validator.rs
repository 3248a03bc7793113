//! Re-reads archived copies and compares digests, then applies
//! display-suppression rules.

use crate::db::RelationKind;
use crate::import::hasher::sha256_file;
use crate::import::paths;
use crate::import::progress::ProgressReporter;
use crate::import::types::{CopiedFile, FileRelation, ImportPhase, ValidatedFile};
use futures::stream::{self, StreamExt};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const HIDE_LIVE_PHOTO_MOTION: &str = "live_photo_motion";
pub const HIDE_DERIVED_FILE: &str = "derived_file";

/// Decides which archived files are hidden from normal browsing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SuppressionRule {
    /// The motion half of a Live Photo
    LivePhotoMotion,
    /// Camera-generated sidecars by lower-case extension (no dot)
    DerivedExtensions(Vec<String>),
}

pub fn default_rules() -> Vec<SuppressionRule> {
    vec![
        SuppressionRule::LivePhotoMotion,
        SuppressionRule::DerivedExtensions(vec!["thm".to_string(), "lrv".to_string()]),
    ]
}

async fn verify_one(file: CopiedFile, archive_root: PathBuf) -> ValidatedFile {
    let Some(archive_path) = file.archive_path.clone() else {
        return ValidatedFile::unvalidated(file);
    };
    let Some(expected) = file.hash.clone() else {
        return ValidatedFile::unvalidated(file);
    };

    let destination = paths::resolve(&archive_root, &archive_path);
    let check = tokio::task::spawn_blocking(move || sha256_file(&destination))
        .await
        .map_err(|e| format!("Validation task panicked: {}", e))
        .and_then(|r| r.map_err(|e| format!("Failed to re-read archived copy: {}", e)));

    let mut validated = ValidatedFile::unvalidated(file);
    match check {
        Ok((actual, _)) if actual == expected => {}
        Ok((actual, _)) => {
            warn!(
                "Digest mismatch for {}: expected {}, found {}",
                archive_path, expected, actual
            );
            validated.validation_error = Some(format!(
                "Digest mismatch: expected {}, found {}",
                expected, actual
            ));
        }
        Err(error) => {
            warn!("Validating {} failed: {}", archive_path, error);
            validated.validation_error = Some(error);
        }
    }
    validated
}

/// Verify every file copied in this batch and apply `rules`.
///
/// Runs to completion once started; a failed check marks only that file.
pub async fn validate_files(
    files: Vec<CopiedFile>,
    archive_root: &Path,
    relations: &[FileRelation],
    rules: &[SuppressionRule],
    workers: usize,
    progress: &ProgressReporter,
) -> Vec<ValidatedFile> {
    let total = files.len();
    info!("Validating {} file(s)", total);

    let mut validated = Vec::with_capacity(total);
    let mut results = stream::iter(files)
        .map(|file| verify_one(file, archive_root.to_path_buf()))
        .buffered(workers.max(1));

    while let Some(file) = results.next().await {
        progress.report_files(
            ImportPhase::Validate,
            validated.len() + 1,
            total,
            Some(&file.filename),
        );
        validated.push(file);
    }

    apply_rules(&mut validated, relations, rules);
    validated
}

/// Mark files hidden according to `rules`. First matching rule sets the reason.
pub fn apply_rules(
    files: &mut [ValidatedFile],
    relations: &[FileRelation],
    rules: &[SuppressionRule],
) {
    for rule in rules {
        match rule {
            SuppressionRule::LivePhotoMotion => {
                for relation in relations.iter().filter(|r| r.kind == RelationKind::LivePhoto) {
                    if let Some(file) = files.get_mut(relation.companion) {
                        hide(file, HIDE_LIVE_PHOTO_MOTION);
                    }
                }
            }
            SuppressionRule::DerivedExtensions(extensions) => {
                for file in files.iter_mut() {
                    let ext = file.extension.trim_start_matches('.');
                    if extensions.iter().any(|e| e == ext) {
                        hide(file, HIDE_DERIVED_FILE);
                    }
                }
            }
        }
    }
}

fn hide(file: &mut ValidatedFile, reason: &str) {
    if !file.should_hide {
        file.should_hide = true;
        file.hide_reason = Some(reason.to_string());
    }
}
