//! Content digests and duplicate detection.
//!
//! Files are hashed with bounded parallelism on the blocking pool. Output
//! order matches input order regardless of completion order.

use crate::db::Database;
use crate::import::progress::ProgressReporter;
use crate::import::types::{CandidateFile, HashedFile, ImportPhase};
use futures::stream::{self, StreamExt};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const READ_BUFFER_SIZE: usize = 1024 * 1024;

/// Stream a file through SHA-256. Returns the hex digest and bytes read.
pub fn sha256_file(path: &Path) -> io::Result<(String, u64)> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let read = match file.read(&mut buffer) {
            Ok(0) => break,
            Ok(read) => read,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buffer[..read]);
        total += read as u64;
    }

    Ok((hex::encode(hasher.finalize()), total))
}

/// Hash a scanned file, refusing results that do not cover the size seen at scan time
fn digest_candidate(path: &Path, expected_size: u64) -> Result<String, String> {
    let (digest, read) =
        sha256_file(path).map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;

    if read == 0 {
        return Err("File was empty when read".to_string());
    }
    if read != expected_size {
        return Err(format!(
            "File changed while importing: expected {} bytes, read {}",
            expected_size, read
        ));
    }
    Ok(digest)
}

async fn hash_one(file: CandidateFile, cancel: CancellationToken) -> HashedFile {
    if cancel.is_cancelled() {
        return HashedFile::not_started(file);
    }

    let path: PathBuf = file.path.clone();
    let size = file.size;
    let result = tokio::task::spawn_blocking(move || digest_candidate(&path, size))
        .await
        .unwrap_or_else(|e| Err(format!("Hash task panicked: {}", e)));

    match result {
        Ok(hash) => HashedFile {
            file,
            hash: Some(hash),
            hash_error: None,
            is_duplicate: false,
        },
        Err(error) => {
            warn!("Hashing {:?} failed: {}", file.path, error);
            HashedFile {
                file,
                hash: None,
                hash_error: Some(error),
                is_duplicate: false,
            }
        }
    }
}

/// Hash every candidate, then flag duplicates against the archive and
/// against earlier files in the same batch.
///
/// A per-file read failure marks only that file. Once `cancel` fires, files
/// not yet started are returned untouched; files in flight finish.
pub async fn hash_files(
    files: Vec<CandidateFile>,
    database: &Database,
    workers: usize,
    cancel: &CancellationToken,
    progress: &ProgressReporter,
) -> Result<Vec<HashedFile>, sqlx::Error> {
    let total = files.len();
    info!("Hashing {} file(s) with {} worker(s)", total, workers);

    let mut hashed = Vec::with_capacity(total);
    let mut results = stream::iter(files)
        .map(|file| hash_one(file, cancel.clone()))
        .buffered(workers.max(1));

    while let Some(file) = results.next().await {
        hashed.push(file);
        progress.report_files(
            ImportPhase::Hash,
            hashed.len(),
            total,
            hashed.last().map(|f: &HashedFile| f.filename.as_str()),
        );
    }

    let digests: Vec<String> = hashed.iter().filter_map(|f| f.hash.clone()).collect();
    let existing = database.existing_hashes(&digests).await?;
    mark_duplicates(&mut hashed, &existing);

    Ok(hashed)
}

/// First occurrence of a digest in the batch wins unless the archive already has it
fn mark_duplicates(files: &mut [HashedFile], existing: &HashSet<String>) {
    let mut seen = HashSet::new();
    for file in files.iter_mut() {
        let Some(hash) = &file.hash else {
            continue;
        };
        if existing.contains(hash) || !seen.insert(hash.clone()) {
            debug!("Duplicate content {} for {:?}", hash, file.path);
            file.is_duplicate = true;
        }
    }
}
