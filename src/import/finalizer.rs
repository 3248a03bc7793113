//! Commits a batch: import row, media rows, relations, follow-up jobs and
//! batch counts, all in one transaction.
//!
//! Media rows go in chunks of `FINALIZE_CHUNK_SIZE`. A chunk that fails is
//! rolled back to its savepoint and retried row by row, so one bad row only
//! costs that file. A failure outside that per-row scope aborts the whole
//! transaction and nothing becomes visible.
//!
//! Archived copies are checked once the transaction holds the write lock.
//! A concurrent batch can only roll back a file it created under that same
//! lock, so a copy found here stays until the commit.

use crate::db::{Actor, Database, DbImport, DbMedia, DbMediaRelation};
use crate::import::paths;
use crate::import::progress::ProgressReporter;
use crate::import::types::{
    FileRelation, FinalizedFile, ImportError, ImportPhase, LocationInfo, ValidatedFile,
};
use crate::jobs::JobQueue;
use chrono::Utc;
use sqlx::{Acquire, SqliteConnection};
use std::path::Path;
use tracing::{info, warn};
use uuid::Uuid;

pub const FINALIZE_CHUNK_SIZE: usize = 50;

#[derive(Debug)]
pub struct FinalizeOutput {
    pub import_id: String,
    pub files: Vec<FinalizedFile>,
    pub jobs_enqueued: usize,
}

fn media_row(
    file: &ValidatedFile,
    import_id: &str,
    location: &LocationInfo,
    actor: &Actor,
) -> Option<DbMedia> {
    Some(DbMedia {
        id: Uuid::new_v4().to_string(),
        hash: file.hash.clone()?,
        media_type: file.media_type,
        extension: file.extension.clone(),
        original_filename: file.filename.clone(),
        original_path: file.path.to_string_lossy().to_string(),
        archive_path: file.archive_path.clone()?,
        size_bytes: file.size as i64,
        location_id: location.location_id.clone(),
        import_id: import_id.to_string(),
        hidden: file.should_hide,
        hidden_reason: file.hide_reason.clone(),
        imported_by_id: actor.id.clone(),
        imported_by: actor.name.clone(),
        created_at: Utc::now(),
    })
}

pub async fn finalize_files(
    files: Vec<ValidatedFile>,
    archive_root: &Path,
    relations: &[FileRelation],
    database: &Database,
    queue: &JobQueue,
    location: &LocationInfo,
    actor: &Actor,
    progress: &ProgressReporter,
) -> Result<FinalizeOutput, ImportError> {
    let mut import = DbImport::new(&location.location_id, &location.loc12, actor);
    import.total_files = files.len() as i64;

    let mut finalized: Vec<FinalizedFile> =
        files.into_iter().map(FinalizedFile::unfinalized).collect();
    let importable: Vec<(usize, DbMedia)> = finalized
        .iter()
        .enumerate()
        .filter(|(_, f)| f.is_importable())
        .filter_map(|(i, f)| media_row(f, &import.id, location, actor).map(|row| (i, row)))
        .collect();

    info!(
        "Finalizing import {}: {} of {} file(s) to record",
        import.id,
        importable.len(),
        finalized.len()
    );

    // The import row write takes the lock
    let mut tx = database.pool().begin().await?;
    Database::insert_import(&mut tx, &import).await?;

    let mut pending = Vec::with_capacity(importable.len());
    for (index, row) in importable {
        let on_disk = paths::resolve(archive_root, &row.archive_path);
        if matches!(tokio::fs::try_exists(&on_disk).await, Ok(true)) {
            pending.push((index, row));
        } else {
            warn!("Archived copy {} disappeared before commit", row.archive_path);
            finalized[index].finalize_error =
                Some(format!("Archived copy {} is missing", row.archive_path));
        }
    }

    let total_rows = pending.len();
    let mut rows_done = 0;
    let mut inserted: Vec<(usize, DbMedia)> = Vec::with_capacity(total_rows);

    for chunk in pending.chunks(FINALIZE_CHUNK_SIZE) {
        let rows: Vec<DbMedia> = chunk.iter().map(|(_, row)| row.clone()).collect();

        let mut savepoint = tx.begin().await?;
        match Database::insert_media_batch(&mut savepoint, &rows).await {
            Ok(()) => {
                savepoint.commit().await?;
                inserted.extend(chunk.iter().cloned());
            }
            Err(e) => {
                savepoint.rollback().await?;
                warn!(
                    "Chunk insert failed ({}), retrying {} row(s) one by one",
                    e,
                    rows.len()
                );

                for (index, row) in chunk {
                    let mut savepoint = tx.begin().await?;
                    match Database::insert_media(&mut savepoint, row).await {
                        Ok(()) => {
                            savepoint.commit().await?;
                            inserted.push((*index, row.clone()));
                        }
                        Err(e) => {
                            savepoint.rollback().await?;
                            warn!("Failed to record {}: {}", row.original_filename, e);
                            finalized[*index].finalize_error =
                                Some(format!("Failed to record file: {}", e));
                        }
                    }
                }
            }
        }

        rows_done += chunk.len();
        progress.report_files(ImportPhase::Finalize, rows_done, total_rows, None);
    }

    for (index, row) in &inserted {
        finalized[*index].record_id = Some(row.id.clone());
    }

    insert_relations(&mut tx, &finalized, relations).await?;

    let mut jobs_enqueued = 0;
    for (_, row) in &inserted {
        let ids = queue
            .enqueue_media_jobs(&mut tx, &row.hash, row.media_type, &row.archive_path)
            .await?;
        jobs_enqueued += ids.len();
    }

    let imported = inserted.len() as i64;
    let duplicates = finalized.iter().filter(|f| f.is_duplicate).count() as i64;
    let errors = finalized
        .iter()
        .filter(|f| f.record_id.is_none() && !f.is_duplicate && f.first_error().is_some())
        .count() as i64;
    Database::update_import_counts(&mut tx, &import.id, imported, duplicates, errors).await?;

    tx.commit().await?;
    queue.notify();
    progress.report(ImportPhase::Finalize, 1.0, None, total_rows);

    info!(
        "Import {} committed: {} imported, {} duplicate(s), {} error(s), {} job(s)",
        import.id, imported, duplicates, errors, jobs_enqueued
    );

    Ok(FinalizeOutput {
        import_id: import.id,
        files: finalized,
        jobs_enqueued,
    })
}

/// Link related files. A side that was a duplicate links to the row
/// already in the archive.
async fn insert_relations(
    conn: &mut SqliteConnection,
    files: &[FinalizedFile],
    relations: &[FileRelation],
) -> Result<(), sqlx::Error> {
    for relation in relations {
        let (Some(primary), Some(companion)) =
            (files.get(relation.primary), files.get(relation.companion))
        else {
            continue;
        };
        if primary.record_id.is_none() && companion.record_id.is_none() {
            continue;
        }

        let Some(media_id) = record_id_for(conn, primary).await? else {
            continue;
        };
        let Some(related_id) = record_id_for(conn, companion).await? else {
            continue;
        };

        let row = DbMediaRelation::new(&media_id, &related_id, relation.kind);
        Database::insert_relation(&mut *conn, &row).await?;
    }
    Ok(())
}

async fn record_id_for(
    conn: &mut SqliteConnection,
    file: &FinalizedFile,
) -> Result<Option<String>, sqlx::Error> {
    if let Some(id) = &file.record_id {
        return Ok(Some(id.clone()));
    }
    match (&file.hash, file.is_duplicate) {
        (Some(hash), true) => Database::media_id_for_hash(conn, hash).await,
        _ => Ok(None),
    }
}
