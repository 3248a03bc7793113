//! Durable job queue on the `jobs` table.
//!
//! Claiming is a single `UPDATE ... RETURNING`, so two workers can never
//! take the same row. A job becomes claimable once it is pending, its
//! backoff has elapsed and its dependency (if any) is done.

use crate::config::WorkerConfig;
use crate::db::{format_timestamp, parse_timestamp, Database, MediaType};
use crate::jobs::types::*;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

const JOB_COLUMNS: &str = "seq, id, queue, payload, priority, depends_on, status, attempts, \
    max_attempts, last_error, available_at, created_at, started_at, finished_at";

/// What happened to a job after a failed attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Back to pending, claimable again at `available_at`
    RetryScheduled { available_at: DateTime<Utc> },
    /// Out of attempts. `cascaded` lists dependents failed along with it.
    Failed { cascaded: Vec<JobId> },
}

/// `min(base * 2^(attempts-1), cap)`
pub fn retry_backoff(attempts: i64, base: Duration, cap: Duration) -> Duration {
    let exponent = attempts.saturating_sub(1).clamp(0, 30) as u32;
    base.saturating_mul(2u32.saturating_pow(exponent)).min(cap)
}

#[derive(Clone)]
pub struct JobQueue {
    database: Database,
    config: WorkerConfig,
    wake: Arc<Notify>,
}

impl JobQueue {
    pub fn new(database: Database, config: WorkerConfig) -> Self {
        JobQueue {
            database,
            config,
            wake: Arc::new(Notify::new()),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Wake a waiting worker; new work is committed
    pub fn notify(&self) {
        self.wake.notify_one();
    }

    pub fn wake_handle(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    /// Insert a job on the caller's connection or transaction. The caller
    /// commits and then calls `notify`.
    ///
    /// The dependency must exist. A job whose dependency has already failed
    /// is inserted as failed, the same way the failure cascade would have
    /// left it. The check and the insert are one statement.
    pub async fn enqueue(
        &self,
        conn: &mut SqliteConnection,
        payload: &JobPayload,
        priority: JobPriority,
        depends_on: Option<&JobId>,
    ) -> Result<JobId, JobError> {
        let id = JobId::new();
        let now = format_timestamp(Utc::now());
        let dependency_failed = depends_on.map(|dep| format!("Dependency {} failed", dep));

        let status: Option<String> = sqlx::query_scalar(
            r#"
            INSERT INTO jobs (
                id, queue, payload, media_hash, priority, depends_on,
                status, attempts, max_attempts, last_error,
                available_at, created_at, finished_at
            )
            SELECT ?1, ?2, ?3, ?4, ?5, ?6,
                CASE WHEN dep.status = 'failed' THEN 'failed' ELSE 'pending' END,
                0, ?7,
                CASE WHEN dep.status = 'failed' THEN ?8 END,
                ?9, ?9,
                CASE WHEN dep.status = 'failed' THEN ?9 END
            FROM (SELECT ?6 AS wanted) AS w
            LEFT JOIN jobs AS dep ON dep.id = w.wanted
            WHERE w.wanted IS NULL OR dep.id IS NOT NULL
            RETURNING status
            "#,
        )
        .bind(id.as_str())
        .bind(payload.kind().as_str())
        .bind(serde_json::to_string(payload)?)
        .bind(payload.media_hash())
        .bind(priority.as_i64())
        .bind(depends_on.map(JobId::as_str))
        .bind(self.config.max_attempts)
        .bind(dependency_failed)
        .bind(&now)
        .fetch_optional(conn)
        .await?;

        match status.as_deref() {
            None => {
                let missing = depends_on.map(JobId::to_string).unwrap_or_default();
                Err(JobError::NotFound(missing))
            }
            Some("failed") => {
                warn!(
                    "Enqueued {} job {} as failed, dependency already failed",
                    payload.kind(),
                    id
                );
                Ok(id)
            }
            Some(_) => {
                debug!("Enqueued {} job {} for {}", payload.kind(), id, payload.media_hash());
                Ok(id)
            }
        }
    }

    /// Background work for one newly archived file.
    ///
    /// Every file gets metadata extraction. Images and videos get a thumbnail
    /// after metadata; videos also get a probe after metadata and a
    /// low-priority proxy with no dependency.
    pub async fn enqueue_media_jobs(
        &self,
        conn: &mut SqliteConnection,
        hash: &str,
        media_type: MediaType,
        archive_path: &str,
    ) -> Result<Vec<JobId>, JobError> {
        let mut ids = Vec::new();

        let metadata = JobPayload::MetadataExtract(MetadataExtractJob {
            hash: hash.to_string(),
            media_type,
            archive_path: archive_path.to_string(),
        });
        let metadata_id = self
            .enqueue(&mut *conn, &metadata, JobPriority::High, None)
            .await?;
        ids.push(metadata_id.clone());

        if media_type == MediaType::Video {
            let probe = JobPayload::VideoProbe(VideoProbeJob {
                hash: hash.to_string(),
                archive_path: archive_path.to_string(),
            });
            ids.push(
                self.enqueue(&mut *conn, &probe, JobPriority::Normal, Some(&metadata_id))
                    .await?,
            );
        }

        if matches!(media_type, MediaType::Image | MediaType::Video) {
            let thumbnail = JobPayload::Thumbnail(ThumbnailJob {
                hash: hash.to_string(),
                media_type,
                archive_path: archive_path.to_string(),
            });
            ids.push(
                self.enqueue(&mut *conn, &thumbnail, JobPriority::Normal, Some(&metadata_id))
                    .await?,
            );
        }

        if media_type == MediaType::Video {
            let proxy = JobPayload::ProxyGenerate(ProxyGenerateJob {
                hash: hash.to_string(),
                archive_path: archive_path.to_string(),
            });
            ids.push(
                self.enqueue(&mut *conn, &proxy, JobPriority::Low, None)
                    .await?,
            );
        }

        Ok(ids)
    }

    /// Enqueue outside an import and wake the worker
    pub async fn submit(
        &self,
        payload: &JobPayload,
        priority: JobPriority,
        depends_on: Option<&JobId>,
    ) -> Result<JobId, JobError> {
        let mut conn = self.database.pool().acquire().await?;
        let id = self.enqueue(&mut conn, payload, priority, depends_on).await?;
        self.notify();
        Ok(id)
    }

    /// Atomically take the highest-priority eligible job and mark it running
    pub async fn claim_next(&self) -> Result<Option<JobRecord>, JobError> {
        let now = format_timestamp(Utc::now());
        let sql = format!(
            r#"
            UPDATE jobs
            SET status = 'running', attempts = attempts + 1, started_at = ?
            WHERE seq = (
                SELECT j.seq FROM jobs j
                WHERE j.status = 'pending'
                  AND j.available_at <= ?
                  AND (
                      j.depends_on IS NULL
                      OR EXISTS (
                          SELECT 1 FROM jobs d
                          WHERE d.id = j.depends_on AND d.status = 'done'
                      )
                  )
                ORDER BY j.priority DESC, j.seq ASC
                LIMIT 1
            )
            AND status = 'pending'
            RETURNING {}
            "#,
            JOB_COLUMNS
        );

        let row = sqlx::query(&sql)
            .bind(&now)
            .bind(&now)
            .fetch_optional(self.database.pool())
            .await?;

        row.as_ref().map(job_from_row).transpose()
    }

    pub async fn mark_done(&self, id: &JobId) -> Result<(), JobError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET status = 'done', finished_at = ?
            WHERE id = ? AND status = 'running'
            "#,
        )
        .bind(format_timestamp(Utc::now()))
        .bind(id.as_str())
        .execute(self.database.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(JobError::NotFound(id.to_string()));
        }
        Ok(())
    }

    /// Record a failed attempt. Retries with backoff while attempts remain,
    /// otherwise fails the job and every job that depends on it.
    pub async fn mark_failed(&self, id: &JobId, error: &str) -> Result<FailureOutcome, JobError> {
        let mut tx = self.database.pool().begin().await?;

        let row = sqlx::query("SELECT attempts, max_attempts FROM jobs WHERE id = ? AND status = 'running'")
            .bind(id.as_str())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| JobError::NotFound(id.to_string()))?;
        let attempts: i64 = row.try_get("attempts")?;
        let max_attempts: i64 = row.try_get("max_attempts")?;
        let now = Utc::now();

        let outcome = if attempts < max_attempts {
            let delay = retry_backoff(
                attempts,
                self.config.retry_backoff_base,
                self.config.retry_backoff_cap,
            );
            let available_at = now
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());

            sqlx::query(
                r#"
                UPDATE jobs
                SET status = 'pending', last_error = ?, available_at = ?, started_at = NULL
                WHERE id = ?
                "#,
            )
            .bind(error)
            .bind(format_timestamp(available_at))
            .bind(id.as_str())
            .execute(&mut *tx)
            .await?;

            info!(
                "Job {} failed attempt {}/{}, retrying in {:?}: {}",
                id, attempts, max_attempts, delay, error
            );
            FailureOutcome::RetryScheduled { available_at }
        } else {
            sqlx::query(
                r#"
                UPDATE jobs SET status = 'failed', last_error = ?, finished_at = ?
                WHERE id = ?
                "#,
            )
            .bind(error)
            .bind(format_timestamp(now))
            .bind(id.as_str())
            .execute(&mut *tx)
            .await?;

            let cascaded = fail_dependents(&mut tx, id).await?;
            warn!(
                "Job {} failed permanently after {} attempt(s): {} ({} dependent(s) failed)",
                id,
                attempts,
                error,
                cascaded.len()
            );
            FailureOutcome::Failed { cascaded }
        };

        tx.commit().await?;
        Ok(outcome)
    }

    /// Manually re-run a failed job. Resets its attempt count and brings back
    /// the dependents that were failed because of it. Returns every job reset.
    pub async fn retry(&self, id: &JobId) -> Result<Vec<JobId>, JobError> {
        let mut tx = self.database.pool().begin().await?;

        let job = sqlx::query(&format!("SELECT {} FROM jobs WHERE id = ?", JOB_COLUMNS))
            .bind(id.as_str())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| JobError::NotFound(id.to_string()))?;
        let job = job_from_row(&job)?;

        if job.status != JobStatus::Failed {
            return Err(JobError::NotRetryable {
                id: id.to_string(),
                reason: format!("job is {}", job.status),
            });
        }

        if let Some(dependency) = &job.depends_on {
            let status: Option<JobStatus> =
                sqlx::query_scalar("SELECT status FROM jobs WHERE id = ?")
                    .bind(dependency.as_str())
                    .fetch_optional(&mut *tx)
                    .await?;
            if status == Some(JobStatus::Failed) {
                return Err(JobError::NotRetryable {
                    id: id.to_string(),
                    reason: format!("dependency {} failed; retry it instead", dependency),
                });
            }
        }

        let now = format_timestamp(Utc::now());
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending', attempts = 0, available_at = ?,
                started_at = NULL, finished_at = NULL
            WHERE id = ?
            "#,
        )
        .bind(&now)
        .bind(id.as_str())
        .execute(&mut *tx)
        .await?;

        // Dependents that never ran were failed by the cascade
        let revived: Vec<String> = sqlx::query_scalar(
            r#"
            WITH RECURSIVE dependents(id) AS (
                SELECT id FROM jobs WHERE depends_on = ?
                UNION
                SELECT j.id FROM jobs j JOIN dependents d ON j.depends_on = d.id
            )
            UPDATE jobs
            SET status = 'pending', available_at = ?, finished_at = NULL, last_error = NULL
            WHERE id IN (SELECT id FROM dependents) AND status = 'failed' AND attempts = 0
            RETURNING id
            "#,
        )
        .bind(id.as_str())
        .bind(&now)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;
        self.notify();

        info!("Retrying job {} ({} dependent(s) revived)", id, revived.len());
        let mut reset = vec![id.clone()];
        reset.extend(revived.into_iter().map(JobId));
        Ok(reset)
    }

    /// Put jobs left `running` by a crashed worker back in the queue
    pub async fn requeue_stale_running(&self) -> Result<u64, JobError> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'pending', started_at = NULL WHERE status = 'running'",
        )
        .execute(self.database.pool())
        .await?;

        if result.rows_affected() > 0 {
            warn!("Requeued {} job(s) left running", result.rows_affected());
        }
        Ok(result.rows_affected())
    }

    pub async fn get(&self, id: &JobId) -> Result<Option<JobRecord>, JobError> {
        let row = sqlx::query(&format!("SELECT {} FROM jobs WHERE id = ?", JOB_COLUMNS))
            .bind(id.as_str())
            .fetch_optional(self.database.pool())
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    /// All jobs for one archived file, in enqueue order
    pub async fn jobs_for_media(&self, hash: &str) -> Result<Vec<JobRecord>, JobError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM jobs WHERE media_hash = ? ORDER BY seq",
            JOB_COLUMNS
        ))
        .bind(hash)
        .fetch_all(self.database.pool())
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    /// Most recent jobs in a status, newest first
    pub async fn list_by_status(
        &self,
        status: JobStatus,
        limit: i64,
    ) -> Result<Vec<JobRecord>, JobError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM jobs WHERE status = ? ORDER BY seq DESC LIMIT ?",
            JOB_COLUMNS
        ))
        .bind(status)
        .bind(limit)
        .fetch_all(self.database.pool())
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    pub async fn counts(&self) -> Result<JobCounts, JobError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM jobs GROUP BY status")
            .fetch_all(self.database.pool())
            .await?;

        let mut counts = JobCounts::default();
        for row in rows {
            let status: JobStatus = row.try_get("status")?;
            let n: i64 = row.try_get("n")?;
            match status {
                JobStatus::Pending => counts.pending = n,
                JobStatus::Running => counts.running = n,
                JobStatus::Done => counts.done = n,
                JobStatus::Failed => counts.failed = n,
            }
        }
        Ok(counts)
    }
}

/// Fail every pending job downstream of `id`. Returns the ids affected.
async fn fail_dependents(
    conn: &mut SqliteConnection,
    id: &JobId,
) -> Result<Vec<JobId>, JobError> {
    let failed: Vec<String> = sqlx::query_scalar(
        r#"
        WITH RECURSIVE dependents(id) AS (
            SELECT id FROM jobs WHERE depends_on = ?
            UNION
            SELECT j.id FROM jobs j JOIN dependents d ON j.depends_on = d.id
        )
        UPDATE jobs
        SET status = 'failed', last_error = ?, finished_at = ?
        WHERE id IN (SELECT id FROM dependents) AND status = 'pending'
        RETURNING id
        "#,
    )
    .bind(id.as_str())
    .bind(format!("Dependency {} failed", id))
    .bind(format_timestamp(Utc::now()))
    .fetch_all(conn)
    .await?;

    Ok(failed.into_iter().map(JobId).collect())
}

fn job_from_row(row: &SqliteRow) -> Result<JobRecord, JobError> {
    let queue: String = row.try_get("queue")?;
    let raw_payload: String = row.try_get("payload")?;

    let optional_time = |column: &str| -> Result<Option<DateTime<Utc>>, sqlx::Error> {
        row.try_get::<Option<String>, _>(column)?
            .map(|raw| parse_timestamp(&raw))
            .transpose()
    };

    Ok(JobRecord {
        seq: row.try_get("seq")?,
        id: JobId(row.try_get("id")?),
        payload: JobPayload::decode(&queue, &raw_payload)?,
        priority: row.try_get("priority")?,
        depends_on: row.try_get::<Option<String>, _>("depends_on")?.map(JobId),
        status: row.try_get("status")?,
        attempts: row.try_get("attempts")?,
        max_attempts: row.try_get("max_attempts")?,
        last_error: row.try_get("last_error")?,
        available_at: parse_timestamp(&row.try_get::<String, _>("available_at")?)?,
        created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?)?,
        started_at: optional_time("started_at")?,
        finished_at: optional_time("finished_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_backoff_grows_and_caps() {
        let base = Duration::from_secs(2);
        let cap = Duration::from_secs(300);
        assert_eq!(retry_backoff(1, base, cap), Duration::from_secs(2));
        assert_eq!(retry_backoff(2, base, cap), Duration::from_secs(4));
        assert_eq!(retry_backoff(3, base, cap), Duration::from_secs(8));
        assert_eq!(retry_backoff(20, base, cap), cap);
        assert_eq!(retry_backoff(0, base, cap), base);
    }

    #[test]
    fn test_retry_backoff_zero_base() {
        assert_eq!(
            retry_backoff(5, Duration::ZERO, Duration::from_secs(300)),
            Duration::ZERO
        );
    }
}
