mod support;

use au_archive::db::MediaType;
use au_archive::jobs::{
    FailureOutcome, JobError, JobEvent, JobHandlers, JobId, JobKind, JobPayload, JobPriority,
    JobQueue, JobStatus, JobWorker, MetadataExtractJob,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::support::{
    worker_config, FailingHandler, Fixture, PanickingHandler, RecordingHandler,
};

async fn enqueue_video(fixture: &Fixture, hash: &str) -> Vec<JobId> {
    let mut conn = fixture.database.pool().acquire().await.unwrap();
    let ids = fixture
        .queue
        .enqueue_media_jobs(&mut conn, hash, MediaType::Video, &format!("vid/{}.mp4", hash))
        .await
        .unwrap();
    fixture.queue.notify();
    ids
}

fn metadata_payload(hash: &str) -> JobPayload {
    JobPayload::MetadataExtract(MetadataExtractJob {
        hash: hash.to_string(),
        media_type: MediaType::Image,
        archive_path: format!("img/{}.jpg", hash),
    })
}

fn drain(rx: &mut mpsc::UnboundedReceiver<JobEvent>) -> Vec<JobEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn test_video_jobs_run_after_metadata() {
    let fixture = Fixture::new().await;
    let ids = enqueue_video(&fixture, "v1").await;
    assert_eq!(ids.len(), 4);

    let handler = Arc::new(RecordingHandler::default());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let worker = JobWorker::new(fixture.queue.clone(), JobHandlers::all(handler.clone()))
        .with_events(tx);

    assert_eq!(worker.run_until_idle().await.unwrap(), 4);
    assert_eq!(
        handler.kinds(),
        vec![
            JobKind::MetadataExtract,
            JobKind::VideoProbe,
            JobKind::Thumbnail,
            JobKind::ProxyGenerate,
        ]
    );

    let events = drain(&mut rx);
    let metadata_done = events
        .iter()
        .position(|e| matches!(e, JobEvent::Finished { kind: JobKind::MetadataExtract, status: JobStatus::Done, .. }))
        .unwrap();
    let first_dependent = events
        .iter()
        .position(|e| {
            matches!(
                e,
                JobEvent::Started {
                    kind: JobKind::VideoProbe | JobKind::Thumbnail,
                    ..
                }
            )
        })
        .unwrap();
    assert!(metadata_done < first_dependent);

    let counts = fixture.queue.counts().await.unwrap();
    assert_eq!(counts.done, 4);
    assert_eq!(counts.pending, 0);
}

#[tokio::test]
async fn test_dependent_not_claimable_until_dependency_done() {
    let fixture = Fixture::new().await;
    let ids = enqueue_video(&fixture, "v1").await;

    let metadata = fixture.queue.claim_next().await.unwrap().unwrap();
    assert_eq!(metadata.id, ids[0]);

    // Probe and thumbnail wait on metadata; only the proxy is free
    let proxy = fixture.queue.claim_next().await.unwrap().unwrap();
    assert_eq!(proxy.kind(), JobKind::ProxyGenerate);
    assert!(fixture.queue.claim_next().await.unwrap().is_none());

    fixture.queue.mark_done(&metadata.id).await.unwrap();
    let next = fixture.queue.claim_next().await.unwrap().unwrap();
    assert_eq!(next.kind(), JobKind::VideoProbe);
    assert_eq!(next.depends_on.as_ref(), Some(&metadata.id));
}

#[tokio::test]
async fn test_priority_then_fifo_order() {
    let fixture = Fixture::new().await;
    let queue = &fixture.queue;

    let low = queue
        .submit(&metadata_payload("a"), JobPriority::Low, None)
        .await
        .unwrap();
    let high_1 = queue
        .submit(&metadata_payload("b"), JobPriority::High, None)
        .await
        .unwrap();
    let normal = queue
        .submit(&metadata_payload("c"), JobPriority::Normal, None)
        .await
        .unwrap();
    let high_2 = queue
        .submit(&metadata_payload("d"), JobPriority::High, None)
        .await
        .unwrap();
    let critical = queue
        .submit(&metadata_payload("e"), JobPriority::Critical, None)
        .await
        .unwrap();

    let mut claimed = Vec::new();
    while let Some(job) = queue.claim_next().await.unwrap() {
        claimed.push(job.id);
    }
    assert_eq!(claimed, vec![critical, high_1, high_2, normal, low]);
}

#[tokio::test]
async fn test_concurrent_claims_never_share_a_job() {
    let fixture = Fixture::new().await;
    for i in 0..20 {
        fixture
            .queue
            .submit(&metadata_payload(&format!("h{}", i)), JobPriority::Normal, None)
            .await
            .unwrap();
    }

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let queue = fixture.queue.clone();
        tasks.push(tokio::spawn(async move {
            let mut mine = Vec::new();
            while let Some(job) = queue.claim_next().await.unwrap() {
                mine.push(job.id);
            }
            mine
        }));
    }

    let mut all = Vec::new();
    for task in tasks {
        all.extend(task.await.unwrap());
    }
    let unique: HashSet<JobId> = all.iter().cloned().collect();
    assert_eq!(all.len(), 20);
    assert_eq!(unique.len(), 20);
}

#[tokio::test]
async fn test_exhausted_retries_fail_dependents() {
    let fixture = Fixture::new().await;
    let ids = enqueue_video(&fixture, "v1").await;

    let handler = Arc::new(FailingHandler::new(&[JobKind::MetadataExtract]));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let worker = JobWorker::new(fixture.queue.clone(), JobHandlers::all(handler.clone()))
        .with_events(tx);
    worker.run_until_idle().await.unwrap();

    // Three attempts at metadata, then only the independent proxy runs
    assert_eq!(handler.calls_for(JobKind::MetadataExtract), 3);
    assert_eq!(handler.calls_for(JobKind::VideoProbe), 0);
    assert_eq!(handler.calls_for(JobKind::Thumbnail), 0);
    assert_eq!(handler.calls_for(JobKind::ProxyGenerate), 1);

    let metadata = fixture.queue.get(&ids[0]).await.unwrap().unwrap();
    assert_eq!(metadata.status, JobStatus::Failed);
    assert_eq!(metadata.attempts, 3);
    assert_eq!(metadata.last_error.as_deref(), Some("metadata-extract exploded"));

    for id in &ids[1..3] {
        let dependent = fixture.queue.get(id).await.unwrap().unwrap();
        assert_eq!(dependent.status, JobStatus::Failed);
        assert_eq!(dependent.attempts, 0);
        assert!(dependent.last_error.unwrap().contains(ids[0].as_str()));
    }
    let proxy = fixture.queue.get(&ids[3]).await.unwrap().unwrap();
    assert_eq!(proxy.status, JobStatus::Done);

    let events = drain(&mut rx);
    let cascaded: Vec<&JobId> = events
        .iter()
        .filter_map(|e| match e {
            JobEvent::DependencyFailed { id, dependency } => {
                assert_eq!(dependency, &ids[0]);
                Some(id)
            }
            _ => None,
        })
        .collect();
    assert_eq!(cascaded.len(), 2);

    let retries = events
        .iter()
        .filter(|e| matches!(e, JobEvent::Finished { status: JobStatus::Pending, .. }))
        .count();
    assert_eq!(retries, 2);
}

#[tokio::test]
async fn test_failed_attempt_waits_for_backoff() {
    let mut config = worker_config();
    config.retry_backoff_base = Duration::from_secs(60);
    config.retry_backoff_cap = Duration::from_secs(600);
    let fixture = Fixture::with_worker_config(config).await;

    let id = fixture
        .queue
        .submit(&metadata_payload("a"), JobPriority::High, None)
        .await
        .unwrap();
    let job = fixture.queue.claim_next().await.unwrap().unwrap();

    match fixture.queue.mark_failed(&job.id, "transient").await.unwrap() {
        FailureOutcome::RetryScheduled { available_at } => {
            assert!(available_at > chrono::Utc::now() + chrono::Duration::seconds(50));
        }
        other => panic!("expected a retry, got {:?}", other),
    }

    let record = fixture.queue.get(&id).await.unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Pending);
    assert_eq!(record.attempts, 1);
    assert!(fixture.queue.claim_next().await.unwrap().is_none());
}

#[tokio::test]
async fn test_manual_retry_revives_cascade() {
    let fixture = Fixture::new().await;
    let ids = enqueue_video(&fixture, "v1").await;

    let failing = Arc::new(FailingHandler::new(&[JobKind::MetadataExtract]));
    JobWorker::new(fixture.queue.clone(), JobHandlers::all(failing))
        .run_until_idle()
        .await
        .unwrap();

    // Dependents go through their dependency
    assert!(matches!(
        fixture.queue.retry(&ids[1]).await,
        Err(JobError::NotRetryable { .. })
    ));
    // Done jobs are not retried
    assert!(matches!(
        fixture.queue.retry(&ids[3]).await,
        Err(JobError::NotRetryable { .. })
    ));

    let reset = fixture.queue.retry(&ids[0]).await.unwrap();
    assert_eq!(reset.len(), 3);
    assert_eq!(reset[0], ids[0]);
    let metadata = fixture.queue.get(&ids[0]).await.unwrap().unwrap();
    assert_eq!(metadata.status, JobStatus::Pending);
    assert_eq!(metadata.attempts, 0);

    let handler = Arc::new(RecordingHandler::default());
    let attempts = JobWorker::new(fixture.queue.clone(), JobHandlers::all(handler.clone()))
        .run_until_idle()
        .await
        .unwrap();
    assert_eq!(attempts, 3);

    let counts = fixture.queue.counts().await.unwrap();
    assert_eq!(counts.done, 4);
    assert_eq!(counts.failed, 0);
}

#[tokio::test]
async fn test_enqueue_after_dependency_failed() {
    let mut config = worker_config();
    config.max_attempts = 1;
    let fixture = Fixture::with_worker_config(config).await;

    let root = fixture
        .queue
        .submit(&metadata_payload("a"), JobPriority::High, None)
        .await
        .unwrap();
    let job = fixture.queue.claim_next().await.unwrap().unwrap();
    assert!(matches!(
        fixture.queue.mark_failed(&job.id, "broken").await.unwrap(),
        FailureOutcome::Failed { .. }
    ));

    let late = fixture
        .queue
        .submit(&metadata_payload("b"), JobPriority::Normal, Some(&root))
        .await
        .unwrap();
    let record = fixture.queue.get(&late).await.unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Failed);
    assert_eq!(record.attempts, 0);
    assert_eq!(
        record.last_error,
        Some(format!("Dependency {} failed", root))
    );
    assert!(record.finished_at.is_some());
    assert!(fixture.queue.claim_next().await.unwrap().is_none());

    // Retrying the root brings the late dependent back too
    let reset = fixture.queue.retry(&root).await.unwrap();
    assert_eq!(reset, vec![root.clone(), late.clone()]);
    let record = fixture.queue.get(&late).await.unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Pending);
}

#[tokio::test]
async fn test_enqueue_with_missing_dependency() {
    let fixture = Fixture::new().await;
    let missing = JobId::from("missing");

    let result = fixture
        .queue
        .submit(&metadata_payload("a"), JobPriority::Normal, Some(&missing))
        .await;
    assert!(matches!(result, Err(JobError::NotFound(id)) if id == "missing"));
    assert_eq!(fixture.queue.counts().await.unwrap().pending, 0);
}

#[tokio::test]
async fn test_retry_unknown_job() {
    let fixture = Fixture::new().await;
    assert!(matches!(
        fixture.queue.retry(&JobId::from("missing")).await,
        Err(JobError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_stale_running_jobs_are_requeued() {
    let fixture = Fixture::new().await;
    let id = fixture
        .queue
        .submit(&metadata_payload("a"), JobPriority::Normal, None)
        .await
        .unwrap();
    fixture.queue.claim_next().await.unwrap().unwrap();

    // A fresh queue over the same database, as after a restart
    let restarted = JobQueue::new(fixture.database.clone(), worker_config());
    assert_eq!(restarted.requeue_stale_running().await.unwrap(), 1);

    let job = restarted.get(&id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert!(job.started_at.is_none());
    assert_eq!(restarted.claim_next().await.unwrap().unwrap().id, id);
}

#[tokio::test]
async fn test_panicking_handler_counts_as_failure() {
    let mut config = worker_config();
    config.max_attempts = 1;
    let fixture = Fixture::with_worker_config(config).await;
    let id = fixture
        .queue
        .submit(&metadata_payload("a"), JobPriority::Normal, None)
        .await
        .unwrap();

    JobWorker::new(fixture.queue.clone(), JobHandlers::all(Arc::new(PanickingHandler)))
        .run_until_idle()
        .await
        .unwrap();

    let job = fixture.queue.get(&id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.last_error.unwrap().contains("panicked"));
}

#[tokio::test]
async fn test_missing_handler_counts_as_failure() {
    let mut config = worker_config();
    config.max_attempts = 1;
    let fixture = Fixture::with_worker_config(config).await;
    let id = fixture
        .queue
        .submit(&metadata_payload("a"), JobPriority::Normal, None)
        .await
        .unwrap();

    let handlers = JobHandlers::new().register(
        JobKind::Thumbnail,
        Arc::new(RecordingHandler::default()),
    );
    JobWorker::new(fixture.queue.clone(), handlers)
        .run_until_idle()
        .await
        .unwrap();

    let job = fixture.queue.get(&id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.last_error.unwrap().contains("No handler"));
}

#[tokio::test]
async fn test_spawned_worker_drains_queue() {
    let fixture = Fixture::new().await;
    let handler = Arc::new(RecordingHandler::default());
    let worker = JobWorker::new(fixture.queue.clone(), JobHandlers::all(handler.clone())).spawn();

    enqueue_video(&fixture, "v1").await;
    enqueue_video(&fixture, "v2").await;

    let drained = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if fixture.queue.counts().await.unwrap().done == 8 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    worker.shutdown().await;

    assert!(drained.is_ok(), "worker did not finish the queue");
    assert_eq!(handler.seen.lock().unwrap().len(), 8);
}
