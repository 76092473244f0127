use std::collections::HashSet;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use serde_json::json;

use dog_jobsdb::{
    ClaimRequest, JobFilter, JobId, JobState, JobsDb, JobsDbConfig, JobsDbError, JobsDbEvent,
    MemoryBackend, NewJob, QueryCursor, SetupMode, StatusUpdate, RESET_ERROR_CODE,
};

/// Test factory functions
fn config() -> JobsDbConfig {
    JobsDbConfig::new("gw")
}

fn new_job(n: usize) -> NewJob {
    NewJob::new(format!("user-{}", n % 3), format!("{{\"n\":{n}}}").into_bytes())
        .with_custom_val("WEBHOOK")
        .with_parameters(json!({ "source_id": "src-1", "n": n }))
}

async fn open(backend: &MemoryBackend, config: JobsDbConfig) -> JobsDb {
    let db = JobsDb::builder(backend.clone()).config(config).build().unwrap();
    db.setup(SetupMode::Migrate).await.unwrap();
    db
}

async fn enqueue_n(db: &JobsDb, n: usize) -> Vec<JobId> {
    db.enqueue_batch((0..n).map(new_job).collect()).await.unwrap()
}

/// Operations refuse to run until setup finished
#[tokio::test]
async fn test_not_ready_before_setup() {
    let db = JobsDb::builder(MemoryBackend::new()).config(config()).build().unwrap();
    assert!(!db.is_ready());

    let err = db.enqueue(new_job(1)).await.unwrap_err();
    assert!(matches!(err, JobsDbError::NotReady));
    assert!(err.is_retryable());

    let mut stream = db.query(JobFilter::new());
    assert!(matches!(stream.next().await, Some(Err(JobsDbError::NotReady))));
    assert!(stream.next().await.is_none());

    db.setup(SetupMode::Migrate).await.unwrap();
    assert!(db.is_ready());
    db.enqueue(new_job(1)).await.unwrap();

    db.teardown().await.unwrap();
    assert!(matches!(db.enqueue(new_job(2)).await, Err(JobsDbError::NotReady)));
}

/// Enqueued jobs come back from queries unchanged, waiting, in id order
#[tokio::test]
async fn test_enqueue_query_round_trip() {
    let db = open(&MemoryBackend::new(), config()).await;
    let ids = enqueue_n(&db, 3).await;
    assert_eq!(ids, vec![JobId(1), JobId(2), JobId(3)]);

    let filter = JobFilter::new()
        .custom_vals(["WEBHOOK"])
        .parameter("source_id", "src-1");
    let page = db.query_page(&filter, None, 10).await.unwrap();
    assert_eq!(page.jobs.len(), 3);
    assert!(page.is_last());
    for (found, n) in page.jobs.iter().zip(0..) {
        assert_eq!(found.job.payload, format!("{{\"n\":{n}}}").into_bytes());
        assert_eq!(found.state(), JobState::Waiting);
        assert_eq!(found.attempt(), 0);
        assert_eq!(found.dataset.to_string(), "1");
    }

    // Non-string parameters compare by their text form
    let one = db
        .query_page(&JobFilter::new().parameter("n", "1"), None, 10)
        .await
        .unwrap();
    assert_eq!(one.jobs.len(), 1);
    assert_eq!(one.jobs[0].job_id(), JobId(2));

    let none = db
        .query_page(&JobFilter::new().custom_vals(["ROUTER"]), None, 10)
        .await
        .unwrap();
    assert!(none.jobs.is_empty());
    assert!(none.next.is_none());

    let fetched = db.get(JobId(3)).await.unwrap();
    assert_eq!(fetched.job.ordering_key, "user-2");
    assert!(matches!(db.get(JobId(99)).await, Err(JobsDbError::JobNotFound(_))));
}

/// Concurrent consumers never receive the same job
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_claims_are_disjoint() {
    let db = open(&MemoryBackend::new(), config()).await;
    enqueue_n(&db, 200).await;

    let mut workers = Vec::new();
    for w in 0..8 {
        let db = db.clone();
        workers.push(tokio::spawn(async move {
            let mut mine = Vec::new();
            loop {
                let batch = db
                    .claim(ClaimRequest::new(format!("worker-{w}"), 7))
                    .await
                    .unwrap();
                if batch.is_empty() {
                    return mine;
                }
                mine.extend(batch.into_iter().map(|found| found.job_id()));
            }
        }));
    }

    let mut all = Vec::new();
    for worker in workers {
        all.extend(worker.await.unwrap());
    }
    let unique: HashSet<JobId> = all.iter().copied().collect();
    assert_eq!(all.len(), 200);
    assert_eq!(unique.len(), 200);

    let stats = db.stats().await.unwrap();
    assert_eq!(stats.totals.executing, 200);
    assert_eq!(stats.totals.waiting, 0);
}

/// The latest appended status is current, whatever its timestamps say
#[tokio::test]
async fn test_current_status_is_last_appended() {
    let db = open(&MemoryBackend::new(), config()).await;
    let id = db.enqueue(new_job(1)).await.unwrap();
    let claimed = db.claim(ClaimRequest::new("w", 1)).await.unwrap();
    assert_eq!(claimed[0].state(), JobState::Executing);
    assert_eq!(claimed[0].attempt(), 1);
    assert_eq!(claimed[0].status.worker.as_deref(), Some("w"));

    let an_hour_ago = Utc::now() - chrono::Duration::hours(1);
    db.update_status(StatusUpdate::succeeded(id).with_exec_time(an_hour_ago))
        .await
        .unwrap();

    let current = db.get(id).await.unwrap();
    assert_eq!(current.state(), JobState::Succeeded);
    assert_eq!(current.status.exec_time, an_hour_ago);

    let history: Vec<JobState> = db
        .status_history(id)
        .await
        .unwrap()
        .into_iter()
        .map(|status| status.state)
        .collect();
    assert_eq!(
        history,
        vec![JobState::Waiting, JobState::Executing, JobState::Succeeded]
    );
}

/// Only executing jobs accept a result, and only once
#[tokio::test]
async fn test_invalid_transitions() {
    let db = open(&MemoryBackend::new(), config()).await;
    let ids = enqueue_n(&db, 2).await;

    let err = db.update_status(StatusUpdate::succeeded(ids[0])).await.unwrap_err();
    assert!(matches!(
        err,
        JobsDbError::InvalidTransition { from: Some(JobState::Waiting), to: JobState::Succeeded, .. }
    ));

    db.claim(ClaimRequest::new("w", 2)).await.unwrap();
    db.update_status(StatusUpdate::succeeded(ids[0])).await.unwrap();
    let err = db.update_status(StatusUpdate::succeeded(ids[0])).await.unwrap_err();
    assert!(matches!(
        err,
        JobsDbError::InvalidTransition { from: Some(JobState::Succeeded), .. }
    ));
    assert!(!err.is_retryable());

    let err = db.update_status(StatusUpdate::succeeded(JobId(404))).await.unwrap_err();
    assert!(matches!(err, JobsDbError::InvalidTransition { from: None, .. }));

    // One bad update rejects the whole batch
    let err = db
        .update_statuses(vec![
            StatusUpdate::aborted(ids[1], "bad_payload"),
            StatusUpdate::succeeded(ids[0]),
        ])
        .await
        .unwrap_err();
    assert!(matches!(err, JobsDbError::InvalidTransition { .. }));
    assert_eq!(db.get(ids[1]).await.unwrap().state(), JobState::Executing);
}

/// Failed jobs come back once their retry time passed, with the next attempt
#[tokio::test]
async fn test_failed_jobs_retry_after_retry_time() {
    let db = open(&MemoryBackend::new(), config()).await;
    let id = db.enqueue(new_job(1)).await.unwrap();
    db.claim(ClaimRequest::new("w", 1)).await.unwrap();

    let later = Utc::now() + chrono::Duration::hours(1);
    db.update_status(
        StatusUpdate::failed(id, "503")
            .with_retry_time(later)
            .with_error_response(json!({ "body": "unavailable" })),
    )
    .await
    .unwrap();
    assert!(db.claim(ClaimRequest::new("w", 1)).await.unwrap().is_empty());

    let id2 = db.enqueue(new_job(2)).await.unwrap();
    let claimed = db.claim(ClaimRequest::new("w", 5)).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].job_id(), id2);

    db.update_status(StatusUpdate::failed(id2, "500")).await.unwrap();
    let retried = db.claim(ClaimRequest::new("w2", 5)).await.unwrap();
    assert_eq!(retried.len(), 1);
    assert_eq!(retried[0].job_id(), id2);
    assert_eq!(retried[0].attempt(), 2);
}

/// A cursor walks jobs 1..=8 in order across a rotation
#[tokio::test]
async fn test_cursor_spans_rotation() {
    let db = open(&MemoryBackend::new(), config()).await;
    enqueue_n(&db, 4).await;
    assert_eq!(db.rotate_now().await.unwrap().map(|index| index.to_string()), Some("2".into()));
    enqueue_n(&db, 4).await;

    let mut seen = Vec::new();
    let mut cursor: Option<QueryCursor> = None;
    loop {
        let page = db.query_page(&JobFilter::new(), cursor.as_ref(), 3).await.unwrap();
        seen.extend(page.jobs.iter().map(|found| found.job_id().0));
        if page.is_last() {
            break;
        }
        // Tokens survive a trip through the caller
        let token = page.next.unwrap().encode();
        cursor = Some(token.parse().unwrap());
    }
    assert_eq!(seen, (1..=8).collect::<Vec<i64>>());

    let streamed: Vec<i64> = db
        .query(JobFilter::new())
        .map(|found| found.unwrap().job_id().0)
        .collect()
        .await;
    assert_eq!(streamed, seen);

    let resumed: Vec<i64> = db
        .query_from(JobFilter::new(), Some(QueryCursor::new("1".parse().unwrap(), JobId(6))))
        .map(|found| found.unwrap().job_id().0)
        .collect()
        .await;
    assert_eq!(resumed, vec![7, 8]);
}

/// Cursors handed out before a rotation resume across it without gaps or repeats
#[tokio::test]
async fn test_cursor_issued_before_rotation() {
    let db = open(&MemoryBackend::new(), config()).await;
    enqueue_n(&db, 5).await;

    let first = db.query_page(&JobFilter::new(), None, 2).await.unwrap();
    let mut seen: Vec<i64> = first.jobs.iter().map(|found| found.job_id().0).collect();
    let token = first.next.unwrap().encode();
    // Points at the last job of the dataset about to be sealed
    let tail = db.query_page(&JobFilter::new(), None, 5).await.unwrap();
    let tail_cursor = tail.next.unwrap();

    assert_eq!(db.rotate_now().await.unwrap().map(|index| index.to_string()), Some("2".into()));
    enqueue_n(&db, 3).await;

    let mut cursor: Option<QueryCursor> = Some(token.parse().unwrap());
    loop {
        let page = db.query_page(&JobFilter::new(), cursor.as_ref(), 2).await.unwrap();
        seen.extend(page.jobs.iter().map(|found| found.job_id().0));
        if page.is_last() {
            break;
        }
        cursor = page.next;
    }
    assert_eq!(seen, (1..=8).collect::<Vec<i64>>());
    assert_eq!(seen.iter().collect::<HashSet<_>>().len(), seen.len());

    let after_tail = db.query_page(&JobFilter::new(), Some(&tail_cursor), 10).await.unwrap();
    let found: Vec<(i64, String)> = after_tail
        .jobs
        .iter()
        .map(|found| (found.job_id().0, found.dataset.to_string()))
        .collect();
    assert_eq!(
        found,
        vec![(6, "2".to_string()), (7, "2".to_string()), (8, "2".to_string())]
    );
}

/// A transient storage fault writes nothing and can be retried
#[tokio::test]
async fn test_write_fault_is_retryable() {
    let backend = MemoryBackend::new();
    let db = open(&backend, config()).await;

    backend.fail_next_writes(1);
    let err = db.enqueue_batch(vec![new_job(1), new_job(2)]).await.unwrap_err();
    assert!(matches!(err, JobsDbError::Write(_)));
    assert!(err.is_retryable());
    assert_eq!(db.stats().await.unwrap().totals.total(), 0);

    db.enqueue_batch(vec![new_job(1), new_job(2)]).await.unwrap();
    assert_eq!(db.stats().await.unwrap().totals.waiting, 2);
    assert_eq!(db.metrics().write_errors, 1);
}

/// Jobs left executing by a crashed process are failed on startup
#[tokio::test]
async fn test_reset_executing_on_startup() {
    let backend = MemoryBackend::new();
    let first = open(&backend, config()).await;
    enqueue_n(&first, 3).await;
    first.claim(ClaimRequest::new("crashed", 2)).await.unwrap();

    let second = JobsDb::builder(backend.clone())
        .config(config().with_reset_executing_on_startup(true))
        .build()
        .unwrap();
    let report = second.setup(SetupMode::Migrate).await.unwrap();
    assert_eq!(report.reset, 2);

    let reset = second.get(JobId(1)).await.unwrap();
    assert_eq!(reset.state(), JobState::Failed);
    assert_eq!(reset.status.error_code.as_deref(), Some(RESET_ERROR_CODE));

    let reclaimed = second.claim(ClaimRequest::new("w", 10)).await.unwrap();
    assert_eq!(reclaimed.len(), 3);
}

/// Claims honour their deadline
#[tokio::test]
async fn test_claim_with_timeout_and_filter() {
    let db = open(&MemoryBackend::new(), config()).await;
    enqueue_n(&db, 6).await;

    let request = ClaimRequest::new("w", 10)
        .with_filter(JobFilter::new().ordering_keys(["user-0"]))
        .with_timeout(Duration::from_secs(5));
    let claimed = db.claim(request).await.unwrap();
    let ids: Vec<i64> = claimed.iter().map(|found| found.job_id().0).collect();
    assert_eq!(ids, vec![1, 4]);
}

/// Producers and consumers are visible on the event stream
#[tokio::test]
async fn test_events_are_broadcast() {
    let db = open(&MemoryBackend::new(), config()).await;
    let mut events = db.subscribe();

    let id = db.enqueue(new_job(1)).await.unwrap();
    db.claim(ClaimRequest::new("w", 1)).await.unwrap();
    db.update_status(StatusUpdate::succeeded(id)).await.unwrap();

    let mut names = Vec::new();
    for _ in 0..3 {
        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("Timeout waiting for event")
            .expect("Event receive error");
        if let JobsDbEvent::Enqueued { job_ids, .. } = &event {
            assert_eq!(job_ids, &vec![id]);
        }
        names.push(event.event_name());
    }
    assert_eq!(names, vec!["enqueued", "claimed", "status_updated"]);

    let metrics = db.metrics();
    assert_eq!(metrics.jobs_enqueued, 1);
    assert_eq!(metrics.jobs_claimed, 1);
    assert_eq!(metrics.jobs_succeeded, 1);
}
