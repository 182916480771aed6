//! Queue integration tests against a live Redis.

use vingest_models::{ImportResult, ImportSpec, JobState, SourceKind};
use vingest_queue::{ImportQueue, QueueConfig, RecoveryStore};

fn test_queue() -> ImportQueue {
    dotenvy::dotenv().ok();
    ImportQueue::new(QueueConfig::from_env()).expect("Failed to create queue")
}

fn unique_spec() -> ImportSpec {
    let mut spec = ImportSpec::new(SourceKind::Url, "https://example.com/test.mp4")
        .with_file_name("test.mp4");
    spec.request_id = vingest_models::JobId::from_string(format!("it-{}", uuid::Uuid::new_v4()));
    spec
}

/// Submit is idempotent on request id while the job is non-terminal.
#[tokio::test]
#[ignore = "requires Redis"]
async fn test_submit_idempotency() {
    let queue = test_queue();
    let spec = unique_spec();
    let id = spec.request_id.clone();

    let first = queue.submit(spec.clone()).await.expect("Failed to submit");
    let second = queue.submit(spec).await.expect("Failed to resubmit");

    assert_eq!(first.id(), second.id());
    assert_eq!(second.status, JobState::Waiting);

    let counts = queue.counts_by_status().await.expect("counts");
    assert!(counts.waiting >= 1);

    queue.retry(&id).await.ok();
}

/// Lease, complete, and observe the terminal record.
#[tokio::test]
#[ignore = "requires Redis"]
async fn test_lease_and_complete() {
    let queue = test_queue();
    let spec = unique_spec();
    let id = spec.request_id.clone();

    queue.submit(spec).await.expect("Failed to submit");

    // Drain other waiting jobs until we see ours.
    let mut leased = None;
    for _ in 0..50 {
        match queue.lease("test-worker").await.expect("lease") {
            Some(job) if job.id() == &id => {
                leased = Some(job);
                break;
            }
            Some(other) => {
                queue
                    .fail(other.id(), "leased by accident in test", false)
                    .await
                    .ok();
            }
            None => break,
        }
    }
    let job = leased.expect("our job should be leasable");
    assert_eq!(job.status, JobState::Active);

    queue
        .complete(
            &id,
            ImportResult {
                cdn_url: "https://cdn.example.com/test-00000000.mp4".into(),
                file_name: "test-00000000.mp4".into(),
                size: 42,
                attempts_made: 0,
                egress_attempts: Vec::new(),
            },
        )
        .await
        .expect("complete");

    let stored = queue.get(&id).await.expect("get").expect("exists");
    assert_eq!(stored.status, JobState::Completed);
    assert!(stored.return_value.is_some());
    assert!(stored.failure_reason.is_none());
}

/// A retryable failure parks the job in delayed; rearm moves it back.
#[tokio::test]
#[ignore = "requires Redis"]
async fn test_retryable_failure_and_rearm() {
    let queue = test_queue();
    let spec = unique_spec();
    let id = spec.request_id.clone();

    queue.submit(spec).await.expect("submit");
    loop {
        match queue.lease("test-worker").await.expect("lease") {
            Some(job) if job.id() == &id => break,
            Some(other) => {
                queue.fail(other.id(), "test drain", false).await.ok();
            }
            None => panic!("job not leasable"),
        }
    }

    queue
        .fail(&id, "connection reset", true)
        .await
        .expect("fail");
    let stored = queue.get(&id).await.expect("get").expect("exists");
    assert_eq!(stored.status, JobState::Delayed);
    assert_eq!(stored.attempts_made, 1);

    // The job only re-arms once its backoff expired, so nothing moves
    // immediately after the failure.
    let moved = queue.rearm_due().await.expect("rearm");
    let stored = queue.get(&id).await.expect("get").expect("exists");
    if moved == 0 {
        assert_eq!(stored.status, JobState::Delayed);
    }

    queue.retry(&id).await.expect("manual retry");
    let stored = queue.get(&id).await.expect("get").expect("exists");
    assert_eq!(stored.status, JobState::Waiting);
}

/// kill_active makes the job terminal and raises the cancel flag.
#[tokio::test]
#[ignore = "requires Redis"]
async fn test_kill_active() {
    let queue = test_queue();
    let spec = unique_spec();
    let id = spec.request_id.clone();

    queue.submit(spec).await.expect("submit");
    loop {
        match queue.lease("test-worker").await.expect("lease") {
            Some(job) if job.id() == &id => break,
            Some(other) => {
                queue.fail(other.id(), "test drain", false).await.ok();
            }
            None => panic!("job not leasable"),
        }
    }

    queue.kill_active(&id).await.expect("kill");
    assert!(queue.is_cancelled(&id).await.expect("cancel flag"));

    let stored = queue.get(&id).await.expect("get").expect("exists");
    assert_eq!(stored.status, JobState::Failed);
    assert_eq!(stored.failure_reason.as_deref(), Some("manually killed"));

    // The worker's own completion races the kill and must lose.
    queue
        .complete(
            &id,
            ImportResult {
                cdn_url: "https://cdn.example.com/x.mp4".into(),
                file_name: "x.mp4".into(),
                size: 1,
                attempts_made: 0,
                egress_attempts: Vec::new(),
            },
        )
        .await
        .expect("complete is a no-op");
    let stored = queue.get(&id).await.expect("get").expect("exists");
    assert_eq!(stored.status, JobState::Failed);
}

/// Recovery records round-trip with temp files and survive heartbeats.
#[tokio::test]
#[ignore = "requires Redis"]
async fn test_recovery_record_roundtrip() {
    dotenvy::dotenv().ok();
    let redis_url =
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());
    let store = RecoveryStore::new(&redis_url).expect("store");

    let spec = unique_spec();
    let id = spec.request_id.clone();
    let record = vingest_models::RecoveryRecord::open(id.clone(), spec);
    store.open(record).await.expect("open");

    store
        .track_temp_file(&id, "/tmp/vingest/it-test.mp4")
        .await
        .expect("track");
    store.heartbeat(&id).await.expect("heartbeat");

    let loaded = store.get(&id).await.expect("get").expect("exists");
    assert_eq!(loaded.temp_files, vec!["/tmp/vingest/it-test.mp4"]);

    store.remove(&id).await.expect("remove");
    assert!(store.get(&id).await.expect("get").is_none());
}
