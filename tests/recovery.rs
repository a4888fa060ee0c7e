mod common;

use std::sync::Arc;

use std::time::Duration;

use common::{EngineScript, FlakyLedger, Harness, RecordingStorage, orphaned_job, test_config};
use transcode_pipeline::modules::jobs::memory::MemoryJobLedger;
use transcode_pipeline::modules::jobs::model::{Job, JobState};

async fn harness_with(jobs: Vec<Job>) -> Harness {
    let ledger = Arc::new(MemoryJobLedger::new());
    for job in jobs {
        ledger.insert(job).await;
    }
    Harness::with_ledger(
        ledger,
        RecordingStorage::default().with_object("a.mp4"),
        EngineScript::Succeed,
        test_config(),
    )
    .await
}

#[tokio::test]
async fn recovery_leaves_finished_jobs_alone() {
    let done = orphaned_job(JobState::Done, 1, 0);
    let failed = orphaned_job(JobState::Failed, 3, 0);
    // Permanent failures end FAILED with attempts to spare.
    let missing = Job {
        last_error: Some("NotFound: object a.mp4 not found".to_string()),
        ..orphaned_job(JobState::Failed, 1, 0)
    };
    let h = harness_with(vec![done.clone(), failed.clone(), missing.clone()]).await;

    for _ in 0..2 {
        let report = h.scheduler.recover().await.unwrap();
        assert_eq!(report.resumed + report.failed, 0);
    }
    h.scheduler.start();
    tokio::task::yield_now().await;

    let after = h.job(done.id).await;
    assert_eq!(after.state, JobState::Done);
    assert_eq!(after.updated_at, done.updated_at);
    assert_eq!(h.job(failed.id).await.state, JobState::Failed);
    let still_missing = h.job(missing.id).await;
    assert_eq!(still_missing.state, JobState::Failed);
    assert_eq!(still_missing.attempt, 1);
    assert_eq!(still_missing.last_error, missing.last_error);
    assert_eq!(h.engine.calls(), 0);
    assert!(h.storage.published().is_empty());
}

#[tokio::test]
async fn pending_jobs_are_resumed() {
    let pending = orphaned_job(JobState::Pending, 0, 0);
    let h = harness_with(vec![pending.clone()]).await;

    let report = h.scheduler.recover().await.unwrap();
    assert_eq!(report.resumed, 1);
    h.scheduler.start();

    let done = h.wait_for_terminal(pending.id).await;
    assert_eq!(done.state, JobState::Done);
    assert_eq!(done.attempt, 1);
    assert_eq!(done.recoveries, 0);
}

#[tokio::test]
async fn interrupted_job_is_retried_once_with_fresh_scratch() {
    let interrupted = orphaned_job(JobState::Transcoding, 1, 0);
    let h = harness_with(vec![interrupted.clone()]).await;

    let leftover = h.scratch.job_dir(interrupted.id);
    std::fs::create_dir_all(&leftover).unwrap();
    std::fs::write(leftover.join("output-360p.mp4"), b"half written").unwrap();

    let report = h.scheduler.recover().await.unwrap();
    assert_eq!(report.resumed, 1);
    assert!(!leftover.exists());

    let requeued = h.job(interrupted.id).await;
    assert_eq!(requeued.state, JobState::Pending);
    assert_eq!(requeued.recoveries, 1);

    h.scheduler.start();
    let done = h.wait_for_terminal(interrupted.id).await;
    assert_eq!(done.state, JobState::Done);
    assert_eq!(done.attempt, 2);
    assert_eq!(h.storage.published().len(), 1);
    assert!(!h.scratch_exists(interrupted.id));
}

#[tokio::test]
async fn repeatedly_interrupted_job_is_failed() {
    let twice = orphaned_job(JobState::Uploading, 2, 1);
    let exhausted = orphaned_job(JobState::Downloading, 3, 0);
    let h = harness_with(vec![twice.clone(), exhausted.clone()]).await;

    let report = h.scheduler.recover().await.unwrap();
    assert_eq!(report.failed, 2);
    assert_eq!(report.resumed, 0);

    for id in [twice.id, exhausted.id] {
        let job = h.job(id).await;
        assert_eq!(job.state, JobState::Failed);
        assert!(job.last_error.as_deref().unwrap().starts_with("Interrupted"));
    }
    assert_eq!(h.engine.calls(), 0);
}

#[tokio::test]
async fn recovery_skips_jobs_already_tracked() {
    let pending = orphaned_job(JobState::Pending, 0, 0);
    let h = harness_with(vec![pending.clone()]).await;

    assert_eq!(h.scheduler.recover().await.unwrap().resumed, 1);
    // Second pass sees the same row but the scheduler already owns it.
    let again = h.scheduler.recover().await.unwrap();
    assert_eq!(again.resumed, 0);
    assert_eq!(h.scheduler.tracked(), 1);
}

#[tokio::test]
async fn crash_at_the_retry_write_leaves_the_job_resumable() {
    let ledger = Arc::new(FlakyLedger::new());
    ledger.break_failure_writes();
    let first = Harness::with_ledger(
        ledger.clone(),
        RecordingStorage::default().with_object("a.mp4").failing_fetches(1),
        EngineScript::Succeed,
        test_config(),
    )
    .await;
    let fatal = first.scheduler.fatal_signal();
    first.scheduler.start();

    let job = first.submit("a.mp4", "a-360p.mp4").await;
    tokio::time::timeout(Duration::from_secs(5), fatal.cancelled())
        .await
        .expect("failed retry write halts the service");

    // Nothing half-written: the row still shows the interrupted stage.
    let orphan = first.job(job.id).await;
    assert_eq!(orphan.state, JobState::Downloading);
    assert_eq!(orphan.attempt, 1);
    assert!(orphan.last_error.is_none());

    let restarted = Harness::with_ledger(
        ledger.inner(),
        RecordingStorage::default().with_object("a.mp4"),
        EngineScript::Succeed,
        test_config(),
    )
    .await;
    assert_eq!(restarted.scheduler.recover().await.unwrap().resumed, 1);
    restarted.scheduler.start();

    let done = restarted.wait_for_terminal(job.id).await;
    assert_eq!(done.state, JobState::Done);
    assert_eq!(done.attempt, 2);
    assert_eq!(restarted.storage.published().len(), 1);
}
