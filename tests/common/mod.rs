#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use time::OffsetDateTime;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use transcode_pipeline::common::scratch::ScratchSpace;
use transcode_pipeline::config::settings::{AppConfig, LedgerBackend, StorageBackend};
use transcode_pipeline::infrastructure::storage::{StorageError, StorageGateway, StorageResult};
use transcode_pipeline::infrastructure::transcode::{TranscodeEngine, TranscodeError, TranscodeProfile};
use transcode_pipeline::modules::jobs::memory::MemoryJobLedger;
use transcode_pipeline::modules::jobs::model::{Job, JobState, NewJob};
use transcode_pipeline::modules::jobs::repository::{JobLedger, LedgerError, LedgerResult};
use transcode_pipeline::state::AppState;
use transcode_pipeline::workers::scheduler::{Scheduler, SchedulerConfig};
use transcode_pipeline::workers::transcoder::TranscodeWorker;

/// In-memory object store that records every publish.
#[derive(Default)]
pub struct RecordingStorage {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    published: Mutex<Vec<(PathBuf, String)>>,
    transient_fetch_failures: AtomicUsize,
}

impl RecordingStorage {
    pub fn with_object(self, key: &str) -> Self {
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), b"source video".to_vec());
        self
    }

    /// Make the next `n` fetches fail with a transient error.
    pub fn failing_fetches(self, n: usize) -> Self {
        self.transient_fetch_failures.store(n, Ordering::SeqCst);
        self
    }

    pub fn published(&self) -> Vec<(PathBuf, String)> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl StorageGateway for RecordingStorage {
    async fn fetch(&self, remote_key: &str, local_path: &Path) -> StorageResult<()> {
        let remaining = self.transient_fetch_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_fetch_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(StorageError::Transient("503 Slow Down".into()));
        }

        let body = self.objects.lock().unwrap().get(remote_key).cloned();
        match body {
            Some(body) => {
                tokio::fs::write(local_path, body).await?;
                Ok(())
            }
            None => Err(StorageError::NotFound(remote_key.to_string())),
        }
    }

    async fn publish(&self, local_path: &Path, remote_key: &str) -> StorageResult<()> {
        let body = tokio::fs::read(local_path).await?;
        self.objects.lock().unwrap().insert(remote_key.to_string(), body);
        self.published
            .lock()
            .unwrap()
            .push((local_path.to_path_buf(), remote_key.to_string()));
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineScript {
    Succeed,
    AlwaysFail,
    /// Run until cancelled.
    Block,
}

pub struct ScriptedEngine {
    script: EngineScript,
    calls: AtomicUsize,
}

impl ScriptedEngine {
    pub fn new(script: EngineScript) -> Self {
        Self {
            script,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TranscodeEngine for ScriptedEngine {
    async fn transcode(
        &self,
        input: &Path,
        output: &Path,
        profile: &TranscodeProfile,
        cancel: &CancellationToken,
    ) -> Result<(), TranscodeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        assert!(input.exists(), "engine started without an input file");

        match self.script {
            EngineScript::Succeed => {
                tokio::fs::write(output, format!("encoded at {}", profile.name))
                    .await
                    .map_err(TranscodeError::Spawn)?;
                Ok(())
            }
            EngineScript::AlwaysFail => Err(TranscodeError::Engine {
                reason: "exit status 1: Invalid data found when processing input".into(),
            }),
            EngineScript::Block => {
                // Leave a partial output behind, like a killed encoder would.
                let _ = tokio::fs::write(output, b"partial").await;
                cancel.cancelled().await;
                Err(TranscodeError::Cancelled)
            }
        }
    }
}

/// Ledger wrapper that can lose its connection or stall retry writes.
pub struct FlakyLedger {
    inner: Arc<MemoryJobLedger>,
    broken: AtomicBool,
    failures_broken: AtomicBool,
    requeue_delay_ms: AtomicU64,
    requeue_started: Notify,
}

impl FlakyLedger {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MemoryJobLedger::new()),
            broken: AtomicBool::new(false),
            failures_broken: AtomicBool::new(false),
            requeue_delay_ms: AtomicU64::new(0),
            requeue_started: Notify::new(),
        }
    }

    /// The rows underneath, as a restarted process would find them.
    pub fn inner(&self) -> Arc<MemoryJobLedger> {
        self.inner.clone()
    }

    /// Every transition fails from now on.
    pub fn break_now(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }

    /// Only the write that closes a failed attempt fails.
    pub fn break_failure_writes(&self) {
        self.failures_broken.store(true, Ordering::SeqCst);
    }

    /// Hold every requeue write for `delay` before applying it.
    pub fn slow_requeues(&self, delay: Duration) {
        self.requeue_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Resolves once a requeue write has started.
    pub async fn requeue_started(&self) {
        self.requeue_started.notified().await;
    }
}

#[async_trait]
impl JobLedger for FlakyLedger {
    async fn create(&self, job: NewJob) -> LedgerResult<Job> {
        self.inner.create(job).await
    }

    async fn transition(&self, id: Uuid, from: JobState, to: JobState) -> LedgerResult<Job> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(LedgerError::Unavailable("connection reset".into()));
        }
        self.inner.transition(id, from, to).await
    }

    async fn record_error(&self, id: Uuid, error: &str) -> LedgerResult<Job> {
        self.inner.record_error(id, error).await
    }

    async fn fail(&self, id: Uuid, from: JobState, error: &str, requeue: bool) -> LedgerResult<Job> {
        if self.broken.load(Ordering::SeqCst) || self.failures_broken.load(Ordering::SeqCst) {
            return Err(LedgerError::Unavailable("connection reset".into()));
        }
        let delay = self.requeue_delay_ms.load(Ordering::SeqCst);
        if requeue && delay > 0 {
            self.requeue_started.notify_one();
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.inner.fail(id, from, error, requeue).await
    }

    async fn get(&self, id: Uuid) -> LedgerResult<Option<Job>> {
        self.inner.get(id).await
    }

    async fn list_stale(&self, older_than: OffsetDateTime) -> LedgerResult<Vec<Job>> {
        self.inner.list_stale(older_than).await
    }

    async fn mark_recovered(&self, id: Uuid) -> LedgerResult<Job> {
        self.inner.mark_recovered(id).await
    }
}

pub fn test_config() -> SchedulerConfig {
    SchedulerConfig {
        concurrency: 2,
        queue_capacity: 0,
        max_attempts: 3,
        retry_backoff_base: Duration::from_millis(5),
        retry_backoff_max: Duration::from_millis(20),
        stale_job_deadline: Duration::from_secs(3600),
        stale_sweep_interval: Duration::ZERO,
    }
}

pub struct Harness {
    pub ledger: Arc<dyn JobLedger>,
    pub storage: Arc<RecordingStorage>,
    pub engine: Arc<ScriptedEngine>,
    pub scheduler: Scheduler,
    pub scratch: ScratchSpace,
    _scratch_dir: TempDir,
}

impl Harness {
    pub async fn new(storage: RecordingStorage, script: EngineScript, config: SchedulerConfig) -> Self {
        Self::with_ledger(Arc::new(MemoryJobLedger::new()), storage, script, config).await
    }

    pub async fn with_ledger(
        ledger: Arc<dyn JobLedger>,
        storage: RecordingStorage,
        script: EngineScript,
        config: SchedulerConfig,
    ) -> Self {
        let scratch_dir = tempfile::tempdir().unwrap();
        let scratch = ScratchSpace::new(scratch_dir.path()).await.unwrap();
        let storage = Arc::new(storage);
        let engine = Arc::new(ScriptedEngine::new(script));
        let worker = TranscodeWorker::new(storage.clone(), engine.clone(), scratch.clone());
        let scheduler = Scheduler::new(ledger.clone(), worker, config);

        Self {
            ledger,
            storage,
            engine,
            scheduler,
            scratch,
            _scratch_dir: scratch_dir,
        }
    }

    /// Admit, create and enqueue, the way the submit endpoint does.
    pub async fn submit(&self, source_key: &str, destination_key: &str) -> Job {
        let admission = self.scheduler.try_admit().expect("capacity available");
        let job = self
            .ledger
            .create(NewJob {
                source_key: source_key.to_string(),
                destination_key: destination_key.to_string(),
                profile: "360p".to_string(),
                max_attempts: self.scheduler.config().max_attempts,
            })
            .await
            .unwrap();
        self.scheduler.enqueue(admission, &job);
        job
    }

    pub async fn job(&self, id: Uuid) -> Job {
        self.ledger.get(id).await.unwrap().expect("job exists")
    }

    pub async fn wait_for_state(&self, id: Uuid, state: JobState) -> Job {
        wait_for(self.ledger.as_ref(), id, |job| job.state == state).await
    }

    pub async fn wait_for_terminal(&self, id: Uuid) -> Job {
        wait_for(self.ledger.as_ref(), id, |job| {
            matches!(job.state, JobState::Done | JobState::Failed)
        })
        .await
    }

    pub fn scratch_exists(&self, id: Uuid) -> bool {
        self.scratch.job_dir(id).exists()
    }

    pub fn app_state(&self) -> AppState {
        AppState::new(app_config(self.scheduler.config()), self.ledger.clone(), self.scheduler.clone())
    }
}

pub async fn wait_for<F>(ledger: &dyn JobLedger, id: Uuid, done: F) -> Job
where
    F: Fn(&Job) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let job = ledger.get(id).await.unwrap().expect("job exists");
        if done(&job) {
            return job;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting on job {}: last seen {:?}", id, job);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub fn app_config(scheduler: &SchedulerConfig) -> AppConfig {
    AppConfig {
        server_port: 0,
        ledger_backend: LedgerBackend::Memory,
        database_url: None,
        storage_backend: StorageBackend::Local,
        s3: None,
        local_storage_root: PathBuf::from("unused"),
        worker_concurrency: scheduler.concurrency,
        queue_capacity: scheduler.queue_capacity,
        max_attempts: scheduler.max_attempts,
        retry_backoff_base_ms: scheduler.retry_backoff_base.as_millis() as u64,
        retry_backoff_max_ms: scheduler.retry_backoff_max.as_millis() as u64,
        scratch_dir: PathBuf::from("unused"),
        stale_job_deadline_secs: scheduler.stale_job_deadline.as_secs(),
        stale_sweep_interval_secs: scheduler.stale_sweep_interval.as_secs(),
        ffmpeg_path: "ffmpeg".to_string(),
        ffprobe_path: None,
        transcode_profile: "360p".to_string(),
    }
}

/// A ledger row as a previous process might have left it.
pub fn orphaned_job(state: JobState, attempt: i32, recoveries: i32) -> Job {
    let long_ago = OffsetDateTime::now_utc() - time::Duration::hours(2);
    Job {
        id: Uuid::new_v4(),
        source_key: "a.mp4".to_string(),
        destination_key: "a-360p.mp4".to_string(),
        profile: "360p".to_string(),
        state,
        attempt,
        max_attempts: 3,
        recoveries,
        last_error: None,
        created_at: long_ago,
        updated_at: long_ago,
    }
}
