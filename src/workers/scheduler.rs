//! Job scheduler: admission control, FIFO dispatch onto a bounded worker
//! pool, retry with exponential backoff, crash recovery and cancellation.
//!
//! The ledger stays the source of truth. The scheduler only keeps the
//! in-memory bookkeeping needed to bound concurrency: which admitted jobs are
//! queued, waiting out a backoff, or running in this process.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::config::settings::AppConfig;
use crate::modules::jobs::model::{Job, JobState};
use crate::modules::jobs::repository::{JobLedger, LedgerError, LedgerResult};
use crate::workers::transcoder::{Disposition, JobFailure, PipelineError, TranscodeWorker};

#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    /// Maximum jobs transcoding at once.
    pub concurrency: usize,
    /// Admitted jobs allowed to wait beyond the running ones.
    pub queue_capacity: usize,
    pub max_attempts: i32,
    pub retry_backoff_base: Duration,
    pub retry_backoff_max: Duration,
    pub stale_job_deadline: Duration,
    /// Zero disables the periodic sweep; startup recovery still runs.
    pub stale_sweep_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            queue_capacity: 0,
            max_attempts: 3,
            retry_backoff_base: Duration::from_secs(1),
            retry_backoff_max: Duration::from_secs(300),
            stale_job_deadline: Duration::from_secs(3600),
            stale_sweep_interval: Duration::from_secs(60),
        }
    }
}

impl SchedulerConfig {
    pub fn from_app(config: &AppConfig) -> Self {
        Self {
            concurrency: config.worker_concurrency,
            queue_capacity: config.queue_capacity,
            max_attempts: config.max_attempts,
            retry_backoff_base: config.retry_backoff_base(),
            retry_backoff_max: config.retry_backoff_max(),
            stale_job_deadline: config.stale_job_deadline(),
            stale_sweep_interval: config.stale_sweep_interval(),
        }
    }

    /// Exponential backoff for the retry after `attempt` (1-based), capped,
    /// plus up to 10% jitter.
    pub fn backoff(&self, attempt: i32) -> Duration {
        let exponent = attempt.saturating_sub(1).clamp(0, 30) as u32;
        let base = self
            .retry_backoff_base
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.retry_backoff_max);

        let jitter_ms = (base.as_millis() / 10) as u64;
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
    }
}

#[derive(Debug, Error)]
#[error("worker capacity exhausted, retry in {}s", retry_after.as_secs())]
pub struct Backpressure {
    pub retry_after: Duration,
}

const CANCELLED_BY_REQUEST: &str = "Cancelled: cancelled by request";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The job was queued and is now FAILED.
    Cancelled,
    /// The job was running; its worker stopped and the job is now FAILED.
    Signalled,
    /// Nothing to cancel.
    AlreadyTerminal(JobState),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryReport {
    pub resumed: usize,
    pub failed: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecoveryAction {
    Resumed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct QueueEntry {
    available_at: OffsetDateTime,
    id: Uuid,
}

/// Handles to one in-flight run.
struct RunningJob {
    cancel: CancellationToken,
    /// Fires once the run has stopped and its outcome is in the ledger.
    settled: CancellationToken,
}

impl RunningJob {
    fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            settled: CancellationToken::new(),
        }
    }
}

#[derive(Default)]
struct QueueState {
    ready: BTreeSet<QueueEntry>,
    delayed: HashSet<Uuid>,
    running: HashMap<Uuid, RunningJob>,
    reserved: usize,
}

impl QueueState {
    fn tracked(&self) -> usize {
        self.ready.len() + self.delayed.len() + self.running.len() + self.reserved
    }

    fn contains(&self, id: Uuid) -> bool {
        self.running.contains_key(&id)
            || self.delayed.contains(&id)
            || self.ready.iter().any(|entry| entry.id == id)
    }

    fn remove_ready(&mut self, id: Uuid) -> bool {
        let before = self.ready.len();
        self.ready.retain(|entry| entry.id != id);
        self.ready.len() != before
    }
}

struct Inner {
    ledger: Arc<dyn JobLedger>,
    worker: TranscodeWorker,
    config: SchedulerConfig,
    queue: Mutex<QueueState>,
    wake: Notify,
    slots: Arc<Semaphore>,
    tasks: TaskTracker,
    shutdown: CancellationToken,
    fatal: CancellationToken,
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

/// A reserved admission slot. Hand it to [`Scheduler::enqueue`] once the job is
/// durably created; dropping it unused gives the slot back.
pub struct Admission {
    inner: Arc<Inner>,
    armed: bool,
}

impl Drop for Admission {
    fn drop(&mut self) {
        if self.armed {
            self.inner.state().reserved -= 1;
        }
    }
}

impl Scheduler {
    pub fn new(ledger: Arc<dyn JobLedger>, worker: TranscodeWorker, config: SchedulerConfig) -> Self {
        let slots = Arc::new(Semaphore::new(config.concurrency.max(1)));
        Self {
            inner: Arc::new(Inner {
                ledger,
                worker,
                config,
                queue: Mutex::new(QueueState::default()),
                wake: Notify::new(),
                slots,
                tasks: TaskTracker::new(),
                shutdown: CancellationToken::new(),
                fatal: CancellationToken::new(),
            }),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Fires when the ledger can no longer persist transitions.
    pub fn fatal_signal(&self) -> CancellationToken {
        self.inner.fatal.clone()
    }

    /// Admitted jobs this process is responsible for, in any phase.
    pub fn tracked(&self) -> usize {
        self.inner.state().tracked()
    }

    pub fn is_tracking(&self, id: Uuid) -> bool {
        self.inner.state().contains(id)
    }

    /// Reserve capacity for one more job, or refuse with a retry hint.
    pub fn try_admit(&self) -> Result<Admission, Backpressure> {
        let limit = self.inner.config.concurrency + self.inner.config.queue_capacity;
        let mut state = self.inner.state();

        if self.inner.shutdown.is_cancelled() || state.tracked() >= limit {
            return Err(Backpressure {
                retry_after: self.retry_after(),
            });
        }

        state.reserved += 1;
        Ok(Admission {
            inner: self.inner.clone(),
            armed: true,
        })
    }

    pub fn retry_after(&self) -> Duration {
        self.inner.config.retry_backoff_base.max(Duration::from_secs(1))
    }

    /// Queue a freshly created job behind everything created before it.
    pub fn enqueue(&self, mut admission: Admission, job: &Job) {
        {
            let mut state = self.inner.state();
            state.reserved -= 1;
            admission.armed = false;
            state.ready.insert(QueueEntry {
                available_at: job.created_at,
                id: job.id,
            });
        }
        debug!(job_id = %job.id, "Job queued");
        self.inner.wake.notify_one();
    }

    /// Spawn the dispatch loop and, if configured, the stale-job sweeper.
    pub fn start(&self) -> JoinHandle<()> {
        if !self.inner.config.stale_sweep_interval.is_zero() {
            let scheduler = self.clone();
            self.inner.tasks.spawn(async move { scheduler.sweep_loop().await });
        }

        let scheduler = self.clone();
        tokio::spawn(async move { scheduler.dispatch_loop().await })
    }

    /// Startup recovery: re-drive or fail every non-terminal job left by a
    /// previous process. Terminal jobs are never touched.
    pub async fn recover(&self) -> LedgerResult<RecoveryReport> {
        let report = self.sweep(OffsetDateTime::now_utc()).await?;
        info!(
            resumed = report.resumed,
            failed = report.failed,
            skipped = report.skipped,
            "🔁 Recovery sweep finished"
        );
        Ok(report)
    }

    /// Cancel a job wherever it is.
    ///
    /// A running job is signalled and awaited, so the outcome reflects what
    /// the ledger ends up holding: a run that committed DONE before the
    /// signal landed is reported as already terminal, and a run that was
    /// requeued for retry meanwhile is pulled from the queue and failed.
    pub async fn cancel(&self, id: Uuid) -> LedgerResult<CancelOutcome> {
        let mut signalled = false;
        let was_queued = loop {
            let settled = {
                let mut state = self.inner.state();
                let running = state.running.get(&id).map(|run| {
                    run.cancel.cancel();
                    run.settled.clone()
                });
                match running {
                    Some(settled) => settled,
                    None => break state.remove_ready(id) || state.delayed.remove(&id),
                }
            };

            if !signalled {
                info!(job_id = %id, "🛑 Cancellation signalled to running job");
                signalled = true;
            }
            settled.cancelled().await;
        };

        let job = self
            .inner
            .ledger
            .get(id)
            .await?
            .ok_or(LedgerError::NotFound(id))?;

        match job.state {
            JobState::Failed if signalled => return Ok(CancelOutcome::Signalled),
            JobState::Done | JobState::Failed => return Ok(CancelOutcome::AlreadyTerminal(job.state)),
            _ => {}
        }

        self.inner.fail_permanently(&job, CANCELLED_BY_REQUEST).await?;
        info!(job_id = %id, queued = was_queued, "🛑 Job cancelled");
        Ok(if signalled {
            CancelOutcome::Signalled
        } else {
            CancelOutcome::Cancelled
        })
    }

    /// Stop dispatching, cancel in-flight work and wait for workers to settle.
    pub async fn shutdown(&self) {
        info!("Scheduler shutting down");
        self.inner.shutdown.cancel();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        self.inner.worker.storage().close().await;
        info!("Scheduler stopped");
    }

    async fn dispatch_loop(&self) {
        info!(
            concurrency = self.inner.config.concurrency,
            queue_capacity = self.inner.config.queue_capacity,
            "🎥 Scheduler dispatch loop started"
        );

        loop {
            let permit = tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                permit = self.inner.slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let next = loop {
                if let Some(next) = self.inner.pop_ready() {
                    break Some(next);
                }
                tokio::select! {
                    _ = self.inner.shutdown.cancelled() => break None,
                    _ = self.inner.wake.notified() => {}
                }
            };
            let Some((id, token)) = next else { break };

            let scheduler = self.clone();
            self.inner.tasks.spawn(
                async move {
                    scheduler.run_job(id, token).await;
                    drop(permit);
                }
                .instrument(info_span!("job", job_id = %id)),
            );
        }

        info!("Scheduler dispatch loop stopped");
    }

    async fn run_job(&self, id: Uuid, token: CancellationToken) {
        let inner = &self.inner;

        let job = match inner.ledger.get(id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                warn!("Queued job vanished from the ledger");
                inner.finish(id);
                return;
            }
            Err(e) => {
                inner.halt(&e);
                inner.finish(id);
                return;
            }
        };

        if job.state != JobState::Pending {
            debug!(state = %job.state, "Job no longer pending, skipping");
            inner.finish(id);
            return;
        }

        match inner.worker.run(inner.ledger.as_ref(), job, &token).await {
            Ok(done) => {
                info!(attempt = done.attempt, "✅ Job completed");
                inner.finish(id);
            }
            Err(failure) => self.handle_failure(failure, &token).await,
        }
    }

    async fn handle_failure(&self, failure: JobFailure, token: &CancellationToken) {
        let inner = &self.inner;
        let JobFailure { job, error } = failure;
        let shutting_down = inner.shutdown.is_cancelled();
        // A cancel request that raced another failure still wins over a retry.
        let cancelled = token.is_cancelled() && !shutting_down;
        let (disposition, message) = match error.disposition(job.attempt, job.max_attempts, shutting_down) {
            Disposition::Retry if cancelled => (Disposition::Fail, CANCELLED_BY_REQUEST.to_string()),
            disposition => (disposition, error.describe()),
        };

        match disposition {
            Disposition::Abandon => {
                warn!(error = %error, "Job claimed elsewhere, abandoning this run");
                inner.finish(job.id);
            }
            Disposition::Fatal => {
                if let PipelineError::Ledger(e) = &error {
                    inner.halt(e);
                }
                inner.finish(job.id);
            }
            Disposition::Fail => {
                match inner.fail_permanently(&job, &message).await {
                    Ok(_) => error!(attempt = job.attempt, error = %message, "❌ Job failed"),
                    Err(e) => inner.ledger_trouble(&e),
                }
                inner.finish(job.id);
            }
            Disposition::Retry => match inner.requeue_in_ledger(&job, &message).await {
                Ok(failed) if failed.state == JobState::Failed => {
                    error!(attempt = failed.attempt, error = %message, "❌ Job failed, attempts exhausted");
                    inner.finish(job.id);
                }
                Ok(pending) if !shutting_down => {
                    let delay = inner.config.backoff(pending.attempt);
                    warn!(
                        attempt = pending.attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %message,
                        "🔁 Job will be retried"
                    );
                    self.schedule_retry(pending.id, delay);
                }
                Ok(_) => {
                    info!("Job returned to PENDING for the next start");
                    inner.finish(job.id);
                }
                Err(e) => {
                    inner.ledger_trouble(&e);
                    inner.finish(job.id);
                }
            },
        }
    }

    fn schedule_retry(&self, id: Uuid, delay: Duration) {
        let run = {
            let mut state = self.inner.state();
            state.delayed.insert(id);
            state.running.remove(&id)
        };
        // A pending cancel now finds the job in `delayed`.
        if let Some(run) = run {
            run.settled.cancel();
        }

        let inner = self.inner.clone();
        self.inner.tasks.spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    let requeued = {
                        let mut state = inner.state();
                        if state.delayed.remove(&id) {
                            // Retries go to the back of the queue.
                            state.ready.insert(QueueEntry {
                                available_at: OffsetDateTime::now_utc(),
                                id,
                            });
                            true
                        } else {
                            false
                        }
                    };
                    if requeued {
                        inner.wake.notify_one();
                    }
                }
                _ = inner.shutdown.cancelled() => {
                    inner.state().delayed.remove(&id);
                }
            }
        });
    }

    async fn sweep_loop(&self) {
        let mut interval = tokio::time::interval(self.inner.config.stale_sweep_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; startup recovery already covered it.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                _ = interval.tick() => {
                    let deadline = time::Duration::try_from(self.inner.config.stale_job_deadline)
                        .unwrap_or(time::Duration::HOUR);
                    let older_than = OffsetDateTime::now_utc() - deadline;
                    match self.sweep(older_than).await {
                        Ok(report) if report.resumed + report.failed > 0 => info!(
                            resumed = report.resumed,
                            failed = report.failed,
                            "Stale job sweep recovered jobs"
                        ),
                        Ok(_) => debug!("Stale job sweep found nothing"),
                        Err(e) => self.inner.halt(&e),
                    }
                }
            }
        }
    }

    async fn sweep(&self, older_than: OffsetDateTime) -> LedgerResult<RecoveryReport> {
        let stale = self.inner.ledger.list_stale(older_than).await?;
        let mut report = RecoveryReport::default();

        for job in stale {
            if self.is_tracking(job.id) {
                continue;
            }
            match self.recover_job(job).await {
                Ok(RecoveryAction::Resumed) => report.resumed += 1,
                Ok(RecoveryAction::Failed) => report.failed += 1,
                Ok(RecoveryAction::Skipped) => report.skipped += 1,
                Err(e) if e.is_durability_failure() => return Err(e),
                Err(e) => {
                    warn!(error = %e, "Skipping job during recovery");
                    report.skipped += 1;
                }
            }
        }

        Ok(report)
    }

    async fn recover_job(&self, job: Job) -> LedgerResult<RecoveryAction> {
        let inner = &self.inner;

        match job.state {
            JobState::Pending => {
                inner.enqueue_recovered(&job);
                Ok(RecoveryAction::Resumed)
            }
            state if state.is_active() => {
                if let Err(e) = inner.worker.scratch().purge_job(job.id).await {
                    warn!(job_id = %job.id, error = %e, "Failed to purge orphaned scratch");
                }

                if job.recoveries == 0 && job.attempts_remaining() {
                    inner.ledger.mark_recovered(job.id).await?;
                    let pending = inner
                        .requeue_in_ledger(&job, "Interrupted: resumed after restart")
                        .await?;
                    info!(job_id = %job.id, interrupted_in = %state, "Resuming interrupted job");
                    inner.enqueue_recovered(&pending);
                    Ok(RecoveryAction::Resumed)
                } else {
                    inner
                        .fail_permanently(&job, "Interrupted: recovery limit reached")
                        .await?;
                    warn!(job_id = %job.id, interrupted_in = %state, "Interrupted job failed");
                    Ok(RecoveryAction::Failed)
                }
            }
            _ => Ok(RecoveryAction::Skipped),
        }
    }
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn pop_ready(&self) -> Option<(Uuid, CancellationToken)> {
        let mut state = self.state();
        let entry = state.ready.pop_first()?;
        let token = self.shutdown.child_token();
        state.running.insert(entry.id, RunningJob::new(token.clone()));
        Some((entry.id, token))
    }

    fn finish(&self, id: Uuid) {
        let run = self.state().running.remove(&id);
        if let Some(run) = run {
            run.settled.cancel();
        }
    }

    /// Recovered jobs bypass admission: they were admitted before the restart.
    fn enqueue_recovered(&self, job: &Job) {
        {
            let mut state = self.state();
            if state.contains(job.id) {
                return;
            }
            state.ready.insert(QueueEntry {
                available_at: job.created_at,
                id: job.id,
            });
        }
        self.wake.notify_one();
    }

    async fn fail_permanently(&self, job: &Job, message: &str) -> LedgerResult<Job> {
        self.ledger.fail(job.id, job.state, message, false).await
    }

    /// Back to PENDING when attempts remain, otherwise FAILED with `message`.
    async fn requeue_in_ledger(&self, job: &Job, message: &str) -> LedgerResult<Job> {
        self.ledger.fail(job.id, job.state, message, true).await
    }

    fn ledger_trouble(&self, err: &LedgerError) {
        if err.is_durability_failure() {
            self.halt(err);
        } else {
            warn!(error = %err, "Ledger refused failure bookkeeping");
        }
    }

    fn halt(&self, err: &LedgerError) {
        error!(error = %err, "💥 Ledger cannot persist job state, halting service");
        self.fatal.cancel();
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let config = SchedulerConfig {
            retry_backoff_base: Duration::from_millis(100),
            retry_backoff_max: Duration::from_millis(1000),
            ..SchedulerConfig::default()
        };

        let first = config.backoff(1);
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(110));
        let third = config.backoff(3);
        assert!(third >= Duration::from_millis(400) && third <= Duration::from_millis(440));
        let capped = config.backoff(20);
        assert!(capped >= Duration::from_millis(1000) && capped <= Duration::from_millis(1100));
    }

    #[test]
    fn queue_orders_by_availability_then_id() {
        let t0 = OffsetDateTime::UNIX_EPOCH;
        let low = Uuid::from_u128(1);
        let high = Uuid::from_u128(2);

        let mut ready = BTreeSet::new();
        ready.insert(QueueEntry { available_at: t0 + time::Duration::SECOND, id: low });
        ready.insert(QueueEntry { available_at: t0, id: high });
        ready.insert(QueueEntry { available_at: t0, id: low });

        let order: Vec<_> = std::iter::from_fn(|| ready.pop_first())
            .map(|entry| (entry.available_at, entry.id))
            .collect();
        assert_eq!(
            order,
            vec![(t0, low), (t0, high), (t0 + time::Duration::SECOND, low)]
        );
    }
}
