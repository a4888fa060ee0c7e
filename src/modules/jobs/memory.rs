use std::collections::HashMap;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::model::{Job, JobState, NewJob};
use super::repository::{JobLedger, LedgerError, LedgerResult};

/// Process-local ledger. Not durable across restarts; intended for local
/// development (`LEDGER_BACKEND=memory`) and tests.
#[derive(Default)]
pub struct MemoryJobLedger {
    jobs: Mutex<HashMap<Uuid, Job>>,
}

impl MemoryJobLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a row as-is. Used to seed recovery scenarios.
    pub async fn insert(&self, job: Job) {
        self.jobs.lock().await.insert(job.id, job);
    }
}

#[async_trait]
impl JobLedger for MemoryJobLedger {
    async fn create(&self, job: NewJob) -> LedgerResult<Job> {
        let now = OffsetDateTime::now_utc();
        let created = Job {
            id: Uuid::new_v4(),
            source_key: job.source_key,
            destination_key: job.destination_key,
            profile: job.profile,
            state: JobState::Pending,
            attempt: 0,
            max_attempts: job.max_attempts,
            recoveries: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        };

        self.jobs.lock().await.insert(created.id, created.clone());
        Ok(created)
    }

    async fn transition(&self, id: Uuid, from: JobState, to: JobState) -> LedgerResult<Job> {
        if !from.can_transition_to(to) {
            return Err(LedgerError::InvalidTransition { from, to });
        }

        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(&id).ok_or(LedgerError::NotFound(id))?;

        if job.state != from {
            return Err(LedgerError::Conflict {
                id,
                expected: from,
                actual: job.state,
            });
        }
        if to == JobState::Pending && !job.attempts_remaining() {
            return Err(LedgerError::AttemptsExhausted(id));
        }

        if JobState::starts_attempt(from, to) {
            job.attempt += 1;
        }
        if to == JobState::Pending {
            job.last_error = None;
        }
        job.state = to;
        job.updated_at = OffsetDateTime::now_utc();

        Ok(job.clone())
    }

    async fn record_error(&self, id: Uuid, error: &str) -> LedgerResult<Job> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(&id).ok_or(LedgerError::NotFound(id))?;

        if job.state != JobState::Failed {
            return Err(LedgerError::Conflict {
                id,
                expected: JobState::Failed,
                actual: job.state,
            });
        }

        job.last_error = Some(error.to_string());
        job.updated_at = OffsetDateTime::now_utc();
        Ok(job.clone())
    }

    async fn fail(&self, id: Uuid, from: JobState, error: &str, requeue: bool) -> LedgerResult<Job> {
        if !from.can_transition_to(JobState::Failed) {
            return Err(LedgerError::InvalidTransition {
                from,
                to: JobState::Failed,
            });
        }

        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(&id).ok_or(LedgerError::NotFound(id))?;

        if job.state != from {
            return Err(LedgerError::Conflict {
                id,
                expected: from,
                actual: job.state,
            });
        }

        if requeue && job.attempts_remaining() {
            job.state = JobState::Pending;
            job.last_error = None;
        } else {
            job.state = JobState::Failed;
            job.last_error = Some(error.to_string());
        }
        job.updated_at = OffsetDateTime::now_utc();

        Ok(job.clone())
    }

    async fn get(&self, id: Uuid) -> LedgerResult<Option<Job>> {
        Ok(self.jobs.lock().await.get(&id).cloned())
    }

    async fn list_stale(&self, older_than: OffsetDateTime) -> LedgerResult<Vec<Job>> {
        let mut stale: Vec<Job> = self
            .jobs
            .lock()
            .await
            .values()
            .filter(|job| JobState::NON_TERMINAL.contains(&job.state) && job.updated_at <= older_than)
            .cloned()
            .collect();

        stale.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(stale)
    }

    async fn mark_recovered(&self, id: Uuid) -> LedgerResult<Job> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(&id).ok_or(LedgerError::NotFound(id))?;
        job.recoveries += 1;
        job.updated_at = OffsetDateTime::now_utc();
        Ok(job.clone())
    }
}
