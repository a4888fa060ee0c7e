use async_trait::async_trait;
use sqlx::PgPool;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::debug;
use uuid::Uuid;

use super::model::{Job, JobState, NewJob};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("job {0} not found")]
    NotFound(Uuid),

    /// Optimistic-concurrency failure: someone else moved the job first.
    #[error("job {id} is {actual}, expected {expected}")]
    Conflict {
        id: Uuid,
        expected: JobState,
        actual: JobState,
    },

    #[error("transition {from} -> {to} is not allowed")]
    InvalidTransition { from: JobState, to: JobState },

    #[error("job {0} has no attempts left")]
    AttemptsExhausted(Uuid),

    #[error("ledger database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("ledger unavailable: {0}")]
    Unavailable(String),
}

impl LedgerError {
    /// The ledger could not persist state. Nothing downstream can be trusted.
    pub fn is_durability_failure(&self) -> bool {
        matches!(self, LedgerError::Database(_) | LedgerError::Unavailable(_))
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;

/// Durable record of job state. The single authority on concurrent
/// transition races.
#[async_trait]
pub trait JobLedger: Send + Sync {
    /// Insert a new PENDING job with a fresh id.
    async fn create(&self, job: NewJob) -> LedgerResult<Job>;

    /// Move `id` from `from` to `to`. Fails with [`LedgerError::Conflict`] when
    /// the stored state is not `from`. Entering DOWNLOADING from PENDING
    /// increments `attempt`; entering PENDING clears `last_error`.
    async fn transition(&self, id: Uuid, from: JobState, to: JobState) -> LedgerResult<Job>;

    /// Attach a failure description to a FAILED job.
    async fn record_error(&self, id: Uuid, error: &str) -> LedgerResult<Job>;

    /// End the current attempt of a job in `from` with a single write.
    ///
    /// With `requeue` set and attempts remaining the job goes straight back to
    /// PENDING with `last_error` cleared. Otherwise it lands in FAILED with
    /// `error` attached. A crash can never leave a FAILED row that was meant
    /// to be retried, or a FAILED row without its error.
    async fn fail(&self, id: Uuid, from: JobState, error: &str, requeue: bool) -> LedgerResult<Job>;

    async fn get(&self, id: Uuid) -> LedgerResult<Option<Job>>;

    /// Non-terminal jobs whose last update is at or before `older_than`,
    /// oldest first.
    async fn list_stale(&self, older_than: OffsetDateTime) -> LedgerResult<Vec<Job>>;

    /// Count one crash-recovery pass against the job.
    async fn mark_recovered(&self, id: Uuid) -> LedgerResult<Job>;
}

const JOB_COLUMNS: &str = r#"
    id, source_key, destination_key, profile, state, attempt, max_attempts,
    recoveries, last_error, created_at, updated_at
"#;

#[derive(Clone)]
pub struct PgJobLedger {
    pool: PgPool,
}

impl PgJobLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Explain why a guarded UPDATE touched no row.
    async fn diagnose(&self, id: Uuid, expected: JobState) -> LedgerError {
        match self.get(id).await {
            Ok(None) => LedgerError::NotFound(id),
            Ok(Some(job)) if job.state != expected => LedgerError::Conflict {
                id,
                expected,
                actual: job.state,
            },
            Ok(Some(_)) => LedgerError::AttemptsExhausted(id),
            Err(e) => e,
        }
    }
}

#[async_trait]
impl JobLedger for PgJobLedger {
    async fn create(&self, job: NewJob) -> LedgerResult<Job> {
        let created = sqlx::query_as::<_, Job>(&format!(
            r#"
            INSERT INTO transcode_jobs (id, source_key, destination_key, profile, state, max_attempts)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {}
            "#,
            JOB_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(&job.source_key)
        .bind(&job.destination_key)
        .bind(&job.profile)
        .bind(JobState::Pending.as_str())
        .bind(job.max_attempts)
        .fetch_one(&self.pool)
        .await?;

        debug!(job_id = %created.id, "Ledger row created");
        Ok(created)
    }

    async fn transition(&self, id: Uuid, from: JobState, to: JobState) -> LedgerResult<Job> {
        if !from.can_transition_to(to) {
            return Err(LedgerError::InvalidTransition { from, to });
        }

        let updated = sqlx::query_as::<_, Job>(&format!(
            r#"
            UPDATE transcode_jobs
            SET state = $3,
                attempt = attempt + CASE WHEN $4 THEN 1 ELSE 0 END,
                last_error = CASE WHEN $3 = 'PENDING' THEN NULL ELSE last_error END,
                updated_at = NOW()
            WHERE id = $1
              AND state = $2
              AND ($3 <> 'PENDING' OR attempt < max_attempts)
            RETURNING {}
            "#,
            JOB_COLUMNS
        ))
        .bind(id)
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(JobState::starts_attempt(from, to))
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(job) => Ok(job),
            None => Err(self.diagnose(id, from).await),
        }
    }

    async fn record_error(&self, id: Uuid, error: &str) -> LedgerResult<Job> {
        let updated = sqlx::query_as::<_, Job>(&format!(
            r#"
            UPDATE transcode_jobs
            SET last_error = $2, updated_at = NOW()
            WHERE id = $1 AND state = 'FAILED'
            RETURNING {}
            "#,
            JOB_COLUMNS
        ))
        .bind(id)
        .bind(error)
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(job) => Ok(job),
            None => Err(self.diagnose(id, JobState::Failed).await),
        }
    }

    async fn fail(&self, id: Uuid, from: JobState, error: &str, requeue: bool) -> LedgerResult<Job> {
        if !from.can_transition_to(JobState::Failed) {
            return Err(LedgerError::InvalidTransition {
                from,
                to: JobState::Failed,
            });
        }

        // Every SET expression sees the row as it was before the UPDATE.
        let updated = sqlx::query_as::<_, Job>(&format!(
            r#"
            UPDATE transcode_jobs
            SET state = CASE WHEN $4 AND attempt < max_attempts THEN 'PENDING' ELSE 'FAILED' END,
                last_error = CASE WHEN $4 AND attempt < max_attempts THEN NULL ELSE $3 END,
                updated_at = NOW()
            WHERE id = $1 AND state = $2
            RETURNING {}
            "#,
            JOB_COLUMNS
        ))
        .bind(id)
        .bind(from.as_str())
        .bind(error)
        .bind(requeue)
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(job) => {
                debug!(job_id = %id, state = %job.state, "Attempt closed");
                Ok(job)
            }
            None => Err(self.diagnose(id, from).await),
        }
    }

    async fn get(&self, id: Uuid) -> LedgerResult<Option<Job>> {
        let job = sqlx::query_as::<_, Job>(&format!(
            "SELECT {} FROM transcode_jobs WHERE id = $1",
            JOB_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(job)
    }

    async fn list_stale(&self, older_than: OffsetDateTime) -> LedgerResult<Vec<Job>> {
        let states: Vec<String> = JobState::NON_TERMINAL
            .iter()
            .map(|state| state.as_str().to_string())
            .collect();

        let jobs = sqlx::query_as::<_, Job>(&format!(
            r#"
            SELECT {}
            FROM transcode_jobs
            WHERE state = ANY($1) AND updated_at <= $2
            ORDER BY created_at ASC, id ASC
            "#,
            JOB_COLUMNS
        ))
        .bind(&states)
        .bind(older_than)
        .fetch_all(&self.pool)
        .await?;

        Ok(jobs)
    }

    async fn mark_recovered(&self, id: Uuid) -> LedgerResult<Job> {
        let updated = sqlx::query_as::<_, Job>(&format!(
            r#"
            UPDATE transcode_jobs
            SET recoveries = recoveries + 1, updated_at = NOW()
            WHERE id = $1
            RETURNING {}
            "#,
            JOB_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        updated.ok_or(LedgerError::NotFound(id))
    }
}
