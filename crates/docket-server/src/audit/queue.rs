//! Durable job queue for audit delivery
//!
//! Jobs live in the `audit_jobs` table. Workers claim them with
//! `FOR UPDATE SKIP LOCKED`, so any number of workers and replicas can drain
//! the same queue without double delivery. Completed jobs are deleted; jobs
//! that exhaust their retry budget stay behind with status `failed` and
//! their last error so operators can inspect them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{types::Json, PgPool};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::models::PendingRecord;
use crate::config::AuditConfig;
use crate::error::{AuditError, AuditResult};

/// A running job not completed within this lease is handed to another worker
pub const JOB_LEASE: Duration = Duration::from_secs(300);

/// Exponential backoff between delivery attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub factor: u32,
}

impl RetryPolicy {
    pub fn from_config(config: &AuditConfig) -> Self {
        Self {
            max_attempts: config.queue_max_attempts,
            base_delay: Duration::from_millis(config.queue_backoff_ms),
            factor: config.queue_backoff_factor,
        }
    }

    /// Delay before the attempt following `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let multiplier = self.factor.max(1).saturating_pow(exponent);
        self.base_delay.saturating_mul(multiplier)
    }

    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&AuditConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = AuditError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "failed" => Ok(JobStatus::Failed),
            other => Err(AuditError::QueueUnavailable(format!("unknown job status '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditJob {
    pub id: Uuid,
    pub payload: PendingRecord,
    /// Attempts made so far, including the current one once reserved
    pub attempts: u32,
    pub status: JobStatus,
    pub last_error: Option<String>,
    pub run_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// What happened to a job after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Retrying { run_at: DateTime<Utc> },
    Failed,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, payload: &PendingRecord) -> AuditResult<Uuid>;

    /// Claim the next due job, bumping its attempt counter
    async fn reserve(&self) -> AuditResult<Option<AuditJob>>;

    /// Remove a delivered job
    async fn complete(&self, id: Uuid) -> AuditResult<()>;

    /// Reschedule `job` per `policy`, or park it as failed when exhausted
    async fn fail(&self, job: &AuditJob, error: &str, policy: &RetryPolicy) -> AuditResult<JobOutcome>;

    /// Jobs not yet delivered and not parked as failed
    async fn depth(&self) -> AuditResult<i64>;

    async fn failed_count(&self) -> AuditResult<i64>;

    /// Most recent failed jobs, newest first
    async fn failed_jobs(&self, limit: i64) -> AuditResult<Vec<AuditJob>>;
}

fn retry_at(policy: &RetryPolicy, attempts: u32) -> DateTime<Utc> {
    let delay = chrono::Duration::from_std(policy.delay_for(attempts))
        .unwrap_or_else(|_| chrono::Duration::seconds(60));
    Utc::now() + delay
}

fn lease() -> chrono::Duration {
    chrono::Duration::from_std(JOB_LEASE).unwrap_or_else(|_| chrono::Duration::minutes(5))
}

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    payload: Json<PendingRecord>,
    attempts: i32,
    status: String,
    last_error: Option<String>,
    run_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for AuditJob {
    type Error = AuditError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(AuditJob {
            id: row.id,
            payload: row.payload.0,
            attempts: u32::try_from(row.attempts).unwrap_or(0),
            status: row.status.parse()?,
            last_error: row.last_error,
            run_at: row.run_at,
            created_at: row.created_at,
        })
    }
}

/// Postgres-backed [`JobQueue`]
#[derive(Debug, Clone)]
pub struct PgJobQueue {
    pool: PgPool,
}

impl PgJobQueue {
    /// Attach to the queue table, failing when it is missing
    pub async fn connect(pool: PgPool) -> AuditResult<Self> {
        let exists: bool = sqlx::query_scalar("SELECT to_regclass('public.audit_jobs') IS NOT NULL")
            .fetch_one(&pool)
            .await
            .map_err(|e| AuditError::QueueUnavailable(e.to_string()))?;

        if !exists {
            return Err(AuditError::QueueUnavailable(
                "table audit_jobs does not exist".to_string(),
            ));
        }

        info!("Audit job queue attached");
        Ok(Self { pool })
    }
}

#[async_trait]
impl JobQueue for PgJobQueue {
    async fn enqueue(&self, payload: &PendingRecord) -> AuditResult<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO audit_jobs (id, payload, status, attempts, run_at, created_at)
            VALUES ($1, $2, 'pending', 0, NOW(), NOW())
            "#,
        )
        .bind(id)
        .bind(Json(payload))
        .execute(&self.pool)
        .await
        .map_err(|e| AuditError::QueueUnavailable(e.to_string()))?;

        debug!(job_id = %id, action = %payload.action, "Enqueued audit job");
        Ok(id)
    }

    async fn reserve(&self) -> AuditResult<Option<AuditJob>> {
        let stale_before = Utc::now() - lease();
        let row: Option<JobRow> = sqlx::query_as(
            r#"
            UPDATE audit_jobs
            SET status = 'running', attempts = attempts + 1, locked_at = NOW()
            WHERE id = (
                SELECT id FROM audit_jobs
                WHERE (status = 'pending' AND run_at <= NOW())
                   OR (status = 'running' AND locked_at < $1)
                ORDER BY run_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, payload, attempts, status, last_error, run_at, created_at
            "#,
        )
        .bind(stale_before)
        .fetch_optional(&self.pool)
        .await?;

        row.map(AuditJob::try_from).transpose()
    }

    async fn complete(&self, id: Uuid) -> AuditResult<()> {
        sqlx::query("DELETE FROM audit_jobs WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn fail(&self, job: &AuditJob, error: &str, policy: &RetryPolicy) -> AuditResult<JobOutcome> {
        if policy.is_exhausted(job.attempts) {
            sqlx::query(
                "UPDATE audit_jobs SET status = 'failed', last_error = $2, locked_at = NULL WHERE id = $1",
            )
            .bind(job.id)
            .bind(error)
            .execute(&self.pool)
            .await?;
            return Ok(JobOutcome::Failed);
        }

        let run_at = retry_at(policy, job.attempts);
        sqlx::query(
            r#"
            UPDATE audit_jobs
            SET status = 'pending', last_error = $2, run_at = $3, locked_at = NULL
            WHERE id = $1
            "#,
        )
        .bind(job.id)
        .bind(error)
        .bind(run_at)
        .execute(&self.pool)
        .await?;

        Ok(JobOutcome::Retrying { run_at })
    }

    async fn depth(&self) -> AuditResult<i64> {
        let depth: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM audit_jobs WHERE status <> 'failed'")
            .fetch_one(&self.pool)
            .await?;
        Ok(depth)
    }

    async fn failed_count(&self) -> AuditResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM audit_jobs WHERE status = 'failed'")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn failed_jobs(&self, limit: i64) -> AuditResult<Vec<AuditJob>> {
        let rows: Vec<JobRow> = sqlx::query_as(
            r#"
            SELECT id, payload, attempts, status, last_error, run_at, created_at
            FROM audit_jobs
            WHERE status = 'failed'
            ORDER BY created_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(AuditJob::try_from).collect()
    }
}

#[derive(Debug, Clone)]
struct QueuedJob {
    job: AuditJob,
    ready_at: tokio::time::Instant,
}

/// In-process [`JobQueue`] for tests and database-less runs
///
/// Due times use `tokio::time`, so paused-clock tests control backoff.
#[derive(Debug, Default)]
pub struct MemoryJobQueue {
    jobs: Mutex<Vec<QueuedJob>>,
    unavailable: AtomicBool,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail with `QueueUnavailable`
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn jobs(&self) -> Vec<AuditJob> {
        self.lock().iter().map(|q| q.job.clone()).collect()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<QueuedJob>> {
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check(&self) -> AuditResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AuditError::QueueUnavailable("memory queue is unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, payload: &PendingRecord) -> AuditResult<Uuid> {
        self.check()?;
        let now = Utc::now();
        let job = AuditJob {
            id: Uuid::new_v4(),
            payload: payload.clone(),
            attempts: 0,
            status: JobStatus::Pending,
            last_error: None,
            run_at: now,
            created_at: now,
        };
        let id = job.id;
        self.lock().push(QueuedJob {
            job,
            ready_at: tokio::time::Instant::now(),
        });
        Ok(id)
    }

    async fn reserve(&self) -> AuditResult<Option<AuditJob>> {
        self.check()?;
        let now = tokio::time::Instant::now();
        let mut jobs = self.lock();
        let due = jobs
            .iter_mut()
            .filter(|q| q.job.status == JobStatus::Pending && q.ready_at <= now)
            .min_by_key(|q| q.ready_at);

        Ok(due.map(|queued| {
            queued.job.status = JobStatus::Running;
            queued.job.attempts += 1;
            queued.job.clone()
        }))
    }

    async fn complete(&self, id: Uuid) -> AuditResult<()> {
        self.check()?;
        self.lock().retain(|q| q.job.id != id);
        Ok(())
    }

    async fn fail(&self, job: &AuditJob, error: &str, policy: &RetryPolicy) -> AuditResult<JobOutcome> {
        self.check()?;
        let mut jobs = self.lock();
        let queued = jobs
            .iter_mut()
            .find(|q| q.job.id == job.id)
            .ok_or_else(|| AuditError::NotFound(format!("audit job {}", job.id)))?;

        queued.job.last_error = Some(error.to_string());
        if policy.is_exhausted(job.attempts) {
            queued.job.status = JobStatus::Failed;
            return Ok(JobOutcome::Failed);
        }

        let run_at = retry_at(policy, job.attempts);
        queued.job.status = JobStatus::Pending;
        queued.job.run_at = run_at;
        queued.ready_at = tokio::time::Instant::now() + policy.delay_for(job.attempts);
        Ok(JobOutcome::Retrying { run_at })
    }

    async fn depth(&self) -> AuditResult<i64> {
        self.check()?;
        let depth = self
            .lock()
            .iter()
            .filter(|q| q.job.status != JobStatus::Failed)
            .count();
        Ok(i64::try_from(depth).unwrap_or(i64::MAX))
    }

    async fn failed_count(&self) -> AuditResult<i64> {
        self.check()?;
        let count = self
            .lock()
            .iter()
            .filter(|q| q.job.status == JobStatus::Failed)
            .count();
        Ok(i64::try_from(count).unwrap_or(i64::MAX))
    }

    async fn failed_jobs(&self, limit: i64) -> AuditResult<Vec<AuditJob>> {
        self.check()?;
        let mut failed: Vec<AuditJob> = self
            .lock()
            .iter()
            .filter(|q| q.job.status == JobStatus::Failed)
            .map(|q| q.job.clone())
            .collect();
        failed.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        failed.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(failed)
    }
}

/// Log a failed attempt at a level matching its outcome
pub(crate) fn log_outcome(job: &AuditJob, error: &str, outcome: JobOutcome) {
    match outcome {
        JobOutcome::Retrying { run_at } => debug!(
            job_id = %job.id,
            attempt = job.attempts,
            retry_at = %run_at,
            error,
            "Audit job failed, will retry"
        ),
        JobOutcome::Failed => warn!(
            job_id = %job.id,
            attempts = job.attempts,
            error,
            "Audit job exhausted its retries and was parked as failed"
        ),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
pub(crate) mod tests {
    use super::*;
    use crate::audit::models::{Category, Severity};

    pub(crate) fn payload(action: &str) -> PendingRecord {
        PendingRecord {
            actor_id: None,
            tenant_id: None,
            action: action.to_string(),
            resource: "clients".to_string(),
            resource_id: None,
            method: "POST".to_string(),
            endpoint: "/api/v1/clients".to_string(),
            ip_address: "unknown".to_string(),
            user_agent: "test".to_string(),
            status_code: 201,
            request_body: None,
            response_data: None,
            error: None,
            severity: Severity::Low,
            category: Category::DataAccess,
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            factor: 2,
        }
    }

    #[test]
    fn test_retry_delays_grow_exponentially() {
        let policy = policy();
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(3), Duration::from_secs(8));
        assert!(!policy.is_exhausted(2));
        assert!(policy.is_exhausted(3));
    }

    #[test]
    fn test_retry_delay_saturates() {
        let policy = policy();
        assert!(policy.delay_for(u32::MAX) >= Duration::from_secs(2));
    }

    #[test]
    fn test_default_policy_matches_config_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay, Duration::from_millis(2000));
        assert_eq!(policy.factor, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reserve_complete_removes_job() {
        let queue = MemoryJobQueue::new();
        queue.enqueue(&payload("create_clients")).await.unwrap();
        assert_eq!(queue.depth().await.unwrap(), 1);

        let job = queue.reserve().await.unwrap().unwrap();
        assert_eq!(job.attempts, 1);
        assert_eq!(job.status, JobStatus::Running);
        assert!(queue.reserve().await.unwrap().is_none());

        queue.complete(job.id).await.unwrap();
        assert_eq!(queue.depth().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_job_waits_for_backoff() {
        let queue = MemoryJobQueue::new();
        queue.enqueue(&payload("create_clients")).await.unwrap();

        let job = queue.reserve().await.unwrap().unwrap();
        let outcome = queue.fail(&job, "timeout", &policy()).await.unwrap();
        assert!(matches!(outcome, JobOutcome::Retrying { .. }));

        assert!(queue.reserve().await.unwrap().is_none());
        tokio::time::advance(Duration::from_secs(2)).await;
        let retried = queue.reserve().await.unwrap().unwrap();
        assert_eq!(retried.attempts, 2);
        assert_eq!(retried.last_error.as_deref(), Some("timeout"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_job_is_kept_as_failed() {
        let queue = MemoryJobQueue::new();
        queue.enqueue(&payload("delete_clients")).await.unwrap();
        let policy = policy();

        for _ in 0..3 {
            tokio::time::advance(Duration::from_secs(60)).await;
            let job = queue.reserve().await.unwrap().unwrap();
            queue.fail(&job, "storage down", &policy).await.unwrap();
        }

        assert!(queue.reserve().await.unwrap().is_none());
        assert_eq!(queue.depth().await.unwrap(), 0);
        assert_eq!(queue.failed_count().await.unwrap(), 1);

        let failed = queue.failed_jobs(10).await.unwrap();
        assert_eq!(failed[0].status, JobStatus::Failed);
        assert_eq!(failed[0].attempts, 3);
        assert_eq!(failed[0].last_error.as_deref(), Some("storage down"));
        assert_eq!(failed[0].payload.action, "delete_clients");
    }

    #[tokio::test]
    async fn test_unavailable_queue_rejects_enqueue() {
        let queue = MemoryJobQueue::new();
        queue.set_unavailable(true);
        assert!(matches!(
            queue.enqueue(&payload("x")).await,
            Err(AuditError::QueueUnavailable(_))
        ));
    }

    #[test]
    fn test_job_status_parse() {
        assert_eq!("failed".parse::<JobStatus>().unwrap(), JobStatus::Failed);
        assert!("done".parse::<JobStatus>().is_err());
    }
}
