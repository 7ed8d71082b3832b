//! Durable job ledger with lease-based claiming and bounded retry.
//!
//! Jobs are append-only work records. The ledger is the only writer of
//! job state, and every state change is an atomic conditional update,
//! so two workers can never hold the same job at once. Completed and
//! dead-lettered jobs are retained for audit.

use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::SqliteConnection;
use sqlx::types::Json;
use sqlx::QueryBuilder;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{IngestError, Result};
use crate::store::Store;
use crate::types::job::JOB_COLUMNS;
use crate::types::{Actor, Job, JobErrorKind, JobInput, JobKind, JobStatus, ProvenanceEvent};

/// Outcome of one idempotent enqueue.
#[derive(Debug)]
pub enum EnqueueResult {
    /// A new job row was created.
    Created(Job),
    /// A live job already held the dedupe key; no new row.
    Duplicate(Job),
}

impl EnqueueResult {
    pub fn job(&self) -> &Job {
        match self {
            EnqueueResult::Created(job) | EnqueueResult::Duplicate(job) => job,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, EnqueueResult::Created(_))
    }
}

/// Result a worker reports when finishing a claimed job.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Success(serde_json::Value),
    Failure {
        message: String,
        kind: JobErrorKind,
    },
}

/// Filters for the ledger's read path.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub kind: Option<JobKind>,
    pub limit: Option<i64>,
}

/// The durable job ledger.
#[derive(Clone)]
pub struct JobLedger {
    store: Store,
    lease_seconds: i64,
    max_attempts: i32,
    backoff_base_secs: i64,
    backoff_ceiling_secs: i64,
}

impl JobLedger {
    pub fn new(store: Store, config: &EngineConfig) -> Self {
        Self {
            store,
            lease_seconds: config.lease_seconds,
            max_attempts: config.max_attempts,
            backoff_base_secs: config.backoff_base_secs,
            backoff_ceiling_secs: config.backoff_ceiling_secs,
        }
    }

    /// Enqueue work, collapsing onto any live job for the same target.
    pub async fn enqueue(
        &self,
        target_type: &str,
        target_id: Uuid,
        input: &JobInput,
    ) -> Result<EnqueueResult> {
        let mut tx = self.store.begin().await?;
        let result =
            schedule_with_in_tx(&mut tx, target_type, target_id, input, None, self.max_attempts)
                .await?;
        tx.commit().await?;
        Ok(result)
    }

    /// Schedule work for a later run; same idempotency as `enqueue`.
    pub async fn schedule(
        &self,
        target_type: &str,
        target_id: Uuid,
        input: &JobInput,
        run_at: DateTime<Utc>,
    ) -> Result<EnqueueResult> {
        let mut tx = self.store.begin().await?;
        let result = schedule_with_in_tx(
            &mut tx,
            target_type,
            target_id,
            input,
            Some(run_at),
            self.max_attempts,
        )
        .await?;
        tx.commit().await?;
        Ok(result)
    }

    /// Claim up to `batch_size` ready jobs for a worker.
    ///
    /// Ready means queued with no future `next_run_at`, or claimed with
    /// an expired lease. Each claim is an atomic conditional update, so
    /// a job lost to a racing worker is simply skipped.
    pub async fn claim(
        &self,
        worker_id: &str,
        kinds: &[JobKind],
        batch_size: i64,
    ) -> Result<Vec<Job>> {
        let now = Utc::now();
        let lease_expires_at = now + Duration::seconds(self.lease_seconds);

        let mut conn = self.store.pool().acquire().await?;

        let mut builder = QueryBuilder::new(
            "SELECT id FROM jobs WHERE ((status = 'queued' AND (next_run_at IS NULL OR next_run_at <= ",
        );
        builder.push_bind(now);
        builder.push(")) OR (status = 'claimed' AND lease_expires_at < ");
        builder.push_bind(now);
        builder.push("))");
        if !kinds.is_empty() {
            builder.push(" AND kind IN (");
            let mut separated = builder.separated(", ");
            for kind in kinds {
                separated.push_bind(*kind);
            }
            builder.push(")");
        }
        builder.push(" ORDER BY next_run_at IS NOT NULL, next_run_at, created_at LIMIT ");
        builder.push_bind(batch_size);

        let ids: Vec<Uuid> = builder
            .build_query_scalar()
            .fetch_all(&mut *conn)
            .await?;

        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(job) = claim_one(&mut conn, id, worker_id, now, lease_expires_at).await? {
                claimed.push(job);
            }
        }

        if !claimed.is_empty() {
            info!(worker_id, count = claimed.len(), "claimed jobs");
        }
        Ok(claimed)
    }

    /// Claim one specific job.
    ///
    /// Succeeds when the job is queued and ready, or claimed with an
    /// expired lease; anything else is a conflict.
    pub async fn claim_job(&self, job_id: Uuid, worker_id: &str) -> Result<Job> {
        let now = Utc::now();
        let lease_expires_at = now + Duration::seconds(self.lease_seconds);

        let mut conn = self.store.pool().acquire().await?;
        claim_one(&mut conn, job_id, worker_id, now, lease_expires_at)
            .await?
            .ok_or_else(|| {
                IngestError::conflict(format!(
                    "job {job_id} is not claimable; held, resolved or not yet due"
                ))
            })
    }

    /// Report the result of a claimed job.
    ///
    /// Only the current leaseholder may submit; anything else is a
    /// conflict. Retryable failures requeue with exponential backoff
    /// while attempts remain, then dead-letter. Non-retryable failures
    /// dead-letter immediately.
    pub async fn submit_result(
        &self,
        job_id: Uuid,
        worker_id: &str,
        outcome: JobOutcome,
    ) -> Result<Job> {
        let mut tx = self.store.begin().await?;
        let job = self
            .submit_result_in_tx(&mut tx, job_id, worker_id, outcome)
            .await?;
        tx.commit().await?;
        Ok(job)
    }

    pub(crate) async fn submit_result_in_tx(
        &self,
        conn: &mut SqliteConnection,
        job_id: Uuid,
        worker_id: &str,
        outcome: JobOutcome,
    ) -> Result<Job> {
        let now = Utc::now();

        match outcome {
            JobOutcome::Success(result) => {
                let job = sqlx::query_as::<_, Job>(&format!(
                    r#"
                    UPDATE jobs
                    SET status = 'done', result = $1, worker_id = NULL,
                        lease_expires_at = NULL, updated_at = $2
                    WHERE id = $3 AND status = 'claimed' AND worker_id = $4
                    RETURNING {JOB_COLUMNS}
                    "#,
                ))
                .bind(Json(result))
                .bind(now)
                .bind(job_id)
                .bind(worker_id)
                .fetch_optional(&mut *conn)
                .await?
                .ok_or_else(|| stale_submission(job_id, worker_id))?;

                Ok(job)
            }
            JobOutcome::Failure { message, kind } => {
                let current = Job::find_in_tx(conn, job_id).await?;
                if current.status != JobStatus::Claimed
                    || current.worker_id.as_deref() != Some(worker_id)
                {
                    return Err(stale_submission(job_id, worker_id));
                }

                let exhausted = current.attempt >= current.max_attempts;
                if kind.should_retry() && !exhausted {
                    let delay = self.backoff_delay(current.attempt);
                    let next_run_at = now + delay;

                    let job = sqlx::query_as::<_, Job>(&format!(
                        r#"
                        UPDATE jobs
                        SET status = 'queued', worker_id = NULL, lease_expires_at = NULL,
                            next_run_at = $1, error_message = $2, error_kind = $3,
                            updated_at = $4
                        WHERE id = $5 AND status = 'claimed' AND worker_id = $6
                        RETURNING {JOB_COLUMNS}
                        "#,
                    ))
                    .bind(next_run_at)
                    .bind(&message)
                    .bind(kind)
                    .bind(now)
                    .bind(job_id)
                    .bind(worker_id)
                    .fetch_optional(&mut *conn)
                    .await?
                    .ok_or_else(|| stale_submission(job_id, worker_id))?;

                    ProvenanceEvent::record(
                        conn,
                        "job",
                        job.id,
                        "job_retry_scheduled",
                        &Actor::pipeline(),
                        serde_json::json!({
                            "attempt": job.attempt,
                            "max_attempts": job.max_attempts,
                            "next_run_at": next_run_at,
                            "error": message,
                        }),
                    )
                    .await?;

                    warn!(job_id = %job.id, attempt = job.attempt, "job failed, retry scheduled");
                    Ok(job)
                } else {
                    let job = sqlx::query_as::<_, Job>(&format!(
                        r#"
                        UPDATE jobs
                        SET status = 'dead_letter', worker_id = NULL, lease_expires_at = NULL,
                            error_message = $1, error_kind = $2, updated_at = $3
                        WHERE id = $4 AND status = 'claimed' AND worker_id = $5
                        RETURNING {JOB_COLUMNS}
                        "#,
                    ))
                    .bind(&message)
                    .bind(kind)
                    .bind(now)
                    .bind(job_id)
                    .bind(worker_id)
                    .fetch_optional(&mut *conn)
                    .await?
                    .ok_or_else(|| stale_submission(job_id, worker_id))?;

                    ProvenanceEvent::record(
                        conn,
                        "job",
                        job.id,
                        "job_dead_lettered",
                        &Actor::pipeline(),
                        serde_json::json!({
                            "attempt": job.attempt,
                            "error_kind": kind,
                            "error": message,
                        }),
                    )
                    .await?;

                    warn!(job_id = %job.id, attempt = job.attempt, ?kind, "job dead-lettered");
                    Ok(job)
                }
            }
        }
    }

    /// Requeue claimed jobs whose lease has expired.
    ///
    /// A reaped lease does not consume an attempt: the claim-time
    /// increment is rolled back so a crashed worker cannot burn the
    /// retry budget.
    pub async fn reap_expired(&self) -> Result<u64> {
        let now = Utc::now();
        let mut tx = self.store.begin().await?;

        let ids: Vec<Uuid> = sqlx::query_scalar(
            "SELECT id FROM jobs WHERE status = 'claimed' AND lease_expires_at < $1",
        )
        .bind(now)
        .fetch_all(&mut *tx)
        .await?;

        let mut reaped = 0u64;
        for id in ids {
            let job = sqlx::query_as::<_, Job>(&format!(
                r#"
                UPDATE jobs
                SET status = 'queued', worker_id = NULL, lease_expires_at = NULL,
                    attempt = attempt - 1, updated_at = $1
                WHERE id = $2 AND status = 'claimed' AND lease_expires_at < $1
                RETURNING {JOB_COLUMNS}
                "#,
            ))
            .bind(now)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;

            if let Some(job) = job {
                ProvenanceEvent::record(
                    &mut tx,
                    "job",
                    job.id,
                    "job_lease_reaped",
                    &Actor::pipeline(),
                    serde_json::json!({ "attempt": job.attempt }),
                )
                .await?;
                reaped += 1;
            }
        }

        tx.commit().await?;

        if reaped > 0 {
            warn!(count = reaped, "reaped expired job leases");
        }
        Ok(reaped)
    }

    pub async fn find(&self, job_id: Uuid) -> Result<Job> {
        Job::find_by_id(self.store.pool(), job_id).await
    }

    pub async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let mut builder = QueryBuilder::new(format!("SELECT {JOB_COLUMNS} FROM jobs WHERE 1=1"));
        if let Some(status) = filter.status {
            builder.push(" AND status = ");
            builder.push_bind(status);
        }
        if let Some(kind) = filter.kind {
            builder.push(" AND kind = ");
            builder.push_bind(kind);
        }
        builder.push(" ORDER BY created_at DESC LIMIT ");
        builder.push_bind(filter.limit.unwrap_or(100));

        let jobs = builder
            .build_query_as::<Job>()
            .fetch_all(self.store.pool())
            .await?;
        Ok(jobs)
    }

    fn backoff_delay(&self, attempt: i32) -> Duration {
        backoff_delay(self.backoff_base_secs, self.backoff_ceiling_secs, attempt)
    }
}

/// Exponential backoff for the next retry after `attempt` failures,
/// capped at the ceiling.
fn backoff_delay(base_secs: i64, ceiling_secs: i64, attempt: i32) -> Duration {
    let shift = attempt.saturating_sub(1).clamp(0, 30) as u32;
    let secs = base_secs.saturating_mul(1i64 << shift).min(ceiling_secs);
    Duration::seconds(secs)
}

/// Atomic conditional claim of one job: queued and ready, or a lease
/// takeover of an expired claim. A takeover keeps the attempt the
/// prior claim already charged, so a crashed worker does not burn the
/// retry budget.
async fn claim_one(
    conn: &mut SqliteConnection,
    id: Uuid,
    worker_id: &str,
    now: DateTime<Utc>,
    lease_expires_at: DateTime<Utc>,
) -> Result<Option<Job>> {
    let job = sqlx::query_as::<_, Job>(&format!(
        r#"
        UPDATE jobs
        SET status = 'claimed', worker_id = $1, lease_expires_at = $2,
            attempt = CASE WHEN status = 'queued' THEN attempt + 1 ELSE attempt END,
            updated_at = $3
        WHERE id = $4
          AND ((status = 'queued' AND (next_run_at IS NULL OR next_run_at <= $3))
            OR (status = 'claimed' AND lease_expires_at < $3))
        RETURNING {JOB_COLUMNS}
        "#,
    ))
    .bind(worker_id)
    .bind(lease_expires_at)
    .bind(now)
    .bind(id)
    .fetch_optional(conn)
    .await?;

    Ok(job)
}

/// Transactional enqueue, used by intake so the discovery row and its
/// extraction job land or vanish together.
pub(crate) async fn enqueue_in_tx(
    conn: &mut SqliteConnection,
    target_type: &str,
    target_id: Uuid,
    input: &JobInput,
    max_attempts: i32,
) -> Result<EnqueueResult> {
    schedule_with_in_tx(conn, target_type, target_id, input, None, max_attempts).await
}

async fn schedule_with_in_tx(
    conn: &mut SqliteConnection,
    target_type: &str,
    target_id: Uuid,
    input: &JobInput,
    run_at: Option<DateTime<Utc>>,
    max_attempts: i32,
) -> Result<EnqueueResult> {
    let kind = input.kind();
    let dedupe_key = Job::dedupe_key_for(kind, target_id);

    if let Some(existing) = Job::find_live_by_dedupe_key(conn, &dedupe_key).await? {
        return Ok(EnqueueResult::Duplicate(existing));
    }

    let mut job = Job::builder()
        .kind(kind)
        .target_type(target_type)
        .target_id(target_id)
        .dedupe_key(dedupe_key.clone())
        .max_attempts(max_attempts)
        .input(Json(serde_json::to_value(input)?))
        .build();
    job.next_run_at = run_at;

    match job.insert(conn).await {
        Ok(job) => {
            info!(job_id = %job.id, kind = %job.kind, "enqueued job");
            Ok(EnqueueResult::Created(job))
        }
        // Unique-index backstop: a racing enqueue won; surface its job.
        Err(IngestError::Storage(sqlx::Error::Database(db_err)))
            if db_err.is_unique_violation() =>
        {
            let existing = Job::find_live_by_dedupe_key(conn, &dedupe_key)
                .await?
                .ok_or_else(|| {
                    IngestError::conflict(format!("live job for {dedupe_key} vanished mid-race"))
                })?;
            Ok(EnqueueResult::Duplicate(existing))
        }
        Err(other) => Err(other),
    }
}

fn stale_submission(job_id: Uuid, worker_id: &str) -> IngestError {
    IngestError::conflict(format!(
        "job {job_id} is not claimed by worker {worker_id}; lease lost or already resolved"
    ))
}
