//! Job record for durable asynchronous work.
//!
//! Jobs are mutated only through the ledger's claim/result/reap
//! operations and are retained for audit, never deleted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteConnection;
use sqlx::types::Json;
use sqlx::{FromRow, SqlitePool};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::error::{IngestError, Result};

/// Kind of asynchronous work a job represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Extract,
    Enrich,
    Dedupe,
    CheckFreshness,
    ResolveRedirects,
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobKind::Extract => "extract",
            JobKind::Enrich => "enrich",
            JobKind::Dedupe => "dedupe",
            JobKind::CheckFreshness => "check_freshness",
            JobKind::ResolveRedirects => "resolve_redirects",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for JobKind {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "extract" => Ok(JobKind::Extract),
            "enrich" => Ok(JobKind::Enrich),
            "dedupe" => Ok(JobKind::Dedupe),
            "check_freshness" => Ok(JobKind::CheckFreshness),
            "resolve_redirects" => Ok(JobKind::ResolveRedirects),
            _ => Err(IngestError::validation(format!("unknown job kind: {s}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Queued,
    Claimed,
    Done,
    Failed,
    DeadLetter,
}

impl JobStatus {
    /// Terminal for this job instance; a new job may later be enqueued
    /// for the same target.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::DeadLetter)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobErrorKind {
    /// Transient error - will retry if attempts remain
    #[default]
    Retryable,
    /// Permanent error - dead-letters immediately
    NonRetryable,
}

impl JobErrorKind {
    pub fn should_retry(&self) -> bool {
        matches!(self, JobErrorKind::Retryable)
    }
}

/// Typed input payload, tagged by job kind.
///
/// Raw payloads are normalized into this shape at the orchestrator
/// boundary; untyped maps never reach business logic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobInput {
    Extract { discovery_id: Uuid },
    Enrich { candidate_id: Uuid },
    Dedupe { candidate_id: Uuid },
    CheckFreshness { posting_id: Uuid },
    ResolveRedirects { url: String },
}

impl JobInput {
    pub fn kind(&self) -> JobKind {
        match self {
            JobInput::Extract { .. } => JobKind::Extract,
            JobInput::Enrich { .. } => JobKind::Enrich,
            JobInput::Dedupe { .. } => JobKind::Dedupe,
            JobInput::CheckFreshness { .. } => JobKind::CheckFreshness,
            JobInput::ResolveRedirects { .. } => JobKind::ResolveRedirects,
        }
    }
}

/// A unit of asynchronous work in the ledger.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Job {
    #[builder(default = Uuid::now_v7())]
    pub id: Uuid,

    pub kind: JobKind,
    pub target_type: String,
    pub target_id: Uuid,
    pub dedupe_key: String,

    #[builder(default)]
    pub status: JobStatus,
    #[builder(default = 0)]
    pub attempt: i32,
    #[builder(default = 3)]
    pub max_attempts: i32,

    #[builder(default, setter(strip_option))]
    pub next_run_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub lease_expires_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub worker_id: Option<String>,

    #[builder(default = Json(serde_json::json!({})))]
    pub input: Json<serde_json::Value>,
    #[builder(default, setter(strip_option))]
    pub result: Option<Json<serde_json::Value>>,
    #[builder(default, setter(strip_option))]
    pub error_message: Option<String>,
    #[builder(default, setter(strip_option))]
    pub error_kind: Option<JobErrorKind>,

    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

/// All job columns, in insert/select order.
pub(crate) const JOB_COLUMNS: &str = "id, kind, target_type, target_id, dedupe_key, status, \
     attempt, max_attempts, next_run_at, lease_expires_at, worker_id, \
     input, result, error_message, error_kind, created_at, updated_at";

impl Job {
    /// Natural dedupe key: one live job per `(kind, target)` pair.
    pub fn dedupe_key_for(kind: JobKind, target_id: Uuid) -> String {
        format!("{kind}:{target_id}")
    }

    /// Deserialize the typed input payload.
    pub fn typed_input(&self) -> Result<JobInput> {
        serde_json::from_value(self.input.0.clone())
            .map_err(|e| IngestError::validation(format!("malformed input for job {}: {e}", self.id)))
    }

    /// Whether the lease on a claimed job has passed.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Claimed
            && self.lease_expires_at.map(|at| at < now).unwrap_or(true)
    }

    pub(crate) async fn insert(&self, conn: &mut SqliteConnection) -> Result<Self> {
        let job = sqlx::query_as::<_, Self>(&format!(
            r#"
            INSERT INTO jobs ({JOB_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            RETURNING {JOB_COLUMNS}
            "#,
        ))
        .bind(self.id)
        .bind(self.kind)
        .bind(&self.target_type)
        .bind(self.target_id)
        .bind(&self.dedupe_key)
        .bind(self.status)
        .bind(self.attempt)
        .bind(self.max_attempts)
        .bind(self.next_run_at)
        .bind(self.lease_expires_at)
        .bind(&self.worker_id)
        .bind(&self.input)
        .bind(&self.result)
        .bind(&self.error_message)
        .bind(self.error_kind)
        .bind(self.created_at)
        .bind(self.updated_at)
        .fetch_one(conn)
        .await?;

        Ok(job)
    }

    pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Self> {
        sqlx::query_as::<_, Self>(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(id)
            .fetch_optional(pool)
            .await?
            .ok_or_else(|| IngestError::not_found("job", id))
    }

    pub(crate) async fn find_in_tx(conn: &mut SqliteConnection, id: Uuid) -> Result<Self> {
        sqlx::query_as::<_, Self>(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(id)
            .fetch_optional(conn)
            .await?
            .ok_or_else(|| IngestError::not_found("job", id))
    }

    /// The live (queued or claimed) job holding a dedupe key, if any.
    pub(crate) async fn find_live_by_dedupe_key(
        conn: &mut SqliteConnection,
        dedupe_key: &str,
    ) -> Result<Option<Self>> {
        let job = sqlx::query_as::<_, Self>(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE dedupe_key = $1 AND status IN ('queued', 'claimed')
            LIMIT 1
            "#,
        ))
        .bind(dedupe_key)
        .fetch_optional(conn)
        .await?;

        Ok(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_job() -> Job {
        Job::builder()
            .kind(JobKind::Extract)
            .target_type("discovery")
            .target_id(Uuid::now_v7())
            .dedupe_key("extract:x")
            .build()
    }

    #[test]
    fn new_job_starts_queued_with_zero_attempts() {
        let job = sample_job();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempt, 0);
        assert_eq!(job.max_attempts, 3);
    }

    #[test]
    fn dedupe_key_is_kind_and_target() {
        let id = Uuid::now_v7();
        assert_eq!(
            Job::dedupe_key_for(JobKind::CheckFreshness, id),
            format!("check_freshness:{id}")
        );
    }

    #[test]
    fn claimed_job_without_expiry_counts_as_expired() {
        let mut job = sample_job();
        job.status = JobStatus::Claimed;
        assert!(job.lease_expired(Utc::now()));
    }

    #[test]
    fn non_retryable_error_should_not_retry() {
        assert!(JobErrorKind::Retryable.should_retry());
        assert!(!JobErrorKind::NonRetryable.should_retry());
    }

    #[test]
    fn job_kind_round_trips_through_strings() {
        for kind in [
            JobKind::Extract,
            JobKind::Enrich,
            JobKind::Dedupe,
            JobKind::CheckFreshness,
            JobKind::ResolveRedirects,
        ] {
            let parsed: JobKind = kind.to_string().parse().unwrap();
            assert_eq!(parsed, kind);
        }
    }

    #[test]
    fn typed_input_rejects_mismatched_payload() {
        let mut job = sample_job();
        job.input = Json(serde_json::json!({"kind": "nonsense"}));
        assert!(job.typed_input().is_err());
    }
}
