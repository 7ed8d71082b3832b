//! Candidate record - the reviewable unit produced by projecting one or
//! more discoveries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteConnection;
use sqlx::types::Json;
use sqlx::{FromRow, SqlitePool};
use uuid::Uuid;

use crate::error::{IngestError, Result};
use crate::types::posting::PostingFields;

/// Candidate state.
///
/// `rejected`, `archived`, `closed` and `merged` are terminal; `merged`
/// is the merged-away marker and is only reachable through merge
/// execution, never through a normal patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CandidateState {
    Discovered,
    Processed,
    Publishable,
    Published,
    NeedsReview,
    Rejected,
    Archived,
    Closed,
    Merged,
}

impl CandidateState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CandidateState::Rejected
                | CandidateState::Archived
                | CandidateState::Closed
                | CandidateState::Merged
        )
    }

    /// Destructive targets require a reason on the normal patch path.
    pub fn is_destructive(&self) -> bool {
        matches!(
            self,
            CandidateState::Rejected | CandidateState::Archived | CandidateState::Closed
        )
    }

    pub const ALL: [CandidateState; 9] = [
        CandidateState::Discovered,
        CandidateState::Processed,
        CandidateState::Publishable,
        CandidateState::Published,
        CandidateState::NeedsReview,
        CandidateState::Rejected,
        CandidateState::Archived,
        CandidateState::Closed,
        CandidateState::Merged,
    ];
}

impl std::fmt::Display for CandidateState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CandidateState::Discovered => "discovered",
            CandidateState::Processed => "processed",
            CandidateState::Publishable => "publishable",
            CandidateState::Published => "published",
            CandidateState::NeedsReview => "needs_review",
            CandidateState::Rejected => "rejected",
            CandidateState::Archived => "archived",
            CandidateState::Closed => "closed",
            CandidateState::Merged => "merged",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for CandidateState {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "discovered" => Ok(CandidateState::Discovered),
            "processed" => Ok(CandidateState::Processed),
            "publishable" => Ok(CandidateState::Publishable),
            "published" => Ok(CandidateState::Published),
            "needs_review" => Ok(CandidateState::NeedsReview),
            "rejected" => Ok(CandidateState::Rejected),
            "archived" => Ok(CandidateState::Archived),
            "closed" => Ok(CandidateState::Closed),
            "merged" => Ok(CandidateState::Merged),
            _ => Err(IngestError::validation(format!(
                "invalid candidate state: {s}"
            ))),
        }
    }
}

/// Reviewable projection of one or more discoveries.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Candidate {
    pub id: Uuid,
    pub state: CandidateState,
    pub source_key: String,
    pub confidence: Option<f64>,
    pub risk_flags: Json<Vec<String>>,
    pub snapshot: Option<Json<PostingFields>>,
    pub moderation_route: Option<String>,
    pub posting_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

const CANDIDATE_COLUMNS: &str = "id, state, source_key, confidence, risk_flags, snapshot, \
     moderation_route, posting_id, created_at, updated_at";

impl Candidate {
    pub(crate) async fn insert(
        conn: &mut SqliteConnection,
        source_key: &str,
    ) -> Result<Self> {
        let candidate = sqlx::query_as::<_, Self>(&format!(
            r#"
            INSERT INTO candidates (id, state, source_key, created_at, updated_at)
            VALUES ($1, 'discovered', $2, $3, $3)
            RETURNING {CANDIDATE_COLUMNS}
            "#,
        ))
        .bind(Uuid::now_v7())
        .bind(source_key)
        .bind(Utc::now())
        .fetch_one(conn)
        .await?;

        Ok(candidate)
    }

    pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Self> {
        sqlx::query_as::<_, Self>(&format!(
            "SELECT {CANDIDATE_COLUMNS} FROM candidates WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| IngestError::not_found("candidate", id))
    }

    pub(crate) async fn find_in_tx(conn: &mut SqliteConnection, id: Uuid) -> Result<Self> {
        sqlx::query_as::<_, Self>(&format!(
            "SELECT {CANDIDATE_COLUMNS} FROM candidates WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(conn)
        .await?
        .ok_or_else(|| IngestError::not_found("candidate", id))
    }

    /// The candidate a discovery was projected into, if any.
    pub(crate) async fn find_by_discovery(
        conn: &mut SqliteConnection,
        discovery_id: Uuid,
    ) -> Result<Option<Self>> {
        let candidate = sqlx::query_as::<_, Self>(&format!(
            r#"
            SELECT c.{0}
            FROM candidates c
            JOIN candidate_discoveries cd ON cd.candidate_id = c.id
            WHERE cd.discovery_id = $1
            LIMIT 1
            "#,
            CANDIDATE_COLUMNS.replace(", ", ", c."),
        ))
        .bind(discovery_id)
        .fetch_optional(conn)
        .await?;

        Ok(candidate)
    }

    /// Attach a discovery to this candidate. The discovery set only
    /// grows; re-linking is a no-op.
    pub(crate) async fn link_discovery(
        conn: &mut SqliteConnection,
        candidate_id: Uuid,
        discovery_id: Uuid,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO candidate_discoveries (candidate_id, discovery_id)
            VALUES ($1, $2)
            "#,
        )
        .bind(candidate_id)
        .bind(discovery_id)
        .execute(conn)
        .await?;

        Ok(())
    }

    pub async fn discovery_ids(pool: &SqlitePool, candidate_id: Uuid) -> Result<Vec<Uuid>> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT discovery_id FROM candidate_discoveries
            WHERE candidate_id = $1
            ORDER BY discovery_id
            "#,
        )
        .bind(candidate_id)
        .fetch_all(pool)
        .await?;

        Ok(ids)
    }

    /// Persist the scorer/extraction outcome for this candidate.
    pub(crate) async fn update_projection(
        conn: &mut SqliteConnection,
        id: Uuid,
        confidence: Option<f64>,
        risk_flags: &[String],
        snapshot: &PostingFields,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE candidates
            SET confidence = $1, risk_flags = $2, snapshot = $3, updated_at = $4
            WHERE id = $5
            "#,
        )
        .bind(confidence)
        .bind(Json(risk_flags.to_vec()))
        .bind(Json(snapshot.clone()))
        .bind(Utc::now())
        .bind(id)
        .execute(conn)
        .await?;

        Ok(())
    }

    pub(crate) async fn update_state(
        conn: &mut SqliteConnection,
        id: Uuid,
        state: CandidateState,
        moderation_route: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE candidates
            SET state = $1, moderation_route = $2, updated_at = $3
            WHERE id = $4
            "#,
        )
        .bind(state)
        .bind(moderation_route)
        .bind(Utc::now())
        .bind(id)
        .execute(conn)
        .await?;

        Ok(())
    }

    pub(crate) async fn set_posting(
        conn: &mut SqliteConnection,
        id: Uuid,
        posting_id: Option<Uuid>,
    ) -> Result<()> {
        sqlx::query("UPDATE candidates SET posting_id = $1, updated_at = $2 WHERE id = $3")
            .bind(posting_id)
            .bind(Utc::now())
            .bind(id)
            .execute(conn)
            .await?;

        Ok(())
    }
}
