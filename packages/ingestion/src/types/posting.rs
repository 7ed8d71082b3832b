//! Posting record - the public-facing, published unit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteConnection;
use sqlx::types::Json;
use sqlx::{FromRow, SqlitePool};
use uuid::Uuid;

use crate::error::{IngestError, Result};

/// Posting status. `closed` is terminal and only reachable by explicit
/// operator action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PostingStatus {
    Active,
    Stale,
    Archived,
    Closed,
}

impl PostingStatus {
    pub const ALL: [PostingStatus; 4] = [
        PostingStatus::Active,
        PostingStatus::Stale,
        PostingStatus::Archived,
        PostingStatus::Closed,
    ];
}

impl std::fmt::Display for PostingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PostingStatus::Active => "active",
            PostingStatus::Stale => "stale",
            PostingStatus::Archived => "archived",
            PostingStatus::Closed => "closed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for PostingStatus {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(PostingStatus::Active),
            "stale" => Ok(PostingStatus::Stale),
            "archived" => Ok(PostingStatus::Archived),
            "closed" => Ok(PostingStatus::Closed),
            _ => Err(IngestError::validation(format!(
                "invalid posting status: {s}"
            ))),
        }
    }
}

/// Canonical published fields, also used as the candidate's extracted
/// snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PostingFields {
    pub title: String,
    pub organization: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Published, public-facing catalogue entry.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Posting {
    pub id: Uuid,
    pub candidate_id: Uuid,
    pub status: PostingStatus,
    pub title: String,
    pub organization: String,
    pub url: Option<String>,
    pub location: Option<String>,
    pub tags: Json<Vec<String>>,
    pub deadline: Option<DateTime<Utc>>,
    pub description: Option<String>,
    pub content_hash: Option<String>,
    pub normalized_url: Option<String>,
    pub last_seen_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

const POSTING_COLUMNS: &str = "id, candidate_id, status, title, organization, url, location, \
     tags, deadline, description, content_hash, normalized_url, \
     last_seen_at, created_at, updated_at";

impl Posting {
    /// Materialize a posting from a candidate's snapshot.
    pub(crate) async fn insert_from_fields(
        conn: &mut SqliteConnection,
        candidate_id: Uuid,
        fields: &PostingFields,
        content_hash: Option<&str>,
        normalized_url: Option<&str>,
    ) -> Result<Self> {
        let now = Utc::now();
        let posting = sqlx::query_as::<_, Self>(&format!(
            r#"
            INSERT INTO postings
                (id, candidate_id, status, title, organization, url, location,
                 tags, deadline, description, content_hash, normalized_url,
                 last_seen_at, created_at, updated_at)
            VALUES ($1, $2, 'active', $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $12, $12)
            RETURNING {POSTING_COLUMNS}
            "#,
        ))
        .bind(Uuid::now_v7())
        .bind(candidate_id)
        .bind(&fields.title)
        .bind(&fields.organization)
        .bind(&fields.url)
        .bind(&fields.location)
        .bind(Json(fields.tags.clone()))
        .bind(fields.deadline)
        .bind(&fields.description)
        .bind(content_hash)
        .bind(normalized_url)
        .bind(now)
        .fetch_one(conn)
        .await?;

        Ok(posting)
    }

    pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Self> {
        sqlx::query_as::<_, Self>(&format!(
            "SELECT {POSTING_COLUMNS} FROM postings WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| IngestError::not_found("posting", id))
    }

    pub(crate) async fn find_in_tx(conn: &mut SqliteConnection, id: Uuid) -> Result<Self> {
        sqlx::query_as::<_, Self>(&format!(
            "SELECT {POSTING_COLUMNS} FROM postings WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(conn)
        .await?
        .ok_or_else(|| IngestError::not_found("posting", id))
    }

    /// Exact-signal probe: postings sharing a canonical content hash or
    /// normalized URL.
    pub(crate) async fn find_exact_matches(
        conn: &mut SqliteConnection,
        content_hash: Option<&str>,
        normalized_url: Option<&str>,
    ) -> Result<Vec<Self>> {
        let postings = sqlx::query_as::<_, Self>(&format!(
            r#"
            SELECT {POSTING_COLUMNS}
            FROM postings
            WHERE status IN ('active', 'stale')
              AND (($1 IS NOT NULL AND content_hash = $1)
                OR ($2 IS NOT NULL AND normalized_url = $2))
            ORDER BY created_at ASC
            "#,
        ))
        .bind(content_hash)
        .bind(normalized_url)
        .fetch_all(conn)
        .await?;

        Ok(postings)
    }

    /// Recent live postings for similarity comparison.
    pub(crate) async fn list_recent_live(
        conn: &mut SqliteConnection,
        limit: i64,
    ) -> Result<Vec<Self>> {
        let postings = sqlx::query_as::<_, Self>(&format!(
            r#"
            SELECT {POSTING_COLUMNS}
            FROM postings
            WHERE status IN ('active', 'stale')
            ORDER BY last_seen_at DESC
            LIMIT $1
            "#,
        ))
        .bind(limit)
        .fetch_all(conn)
        .await?;

        Ok(postings)
    }

    pub(crate) async fn update_status(
        conn: &mut SqliteConnection,
        id: Uuid,
        status: PostingStatus,
    ) -> Result<()> {
        sqlx::query("UPDATE postings SET status = $1, updated_at = $2 WHERE id = $3")
            .bind(status)
            .bind(Utc::now())
            .bind(id)
            .execute(conn)
            .await?;

        Ok(())
    }

    /// Record that the posting's source content was seen again.
    pub(crate) async fn mark_seen(conn: &mut SqliteConnection, id: Uuid) -> Result<()> {
        let now = Utc::now();
        sqlx::query("UPDATE postings SET last_seen_at = $1, updated_at = $1 WHERE id = $2")
            .bind(now)
            .bind(id)
            .execute(conn)
            .await?;

        Ok(())
    }

    /// Transfer ownership to another candidate (merge adoption path).
    pub(crate) async fn set_owner(
        conn: &mut SqliteConnection,
        id: Uuid,
        candidate_id: Uuid,
    ) -> Result<()> {
        sqlx::query("UPDATE postings SET candidate_id = $1, updated_at = $2 WHERE id = $3")
            .bind(candidate_id)
            .bind(Utc::now())
            .bind(id)
            .execute(conn)
            .await?;

        Ok(())
    }

    /// Active postings not seen since the cutoff (freshness maintenance).
    pub async fn list_unseen_since(
        pool: &SqlitePool,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Self>> {
        let postings = sqlx::query_as::<_, Self>(&format!(
            r#"
            SELECT {POSTING_COLUMNS}
            FROM postings
            WHERE status = 'active' AND last_seen_at < $1
            ORDER BY last_seen_at ASC
            LIMIT $2
            "#,
        ))
        .bind(cutoff)
        .bind(limit)
        .fetch_all(pool)
        .await?;

        Ok(postings)
    }

    /// The posting's comparison text for the dedupe scorer.
    pub fn comparison_text(&self) -> String {
        match &self.description {
            Some(description) => format!("{} {} {}", self.title, self.organization, description),
            None => format!("{} {}", self.title, self.organization),
        }
    }
}
