//! Discovery and evidence records.
//!
//! A discovery is an immutable, append-only record of "something was
//! found". `(origin, external_id)` is unique; re-submission is
//! idempotent and returns the existing record. Evidence rows are
//! pointers to raw source material, never inline content.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteConnection;
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;

use crate::error::{IngestError, Result};

/// Immutable record of a raw find reported by a producer.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Discovery {
    pub id: Uuid,
    pub origin: String,
    pub external_id: String,
    pub url: Option<String>,
    pub normalized_url: Option<String>,
    pub content_hash: Option<String>,
    pub hints: Json<serde_json::Value>,
    pub metadata: Json<serde_json::Value>,
    pub discovered_at: DateTime<Utc>,
}

/// Producer-supplied fields for a new discovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewDiscovery {
    pub origin: String,
    pub external_id: String,
    pub url: Option<String>,
    #[serde(default)]
    pub hints: serde_json::Value,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl Discovery {
    /// Insert a discovery, or return the existing row for the same
    /// `(origin, external_id)`. The boolean is true when a row was created.
    ///
    /// Insert-first: the unique index decides, so a racing duplicate
    /// submission resolves to the existing row instead of an error.
    pub async fn insert_idempotent(
        conn: &mut SqliteConnection,
        new: &NewDiscovery,
        normalized_url: Option<String>,
        content_hash: Option<String>,
    ) -> Result<(Self, bool)> {
        let inserted = sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO discoveries
                (id, origin, external_id, url, normalized_url, content_hash,
                 hints, metadata, discovered_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING id, origin, external_id, url, normalized_url, content_hash,
                      hints, metadata, discovered_at
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(&new.origin)
        .bind(&new.external_id)
        .bind(&new.url)
        .bind(normalized_url)
        .bind(content_hash)
        .bind(Json(new.hints.clone()))
        .bind(Json(new.metadata.clone()))
        .bind(Utc::now())
        .fetch_one(&mut *conn)
        .await;

        match inserted {
            Ok(discovery) => Ok((discovery, true)),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                let existing = Self::find_by_origin(conn, &new.origin, &new.external_id)
                    .await?
                    .ok_or_else(|| {
                        IngestError::conflict(format!(
                            "discovery ({}, {}) vanished mid-race",
                            new.origin, new.external_id
                        ))
                    })?;
                Ok((existing, false))
            }
            Err(other) => Err(other.into()),
        }
    }

    pub async fn find_by_id(conn: &mut SqliteConnection, id: Uuid) -> Result<Self> {
        sqlx::query_as::<_, Self>(
            r#"
            SELECT id, origin, external_id, url, normalized_url, content_hash,
                   hints, metadata, discovered_at
            FROM discoveries
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(conn)
        .await?
        .ok_or_else(|| IngestError::not_found("discovery", id))
    }

    pub async fn find_by_origin(
        conn: &mut SqliteConnection,
        origin: &str,
        external_id: &str,
    ) -> Result<Option<Self>> {
        let discovery = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, origin, external_id, url, normalized_url, content_hash,
                   hints, metadata, discovered_at
            FROM discoveries
            WHERE origin = $1 AND external_id = $2
            "#,
        )
        .bind(origin)
        .bind(external_id)
        .fetch_optional(conn)
        .await?;

        Ok(discovery)
    }

    /// Trust-level hint supplied by the producer, if any.
    pub fn trust_level_hint(&self) -> Option<&str> {
        self.hints.0.get("trust_level").and_then(|v| v.as_str())
    }
}

/// Pointer-stored artifact associated with one discovery.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Evidence {
    pub id: Uuid,
    pub discovery_id: Uuid,
    pub kind: String,
    pub storage_ref: String,
    pub created_at: DateTime<Utc>,
}

impl Evidence {
    pub async fn insert(
        conn: &mut SqliteConnection,
        discovery_id: Uuid,
        kind: &str,
        storage_ref: &str,
    ) -> Result<Self> {
        let evidence = sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO evidence (id, discovery_id, kind, storage_ref, created_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, discovery_id, kind, storage_ref, created_at
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(discovery_id)
        .bind(kind)
        .bind(storage_ref)
        .bind(Utc::now())
        .fetch_one(conn)
        .await?;

        Ok(evidence)
    }

    pub async fn list_for_discovery(
        conn: &mut SqliteConnection,
        discovery_id: Uuid,
    ) -> Result<Vec<Self>> {
        let evidence = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, discovery_id, kind, storage_ref, created_at
            FROM evidence
            WHERE discovery_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(discovery_id)
        .fetch_all(conn)
        .await?;

        Ok(evidence)
    }
}
