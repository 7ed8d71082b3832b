//! Append-only provenance events.
//!
//! Every state-changing operation writes its event in the same
//! transaction as the state change it documents. Events are never
//! mutated or deleted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteConnection;
use sqlx::types::Json;
use sqlx::{FromRow, SqlitePool};
use uuid::Uuid;

use crate::error::Result;
use crate::types::Actor;

/// Audit record of a state-changing action.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ProvenanceEvent {
    pub id: Uuid,
    pub entity_type: String,
    pub entity_id: Uuid,
    pub event_type: String,
    pub actor_type: String,
    pub actor_id: String,
    pub payload: Json<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl ProvenanceEvent {
    /// Append an event inside the caller's transaction.
    pub async fn record(
        conn: &mut SqliteConnection,
        entity_type: &str,
        entity_id: Uuid,
        event_type: &str,
        actor: &Actor,
        payload: serde_json::Value,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO provenance_events
                (id, entity_type, entity_id, event_type, actor_type, actor_id, payload, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(entity_type)
        .bind(entity_id)
        .bind(event_type)
        .bind(actor.actor_type())
        .bind(actor.actor_id())
        .bind(Json(payload))
        .bind(Utc::now())
        .execute(conn)
        .await?;

        Ok(())
    }

    /// Events for one entity, oldest first.
    pub async fn list_for_entity(
        pool: &SqlitePool,
        entity_type: &str,
        entity_id: Uuid,
        limit: i64,
    ) -> Result<Vec<Self>> {
        let events = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, entity_type, entity_id, event_type, actor_type, actor_id, payload, created_at
            FROM provenance_events
            WHERE entity_type = $1 AND entity_id = $2
            ORDER BY created_at ASC
            LIMIT $3
            "#,
        )
        .bind(entity_type)
        .bind(entity_id)
        .bind(limit)
        .fetch_all(pool)
        .await?;

        Ok(events)
    }
}
