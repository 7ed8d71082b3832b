//! Operational read paths and maintenance scheduling.

use chrono::{Duration, Utc};
use sqlx::QueryBuilder;
use tracing::info;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::Result;
use crate::ledger;
use crate::store::Store;
use crate::types::{
    Candidate, CandidateState, JobInput, Posting, PostingStatus, ProvenanceEvent,
};

/// Filters for the candidate list.
#[derive(Debug, Clone, Default)]
pub struct CandidateFilter {
    pub state: Option<CandidateState>,
    pub source_key: Option<String>,
    pub moderation_route: Option<String>,
    pub limit: Option<i64>,
}

/// Filters for the posting list.
#[derive(Debug, Clone, Default)]
pub struct PostingFilter {
    pub status: Option<PostingStatus>,
    pub limit: Option<i64>,
}

/// Read-side queries for consoles and maintenance scheduling.
#[derive(Clone)]
pub struct Ops {
    store: Store,
    freshness_window_hours: i64,
    batch_size: i64,
    max_attempts: i32,
}

impl Ops {
    pub fn new(store: Store, config: &EngineConfig) -> Self {
        Self {
            store,
            freshness_window_hours: config.freshness_window_hours,
            batch_size: config.batch_size,
            max_attempts: config.max_attempts,
        }
    }

    pub async fn list_candidates(&self, filter: &CandidateFilter) -> Result<Vec<Candidate>> {
        let mut builder = QueryBuilder::new(
            "SELECT id, state, source_key, confidence, risk_flags, snapshot, \
             moderation_route, posting_id, created_at, updated_at \
             FROM candidates WHERE 1=1",
        );
        if let Some(state) = filter.state {
            builder.push(" AND state = ");
            builder.push_bind(state);
        }
        if let Some(source_key) = &filter.source_key {
            builder.push(" AND source_key = ");
            builder.push_bind(source_key.clone());
        }
        if let Some(route) = &filter.moderation_route {
            builder.push(" AND moderation_route = ");
            builder.push_bind(route.clone());
        }
        builder.push(" ORDER BY updated_at DESC LIMIT ");
        builder.push_bind(filter.limit.unwrap_or(100));

        let candidates = builder
            .build_query_as::<Candidate>()
            .fetch_all(self.store.pool())
            .await?;
        Ok(candidates)
    }

    pub async fn list_postings(&self, filter: &PostingFilter) -> Result<Vec<Posting>> {
        let mut builder = QueryBuilder::new(
            "SELECT id, candidate_id, status, title, organization, url, location, \
             tags, deadline, description, content_hash, normalized_url, \
             last_seen_at, created_at, updated_at \
             FROM postings WHERE 1=1",
        );
        if let Some(status) = filter.status {
            builder.push(" AND status = ");
            builder.push_bind(status);
        }
        builder.push(" ORDER BY last_seen_at DESC LIMIT ");
        builder.push_bind(filter.limit.unwrap_or(100));

        let postings = builder
            .build_query_as::<Posting>()
            .fetch_all(self.store.pool())
            .await?;
        Ok(postings)
    }

    /// Audit trail for one entity, oldest first.
    pub async fn events_for(
        &self,
        entity_type: &str,
        entity_id: Uuid,
    ) -> Result<Vec<ProvenanceEvent>> {
        ProvenanceEvent::list_for_entity(self.store.pool(), entity_type, entity_id, 500).await
    }

    /// Enqueue freshness checks for active postings unseen past the
    /// window. Returns how many new jobs were created; postings already
    /// covered by a live job are skipped by job dedupe.
    pub async fn schedule_freshness_checks(&self) -> Result<u64> {
        let cutoff = Utc::now() - Duration::hours(self.freshness_window_hours);
        let due = Posting::list_unseen_since(self.store.pool(), cutoff, self.batch_size).await?;

        let mut scheduled = 0u64;
        for posting in due {
            let mut tx = self.store.begin().await?;
            let enqueued = ledger::enqueue_in_tx(
                &mut tx,
                "posting",
                posting.id,
                &JobInput::CheckFreshness {
                    posting_id: posting.id,
                },
                self.max_attempts,
            )
            .await?;
            tx.commit().await?;

            if enqueued.is_created() {
                scheduled += 1;
            }
        }

        if scheduled > 0 {
            info!(count = scheduled, "scheduled freshness checks");
        }
        Ok(scheduled)
    }
}
