//! Discovery intake.
//!
//! Producers report finds here. Intake is idempotent on
//! `(origin, external_id)` and the extraction job is enqueued in the
//! same transaction as the discovery row, so a find can never be
//! recorded without its follow-up work.

use tracing::info;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::dedupe;
use crate::error::{IngestError, Result};
use crate::ledger;
use crate::store::Store;
use crate::types::{Actor, Discovery, Evidence, Job, JobInput, NewDiscovery, ProvenanceEvent};

/// Outcome of one intake submission.
#[derive(Debug)]
pub struct IntakeOutcome {
    pub discovery: Discovery,
    /// False when the `(origin, external_id)` pair was already known.
    pub created: bool,
    /// The extraction job now covering this discovery (new or live).
    pub job: Job,
}

/// Accepts discoveries and evidence from producers.
#[derive(Clone)]
pub struct Intake {
    store: Store,
    max_attempts: i32,
}

impl Intake {
    pub fn new(store: Store, config: &EngineConfig) -> Self {
        Self {
            store,
            max_attempts: config.max_attempts,
        }
    }

    /// Record a discovery and enqueue its extraction.
    ///
    /// Re-submitting a known `(origin, external_id)` returns the
    /// existing discovery and collapses onto any live extraction job.
    pub async fn ingest_discovery(&self, new: &NewDiscovery) -> Result<IntakeOutcome> {
        if new.origin.trim().is_empty() || new.external_id.trim().is_empty() {
            return Err(IngestError::validation(
                "origin and external_id are required".to_string(),
            ));
        }

        let normalized_url = new.url.as_deref().map(dedupe::normalize_url);
        let content_hash = new
            .metadata
            .get("content")
            .and_then(|v| v.as_str())
            .map(dedupe::content_hash);

        let mut tx = self.store.begin().await?;

        let (discovery, created) =
            Discovery::insert_idempotent(&mut tx, new, normalized_url, content_hash).await?;

        if created {
            ProvenanceEvent::record(
                &mut tx,
                "discovery",
                discovery.id,
                "discovery_recorded",
                &Actor::Producer(new.origin.clone()),
                serde_json::json!({ "external_id": new.external_id }),
            )
            .await?;
        }

        let enqueued = ledger::enqueue_in_tx(
            &mut tx,
            "discovery",
            discovery.id,
            &JobInput::Extract {
                discovery_id: discovery.id,
            },
            self.max_attempts,
        )
        .await?;
        let job = enqueued.job().clone();

        tx.commit().await?;

        info!(
            discovery_id = %discovery.id,
            origin = %discovery.origin,
            created,
            "discovery ingested"
        );
        Ok(IntakeOutcome {
            discovery,
            created,
            job,
        })
    }

    /// Attach pointer-stored evidence to a known discovery.
    pub async fn add_evidence(
        &self,
        discovery_id: Uuid,
        kind: &str,
        storage_ref: &str,
    ) -> Result<Evidence> {
        if storage_ref.trim().is_empty() {
            return Err(IngestError::validation(
                "evidence storage_ref is required".to_string(),
            ));
        }

        let mut tx = self.store.begin().await?;
        // Existence check keeps dangling evidence out even without
        // enforced foreign keys.
        let discovery = Discovery::find_by_id(&mut tx, discovery_id).await?;
        let evidence = Evidence::insert(&mut tx, discovery.id, kind, storage_ref).await?;
        tx.commit().await?;

        Ok(evidence)
    }

    pub async fn find_discovery(&self, discovery_id: Uuid) -> Result<Discovery> {
        let mut conn = self.store.pool().acquire().await?;
        Discovery::find_by_id(&mut conn, discovery_id).await
    }

    pub async fn list_evidence(&self, discovery_id: Uuid) -> Result<Vec<Evidence>> {
        let mut conn = self.store.pool().acquire().await?;
        Evidence::list_for_discovery(&mut conn, discovery_id).await
    }
}
