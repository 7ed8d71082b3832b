//! Pipeline facade wiring the engine's components over one datastore.

use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::Result;
use crate::intake::{Intake, IntakeOutcome};
use crate::ledger::{JobFilter, JobLedger, JobOutcome};
use crate::lifecycle::Lifecycle;
use crate::ops::{CandidateFilter, Ops, PostingFilter};
use crate::orchestrator::{ExtractResult, Orchestrator, ProjectionOutcome};
use crate::policy::{PolicyUpsert, TrustPolicyResolver};
use crate::store::Store;
use crate::types::{
    Actor, Candidate, CandidateState, Evidence, Job, JobErrorKind, JobKind, NewDiscovery, Posting,
    PostingStatus, ProvenanceEvent, SourceTrustPolicy,
};

/// What a worker hands back for a claimed job.
#[derive(Debug, Clone)]
pub enum WorkResult {
    /// Extraction finished; project it into the catalogue.
    Extracted(ExtractResult),
    /// Any other job finished with this result payload.
    Completed(serde_json::Value),
    Failed {
        message: String,
        kind: JobErrorKind,
    },
}

/// Result of submitting a `WorkResult`.
#[derive(Debug)]
pub enum SubmitOutcome {
    /// The job's extraction result was projected.
    Projected(ProjectionOutcome),
    /// The job was resolved without catalogue effects.
    Resolved(Job),
}

/// The assembled ingestion pipeline.
#[derive(Clone)]
pub struct Pipeline {
    store: Store,
    config: EngineConfig,
    intake: Intake,
    ledger: JobLedger,
    lifecycle: Lifecycle,
    orchestrator: Orchestrator,
    policies: TrustPolicyResolver,
    ops: Ops,
}

impl Pipeline {
    /// Connect to the configured database and assemble the engine.
    pub async fn connect(config: EngineConfig) -> Result<Self> {
        let store = Store::connect(&config.database_url).await?;
        Ok(Self::assemble(store, config))
    }

    /// In-memory engine for tests.
    pub async fn in_memory() -> Result<Self> {
        let store = Store::in_memory().await?;
        Ok(Self::assemble(store, EngineConfig::default()))
    }

    fn assemble(store: Store, config: EngineConfig) -> Self {
        Self {
            intake: Intake::new(store.clone(), &config),
            ledger: JobLedger::new(store.clone(), &config),
            lifecycle: Lifecycle::new(store.clone()),
            orchestrator: Orchestrator::new(store.clone(), config.freshness_window_hours),
            policies: TrustPolicyResolver::new(store.clone()),
            ops: Ops::new(store.clone(), &config),
            store,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    // Intake

    pub async fn ingest_discovery(&self, new: &NewDiscovery) -> Result<IntakeOutcome> {
        self.intake.ingest_discovery(new).await
    }

    pub async fn add_evidence(
        &self,
        discovery_id: Uuid,
        kind: &str,
        storage_ref: &str,
    ) -> Result<Evidence> {
        self.intake.add_evidence(discovery_id, kind, storage_ref).await
    }

    // Job ledger

    pub async fn claim_jobs(
        &self,
        worker_id: &str,
        kinds: &[JobKind],
        batch_size: i64,
    ) -> Result<Vec<Job>> {
        self.ledger.claim(worker_id, kinds, batch_size).await
    }

    /// Claim one specific job: queued and ready, or lease-expired.
    pub async fn claim_job(&self, job_id: Uuid, worker_id: &str) -> Result<Job> {
        self.ledger.claim_job(job_id, worker_id).await
    }

    /// Resolve a claimed job.
    ///
    /// A successful extraction is projected into the catalogue in the
    /// same transaction that marks the job done; everything else goes
    /// straight to the ledger.
    pub async fn submit_result(
        &self,
        job_id: Uuid,
        worker_id: &str,
        result: WorkResult,
    ) -> Result<SubmitOutcome> {
        match result {
            WorkResult::Extracted(extract) => {
                let outcome = self
                    .orchestrator
                    .complete_extraction(job_id, worker_id, extract)
                    .await?;
                Ok(SubmitOutcome::Projected(outcome))
            }
            WorkResult::Completed(payload) => {
                let job = self
                    .ledger
                    .submit_result(job_id, worker_id, JobOutcome::Success(payload))
                    .await?;
                Ok(SubmitOutcome::Resolved(job))
            }
            WorkResult::Failed { message, kind } => {
                let job = self
                    .ledger
                    .submit_result(job_id, worker_id, JobOutcome::Failure { message, kind })
                    .await?;
                Ok(SubmitOutcome::Resolved(job))
            }
        }
    }

    pub async fn reap_expired_leases(&self) -> Result<u64> {
        self.ledger.reap_expired().await
    }

    pub async fn find_job(&self, job_id: Uuid) -> Result<Job> {
        self.ledger.find(job_id).await
    }

    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        self.ledger.list(filter).await
    }

    // Lifecycle

    pub async fn patch_candidate(
        &self,
        actor: &Actor,
        candidate_id: Uuid,
        to: CandidateState,
        reason: Option<&str>,
    ) -> Result<Candidate> {
        self.lifecycle
            .patch_candidate(actor, candidate_id, to, reason)
            .await
    }

    pub async fn override_candidate(
        &self,
        actor: &Actor,
        candidate_id: Uuid,
        to: CandidateState,
        reason: &str,
    ) -> Result<Candidate> {
        self.lifecycle
            .override_candidate(actor, candidate_id, to, reason)
            .await
    }

    pub async fn merge_candidates(
        &self,
        actor: &Actor,
        primary_id: Uuid,
        secondary_id: Uuid,
        reason: &str,
    ) -> Result<Candidate> {
        self.lifecycle
            .merge_candidates(actor, primary_id, secondary_id, reason)
            .await
    }

    pub async fn patch_posting(
        &self,
        actor: &Actor,
        posting_id: Uuid,
        to: PostingStatus,
        reason: Option<&str>,
    ) -> Result<Posting> {
        self.lifecycle
            .patch_posting(actor, posting_id, to, reason)
            .await
    }

    // Trust policies

    pub async fn upsert_policy(
        &self,
        actor: &Actor,
        input: PolicyUpsert,
    ) -> Result<SourceTrustPolicy> {
        self.policies.upsert(actor, input).await
    }

    pub async fn set_policy_enabled(
        &self,
        actor: &Actor,
        policy_key: &str,
        enabled: bool,
    ) -> Result<SourceTrustPolicy> {
        self.policies.set_enabled(actor, policy_key, enabled).await
    }

    pub async fn list_policies(&self) -> Result<Vec<SourceTrustPolicy>> {
        self.policies.list().await
    }

    // Maintenance

    pub async fn check_freshness(&self, posting_id: Uuid) -> Result<serde_json::Value> {
        self.orchestrator.check_freshness(posting_id).await
    }

    pub async fn schedule_freshness_checks(&self) -> Result<u64> {
        self.ops.schedule_freshness_checks().await
    }

    // Reads

    pub async fn find_candidate(&self, candidate_id: Uuid) -> Result<Candidate> {
        Candidate::find_by_id(self.store.pool(), candidate_id).await
    }

    pub async fn find_posting(&self, posting_id: Uuid) -> Result<Posting> {
        Posting::find_by_id(self.store.pool(), posting_id).await
    }

    pub async fn list_candidates(&self, filter: &CandidateFilter) -> Result<Vec<Candidate>> {
        self.ops.list_candidates(filter).await
    }

    pub async fn list_postings(&self, filter: &PostingFilter) -> Result<Vec<Posting>> {
        self.ops.list_postings(filter).await
    }

    pub async fn events_for(
        &self,
        entity_type: &str,
        entity_id: Uuid,
    ) -> Result<Vec<ProvenanceEvent>> {
        self.ops.events_for(entity_type, entity_id).await
    }
}
