//! Posting ingestion pipeline engine.
//!
//! Takes raw discoveries reported by producers and turns them into a
//! deduplicated, policy-governed catalogue of postings:
//!
//! - **Intake**: idempotent discovery recording with evidence pointers
//! - **Job ledger**: durable, lease-based work queue with bounded retry
//! - **Dedupe scorer**: deterministic merge-confidence scoring
//! - **Trust policies**: per-source publish and moderation policy
//! - **Merge router**: fixed decision bands over score and policy
//! - **Lifecycle**: transactional candidate/posting state machine
//! - **Orchestrator**: extraction results projected in one transaction
//!
//! The [`Pipeline`] facade wires everything over a single SQLite store:
//!
//! ```no_run
//! use ingestion::{Pipeline, NewDiscovery};
//!
//! # async fn example() -> ingestion::Result<()> {
//! let pipeline = Pipeline::in_memory().await?;
//! let outcome = pipeline
//!     .ingest_discovery(&NewDiscovery {
//!         origin: "acme_board".to_string(),
//!         external_id: "listing-42".to_string(),
//!         url: Some("https://acme.org/jobs/42".to_string()),
//!         hints: serde_json::json!({ "trust_level": "trusted" }),
//!         metadata: serde_json::json!({}),
//!     })
//!     .await?;
//! assert!(outcome.created);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod dedupe;
pub mod error;
pub mod intake;
pub mod ledger;
pub mod lifecycle;
pub mod ops;
pub mod orchestrator;
pub mod pipeline;
pub mod policy;
pub mod router;
pub mod store;
pub mod types;
pub mod worker;

pub use config::EngineConfig;
pub use error::{IngestError, Result};
pub use intake::IntakeOutcome;
pub use ledger::{EnqueueResult, JobFilter, JobLedger, JobOutcome};
pub use lifecycle::Lifecycle;
pub use ops::{CandidateFilter, PostingFilter};
pub use orchestrator::{ExtractResult, Orchestrator, ProjectionOutcome};
pub use pipeline::{Pipeline, SubmitOutcome, WorkResult};
pub use policy::{PolicyUpsert, TrustPolicyResolver};
pub use router::{MergeAction, MergeDecision};
pub use store::Store;
pub use types::{
    Actor, Candidate, CandidateState, Discovery, Evidence, Job, JobErrorKind, JobInput, JobKind,
    JobStatus, NewDiscovery, Posting, PostingFields, PostingStatus, ProvenanceEvent,
    SourceTrustPolicy, TrustLevel,
};
pub use worker::PipelineWorker;
