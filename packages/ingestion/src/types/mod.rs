//! Data model records and their persistence helpers.

pub mod actor;
pub mod candidate;
pub mod discovery;
pub mod event;
pub mod job;
pub mod policy;
pub mod posting;

pub use actor::Actor;
pub use candidate::{Candidate, CandidateState};
pub use discovery::{Discovery, Evidence, NewDiscovery};
pub use event::ProvenanceEvent;
pub use job::{Job, JobErrorKind, JobInput, JobKind, JobStatus};
pub use policy::{EffectivePolicy, SourceTrustPolicy, TrustLevel};
pub use posting::{Posting, PostingFields, PostingStatus};
