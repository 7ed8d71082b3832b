//! Resolved caller identity.
//!
//! The engine receives an already-resolved actor and never resolves
//! credentials itself. Every provenance event records who acted.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Who performed a state-changing operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum Actor {
    /// A human operator in the moderation console
    Operator(Uuid),
    /// An automated producer (connector), identified by its origin key
    Producer(String),
    /// The pipeline itself, or an enrichment processor
    Machine(String),
}

impl Actor {
    /// The pipeline's own machine identity.
    pub fn pipeline() -> Self {
        Actor::Machine("pipeline".to_string())
    }

    pub fn actor_type(&self) -> &'static str {
        match self {
            Actor::Operator(_) => "operator",
            Actor::Producer(_) => "producer",
            Actor::Machine(_) => "machine",
        }
    }

    pub fn actor_id(&self) -> String {
        match self {
            Actor::Operator(id) => id.to_string(),
            Actor::Producer(origin) => origin.clone(),
            Actor::Machine(name) => name.clone(),
        }
    }

    pub fn is_operator(&self) -> bool {
        matches!(self, Actor::Operator(_))
    }
}
