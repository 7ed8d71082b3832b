//! Source trust policy records and the resolved effective policy.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteConnection;
use sqlx::types::Json;
use sqlx::{FromRow, SqlitePool};

use crate::error::{IngestError, Result};
use crate::types::Actor;

/// How much a source is trusted by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    Trusted,
    #[default]
    Standard,
    Untrusted,
}

impl std::fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TrustLevel::Trusted => "trusted",
            TrustLevel::Standard => "standard",
            TrustLevel::Untrusted => "untrusted",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TrustLevel {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "trusted" => Ok(TrustLevel::Trusted),
            "standard" => Ok(TrustLevel::Standard),
            "untrusted" => Ok(TrustLevel::Untrusted),
            _ => Err(IngestError::validation(format!("invalid trust level: {s}"))),
        }
    }
}

/// Stored policy row, keyed `source:*`, `module:*` or `default:*`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SourceTrustPolicy {
    pub policy_key: String,
    pub trust_level: TrustLevel,
    pub auto_publish: bool,
    pub requires_moderation: bool,
    pub merge_decision_actions: Json<HashMap<String, String>>,
    pub merge_decision_reasons: Json<HashMap<String, String>>,
    pub moderation_routes: Json<HashMap<String, String>>,
    pub default_moderation_route: Option<String>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub(crate) const POLICY_COLUMNS: &str = "policy_key, trust_level, auto_publish, requires_moderation, \
     merge_decision_actions, merge_decision_reasons, moderation_routes, \
     default_moderation_route, enabled, created_at, updated_at";

impl SourceTrustPolicy {
    pub(crate) async fn find_enabled(
        conn: &mut SqliteConnection,
        policy_key: &str,
    ) -> Result<Option<Self>> {
        let policy = sqlx::query_as::<_, Self>(&format!(
            "SELECT {POLICY_COLUMNS} FROM trust_policies WHERE policy_key = $1 AND enabled = 1"
        ))
        .bind(policy_key)
        .fetch_optional(conn)
        .await?;

        Ok(policy)
    }

    pub async fn find_by_key(pool: &SqlitePool, policy_key: &str) -> Result<Option<Self>> {
        let policy = sqlx::query_as::<_, Self>(&format!(
            "SELECT {POLICY_COLUMNS} FROM trust_policies WHERE policy_key = $1"
        ))
        .bind(policy_key)
        .fetch_optional(pool)
        .await?;

        Ok(policy)
    }

    pub async fn list(pool: &SqlitePool) -> Result<Vec<Self>> {
        let policies = sqlx::query_as::<_, Self>(&format!(
            "SELECT {POLICY_COLUMNS} FROM trust_policies ORDER BY policy_key"
        ))
        .fetch_all(pool)
        .await?;

        Ok(policies)
    }

    /// Resolve this row into an effective policy, filling absent
    /// optionals from the trust-level defaults.
    pub fn to_effective(&self) -> EffectivePolicy {
        let defaults = EffectivePolicy::for_trust_level(self.trust_level);
        EffectivePolicy {
            auto_publish: self.auto_publish,
            requires_moderation: self.requires_moderation,
            merge_decision_actions: self.merge_decision_actions.0.clone(),
            merge_decision_reasons: self.merge_decision_reasons.0.clone(),
            moderation_routes: self.moderation_routes.0.clone(),
            default_moderation_route: self
                .default_moderation_route
                .clone()
                .unwrap_or(defaults.default_moderation_route),
        }
    }
}

/// The resolved publish/moderation policy for one decision.
///
/// Fetched fresh per decision; never cached across a policy edit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EffectivePolicy {
    pub auto_publish: bool,
    pub requires_moderation: bool,
    pub merge_decision_actions: HashMap<String, String>,
    pub merge_decision_reasons: HashMap<String, String>,
    pub moderation_routes: HashMap<String, String>,
    pub default_moderation_route: String,
}

impl EffectivePolicy {
    /// Built-in defaults when no policy row matches.
    pub fn for_trust_level(level: TrustLevel) -> Self {
        let (auto_publish, requires_moderation) = match level {
            TrustLevel::Trusted => (true, false),
            TrustLevel::Standard => (false, false),
            TrustLevel::Untrusted => (false, true),
        };

        Self {
            auto_publish,
            requires_moderation,
            merge_decision_actions: HashMap::new(),
            merge_decision_reasons: HashMap::new(),
            moderation_routes: HashMap::new(),
            default_moderation_route: crate::router::DEFAULT_MODERATION_ROUTE.to_string(),
        }
    }
}

/// Enable/disable toggles and upserts are audited with this payload.
pub(crate) async fn record_policy_event(
    conn: &mut SqliteConnection,
    policy_key: &str,
    operation: &str,
    actor: &Actor,
    enabled_before: Option<bool>,
    enabled_after: bool,
) -> Result<()> {
    // Policy keys are strings, not uuids; the event entity id is a
    // stable UUIDv5-style hash of the key so the audit read path can
    // address them uniformly.
    let entity_id = crate::types::policy::policy_entity_id(policy_key);
    crate::types::ProvenanceEvent::record(
        conn,
        "trust_policy",
        entity_id,
        operation,
        actor,
        serde_json::json!({
            "policy_key": policy_key,
            "enabled_before": enabled_before,
            "enabled_after": enabled_after,
        }),
    )
    .await
}

/// Deterministic event entity id for a policy key.
pub fn policy_entity_id(policy_key: &str) -> uuid::Uuid {
    uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_OID, policy_key.as_bytes())
}
