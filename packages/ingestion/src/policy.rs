//! Trust policy resolver.
//!
//! Resolution order, first enabled hit wins:
//! `source:<key>` -> `module:<module_id>` -> `default:<trust_level>`,
//! falling back to built-in trust-level defaults. Writes are validated
//! before persisting and every mutation is audited.

use std::collections::HashMap;

use chrono::Utc;
use lazy_static::lazy_static;
use regex::Regex;
use sqlx::sqlite::SqliteConnection;
use sqlx::types::Json;
use tracing::info;

use crate::error::{IngestError, Result};
use crate::router::ALLOWED_MERGE_ACTIONS;
use crate::store::Store;
use crate::types::policy::{record_policy_event, POLICY_COLUMNS};
use crate::types::{Actor, EffectivePolicy, SourceTrustPolicy, TrustLevel};

lazy_static! {
    /// Format contract for moderation route labels.
    static ref ROUTE_LABEL_RE: Regex = Regex::new(r"^[a-z0-9_\-]+$").unwrap();
    /// Policy keys are namespaced: source:*, module:* or default:*.
    static ref POLICY_KEY_RE: Regex = Regex::new(r"^(source|module|default):[a-z0-9_.\-]+$").unwrap();
}

/// Override-map keys accepted by `upsert`.
const KNOWN_OVERRIDE_KEYS: [&str; 4] = [
    "merge_decision_actions",
    "merge_decision_reasons",
    "moderation_routes",
    "default_moderation_route",
];

/// Operator-supplied fields for a policy upsert.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PolicyUpsert {
    pub policy_key: String,
    pub trust_level: TrustLevel,
    pub auto_publish: Option<bool>,
    pub requires_moderation: Option<bool>,
    /// Raw override map; validated against the known keys, the merge
    /// action allow-list and the route label contract.
    #[serde(default)]
    pub overrides: serde_json::Value,
}

/// Resolves effective publish/moderation policy per source.
#[derive(Clone)]
pub struct TrustPolicyResolver {
    store: Store,
}

impl TrustPolicyResolver {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Resolve the effective policy for a decision.
    pub async fn resolve(
        &self,
        source_key: &str,
        module_id: Option<&str>,
        trust_level: TrustLevel,
    ) -> Result<EffectivePolicy> {
        let mut conn = self.store.pool().acquire().await?;
        resolve_with(&mut conn, source_key, module_id, trust_level).await
    }

    /// Validate and persist a policy row, auditing the write.
    pub async fn upsert(&self, actor: &Actor, input: PolicyUpsert) -> Result<SourceTrustPolicy> {
        let normalized = validate_upsert(&input)?;

        let existing = SourceTrustPolicy::find_by_key(self.store.pool(), &input.policy_key).await?;
        let enabled_before = existing.as_ref().map(|p| p.enabled);

        let mut tx = self.store.begin().await?;

        let defaults = EffectivePolicy::for_trust_level(input.trust_level);
        let auto_publish = input.auto_publish.unwrap_or(defaults.auto_publish);
        let requires_moderation = input
            .requires_moderation
            .unwrap_or(defaults.requires_moderation);

        let now = Utc::now();
        let policy = sqlx::query_as::<_, SourceTrustPolicy>(&format!(
            r#"
            INSERT INTO trust_policies
                (policy_key, trust_level, auto_publish, requires_moderation,
                 merge_decision_actions, merge_decision_reasons, moderation_routes,
                 default_moderation_route, enabled, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 1, $9, $9)
            ON CONFLICT (policy_key) DO UPDATE SET
                trust_level = EXCLUDED.trust_level,
                auto_publish = EXCLUDED.auto_publish,
                requires_moderation = EXCLUDED.requires_moderation,
                merge_decision_actions = EXCLUDED.merge_decision_actions,
                merge_decision_reasons = EXCLUDED.merge_decision_reasons,
                moderation_routes = EXCLUDED.moderation_routes,
                default_moderation_route = EXCLUDED.default_moderation_route,
                updated_at = EXCLUDED.updated_at
            RETURNING {POLICY_COLUMNS}
            "#,
        ))
        .bind(&input.policy_key)
        .bind(input.trust_level)
        .bind(auto_publish)
        .bind(requires_moderation)
        .bind(Json(normalized.actions))
        .bind(Json(normalized.reasons))
        .bind(Json(normalized.routes))
        .bind(&normalized.default_route)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        record_policy_event(
            &mut tx,
            &input.policy_key,
            "policy_upserted",
            actor,
            enabled_before,
            policy.enabled,
        )
        .await?;

        tx.commit().await?;

        info!(policy_key = %policy.policy_key, actor = %actor.actor_id(), "trust policy upserted");
        Ok(policy)
    }

    /// Toggle a policy on or off; the audit event carries before/after.
    pub async fn set_enabled(
        &self,
        actor: &Actor,
        policy_key: &str,
        enabled: bool,
    ) -> Result<SourceTrustPolicy> {
        let existing = SourceTrustPolicy::find_by_key(self.store.pool(), policy_key)
            .await?
            .ok_or_else(|| IngestError::not_found("trust_policy", policy_key))?;

        let mut tx = self.store.begin().await?;

        let policy = sqlx::query_as::<_, SourceTrustPolicy>(&format!(
            r#"
            UPDATE trust_policies SET enabled = $1, updated_at = $2
            WHERE policy_key = $3
            RETURNING {POLICY_COLUMNS}
            "#,
        ))
        .bind(enabled)
        .bind(Utc::now())
        .bind(policy_key)
        .fetch_one(&mut *tx)
        .await?;

        record_policy_event(
            &mut tx,
            policy_key,
            "policy_toggled",
            actor,
            Some(existing.enabled),
            enabled,
        )
        .await?;

        tx.commit().await?;
        Ok(policy)
    }

    pub async fn list(&self) -> Result<Vec<SourceTrustPolicy>> {
        SourceTrustPolicy::list(self.store.pool()).await
    }
}

/// In-transaction resolution, fetched fresh per decision.
pub(crate) async fn resolve_with(
    conn: &mut SqliteConnection,
    source_key: &str,
    module_id: Option<&str>,
    trust_level: TrustLevel,
) -> Result<EffectivePolicy> {
    let mut keys = vec![format!("source:{source_key}")];
    if let Some(module) = module_id {
        keys.push(format!("module:{module}"));
    }
    keys.push(format!("default:{trust_level}"));

    for key in keys {
        if let Some(row) = SourceTrustPolicy::find_enabled(conn, &key).await? {
            return Ok(row.to_effective());
        }
    }

    Ok(EffectivePolicy::for_trust_level(trust_level))
}

#[derive(Debug)]
struct NormalizedOverrides {
    actions: HashMap<String, String>,
    reasons: HashMap<String, String>,
    routes: HashMap<String, String>,
    default_route: Option<String>,
}

/// Reject bad input before any mutation; normalize absent optionals.
fn validate_upsert(input: &PolicyUpsert) -> Result<NormalizedOverrides> {
    if !POLICY_KEY_RE.is_match(&input.policy_key) {
        return Err(IngestError::validation(format!(
            "policy key must match source:*, module:* or default:*, got: {}",
            input.policy_key
        )));
    }

    let overrides = match &input.overrides {
        serde_json::Value::Null => serde_json::Map::new(),
        serde_json::Value::Object(map) => map.clone(),
        _ => {
            return Err(IngestError::validation(
                "overrides must be a JSON object".to_string(),
            ))
        }
    };

    for key in overrides.keys() {
        if !KNOWN_OVERRIDE_KEYS.contains(&key.as_str()) {
            return Err(IngestError::validation(format!(
                "unknown override key: {key}"
            )));
        }
    }

    let actions = string_map(&overrides, "merge_decision_actions")?;
    for (band, action) in &actions {
        if !ALLOWED_MERGE_ACTIONS.contains(&action.as_str()) {
            return Err(IngestError::validation(format!(
                "merge action for {band} must be one of {ALLOWED_MERGE_ACTIONS:?}, got: {action}"
            )));
        }
    }

    let reasons = string_map(&overrides, "merge_decision_reasons")?;

    let routes = string_map(&overrides, "moderation_routes")?;
    for (key, route) in &routes {
        if !ROUTE_LABEL_RE.is_match(route) {
            return Err(IngestError::validation(format!(
                "moderation route for {key} must match ^[a-z0-9_\\-]+$, got: {route}"
            )));
        }
    }

    let default_route = match overrides.get("default_moderation_route") {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(route)) => {
            if !ROUTE_LABEL_RE.is_match(route) {
                return Err(IngestError::validation(format!(
                    "default moderation route must match ^[a-z0-9_\\-]+$, got: {route}"
                )));
            }
            Some(route.clone())
        }
        Some(_) => {
            return Err(IngestError::validation(
                "default_moderation_route must be a string".to_string(),
            ))
        }
    };

    Ok(NormalizedOverrides {
        actions,
        reasons,
        routes,
        default_route,
    })
}

fn string_map(
    overrides: &serde_json::Map<String, serde_json::Value>,
    key: &str,
) -> Result<HashMap<String, String>> {
    let mut out = HashMap::new();
    let Some(value) = overrides.get(key) else {
        return Ok(out);
    };

    let map = value
        .as_object()
        .ok_or_else(|| IngestError::validation(format!("{key} must be a JSON object")))?;

    for (k, v) in map {
        let s = v
            .as_str()
            .ok_or_else(|| IngestError::validation(format!("{key}.{k} must be a string")))?;
        out.insert(k.clone(), s.to_string());
    }

    Ok(out)
}
