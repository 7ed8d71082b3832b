//! Merge decision router.
//!
//! Combines scorer output with the resolved trust policy. The decision
//! bands are fixed and auditable; only the action/reason/route strings
//! are re-targetable through policy override maps, so operators can
//! re-point moderation queues per source without code changes.
//!
//! Precision-first: under-merging is preferred to over-merging. A
//! rejected decision rejects the *merge proposal* - the candidate
//! proceeds as distinct content.

use serde::{Deserialize, Serialize};

use crate::dedupe::DedupeScore;
use crate::error::IngestError;
use crate::types::{CandidateState, EffectivePolicy, PostingStatus};

/// Confidence at or above this (with no conflict flag) may auto-merge.
pub const AUTO_MERGE_THRESHOLD: f64 = 0.90;
/// Confidence below this rejects the merge proposal.
pub const REJECT_FLOOR: f64 = 0.40;
/// Hard-coded fallback moderation route.
pub const DEFAULT_MODERATION_ROUTE: &str = "moderation_queue";

/// Decision band keys used in policy override maps.
pub const BAND_AUTO_MERGE: &str = "auto_merge";
pub const BAND_NEEDS_REVIEW: &str = "needs_review";
pub const BAND_REJECTED: &str = "rejected";
pub const BAND_AUTO_MERGE_BLOCKED: &str = "auto_merge_blocked";

/// Allow-list for policy-configured merge actions.
pub const ALLOWED_MERGE_ACTIONS: [&str; 3] = [BAND_AUTO_MERGE, BAND_NEEDS_REVIEW, BAND_REJECTED];

/// Final routing action for a scored candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeAction {
    AutoMerge,
    NeedsReview,
    Rejected,
}

impl std::fmt::Display for MergeAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MergeAction::AutoMerge => BAND_AUTO_MERGE,
            MergeAction::NeedsReview => BAND_NEEDS_REVIEW,
            MergeAction::Rejected => BAND_REJECTED,
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for MergeAction {
    type Err = IngestError;

    fn from_str(s: &str) -> crate::error::Result<Self> {
        match s {
            BAND_AUTO_MERGE => Ok(MergeAction::AutoMerge),
            BAND_NEEDS_REVIEW => Ok(MergeAction::NeedsReview),
            BAND_REJECTED => Ok(MergeAction::Rejected),
            _ => Err(IngestError::validation(format!(
                "invalid merge action: {s}"
            ))),
        }
    }
}

/// Router output consumed by the lifecycle engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeDecision {
    pub action: MergeAction,
    pub target_candidate_state: CandidateState,
    pub target_posting_status: Option<PostingStatus>,
    pub reason: String,
    pub moderation_route: Option<String>,
}

/// Route a scored candidate through the resolved policy.
pub fn route(score: &DedupeScore, policy: &EffectivePolicy) -> MergeDecision {
    // Review-routing overrides auto-publish: an explicit conflict
    // signal is never bypassed.
    if score.has_conflict_flag() {
        return decide(BAND_NEEDS_REVIEW, "conflicting_signals", policy);
    }

    if score.confidence >= AUTO_MERGE_THRESHOLD {
        if policy.auto_publish {
            return decide(BAND_AUTO_MERGE, "strong_duplicate", policy);
        }
        return decide(BAND_NEEDS_REVIEW, "auto_publish_disabled", policy);
    }

    if score.confidence < REJECT_FLOOR {
        return decide(BAND_REJECTED, "low_confidence", policy);
    }

    decide(BAND_NEEDS_REVIEW, "uncertain_match", policy)
}

/// Fallback when auto-merge was attempted but blocked by a structural
/// conflict. Falls back to the policy's configured needs_review action,
/// never silently to rejected.
pub fn route_blocked(policy: &EffectivePolicy) -> MergeDecision {
    let mut decision = decide(BAND_NEEDS_REVIEW, BAND_AUTO_MERGE_BLOCKED, policy);
    // A blocked auto-merge must end up in front of a human even when a
    // policy re-targets needs_review to auto_merge.
    if decision.action == MergeAction::AutoMerge {
        decision = build(MergeAction::NeedsReview, BAND_AUTO_MERGE_BLOCKED, policy);
    }
    decision
}

fn decide(band: &str, reason_key: &str, policy: &EffectivePolicy) -> MergeDecision {
    let default_action: MergeAction = band.parse().unwrap_or(MergeAction::NeedsReview);
    let action = policy
        .merge_decision_actions
        .get(band)
        .and_then(|s| s.parse().ok())
        .unwrap_or(default_action);

    build(action, reason_key, policy)
}

fn build(action: MergeAction, reason_key: &str, policy: &EffectivePolicy) -> MergeDecision {
    let reason = policy
        .merge_decision_reasons
        .get(reason_key)
        .cloned()
        .unwrap_or_else(|| reason_key.to_string());

    let (target_candidate_state, target_posting_status, moderation_route) = match action {
        MergeAction::AutoMerge => (CandidateState::Merged, Some(PostingStatus::Active), None),
        MergeAction::NeedsReview => {
            let route = policy
                .moderation_routes
                .get(reason_key)
                .cloned()
                .unwrap_or_else(|| policy.default_moderation_route.clone());
            (CandidateState::NeedsReview, None, Some(route))
        }
        // Merge proposal rejected: the candidate proceeds as distinct content.
        MergeAction::Rejected => (CandidateState::Publishable, None, None),
    };

    MergeDecision {
        action,
        target_candidate_state,
        target_posting_status,
        reason,
        moderation_route,
    }
}
