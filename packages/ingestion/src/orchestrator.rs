//! Extraction projection orchestrator.
//!
//! Turns a finished extraction into catalogue effects: candidate
//! projection, dedupe scoring, policy resolution, merge routing and
//! lifecycle application all happen inside one transaction, keyed to
//! the job's lease. If anything fails, the job stays claimed and the
//! catalogue is untouched.

use chrono::{Duration, Utc};
use sqlx::sqlite::SqliteConnection;
use sqlx::types::Json;
use tracing::info;
use uuid::Uuid;

use crate::dedupe::{self, CandidateSignals, CatalogueMatch};
use crate::error::{IngestError, Result};
use crate::lifecycle;
use crate::router::{self, MergeAction, MergeDecision};
use crate::store::Store;
use crate::types::job::JOB_COLUMNS;
use crate::types::{
    Actor, Candidate, CandidateState, Discovery, EffectivePolicy, Job, JobInput, Posting,
    PostingFields, PostingStatus, ProvenanceEvent, TrustLevel,
};

/// How many recent live postings are fetched for similarity comparison.
const COMPARISON_WINDOW: i64 = 50;

/// Payload a worker reports for a finished extraction.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ExtractResult {
    pub fields: PostingFields,
    #[serde(default)]
    pub entities: Vec<String>,
    #[serde(default)]
    pub contact_domain: Option<String>,
    /// Extraction module that produced the fields, for policy scoping.
    #[serde(default)]
    pub module_id: Option<String>,
}

/// What the projection did with the candidate.
#[derive(Debug, Clone)]
pub struct ProjectionOutcome {
    pub candidate: Candidate,
    pub decision: Option<MergeDecision>,
    /// Set when the candidate was merged away into an existing one.
    pub merged_into: Option<Uuid>,
}

/// Coordinates the extract-to-catalogue projection.
#[derive(Clone)]
pub struct Orchestrator {
    store: Store,
    freshness_window_hours: i64,
}

impl Orchestrator {
    pub fn new(store: Store, freshness_window_hours: i64) -> Self {
        Self {
            store,
            freshness_window_hours,
        }
    }

    /// Complete an extraction job and project its result.
    ///
    /// The job is resolved and the projection applied atomically: only
    /// the current leaseholder can complete it, and a failure leaves
    /// both the job and the catalogue untouched.
    pub async fn complete_extraction(
        &self,
        job_id: Uuid,
        worker_id: &str,
        result: ExtractResult,
    ) -> Result<ProjectionOutcome> {
        let actor = Actor::pipeline();
        let mut tx = self.store.begin().await?;

        let job = resolve_extract_job(&mut tx, job_id, worker_id, &result).await?;
        let JobInput::Extract { discovery_id } = job.typed_input()? else {
            return Err(IngestError::validation(format!(
                "job {job_id} is not an extraction job"
            )));
        };

        let discovery = Discovery::find_by_id(&mut tx, discovery_id).await?;

        // Find-or-create keeps re-extraction idempotent: a discovery is
        // only ever projected into one candidate.
        let candidate = match Candidate::find_by_discovery(&mut tx, discovery_id).await? {
            Some(existing) => existing,
            None => {
                let created = Candidate::insert(&mut tx, &discovery.origin).await?;
                Candidate::link_discovery(&mut tx, created.id, discovery_id).await?;
                created
            }
        };
        if candidate.state.is_terminal() {
            return Err(IngestError::conflict(format!(
                "candidate {} is {} and cannot be re-projected",
                candidate.id, candidate.state
            )));
        }

        let signals = build_signals(&discovery, &result);
        let matches = fetch_catalogue_matches(&mut tx, candidate.id, &signals).await?;
        let best = dedupe::score_best(&signals, &matches);
        let score = best
            .as_ref()
            .map(|(_, s)| s.clone())
            .unwrap_or_else(dedupe::DedupeScore::no_match);

        Candidate::update_projection(
            &mut tx,
            candidate.id,
            Some(score.confidence),
            &score.risk_flags,
            &result.fields,
        )
        .await?;
        if candidate.state == CandidateState::Discovered {
            Candidate::update_state(&mut tx, candidate.id, CandidateState::Processed, None).await?;
        }

        let trust_level = discovery
            .trust_level_hint()
            .and_then(|hint| hint.parse().ok())
            .unwrap_or(TrustLevel::Standard);
        let policy = crate::policy::resolve_with(
            &mut tx,
            &discovery.origin,
            result.module_id.as_deref(),
            trust_level,
        )
        .await?;

        let outcome = match best {
            Some((catalogue, _)) if score.confidence > 0.0 => {
                let decision = router::route(&score, &policy);
                self.apply_decision(&mut tx, &actor, candidate.id, &catalogue, decision, &policy)
                    .await?
            }
            _ => {
                let decision = distinct_content_decision(&policy);
                apply_distinct_content(&mut tx, &actor, candidate.id, &decision).await?;
                ProjectionApplied {
                    decision,
                    merged_into: None,
                }
            }
        };

        ProvenanceEvent::record(
            &mut tx,
            "candidate",
            candidate.id,
            "extraction_projected",
            &actor,
            serde_json::json!({
                "job_id": job_id,
                "discovery_id": discovery_id,
                "confidence": score.confidence,
                "risk_flags": score.risk_flags,
                "action": outcome.decision.action,
                "reason": &outcome.decision.reason,
            }),
        )
        .await?;

        let candidate = Candidate::find_in_tx(&mut tx, candidate.id).await?;
        tx.commit().await?;

        info!(
            candidate_id = %candidate.id,
            action = %outcome.decision.action,
            confidence = score.confidence,
            "extraction projected"
        );

        Ok(ProjectionOutcome {
            candidate,
            decision: Some(outcome.decision),
            merged_into: outcome.merged_into,
        })
    }

    /// Freshness check handler: a live posting unseen past the window
    /// goes stale.
    pub async fn check_freshness(&self, posting_id: Uuid) -> Result<serde_json::Value> {
        let mut tx = self.store.begin().await?;

        let posting = Posting::find_in_tx(&mut tx, posting_id).await?;
        let cutoff = Utc::now() - Duration::hours(self.freshness_window_hours);
        let went_stale = posting.status == PostingStatus::Active && posting.last_seen_at < cutoff;

        if went_stale {
            Posting::update_status(&mut tx, posting_id, PostingStatus::Stale).await?;
            ProvenanceEvent::record(
                &mut tx,
                "posting",
                posting_id,
                "posting_status_changed",
                &Actor::pipeline(),
                serde_json::json!({
                    "from": PostingStatus::Active,
                    "to": PostingStatus::Stale,
                    "reason": "freshness_window_elapsed",
                }),
            )
            .await?;
        }

        tx.commit().await?;
        Ok(serde_json::json!({
            "posting_id": posting_id,
            "went_stale": went_stale,
        }))
    }

    async fn apply_decision(
        &self,
        conn: &mut SqliteConnection,
        actor: &Actor,
        candidate_id: Uuid,
        catalogue: &CatalogueMatch,
        decision: MergeDecision,
        policy: &EffectivePolicy,
    ) -> Result<ProjectionApplied> {
        match decision.action {
            MergeAction::AutoMerge => {
                match lifecycle::merge_in_tx(
                    conn,
                    actor,
                    catalogue.candidate_id,
                    candidate_id,
                    &decision.reason,
                )
                .await
                {
                    Ok(_) => {
                        // The merged posting's content was just seen again.
                        Posting::mark_seen(conn, catalogue.posting_id).await?;
                        Ok(ProjectionApplied {
                            decision,
                            merged_into: Some(catalogue.candidate_id),
                        })
                    }
                    // Structural conflict: fall back to review rather
                    // than losing the candidate.
                    Err(err) if err.is_conflict() => {
                        let fallback = router::route_blocked(policy);
                        Candidate::update_state(
                            conn,
                            candidate_id,
                            fallback.target_candidate_state,
                            fallback.moderation_route.as_deref(),
                        )
                        .await?;
                        Ok(ProjectionApplied {
                            decision: fallback,
                            merged_into: None,
                        })
                    }
                    Err(err) => Err(err),
                }
            }
            MergeAction::NeedsReview => {
                Candidate::update_state(
                    conn,
                    candidate_id,
                    CandidateState::NeedsReview,
                    decision.moderation_route.as_deref(),
                )
                .await?;
                Ok(ProjectionApplied {
                    decision,
                    merged_into: None,
                })
            }
            // The merge proposal was rejected: proceed as distinct content.
            MergeAction::Rejected => {
                let distinct = distinct_content_decision(policy);
                apply_distinct_content(conn, actor, candidate_id, &distinct).await?;
                Ok(ProjectionApplied {
                    decision: MergeDecision {
                        reason: decision.reason,
                        ..distinct
                    },
                    merged_into: None,
                })
            }
        }
    }
}

struct ProjectionApplied {
    decision: MergeDecision,
    merged_into: Option<Uuid>,
}

/// Lease-checked completion of the extract job itself.
async fn resolve_extract_job(
    conn: &mut SqliteConnection,
    job_id: Uuid,
    worker_id: &str,
    result: &ExtractResult,
) -> Result<Job> {
    sqlx::query_as::<_, Job>(&format!(
        r#"
        UPDATE jobs
        SET status = 'done', result = $1, worker_id = NULL,
            lease_expires_at = NULL, updated_at = $2
        WHERE id = $3 AND status = 'claimed' AND worker_id = $4
        RETURNING {JOB_COLUMNS}
        "#,
    ))
    .bind(Json(serde_json::to_value(result)?))
    .bind(Utc::now())
    .bind(job_id)
    .bind(worker_id)
    .fetch_optional(conn)
    .await?
    .ok_or_else(|| {
        IngestError::conflict(format!(
            "job {job_id} is not claimed by worker {worker_id}; lease lost or already resolved"
        ))
    })
}

fn build_signals(discovery: &Discovery, result: &ExtractResult) -> CandidateSignals {
    let fields = &result.fields;
    let text = match &fields.description {
        Some(description) => format!("{} {} {}", fields.title, fields.organization, description),
        None => format!("{} {}", fields.title, fields.organization),
    };
    let normalized_url = fields
        .url
        .as_deref()
        .map(dedupe::normalize_url)
        .or_else(|| discovery.normalized_url.clone());

    CandidateSignals {
        content_hash: Some(dedupe::content_hash(&text)),
        normalized_url,
        text,
        entities: result.entities.clone(),
        contact_domain: result.contact_domain.clone(),
    }
}

/// Fetch comparison data: exact-signal probes plus a recency window,
/// excluding postings this candidate already owns.
async fn fetch_catalogue_matches(
    conn: &mut SqliteConnection,
    candidate_id: Uuid,
    signals: &CandidateSignals,
) -> Result<Vec<CatalogueMatch>> {
    let mut postings = Posting::find_exact_matches(
        conn,
        signals.content_hash.as_deref(),
        signals.normalized_url.as_deref(),
    )
    .await?;
    let recent = Posting::list_recent_live(conn, COMPARISON_WINDOW).await?;
    for posting in recent {
        if !postings.iter().any(|p| p.id == posting.id) {
            postings.push(posting);
        }
    }

    Ok(postings
        .into_iter()
        .filter(|p| p.candidate_id != candidate_id)
        .map(|p| CatalogueMatch {
            posting_id: p.id,
            candidate_id: p.candidate_id,
            content_hash: p.content_hash.clone(),
            normalized_url: p.normalized_url.clone(),
            text: p.comparison_text(),
            entities: vec![p.organization.clone()],
            contact_domain: None,
        })
        .collect())
}

/// Policy application for content with no duplicate in the catalogue.
fn distinct_content_decision(policy: &EffectivePolicy) -> MergeDecision {
    if policy.requires_moderation {
        MergeDecision {
            action: MergeAction::NeedsReview,
            target_candidate_state: CandidateState::NeedsReview,
            target_posting_status: None,
            reason: "moderation_required".to_string(),
            moderation_route: Some(policy.default_moderation_route.clone()),
        }
    } else if policy.auto_publish {
        MergeDecision {
            action: MergeAction::Rejected,
            target_candidate_state: CandidateState::Published,
            target_posting_status: Some(PostingStatus::Active),
            reason: "distinct_content".to_string(),
            moderation_route: None,
        }
    } else {
        MergeDecision {
            action: MergeAction::Rejected,
            target_candidate_state: CandidateState::Publishable,
            target_posting_status: None,
            reason: "distinct_content".to_string(),
            moderation_route: None,
        }
    }
}

async fn apply_distinct_content(
    conn: &mut SqliteConnection,
    actor: &Actor,
    candidate_id: Uuid,
    decision: &MergeDecision,
) -> Result<()> {
    match decision.target_candidate_state {
        CandidateState::Published => {
            let candidate = Candidate::find_in_tx(conn, candidate_id).await?;
            match candidate.posting_id {
                // Re-extraction of already-published content refreshes
                // the posting instead of minting a second one.
                Some(posting_id) => Posting::mark_seen(conn, posting_id).await?,
                None => {
                    Candidate::update_state(conn, candidate_id, CandidateState::Publishable, None)
                        .await?;
                    let candidate = Candidate::find_in_tx(conn, candidate_id).await?;
                    lifecycle::publish_candidate_in_tx(conn, actor, &candidate).await?;
                }
            }
        }
        state => {
            Candidate::update_state(
                conn,
                candidate_id,
                state,
                decision.moderation_route.as_deref(),
            )
            .await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distinct_content_publishes_only_with_auto_publish() {
        let trusted = EffectivePolicy::for_trust_level(TrustLevel::Trusted);
        assert_eq!(
            distinct_content_decision(&trusted).target_candidate_state,
            CandidateState::Published
        );

        let standard = EffectivePolicy::for_trust_level(TrustLevel::Standard);
        assert_eq!(
            distinct_content_decision(&standard).target_candidate_state,
            CandidateState::Publishable
        );
    }

    #[test]
    fn distinct_content_under_moderation_routes_to_review() {
        let untrusted = EffectivePolicy::for_trust_level(TrustLevel::Untrusted);
        let decision = distinct_content_decision(&untrusted);
        assert_eq!(decision.target_candidate_state, CandidateState::NeedsReview);
        assert_eq!(
            decision.moderation_route.as_deref(),
            Some(router::DEFAULT_MODERATION_ROUTE)
        );
    }
}
