//! Candidate and posting lifecycle engine.
//!
//! All state changes go through fixed transition tables and run inside
//! a single transaction with their provenance events. Operators can
//! override candidate transitions with a mandatory reason; merges are
//! executed here so discovery sets and posting ownership stay
//! consistent under concurrency.

use sqlx::sqlite::SqliteConnection;
use tracing::info;
use uuid::Uuid;

use crate::dedupe;
use crate::error::{IngestError, Result};
use crate::store::Store;
use crate::types::{
    Actor, Candidate, CandidateState, Posting, PostingStatus, ProvenanceEvent,
};

/// The normal candidate transition table.
///
/// `merged` is reachable only through merge execution and is absent
/// here on purpose.
pub fn candidate_transition_allowed(from: CandidateState, to: CandidateState) -> bool {
    use CandidateState::*;
    matches!(
        (from, to),
        (Discovered, Processed)
            | (Processed, Publishable)
            | (Processed, NeedsReview)
            | (Publishable, Published)
            | (Publishable, NeedsReview)
            | (Publishable, Rejected)
            | (Publishable, Archived)
            | (Publishable, Closed)
            | (NeedsReview, Publishable)
            | (NeedsReview, Rejected)
            | (NeedsReview, Archived)
            | (NeedsReview, Closed)
            | (Published, Archived)
            | (Published, Closed)
    )
}

/// The posting transition table. `closed` is operator-only.
pub fn posting_transition_allowed(
    from: PostingStatus,
    to: PostingStatus,
    is_operator: bool,
) -> bool {
    use PostingStatus::*;
    match (from, to) {
        (Active, Stale) | (Stale, Active) => true,
        (Active, Archived) | (Stale, Archived) => true,
        (Active, Closed) | (Stale, Closed) | (Archived, Closed) => is_operator,
        _ => false,
    }
}

/// Candidate state that mirrors a destructive posting transition.
pub fn paired_candidate_state(status: PostingStatus) -> Option<CandidateState> {
    match status {
        PostingStatus::Archived => Some(CandidateState::Archived),
        PostingStatus::Closed => Some(CandidateState::Closed),
        PostingStatus::Active | PostingStatus::Stale => None,
    }
}

/// Transactional lifecycle operations over candidates and postings.
#[derive(Clone)]
pub struct Lifecycle {
    store: Store,
}

impl Lifecycle {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Move a candidate along the normal transition table.
    ///
    /// Destructive targets (rejected, archived, closed) require a
    /// reason. `publishable -> published` materializes the posting from
    /// the candidate's snapshot in the same transaction.
    pub async fn patch_candidate(
        &self,
        actor: &Actor,
        candidate_id: Uuid,
        to: CandidateState,
        reason: Option<&str>,
    ) -> Result<Candidate> {
        let mut tx = self.store.begin().await?;

        let candidate = Candidate::find_in_tx(&mut tx, candidate_id).await?;
        if !candidate_transition_allowed(candidate.state, to) {
            return Err(IngestError::conflict(format!(
                "candidate {candidate_id} cannot move {} -> {to}",
                candidate.state
            )));
        }
        if to.is_destructive() && reason.map(str::trim).unwrap_or("").is_empty() {
            return Err(IngestError::validation(format!(
                "a reason is required to move a candidate to {to}"
            )));
        }

        if candidate.state == CandidateState::Publishable && to == CandidateState::Published {
            match candidate.posting_id {
                // A posting adopted through a merge stays the canonical
                // one; publishing reactivates it rather than minting a
                // second posting for the same candidate.
                Some(posting_id) => {
                    let posting = Posting::find_in_tx(&mut tx, posting_id).await?;
                    if posting.status == PostingStatus::Stale {
                        Posting::update_status(&mut tx, posting_id, PostingStatus::Active).await?;
                    }
                    Posting::mark_seen(&mut tx, posting_id).await?;
                    apply_candidate_state(
                        &mut tx,
                        actor,
                        &candidate,
                        to,
                        reason,
                        "candidate_state_changed",
                    )
                    .await?;
                }
                None => {
                    publish_candidate_in_tx(&mut tx, actor, &candidate).await?;
                }
            }
        } else {
            apply_candidate_state(&mut tx, actor, &candidate, to, reason, "candidate_state_changed")
                .await?;
        }

        let updated = Candidate::find_in_tx(&mut tx, candidate_id).await?;
        tx.commit().await?;

        info!(candidate_id = %candidate_id, from = %candidate.state, to = %to, "candidate patched");
        Ok(updated)
    }

    /// Operator override outside the transition table.
    ///
    /// A reason is always required and the event is recorded as
    /// `state_overridden`. `merged` can never be forced.
    pub async fn override_candidate(
        &self,
        actor: &Actor,
        candidate_id: Uuid,
        to: CandidateState,
        reason: &str,
    ) -> Result<Candidate> {
        if !actor.is_operator() {
            return Err(IngestError::validation(
                "only operators may override candidate state".to_string(),
            ));
        }
        if reason.trim().is_empty() {
            return Err(IngestError::validation(
                "an override requires a reason".to_string(),
            ));
        }
        if to == CandidateState::Merged {
            return Err(IngestError::validation(
                "merged is only reachable through merge execution".to_string(),
            ));
        }

        let mut tx = self.store.begin().await?;

        let candidate = Candidate::find_in_tx(&mut tx, candidate_id).await?;
        if candidate.state == CandidateState::Merged {
            return Err(IngestError::conflict(format!(
                "candidate {candidate_id} was merged away and cannot be revived"
            )));
        }

        if candidate.state == CandidateState::Publishable
            && to == CandidateState::Published
            && candidate.posting_id.is_none()
        {
            publish_candidate_in_tx(&mut tx, actor, &candidate).await?;
        } else {
            apply_candidate_state(&mut tx, actor, &candidate, to, Some(reason), "state_overridden")
                .await?;
        }

        let updated = Candidate::find_in_tx(&mut tx, candidate_id).await?;
        tx.commit().await?;

        info!(candidate_id = %candidate_id, from = %candidate.state, to = %to, "candidate state overridden");
        Ok(updated)
    }

    /// Merge `secondary` into `primary`.
    ///
    /// The secondary's discoveries are unioned into the primary, posting
    /// ownership is adopted if only the secondary holds one, and the
    /// secondary is marked merged. Merging two candidates that own
    /// distinct postings is a structural conflict.
    pub async fn merge_candidates(
        &self,
        actor: &Actor,
        primary_id: Uuid,
        secondary_id: Uuid,
        reason: &str,
    ) -> Result<Candidate> {
        let mut tx = self.store.begin().await?;
        let primary = merge_in_tx(&mut tx, actor, primary_id, secondary_id, reason).await?;
        tx.commit().await?;
        Ok(primary)
    }

    /// Move a posting along its transition table.
    ///
    /// Archiving or closing a posting cascades the paired destructive
    /// state onto its owning candidate in the same transaction.
    pub async fn patch_posting(
        &self,
        actor: &Actor,
        posting_id: Uuid,
        to: PostingStatus,
        reason: Option<&str>,
    ) -> Result<Posting> {
        let mut tx = self.store.begin().await?;

        let posting = Posting::find_in_tx(&mut tx, posting_id).await?;
        if !posting_transition_allowed(posting.status, to, actor.is_operator()) {
            return Err(IngestError::conflict(format!(
                "posting {posting_id} cannot move {} -> {to} as {}",
                posting.status,
                actor.actor_type()
            )));
        }

        Posting::update_status(&mut tx, posting_id, to).await?;
        ProvenanceEvent::record(
            &mut tx,
            "posting",
            posting_id,
            "posting_status_changed",
            actor,
            serde_json::json!({
                "from": posting.status,
                "to": to,
                "reason": reason,
            }),
        )
        .await?;

        if let Some(paired) = paired_candidate_state(to) {
            let owner = Candidate::find_in_tx(&mut tx, posting.candidate_id).await?;
            if owner.state != paired && owner.state != CandidateState::Merged {
                apply_candidate_state(
                    &mut tx,
                    actor,
                    &owner,
                    paired,
                    reason,
                    "candidate_state_changed",
                )
                .await?;
            }
        }

        let updated = Posting::find_in_tx(&mut tx, posting_id).await?;
        tx.commit().await?;

        info!(posting_id = %posting_id, from = %posting.status, to = %to, "posting patched");
        Ok(updated)
    }
}

/// Merge execution, usable inside a caller's transaction.
pub(crate) async fn merge_in_tx(
    conn: &mut SqliteConnection,
    actor: &Actor,
    primary_id: Uuid,
    secondary_id: Uuid,
    reason: &str,
) -> Result<Candidate> {
    if primary_id == secondary_id {
        return Err(IngestError::validation(
            "a candidate cannot be merged into itself".to_string(),
        ));
    }

    let primary = Candidate::find_in_tx(conn, primary_id).await?;
    let secondary = Candidate::find_in_tx(conn, secondary_id).await?;

    if primary.state == CandidateState::Merged {
        return Err(IngestError::conflict(format!(
            "merge target {primary_id} was itself merged away"
        )));
    }
    if secondary.state.is_terminal() {
        return Err(IngestError::conflict(format!(
            "candidate {secondary_id} is {} and cannot be merged",
            secondary.state
        )));
    }
    if let (Some(a), Some(b)) = (primary.posting_id, secondary.posting_id) {
        if a != b {
            return Err(IngestError::conflict(format!(
                "candidates {primary_id} and {secondary_id} own distinct postings"
            )));
        }
    }

    // Union the discovery sets; links only ever grow.
    sqlx::query(
        r#"
        INSERT OR IGNORE INTO candidate_discoveries (candidate_id, discovery_id)
        SELECT $1, discovery_id FROM candidate_discoveries WHERE candidate_id = $2
        "#,
    )
    .bind(primary_id)
    .bind(secondary_id)
    .execute(&mut *conn)
    .await?;

    // Posting adoption: the surviving candidate takes over a posting
    // only the merged-away one held.
    if primary.posting_id.is_none() {
        if let Some(posting_id) = secondary.posting_id {
            Posting::set_owner(conn, posting_id, primary_id).await?;
            Candidate::set_posting(conn, primary_id, Some(posting_id)).await?;
        }
    }
    Candidate::set_posting(conn, secondary_id, None).await?;
    Candidate::update_state(conn, secondary_id, CandidateState::Merged, None).await?;

    ProvenanceEvent::record(
        conn,
        "candidate",
        primary_id,
        "merge_applied",
        actor,
        serde_json::json!({ "merged_candidate_id": secondary_id, "reason": reason }),
    )
    .await?;
    ProvenanceEvent::record(
        conn,
        "candidate",
        secondary_id,
        "merged_away",
        actor,
        serde_json::json!({ "surviving_candidate_id": primary_id, "reason": reason }),
    )
    .await?;

    info!(primary = %primary_id, secondary = %secondary_id, "candidates merged");
    Candidate::find_in_tx(conn, primary_id).await
}

/// Publish a candidate: create the posting from its snapshot and mark
/// it published, all in the caller's transaction.
pub(crate) async fn publish_candidate_in_tx(
    conn: &mut SqliteConnection,
    actor: &Actor,
    candidate: &Candidate,
) -> Result<Posting> {
    let fields = candidate
        .snapshot
        .as_ref()
        .map(|json| json.0.clone())
        .ok_or_else(|| {
            IngestError::validation(format!(
                "candidate {} has no snapshot to publish",
                candidate.id
            ))
        })?;

    let comparison = match &fields.description {
        Some(description) => format!("{} {} {}", fields.title, fields.organization, description),
        None => format!("{} {}", fields.title, fields.organization),
    };
    let content_hash = dedupe::content_hash(&comparison);
    let normalized_url = fields.url.as_deref().map(dedupe::normalize_url);

    let posting = Posting::insert_from_fields(
        conn,
        candidate.id,
        &fields,
        Some(&content_hash),
        normalized_url.as_deref(),
    )
    .await?;

    Candidate::set_posting(conn, candidate.id, Some(posting.id)).await?;
    Candidate::update_state(conn, candidate.id, CandidateState::Published, None).await?;

    ProvenanceEvent::record(
        conn,
        "posting",
        posting.id,
        "posting_created",
        actor,
        serde_json::json!({ "candidate_id": candidate.id }),
    )
    .await?;
    ProvenanceEvent::record(
        conn,
        "candidate",
        candidate.id,
        "candidate_state_changed",
        actor,
        serde_json::json!({
            "from": candidate.state,
            "to": CandidateState::Published,
            "posting_id": posting.id,
        }),
    )
    .await?;

    Ok(posting)
}

async fn apply_candidate_state(
    conn: &mut SqliteConnection,
    actor: &Actor,
    candidate: &Candidate,
    to: CandidateState,
    reason: Option<&str>,
    event_type: &str,
) -> Result<()> {
    Candidate::update_state(conn, candidate.id, to, candidate.moderation_route.as_deref()).await?;
    ProvenanceEvent::record(
        conn,
        "candidate",
        candidate.id,
        event_type,
        actor,
        serde_json::json!({
            "from": candidate.state,
            "to": to,
            "reason": reason,
        }),
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merged_is_unreachable_through_the_normal_table() {
        for from in CandidateState::ALL {
            assert!(!candidate_transition_allowed(from, CandidateState::Merged));
        }
    }

    #[test]
    fn terminal_candidate_states_have_no_exits() {
        for from in [
            CandidateState::Rejected,
            CandidateState::Archived,
            CandidateState::Closed,
            CandidateState::Merged,
        ] {
            for to in CandidateState::ALL {
                assert!(!candidate_transition_allowed(from, to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn review_can_return_to_publishable() {
        assert!(candidate_transition_allowed(
            CandidateState::NeedsReview,
            CandidateState::Publishable
        ));
        assert!(candidate_transition_allowed(
            CandidateState::Publishable,
            CandidateState::NeedsReview
        ));
    }

    #[test]
    fn posting_staleness_is_reversible() {
        assert!(posting_transition_allowed(
            PostingStatus::Active,
            PostingStatus::Stale,
            false
        ));
        assert!(posting_transition_allowed(
            PostingStatus::Stale,
            PostingStatus::Active,
            false
        ));
    }

    #[test]
    fn closing_a_posting_is_operator_only() {
        assert!(!posting_transition_allowed(
            PostingStatus::Active,
            PostingStatus::Closed,
            false
        ));
        assert!(posting_transition_allowed(
            PostingStatus::Active,
            PostingStatus::Closed,
            true
        ));
        assert!(posting_transition_allowed(
            PostingStatus::Archived,
            PostingStatus::Closed,
            true
        ));
    }

    #[test]
    fn destructive_posting_statuses_pair_with_candidate_states() {
        assert_eq!(
            paired_candidate_state(PostingStatus::Archived),
            Some(CandidateState::Archived)
        );
        assert_eq!(
            paired_candidate_state(PostingStatus::Closed),
            Some(CandidateState::Closed)
        );
        assert_eq!(paired_candidate_state(PostingStatus::Active), None);
    }
}
