//! Lifecycle guards, operator overrides, merges and posting cascade.

mod common;

use common::{ingest_and_extract, listing};
use ingestion::lifecycle::{candidate_transition_allowed, posting_transition_allowed};
use ingestion::{
    Actor, Candidate, CandidateState, IngestError, Pipeline, PostingStatus,
};
use proptest::prelude::*;
use uuid::Uuid;

fn operator() -> Actor {
    Actor::Operator(Uuid::now_v7())
}

/// Project sample listing `n` into a `publishable` candidate (standard
/// trust, distinct content).
async fn publishable_candidate(pipeline: &Pipeline, n: usize) -> Candidate {
    let (new, result) = listing(n, "standard");
    let outcome = ingest_and_extract(pipeline, &new, result).await;
    assert_eq!(outcome.candidate.state, CandidateState::Publishable);
    outcome.candidate
}

/// Project sample listing `n` into a `published` candidate with its
/// posting (trusted source).
async fn published_candidate(pipeline: &Pipeline, n: usize) -> Candidate {
    let (new, result) = listing(n, "trusted");
    let outcome = ingest_and_extract(pipeline, &new, result).await;
    assert_eq!(outcome.candidate.state, CandidateState::Published);
    assert!(outcome.candidate.posting_id.is_some());
    outcome.candidate
}

#[tokio::test]
async fn disallowed_transition_is_a_conflict() {
    let pipeline = Pipeline::in_memory().await.unwrap();
    let candidate = publishable_candidate(&pipeline, 0).await;

    let err = pipeline
        .patch_candidate(&operator(), candidate.id, CandidateState::Processed, None)
        .await
        .unwrap_err();
    assert!(err.is_conflict());
}

#[tokio::test]
async fn destructive_patch_requires_a_reason() {
    let pipeline = Pipeline::in_memory().await.unwrap();
    let candidate = publishable_candidate(&pipeline, 0).await;

    let err = pipeline
        .patch_candidate(&operator(), candidate.id, CandidateState::Rejected, None)
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::Validation { .. }));

    let rejected = pipeline
        .patch_candidate(
            &operator(),
            candidate.id,
            CandidateState::Rejected,
            Some("spam listing"),
        )
        .await
        .unwrap();
    assert_eq!(rejected.state, CandidateState::Rejected);
}

#[tokio::test]
async fn publishing_materializes_the_posting() {
    let pipeline = Pipeline::in_memory().await.unwrap();
    let candidate = publishable_candidate(&pipeline, 0).await;
    assert!(candidate.posting_id.is_none());

    let published = pipeline
        .patch_candidate(&operator(), candidate.id, CandidateState::Published, None)
        .await
        .unwrap();

    let posting_id = published.posting_id.expect("posting should exist");
    let posting = pipeline.find_posting(posting_id).await.unwrap();
    assert_eq!(posting.status, PostingStatus::Active);
    assert_eq!(posting.candidate_id, candidate.id);
    assert!(posting.content_hash.is_some());

    let events = pipeline.events_for("posting", posting_id).await.unwrap();
    assert!(events.iter().any(|e| e.event_type == "posting_created"));
}

#[tokio::test]
async fn override_escapes_a_terminal_state_with_a_reason() {
    let pipeline = Pipeline::in_memory().await.unwrap();
    let candidate = publishable_candidate(&pipeline, 0).await;
    pipeline
        .patch_candidate(
            &operator(),
            candidate.id,
            CandidateState::Rejected,
            Some("mistake"),
        )
        .await
        .unwrap();

    // Rejected is terminal; the normal table has no way back.
    let err = pipeline
        .patch_candidate(&operator(), candidate.id, CandidateState::Publishable, None)
        .await
        .unwrap_err();
    assert!(err.is_conflict());

    let restored = pipeline
        .override_candidate(
            &operator(),
            candidate.id,
            CandidateState::Publishable,
            "rejected in error",
        )
        .await
        .unwrap();
    assert_eq!(restored.state, CandidateState::Publishable);

    let events = pipeline.events_for("candidate", candidate.id).await.unwrap();
    assert!(events.iter().any(|e| e.event_type == "state_overridden"));
}

#[tokio::test]
async fn override_is_operator_only_and_never_forces_merged() {
    let pipeline = Pipeline::in_memory().await.unwrap();
    let candidate = publishable_candidate(&pipeline, 0).await;

    let err = pipeline
        .override_candidate(
            &Actor::Machine("rogue".to_string()),
            candidate.id,
            CandidateState::Rejected,
            "because",
        )
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::Validation { .. }));

    let err = pipeline
        .override_candidate(&operator(), candidate.id, CandidateState::Merged, "force")
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::Validation { .. }));
}

#[tokio::test]
async fn merge_unions_discoveries_and_adopts_the_posting() {
    let pipeline = Pipeline::in_memory().await.unwrap();
    let primary = publishable_candidate(&pipeline, 0).await;
    let secondary = published_candidate(&pipeline, 1).await;
    let posting_id = secondary.posting_id.unwrap();

    let merged = pipeline
        .merge_candidates(&operator(), primary.id, secondary.id, "same listing")
        .await
        .unwrap();

    assert_eq!(merged.posting_id, Some(posting_id));
    let posting = pipeline.find_posting(posting_id).await.unwrap();
    assert_eq!(posting.candidate_id, primary.id);

    let secondary = pipeline.find_candidate(secondary.id).await.unwrap();
    assert_eq!(secondary.state, CandidateState::Merged);
    assert!(secondary.posting_id.is_none());

    let primary_discoveries = Candidate::discovery_ids(pipeline.store().pool(), primary.id)
        .await
        .unwrap();
    assert_eq!(primary_discoveries.len(), 2);

    let events = pipeline.events_for("candidate", primary.id).await.unwrap();
    assert!(events.iter().any(|e| e.event_type == "merge_applied"));
    let events = pipeline.events_for("candidate", secondary.id).await.unwrap();
    assert!(events.iter().any(|e| e.event_type == "merged_away"));
}

#[tokio::test]
async fn publishing_after_merge_adoption_keeps_the_adopted_posting() {
    let pipeline = Pipeline::in_memory().await.unwrap();
    let primary = publishable_candidate(&pipeline, 0).await;
    let secondary = published_candidate(&pipeline, 1).await;
    let adopted_posting_id = secondary.posting_id.unwrap();

    pipeline
        .merge_candidates(&operator(), primary.id, secondary.id, "same listing")
        .await
        .unwrap();

    let published = pipeline
        .patch_candidate(&operator(), primary.id, CandidateState::Published, None)
        .await
        .unwrap();

    // The adopted posting stays canonical; no second posting appears.
    assert_eq!(published.posting_id, Some(adopted_posting_id));
    let postings = pipeline
        .list_postings(&ingestion::PostingFilter::default())
        .await
        .unwrap();
    let owned: Vec<_> = postings
        .iter()
        .filter(|p| p.candidate_id == primary.id)
        .collect();
    assert_eq!(owned.len(), 1);
    assert_eq!(owned[0].id, adopted_posting_id);
    assert_eq!(owned[0].status, PostingStatus::Active);
}

#[tokio::test]
async fn merging_two_posting_owners_is_a_conflict() {
    let pipeline = Pipeline::in_memory().await.unwrap();
    let a = published_candidate(&pipeline, 0).await;
    let b = published_candidate(&pipeline, 1).await;

    let err = pipeline
        .merge_candidates(&operator(), a.id, b.id, "oops")
        .await
        .unwrap_err();
    assert!(err.is_conflict());

    // Nothing changed.
    assert_eq!(
        pipeline.find_candidate(b.id).await.unwrap().state,
        CandidateState::Published
    );
}

#[tokio::test]
async fn self_merge_is_rejected() {
    let pipeline = Pipeline::in_memory().await.unwrap();
    let candidate = publishable_candidate(&pipeline, 0).await;

    let err = pipeline
        .merge_candidates(&operator(), candidate.id, candidate.id, "loop")
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::Validation { .. }));
}

#[tokio::test]
async fn archiving_a_posting_cascades_to_its_candidate() {
    let pipeline = Pipeline::in_memory().await.unwrap();
    let candidate = published_candidate(&pipeline, 0).await;
    let posting_id = candidate.posting_id.unwrap();

    let posting = pipeline
        .patch_posting(
            &Actor::pipeline(),
            posting_id,
            PostingStatus::Archived,
            Some("listing removed upstream"),
        )
        .await
        .unwrap();
    assert_eq!(posting.status, PostingStatus::Archived);

    let candidate = pipeline.find_candidate(candidate.id).await.unwrap();
    assert_eq!(candidate.state, CandidateState::Archived);
}

#[tokio::test]
async fn closing_a_posting_is_operator_only() {
    let pipeline = Pipeline::in_memory().await.unwrap();
    let candidate = published_candidate(&pipeline, 0).await;
    let posting_id = candidate.posting_id.unwrap();

    let err = pipeline
        .patch_posting(
            &Actor::pipeline(),
            posting_id,
            PostingStatus::Closed,
            Some("done"),
        )
        .await
        .unwrap_err();
    assert!(err.is_conflict());

    let posting = pipeline
        .patch_posting(&operator(), posting_id, PostingStatus::Closed, Some("filled"))
        .await
        .unwrap();
    assert_eq!(posting.status, PostingStatus::Closed);

    let candidate = pipeline.find_candidate(candidate.id).await.unwrap();
    assert_eq!(candidate.state, CandidateState::Closed);
}

proptest! {
    #[test]
    fn allowed_transitions_never_leave_terminal_states(
        from in prop::sample::select(CandidateState::ALL.to_vec()),
        to in prop::sample::select(CandidateState::ALL.to_vec()),
    ) {
        if candidate_transition_allowed(from, to) {
            prop_assert!(!from.is_terminal());
            prop_assert_ne!(to, CandidateState::Merged);
            prop_assert_ne!(from, to);
        }
    }

    #[test]
    fn closed_postings_have_no_exit_and_need_an_operator(
        from in prop::sample::select(PostingStatus::ALL.to_vec()),
        to in prop::sample::select(PostingStatus::ALL.to_vec()),
        is_operator in any::<bool>(),
    ) {
        if posting_transition_allowed(from, to, is_operator) {
            prop_assert_ne!(from, PostingStatus::Closed);
            if to == PostingStatus::Closed {
                prop_assert!(is_operator);
            }
        }
    }
}
