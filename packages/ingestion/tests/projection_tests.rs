//! End-to-end projection: intake, extraction, scoring, policy routing
//! and catalogue effects.

mod common;

use common::{discovery, extract, ingest_and_extract, listing, posting_fields, WORKER};
use ingestion::{
    Actor, Candidate, CandidateState, JobStatus, MergeAction, Pipeline, PipelineWorker,
    PolicyUpsert, PostingStatus, TrustLevel,
};
use uuid::Uuid;

#[tokio::test]
async fn trusted_distinct_content_is_auto_published() {
    let pipeline = Pipeline::in_memory().await.unwrap();
    let (new, result) = listing(0, "trusted");

    let outcome = ingest_and_extract(&pipeline, &new, result).await;

    assert_eq!(outcome.candidate.state, CandidateState::Published);
    let posting_id = outcome.candidate.posting_id.expect("posting created");
    let posting = pipeline.find_posting(posting_id).await.unwrap();
    assert_eq!(posting.status, PostingStatus::Active);
    assert_eq!(posting.title, "Food shelf volunteer");

    let events = pipeline
        .events_for("candidate", outcome.candidate.id)
        .await
        .unwrap();
    assert!(events
        .iter()
        .any(|e| e.event_type == "extraction_projected"));
}

#[tokio::test]
async fn standard_distinct_content_waits_as_publishable() {
    let pipeline = Pipeline::in_memory().await.unwrap();
    let (new, result) = listing(0, "standard");

    let outcome = ingest_and_extract(&pipeline, &new, result).await;

    assert_eq!(outcome.candidate.state, CandidateState::Publishable);
    assert!(outcome.candidate.posting_id.is_none());
    assert_eq!(outcome.candidate.confidence, Some(0.0));
}

#[tokio::test]
async fn untrusted_content_routes_to_moderation() {
    let pipeline = Pipeline::in_memory().await.unwrap();
    let (new, result) = listing(0, "untrusted");

    let outcome = ingest_and_extract(&pipeline, &new, result).await;

    assert_eq!(outcome.candidate.state, CandidateState::NeedsReview);
    assert_eq!(
        outcome.candidate.moderation_route.as_deref(),
        Some("moderation_queue")
    );
}

#[tokio::test]
async fn exact_duplicate_from_trusted_source_auto_merges() {
    let pipeline = Pipeline::in_memory().await.unwrap();
    let (new, result) = listing(0, "trusted");
    let first = ingest_and_extract(&pipeline, &new, result.clone()).await;
    let posting_id = first.candidate.posting_id.unwrap();

    // Same content re-discovered under a different external id.
    let mut again = new.clone();
    again.external_id = "listing-1-repost".to_string();
    let second = ingest_and_extract(&pipeline, &again, result).await;

    assert_eq!(second.candidate.state, CandidateState::Merged);
    assert_eq!(second.merged_into, Some(first.candidate.id));
    let decision = second.decision.unwrap();
    assert_eq!(decision.action, MergeAction::AutoMerge);
    assert_eq!(decision.reason, "strong_duplicate");

    // The surviving candidate holds both discoveries and the posting.
    let discoveries = Candidate::discovery_ids(pipeline.store().pool(), first.candidate.id)
        .await
        .unwrap();
    assert_eq!(discoveries.len(), 2);
    let posting = pipeline.find_posting(posting_id).await.unwrap();
    assert_eq!(posting.candidate_id, first.candidate.id);
    assert_eq!(posting.status, PostingStatus::Active);
}

#[tokio::test]
async fn conflicting_signals_block_auto_merge() {
    let pipeline = Pipeline::in_memory().await.unwrap();
    let (new, result) = listing(0, "trusted");
    ingest_and_extract(&pipeline, &new, result.clone()).await;

    // Same content, but the contact domain disagrees.
    let mut again = new.clone();
    again.external_id = "listing-1-suspect".to_string();
    let mut conflicted = result;
    conflicted.contact_domain = Some("elsewhere.net".to_string());
    let second = ingest_and_extract(&pipeline, &again, conflicted).await;

    assert_eq!(second.candidate.state, CandidateState::NeedsReview);
    assert!(second.merged_into.is_none());
    let decision = second.decision.unwrap();
    assert_eq!(decision.action, MergeAction::NeedsReview);
    assert_eq!(decision.reason, "conflicting_signals");
}

#[tokio::test]
async fn policy_can_retarget_the_auto_merge_band_to_review() {
    let pipeline = Pipeline::in_memory().await.unwrap();
    let (new, result) = listing(0, "trusted");
    let first = ingest_and_extract(&pipeline, &new, result.clone()).await;

    pipeline
        .upsert_policy(
            &Actor::Operator(Uuid::now_v7()),
            PolicyUpsert {
                policy_key: format!("source:{}", new.origin),
                trust_level: TrustLevel::Trusted,
                auto_publish: None,
                requires_moderation: None,
                overrides: serde_json::json!({
                    "merge_decision_actions": { "auto_merge": "needs_review" },
                    "moderation_routes": { "strong_duplicate": "duplicate-review" }
                }),
            },
        )
        .await
        .unwrap();

    let mut again = new.clone();
    again.external_id = "listing-1-repost".to_string();
    let second = ingest_and_extract(&pipeline, &again, result).await;

    assert_eq!(second.candidate.state, CandidateState::NeedsReview);
    assert!(second.merged_into.is_none());
    assert_eq!(
        second.candidate.moderation_route.as_deref(),
        Some("duplicate-review")
    );
    // The first candidate keeps its posting untouched.
    assert_eq!(
        pipeline.find_candidate(first.candidate.id).await.unwrap().state,
        CandidateState::Published
    );
}

#[tokio::test]
async fn re_ingesting_a_known_discovery_is_idempotent() {
    let pipeline = Pipeline::in_memory().await.unwrap();
    let (new, result) = listing(0, "standard");

    let first = pipeline.ingest_discovery(&new).await.unwrap();
    assert!(first.created);

    let second = pipeline.ingest_discovery(&new).await.unwrap();
    assert!(!second.created);
    assert_eq!(second.discovery.id, first.discovery.id);
    // Collapsed onto the live extraction job.
    assert_eq!(second.job.id, first.job.id);

    // Once that job resolves, a fresh re-ingest gets a new job.
    pipeline
        .claim_jobs(WORKER, &[ingestion::JobKind::Extract], 10)
        .await
        .unwrap();
    pipeline
        .submit_result(
            first.job.id,
            WORKER,
            ingestion::WorkResult::Extracted(result),
        )
        .await
        .unwrap();

    let third = pipeline.ingest_discovery(&new).await.unwrap();
    assert!(!third.created);
    assert_ne!(third.job.id, first.job.id);
}

#[tokio::test]
async fn second_extraction_does_not_duplicate_the_candidate() {
    let pipeline = Pipeline::in_memory().await.unwrap();
    let (new, result) = listing(0, "standard");
    let first = ingest_and_extract(&pipeline, &new, result.clone()).await;

    // The same discovery goes through extraction again.
    let re_ingest = pipeline.ingest_discovery(&new).await.unwrap();
    pipeline
        .claim_jobs(WORKER, &[ingestion::JobKind::Extract], 10)
        .await
        .unwrap();
    let outcome = match pipeline
        .submit_result(
            re_ingest.job.id,
            WORKER,
            ingestion::WorkResult::Extracted(result),
        )
        .await
        .unwrap()
    {
        ingestion::SubmitOutcome::Projected(outcome) => outcome,
        other => panic!("expected projection, got {other:?}"),
    };

    assert_eq!(outcome.candidate.id, first.candidate.id);
}

#[tokio::test]
async fn stale_postings_are_detected_by_the_maintenance_worker() {
    let pipeline = Pipeline::in_memory().await.unwrap();
    let (new, result) = listing(0, "trusted");
    let outcome = ingest_and_extract(&pipeline, &new, result).await;
    let posting_id = outcome.candidate.posting_id.unwrap();

    // Fresh posting: nothing to schedule.
    assert_eq!(pipeline.schedule_freshness_checks().await.unwrap(), 0);

    // Age the posting past the freshness window.
    let old = chrono::Utc::now() - chrono::Duration::hours(200);
    sqlx::query("UPDATE postings SET last_seen_at = $1 WHERE id = $2")
        .bind(old)
        .bind(posting_id)
        .execute(pipeline.store().pool())
        .await
        .unwrap();

    let worker = PipelineWorker::new(pipeline.clone(), "maintenance");
    worker.tick(10).await.unwrap();

    let posting = pipeline.find_posting(posting_id).await.unwrap();
    assert_eq!(posting.status, PostingStatus::Stale);

    let jobs = pipeline
        .list_jobs(&ingestion::JobFilter {
            status: Some(JobStatus::Done),
            kind: Some(ingestion::JobKind::CheckFreshness),
            limit: None,
        })
        .await
        .unwrap();
    assert_eq!(jobs.len(), 1);
}

#[tokio::test]
async fn projection_keys_to_the_job_lease() {
    let pipeline = Pipeline::in_memory().await.unwrap();
    let (new, result) = listing(0, "trusted");
    let intake = pipeline.ingest_discovery(&new).await.unwrap();

    pipeline
        .claim_jobs(WORKER, &[ingestion::JobKind::Extract], 10)
        .await
        .unwrap();

    // A worker that lost the lease cannot project.
    let err = pipeline
        .submit_result(
            intake.job.id,
            "impostor",
            ingestion::WorkResult::Extracted(result),
        )
        .await
        .unwrap_err();
    assert!(err.is_conflict());

    // No candidate was created by the failed attempt.
    let candidates = pipeline
        .list_candidates(&ingestion::CandidateFilter::default())
        .await
        .unwrap();
    assert!(candidates.is_empty());
}

#[tokio::test]
async fn low_signal_overlap_with_same_domain_needs_review() {
    let pipeline = Pipeline::in_memory().await.unwrap();
    let (new, result) = listing(0, "trusted");
    ingest_and_extract(&pipeline, &new, result).await;

    // Dissimilar text from the same organization and domain: a human
    // should look before a second posting appears.
    let second_new = discovery(
        "north_market",
        "listing-2",
        "https://north.org/roles/driver",
        "trusted",
    );
    let second_result = extract(
        posting_fields(
            "Delivery driver",
            "North Market",
            "Drive donated goods between drop-off sites twice a month",
            "https://north.org/roles/driver",
        ),
        Some("north.org"),
    );
    let outcome = ingest_and_extract(&pipeline, &second_new, second_result).await;

    assert_eq!(outcome.candidate.state, CandidateState::NeedsReview);
}
