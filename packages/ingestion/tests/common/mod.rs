//! Shared helpers for integration tests.
#![allow(dead_code)]

use ingestion::{
    ExtractResult, NewDiscovery, Pipeline, PostingFields, ProjectionOutcome, SubmitOutcome,
    WorkResult,
};

pub const WORKER: &str = "test-worker";

/// Three listings with disjoint text, organizations and domains, so
/// they never score as duplicates of each other.
const LISTINGS: [(&str, &str, &str, &str, &str); 3] = [
    (
        "north_market",
        "https://north.org/roles/food-shelf",
        "Food shelf volunteer",
        "North Market",
        "Sort and shelve weekly grocery donations every Tuesday evening",
    ),
    (
        "river_music",
        "https://rivermusic.net/jobs/piano",
        "Piano teacher wanted",
        "River Music School",
        "Teach beginner piano lessons to children on Saturday mornings",
    ),
    (
        "lakeside",
        "https://lakeside.club/coach",
        "Youth soccer coach",
        "Lakeside Athletics",
        "Coach a recreational youth soccer team during the spring season",
    ),
];

pub fn discovery(origin: &str, external_id: &str, url: &str, trust_level: &str) -> NewDiscovery {
    NewDiscovery {
        origin: origin.to_string(),
        external_id: external_id.to_string(),
        url: Some(url.to_string()),
        hints: serde_json::json!({ "trust_level": trust_level }),
        metadata: serde_json::json!({}),
    }
}

pub fn posting_fields(title: &str, organization: &str, description: &str, url: &str) -> PostingFields {
    PostingFields {
        title: title.to_string(),
        organization: organization.to_string(),
        url: Some(url.to_string()),
        location: Some("Minneapolis".to_string()),
        tags: vec!["volunteer".to_string()],
        deadline: None,
        description: Some(description.to_string()),
    }
}

pub fn extract(fields: PostingFields, contact_domain: Option<&str>) -> ExtractResult {
    ExtractResult {
        entities: vec![fields.organization.clone()],
        contact_domain: contact_domain.map(|d| d.to_string()),
        module_id: None,
        fields,
    }
}

/// One of the disjoint sample listings, as intake plus extraction input.
pub fn listing(n: usize, trust_level: &str) -> (NewDiscovery, ExtractResult) {
    let (origin, url, title, organization, description) = LISTINGS[n % LISTINGS.len()];
    let domain = url
        .trim_start_matches("https://")
        .split('/')
        .next()
        .unwrap();
    (
        discovery(origin, "listing-1", url, trust_level),
        extract(posting_fields(title, organization, description, url), Some(domain)),
    )
}

/// Ingest a discovery, claim its extraction job and submit the result.
pub async fn ingest_and_extract(
    pipeline: &Pipeline,
    new: &NewDiscovery,
    result: ExtractResult,
) -> ProjectionOutcome {
    let intake = pipeline.ingest_discovery(new).await.unwrap();

    let claimed = pipeline
        .claim_jobs(WORKER, &[ingestion::JobKind::Extract], 10)
        .await
        .unwrap();
    assert!(
        claimed.iter().any(|j| j.id == intake.job.id),
        "extraction job was not claimable"
    );

    match pipeline
        .submit_result(intake.job.id, WORKER, WorkResult::Extracted(result))
        .await
        .unwrap()
    {
        SubmitOutcome::Projected(outcome) => outcome,
        SubmitOutcome::Resolved(job) => panic!("expected projection, got resolved job {}", job.id),
    }
}
