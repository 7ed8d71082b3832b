//! Trust policy resolution precedence, validation and audit.

use ingestion::policy::TrustPolicyResolver;
use ingestion::types::policy::policy_entity_id;
use ingestion::{
    Actor, IngestError, PolicyUpsert, ProvenanceEvent, Store, TrustLevel,
};
use uuid::Uuid;

fn operator() -> Actor {
    Actor::Operator(Uuid::now_v7())
}

fn upsert(policy_key: &str, trust_level: TrustLevel) -> PolicyUpsert {
    PolicyUpsert {
        policy_key: policy_key.to_string(),
        trust_level,
        auto_publish: None,
        requires_moderation: None,
        overrides: serde_json::Value::Null,
    }
}

#[tokio::test]
async fn source_policy_takes_precedence_over_module_and_default() {
    let store = Store::in_memory().await.unwrap();
    let resolver = TrustPolicyResolver::new(store);
    let actor = operator();

    resolver
        .upsert(&actor, upsert("default:standard", TrustLevel::Untrusted))
        .await
        .unwrap();
    resolver
        .upsert(&actor, upsert("module:extractor-v2", TrustLevel::Standard))
        .await
        .unwrap();
    resolver
        .upsert(&actor, upsert("source:acme", TrustLevel::Trusted))
        .await
        .unwrap();

    let effective = resolver
        .resolve("acme", Some("extractor-v2"), TrustLevel::Standard)
        .await
        .unwrap();
    assert!(effective.auto_publish, "source:acme should win");

    let effective = resolver
        .resolve("other", Some("extractor-v2"), TrustLevel::Standard)
        .await
        .unwrap();
    assert!(!effective.auto_publish);
    assert!(!effective.requires_moderation, "module:extractor-v2 should win");

    let effective = resolver
        .resolve("other", None, TrustLevel::Standard)
        .await
        .unwrap();
    assert!(effective.requires_moderation, "default:standard should win");
}

#[tokio::test]
async fn built_in_defaults_apply_when_no_policy_matches() {
    let store = Store::in_memory().await.unwrap();
    let resolver = TrustPolicyResolver::new(store);

    let effective = resolver
        .resolve("unknown", None, TrustLevel::Trusted)
        .await
        .unwrap();
    assert!(effective.auto_publish);
    assert!(!effective.requires_moderation);

    let effective = resolver
        .resolve("unknown", None, TrustLevel::Untrusted)
        .await
        .unwrap();
    assert!(!effective.auto_publish);
    assert!(effective.requires_moderation);
}

#[tokio::test]
async fn disabled_policies_are_skipped_during_resolution() {
    let store = Store::in_memory().await.unwrap();
    let resolver = TrustPolicyResolver::new(store);
    let actor = operator();

    resolver
        .upsert(&actor, upsert("source:acme", TrustLevel::Trusted))
        .await
        .unwrap();
    resolver
        .set_enabled(&actor, "source:acme", false)
        .await
        .unwrap();

    let effective = resolver
        .resolve("acme", None, TrustLevel::Standard)
        .await
        .unwrap();
    assert!(!effective.auto_publish, "disabled policy must not apply");
}

#[tokio::test]
async fn invalid_overrides_are_rejected_before_any_write() {
    let store = Store::in_memory().await.unwrap();
    let resolver = TrustPolicyResolver::new(store);
    let actor = operator();

    let mut input = upsert("source:acme", TrustLevel::Trusted);
    input.overrides = serde_json::json!({
        "moderation_routes": { "needs_review": "Not A Valid Route" }
    });
    let err = resolver.upsert(&actor, input).await.unwrap_err();
    assert!(matches!(err, IngestError::Validation { .. }));

    assert!(resolver.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn policy_mutations_are_audited() {
    let store = Store::in_memory().await.unwrap();
    let resolver = TrustPolicyResolver::new(store.clone());
    let actor = operator();

    resolver
        .upsert(&actor, upsert("source:acme", TrustLevel::Trusted))
        .await
        .unwrap();
    resolver
        .set_enabled(&actor, "source:acme", false)
        .await
        .unwrap();

    let events = ProvenanceEvent::list_for_entity(
        store.pool(),
        "trust_policy",
        policy_entity_id("source:acme"),
        100,
    )
    .await
    .unwrap();

    assert_eq!(events.len(), 2);
    assert_eq!(events[0].event_type, "policy_upserted");
    assert_eq!(events[1].event_type, "policy_toggled");
    assert_eq!(events[1].actor_type, "operator");
    assert_eq!(
        events[1].payload.0.get("enabled_after"),
        Some(&serde_json::json!(false))
    );
}

#[tokio::test]
async fn toggling_an_unknown_policy_is_not_found() {
    let store = Store::in_memory().await.unwrap();
    let resolver = TrustPolicyResolver::new(store);

    let err = resolver
        .set_enabled(&operator(), "source:ghost", false)
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::NotFound { .. }));
}
