//! Deduplication scorer.
//!
//! A pure function over already-fetched comparison data: no network or
//! database access, deterministic output for a given input. The
//! orchestrator fetches catalogue matches and feeds them in; the same
//! inputs can be replayed from the audit trail.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Exact hash/URL agreement against an existing posting.
pub const FLAG_STRONG_SIGNAL: &str = "strong_signal_match";
/// Text similarity in the medium band.
pub const FLAG_MEDIUM_SIGNAL: &str = "medium_signal_match";
/// Signals conflict (e.g. similar text, different contact domain).
pub const FLAG_MANUAL_REVIEW: &str = "manual_review_needed";
/// Weak text signal but corroborating secondary signals.
pub const FLAG_MANUAL_REVIEW_LOW_SIGNAL: &str = "manual_review_low_signal";

/// Confidence floor for an exact hash/URL match.
pub const STRONG_SIGNAL_FLOOR: f64 = 0.95;
/// Text similarity at or above this is a medium signal.
pub const MEDIUM_SIMILARITY: f64 = 0.55;
/// Bounded delta the secondary tie-breakers may apply.
const TIE_BREAK_DELTA: f64 = 0.05;
/// Medium-band confidence never reaches the strong floor.
const MEDIUM_BAND_CEILING: f64 = 0.94;

/// Signals computed for the incoming candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateSignals {
    pub content_hash: Option<String>,
    pub normalized_url: Option<String>,
    pub text: String,
    pub entities: Vec<String>,
    pub contact_domain: Option<String>,
}

/// Comparison data for one existing catalogue posting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogueMatch {
    pub posting_id: Uuid,
    pub candidate_id: Uuid,
    pub content_hash: Option<String>,
    pub normalized_url: Option<String>,
    pub text: String,
    pub entities: Vec<String>,
    pub contact_domain: Option<String>,
}

/// Scorer output: merge confidence and the risk flags it raised.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DedupeScore {
    pub confidence: f64,
    pub risk_flags: Vec<String>,
}

impl DedupeScore {
    /// No catalogue match at all.
    pub fn no_match() -> Self {
        Self {
            confidence: 0.0,
            risk_flags: Vec::new(),
        }
    }

    pub fn has_flag(&self, flag: &str) -> bool {
        self.risk_flags.iter().any(|f| f == flag)
    }

    /// Whether any flag signals conflicting evidence. An explicit
    /// conflict signal is never bypassed by auto-publish.
    pub fn has_conflict_flag(&self) -> bool {
        self.has_flag(FLAG_MANUAL_REVIEW) || self.has_flag(FLAG_MANUAL_REVIEW_LOW_SIGNAL)
    }
}

/// Score a candidate against one catalogue match.
///
/// Signal tiers, strongest wins: exact hash/URL agreement, then text
/// similarity, then secondary tie-breakers adjusting within a bounded
/// delta.
pub fn score(signals: &CandidateSignals, catalogue: &CatalogueMatch) -> DedupeScore {
    let mut flags = Vec::new();

    let hash_match = matches!(
        (&signals.content_hash, &catalogue.content_hash),
        (Some(a), Some(b)) if a == b
    );
    let url_match = matches!(
        (&signals.normalized_url, &catalogue.normalized_url),
        (Some(a), Some(b)) if a == b
    );

    let domains_differ = matches!(
        (&signals.contact_domain, &catalogue.contact_domain),
        (Some(a), Some(b)) if a != b
    );
    let domains_equal = matches!(
        (&signals.contact_domain, &catalogue.contact_domain),
        (Some(a), Some(b)) if a == b
    );

    if hash_match || url_match {
        // Tier 1: the floor holds regardless of tie-breakers; conflicting
        // secondary signals only raise a flag.
        let confidence = if hash_match && url_match {
            0.98
        } else {
            STRONG_SIGNAL_FLOOR
        };
        flags.push(FLAG_STRONG_SIGNAL.to_string());
        if domains_differ {
            flags.push(FLAG_MANUAL_REVIEW.to_string());
        }
        return finish(confidence, flags);
    }

    let similarity = token_similarity(&signals.text, &catalogue.text);
    let entity_overlap = entity_overlap(&signals.entities, &catalogue.entities);

    if similarity >= MEDIUM_SIMILARITY {
        // Tier 2: map similarity into the medium band, below the strong floor.
        let span = (similarity - MEDIUM_SIMILARITY) / (1.0 - MEDIUM_SIMILARITY);
        let mut confidence = MEDIUM_SIMILARITY + span * (MEDIUM_BAND_CEILING - MEDIUM_SIMILARITY);
        flags.push(FLAG_MEDIUM_SIGNAL.to_string());

        // Tier 3: bounded tie-breakers.
        if entity_overlap >= 0.5 {
            confidence += TIE_BREAK_DELTA;
        }
        if domains_equal {
            confidence += TIE_BREAK_DELTA;
        }
        if domains_differ {
            confidence -= TIE_BREAK_DELTA;
            flags.push(FLAG_MANUAL_REVIEW.to_string());
        }

        return finish(confidence.min(MEDIUM_BAND_CEILING), flags);
    }

    // Weak text signal. Corroborating secondary signals on dissimilar
    // text are themselves a conflict worth human eyes.
    let mut confidence = similarity;
    if domains_equal || entity_overlap >= 0.5 {
        confidence += TIE_BREAK_DELTA;
        flags.push(FLAG_MANUAL_REVIEW_LOW_SIGNAL.to_string());
    }

    finish(confidence, flags)
}

/// Score against every fetched match and keep the strongest.
pub fn score_best(
    signals: &CandidateSignals,
    matches: &[CatalogueMatch],
) -> Option<(CatalogueMatch, DedupeScore)> {
    matches
        .iter()
        .map(|m| (m.clone(), score(signals, m)))
        .max_by(|(_, a), (_, b)| {
            a.confidence
                .partial_cmp(&b.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
}

fn finish(confidence: f64, mut flags: Vec<String>) -> DedupeScore {
    flags.sort();
    flags.dedup();
    DedupeScore {
        confidence: confidence.clamp(0.0, 1.0),
        risk_flags: flags,
    }
}

/// Generate a canonical content hash for duplicate detection.
///
/// SHA-256 of normalized text: lowercase, non-alphanumerics stripped,
/// whitespace collapsed. Robust against minor formatting changes while
/// still detecting meaningful content changes.
pub fn content_hash(text: &str) -> String {
    let normalized = normalize_text(text);
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Normalize a URL for exact-match comparison: lowercase, scheme and
/// `www.` prefix stripped, trailing slash removed.
pub fn normalize_url(url: &str) -> String {
    let mut u = url.trim().to_lowercase();
    for prefix in ["https://", "http://"] {
        if let Some(rest) = u.strip_prefix(prefix) {
            u = rest.to_string();
            break;
        }
    }
    if let Some(rest) = u.strip_prefix("www.") {
        u = rest.to_string();
    }
    u.trim_end_matches('/').to_string()
}

/// Jaccard similarity over normalized token sets.
pub fn token_similarity(a: &str, b: &str) -> f64 {
    let ta = token_set(a);
    let tb = token_set(b);
    if ta.is_empty() || tb.is_empty() {
        return 0.0;
    }

    let intersection = ta.intersection(&tb).count() as f64;
    let union = ta.union(&tb).count() as f64;
    intersection / union
}

fn entity_overlap(a: &[String], b: &[String]) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }

    let sa: std::collections::BTreeSet<String> = a.iter().map(|e| e.to_lowercase()).collect();
    let sb: std::collections::BTreeSet<String> = b.iter().map(|e| e.to_lowercase()).collect();
    let intersection = sa.intersection(&sb).count() as f64;
    intersection / sa.len().min(sb.len()) as f64
}

fn token_set(text: &str) -> std::collections::BTreeSet<String> {
    normalize_text(text)
        .split_whitespace()
        .map(|t| t.to_string())
        .collect()
}

fn normalize_text(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signals(text: &str) -> CandidateSignals {
        CandidateSignals {
            content_hash: Some(content_hash(text)),
            normalized_url: Some("acme.org/jobs/1".to_string()),
            text: text.to_string(),
            entities: vec!["Acme Corp".to_string()],
            contact_domain: Some("acme.org".to_string()),
        }
    }

    fn catalogue(text: &str) -> CatalogueMatch {
        CatalogueMatch {
            posting_id: Uuid::now_v7(),
            candidate_id: Uuid::now_v7(),
            content_hash: Some(content_hash(text)),
            normalized_url: Some("acme.org/jobs/1".to_string()),
            text: text.to_string(),
            entities: vec!["Acme Corp".to_string()],
            contact_domain: Some("acme.org".to_string()),
        }
    }

    #[test]
    fn exact_hash_match_scores_at_or_above_strong_floor() {
        let result = score(&signals("Backend engineer at Acme"), &catalogue("Backend engineer at Acme"));
        assert!(result.confidence >= STRONG_SIGNAL_FLOOR);
        assert!(result.has_flag(FLAG_STRONG_SIGNAL));
    }

    #[test]
    fn strong_match_with_differing_domain_keeps_floor_but_flags() {
        let mut other = catalogue("Backend engineer at Acme");
        other.contact_domain = Some("elsewhere.net".to_string());
        let result = score(&signals("Backend engineer at Acme"), &other);
        assert!(result.confidence >= STRONG_SIGNAL_FLOOR);
        assert!(result.has_flag(FLAG_MANUAL_REVIEW));
    }

    #[test]
    fn similar_text_lands_in_medium_band() {
        let mut me = signals("Volunteer coordinator needed for food distribution in Duluth");
        me.content_hash = Some(content_hash("a"));
        me.normalized_url = Some("one.org/x".to_string());
        let mut other = catalogue("Volunteer coordinator needed for food distribution in Duluth area");
        other.content_hash = Some(content_hash("b"));
        other.normalized_url = Some("two.org/y".to_string());

        let result = score(&me, &other);
        assert!(result.has_flag(FLAG_MEDIUM_SIGNAL));
        assert!(result.confidence >= MEDIUM_SIMILARITY);
        assert!(result.confidence < STRONG_SIGNAL_FLOOR);
    }

    #[test]
    fn similar_text_with_conflicting_domain_raises_review_flag() {
        let mut me = signals("Volunteer coordinator needed for food distribution in Duluth");
        me.content_hash = Some(content_hash("a"));
        me.normalized_url = Some("one.org/x".to_string());
        let mut other = catalogue("Volunteer coordinator needed for food distribution in Duluth area");
        other.content_hash = Some(content_hash("b"));
        other.normalized_url = Some("two.org/y".to_string());
        other.contact_domain = Some("elsewhere.net".to_string());

        let result = score(&me, &other);
        assert!(result.has_flag(FLAG_MANUAL_REVIEW));
        assert!(result.has_conflict_flag());
    }

    #[test]
    fn dissimilar_text_scores_low() {
        let mut me = signals("Backend engineer at Acme");
        me.content_hash = Some(content_hash("a"));
        me.normalized_url = Some("one.org/x".to_string());
        me.contact_domain = None;
        me.entities = vec![];
        let mut other = catalogue("Piano teacher wanted in Saint Paul");
        other.content_hash = Some(content_hash("b"));
        other.normalized_url = Some("two.org/y".to_string());
        other.contact_domain = None;
        other.entities = vec![];

        let result = score(&me, &other);
        assert!(result.confidence < 0.4);
        assert!(result.risk_flags.is_empty());
    }

    #[test]
    fn scorer_is_deterministic() {
        let me = signals("Backend engineer at Acme");
        let other = catalogue("Backend engineer at Acme");
        assert_eq!(score(&me, &other), score(&me, &other));
    }

    #[test]
    fn confidence_is_always_in_unit_interval() {
        let me = signals("Volunteer coordinator needed for food distribution");
        let mut other = catalogue("Volunteer coordinator needed for food distribution");
        other.content_hash = Some(content_hash("b"));
        other.normalized_url = Some("two.org/y".to_string());
        let result = score(&me, &other);
        assert!((0.0..=1.0).contains(&result.confidence));
    }

    #[test]
    fn content_hash_ignores_case_and_punctuation() {
        assert_eq!(
            content_hash("Spanish-speaking volunteers!"),
            content_hash("spanish speaking VOLUNTEERS")
        );
        assert_ne!(content_hash("alpha"), content_hash("beta"));
    }

    #[test]
    fn url_normalization_strips_scheme_www_and_slash() {
        assert_eq!(normalize_url("https://www.Acme.org/jobs/"), "acme.org/jobs");
        assert_eq!(normalize_url("http://acme.org/jobs"), "acme.org/jobs");
    }

    #[test]
    fn token_similarity_of_identical_text_is_one() {
        assert_eq!(token_similarity("a b c", "c b a"), 1.0);
        assert_eq!(token_similarity("", "anything"), 0.0);
    }

    #[test]
    fn score_best_keeps_the_strongest_match() {
        let me = signals("Backend engineer at Acme");
        let strong = catalogue("Backend engineer at Acme");
        let mut weak = catalogue("Piano teacher wanted");
        weak.content_hash = Some(content_hash("other"));
        weak.normalized_url = Some("two.org/y".to_string());

        let (best, score) = score_best(&me, &[weak, strong.clone()]).unwrap();
        assert_eq!(best.posting_id, strong.posting_id);
        assert!(score.confidence >= STRONG_SIGNAL_FLOOR);
    }
}
