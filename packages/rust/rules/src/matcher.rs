//! Tiered URL classification against an immutable rule snapshot.
//!
//! Matching is a pure function of `(url, title, snapshot)` with a fixed tier
//! order, first match wins: noise cache → global rules → source rules. URLs
//! nothing matches are handed back unmatched for the caller's fallback
//! classifier.

use std::sync::Arc;

use serde::Serialize;
use url::Url;

use curator_shared::{ContentType, UrlRecord};

use crate::snapshot::RuleSnapshot;

/// Rule name reported for exact noise-cache hits.
pub const CACHED_URL_RULE: &str = "cached_url";

/// The classification a rule asserted for a URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleMatch {
    pub content_type: ContentType,
    pub rule_name: String,
}

/// Source keys to try for a URL: the host without a leading `www.`, then the
/// first label before the first dot. Unparseable URLs yield no keys.
pub fn candidate_keys(url: &str) -> Vec<String> {
    let Ok(parsed) = Url::parse(url) else {
        return Vec::new();
    };
    let Some(host) = parsed.host_str() else {
        return Vec::new();
    };

    let domain = host.strip_prefix("www.").unwrap_or(host).to_ascii_lowercase();
    let short_domain = domain
        .split('.')
        .next()
        .unwrap_or(&domain)
        .to_string();

    let mut keys = vec![domain];
    if !keys.contains(&short_domain) {
        keys.push(short_domain);
    }
    keys
}

/// Classify one URL against the snapshot.
///
/// The title is part of the classification contract (it travels with the URL
/// to the external fallback classifier) but rule matching operates on the URL
/// alone. Returns `None` when nothing matches — never an error.
pub fn classify(url: &str, _title: &str, snapshot: &RuleSnapshot) -> Option<RuleMatch> {
    let keys = candidate_keys(url);

    // Tier 1: exact noise-cache hit.
    for key in &keys {
        if let Some(cached) = snapshot.noise_cache.get(key) {
            if cached.contains(url) {
                return Some(RuleMatch {
                    content_type: ContentType::Noise,
                    rule_name: CACHED_URL_RULE.to_string(),
                });
            }
        }
    }

    // Tier 2: global rules in list order.
    for rule in &snapshot.global_rules {
        if rule.regex.is_match(url) {
            return Some(RuleMatch {
                content_type: rule.content_type,
                rule_name: rule.name.clone(),
            });
        }
    }

    // Tier 3: source rules per candidate key, in list order.
    for key in &keys {
        if let Some(rules) = snapshot.source_rules.get(key) {
            for rule in rules {
                if rule.regex.is_match(url) {
                    return Some(RuleMatch {
                        content_type: rule.content_type,
                        rule_name: rule.name.clone(),
                    });
                }
            }
        }
    }

    None
}

/// Result of classifying a batch: input order is preserved within each
/// partition separately.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub classified: Vec<(UrlRecord, RuleMatch)>,
    pub unmatched: Vec<UrlRecord>,
}

/// Classify a batch of URL records against one snapshot.
///
/// Taking an `Arc` pins the snapshot for the whole batch: a concurrent reload
/// never splits a batch across two rule sets.
pub fn classify_batch(records: &[UrlRecord], snapshot: &Arc<RuleSnapshot>) -> BatchOutcome {
    let mut outcome = BatchOutcome::default();

    for record in records {
        match classify(&record.url, &record.title, snapshot) {
            Some(m) => outcome.classified.push((record.clone(), m)),
            None => outcome.unmatched.push(record.clone()),
        }
    }

    outcome
}
