//! Candidate grouping, conditional normalization, and historical validation.
//!
//! A discovery run takes every labeled URL known for one source. Content URLs
//! are generalized into candidate patterns and validated against the full
//! history; noise URLs are too few and too heterogeneous to generalize safely,
//! so they go verbatim into the noise cache.

use std::collections::{BTreeMap, HashMap};

use regex::RegexBuilder;
use tracing::{debug, info, warn};

use curator_shared::{
    ClassificationRule, ContentType, DiscoveryConfig, LabeledUrl, RuleMetadata, RuleScope,
};

use crate::normalizer::{NormalizeRequest, NormalizedGroup, PatternNormalizer};
use crate::synthesize::synthesize;

// ---------------------------------------------------------------------------
// Candidate patterns
// ---------------------------------------------------------------------------

/// A synthesized pattern with the URLs that produced it, discovery-time only.
#[derive(Debug, Clone)]
pub struct CandidatePattern {
    pub pattern: String,
    /// Labels of the producing URLs.
    pub tally: HashMap<ContentType, usize>,
    pub example_urls: Vec<String>,
}

impl CandidatePattern {
    fn new(pattern: String) -> Self {
        Self {
            pattern,
            tally: HashMap::new(),
            example_urls: Vec::new(),
        }
    }
}

/// Counters describing one discovery run, for logging and the CLI summary.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryStats {
    pub total_synthesized: usize,
    pub unique_patterns: usize,
    pub dedup_ratio: f64,
    pub normalization_attempted: bool,
    pub normalization_passes: usize,
    pub accepted: usize,
    pub rejected: usize,
}

/// Everything one discovery run produced for one source.
#[derive(Debug)]
pub struct SourceDiscovery {
    pub source_key: String,
    pub rules: Vec<ClassificationRule>,
    pub noise_urls: Vec<String>,
    pub stats: DiscoveryStats,
}

// ---------------------------------------------------------------------------
// Discovery entry point
// ---------------------------------------------------------------------------

/// Run pattern discovery for one source over its full labeled history.
///
/// Normalization is attempted only when the candidates are fragmented enough
/// to be worth a round-trip (`dedup_ratio` above the threshold and more unique
/// patterns than `normalize_min_patterns`) and a normalizer is available.
pub fn discover_source(
    source_key: &str,
    history: &[LabeledUrl],
    mut normalizer: Option<&mut dyn PatternNormalizer>,
    config: &DiscoveryConfig,
) -> SourceDiscovery {
    let mut candidates: BTreeMap<String, CandidatePattern> = BTreeMap::new();
    let mut noise_urls: Vec<String> = Vec::new();
    let mut total_synthesized = 0usize;

    for entry in history {
        match entry.content_type {
            ContentType::Noise => noise_urls.push(entry.url.clone()),
            ContentType::Content => {
                let Some(pattern) = synthesize(&entry.url) else {
                    debug!(url = %entry.url, "skipping unsynthesizable url");
                    continue;
                };
                total_synthesized += 1;
                let candidate = candidates
                    .entry(pattern.clone())
                    .or_insert_with(|| CandidatePattern::new(pattern));
                *candidate.tally.entry(entry.content_type).or_insert(0) += 1;
                candidate.example_urls.push(entry.url.clone());
            }
        }
    }

    noise_urls.sort();
    noise_urls.dedup();

    let unique_patterns = candidates.len();
    let dedup_ratio = if total_synthesized == 0 {
        0.0
    } else {
        unique_patterns as f64 / total_synthesized as f64
    };

    let mut stats = DiscoveryStats {
        total_synthesized,
        unique_patterns,
        dedup_ratio,
        ..Default::default()
    };

    let should_normalize = dedup_ratio > config.dedup_ratio_threshold
        && unique_patterns > config.normalize_min_patterns;

    if should_normalize {
        if let Some(normalizer) = normalizer.as_deref_mut() {
            stats.normalization_attempted = true;
            candidates =
                normalize_candidates(candidates, normalizer, config, &mut stats.normalization_passes);
        } else {
            debug!(
                source = source_key,
                dedup_ratio, "normalization indicated but no normalizer available"
            );
        }
    }

    let rules = validate_candidates(source_key, candidates, history, config, &mut stats);

    info!(
        source = source_key,
        synthesized = stats.total_synthesized,
        unique = stats.unique_patterns,
        accepted = stats.accepted,
        rejected = stats.rejected,
        noise_cached = noise_urls.len(),
        "discovery run complete"
    );

    SourceDiscovery {
        source_key: source_key.to_string(),
        rules,
        noise_urls,
        stats,
    }
}

// ---------------------------------------------------------------------------
// Normalization loop
// ---------------------------------------------------------------------------

/// Iteratively merge near-duplicate candidates through the collaborator.
///
/// An explicit loop with a hard pass cap, not recursion: convergence is
/// expected but the collaborator does not guarantee it.
fn normalize_candidates(
    mut candidates: BTreeMap<String, CandidatePattern>,
    normalizer: &mut dyn PatternNormalizer,
    config: &DiscoveryConfig,
    passes: &mut usize,
) -> BTreeMap<String, CandidatePattern> {
    for _ in 0..config.max_normalize_passes {
        *passes += 1;
        let before = candidates.len();
        candidates = normalize_pass(candidates, normalizer, config);

        // Converged, or stopped shrinking: another pass cannot help.
        if candidates.len() <= config.normalize_batch_size || candidates.len() >= before {
            break;
        }
    }
    candidates
}

/// One pass over all candidates in bounded batches.
fn normalize_pass(
    mut candidates: BTreeMap<String, CandidatePattern>,
    normalizer: &mut dyn PatternNormalizer,
    config: &DiscoveryConfig,
) -> BTreeMap<String, CandidatePattern> {
    let patterns: Vec<String> = candidates.keys().cloned().collect();

    for chunk in patterns.chunks(config.normalize_batch_size.max(1)) {
        let groups = match normalizer.normalize(&NormalizeRequest {
            patterns: chunk.to_vec(),
            strict: false,
        }) {
            Ok(groups) => groups,
            Err(e) => {
                warn!(error = %e, "normalizer response rejected, retrying stricter");
                // Stricter retry: half the patterns, strict mode.
                let reduced: Vec<String> = chunk.iter().take(chunk.len().div_ceil(2)).cloned().collect();
                match normalizer.normalize(&NormalizeRequest {
                    patterns: reduced,
                    strict: true,
                }) {
                    Ok(groups) => groups,
                    Err(e) => {
                        warn!(error = %e, "normalization failed twice, keeping batch un-merged");
                        continue;
                    }
                }
            }
        };

        apply_groups(&mut candidates, &groups);
    }

    candidates
}

/// Fold each group's original candidates into its canonical pattern.
///
/// Groups whose canonical pattern does not compile are ignored so their
/// originals survive un-merged; data is never dropped on a bad response.
fn apply_groups(candidates: &mut BTreeMap<String, CandidatePattern>, groups: &[NormalizedGroup]) {
    for group in groups {
        if RegexBuilder::new(&group.normalized_pattern)
            .case_insensitive(true)
            .build()
            .is_err()
        {
            warn!(
                pattern = %group.normalized_pattern,
                "normalized pattern does not compile, keeping originals"
            );
            continue;
        }

        let mut combined = candidates
            .remove(&group.normalized_pattern)
            .unwrap_or_else(|| CandidatePattern::new(group.normalized_pattern.clone()));

        for original in &group.original_patterns {
            if *original == group.normalized_pattern {
                continue;
            }
            if let Some(absorbed) = candidates.remove(original) {
                for (content_type, n) in absorbed.tally {
                    *combined.tally.entry(content_type).or_insert(0) += n;
                }
                combined.example_urls.extend(absorbed.example_urls);
            }
        }

        candidates.insert(combined.pattern.clone(), combined);
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate candidates against the entire historical URL set for the source.
fn validate_candidates(
    source_key: &str,
    candidates: BTreeMap<String, CandidatePattern>,
    history: &[LabeledUrl],
    config: &DiscoveryConfig,
    stats: &mut DiscoveryStats,
) -> Vec<ClassificationRule> {
    let mut accepted = Vec::new();
    let mut hint_counts: HashMap<&'static str, usize> = HashMap::new();

    // BTreeMap iteration order keeps rule names stable across runs.
    for (pattern, candidate) in candidates {
        let Ok(re) = RegexBuilder::new(&pattern).case_insensitive(true).build() else {
            stats.rejected += 1;
            warn!(pattern = %pattern, "candidate pattern does not compile, rejecting");
            continue;
        };

        let mut content_matches = 0usize;
        let mut noise_matches = 0usize;
        for entry in history {
            if re.is_match(&entry.url) {
                match entry.content_type {
                    ContentType::Content => content_matches += 1,
                    ContentType::Noise => noise_matches += 1,
                }
            }
        }

        let match_count = content_matches + noise_matches;
        if match_count < config.min_coverage {
            stats.rejected += 1;
            debug!(
                pattern = %pattern,
                match_count,
                min_coverage = config.min_coverage,
                "rejecting candidate below coverage floor"
            );
            continue;
        }

        let (dominant, dominant_count) = if content_matches >= noise_matches {
            (ContentType::Content, content_matches)
        } else {
            (ContentType::Noise, noise_matches)
        };
        let consistency_pct = dominant_count as f64 / match_count as f64 * 100.0;
        if consistency_pct < config.min_consistency_pct {
            stats.rejected += 1;
            debug!(
                pattern = %pattern,
                consistency_pct,
                "rejecting inconsistent candidate"
            );
            continue;
        }

        let hint = pattern_hint(&pattern);
        let ordinal = hint_counts.entry(hint).and_modify(|n| *n += 1).or_insert(1);
        let name = if *ordinal == 1 {
            format!("{hint}_pattern")
        } else {
            format!("{hint}_pattern_{ordinal}")
        };

        let coverage_pct = match_count as f64 / history.len().max(1) as f64 * 100.0;

        stats.accepted += 1;
        accepted.push(ClassificationRule {
            pattern,
            content_type: dominant,
            name,
            scope: RuleScope::Source,
            source_key: Some(source_key.to_string()),
            metadata: Some(RuleMetadata {
                example_count: candidate.example_urls.len(),
                coverage_pct,
                consistency_pct,
            }),
        });
    }

    accepted
}

/// Structural hint for naming, in fixed priority order:
/// numeric id > timestamp > date > slug.
fn pattern_hint(pattern: &str) -> &'static str {
    if pattern.contains(r"\d+") {
        "numeric_id"
    } else if pattern.contains(r"\d{14}") {
        "timestamp"
    } else if pattern.contains(r"\d{4}-\d{2}-\d{2}")
        || pattern.contains(r"\d{2}-\d{2}-\d{4}")
        || pattern.contains(r"\d{4}/\d{2}/\d{2}")
    {
        "date"
    } else if pattern.contains("[^/]+") {
        "slug"
    } else {
        "literal"
    }
}
