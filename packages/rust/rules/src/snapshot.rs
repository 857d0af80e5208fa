//! Immutable, atomically-swappable rule snapshots.
//!
//! A [`RuleSnapshot`] is compiled once from the catalogue documents and never
//! mutated afterwards. [`SnapshotHandle`] holds the active snapshot behind a
//! single swappable pointer: readers clone the `Arc` and keep matching against
//! the snapshot they started with while a reload publishes a new one.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use regex::{Regex, RegexBuilder};
use tracing::warn;

use curator_shared::{ContentType, NoiseCache, RuleCatalogue};

/// A classification rule with its pattern compiled for matching.
#[derive(Debug)]
pub struct CompiledRule {
    pub regex: Regex,
    pub content_type: ContentType,
    pub name: String,
}

/// Immutable bundle of compiled rules and the exact-match noise cache.
#[derive(Debug, Default)]
pub struct RuleSnapshot {
    /// Global rules in priority order.
    pub(crate) global_rules: Vec<CompiledRule>,
    /// Source-scoped rules keyed by normalized source key, each in order.
    pub(crate) source_rules: HashMap<String, Vec<CompiledRule>>,
    /// Known noise URLs keyed by source.
    pub(crate) noise_cache: HashMap<String, HashSet<String>>,
}

impl RuleSnapshot {
    /// An empty snapshot: every classification returns unmatched.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Compile a snapshot from the persisted catalogue documents.
    ///
    /// A rule whose pattern fails to compile is skipped with a warning — one
    /// bad rule must never take down classification.
    pub fn build(catalogue: &RuleCatalogue, noise: &NoiseCache) -> Self {
        let global_rules = compile_rules(&catalogue.global_rules, None);

        let source_rules = catalogue
            .sources
            .iter()
            .map(|(key, rules)| (key.clone(), compile_rules(rules, Some(key))))
            .collect();

        let noise_cache = noise
            .sources
            .iter()
            .map(|(key, urls)| (key.clone(), urls.iter().cloned().collect()))
            .collect();

        Self {
            global_rules,
            source_rules,
            noise_cache,
        }
    }

    /// Total number of compiled rules, global and source-scoped.
    pub fn rule_count(&self) -> usize {
        self.global_rules.len() + self.source_rules.values().map(Vec::len).sum::<usize>()
    }

    /// Whether the snapshot contains no rules and no cached noise URLs.
    pub fn is_empty(&self) -> bool {
        self.global_rules.is_empty() && self.source_rules.is_empty() && self.noise_cache.is_empty()
    }
}

/// Compile a rule list, dropping malformed patterns.
fn compile_rules(
    rules: &[curator_shared::ClassificationRule],
    source_key: Option<&str>,
) -> Vec<CompiledRule> {
    rules
        .iter()
        .filter_map(|rule| {
            match RegexBuilder::new(&rule.pattern)
                .case_insensitive(true)
                .build()
            {
                Ok(regex) => Some(CompiledRule {
                    regex,
                    content_type: rule.content_type,
                    name: rule.name.clone(),
                }),
                Err(e) => {
                    warn!(
                        rule = %rule.name,
                        source = source_key.unwrap_or("global"),
                        error = %e,
                        "skipping rule with malformed pattern"
                    );
                    None
                }
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// SnapshotHandle
// ---------------------------------------------------------------------------

/// Holds the process-wide active snapshot behind an atomically-swappable
/// pointer. Cloning the handle shares the same active snapshot.
#[derive(Clone)]
pub struct SnapshotHandle {
    inner: Arc<RwLock<Arc<RuleSnapshot>>>,
}

impl SnapshotHandle {
    /// Create a handle with an empty initial snapshot.
    pub fn new() -> Self {
        Self::with_snapshot(RuleSnapshot::empty())
    }

    /// Create a handle publishing the given snapshot.
    pub fn with_snapshot(snapshot: RuleSnapshot) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(snapshot))),
        }
    }

    /// Get the currently active snapshot. The returned `Arc` stays valid for
    /// the caller even if a swap happens mid-batch.
    pub fn load(&self) -> Arc<RuleSnapshot> {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Publish a new snapshot. In-flight readers keep their old `Arc`.
    pub fn swap(&self, snapshot: RuleSnapshot) {
        let mut guard = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Arc::new(snapshot);
    }
}

impl Default for SnapshotHandle {
    fn default() -> Self {
        Self::new()
    }
}
