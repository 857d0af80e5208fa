//! Rule-based URL classification for curator.
//!
//! Three pieces:
//! - [`matcher`] — pure, tiered classification of one URL against a snapshot
//! - [`snapshot`] — immutable compiled rule bundles with atomic swap
//! - [`catalogue`] — the persisted rule/noise documents and per-source merge

pub mod catalogue;
pub mod matcher;
pub mod snapshot;

pub use catalogue::{CatalogueStore, DiscoveryOutput, NOISE_CACHE_FILE, RULES_FILE};
pub use matcher::{BatchOutcome, CACHED_URL_RULE, RuleMatch, candidate_keys, classify, classify_batch};
pub use snapshot::{CompiledRule, RuleSnapshot, SnapshotHandle};
