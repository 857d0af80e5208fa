//! Shared types, error model, and configuration for curator.
//!
//! This crate is the foundation depended on by all other curator crates.
//! It provides:
//! - [`CuratorError`] — the unified error type
//! - Domain types ([`ClassificationRule`], [`RuleCatalogue`], [`NoiseCache`],
//!   [`PipelineExecution`], [`StageRun`])
//! - Configuration ([`AppConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, DefaultsConfig, DiscoveryConfig, NormalizerConfig, PipelineConfig, StageEntry,
    config_dir, config_file_path, expand_home, init_config, load_config, load_config_from,
};
pub use error::{CuratorError, Result};
pub use types::{
    CURRENT_SCHEMA_VERSION, ClassificationRule, ContentType, ExecutionId, ExecutionStatus,
    LabeledUrl, NoiseCache, PipelineExecution, RuleCatalogue, RuleMetadata, RuleScope, StageRun,
    StageStatus, UrlRecord,
};
