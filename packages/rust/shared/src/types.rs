//! Core domain types for curator: classification rules, catalogue documents,
//! and the durable pipeline execution records.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Current schema version for the rule catalogue and noise cache documents.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// ExecutionId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for pipeline execution identifiers (time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(pub Uuid);

impl ExecutionId {
    /// Generate a new time-sortable execution identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ExecutionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// ContentType
// ---------------------------------------------------------------------------

/// Top-level classification of a URL: editorial content vs navigational noise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Content,
    Noise,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Content => "content",
            Self::Noise => "noise",
        }
    }
}

impl std::fmt::Display for ContentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ContentType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "content" => Ok(Self::Content),
            "noise" => Ok(Self::Noise),
            other => Err(format!("unknown content type: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Classification rules
// ---------------------------------------------------------------------------

/// Whether a rule applies to every source or to a single source key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleScope {
    Global,
    Source,
}

/// Discovery-time statistics attached to an auto-generated rule.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleMetadata {
    /// Number of concrete URLs that produced this pattern.
    #[serde(default)]
    pub example_count: usize,
    /// Share of the historical URL set matched by the pattern.
    #[serde(default)]
    pub coverage_pct: f64,
    /// Share of matched URLs agreeing with the asserted content type.
    #[serde(default)]
    pub consistency_pct: f64,
}

/// A named regex pattern plus the content type it asserts.
///
/// Immutable once published into a [`RuleCatalogue`]; discovery produces new
/// rules rather than editing existing ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationRule {
    /// Regex pattern, matched case-insensitively against the full URL.
    pub pattern: String,
    /// Content type asserted on match.
    pub content_type: ContentType,
    /// Stable, human-readable rule name.
    pub name: String,
    /// Global or source-scoped.
    pub scope: RuleScope,
    /// Source key for source-scoped rules.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_key: Option<String>,
    /// Discovery statistics (absent for hand-written rules).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<RuleMetadata>,
}

// ---------------------------------------------------------------------------
// Catalogue documents
// ---------------------------------------------------------------------------

/// The `rules.json` document: global rules plus per-source rule lists.
///
/// Rule order within each list is significant — the matcher evaluates in list
/// order and the first match wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleCatalogue {
    /// Schema version for forward compatibility.
    pub schema_version: u32,
    /// When the document was last merged.
    pub updated_at: DateTime<Utc>,
    /// Rules evaluated for every source, in priority order.
    #[serde(default)]
    pub global_rules: Vec<ClassificationRule>,
    /// Source-scoped rules keyed by normalized source key.
    #[serde(default)]
    pub sources: BTreeMap<String, Vec<ClassificationRule>>,
}

impl Default for RuleCatalogue {
    fn default() -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            updated_at: Utc::now(),
            global_rules: Vec::new(),
            sources: BTreeMap::new(),
        }
    }
}

/// The `noise_cache.json` document: exact-match noise URLs per source.
///
/// Cheaper than a regex and used for sources with too few noise examples to
/// generalize. Lists are kept deduplicated and sorted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoiseCache {
    pub schema_version: u32,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub sources: BTreeMap<String, Vec<String>>,
}

impl Default for NoiseCache {
    fn default() -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            updated_at: Utc::now(),
            sources: BTreeMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Pipeline execution records
// ---------------------------------------------------------------------------

/// Lifecycle states of a pipeline execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Partial,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Partial => "partial",
            Self::Failed => "failed",
        }
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "partial" => Ok(Self::Partial),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown execution status: {other}")),
        }
    }
}

/// Lifecycle states of a single stage run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::str::FromStr for StageStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown stage status: {other}")),
        }
    }
}

/// One end-to-end attempt at running the staged pipeline for a run date.
///
/// `status` and `last_successful_stage` are the only fields mutated after
/// creation; the config snapshot is an immutable copy kept for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineExecution {
    pub id: String,
    pub pipeline_name: String,
    /// Logical run date (`YYYY-MM-DD`).
    pub run_date: String,
    /// Immutable JSON copy of the configuration used for this run.
    pub config_snapshot: String,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Highest stage number with a completed run, 0 if none.
    pub last_successful_stage: u32,
}

/// One attempt at one numbered step of a pipeline execution.
///
/// Rows are never deleted; a retried stage idempotently resets its row back to
/// `pending` via the invalidation path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRun {
    pub id: String,
    pub execution_id: String,
    /// 1-based position in the pipeline, strictly increasing per execution.
    pub stage_number: u32,
    pub name: String,
    pub status: StageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Last liveness update while running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Stage-reported metrics as a JSON document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics_json: Option<String>,
}

// ---------------------------------------------------------------------------
// Classification inputs
// ---------------------------------------------------------------------------

/// A candidate URL handed to the matcher: the URL plus its link text/title.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UrlRecord {
    pub url: String,
    #[serde(default)]
    pub title: String,
}

/// A historical URL with its known label, used to validate candidate patterns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabeledUrl {
    pub url: String,
    pub content_type: ContentType,
    /// Opaque, classifier-assigned secondary tag. No fixed vocabulary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}
