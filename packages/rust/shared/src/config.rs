//! Application configuration for curator.
//!
//! User config lives at `~/.curator/curator.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CuratorError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "curator.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".curator";

// ---------------------------------------------------------------------------
// Config structs (matching curator.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Global defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Pattern discovery thresholds.
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Pipeline driver settings and stage definitions.
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Pattern-normalization bridge settings.
    #[serde(default)]
    pub normalizer: NormalizerConfig,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Data directory holding rules.json, noise_cache.json, and curator.db.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

fn default_data_dir() -> String {
    "~/.curator/data".into()
}

/// `[discovery]` section — thresholds for pattern synthesis and validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Minimum historical URLs a candidate pattern must match.
    #[serde(default = "default_min_coverage")]
    pub min_coverage: usize,

    /// Minimum share of matches agreeing with the dominant content type.
    #[serde(default = "default_min_consistency_pct")]
    pub min_consistency_pct: f64,

    /// Dedup ratio above which LLM normalization kicks in.
    #[serde(default = "default_dedup_ratio_threshold")]
    pub dedup_ratio_threshold: f64,

    /// Unique pattern count above which LLM normalization kicks in.
    #[serde(default = "default_normalize_min_patterns")]
    pub normalize_min_patterns: usize,

    /// Maximum patterns per normalization batch.
    #[serde(default = "default_normalize_batch_size")]
    pub normalize_batch_size: usize,

    /// Hard cap on normalization passes over the merged output.
    #[serde(default = "default_max_normalize_passes")]
    pub max_normalize_passes: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            min_coverage: default_min_coverage(),
            min_consistency_pct: default_min_consistency_pct(),
            dedup_ratio_threshold: default_dedup_ratio_threshold(),
            normalize_min_patterns: default_normalize_min_patterns(),
            normalize_batch_size: default_normalize_batch_size(),
            max_normalize_passes: default_max_normalize_passes(),
        }
    }
}

fn default_min_coverage() -> usize {
    3
}
fn default_min_consistency_pct() -> f64 {
    70.0
}
fn default_dedup_ratio_threshold() -> f64 {
    0.8
}
fn default_normalize_min_patterns() -> usize {
    10
}
fn default_normalize_batch_size() -> usize {
    40
}
fn default_max_normalize_passes() -> usize {
    5
}

/// `[pipeline]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Pipeline name used for execution records.
    #[serde(default = "default_pipeline_name")]
    pub name: String,

    /// Ceiling on concurrently running executions (1 = strictly sequential).
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: u32,

    /// Seconds between stage heartbeat updates.
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    /// Seconds without a heartbeat before a running stage is abandoned.
    #[serde(default = "default_liveness_threshold_secs")]
    pub liveness_threshold_secs: u64,

    /// Ordered stage definitions (`[[pipeline.stages]]`).
    #[serde(default)]
    pub stages: Vec<StageEntry>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            name: default_pipeline_name(),
            max_concurrent: default_max_concurrent(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            liveness_threshold_secs: default_liveness_threshold_secs(),
            stages: Vec::new(),
        }
    }
}

fn default_pipeline_name() -> String {
    "curation".into()
}
fn default_max_concurrent() -> u32 {
    1
}
fn default_heartbeat_interval_secs() -> u64 {
    15
}
fn default_liveness_threshold_secs() -> u64 {
    300
}

/// `[[pipeline.stages]]` entry — one numbered step of the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageEntry {
    /// Stage name (e.g., "extract", "classify", "cluster").
    pub name: String,
    /// Command line to execute for this stage.
    pub command: String,
    /// Arguments passed to the command.
    #[serde(default)]
    pub args: Vec<String>,
}

/// `[normalizer]` section — the pattern-normalization bridge subprocess.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizerConfig {
    /// Bridge command (e.g., "bun").
    #[serde(default = "default_bridge_cmd")]
    pub bridge_cmd: String,

    /// Bridge script path.
    #[serde(default = "default_bridge_script")]
    pub bridge_script: String,

    /// Working directory for the bridge subprocess.
    #[serde(default = "default_bridge_working_dir")]
    pub working_dir: String,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            bridge_cmd: default_bridge_cmd(),
            bridge_script: default_bridge_script(),
            working_dir: default_bridge_working_dir(),
        }
    }
}

fn default_bridge_cmd() -> String {
    "bun".into()
}
fn default_bridge_script() -> String {
    "packages/ts/normalizer/src/bridge.ts".into()
}
fn default_bridge_working_dir() -> String {
    ".".into()
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.curator/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| CuratorError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.curator/curator.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| CuratorError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| CuratorError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| CuratorError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| CuratorError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| CuratorError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Expand a leading `~/` in a configured path against the user's home.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
