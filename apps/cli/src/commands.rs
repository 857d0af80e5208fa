//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::watch;
use tracing::{info, warn};

use curator_core::{
    CommandStage, BoxedStage, ProgressReporter, RunOptions, RunOutcome, RunReport, run_pipeline,
};
use curator_discovery::{BridgeNormalizer, PatternNormalizer, discover_source};
use curator_rules::{CatalogueStore, DiscoveryOutput, classify, classify_batch};
use curator_shared::{
    AppConfig, ExecutionStatus, LabeledUrl, PipelineExecution, StageStatus, UrlRecord,
    expand_home, init_config, load_config,
};
use curator_storage::Storage;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// curator — rule-based URL curation with a resumable pipeline.
#[derive(Parser)]
#[command(
    name = "curator",
    version,
    about = "Classify URLs against discovered rules and drive the curation pipeline.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Classify one URL or a batch file against the rule catalogue.
    Classify {
        /// Single URL to classify.
        #[arg(long, conflicts_with = "input")]
        url: Option<String>,

        /// Link title accompanying --url.
        #[arg(long, requires = "url")]
        title: Option<String>,

        /// Batch input file: one URL (or one UrlRecord JSON object) per line.
        #[arg(long)]
        input: Option<PathBuf>,
    },

    /// Discover classification rules from a source's labeled URL history.
    Discover {
        /// Source key (e.g., "example.com").
        #[arg(long)]
        source: String,

        /// JSON file holding the labeled URL history for the source.
        #[arg(long)]
        input: PathBuf,

        /// Skip the pattern-normalization bridge even when thresholds trip.
        #[arg(long)]
        no_normalize: bool,
    },

    /// Run the curation pipeline for a date.
    Run {
        /// Logical run date (YYYY-MM-DD, defaults to today).
        #[arg(long)]
        date: Option<String>,

        /// Pipeline name (defaults to the configured one).
        #[arg(long)]
        pipeline: Option<String>,
    },

    /// Resume the most recent failed or partial execution.
    Resume {
        /// Pipeline name (defaults to the configured one).
        #[arg(long)]
        pipeline: Option<String>,
    },

    /// Show recent executions and their stage progress.
    Status {
        /// Pipeline name filter.
        #[arg(long)]
        pipeline: Option<String>,

        /// How many executions to list.
        #[arg(long, default_value = "10")]
        limit: u32,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "curator=info",
        1 => "curator=debug",
        _ => "curator=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .init();
        }
        LogFormat::Json => {
            fmt().json().with_env_filter(env_filter).init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Classify { url, title, input } => {
            cmd_classify(url.as_deref(), title.as_deref(), input.as_deref()).await
        }
        Command::Discover {
            source,
            input,
            no_normalize,
        } => cmd_discover(&source, &input, no_normalize).await,
        Command::Run { date, pipeline } => cmd_run(date.as_deref(), pipeline.as_deref()).await,
        Command::Resume { pipeline } => cmd_resume(pipeline.as_deref()).await,
        Command::Status { pipeline, limit } => cmd_status(pipeline.as_deref(), limit).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
        },
    }
}

/// Resolve the data directory holding the catalogue documents and database.
fn data_dir(config: &AppConfig) -> PathBuf {
    expand_home(&config.defaults.data_dir)
}

fn db_path(config: &AppConfig) -> PathBuf {
    data_dir(config).join("curator.db")
}

// ---------------------------------------------------------------------------
// classify
// ---------------------------------------------------------------------------

async fn cmd_classify(
    url: Option<&str>,
    title: Option<&str>,
    input: Option<&Path>,
) -> Result<()> {
    let config = load_config()?;
    let store = CatalogueStore::open(data_dir(&config))?;
    let snapshot = Arc::new(store.load_snapshot()?);
    info!(rules = snapshot.rule_count(), "rule snapshot loaded");

    match (url, input) {
        (Some(url), None) => {
            match classify(url, title.unwrap_or(""), &snapshot) {
                Some(matched) => {
                    println!(
                        "{}",
                        serde_json::json!({
                            "url": url,
                            "content_type": matched.content_type,
                            "rule": matched.rule_name,
                        })
                    );
                }
                None => {
                    println!(
                        "{}",
                        serde_json::json!({ "url": url, "unmatched": true })
                    );
                    eprintln!("unmatched: route to the fallback classifier");
                }
            }
            Ok(())
        }
        (None, Some(path)) => {
            let content = std::fs::read_to_string(path)
                .map_err(|e| eyre!("cannot read {}: {e}", path.display()))?;
            let records = parse_url_records(&content)?;

            let outcome = classify_batch(&records, &snapshot);
            for (record, matched) in &outcome.classified {
                println!(
                    "{}",
                    serde_json::json!({
                        "url": record.url,
                        "content_type": matched.content_type,
                        "rule": matched.rule_name,
                    })
                );
            }
            for record in &outcome.unmatched {
                println!(
                    "{}",
                    serde_json::json!({ "url": record.url, "unmatched": true })
                );
            }

            info!(
                classified = outcome.classified.len(),
                unmatched = outcome.unmatched.len(),
                "batch classified; unmatched URLs go to the fallback classifier"
            );
            Ok(())
        }
        _ => Err(eyre!("provide exactly one of --url or --input")),
    }
}

/// Parse batch input: each non-empty line is a bare URL or a UrlRecord object.
fn parse_url_records(content: &str) -> Result<Vec<UrlRecord>> {
    let mut records = Vec::new();
    for (lineno, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line.starts_with('{') {
            let record: UrlRecord = serde_json::from_str(line)
                .map_err(|e| eyre!("line {}: invalid record: {e}", lineno + 1))?;
            records.push(record);
        } else {
            records.push(UrlRecord {
                url: line.to_string(),
                title: String::new(),
            });
        }
    }
    Ok(records)
}

// ---------------------------------------------------------------------------
// discover
// ---------------------------------------------------------------------------

async fn cmd_discover(source: &str, input: &Path, no_normalize: bool) -> Result<()> {
    let config = load_config()?;

    let content = std::fs::read_to_string(input)
        .map_err(|e| eyre!("cannot read {}: {e}", input.display()))?;
    let history: Vec<LabeledUrl> = serde_json::from_str(&content)
        .map_err(|e| eyre!("invalid labeled history in {}: {e}", input.display()))?;

    info!(source, urls = history.len(), "starting discovery run");

    let mut bridge = if no_normalize {
        None
    } else {
        match BridgeNormalizer::spawn(&config.normalizer) {
            Ok(bridge) => Some(bridge),
            Err(e) => {
                warn!(error = %e, "normalizer bridge unavailable, skipping normalization");
                None
            }
        }
    };

    let result = discover_source(
        source,
        &history,
        bridge.as_mut().map(|b| b as &mut dyn PatternNormalizer),
        &config.discovery,
    );

    if let Some(bridge) = bridge {
        if let Err(e) = bridge.shutdown() {
            warn!(error = %e, "normalizer bridge did not shut down cleanly");
        }
    }

    let store = CatalogueStore::open(data_dir(&config))?;
    let mut output = DiscoveryOutput::default();
    output
        .rules_by_source
        .insert(source.to_string(), result.rules.clone());
    output
        .noise_by_source
        .insert(source.to_string(), result.noise_urls.clone());
    store.merge(output)?;

    println!();
    println!("  Discovery complete for {source}");
    println!("  URLs examined:     {}", history.len());
    println!("  Patterns (unique): {}", result.stats.unique_patterns);
    println!("  Dedup ratio:       {:.2}", result.stats.dedup_ratio);
    if result.stats.normalization_attempted {
        println!(
            "  Normalization:     {} pass(es)",
            result.stats.normalization_passes
        );
    }
    println!("  Rules accepted:    {}", result.stats.accepted);
    println!("  Rules rejected:    {}", result.stats.rejected);
    println!("  Noise URLs cached: {}", result.noise_urls.len());
    println!("  Catalogue:         {}", store.dir().display());
    println!();

    Ok(())
}

// ---------------------------------------------------------------------------
// run / resume
// ---------------------------------------------------------------------------

async fn cmd_run(date: Option<&str>, pipeline: Option<&str>) -> Result<()> {
    let config = load_config()?;
    let pipeline_name = pipeline.unwrap_or(&config.pipeline.name).to_string();
    let run_date = match date {
        Some(d) => {
            chrono::NaiveDate::parse_from_str(d, "%Y-%m-%d")
                .map_err(|e| eyre!("invalid --date '{d}': {e}"))?;
            d.to_string()
        }
        None => chrono::Utc::now().format("%Y-%m-%d").to_string(),
    };

    execute_pipeline(&config, pipeline_name, run_date, None).await
}

async fn cmd_resume(pipeline: Option<&str>) -> Result<()> {
    let config = load_config()?;
    let pipeline_name = pipeline.unwrap_or(&config.pipeline.name).to_string();

    let storage = Storage::open(&db_path(&config)).await?;
    let Some(failed) = storage
        .get_last_failed_execution(Some(&pipeline_name))
        .await?
    else {
        println!("Nothing to resume: no failed or partial {pipeline_name} execution on record.");
        return Ok(());
    };
    drop(storage);

    info!(
        execution_id = %failed.id,
        run_date = %failed.run_date,
        last_successful_stage = failed.last_successful_stage,
        "resuming execution"
    );
    let run_date = failed.run_date.clone();
    execute_pipeline(&config, pipeline_name, run_date, Some(failed)).await
}

async fn execute_pipeline(
    config: &AppConfig,
    pipeline_name: String,
    run_date: String,
    resume_from: Option<PipelineExecution>,
) -> Result<()> {
    let stages: Vec<BoxedStage> = config
        .pipeline
        .stages
        .iter()
        .map(|entry| Box::new(CommandStage::new(entry)) as BoxedStage)
        .collect();

    let storage = Storage::open(&db_path(config)).await?;
    let options = RunOptions {
        pipeline_name,
        run_date,
        config_snapshot: serde_json::to_string(config)?,
        max_concurrent: config.pipeline.max_concurrent,
        heartbeat_interval_secs: config.pipeline.heartbeat_interval_secs,
        liveness_threshold_secs: config.pipeline.liveness_threshold_secs,
        resume_from,
    };

    // Ctrl-C flips the cancel flag; the driver fails the running stage and
    // finalizes the execution instead of leaving it ambiguous.
    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = cancel_tx.send(true);
        }
    });

    let reporter = CliProgress::new();
    match run_pipeline(&storage, &stages, &options, cancel_rx, &reporter).await? {
        RunOutcome::Denied { execution_id } => {
            println!(
                "Another execution is already running; {execution_id} stays pending. Try again later."
            );
            Ok(())
        }
        RunOutcome::Ran(report) => {
            println!();
            println!("  Execution: {}", report.execution_id);
            println!(
                "  Stages:    {}/{} completed",
                report.stages_completed, report.stages_total
            );
            println!("  Status:    {}", report.status.as_str());
            println!("  Time:      {:.1}s", report.elapsed.as_secs_f64());
            println!();

            match report.status {
                ExecutionStatus::Completed => Ok(()),
                _ => Err(eyre!(
                    "pipeline finished {}; run `curator resume` to retry from stage {}",
                    report.status.as_str(),
                    report.stages_completed + 1
                )),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// status
// ---------------------------------------------------------------------------

async fn cmd_status(pipeline: Option<&str>, limit: u32) -> Result<()> {
    let config = load_config()?;
    let path = db_path(&config);
    if !path.exists() {
        println!("No executions recorded yet ({} does not exist).", path.display());
        return Ok(());
    }

    let storage = Storage::open_readonly(&path).await?;
    let executions = storage.list_executions(pipeline, limit).await?;
    if executions.is_empty() {
        println!("No executions recorded.");
        return Ok(());
    }

    println!(
        "{:<38} {:<12} {:<10} {:<9} {}",
        "EXECUTION", "DATE", "STATUS", "STAGES", "PIPELINE"
    );
    for exec in &executions {
        println!(
            "{:<38} {:<12} {:<10} {:<9} {}",
            exec.id,
            exec.run_date,
            exec.status.as_str(),
            exec.last_successful_stage,
            exec.pipeline_name
        );
    }

    // Stage detail for the most recent execution.
    let newest = &executions[0];
    let stage_runs = storage.list_stage_runs(&newest.id).await?;
    if !stage_runs.is_empty() {
        println!();
        println!("Stages of {}:", newest.id);
        for run in &stage_runs {
            let note = match run.status {
                StageStatus::Failed => run
                    .error_message
                    .as_deref()
                    .map(|m| format!("  ({m})"))
                    .unwrap_or_default(),
                _ => String::new(),
            };
            println!(
                "  {:>2}. {:<20} {}{note}",
                run.stage_number,
                run.name,
                run.status.as_str()
            );
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// config
// ---------------------------------------------------------------------------

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .unwrap()
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }
}

impl ProgressReporter for CliProgress {
    fn stage_started(&self, number: u32, total: u32, name: &str) {
        self.spinner
            .set_message(format!("Stage [{number}/{total}] {name}"));
    }

    fn stage_finished(&self, number: u32, name: &str, status: StageStatus) {
        self.spinner
            .println(format!("  {number}. {name}: {}", status.as_str()));
    }

    fn done(&self, _report: &RunReport) {
        self.spinner.finish_and_clear();
    }
}
