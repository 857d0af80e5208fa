//! Stage abstraction: the seam between the driver and the work it schedules.

use std::time::Instant;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, info};

use curator_shared::{CuratorError, Result, StageEntry};

/// Context handed to each stage run.
#[derive(Debug, Clone)]
pub struct StageContext {
    pub execution_id: String,
    /// Logical run date (`YYYY-MM-DD`).
    pub run_date: String,
    /// 1-based position of this stage in the pipeline.
    pub stage_number: u32,
    /// Flipped to `true` when the driver wants the stage to stop.
    pub cancel: watch::Receiver<bool>,
}

/// What a finished stage reports back; persisted on the stage row.
#[derive(Debug, Default)]
pub struct StageOutcome {
    /// Stage-defined metrics as a JSON document.
    pub metrics_json: Option<String>,
}

/// One numbered step of the pipeline.
///
/// Implementations must honor `ctx.cancel`: a cancelled stage stops promptly
/// and surfaces the cancellation as an error.
#[async_trait]
pub trait PipelineStage: Send + Sync {
    /// Human-readable stage name, recorded on the stage row.
    fn name(&self) -> &str;

    /// Execute the stage.
    async fn run(&self, ctx: &StageContext) -> Result<StageOutcome>;
}

pub type BoxedStage = Box<dyn PipelineStage>;

/// Resolves when the cancel flag flips to `true`.
///
/// If the sender side is gone the flag can never flip, so this pends forever
/// rather than treating a closed channel as a cancellation.
pub(crate) async fn wait_cancelled(cancel: &mut watch::Receiver<bool>) {
    if cancel.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

// ---------------------------------------------------------------------------
// CommandStage
// ---------------------------------------------------------------------------

/// Runs a configured external command as a pipeline stage.
///
/// The execution id and run date are exposed to the child via environment
/// variables. On cancellation the child is killed, not orphaned.
pub struct CommandStage {
    name: String,
    command: String,
    args: Vec<String>,
}

impl CommandStage {
    pub fn new(entry: &StageEntry) -> Self {
        Self {
            name: entry.name.clone(),
            command: entry.command.clone(),
            args: entry.args.clone(),
        }
    }
}

#[async_trait]
impl PipelineStage for CommandStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &StageContext) -> Result<StageOutcome> {
        let start = Instant::now();
        debug!(stage = %self.name, command = %self.command, "spawning stage command");

        let mut child = Command::new(&self.command)
            .args(&self.args)
            .env("CURATOR_EXECUTION_ID", &ctx.execution_id)
            .env("CURATOR_RUN_DATE", &ctx.run_date)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                CuratorError::Pipeline(format!("failed to spawn {}: {e}", self.command))
            })?;

        let mut cancel = ctx.cancel.clone();
        let status = tokio::select! {
            status = child.wait() => status
                .map_err(|e| CuratorError::Pipeline(format!("waiting on {}: {e}", self.command)))?,
            _ = wait_cancelled(&mut cancel) => {
                let _ = child.kill().await;
                return Err(CuratorError::Pipeline(format!(
                    "stage {} cancelled by shutdown signal",
                    self.name
                )));
            }
        };

        if !status.success() {
            return Err(CuratorError::Pipeline(format!(
                "{} exited with {status}",
                self.command
            )));
        }

        info!(
            stage = %self.name,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "stage command finished"
        );
        Ok(StageOutcome {
            metrics_json: Some(
                serde_json::json!({ "elapsed_ms": start.elapsed().as_millis() as u64 })
                    .to_string(),
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_ctx(cancel: watch::Receiver<bool>) -> StageContext {
        StageContext {
            execution_id: "exec-1".into(),
            run_date: "2026-08-29".into(),
            stage_number: 1,
            cancel,
        }
    }

    #[tokio::test]
    async fn command_stage_reports_success() {
        let (_tx, rx) = watch::channel(false);
        let stage = CommandStage::new(&StageEntry {
            name: "noop".into(),
            command: "true".into(),
            args: vec![],
        });

        let outcome = stage.run(&test_ctx(rx)).await.expect("stage run");
        assert!(outcome.metrics_json.unwrap().contains("elapsed_ms"));
    }

    #[tokio::test]
    async fn command_stage_surfaces_nonzero_exit() {
        let (_tx, rx) = watch::channel(false);
        let stage = CommandStage::new(&StageEntry {
            name: "failing".into(),
            command: "false".into(),
            args: vec![],
        });

        let err = stage.run(&test_ctx(rx)).await.unwrap_err();
        assert!(err.to_string().contains("exited"));
    }

    #[tokio::test]
    async fn command_stage_killed_on_cancel() {
        let (tx, rx) = watch::channel(false);
        let stage = CommandStage::new(&StageEntry {
            name: "sleeper".into(),
            command: "sleep".into(),
            args: vec!["30".into()],
        });

        let handle = tokio::spawn(async move { stage.run(&test_ctx(rx)).await });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        tx.send(true).unwrap();

        let err = handle.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("cancelled"));
    }

    #[tokio::test]
    async fn missing_command_is_a_spawn_error() {
        let (_tx, rx) = watch::channel(false);
        let stage = CommandStage::new(&StageEntry {
            name: "ghost".into(),
            command: "curator-definitely-not-installed".into(),
            args: vec![],
        });

        let err = stage.run(&test_ctx(rx)).await.unwrap_err();
        assert!(err.to_string().contains("failed to spawn"));
    }
}
