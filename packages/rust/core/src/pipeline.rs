//! Pipeline driver: durable, resumable stage-by-stage execution.

use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{info, instrument, warn};

use curator_shared::{
    CuratorError, ExecutionStatus, PipelineExecution, Result, StageStatus,
};
use curator_storage::{GateDecision, Storage};

use crate::stage::{wait_cancelled, BoxedStage, StageContext};

/// Options for one driver invocation.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Pipeline name used for execution records.
    pub pipeline_name: String,
    /// Logical run date (`YYYY-MM-DD`).
    pub run_date: String,
    /// Immutable config JSON snapshotted onto the execution row.
    pub config_snapshot: String,
    /// Ceiling on concurrently running executions.
    pub max_concurrent: u32,
    /// Seconds between stage heartbeat updates.
    pub heartbeat_interval_secs: u64,
    /// Seconds without a heartbeat before a running stage is abandoned.
    pub liveness_threshold_secs: u64,
    /// Resume this prior execution instead of creating a fresh one.
    pub resume_from: Option<PipelineExecution>,
}

/// Summary of a finished (or stopped) run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub execution_id: String,
    pub status: ExecutionStatus,
    pub stages_completed: u32,
    pub stages_total: u32,
    pub elapsed: Duration,
}

/// Result of one driver invocation. A gate denial is an outcome, not an error.
#[derive(Debug)]
pub enum RunOutcome {
    Ran(RunReport),
    /// The concurrency ceiling was occupied; nothing was run. Retry later.
    Denied { execution_id: String },
}

/// Progress callback for reporting driver status.
pub trait ProgressReporter: Send + Sync {
    /// Called when a stage starts running.
    fn stage_started(&self, number: u32, total: u32, name: &str);
    /// Called when a stage finishes, successfully or not.
    fn stage_finished(&self, number: u32, name: &str, status: StageStatus);
    /// Called when the run finalizes.
    fn done(&self, report: &RunReport);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn stage_started(&self, _number: u32, _total: u32, _name: &str) {}
    fn stage_finished(&self, _number: u32, _name: &str, _status: StageStatus) {}
    fn done(&self, _report: &RunReport) {}
}

/// Run (or resume) a pipeline execution.
///
/// 1. Reap abandoned runs so stale `running` rows cannot hold the gate
/// 2. Create a fresh execution, or reopen and invalidate the resumed one
/// 3. Pass the concurrency gate (denial returns [`RunOutcome::Denied`])
/// 4. Walk stages in order, heartbeating while each runs
/// 5. Finalize as completed, partial, or failed
#[instrument(skip_all, fields(pipeline = %options.pipeline_name, run_date = %options.run_date))]
pub async fn run_pipeline(
    storage: &Storage,
    stages: &[BoxedStage],
    options: &RunOptions,
    cancel: watch::Receiver<bool>,
    progress: &dyn ProgressReporter,
) -> Result<RunOutcome> {
    if stages.is_empty() {
        return Err(CuratorError::validation("pipeline has no stages configured"));
    }
    let start = Instant::now();
    let total = stages.len() as u32;

    let reaped = storage
        .mark_abandoned_stages(options.liveness_threshold_secs)
        .await?;
    if reaped > 0 {
        warn!(reaped, "reaped abandoned stage runs before starting");
    }

    // --- Execution row ---
    let execution = match &options.resume_from {
        Some(prev) => {
            if !storage.reopen_execution(&prev.id).await? {
                return Err(CuratorError::Pipeline(format!(
                    "execution {} is not in a resumable state",
                    prev.id
                )));
            }
            // Outcomes at or past the first unfinished stage are stale.
            storage
                .invalidate_subsequent_stages(&prev.id, prev.last_successful_stage + 1)
                .await?;
            storage
                .get_execution(&prev.id)
                .await?
                .ok_or_else(|| CuratorError::Pipeline(format!("execution {} vanished", prev.id)))?
        }
        None => {
            storage
                .create_execution(
                    &options.pipeline_name,
                    &options.run_date,
                    &options.config_snapshot,
                )
                .await?
        }
    };

    // --- Gate ---
    match storage
        .try_start_execution(&execution.id, options.max_concurrent)
        .await?
    {
        GateDecision::Acquired => {}
        GateDecision::Denied => {
            info!(
                execution_id = %execution.id,
                max_concurrent = options.max_concurrent,
                "concurrency gate denied, leaving execution pending"
            );
            return Ok(RunOutcome::Denied {
                execution_id: execution.id,
            });
        }
    }

    let first_stage = execution.last_successful_stage + 1;
    info!(
        execution_id = %execution.id,
        first_stage,
        total,
        "execution admitted"
    );

    // Completed stages from a previous attempt stay byte-for-byte untouched;
    // only the remainder gets fresh pending rows.
    for (idx, stage) in stages.iter().enumerate() {
        let number = idx as u32 + 1;
        if number >= first_stage {
            storage
                .create_stage(&execution.id, number, stage.name())
                .await?;
        }
    }

    // --- Stage walk ---
    for (idx, stage) in stages.iter().enumerate() {
        let number = idx as u32 + 1;
        if number < first_stage {
            continue;
        }

        storage
            .transition_stage(&execution.id, number, StageStatus::Running, None, None)
            .await?;
        progress.stage_started(number, total, stage.name());

        let result = drive_stage(storage, stage, &execution, number, options, &cancel).await;

        match result {
            Ok(metrics_json) => {
                storage
                    .transition_stage(
                        &execution.id,
                        number,
                        StageStatus::Completed,
                        None,
                        metrics_json.as_deref(),
                    )
                    .await?;
                progress.stage_finished(number, stage.name(), StageStatus::Completed);
            }
            Err(e) => {
                let message = e.to_string();
                warn!(
                    execution_id = %execution.id,
                    stage = stage.name(),
                    error = %message,
                    "stage failed"
                );
                storage
                    .transition_stage(
                        &execution.id,
                        number,
                        StageStatus::Failed,
                        Some(&message),
                        None,
                    )
                    .await?;
                progress.stage_finished(number, stage.name(), StageStatus::Failed);

                let status = if number > 1 {
                    ExecutionStatus::Partial
                } else {
                    ExecutionStatus::Failed
                };
                storage.complete_execution(&execution.id, status).await?;

                let report = RunReport {
                    execution_id: execution.id.clone(),
                    status,
                    stages_completed: number - 1,
                    stages_total: total,
                    elapsed: start.elapsed(),
                };
                progress.done(&report);
                return Ok(RunOutcome::Ran(report));
            }
        }
    }

    storage
        .complete_execution(&execution.id, ExecutionStatus::Completed)
        .await?;

    let report = RunReport {
        execution_id: execution.id.clone(),
        status: ExecutionStatus::Completed,
        stages_completed: total,
        stages_total: total,
        elapsed: start.elapsed(),
    };
    progress.done(&report);

    info!(
        execution_id = %report.execution_id,
        stages = report.stages_total,
        elapsed_ms = report.elapsed.as_millis() as u64,
        "pipeline complete"
    );
    Ok(RunOutcome::Ran(report))
}

/// Run one stage to completion while keeping its heartbeat fresh.
///
/// Cancellation drops the stage future (killing any child process spawned
/// with kill-on-drop) and surfaces as a stage failure with an explicit reason.
async fn drive_stage(
    storage: &Storage,
    stage: &BoxedStage,
    execution: &PipelineExecution,
    number: u32,
    options: &RunOptions,
    cancel: &watch::Receiver<bool>,
) -> Result<Option<String>> {
    let ctx = StageContext {
        execution_id: execution.id.clone(),
        run_date: execution.run_date.clone(),
        stage_number: number,
        cancel: cancel.clone(),
    };

    let mut ticker =
        tokio::time::interval(Duration::from_secs(options.heartbeat_interval_secs.max(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await; // first tick resolves immediately

    let run_fut = stage.run(&ctx);
    tokio::pin!(run_fut);
    let mut cancel_watch = cancel.clone();

    loop {
        tokio::select! {
            result = &mut run_fut => {
                return result.map(|outcome| outcome.metrics_json);
            }
            _ = ticker.tick() => {
                storage.heartbeat_stage(&execution.id, number).await?;
            }
            _ = wait_cancelled(&mut cancel_watch) => {
                return Err(CuratorError::Pipeline(format!(
                    "stage {} cancelled by shutdown signal",
                    stage.name()
                )));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::{PipelineStage, StageOutcome};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Scripted stage: counts its runs and fails on demand.
    struct TestStage {
        name: String,
        fail: bool,
        runs: Arc<AtomicUsize>,
    }

    impl TestStage {
        fn ok(name: &str, runs: Arc<AtomicUsize>) -> BoxedStage {
            Box::new(Self {
                name: name.into(),
                fail: false,
                runs,
            })
        }

        fn failing(name: &str, runs: Arc<AtomicUsize>) -> BoxedStage {
            Box::new(Self {
                name: name.into(),
                fail: true,
                runs,
            })
        }
    }

    #[async_trait]
    impl PipelineStage for TestStage {
        fn name(&self) -> &str {
            &self.name
        }

        async fn run(&self, _ctx: &StageContext) -> Result<StageOutcome> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(CuratorError::Pipeline(format!("{} blew up", self.name)))
            } else {
                Ok(StageOutcome {
                    metrics_json: Some(r#"{"items":7}"#.into()),
                })
            }
        }
    }

    /// Stage that blocks until cancelled.
    struct HangingStage;

    #[async_trait]
    impl PipelineStage for HangingStage {
        fn name(&self) -> &str {
            "hanging"
        }

        async fn run(&self, _ctx: &StageContext) -> Result<StageOutcome> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(StageOutcome::default())
        }
    }

    async fn test_storage() -> Storage {
        let tmp =
            std::env::temp_dir().join(format!("curator_core_test_{}.db", uuid::Uuid::now_v7()));
        Storage::open(&tmp).await.expect("open test db")
    }

    fn options() -> RunOptions {
        RunOptions {
            pipeline_name: "curation".into(),
            run_date: "2026-08-29".into(),
            config_snapshot: r#"{"max_concurrent":1}"#.into(),
            max_concurrent: 1,
            heartbeat_interval_secs: 1,
            liveness_threshold_secs: 300,
            resume_from: None,
        }
    }

    #[tokio::test]
    async fn completes_all_stages() {
        let storage = test_storage().await;
        let runs = Arc::new(AtomicUsize::new(0));
        let stages = vec![
            TestStage::ok("extract", runs.clone()),
            TestStage::ok("classify", runs.clone()),
            TestStage::ok("publish", runs.clone()),
        ];
        let (_tx, rx) = watch::channel(false);

        let outcome = run_pipeline(&storage, &stages, &options(), rx, &SilentProgress)
            .await
            .expect("run pipeline");

        let RunOutcome::Ran(report) = outcome else {
            panic!("expected a run")
        };
        assert_eq!(report.status, ExecutionStatus::Completed);
        assert_eq!(report.stages_completed, 3);
        assert_eq!(runs.load(Ordering::SeqCst), 3);

        let exec = storage
            .get_execution(&report.execution_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exec.last_successful_stage, 3);
        let rows = storage.list_stage_runs(&report.execution_id).await.unwrap();
        assert!(rows.iter().all(|r| r.status == StageStatus::Completed));
        assert_eq!(rows[0].metrics_json.as_deref(), Some(r#"{"items":7}"#));
    }

    #[tokio::test]
    async fn mid_pipeline_failure_is_partial() {
        let storage = test_storage().await;
        let runs = Arc::new(AtomicUsize::new(0));
        let stages = vec![
            TestStage::ok("extract", runs.clone()),
            TestStage::failing("classify", runs.clone()),
            TestStage::ok("publish", runs.clone()),
        ];
        let (_tx, rx) = watch::channel(false);

        let outcome = run_pipeline(&storage, &stages, &options(), rx, &SilentProgress)
            .await
            .unwrap();
        let RunOutcome::Ran(report) = outcome else {
            panic!("expected a run")
        };
        assert_eq!(report.status, ExecutionStatus::Partial);
        assert_eq!(report.stages_completed, 1);
        // Stage 3 never ran.
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        let rows = storage.list_stage_runs(&report.execution_id).await.unwrap();
        assert_eq!(rows[1].status, StageStatus::Failed);
        assert!(rows[1].error_message.as_deref().unwrap().contains("blew up"));
        assert_eq!(rows[2].status, StageStatus::Pending);
    }

    #[tokio::test]
    async fn first_stage_failure_is_failed() {
        let storage = test_storage().await;
        let runs = Arc::new(AtomicUsize::new(0));
        let stages = vec![TestStage::failing("extract", runs.clone())];
        let (_tx, rx) = watch::channel(false);

        let outcome = run_pipeline(&storage, &stages, &options(), rx, &SilentProgress)
            .await
            .unwrap();
        let RunOutcome::Ran(report) = outcome else {
            panic!("expected a run")
        };
        assert_eq!(report.status, ExecutionStatus::Failed);
        assert_eq!(report.stages_completed, 0);
    }

    #[tokio::test]
    async fn resume_skips_completed_stages() {
        let storage = test_storage().await;
        let runs = Arc::new(AtomicUsize::new(0));
        let first_attempt = vec![
            TestStage::ok("extract", runs.clone()),
            TestStage::failing("classify", runs.clone()),
        ];
        let (_tx, rx) = watch::channel(false);
        let outcome = run_pipeline(&storage, &first_attempt, &options(), rx, &SilentProgress)
            .await
            .unwrap();
        let RunOutcome::Ran(report) = outcome else {
            panic!("expected a run")
        };
        assert_eq!(report.status, ExecutionStatus::Partial);
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        let failed = storage
            .get_last_failed_execution(Some("curation"))
            .await
            .unwrap()
            .expect("failed execution on record");
        assert_eq!(failed.id, report.execution_id);

        // Second attempt: classify fixed.
        let second_attempt = vec![
            TestStage::ok("extract", runs.clone()),
            TestStage::ok("classify", runs.clone()),
        ];
        let resume_options = RunOptions {
            resume_from: Some(failed),
            ..options()
        };
        let (_tx2, rx2) = watch::channel(false);
        let outcome = run_pipeline(&storage, &second_attempt, &resume_options, rx2, &SilentProgress)
            .await
            .unwrap();
        let RunOutcome::Ran(report2) = outcome else {
            panic!("expected a run")
        };

        assert_eq!(report2.execution_id, report.execution_id);
        assert_eq!(report2.status, ExecutionStatus::Completed);
        // extract did not rerun: 2 runs from attempt one + 1 classify retry.
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gate_denial_runs_nothing() {
        let storage = test_storage().await;
        // Occupy the ceiling with a foreign running execution.
        let blocker = storage
            .create_execution("curation", "2026-08-28", "{}")
            .await
            .unwrap();
        storage.try_start_execution(&blocker.id, 1).await.unwrap();

        let runs = Arc::new(AtomicUsize::new(0));
        let stages = vec![TestStage::ok("extract", runs.clone())];
        let (_tx, rx) = watch::channel(false);

        let outcome = run_pipeline(&storage, &stages, &options(), rx, &SilentProgress)
            .await
            .unwrap();
        let RunOutcome::Denied { execution_id } = outcome else {
            panic!("expected denial")
        };
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        let exec = storage.get_execution(&execution_id).await.unwrap().unwrap();
        assert_eq!(exec.status, ExecutionStatus::Pending);
    }

    #[tokio::test]
    async fn cancellation_fails_the_running_stage() {
        let storage = test_storage().await;
        let stages: Vec<BoxedStage> = vec![Box::new(HangingStage)];
        let (tx, rx) = watch::channel(false);

        let handle = {
            let opts = options();
            tokio::spawn(async move {
                run_pipeline(&storage, &stages, &opts, rx, &SilentProgress).await
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();

        let outcome = handle.await.unwrap().unwrap();
        let RunOutcome::Ran(report) = outcome else {
            panic!("expected a run")
        };
        assert_eq!(report.status, ExecutionStatus::Failed);
    }

    #[tokio::test]
    async fn empty_pipeline_is_a_config_error() {
        let storage = test_storage().await;
        let (_tx, rx) = watch::channel(false);
        let err = run_pipeline(&storage, &[], &options(), rx, &SilentProgress)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no stages"));
    }
}
