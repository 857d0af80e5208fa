//! libSQL execution store for the curation pipeline.
//!
//! The [`Storage`] struct wraps a libSQL database holding pipeline execution
//! records and their per-stage rows. Stage rows are reset in place when a
//! stage is retried; nothing in here ever deletes a row.
//!
//! **Access rules:**
//! - curator CLI: read-write (sole writer) via [`Storage::open`]
//! - external dashboards: read-only via [`Storage::open_readonly`]

mod migrations;

use std::path::Path;

use chrono::{DateTime, Utc};
use curator_shared::{
    CuratorError, ExecutionId, ExecutionStatus, PipelineExecution, Result, StageRun, StageStatus,
};
use libsql::{Connection, Database, params};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Error message written on stage rows reaped by liveness detection.
pub const ABANDONED_REASON: &str = "abandoned: heartbeat older than liveness threshold";

/// Outcome of the concurrency gate. Denial is a normal result, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// The execution was flipped `pending -> running` and may proceed.
    Acquired,
    /// The ceiling is occupied (or the row was not `pending`); retry later.
    Denied,
}

/// Hex SHA-256 of a config snapshot, stored alongside it for audit and dedupe.
pub fn config_fingerprint(config_json: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(config_json.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CuratorError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| CuratorError::Storage(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| CuratorError::Storage(e.to_string()))?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open a database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| CuratorError::Storage(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| CuratorError::Storage(e.to_string()))?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        CuratorError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(CuratorError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Execution operations
    // -----------------------------------------------------------------------

    /// Insert a new `pending` execution with an immutable config snapshot.
    pub async fn create_execution(
        &self,
        pipeline_name: &str,
        run_date: &str,
        config_snapshot: &str,
    ) -> Result<PipelineExecution> {
        self.check_writable()?;
        let id = ExecutionId::new().to_string();
        let now = Utc::now();
        let fingerprint = config_fingerprint(config_snapshot);
        self.conn
            .execute(
                "INSERT INTO pipeline_executions
                   (id, pipeline_name, run_date, config_snapshot, config_fingerprint,
                    status, started_at, last_successful_stage)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6, 0)",
                params![
                    id.as_str(),
                    pipeline_name,
                    run_date,
                    config_snapshot,
                    fingerprint.as_str(),
                    now.to_rfc3339()
                ],
            )
            .await
            .map_err(|e| CuratorError::Storage(e.to_string()))?;

        Ok(PipelineExecution {
            id,
            pipeline_name: pipeline_name.to_string(),
            run_date: run_date.to_string(),
            config_snapshot: config_snapshot.to_string(),
            status: ExecutionStatus::Pending,
            started_at: now,
            completed_at: None,
            last_successful_stage: 0,
        })
    }

    /// Get an execution by ID.
    pub async fn get_execution(&self, execution_id: &str) -> Result<Option<PipelineExecution>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, pipeline_name, run_date, config_snapshot, status,
                        started_at, completed_at, last_successful_stage
                 FROM pipeline_executions WHERE id = ?1",
                params![execution_id],
            )
            .await
            .map_err(|e| CuratorError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_execution(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(CuratorError::Storage(e.to_string())),
        }
    }

    /// Most recent `failed` or `partial` execution, optionally per pipeline.
    pub async fn get_last_failed_execution(
        &self,
        pipeline_name: Option<&str>,
    ) -> Result<Option<PipelineExecution>> {
        let sql = "SELECT id, pipeline_name, run_date, config_snapshot, status,
                          started_at, completed_at, last_successful_stage
                   FROM pipeline_executions
                   WHERE status IN ('failed', 'partial')
                     AND (?1 IS NULL OR pipeline_name = ?1)
                   ORDER BY started_at DESC
                   LIMIT 1";
        let mut rows = self
            .conn
            .query(sql, params![pipeline_name])
            .await
            .map_err(|e| CuratorError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_execution(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(CuratorError::Storage(e.to_string())),
        }
    }

    /// List recent executions, newest first.
    pub async fn list_executions(
        &self,
        pipeline_name: Option<&str>,
        limit: u32,
    ) -> Result<Vec<PipelineExecution>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, pipeline_name, run_date, config_snapshot, status,
                        started_at, completed_at, last_successful_stage
                 FROM pipeline_executions
                 WHERE (?1 IS NULL OR pipeline_name = ?1)
                 ORDER BY started_at DESC
                 LIMIT ?2",
                params![pipeline_name, limit],
            )
            .await
            .map_err(|e| CuratorError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_execution(&row)?);
        }
        Ok(results)
    }

    /// Reopen a `failed` or `partial` execution for resume.
    ///
    /// Flips it back to `pending` so it must pass the gate again. Returns
    /// whether the row was actually reopened.
    pub async fn reopen_execution(&self, execution_id: &str) -> Result<bool> {
        self.check_writable()?;
        let affected = self
            .conn
            .execute(
                "UPDATE pipeline_executions
                 SET status = 'pending', completed_at = NULL
                 WHERE id = ?1 AND status IN ('failed', 'partial')",
                params![execution_id],
            )
            .await
            .map_err(|e| CuratorError::Storage(e.to_string()))?;
        Ok(affected == 1)
    }

    /// Finalize an execution as completed, partial, or failed.
    pub async fn complete_execution(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
    ) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "UPDATE pipeline_executions
                 SET status = ?1, completed_at = ?2
                 WHERE id = ?3",
                params![status.as_str(), now.as_str(), execution_id],
            )
            .await
            .map_err(|e| CuratorError::Storage(e.to_string()))?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Concurrency gate
    // -----------------------------------------------------------------------

    /// Admit an execution if the running-execution ceiling permits.
    ///
    /// Read and write happen inside one UPDATE, so two racing callers can
    /// never both be admitted past the ceiling. The row must be `pending`;
    /// anything else is a denial. The decision is read from the statement's
    /// own RETURNING rows rather than the connection-wide affected-row
    /// counter, which concurrent statements on a shared connection can
    /// clobber.
    pub async fn try_start_execution(
        &self,
        execution_id: &str,
        max_running: u32,
    ) -> Result<GateDecision> {
        self.check_writable()?;
        let mut rows = self
            .conn
            .query(
                "UPDATE pipeline_executions
                 SET status = 'running'
                 WHERE id = ?1
                   AND status = 'pending'
                   AND (SELECT COUNT(*) FROM pipeline_executions
                        WHERE status = 'running' AND id != ?1) < ?2
                 RETURNING id",
                params![execution_id, max_running],
            )
            .await
            .map_err(|e| CuratorError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(_)) => Ok(GateDecision::Acquired),
            Ok(None) => Ok(GateDecision::Denied),
            Err(e) => Err(CuratorError::Storage(e.to_string())),
        }
    }

    /// Convert `running` stages with stale heartbeats to `failed`, then fail
    /// their executions so the normal resume path can pick them up. Also
    /// fails `running` executions old enough to be stale that have no live
    /// (`pending`/`running`) stage rows left, so an orphaned execution cannot
    /// occupy the concurrency ceiling forever.
    ///
    /// Returns the number of stage rows reaped.
    pub async fn mark_abandoned_stages(&self, liveness_threshold_secs: u64) -> Result<u64> {
        self.check_writable()?;
        let now = Utc::now();
        let cutoff = (now - chrono::Duration::seconds(liveness_threshold_secs as i64)).to_rfc3339();

        let reaped = self
            .conn
            .execute(
                "UPDATE stage_runs
                 SET status = 'failed', error_message = ?1, completed_at = ?2
                 WHERE status = 'running'
                   AND (heartbeat_at IS NULL OR heartbeat_at < ?3)",
                params![ABANDONED_REASON, now.to_rfc3339(), cutoff.as_str()],
            )
            .await
            .map_err(|e| CuratorError::Storage(e.to_string()))?;

        if reaped > 0 {
            self.conn
                .execute(
                    "UPDATE pipeline_executions
                     SET status = 'failed', completed_at = ?1
                     WHERE status = 'running'
                       AND id IN (SELECT execution_id FROM stage_runs
                                  WHERE status = 'failed' AND error_message = ?2)",
                    params![now.to_rfc3339(), ABANDONED_REASON],
                )
                .await
                .map_err(|e| CuratorError::Storage(e.to_string()))?;
        }

        // Orphans: executions flipped to running that never made stage
        // progress (or whose stages already finished without finalization).
        self.conn
            .execute(
                "UPDATE pipeline_executions
                 SET status = 'failed', completed_at = ?1
                 WHERE status = 'running'
                   AND started_at < ?2
                   AND NOT EXISTS (SELECT 1 FROM stage_runs
                                   WHERE execution_id = pipeline_executions.id
                                     AND status IN ('pending', 'running'))",
                params![now.to_rfc3339(), cutoff.as_str()],
            )
            .await
            .map_err(|e| CuratorError::Storage(e.to_string()))?;

        Ok(reaped)
    }

    // -----------------------------------------------------------------------
    // Stage operations
    // -----------------------------------------------------------------------

    /// Create the stage row, or reset it to `pending` if it already exists.
    ///
    /// `UNIQUE(execution_id, stage_number)` plus this upsert keeps exactly one
    /// row per stage across any number of retries.
    pub async fn create_stage(
        &self,
        execution_id: &str,
        stage_number: u32,
        name: &str,
    ) -> Result<()> {
        self.check_writable()?;
        let id = Uuid::now_v7().to_string();
        self.conn
            .execute(
                "INSERT INTO stage_runs (id, execution_id, stage_number, name, status)
                 VALUES (?1, ?2, ?3, ?4, 'pending')
                 ON CONFLICT(execution_id, stage_number) DO UPDATE SET
                   name = excluded.name,
                   status = 'pending',
                   started_at = NULL,
                   completed_at = NULL,
                   heartbeat_at = NULL,
                   error_message = NULL,
                   metrics_json = NULL",
                params![id.as_str(), execution_id, stage_number, name],
            )
            .await
            .map_err(|e| CuratorError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Move a stage to `running`, `completed`, or `failed`.
    ///
    /// Completion also advances the execution's `last_successful_stage`.
    pub async fn transition_stage(
        &self,
        execution_id: &str,
        stage_number: u32,
        status: StageStatus,
        error_message: Option<&str>,
        metrics_json: Option<&str>,
    ) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();

        match status {
            StageStatus::Pending => {
                return Err(CuratorError::Storage(
                    "stages return to pending only through invalidation".into(),
                ));
            }
            StageStatus::Running => {
                self.conn
                    .execute(
                        "UPDATE stage_runs
                         SET status = 'running', started_at = ?1, heartbeat_at = ?1
                         WHERE execution_id = ?2 AND stage_number = ?3",
                        params![now.as_str(), execution_id, stage_number],
                    )
                    .await
                    .map_err(|e| CuratorError::Storage(e.to_string()))?;
            }
            StageStatus::Completed | StageStatus::Failed => {
                self.conn
                    .execute(
                        "UPDATE stage_runs
                         SET status = ?1, completed_at = ?2,
                             error_message = ?3, metrics_json = ?4
                         WHERE execution_id = ?5 AND stage_number = ?6",
                        params![
                            status.as_str(),
                            now.as_str(),
                            error_message,
                            metrics_json,
                            execution_id,
                            stage_number
                        ],
                    )
                    .await
                    .map_err(|e| CuratorError::Storage(e.to_string()))?;

                if status == StageStatus::Completed {
                    self.conn
                        .execute(
                            "UPDATE pipeline_executions
                             SET last_successful_stage = MAX(last_successful_stage, ?1)
                             WHERE id = ?2",
                            params![stage_number, execution_id],
                        )
                        .await
                        .map_err(|e| CuratorError::Storage(e.to_string()))?;
                }
            }
        }
        Ok(())
    }

    /// Refresh the liveness timestamp of a running stage.
    pub async fn heartbeat_stage(&self, execution_id: &str, stage_number: u32) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "UPDATE stage_runs
                 SET heartbeat_at = ?1
                 WHERE execution_id = ?2 AND stage_number = ?3 AND status = 'running'",
                params![now.as_str(), execution_id, stage_number],
            )
            .await
            .map_err(|e| CuratorError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Reset stages `>= from_stage` to `pending`, leaving earlier stages
    /// byte-for-byte untouched.
    ///
    /// Keeps completed stage numbers contiguous from 1: anything at or past
    /// the invalidation point loses its outcome, so `last_successful_stage`
    /// is clamped to `from_stage - 1`.
    pub async fn invalidate_subsequent_stages(
        &self,
        execution_id: &str,
        from_stage: u32,
    ) -> Result<u64> {
        self.check_writable()?;
        let affected = self
            .conn
            .execute(
                "UPDATE stage_runs
                 SET status = 'pending', started_at = NULL, completed_at = NULL,
                     heartbeat_at = NULL, error_message = NULL, metrics_json = NULL
                 WHERE execution_id = ?1 AND stage_number >= ?2",
                params![execution_id, from_stage],
            )
            .await
            .map_err(|e| CuratorError::Storage(e.to_string()))?;

        self.conn
            .execute(
                "UPDATE pipeline_executions
                 SET last_successful_stage = MIN(last_successful_stage, ?1)
                 WHERE id = ?2",
                params![from_stage.saturating_sub(1), execution_id],
            )
            .await
            .map_err(|e| CuratorError::Storage(e.to_string()))?;
        Ok(affected)
    }

    /// List all stage rows of an execution in stage order.
    pub async fn list_stage_runs(&self, execution_id: &str) -> Result<Vec<StageRun>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, execution_id, stage_number, name, status,
                        started_at, completed_at, heartbeat_at, error_message, metrics_json
                 FROM stage_runs
                 WHERE execution_id = ?1
                 ORDER BY stage_number",
                params![execution_id],
            )
            .await
            .map_err(|e| CuratorError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_stage_run(&row)?);
        }
        Ok(results)
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| CuratorError::Storage(format!("invalid timestamp: {e}")))
}

fn get_string(row: &libsql::Row, idx: i32) -> Result<String> {
    row.get::<String>(idx)
        .map_err(|e| CuratorError::Storage(e.to_string()))
}

fn get_optional_ts(row: &libsql::Row, idx: i32) -> Option<DateTime<Utc>> {
    row.get::<String>(idx)
        .ok()
        .and_then(|s| parse_ts(&s).ok())
}

fn row_to_execution(row: &libsql::Row) -> Result<PipelineExecution> {
    let status: ExecutionStatus = get_string(row, 4)?
        .parse()
        .map_err(CuratorError::Storage)?;
    Ok(PipelineExecution {
        id: get_string(row, 0)?,
        pipeline_name: get_string(row, 1)?,
        run_date: get_string(row, 2)?,
        config_snapshot: get_string(row, 3)?,
        status,
        started_at: parse_ts(&get_string(row, 5)?)?,
        completed_at: get_optional_ts(row, 6),
        last_successful_stage: row
            .get::<u32>(7)
            .map_err(|e| CuratorError::Storage(e.to_string()))?,
    })
}

fn row_to_stage_run(row: &libsql::Row) -> Result<StageRun> {
    let status: StageStatus = get_string(row, 4)?
        .parse()
        .map_err(CuratorError::Storage)?;
    Ok(StageRun {
        id: get_string(row, 0)?,
        execution_id: get_string(row, 1)?,
        stage_number: row
            .get::<u32>(2)
            .map_err(|e| CuratorError::Storage(e.to_string()))?,
        name: get_string(row, 3)?,
        status,
        started_at: get_optional_ts(row, 5),
        completed_at: get_optional_ts(row, 6),
        heartbeat_at: get_optional_ts(row, 7),
        error_message: row.get::<String>(8).ok(),
        metrics_json: row.get::<String>(9).ok(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Create a temp file storage for testing.
    async fn test_storage() -> Storage {
        let tmp = std::env::temp_dir().join(format!("curator_test_{}.db", Uuid::now_v7()));
        Storage::open(&tmp).await.expect("open test db")
    }

    async fn seeded_execution(storage: &Storage) -> PipelineExecution {
        storage
            .create_execution("curation", "2026-08-29", r#"{"max_concurrent":1}"#)
            .await
            .expect("create execution")
    }

    #[tokio::test]
    async fn open_and_migrate() {
        let storage = test_storage().await;
        let version = storage.get_schema_version().await;
        assert_eq!(version, 1);
    }

    #[tokio::test]
    async fn idempotent_migration() {
        let tmp = std::env::temp_dir().join(format!("curator_test_{}.db", Uuid::now_v7()));
        let s1 = Storage::open(&tmp).await.expect("first open");
        drop(s1);
        let s2 = Storage::open(&tmp).await.expect("second open");
        assert_eq!(s2.get_schema_version().await, 1);
    }

    #[test]
    fn fingerprint_is_stable_hex() {
        let a = config_fingerprint(r#"{"x":1}"#);
        let b = config_fingerprint(r#"{"x":1}"#);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, config_fingerprint(r#"{"x":2}"#));
    }

    #[tokio::test]
    async fn execution_lifecycle() {
        let storage = test_storage().await;
        let exec = seeded_execution(&storage).await;
        assert_eq!(exec.status, ExecutionStatus::Pending);
        assert_eq!(exec.last_successful_stage, 0);

        let found = storage.get_execution(&exec.id).await.unwrap().unwrap();
        assert_eq!(found.run_date, "2026-08-29");
        assert_eq!(found.config_snapshot, r#"{"max_concurrent":1}"#);

        let decision = storage.try_start_execution(&exec.id, 1).await.unwrap();
        assert_eq!(decision, GateDecision::Acquired);
        let found = storage.get_execution(&exec.id).await.unwrap().unwrap();
        assert_eq!(found.status, ExecutionStatus::Running);

        storage
            .complete_execution(&exec.id, ExecutionStatus::Partial)
            .await
            .unwrap();
        let found = storage.get_execution(&exec.id).await.unwrap().unwrap();
        assert_eq!(found.status, ExecutionStatus::Partial);
        assert!(found.completed_at.is_some());
    }

    #[tokio::test]
    async fn gate_admits_up_to_ceiling() {
        let storage = test_storage().await;
        let first = seeded_execution(&storage).await;
        let second = seeded_execution(&storage).await;

        assert_eq!(
            storage.try_start_execution(&first.id, 1).await.unwrap(),
            GateDecision::Acquired
        );
        // Ceiling of 1 is occupied.
        assert_eq!(
            storage.try_start_execution(&second.id, 1).await.unwrap(),
            GateDecision::Denied
        );
        let found = storage.get_execution(&second.id).await.unwrap().unwrap();
        assert_eq!(found.status, ExecutionStatus::Pending);

        storage
            .complete_execution(&first.id, ExecutionStatus::Completed)
            .await
            .unwrap();
        assert_eq!(
            storage.try_start_execution(&second.id, 1).await.unwrap(),
            GateDecision::Acquired
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn gate_admits_exactly_one_under_concurrent_attempts() {
        let storage = std::sync::Arc::new(test_storage().await);

        let mut ids = Vec::new();
        for _ in 0..8 {
            ids.push(seeded_execution(&storage).await.id);
        }

        let mut handles = Vec::new();
        for id in &ids {
            let storage = std::sync::Arc::clone(&storage);
            let id = id.clone();
            handles.push(tokio::spawn(async move {
                storage.try_start_execution(&id, 1).await.unwrap()
            }));
        }

        let mut acquired = 0;
        for handle in handles {
            if handle.await.unwrap() == GateDecision::Acquired {
                acquired += 1;
            }
        }
        assert_eq!(acquired, 1, "exactly one concurrent starter must be admitted");

        // The admitted caller's view and the database must agree.
        let mut running = 0;
        for id in &ids {
            let exec = storage.get_execution(id).await.unwrap().unwrap();
            if exec.status == ExecutionStatus::Running {
                running += 1;
            }
        }
        assert_eq!(running, 1);
    }

    #[tokio::test]
    async fn gate_rejects_non_pending_rows() {
        let storage = test_storage().await;
        let exec = seeded_execution(&storage).await;
        storage
            .complete_execution(&exec.id, ExecutionStatus::Failed)
            .await
            .unwrap();
        assert_eq!(
            storage.try_start_execution(&exec.id, 4).await.unwrap(),
            GateDecision::Denied
        );
    }

    #[tokio::test]
    async fn stage_row_resets_in_place() {
        let storage = test_storage().await;
        let exec = seeded_execution(&storage).await;

        storage.create_stage(&exec.id, 1, "extract").await.unwrap();
        storage
            .transition_stage(&exec.id, 1, StageStatus::Running, None, None)
            .await
            .unwrap();
        storage
            .transition_stage(&exec.id, 1, StageStatus::Failed, Some("boom"), None)
            .await
            .unwrap();

        // Re-creating the same stage resets the row instead of duplicating it.
        storage.create_stage(&exec.id, 1, "extract").await.unwrap();

        let stages = storage.list_stage_runs(&exec.id).await.unwrap();
        assert_eq!(stages.len(), 1);
        assert_eq!(stages[0].status, StageStatus::Pending);
        assert!(stages[0].error_message.is_none());
        assert!(stages[0].started_at.is_none());
        assert!(stages[0].completed_at.is_none());
    }

    #[tokio::test]
    async fn completion_advances_last_successful_stage() {
        let storage = test_storage().await;
        let exec = seeded_execution(&storage).await;

        for (number, name) in [(1, "extract"), (2, "classify"), (3, "publish")] {
            storage.create_stage(&exec.id, number, name).await.unwrap();
            storage
                .transition_stage(&exec.id, number, StageStatus::Running, None, None)
                .await
                .unwrap();
            storage
                .transition_stage(
                    &exec.id,
                    number,
                    StageStatus::Completed,
                    None,
                    Some(r#"{"urls":42}"#),
                )
                .await
                .unwrap();
        }

        let found = storage.get_execution(&exec.id).await.unwrap().unwrap();
        assert_eq!(found.last_successful_stage, 3);
        let stages = storage.list_stage_runs(&exec.id).await.unwrap();
        assert_eq!(stages[2].metrics_json.as_deref(), Some(r#"{"urls":42}"#));
    }

    #[tokio::test]
    async fn invalidation_resets_later_stages_only() {
        let storage = test_storage().await;
        let exec = seeded_execution(&storage).await;

        for (number, name) in [
            (1, "extract"),
            (2, "classify"),
            (3, "discover"),
            (4, "merge"),
            (5, "publish"),
        ] {
            storage.create_stage(&exec.id, number, name).await.unwrap();
        }
        for number in [1, 2] {
            storage
                .transition_stage(&exec.id, number, StageStatus::Completed, None, None)
                .await
                .unwrap();
        }
        storage
            .transition_stage(&exec.id, 3, StageStatus::Failed, Some("timeout"), None)
            .await
            .unwrap();

        let before = storage.list_stage_runs(&exec.id).await.unwrap();
        let reset = storage
            .invalidate_subsequent_stages(&exec.id, 3)
            .await
            .unwrap();
        assert_eq!(reset, 3);

        let after = storage.list_stage_runs(&exec.id).await.unwrap();
        // Stages 1 and 2 untouched, including timestamps.
        for i in 0..2 {
            assert_eq!(after[i].status, StageStatus::Completed);
            assert_eq!(after[i].completed_at, before[i].completed_at);
        }
        // Stages 3..5 fully reset.
        for stage in &after[2..] {
            assert_eq!(stage.status, StageStatus::Pending);
            assert!(stage.error_message.is_none());
            assert!(stage.completed_at.is_none());
        }
        let found = storage.get_execution(&exec.id).await.unwrap().unwrap();
        assert_eq!(found.last_successful_stage, 2);
    }

    #[tokio::test]
    async fn resume_path_finds_latest_failure() {
        let storage = test_storage().await;
        let older = seeded_execution(&storage).await;
        storage
            .complete_execution(&older.id, ExecutionStatus::Failed)
            .await
            .unwrap();
        let newer = seeded_execution(&storage).await;
        storage
            .complete_execution(&newer.id, ExecutionStatus::Partial)
            .await
            .unwrap();
        let _done = seeded_execution(&storage).await;

        let found = storage
            .get_last_failed_execution(Some("curation"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, newer.id);

        assert!(storage.reopen_execution(&found.id).await.unwrap());
        let reopened = storage.get_execution(&found.id).await.unwrap().unwrap();
        assert_eq!(reopened.status, ExecutionStatus::Pending);
        assert!(reopened.completed_at.is_none());

        // Only failed/partial rows can be reopened.
        assert!(!storage.reopen_execution(&found.id).await.unwrap());
    }

    #[tokio::test]
    async fn abandoned_stages_are_reaped() {
        let storage = test_storage().await;
        let exec = seeded_execution(&storage).await;
        storage.try_start_execution(&exec.id, 1).await.unwrap();
        storage.create_stage(&exec.id, 1, "extract").await.unwrap();
        storage
            .transition_stage(&exec.id, 1, StageStatus::Running, None, None)
            .await
            .unwrap();

        // Fresh heartbeat: nothing to reap.
        assert_eq!(storage.mark_abandoned_stages(300).await.unwrap(), 0);

        // Age the heartbeat past the threshold.
        let stale = (Utc::now() - chrono::Duration::seconds(600)).to_rfc3339();
        storage
            .conn
            .execute(
                "UPDATE stage_runs SET heartbeat_at = ?1 WHERE execution_id = ?2",
                params![stale.as_str(), exec.id.as_str()],
            )
            .await
            .unwrap();

        assert_eq!(storage.mark_abandoned_stages(300).await.unwrap(), 1);
        let stages = storage.list_stage_runs(&exec.id).await.unwrap();
        assert_eq!(stages[0].status, StageStatus::Failed);
        assert_eq!(stages[0].error_message.as_deref(), Some(ABANDONED_REASON));
        let found = storage.get_execution(&exec.id).await.unwrap().unwrap();
        assert_eq!(found.status, ExecutionStatus::Failed);
    }

    #[tokio::test]
    async fn stale_running_execution_without_stages_is_reaped() {
        let storage = test_storage().await;
        let exec = seeded_execution(&storage).await;
        assert_eq!(
            storage.try_start_execution(&exec.id, 1).await.unwrap(),
            GateDecision::Acquired
        );

        // Still fresh: a running execution without stage rows yet is left alone.
        storage.mark_abandoned_stages(300).await.unwrap();
        let found = storage.get_execution(&exec.id).await.unwrap().unwrap();
        assert_eq!(found.status, ExecutionStatus::Running);

        // Age it past the liveness threshold with no stage progress.
        let stale = (Utc::now() - chrono::Duration::seconds(600)).to_rfc3339();
        storage
            .conn
            .execute(
                "UPDATE pipeline_executions SET started_at = ?1 WHERE id = ?2",
                params![stale.as_str(), exec.id.as_str()],
            )
            .await
            .unwrap();

        storage.mark_abandoned_stages(300).await.unwrap();
        let found = storage.get_execution(&exec.id).await.unwrap().unwrap();
        assert_eq!(found.status, ExecutionStatus::Failed);

        // The ceiling is free again.
        let next = seeded_execution(&storage).await;
        assert_eq!(
            storage.try_start_execution(&next.id, 1).await.unwrap(),
            GateDecision::Acquired
        );
    }

    #[tokio::test]
    async fn readonly_rejects_writes() {
        let tmp = std::env::temp_dir().join(format!("curator_test_{}.db", Uuid::now_v7()));
        let rw = Storage::open(&tmp).await.unwrap();
        seeded_execution(&rw).await;
        drop(rw);

        let ro = Storage::open_readonly(&tmp).await.unwrap();
        let result = ro.create_execution("curation", "2026-08-29", "{}").await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("read-only"));
    }
}
