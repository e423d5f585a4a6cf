use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde_json::{Map, Value};

use super::models::*;
use super::state::{PHASES, can_transition, phase_name};

/// Async-safe handle to the pipeline database.
///
/// Wraps `PipelineDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O never
/// ties up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<PipelineDb>>,
}

impl DbHandle {
    pub fn new(db: PipelineDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&PipelineDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. Only for startup and tests.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, PipelineDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

/// Fields appended to the learning log when an approval is resolved.
#[derive(Debug, Clone)]
pub struct NewLearningEntry {
    pub run_id: i64,
    pub phase_number: u32,
    pub agent_name: String,
    pub subject: String,
    pub output_summary: String,
    pub feedback: Decision,
}

/// One entry of a batch toggle update; `None` leaves a flag as it is.
#[derive(Debug, Clone)]
pub struct ToggleChange {
    pub phase_number: u32,
    pub phase_name: String,
    pub requires_approval: Option<bool>,
    pub is_enabled: Option<bool>,
}

/// Everything written atomically when a reviewer resolves an approval.
#[derive(Debug, Clone)]
pub struct ResolutionRecord {
    pub approval_id: i64,
    pub status: ApprovalStatus,
    pub reviewer_notes: Option<String>,
    pub edited_output: Option<Value>,
    pub phase_status: PhaseStatus,
    pub learning: NewLearningEntry,
}

pub struct PipelineDb {
    conn: Connection,
}

impl PipelineDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create database directory {}", parent.display())
            })?;
        }
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        conn.busy_timeout(Duration::from_secs(5))
            .context("Failed to set busy timeout")?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })
        .context("Failed to enable WAL journal")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Run raw SQL against the connection (tests only).
    #[cfg(test)]
    pub(crate) fn execute_batch(&self, sql: &str) -> Result<()> {
        self.conn
            .execute_batch(sql)
            .context("Failed to execute SQL batch")
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS pipeline_runs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    status TEXT NOT NULL DEFAULT 'pending',
                    current_phase INTEGER NOT NULL DEFAULT 1,
                    subject TEXT NOT NULL,
                    topic TEXT,
                    config TEXT NOT NULL DEFAULT '{}',
                    error_message TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    started_at TEXT,
                    completed_at TEXT
                );

                CREATE TABLE IF NOT EXISTS phase_results (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_id INTEGER NOT NULL REFERENCES pipeline_runs(id) ON DELETE CASCADE,
                    phase_number INTEGER NOT NULL,
                    agent_name TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    input_snapshot TEXT,
                    output_snapshot TEXT,
                    duration_seconds REAL,
                    error_log TEXT,
                    trace_id TEXT NOT NULL,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    completed_at TEXT,
                    approved_at TEXT
                );

                CREATE TABLE IF NOT EXISTS approvals (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    phase_result_id INTEGER NOT NULL UNIQUE REFERENCES phase_results(id) ON DELETE CASCADE,
                    run_id INTEGER NOT NULL REFERENCES pipeline_runs(id) ON DELETE CASCADE,
                    phase_number INTEGER NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    reviewer_notes TEXT,
                    original_output TEXT,
                    edited_output TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    resolved_at TEXT
                );

                CREATE TABLE IF NOT EXISTS phase_toggles (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    phase_number INTEGER NOT NULL UNIQUE,
                    phase_name TEXT NOT NULL,
                    requires_approval INTEGER NOT NULL DEFAULT 1,
                    is_enabled INTEGER NOT NULL DEFAULT 1
                );

                CREATE TABLE IF NOT EXISTS learning_log (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_id INTEGER NOT NULL REFERENCES pipeline_runs(id) ON DELETE CASCADE,
                    phase_number INTEGER NOT NULL,
                    agent_name TEXT NOT NULL,
                    subject TEXT NOT NULL,
                    output_summary TEXT NOT NULL,
                    feedback TEXT NOT NULL,
                    performance_score REAL,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS dispatch_tasks (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    kind TEXT NOT NULL,
                    run_id INTEGER NOT NULL REFERENCES pipeline_runs(id) ON DELETE CASCADE,
                    phase_number INTEGER,
                    status TEXT NOT NULL DEFAULT 'queued',
                    error TEXT,
                    enqueued_at TEXT NOT NULL DEFAULT (datetime('now')),
                    started_at TEXT,
                    finished_at TEXT
                );

                CREATE UNIQUE INDEX IF NOT EXISTS idx_phase_results_active
                    ON phase_results(run_id, phase_number)
                    WHERE status IN ('running', 'waiting_approval', 'approved');
                CREATE INDEX IF NOT EXISTS idx_phase_results_run ON phase_results(run_id);
                CREATE INDEX IF NOT EXISTS idx_approvals_status ON approvals(status);
                CREATE INDEX IF NOT EXISTS idx_learning_subject_phase ON learning_log(subject, phase_number);
                CREATE INDEX IF NOT EXISTS idx_dispatch_tasks_status ON dispatch_tasks(status, id);
                ",
            )
            .context("Failed to run migrations")?;
        Ok(())
    }

    // ── Pipeline runs ─────────────────────────────────────────────────

    pub fn create_run(
        &self,
        subject: &str,
        topic: Option<&str>,
        config: &Map<String, Value>,
    ) -> Result<Run> {
        let config_json = serde_json::to_string(config).context("Failed to serialize run config")?;
        self.conn
            .execute(
                "INSERT INTO pipeline_runs (subject, topic, config) VALUES (?1, ?2, ?3)",
                params![subject, topic, config_json],
            )
            .context("Failed to insert pipeline run")?;
        let id = self.conn.last_insert_rowid();
        self.get_run(id)?.context("Pipeline run not found after insert")
    }

    pub fn get_run(&self, id: i64) -> Result<Option<Run>> {
        let sql = format!("SELECT {RUN_COLUMNS} FROM pipeline_runs WHERE id = ?1");
        Ok(self.query_runs(&sql, params![id])?.into_iter().next())
    }

    /// Newest first, optionally filtered by status.
    pub fn list_runs(&self, status: Option<RunStatus>, limit: i64, offset: i64) -> Result<Vec<Run>> {
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM pipeline_runs
             WHERE (?1 IS NULL OR status = ?1)
             ORDER BY id DESC LIMIT ?2 OFFSET ?3"
        );
        self.query_runs(&sql, params![status.map(|s| s.as_str()), limit, offset])
    }

    /// Compare-and-set the run status. Returns false when the run was not in
    /// `from` (someone else moved it first). `message` is stored as the error
    /// message; moving back to `pending` clears it.
    pub fn transition_run(
        &self,
        id: i64,
        from: RunStatus,
        to: RunStatus,
        message: Option<&str>,
    ) -> Result<bool> {
        if !can_transition(from, to) {
            bail!("Illegal run transition {} -> {}", from, to);
        }
        let extra = match to {
            RunStatus::Running => {
                "error_message = COALESCE(?4, error_message), started_at = COALESCE(started_at, datetime('now'))"
            }
            RunStatus::Paused => "error_message = COALESCE(?4, error_message)",
            RunStatus::Completed | RunStatus::Failed => {
                "error_message = COALESCE(?4, error_message), completed_at = datetime('now')"
            }
            RunStatus::Pending => "error_message = ?4, completed_at = NULL",
        };
        let sql = format!(
            "UPDATE pipeline_runs SET status = ?1, {extra} WHERE id = ?2 AND status = ?3"
        );
        let changed = self
            .conn
            .execute(&sql, params![to.as_str(), id, from.as_str(), message])
            .context("Failed to update pipeline run status")?;
        Ok(changed == 1)
    }

    /// Compare-and-set `running -> completed`, moving `current_phase` to
    /// `final_phase` (one past the last phase) in the same statement.
    pub fn complete_run(&self, id: i64, final_phase: u32) -> Result<bool> {
        if !can_transition(RunStatus::Running, RunStatus::Completed) {
            bail!("Illegal run transition running -> completed");
        }
        let changed = self
            .conn
            .execute(
                "UPDATE pipeline_runs SET status = 'completed', current_phase = ?2,
                     completed_at = datetime('now')
                 WHERE id = ?1 AND status = 'running'",
                params![id, final_phase],
            )
            .context("Failed to complete pipeline run")?;
        Ok(changed == 1)
    }

    /// Record the phase the driver is working on. Only applies to running runs.
    pub fn set_current_phase(&self, id: i64, phase: u32) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE pipeline_runs SET current_phase = ?1 WHERE id = ?2 AND status = 'running'",
                params![phase, id],
            )
            .context("Failed to update current phase")?;
        Ok(changed == 1)
    }

    /// Move a paused run back to `running` and complete its approved attempt
    /// in one transaction. Returns false if another resumer got there first.
    pub fn resume_approved_phase(&self, run_id: i64, phase_result_id: i64) -> Result<bool> {
        if !can_transition(RunStatus::Paused, RunStatus::Running)
            || !can_transition(PhaseStatus::Approved, PhaseStatus::Completed)
        {
            bail!("Illegal resume transition");
        }
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin resume transaction")?;
        let run_changed = tx
            .execute(
                "UPDATE pipeline_runs SET status = 'running' WHERE id = ?1 AND status = 'paused'",
                params![run_id],
            )
            .context("Failed to resume pipeline run")?;
        if run_changed == 0 {
            return Ok(false);
        }
        let phase_changed = tx
            .execute(
                "UPDATE phase_results SET status = 'completed', completed_at = datetime('now')
                 WHERE id = ?1 AND run_id = ?2 AND status = 'approved'",
                params![phase_result_id, run_id],
            )
            .context("Failed to complete approved phase")?;
        if phase_changed == 0 {
            return Ok(false);
        }
        tx.commit().context("Failed to commit resume")?;
        Ok(true)
    }

    /// Move a failed run back to `pending` and close the attempts it left
    /// open: running attempts fail, attempts under review are rejected with
    /// their approval, approved attempts complete and the run moves past them.
    /// Returns false if the run was not `failed`.
    pub fn restart_run(&self, run_id: i64, note: &str) -> Result<bool> {
        let edges_ok = can_transition(RunStatus::Failed, RunStatus::Pending)
            && can_transition(PhaseStatus::Running, PhaseStatus::Failed)
            && can_transition(PhaseStatus::WaitingApproval, PhaseStatus::Rejected)
            && can_transition(PhaseStatus::Approved, PhaseStatus::Completed);
        if !edges_ok {
            bail!("Illegal restart transition");
        }
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin restart transaction")?;
        let changed = tx
            .execute(
                "UPDATE pipeline_runs SET status = 'pending', error_message = NULL, completed_at = NULL
                 WHERE id = ?1 AND status = 'failed'",
                params![run_id],
            )
            .context("Failed to restart pipeline run")?;
        if changed == 0 {
            return Ok(false);
        }
        tx.execute(
            "UPDATE phase_results SET status = 'failed', error_log = COALESCE(error_log, ?2),
                 completed_at = datetime('now')
             WHERE run_id = ?1 AND status = 'running'",
            params![run_id, note],
        )
        .context("Failed to close running attempts")?;
        tx.execute(
            "UPDATE approvals SET status = 'rejected', reviewer_notes = COALESCE(reviewer_notes, ?2),
                 resolved_at = datetime('now')
             WHERE run_id = ?1 AND status = 'pending'",
            params![run_id, note],
        )
        .context("Failed to close pending approvals")?;
        tx.execute(
            "UPDATE phase_results SET status = 'rejected'
             WHERE run_id = ?1 AND status = 'waiting_approval'",
            params![run_id],
        )
        .context("Failed to close attempts under review")?;
        let last_approved: Option<u32> = tx
            .query_row(
                "SELECT MAX(phase_number) FROM phase_results WHERE run_id = ?1 AND status = 'approved'",
                params![run_id],
                |row| row.get(0),
            )
            .context("Failed to read approved attempts")?;
        if let Some(phase) = last_approved {
            tx.execute(
                "UPDATE phase_results SET status = 'completed', completed_at = datetime('now')
                 WHERE run_id = ?1 AND status = 'approved'",
                params![run_id],
            )
            .context("Failed to complete approved attempts")?;
            tx.execute(
                "UPDATE pipeline_runs SET current_phase = MAX(current_phase, ?2) WHERE id = ?1",
                params![run_id, phase + 1],
            )
            .context("Failed to advance restarted run")?;
        }
        tx.commit().context("Failed to commit restart")?;
        Ok(true)
    }

    /// A run with all of its attempts and its open approval, if any.
    pub fn run_detail(&self, run_id: i64) -> Result<Option<RunDetail>> {
        let Some(run) = self.get_run(run_id)? else {
            return Ok(None);
        };
        Ok(Some(RunDetail {
            phases: self.list_phase_results(run_id)?,
            pending_approval: self.pending_approval_for_run(run_id)?,
            run,
        }))
    }

    /// Close every `running` attempt of a run as failed. Returns how many were closed.
    pub fn fail_running_attempts(&self, run_id: i64, error_log: &str) -> Result<usize> {
        if !can_transition(PhaseStatus::Running, PhaseStatus::Failed) {
            bail!("Illegal phase transition running -> failed");
        }
        self.conn
            .execute(
                "UPDATE phase_results SET status = 'failed', error_log = COALESCE(error_log, ?2),
                     completed_at = datetime('now')
                 WHERE run_id = ?1 AND status = 'running'",
                params![run_id, error_log],
            )
            .context("Failed to close running attempts")
    }

    pub fn run_stats(&self) -> Result<PipelineStats> {
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM pipeline_runs GROUP BY status")
            .context("Failed to prepare run_stats")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
            .context("Failed to query run stats")?;
        let mut stats = PipelineStats::default();
        for row in rows {
            let (status, count) = row.context("Failed to read run stats row")?;
            stats.total += count;
            match RunStatus::from_str(&status).map_err(|e| anyhow::anyhow!(e))? {
                RunStatus::Pending => stats.pending += count,
                RunStatus::Running => stats.running += count,
                RunStatus::Paused => stats.paused += count,
                RunStatus::Completed => stats.completed += count,
                RunStatus::Failed => stats.failed += count,
            }
        }
        Ok(stats)
    }

    fn query_runs(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<Run>> {
        let mut stmt = self.conn.prepare(sql).context("Failed to prepare run query")?;
        let rows = stmt
            .query_map(params, RunRow::from_row)
            .context("Failed to query pipeline runs")?;
        rows.map(|r| r.context("Failed to read pipeline_runs row")?.into_run())
            .collect()
    }

    // ── Phase results ─────────────────────────────────────────────────

    /// Open a new `running` attempt. Returns `None` when the (run, phase)
    /// pair already has an active attempt.
    pub fn create_phase_result(
        &self,
        run_id: i64,
        phase_number: u32,
        agent_name: &str,
        trace_id: &str,
    ) -> Result<Option<PhaseResult>> {
        let inserted = self.conn.execute(
            "INSERT INTO phase_results (run_id, phase_number, agent_name, status, trace_id)
             VALUES (?1, ?2, ?3, 'running', ?4)",
            params![run_id, phase_number, agent_name, trace_id],
        );
        match inserted {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                return Ok(None);
            }
            Err(e) => return Err(e).context("Failed to insert phase result"),
        }
        let id = self.conn.last_insert_rowid();
        Ok(Some(
            self.get_phase_result(id)?
                .context("Phase result not found after insert")?,
        ))
    }

    pub fn get_phase_result(&self, id: i64) -> Result<Option<PhaseResult>> {
        let sql = format!("SELECT {PHASE_RESULT_COLUMNS} FROM phase_results WHERE id = ?1");
        Ok(self.query_phase_results(&sql, params![id])?.into_iter().next())
    }

    /// The most recent attempt for a phase, whatever its status.
    pub fn latest_phase_result(&self, run_id: i64, phase_number: u32) -> Result<Option<PhaseResult>> {
        let sql = format!(
            "SELECT {PHASE_RESULT_COLUMNS} FROM phase_results
             WHERE run_id = ?1 AND phase_number = ?2
             ORDER BY id DESC LIMIT 1"
        );
        Ok(self
            .query_phase_results(&sql, params![run_id, phase_number])?
            .into_iter()
            .next())
    }

    pub fn list_phase_results(&self, run_id: i64) -> Result<Vec<PhaseResult>> {
        let sql = format!(
            "SELECT {PHASE_RESULT_COLUMNS} FROM phase_results
             WHERE run_id = ?1 ORDER BY phase_number, id"
        );
        self.query_phase_results(&sql, params![run_id])
    }

    /// Completed attempts for phases strictly before `before_phase`, in phase order.
    pub fn completed_phase_results(&self, run_id: i64, before_phase: u32) -> Result<Vec<PhaseResult>> {
        let sql = format!(
            "SELECT {PHASE_RESULT_COLUMNS} FROM phase_results
             WHERE run_id = ?1 AND phase_number < ?2 AND status = 'completed'
             ORDER BY phase_number, id"
        );
        self.query_phase_results(&sql, params![run_id, before_phase])
    }

    pub fn set_phase_input(&self, id: i64, input: &Value) -> Result<()> {
        let json = serde_json::to_string(input).context("Failed to serialize phase input")?;
        self.conn
            .execute(
                "UPDATE phase_results SET input_snapshot = ?1 WHERE id = ?2",
                params![json, id],
            )
            .context("Failed to store phase input")?;
        Ok(())
    }

    /// Store agent output and timing on a still-running attempt.
    pub fn record_phase_output(&self, id: i64, output: &Value, duration_seconds: f64) -> Result<bool> {
        let json = serde_json::to_string(output).context("Failed to serialize phase output")?;
        let changed = self
            .conn
            .execute(
                "UPDATE phase_results SET output_snapshot = ?1, duration_seconds = ?2
                 WHERE id = ?3 AND status = 'running'",
                params![json, duration_seconds, id],
            )
            .context("Failed to store phase output")?;
        Ok(changed == 1)
    }

    /// Compare-and-set a phase result's status; `error_log` is kept unless replaced.
    pub fn transition_phase_result(
        &self,
        id: i64,
        from: PhaseStatus,
        to: PhaseStatus,
        error_log: Option<&str>,
    ) -> Result<bool> {
        if !can_transition(from, to) {
            bail!("Illegal phase transition {} -> {}", from, to);
        }
        let stamp = match to {
            PhaseStatus::Completed | PhaseStatus::Failed => ", completed_at = datetime('now')",
            PhaseStatus::Approved => ", approved_at = datetime('now')",
            _ => "",
        };
        let sql = format!(
            "UPDATE phase_results SET status = ?1, error_log = COALESCE(?4, error_log){stamp}
             WHERE id = ?2 AND status = ?3"
        );
        let changed = self
            .conn
            .execute(&sql, params![to.as_str(), id, from.as_str(), error_log])
            .context("Failed to update phase result status")?;
        Ok(changed == 1)
    }

    fn query_phase_results(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<PhaseResult>> {
        let mut stmt = self
            .conn
            .prepare(sql)
            .context("Failed to prepare phase result query")?;
        let rows = stmt
            .query_map(params, PhaseResultRow::from_row)
            .context("Failed to query phase results")?;
        rows.map(|r| r.context("Failed to read phase_results row")?.into_phase_result())
            .collect()
    }

    // ── Approvals ─────────────────────────────────────────────────────

    /// Create the approval for a running attempt and move the attempt to
    /// `waiting_approval`, atomically.
    pub fn open_approval(&self, phase_result: &PhaseResult) -> Result<Approval> {
        if !can_transition(PhaseStatus::Running, PhaseStatus::WaitingApproval) {
            bail!("Illegal phase transition running -> waiting_approval");
        }
        let original = phase_result
            .output_snapshot
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("Failed to serialize original output")?;

        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin approval transaction")?;
        tx.execute(
            "INSERT INTO approvals (phase_result_id, run_id, phase_number, original_output)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                phase_result.id,
                phase_result.run_id,
                phase_result.phase_number,
                original
            ],
        )
        .context("Failed to insert approval")?;
        let approval_id = tx.last_insert_rowid();
        let changed = tx
            .execute(
                "UPDATE phase_results SET status = 'waiting_approval'
                 WHERE id = ?1 AND status = 'running'",
                params![phase_result.id],
            )
            .context("Failed to mark phase result waiting for approval")?;
        if changed != 1 {
            bail!("Phase result {} is no longer running", phase_result.id);
        }
        tx.commit().context("Failed to commit approval")?;

        self.get_approval(approval_id)?
            .context("Approval not found after insert")
    }

    pub fn get_approval(&self, id: i64) -> Result<Option<Approval>> {
        let sql = format!("SELECT {APPROVAL_COLUMNS} FROM approvals WHERE id = ?1");
        Ok(self.query_approvals(&sql, params![id])?.into_iter().next())
    }

    pub fn get_approval_for_phase_result(&self, phase_result_id: i64) -> Result<Option<Approval>> {
        let sql = format!("SELECT {APPROVAL_COLUMNS} FROM approvals WHERE phase_result_id = ?1");
        Ok(self
            .query_approvals(&sql, params![phase_result_id])?
            .into_iter()
            .next())
    }

    /// The unresolved approval blocking a run, if any.
    pub fn pending_approval_for_run(&self, run_id: i64) -> Result<Option<Approval>> {
        let sql = format!(
            "SELECT {APPROVAL_COLUMNS} FROM approvals
             WHERE run_id = ?1 AND status = 'pending'
             ORDER BY id DESC LIMIT 1"
        );
        Ok(self.query_approvals(&sql, params![run_id])?.into_iter().next())
    }

    /// All unresolved approvals, most recent first.
    pub fn list_pending_approvals(&self) -> Result<Vec<Approval>> {
        let sql = format!(
            "SELECT {APPROVAL_COLUMNS} FROM approvals
             WHERE status = 'pending' ORDER BY created_at DESC, id DESC"
        );
        self.query_approvals(&sql, [])
    }

    /// Resolve an approval, update its phase result and append to the
    /// learning log in one transaction. Returns `None` if the approval was
    /// no longer pending.
    pub fn apply_resolution(&self, record: &ResolutionRecord) -> Result<Option<Approval>> {
        if !can_transition(PhaseStatus::WaitingApproval, record.phase_status) {
            bail!(
                "Illegal phase transition waiting_approval -> {}",
                record.phase_status
            );
        }
        let edited = record
            .edited_output
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("Failed to serialize edited output")?;

        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin resolution transaction")?;
        let changed = tx
            .execute(
                "UPDATE approvals
                 SET status = ?1, reviewer_notes = ?2, edited_output = ?3, resolved_at = datetime('now')
                 WHERE id = ?4 AND status = 'pending'",
                params![
                    record.status.as_str(),
                    record.reviewer_notes,
                    edited,
                    record.approval_id
                ],
            )
            .context("Failed to update approval")?;
        if changed == 0 {
            return Ok(None);
        }
        let phase_result_id: i64 = tx
            .query_row(
                "SELECT phase_result_id FROM approvals WHERE id = ?1",
                params![record.approval_id],
                |row| row.get(0),
            )
            .context("Failed to read approval phase result")?;
        let approved_stamp = if record.phase_status == PhaseStatus::Approved {
            ", approved_at = datetime('now')"
        } else {
            ""
        };
        let sql = format!(
            "UPDATE phase_results
             SET status = ?1, output_snapshot = COALESCE(?2, output_snapshot){approved_stamp}
             WHERE id = ?3 AND status = 'waiting_approval'"
        );
        let changed = tx
            .execute(&sql, params![record.phase_status.as_str(), edited, phase_result_id])
            .context("Failed to update phase result after review")?;
        if changed != 1 {
            bail!("Phase result {} is not waiting for approval", phase_result_id);
        }
        insert_learning_entry(&tx, &record.learning)?;
        tx.commit().context("Failed to commit resolution")?;

        self.get_approval(record.approval_id)
    }

    fn query_approvals(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<Approval>> {
        let mut stmt = self
            .conn
            .prepare(sql)
            .context("Failed to prepare approval query")?;
        let rows = stmt
            .query_map(params, ApprovalRow::from_row)
            .context("Failed to query approvals")?;
        rows.map(|r| r.context("Failed to read approvals row")?.into_approval())
            .collect()
    }

    /// A pending approval joined with the attempt it reviews.
    pub fn approval_detail(&self, approval: Approval) -> Result<ApprovalDetail> {
        let (agent_name, phase_output, phase_input) = match self.get_phase_result(approval.phase_result_id)? {
            Some(pr) => (pr.agent_name, pr.output_snapshot, pr.input_snapshot),
            None => (String::new(), None, None),
        };
        Ok(ApprovalDetail {
            phase_name: phase_name(approval.phase_number).to_string(),
            agent_name,
            phase_output,
            phase_input,
            approval,
        })
    }

    pub fn pending_approval_details(&self) -> Result<Vec<ApprovalDetail>> {
        self.list_pending_approvals()?
            .into_iter()
            .map(|approval| self.approval_detail(approval))
            .collect()
    }

    // ── Phase toggles ─────────────────────────────────────────────────

    /// Insert the default toggle for every phase that has none. Returns the
    /// number of rows inserted; existing toggles are left alone.
    pub fn seed_phase_toggles(&self) -> Result<usize> {
        let mut inserted = 0;
        for phase in PHASES.iter() {
            inserted += self
                .conn
                .execute(
                    "INSERT OR IGNORE INTO phase_toggles (phase_number, phase_name, requires_approval, is_enabled)
                     VALUES (?1, ?2, 1, 1)",
                    params![phase.number, phase.name],
                )
                .context("Failed to seed phase toggle")?;
        }
        Ok(inserted)
    }

    pub fn list_phase_toggles(&self) -> Result<Vec<PhaseToggle>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT phase_number, phase_name, requires_approval, is_enabled
                 FROM phase_toggles ORDER BY phase_number",
            )
            .context("Failed to prepare list_phase_toggles")?;
        let rows = stmt
            .query_map([], toggle_from_row)
            .context("Failed to query phase toggles")?;
        rows.map(|r| r.context("Failed to read phase_toggles row"))
            .collect()
    }

    pub fn get_phase_toggle(&self, phase_number: u32) -> Result<Option<PhaseToggle>> {
        self.conn
            .query_row(
                "SELECT phase_number, phase_name, requires_approval, is_enabled
                 FROM phase_toggles WHERE phase_number = ?1",
                params![phase_number],
                toggle_from_row,
            )
            .optional()
            .context("Failed to query phase toggle")
    }

    /// Upsert a toggle; `None` leaves the stored value (or the default) in place.
    pub fn update_phase_toggle(
        &self,
        phase_number: u32,
        phase_name: &str,
        requires_approval: Option<bool>,
        is_enabled: Option<bool>,
    ) -> Result<PhaseToggle> {
        self.conn
            .execute(
                "INSERT INTO phase_toggles (phase_number, phase_name, requires_approval, is_enabled)
                 VALUES (?1, ?2, COALESCE(?3, 1), COALESCE(?4, 1))
                 ON CONFLICT(phase_number) DO UPDATE SET
                     requires_approval = COALESCE(?3, requires_approval),
                     is_enabled = COALESCE(?4, is_enabled)",
                params![phase_number, phase_name, requires_approval, is_enabled],
            )
            .context("Failed to update phase toggle")?;
        self.get_phase_toggle(phase_number)?
            .context("Phase toggle not found after update")
    }

    /// Apply a batch of toggle changes atomically: either every change lands
    /// or none does. Returns the full toggle list afterwards.
    pub fn update_phase_toggles(&self, changes: &[ToggleChange]) -> Result<Vec<PhaseToggle>> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin toggle transaction")?;
        for change in changes {
            self.update_phase_toggle(
                change.phase_number,
                &change.phase_name,
                change.requires_approval,
                change.is_enabled,
            )
            .with_context(|| format!("Failed to update toggle for phase {}", change.phase_number))?;
        }
        tx.commit().context("Failed to commit toggle changes")?;
        self.list_phase_toggles()
    }

    // ── Learning log ──────────────────────────────────────────────────

    pub fn append_learning_entry(&self, entry: &NewLearningEntry) -> Result<LearningLogEntry> {
        let id = insert_learning_entry(&self.conn, entry)?;
        self.get_learning_entry(id)?
            .context("Learning entry not found after insert")
    }

    pub fn get_learning_entry(&self, id: i64) -> Result<Option<LearningLogEntry>> {
        let sql = format!("SELECT {LEARNING_COLUMNS} FROM learning_log WHERE id = ?1");
        Ok(self.query_learning(&sql, params![id])?.into_iter().next())
    }

    /// Newest first, optionally filtered by subject and phase.
    pub fn list_learning_entries(
        &self,
        subject: Option<&str>,
        phase_number: Option<u32>,
        limit: i64,
    ) -> Result<Vec<LearningLogEntry>> {
        let sql = format!(
            "SELECT {LEARNING_COLUMNS} FROM learning_log
             WHERE (?1 IS NULL OR subject = ?1) AND (?2 IS NULL OR phase_number = ?2)
             ORDER BY id DESC LIMIT ?3"
        );
        self.query_learning(&sql, params![subject, phase_number, limit])
    }

    /// Positive examples for an agent: approved or edited outputs for the
    /// same subject and phase, best scored first.
    pub fn learning_context(
        &self,
        subject: &str,
        phase_number: u32,
        limit: i64,
    ) -> Result<Vec<LearningLogEntry>> {
        let sql = format!(
            "SELECT {LEARNING_COLUMNS} FROM learning_log
             WHERE subject = ?1 AND phase_number = ?2 AND feedback IN ('approved', 'edited')
             ORDER BY performance_score DESC NULLS LAST, id DESC
             LIMIT ?3"
        );
        self.query_learning(&sql, params![subject, phase_number, limit])
    }

    pub fn set_learning_score(&self, id: i64, score: f64) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE learning_log SET performance_score = ?1 WHERE id = ?2",
                params![score, id],
            )
            .context("Failed to update learning score")?;
        Ok(changed == 1)
    }

    fn query_learning(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<LearningLogEntry>> {
        let mut stmt = self
            .conn
            .prepare(sql)
            .context("Failed to prepare learning query")?;
        let rows = stmt
            .query_map(params, LearningRow::from_row)
            .context("Failed to query learning log")?;
        rows.map(|r| r.context("Failed to read learning_log row")?.into_entry())
            .collect()
    }

    // ── Dispatch tasks ────────────────────────────────────────────────

    pub fn enqueue_task(&self, kind: TaskKind, run_id: i64, phase_number: Option<u32>) -> Result<DispatchTask> {
        self.conn
            .execute(
                "INSERT INTO dispatch_tasks (kind, run_id, phase_number) VALUES (?1, ?2, ?3)",
                params![kind.as_str(), run_id, phase_number],
            )
            .context("Failed to enqueue dispatch task")?;
        let id = self.conn.last_insert_rowid();
        self.get_task(id)?.context("Dispatch task not found after insert")
    }

    /// Atomically claim the oldest queued task.
    pub fn claim_next_task(&self) -> Result<Option<DispatchTask>> {
        let sql = format!(
            "UPDATE dispatch_tasks SET status = 'running', started_at = datetime('now')
             WHERE id = (SELECT id FROM dispatch_tasks WHERE status = 'queued' ORDER BY id LIMIT 1)
             RETURNING {TASK_COLUMNS}"
        );
        let row = self
            .conn
            .query_row(&sql, [], TaskRow::from_row)
            .optional()
            .context("Failed to claim dispatch task")?;
        row.map(TaskRow::into_task).transpose()
    }

    /// Record the outcome of a claimed task. Returns false if it was not running.
    pub fn finish_task(&self, id: i64, status: TaskStatus, error: Option<&str>) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE dispatch_tasks SET status = ?1, error = ?2, finished_at = datetime('now')
                 WHERE id = ?3 AND status = 'running'",
                params![status.as_str(), error, id],
            )
            .context("Failed to finish dispatch task")?;
        Ok(changed == 1)
    }

    /// Put tasks whose worker vanished back on the queue. `cutoff` uses the
    /// same `YYYY-MM-DD HH:MM:SS` UTC format as `datetime('now')`.
    pub fn requeue_stale_tasks(&self, cutoff: &str) -> Result<usize> {
        self.conn
            .execute(
                "UPDATE dispatch_tasks SET status = 'queued', started_at = NULL
                 WHERE status = 'running' AND started_at < ?1",
                params![cutoff],
            )
            .context("Failed to requeue stale dispatch tasks")
    }

    pub fn get_task(&self, id: i64) -> Result<Option<DispatchTask>> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM dispatch_tasks WHERE id = ?1");
        self.conn
            .query_row(&sql, params![id], TaskRow::from_row)
            .optional()
            .context("Failed to query dispatch task")?
            .map(TaskRow::into_task)
            .transpose()
    }

    pub fn list_tasks_for_run(&self, run_id: i64) -> Result<Vec<DispatchTask>> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM dispatch_tasks WHERE run_id = ?1 ORDER BY id");
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare list_tasks_for_run")?;
        let rows = stmt
            .query_map(params![run_id], TaskRow::from_row)
            .context("Failed to query dispatch tasks")?;
        rows.map(|r| r.context("Failed to read dispatch_tasks row")?.into_task())
            .collect()
    }
}

fn insert_learning_entry(conn: &Connection, entry: &NewLearningEntry) -> Result<i64> {
    conn.execute(
        "INSERT INTO learning_log (run_id, phase_number, agent_name, subject, output_summary, feedback)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            entry.run_id,
            entry.phase_number,
            entry.agent_name,
            entry.subject,
            entry.output_summary,
            entry.feedback.as_str()
        ],
    )
    .context("Failed to insert learning entry")?;
    Ok(conn.last_insert_rowid())
}

fn parse_status<T: FromStr<Err = String>>(raw: &str, what: &str) -> Result<T> {
    T::from_str(raw)
        .map_err(|e| anyhow::anyhow!(e))
        .with_context(|| format!("Failed to parse {what}"))
}

fn parse_json(raw: Option<String>, what: &str) -> Result<Option<Value>> {
    raw.map(|s| serde_json::from_str(&s).with_context(|| format!("Failed to parse {what}")))
        .transpose()
}

fn toggle_from_row(row: &Row<'_>) -> rusqlite::Result<PhaseToggle> {
    Ok(PhaseToggle {
        phase_number: row.get(0)?,
        phase_name: row.get(1)?,
        requires_approval: row.get(2)?,
        is_enabled: row.get(3)?,
    })
}

const RUN_COLUMNS: &str = "id, status, current_phase, subject, topic, config, error_message, created_at, started_at, completed_at";

/// Intermediate row struct for pipeline_runs.
struct RunRow {
    id: i64,
    status: String,
    current_phase: u32,
    subject: String,
    topic: Option<String>,
    config: String,
    error_message: Option<String>,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
}

impl RunRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            status: row.get(1)?,
            current_phase: row.get(2)?,
            subject: row.get(3)?,
            topic: row.get(4)?,
            config: row.get(5)?,
            error_message: row.get(6)?,
            created_at: row.get(7)?,
            started_at: row.get(8)?,
            completed_at: row.get(9)?,
        })
    }

    fn into_run(self) -> Result<Run> {
        let config: Map<String, Value> =
            serde_json::from_str(&self.config).context("Failed to parse run config")?;
        Ok(Run {
            id: self.id,
            status: parse_status(&self.status, "run status")?,
            current_phase: self.current_phase,
            subject: self.subject,
            topic: self.topic,
            config,
            error_message: self.error_message,
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
        })
    }
}

const PHASE_RESULT_COLUMNS: &str = "id, run_id, phase_number, agent_name, status, input_snapshot, output_snapshot, duration_seconds, error_log, trace_id, created_at, completed_at, approved_at";

/// Intermediate row struct for phase_results.
struct PhaseResultRow {
    id: i64,
    run_id: i64,
    phase_number: u32,
    agent_name: String,
    status: String,
    input_snapshot: Option<String>,
    output_snapshot: Option<String>,
    duration_seconds: Option<f64>,
    error_log: Option<String>,
    trace_id: String,
    created_at: String,
    completed_at: Option<String>,
    approved_at: Option<String>,
}

impl PhaseResultRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            run_id: row.get(1)?,
            phase_number: row.get(2)?,
            agent_name: row.get(3)?,
            status: row.get(4)?,
            input_snapshot: row.get(5)?,
            output_snapshot: row.get(6)?,
            duration_seconds: row.get(7)?,
            error_log: row.get(8)?,
            trace_id: row.get(9)?,
            created_at: row.get(10)?,
            completed_at: row.get(11)?,
            approved_at: row.get(12)?,
        })
    }

    fn into_phase_result(self) -> Result<PhaseResult> {
        Ok(PhaseResult {
            id: self.id,
            run_id: self.run_id,
            phase_number: self.phase_number,
            agent_name: self.agent_name,
            status: parse_status(&self.status, "phase status")?,
            input_snapshot: parse_json(self.input_snapshot, "input snapshot")?,
            output_snapshot: parse_json(self.output_snapshot, "output snapshot")?,
            duration_seconds: self.duration_seconds,
            error_log: self.error_log,
            trace_id: self.trace_id,
            created_at: self.created_at,
            completed_at: self.completed_at,
            approved_at: self.approved_at,
        })
    }
}

const APPROVAL_COLUMNS: &str = "id, phase_result_id, run_id, phase_number, status, reviewer_notes, original_output, edited_output, created_at, resolved_at";

/// Intermediate row struct for approvals.
struct ApprovalRow {
    id: i64,
    phase_result_id: i64,
    run_id: i64,
    phase_number: u32,
    status: String,
    reviewer_notes: Option<String>,
    original_output: Option<String>,
    edited_output: Option<String>,
    created_at: String,
    resolved_at: Option<String>,
}

impl ApprovalRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            phase_result_id: row.get(1)?,
            run_id: row.get(2)?,
            phase_number: row.get(3)?,
            status: row.get(4)?,
            reviewer_notes: row.get(5)?,
            original_output: row.get(6)?,
            edited_output: row.get(7)?,
            created_at: row.get(8)?,
            resolved_at: row.get(9)?,
        })
    }

    fn into_approval(self) -> Result<Approval> {
        Ok(Approval {
            id: self.id,
            phase_result_id: self.phase_result_id,
            run_id: self.run_id,
            phase_number: self.phase_number,
            status: parse_status(&self.status, "approval status")?,
            reviewer_notes: self.reviewer_notes,
            original_output: parse_json(self.original_output, "original output")?,
            edited_output: parse_json(self.edited_output, "edited output")?,
            created_at: self.created_at,
            resolved_at: self.resolved_at,
        })
    }
}

const LEARNING_COLUMNS: &str = "id, run_id, phase_number, agent_name, subject, output_summary, feedback, performance_score, created_at";

/// Intermediate row struct for learning_log.
struct LearningRow {
    id: i64,
    run_id: i64,
    phase_number: u32,
    agent_name: String,
    subject: String,
    output_summary: String,
    feedback: String,
    performance_score: Option<f64>,
    created_at: String,
}

impl LearningRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            run_id: row.get(1)?,
            phase_number: row.get(2)?,
            agent_name: row.get(3)?,
            subject: row.get(4)?,
            output_summary: row.get(5)?,
            feedback: row.get(6)?,
            performance_score: row.get(7)?,
            created_at: row.get(8)?,
        })
    }

    fn into_entry(self) -> Result<LearningLogEntry> {
        Ok(LearningLogEntry {
            id: self.id,
            run_id: self.run_id,
            phase_number: self.phase_number,
            agent_name: self.agent_name,
            subject: self.subject,
            output_summary: self.output_summary,
            feedback: parse_status(&self.feedback, "learning feedback")?,
            performance_score: self.performance_score,
            created_at: self.created_at,
        })
    }
}

const TASK_COLUMNS: &str =
    "id, kind, run_id, phase_number, status, error, enqueued_at, started_at, finished_at";

/// Intermediate row struct for dispatch_tasks.
struct TaskRow {
    id: i64,
    kind: String,
    run_id: i64,
    phase_number: Option<u32>,
    status: String,
    error: Option<String>,
    enqueued_at: String,
    started_at: Option<String>,
    finished_at: Option<String>,
}

impl TaskRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            kind: row.get(1)?,
            run_id: row.get(2)?,
            phase_number: row.get(3)?,
            status: row.get(4)?,
            error: row.get(5)?,
            enqueued_at: row.get(6)?,
            started_at: row.get(7)?,
            finished_at: row.get(8)?,
        })
    }

    fn into_task(self) -> Result<DispatchTask> {
        Ok(DispatchTask {
            id: self.id,
            kind: parse_status(&self.kind, "task kind")?,
            run_id: self.run_id,
            phase_number: self.phase_number,
            status: parse_status(&self.status, "task status")?,
            error: self.error,
            enqueued_at: self.enqueued_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn new_run(db: &PipelineDb) -> Result<Run> {
        db.create_run("keto diet", Some("meal prep"), &Map::new())
    }

    fn waiting_attempt(db: &PipelineDb, run_id: i64, phase: u32) -> Result<(PhaseResult, Approval)> {
        let pr = db
            .create_phase_result(run_id, phase, "trend_discovery", "abcd1234")?
            .expect("fresh attempt");
        db.record_phase_output(pr.id, &json!({"trends": ["a"]}), 0.5)?;
        let pr = db.get_phase_result(pr.id)?.expect("phase result");
        let approval = db.open_approval(&pr)?;
        Ok((pr, approval))
    }

    fn resolution(approval: &Approval, decision: Decision, edited: Option<Value>) -> ResolutionRecord {
        ResolutionRecord {
            approval_id: approval.id,
            status: decision.approval_status(),
            reviewer_notes: Some("looks fine".into()),
            edited_output: edited,
            phase_status: if decision.is_forward() {
                PhaseStatus::Approved
            } else {
                PhaseStatus::Rejected
            },
            learning: NewLearningEntry {
                run_id: approval.run_id,
                phase_number: approval.phase_number,
                agent_name: "trend_discovery".into(),
                subject: "keto diet".into(),
                output_summary: "{}".into(),
                feedback: decision,
            },
        }
    }

    #[test]
    fn test_migrations_create_all_tables() -> Result<()> {
        let db = PipelineDb::new_in_memory()?;
        let table_count: i32 = db.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN
             ('pipeline_runs', 'phase_results', 'approvals', 'phase_toggles', 'learning_log', 'dispatch_tasks')",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(table_count, 6);
        // Running migrations twice is harmless
        db.run_migrations()?;
        Ok(())
    }

    #[test]
    fn test_create_run_defaults() -> Result<()> {
        let db = PipelineDb::new_in_memory()?;
        let mut config = Map::new();
        config.insert("approval_overrides".into(), json!({"3": false}));
        let run = db.create_run("keto diet", None, &config)?;
        assert!(run.id > 0);
        assert_eq!(run.status, RunStatus::Pending);
        assert_eq!(run.current_phase, 1);
        assert_eq!(run.config["approval_overrides"]["3"], json!(false));
        assert!(run.started_at.is_none());
        Ok(())
    }

    #[test]
    fn test_transition_run_is_compare_and_set() -> Result<()> {
        let db = PipelineDb::new_in_memory()?;
        let run = new_run(&db)?;

        assert!(db.transition_run(run.id, RunStatus::Pending, RunStatus::Running, None)?);
        // Second caller expecting pending loses
        assert!(!db.transition_run(run.id, RunStatus::Pending, RunStatus::Running, None)?);

        let run = db.get_run(run.id)?.unwrap();
        assert_eq!(run.status, RunStatus::Running);
        assert!(run.started_at.is_some());
        Ok(())
    }

    #[test]
    fn test_transition_run_rejects_illegal_edges() -> Result<()> {
        let db = PipelineDb::new_in_memory()?;
        let run = new_run(&db)?;
        let err = db
            .transition_run(run.id, RunStatus::Pending, RunStatus::Completed, None)
            .unwrap_err();
        assert!(err.to_string().contains("Illegal run transition"));
        assert_eq!(db.get_run(run.id)?.unwrap().status, RunStatus::Pending);
        Ok(())
    }

    #[test]
    fn test_fail_then_restart_clears_error() -> Result<()> {
        let db = PipelineDb::new_in_memory()?;
        let run = new_run(&db)?;
        db.transition_run(run.id, RunStatus::Pending, RunStatus::Running, None)?;
        db.transition_run(run.id, RunStatus::Running, RunStatus::Failed, Some("boom"))?;

        let failed = db.get_run(run.id)?.unwrap();
        assert_eq!(failed.error_message.as_deref(), Some("boom"));
        assert!(failed.completed_at.is_some());

        assert!(db.transition_run(run.id, RunStatus::Failed, RunStatus::Pending, None)?);
        let restarted = db.get_run(run.id)?.unwrap();
        assert_eq!(restarted.status, RunStatus::Pending);
        assert!(restarted.error_message.is_none());
        assert!(restarted.completed_at.is_none());
        Ok(())
    }

    #[test]
    fn test_resume_approved_phase_only_once() -> Result<()> {
        let db = PipelineDb::new_in_memory()?;
        let run = new_run(&db)?;
        db.transition_run(run.id, RunStatus::Pending, RunStatus::Running, None)?;
        let (pr, approval) = waiting_attempt(&db, run.id, 1)?;
        db.transition_run(run.id, RunStatus::Running, RunStatus::Paused, None)?;
        db.apply_resolution(&resolution(&approval, Decision::Approved, None))?;

        assert!(db.resume_approved_phase(run.id, pr.id)?);
        assert!(!db.resume_approved_phase(run.id, pr.id)?);
        assert_eq!(db.get_run(run.id)?.unwrap().status, RunStatus::Running);
        assert_eq!(db.get_phase_result(pr.id)?.unwrap().status, PhaseStatus::Completed);
        Ok(())
    }

    #[test]
    fn test_resume_rolls_back_when_phase_not_approved() -> Result<()> {
        let db = PipelineDb::new_in_memory()?;
        let run = new_run(&db)?;
        db.transition_run(run.id, RunStatus::Pending, RunStatus::Running, None)?;
        let (pr, _) = waiting_attempt(&db, run.id, 1)?;
        db.transition_run(run.id, RunStatus::Running, RunStatus::Paused, None)?;

        assert!(!db.resume_approved_phase(run.id, pr.id)?);
        // The run update was rolled back with the phase update
        assert_eq!(db.get_run(run.id)?.unwrap().status, RunStatus::Paused);
        Ok(())
    }

    #[test]
    fn test_restart_closes_open_attempts() -> Result<()> {
        let db = PipelineDb::new_in_memory()?;
        let run = new_run(&db)?;
        db.transition_run(run.id, RunStatus::Pending, RunStatus::Running, None)?;
        let (pr, approval) = waiting_attempt(&db, run.id, 1)?;
        db.transition_run(run.id, RunStatus::Running, RunStatus::Failed, Some("stopped"))?;

        assert!(db.restart_run(run.id, "run restarted")?);
        assert!(!db.restart_run(run.id, "run restarted")?);

        let restarted = db.get_run(run.id)?.unwrap();
        assert_eq!(restarted.status, RunStatus::Pending);
        assert_eq!(restarted.current_phase, 1);
        assert_eq!(db.get_phase_result(pr.id)?.unwrap().status, PhaseStatus::Rejected);
        let approval = db.get_approval(approval.id)?.unwrap();
        assert_eq!(approval.status, ApprovalStatus::Rejected);
        assert_eq!(approval.reviewer_notes.as_deref(), Some("run restarted"));
        // Phase 1 can be attempted again
        assert!(db.create_phase_result(run.id, 1, "trend_discovery", "t")?.is_some());
        Ok(())
    }

    #[test]
    fn test_restart_moves_past_approved_attempt() -> Result<()> {
        let db = PipelineDb::new_in_memory()?;
        let run = new_run(&db)?;
        db.transition_run(run.id, RunStatus::Pending, RunStatus::Running, None)?;
        let (pr, approval) = waiting_attempt(&db, run.id, 1)?;
        db.transition_run(run.id, RunStatus::Running, RunStatus::Paused, None)?;
        db.apply_resolution(&resolution(&approval, Decision::Approved, None))?;
        db.transition_run(run.id, RunStatus::Paused, RunStatus::Failed, Some("stopped"))?;

        assert!(db.restart_run(run.id, "run restarted")?);
        assert_eq!(db.get_phase_result(pr.id)?.unwrap().status, PhaseStatus::Completed);
        assert_eq!(db.get_run(run.id)?.unwrap().current_phase, 2);
        Ok(())
    }

    #[test]
    fn test_fail_running_attempts() -> Result<()> {
        let db = PipelineDb::new_in_memory()?;
        let run = new_run(&db)?;
        let pr = db.create_phase_result(run.id, 1, "trend_discovery", "t")?.unwrap();
        assert_eq!(db.fail_running_attempts(run.id, "timed out")?, 1);
        assert_eq!(db.fail_running_attempts(run.id, "timed out")?, 0);
        let pr = db.get_phase_result(pr.id)?.unwrap();
        assert_eq!(pr.status, PhaseStatus::Failed);
        assert_eq!(pr.error_log.as_deref(), Some("timed out"));
        Ok(())
    }

    #[test]
    fn test_set_current_phase_requires_running() -> Result<()> {
        let db = PipelineDb::new_in_memory()?;
        let run = new_run(&db)?;
        assert!(!db.set_current_phase(run.id, 2)?);
        db.transition_run(run.id, RunStatus::Pending, RunStatus::Running, None)?;
        assert!(db.set_current_phase(run.id, 2)?);
        assert_eq!(db.get_run(run.id)?.unwrap().current_phase, 2);
        Ok(())
    }

    #[test]
    fn test_complete_run_moves_past_last_phase() -> Result<()> {
        let db = PipelineDb::new_in_memory()?;
        let run = new_run(&db)?;
        assert!(!db.complete_run(run.id, 9)?);
        db.transition_run(run.id, RunStatus::Pending, RunStatus::Running, None)?;
        db.set_current_phase(run.id, 8)?;
        assert!(db.complete_run(run.id, 9)?);

        let run = db.get_run(run.id)?.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.current_phase, 9);
        assert!(run.completed_at.is_some());
        // Only once
        assert!(!db.complete_run(run.id, 9)?);
        Ok(())
    }

    #[test]
    fn test_only_one_active_attempt_per_phase() -> Result<()> {
        let db = PipelineDb::new_in_memory()?;
        let run = new_run(&db)?;
        let first = db.create_phase_result(run.id, 1, "trend_discovery", "t1")?;
        assert!(first.is_some());
        assert!(db.create_phase_result(run.id, 1, "trend_discovery", "t2")?.is_none());

        // Once the first attempt is terminal a new one may open
        let first = first.unwrap();
        db.transition_phase_result(first.id, PhaseStatus::Running, PhaseStatus::Failed, Some("x"))?;
        assert!(db.create_phase_result(run.id, 1, "trend_discovery", "t3")?.is_some());
        Ok(())
    }

    #[test]
    fn test_completed_phase_results_filters_by_status_and_phase() -> Result<()> {
        let db = PipelineDb::new_in_memory()?;
        let run = new_run(&db)?;
        for phase in 1..=3 {
            let pr = db.create_phase_result(run.id, phase, "agent", "t")?.unwrap();
            db.record_phase_output(pr.id, &json!({"phase": phase}), 0.1)?;
            if phase != 2 {
                db.transition_phase_result(pr.id, PhaseStatus::Running, PhaseStatus::Completed, None)?;
            }
        }
        let done = db.completed_phase_results(run.id, 3)?;
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].phase_number, 1);
        assert_eq!(done[0].output_snapshot, Some(json!({"phase": 1})));
        Ok(())
    }

    #[test]
    fn test_open_approval_moves_phase_to_waiting() -> Result<()> {
        let db = PipelineDb::new_in_memory()?;
        let run = new_run(&db)?;
        let (pr, approval) = waiting_attempt(&db, run.id, 1)?;
        assert_eq!(approval.status, ApprovalStatus::Pending);
        assert_eq!(approval.original_output, Some(json!({"trends": ["a"]})));
        assert_eq!(
            db.get_phase_result(pr.id)?.unwrap().status,
            PhaseStatus::WaitingApproval
        );
        assert_eq!(db.pending_approval_for_run(run.id)?.unwrap().id, approval.id);
        assert_eq!(
            db.get_approval_for_phase_result(pr.id)?.unwrap().id,
            approval.id
        );
        assert_eq!(db.list_pending_approvals()?.len(), 1);
        Ok(())
    }

    #[test]
    fn test_open_approval_twice_violates_uniqueness() -> Result<()> {
        let db = PipelineDb::new_in_memory()?;
        let run = new_run(&db)?;
        let (pr, _) = waiting_attempt(&db, run.id, 1)?;
        assert!(db.open_approval(&pr).is_err());
        Ok(())
    }

    #[test]
    fn test_apply_resolution_edited_overwrites_output() -> Result<()> {
        let db = PipelineDb::new_in_memory()?;
        let run = new_run(&db)?;
        let (pr, approval) = waiting_attempt(&db, run.id, 1)?;
        let record = resolution(&approval, Decision::Edited, Some(json!({"trends": ["b"]})));

        let resolved = db.apply_resolution(&record)?.expect("resolved");
        assert_eq!(resolved.status, ApprovalStatus::Edited);
        assert!(resolved.resolved_at.is_some());

        let pr = db.get_phase_result(pr.id)?.unwrap();
        assert_eq!(pr.status, PhaseStatus::Approved);
        assert_eq!(pr.output_snapshot, Some(json!({"trends": ["b"]})));
        assert!(pr.approved_at.is_some());

        let log = db.list_learning_entries(Some("keto diet"), Some(1), 10)?;
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].feedback, Decision::Edited);
        Ok(())
    }

    #[test]
    fn test_apply_resolution_only_once() -> Result<()> {
        let db = PipelineDb::new_in_memory()?;
        let run = new_run(&db)?;
        let (_, approval) = waiting_attempt(&db, run.id, 1)?;
        assert!(db.apply_resolution(&resolution(&approval, Decision::Rejected, None))?.is_some());
        assert!(db.apply_resolution(&resolution(&approval, Decision::Approved, None))?.is_none());
        // The losing resolution wrote nothing
        assert_eq!(db.list_learning_entries(None, None, 10)?.len(), 1);
        assert_eq!(db.get_approval(approval.id)?.unwrap().status, ApprovalStatus::Rejected);
        Ok(())
    }

    #[test]
    fn test_seed_toggles_never_overwrites() -> Result<()> {
        let db = PipelineDb::new_in_memory()?;
        assert_eq!(db.seed_phase_toggles()?, 8);
        db.update_phase_toggle(4, "Product Structure", Some(false), None)?;
        assert_eq!(db.seed_phase_toggles()?, 0);

        let toggle = db.get_phase_toggle(4)?.unwrap();
        assert!(!toggle.requires_approval);
        assert!(toggle.is_enabled);
        assert_eq!(db.list_phase_toggles()?.len(), 8);
        Ok(())
    }

    #[test]
    fn test_update_toggle_inserts_missing_row() -> Result<()> {
        let db = PipelineDb::new_in_memory()?;
        assert!(db.get_phase_toggle(2)?.is_none());
        let toggle = db.update_phase_toggle(2, "Niche Validation", None, Some(false))?;
        assert!(toggle.requires_approval);
        assert!(!toggle.is_enabled);
        Ok(())
    }

    fn change(phase_number: u32, phase_name: &str, requires_approval: bool) -> ToggleChange {
        ToggleChange {
            phase_number,
            phase_name: phase_name.to_string(),
            requires_approval: Some(requires_approval),
            is_enabled: None,
        }
    }

    #[test]
    fn test_update_toggles_applies_batch() -> Result<()> {
        let db = PipelineDb::new_in_memory()?;
        db.seed_phase_toggles()?;
        let toggles = db.update_phase_toggles(&[
            change(2, "Niche Validation", false),
            change(6, "Visual Design", false),
        ])?;
        assert_eq!(toggles.len(), 8);
        let required: Vec<u32> = toggles
            .iter()
            .filter(|t| t.requires_approval)
            .map(|t| t.phase_number)
            .collect();
        assert_eq!(required, vec![1, 3, 4, 5, 7, 8]);
        Ok(())
    }

    #[test]
    fn test_update_toggles_failure_rolls_back_whole_batch() -> Result<()> {
        let db = PipelineDb::new_in_memory()?;
        db.seed_phase_toggles()?;
        db.execute_batch(
            "CREATE TRIGGER lock_phase_5 BEFORE UPDATE ON phase_toggles
             WHEN NEW.phase_number = 5
             BEGIN SELECT RAISE(ABORT, 'phase 5 is locked'); END;",
        )?;

        let err = db
            .update_phase_toggles(&[
                change(2, "Niche Validation", false),
                change(5, "Content Writing", false),
            ])
            .unwrap_err();
        assert!(format!("{err:#}").contains("phase 5"));
        // The change to phase 2 was rolled back with the rest
        assert!(db.get_phase_toggle(2)?.unwrap().requires_approval);
        assert!(db.get_phase_toggle(5)?.unwrap().requires_approval);
        Ok(())
    }

    #[test]
    fn test_learning_context_orders_by_score() -> Result<()> {
        let db = PipelineDb::new_in_memory()?;
        let run = new_run(&db)?;
        let mut ids = Vec::new();
        for feedback in [Decision::Approved, Decision::Edited, Decision::Rejected, Decision::Approved] {
            let entry = db.append_learning_entry(&NewLearningEntry {
                run_id: run.id,
                phase_number: 2,
                agent_name: "niche_validator".into(),
                subject: "keto diet".into(),
                output_summary: "summary".into(),
                feedback,
            })?;
            ids.push(entry.id);
        }
        db.set_learning_score(ids[0], 0.2)?;
        db.set_learning_score(ids[1], 0.9)?;

        let context = db.learning_context("keto diet", 2, 5)?;
        let got: Vec<i64> = context.iter().map(|e| e.id).collect();
        assert_eq!(got, vec![ids[1], ids[0], ids[3]]);
        assert!(db.learning_context("vegan", 2, 5)?.is_empty());
        assert!(!db.set_learning_score(9999, 1.0)?);
        Ok(())
    }

    #[test]
    fn test_run_stats_counts_by_status() -> Result<()> {
        let db = PipelineDb::new_in_memory()?;
        let a = new_run(&db)?;
        new_run(&db)?;
        db.transition_run(a.id, RunStatus::Pending, RunStatus::Running, None)?;
        let stats = db.run_stats()?;
        assert_eq!(stats.total, 2);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.running, 1);
        assert_eq!(stats.failed, 0);
        Ok(())
    }

    #[test]
    fn test_list_runs_filters_and_pages() -> Result<()> {
        let db = PipelineDb::new_in_memory()?;
        let a = new_run(&db)?;
        let b = new_run(&db)?;
        db.transition_run(a.id, RunStatus::Pending, RunStatus::Running, None)?;

        let all = db.list_runs(None, 10, 0)?;
        assert_eq!(all.iter().map(|r| r.id).collect::<Vec<_>>(), vec![b.id, a.id]);
        let running = db.list_runs(Some(RunStatus::Running), 10, 0)?;
        assert_eq!(running.len(), 1);
        assert_eq!(db.list_runs(None, 1, 1)?[0].id, a.id);
        Ok(())
    }

    #[test]
    fn test_task_claim_finish_and_requeue() -> Result<()> {
        let db = PipelineDb::new_in_memory()?;
        let run = new_run(&db)?;
        let first = db.enqueue_task(TaskKind::Start, run.id, None)?;
        let second = db.enqueue_task(TaskKind::RunPhase, run.id, Some(2))?;
        assert_eq!(first.status, TaskStatus::Queued);

        let claimed = db.claim_next_task()?.expect("task");
        assert_eq!(claimed.id, first.id);
        assert_eq!(claimed.status, TaskStatus::Running);
        assert!(claimed.started_at.is_some());

        assert!(db.finish_task(claimed.id, TaskStatus::Succeeded, None)?);
        assert!(!db.finish_task(claimed.id, TaskStatus::Failed, Some("late"))?);

        let claimed = db.claim_next_task()?.expect("task");
        assert_eq!(claimed.id, second.id);
        assert_eq!(claimed.phase_number, Some(2));
        assert!(db.claim_next_task()?.is_none());

        // A cutoff in the future treats the running task as abandoned
        assert_eq!(db.requeue_stale_tasks("9999-12-31 00:00:00")?, 1);
        let requeued = db.get_task(second.id)?.unwrap();
        assert_eq!(requeued.status, TaskStatus::Queued);
        assert_eq!(db.list_tasks_for_run(run.id)?.len(), 2);
        Ok(())
    }

    #[test]
    fn test_file_backed_database_persists() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("nested").join("pipewright.db");
        let run_id = {
            let db = PipelineDb::new(&path)?;
            new_run(&db)?.id
        };
        let db = PipelineDb::new(&path)?;
        assert_eq!(db.get_run(run_id)?.unwrap().subject, "keto diet");
        Ok(())
    }
}
