//! Durable task dispatch for driver entry points.
//!
//! `start`, `run_phase`, `resume_after_approval` and `retry_phase` invocations are queued as
//! `dispatch_tasks` rows so they survive the process that requested them.
//! Workers claim one task at a time and run it under two limits: past the
//! soft limit the run is failed (the agent call keeps going, its output is
//! discarded); past the hard limit the invocation is aborted outright.
//! A task still marked `running` past the hard limit (plus a poll interval)
//! belongs to a worker that died and goes back on the queue. No failed task is retried.

use std::time::Duration;

use anyhow::anyhow;
use tokio::sync::watch;
use tokio::task::JoinError;
use tracing::{error, info, warn};

use super::db::DbHandle;
use super::driver::{RunDriver, RunOutcome};
use super::models::{DispatchTask, TaskKind, TaskStatus};
use crate::errors::{PipelineError, PipelineResult};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DispatchLimits {
    pub soft_time_limit: Duration,
    pub hard_time_limit: Duration,
    pub workers: usize,
    pub poll_interval: Duration,
}

impl Default for DispatchLimits {
    fn default() -> Self {
        Self {
            soft_time_limit: Duration::from_secs(600),
            hard_time_limit: Duration::from_secs(900),
            workers: 2,
            poll_interval: Duration::from_millis(500),
        }
    }
}

impl DispatchLimits {
    /// How long a task may stay `running` before the sweep treats its worker
    /// as gone. One poll interval past the hard limit lets an aborted task
    /// record its own outcome first; the extra second covers the
    /// second-resolution timestamps.
    pub fn stale_after(&self) -> Duration {
        self.hard_time_limit + self.poll_interval + Duration::from_secs(1)
    }
}

#[derive(Clone)]
pub struct TaskDispatcher {
    db: DbHandle,
    driver: RunDriver,
    limits: DispatchLimits,
}

impl TaskDispatcher {
    pub fn new(driver: RunDriver, limits: DispatchLimits) -> Self {
        Self {
            db: driver.db().clone(),
            driver,
            limits,
        }
    }

    pub fn driver(&self) -> &RunDriver {
        &self.driver
    }

    pub async fn enqueue_start(&self, run_id: i64) -> PipelineResult<DispatchTask> {
        self.enqueue(TaskKind::Start, run_id, None).await
    }

    pub async fn enqueue_run_phase(&self, run_id: i64, phase_number: u32) -> PipelineResult<DispatchTask> {
        self.enqueue(TaskKind::RunPhase, run_id, Some(phase_number)).await
    }

    pub async fn enqueue_resume(&self, run_id: i64, phase_number: u32) -> PipelineResult<DispatchTask> {
        self.enqueue(TaskKind::ResumeAfterApproval, run_id, Some(phase_number))
            .await
    }

    pub async fn enqueue_retry(&self, run_id: i64, phase_number: u32) -> PipelineResult<DispatchTask> {
        self.enqueue(TaskKind::RetryPhase, run_id, Some(phase_number)).await
    }

    async fn enqueue(
        &self,
        kind: TaskKind,
        run_id: i64,
        phase_number: Option<u32>,
    ) -> PipelineResult<DispatchTask> {
        let task = self
            .db
            .call(move |db| {
                if db.get_run(run_id)?.is_none() {
                    return Ok(None);
                }
                db.enqueue_task(kind, run_id, phase_number).map(Some)
            })
            .await
            .map_err(PipelineError::Database)?
            .ok_or_else(|| PipelineError::not_found("Run", run_id))?;
        info!(task_id = task.id, run_id, kind = %kind, phase = ?phase_number, "task enqueued");
        Ok(task)
    }

    /// Put back tasks whose worker has been silent for longer than
    /// [`DispatchLimits::stale_after`].
    pub async fn requeue_stale(&self) -> PipelineResult<usize> {
        let age = chrono::Duration::from_std(self.limits.stale_after())
            .map_err(|e| PipelineError::invalid(format!("stale task age out of range: {}", e)))?;
        let cutoff = (chrono::Utc::now() - age)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string();
        let requeued = self
            .db
            .call(move |db| db.requeue_stale_tasks(&cutoff))
            .await
            .map_err(PipelineError::Database)?;
        if requeued > 0 {
            warn!(count = requeued, "requeued tasks abandoned by their worker");
        }
        Ok(requeued)
    }

    /// Claim the oldest queued task and run it to completion. Returns the
    /// finished task, or `None` when the queue is empty.
    pub async fn run_next(&self) -> PipelineResult<Option<DispatchTask>> {
        let Some(task) = self
            .db
            .call(|db| db.claim_next_task())
            .await
            .map_err(PipelineError::Database)?
        else {
            return Ok(None);
        };
        info!(task_id = task.id, run_id = task.run_id, kind = %task.kind, "task claimed");

        let result = self.execute(&task).await;
        let (status, message) = match &result {
            Ok(outcome) => {
                info!(task_id = task.id, run_id = task.run_id, outcome = ?outcome, "task finished");
                (TaskStatus::Succeeded, None)
            }
            Err(e) => {
                error!(task_id = task.id, run_id = task.run_id, error = %e, "task failed");
                (TaskStatus::Failed, Some(e.to_string()))
            }
        };

        let task_id = task.id;
        let finished = self
            .db
            .call(move |db| {
                db.finish_task(task_id, status, message.as_deref())?;
                db.get_task(task_id)
            })
            .await
            .map_err(PipelineError::Database)?;
        Ok(finished)
    }

    /// Run one task's driver call under the soft and hard limits.
    pub async fn execute(&self, task: &DispatchTask) -> PipelineResult<RunOutcome> {
        let driver = self.driver.clone();
        let invocation = task.clone();
        let mut handle = tokio::spawn(async move { invoke(&driver, &invocation).await });

        if let Ok(joined) = tokio::time::timeout(self.limits.soft_time_limit, &mut handle).await {
            return flatten(joined);
        }

        let phase = self.current_phase(task.run_id).await;
        let soft = PipelineError::TimeoutFailure {
            phase,
            limit_secs: self.limits.soft_time_limit.as_secs(),
            hard: false,
        };
        warn!(task_id = task.id, run_id = task.run_id, phase, "task soft time limit exceeded");
        self.driver.abort_run(task.run_id, &soft).await?;

        let grace = self
            .limits
            .hard_time_limit
            .saturating_sub(self.limits.soft_time_limit);
        match tokio::time::timeout(grace, &mut handle).await {
            Ok(joined) => {
                // The invocation wound down on its own; the run already failed
                if let Err(e) = flatten(joined) {
                    warn!(task_id = task.id, error = %e, "invocation failed after soft time limit");
                }
                Err(soft)
            }
            Err(_) => {
                handle.abort();
                let hard = PipelineError::TimeoutFailure {
                    phase,
                    limit_secs: self.limits.hard_time_limit.as_secs(),
                    hard: true,
                };
                error!(task_id = task.id, run_id = task.run_id, phase, "task hard time limit exceeded");
                self.driver.abort_run(task.run_id, &hard).await?;
                Err(hard)
            }
        }
    }

    async fn current_phase(&self, run_id: i64) -> u32 {
        match self.db.call(move |db| db.get_run(run_id)).await {
            Ok(Some(run)) => run.current_phase,
            _ => 0,
        }
    }

    /// Claim and run tasks until `shutdown` flips to true.
    pub async fn run_worker(&self, worker: usize, mut shutdown: watch::Receiver<bool>) {
        info!(worker, "dispatch worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.run_next().await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(e) => error!(worker, error = %e, "dispatch worker error"),
            }
            tokio::select! {
                _ = tokio::time::sleep(self.limits.poll_interval) => {}
                _ = shutdown.changed() => {}
            }
        }
        info!(worker, "dispatch worker stopped");
    }

    /// Requeue abandoned tasks, then run the configured number of workers
    /// plus a periodic requeue sweep until `shutdown` flips to true.
    pub async fn run_pool(&self, shutdown: watch::Receiver<bool>) -> PipelineResult<()> {
        self.requeue_stale().await?;

        let mut handles = Vec::with_capacity(self.limits.workers + 1);
        for worker in 0..self.limits.workers.max(1) {
            let dispatcher = self.clone();
            let rx = shutdown.clone();
            handles.push(tokio::spawn(async move { dispatcher.run_worker(worker, rx).await }));
        }

        let sweeper = self.clone();
        let mut rx = shutdown.clone();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweeper.limits.hard_time_limit);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = sweeper.requeue_stale().await {
                            error!(error = %e, "stale task sweep failed");
                        }
                    }
                    _ = rx.changed() => {
                        if *rx.borrow() {
                            break;
                        }
                    }
                }
            }
        }));

        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "dispatch worker panicked");
            }
        }
        Ok(())
    }
}

async fn invoke(driver: &RunDriver, task: &DispatchTask) -> PipelineResult<RunOutcome> {
    let phase = || {
        task.phase_number.ok_or_else(|| {
            PipelineError::invalid(format!("{} task {} has no phase number", task.kind, task.id))
        })
    };
    match task.kind {
        TaskKind::Start => driver.start(task.run_id).await,
        TaskKind::RunPhase => driver.run_phase(task.run_id, phase()?).await,
        TaskKind::ResumeAfterApproval => driver.resume_after_approval(task.run_id, phase()?).await,
        TaskKind::RetryPhase => driver.retry_phase(task.run_id, phase()?).await,
    }
}

fn flatten(joined: Result<PipelineResult<RunOutcome>, JoinError>) -> PipelineResult<RunOutcome> {
    joined.map_err(|e| PipelineError::Other(anyhow!("dispatch task panicked: {}", e)))?
}
