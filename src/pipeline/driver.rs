//! The run driver: sequences phases, persists every attempt, consults the
//! approval gate, and pauses or advances.
//!
//! All coordination goes through the database. Status changes are
//! compare-and-set against the status the driver last observed, and the run
//! is re-read after every agent call so a run stopped (or timed out) while
//! an agent was working never receives that agent's output.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use super::db::DbHandle;
use super::gates::ApprovalGate;
use super::models::{LearningLogEntry, PhaseResult, PhaseStatus, Run, RunStatus};
use super::state::{TOTAL_PHASES, can_transition, ensure_transition, phase_definition};
use crate::agents::client::GenerationClient;
use crate::agents::{AgentContext, AgentRegistry};
use crate::errors::{PipelineError, PipelineResult};

/// Learning-log entries handed to an agent as context.
pub const LEARNING_CONTEXT_LIMIT: i64 = 5;

pub const STOPPED_BY_USER: &str = "Manually stopped by user";

/// Where a driver invocation left the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every phase completed.
    Completed,
    /// A phase is waiting for review.
    Paused {
        phase: u32,
        phase_result_id: i64,
        approval_id: i64,
    },
    /// The run left `running` while an agent was working; its output was discarded.
    Interrupted { phase: u32, status: RunStatus },
    /// The approved phase was already resumed by an earlier call.
    AlreadyResumed { phase: u32 },
}

enum PhaseStep {
    Advance,
    Finished(RunOutcome),
}

/// First eight characters of a fresh UUID; shared by every attempt one
/// driver invocation creates.
pub fn new_trace_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

#[derive(Clone)]
pub struct RunDriver {
    db: DbHandle,
    gate: ApprovalGate,
    agents: Arc<AgentRegistry>,
    generation: Arc<dyn GenerationClient>,
}

impl RunDriver {
    pub fn new(
        db: DbHandle,
        agents: AgentRegistry,
        generation: Arc<dyn GenerationClient>,
    ) -> Self {
        Self {
            gate: ApprovalGate::new(db.clone()),
            db,
            agents: Arc::new(agents),
            generation,
        }
    }

    pub fn gate(&self) -> &ApprovalGate {
        &self.gate
    }

    pub fn db(&self) -> &DbHandle {
        &self.db
    }

    pub async fn create_run(
        &self,
        subject: &str,
        topic: Option<&str>,
        config: Map<String, Value>,
    ) -> PipelineResult<Run> {
        let subject = subject.trim().to_string();
        if subject.is_empty() {
            return Err(PipelineError::invalid("subject must not be empty"));
        }
        let topic = topic.map(str::trim).filter(|t| !t.is_empty()).map(String::from);
        let run = self
            .db
            .call(move |db| db.create_run(&subject, topic.as_deref(), &config))
            .await
            .map_err(PipelineError::Database)?;
        info!(run_id = run.id, subject = %run.subject, "pipeline created");
        Ok(run)
    }

    /// Move a pending run to `running` and drive it from its current phase.
    pub async fn start(&self, run_id: i64) -> PipelineResult<RunOutcome> {
        let run = self.check_startable(run_id).await?;
        self.swap_run_status(run_id, RunStatus::Pending, RunStatus::Running, None)
            .await?;

        let trace_id = new_trace_id();
        info!(run_id, phase = run.current_phase, trace_id = %trace_id, "pipeline started");
        self.drive(run_id, run.current_phase, &trace_id).await
    }

    /// Execute `phase_number` of a running run and keep going until the run
    /// pauses, completes or fails. Only the current phase or the one after
    /// it may be requested.
    pub async fn run_phase(&self, run_id: i64, phase_number: u32) -> PipelineResult<RunOutcome> {
        let run = self.load_run(run_id).await?;
        if run.status != RunStatus::Running {
            return Err(PipelineError::invalid(format!(
                "run {} is {}, not running",
                run_id, run.status
            )));
        }
        if phase_number != run.current_phase && phase_number != run.current_phase + 1 {
            return Err(PipelineError::invalid(format!(
                "phase {} cannot run while run {} is at phase {}",
                phase_number, run_id, run.current_phase
            )));
        }
        self.drive(run_id, phase_number, &new_trace_id()).await
    }

    /// Continue a paused run after its phase was approved or edited.
    ///
    /// Calling this again once the phase is completed is a no-op that
    /// returns [`RunOutcome::AlreadyResumed`].
    pub async fn resume_after_approval(
        &self,
        run_id: i64,
        phase_number: u32,
    ) -> PipelineResult<RunOutcome> {
        self.load_run(run_id).await?;
        let latest = self.latest_attempt(run_id, phase_number).await?;

        match latest.status {
            PhaseStatus::Approved => {}
            PhaseStatus::Completed => {
                debug!(run_id, phase = phase_number, "phase already resumed");
                return Ok(RunOutcome::AlreadyResumed {
                    phase: phase_number,
                });
            }
            PhaseStatus::WaitingApproval => {
                return Err(PipelineError::invalid(format!(
                    "phase {} of run {} is still waiting for approval",
                    phase_number, run_id
                )));
            }
            PhaseStatus::Rejected => {
                return Err(PipelineError::invalid(format!(
                    "phase {} of run {} was rejected; retry the phase instead",
                    phase_number, run_id
                )));
            }
            other => {
                return Err(PipelineError::invalid(format!(
                    "phase {} of run {} is {}, nothing to resume",
                    phase_number, run_id, other
                )));
            }
        }

        let phase_result_id = latest.id;
        let resumed = self
            .db
            .call(move |db| db.resume_approved_phase(run_id, phase_result_id))
            .await
            .map_err(PipelineError::Database)?;
        if !resumed {
            // Lost the race: either a concurrent resume won, or the run moved on
            let again = self.latest_attempt(run_id, phase_number).await?;
            if again.status == PhaseStatus::Completed {
                return Ok(RunOutcome::AlreadyResumed {
                    phase: phase_number,
                });
            }
            let run = self.load_run(run_id).await?;
            return Err(PipelineError::invalid(format!(
                "run {} is {}, cannot resume",
                run_id, run.status
            )));
        }

        let trace_id = new_trace_id();
        info!(run_id, phase = phase_number, trace_id = %trace_id, "pipeline resumed");
        self.drive(run_id, phase_number + 1, &trace_id).await
    }

    /// Re-run a rejected phase as a fresh attempt. The rejected attempt and
    /// its approval stay as they are.
    pub async fn retry_phase(&self, run_id: i64, phase_number: u32) -> PipelineResult<RunOutcome> {
        self.check_retryable(run_id, phase_number).await?;
        self.swap_run_status(run_id, RunStatus::Paused, RunStatus::Running, None)
            .await?;

        let trace_id = new_trace_id();
        info!(run_id, phase = phase_number, trace_id = %trace_id, "phase retry requested");
        self.drive(run_id, phase_number, &trace_id).await
    }

    /// The run, if `start` would accept it right now.
    pub async fn check_startable(&self, run_id: i64) -> PipelineResult<Run> {
        let run = self.load_run(run_id).await?;
        ensure_transition("Run", run.status, RunStatus::Running)?;
        if run.status != RunStatus::Pending {
            return Err(PipelineError::invalid(format!(
                "run {} is {}; only pending runs can be started",
                run_id, run.status
            )));
        }
        Ok(run)
    }

    /// The run, if `retry_phase` would accept it right now.
    pub async fn check_retryable(&self, run_id: i64, phase_number: u32) -> PipelineResult<Run> {
        let run = self.load_run(run_id).await?;
        if run.status != RunStatus::Paused {
            return Err(PipelineError::invalid(format!(
                "run {} is {}; only paused runs can retry a phase",
                run_id, run.status
            )));
        }
        if phase_number != run.current_phase {
            return Err(PipelineError::invalid(format!(
                "run {} is at phase {}, not {}",
                run_id, run.current_phase, phase_number
            )));
        }
        let latest = self.latest_attempt(run_id, phase_number).await?;
        if latest.status != PhaseStatus::Rejected {
            return Err(PipelineError::invalid(format!(
                "phase {} of run {} is {}; only rejected phases can be retried",
                phase_number, run_id, latest.status
            )));
        }
        Ok(run)
    }

    /// Mark a run failed. Cooperative: an agent already working finishes,
    /// and its output is discarded.
    pub async fn stop(&self, run_id: i64) -> PipelineResult<Run> {
        let run = self.load_run(run_id).await?;
        ensure_transition("Run", run.status, RunStatus::Failed)?;
        self.swap_run_status(run_id, run.status, RunStatus::Failed, Some(STOPPED_BY_USER))
            .await?;
        info!(run_id, from = %run.status, "pipeline stopped");
        self.load_run(run_id).await
    }

    /// Return a failed run to `pending` so it can be started again from
    /// the phase it failed in.
    pub async fn restart(&self, run_id: i64) -> PipelineResult<Run> {
        let run = self.load_run(run_id).await?;
        ensure_transition("Run", run.status, RunStatus::Pending)?;
        let restarted = self
            .db
            .call(move |db| db.restart_run(run_id, "Run restarted"))
            .await
            .map_err(PipelineError::Database)?;
        if !restarted {
            return Err(PipelineError::invalid(format!(
                "run {} changed state concurrently; retry",
                run_id
            )));
        }
        let run = self.load_run(run_id).await?;
        info!(run_id, phase = run.current_phase, "pipeline restarted");
        Ok(run)
    }

    /// Fail a run whose dispatched invocation exceeded a time limit, closing
    /// any attempt left running. No-op for runs already terminal.
    pub async fn abort_run(&self, run_id: i64, cause: &PipelineError) -> PipelineResult<()> {
        let message = cause.to_string();
        let outcome = self
            .db
            .call(move |db| {
                let Some(run) = db.get_run(run_id)? else {
                    return Ok(false);
                };
                let mut failed = false;
                if can_transition(run.status, RunStatus::Failed) {
                    failed = db.transition_run(run_id, run.status, RunStatus::Failed, Some(&message))?;
                }
                db.fail_running_attempts(run_id, &message)?;
                Ok(failed)
            })
            .await
            .map_err(PipelineError::Database)?;
        if outcome {
            error!(run_id, error = %cause, "pipeline failed");
        }
        Ok(())
    }

    /// Aggregated input for `phase_number`: the run's subject, topic and
    /// config plus `phase_<m>_output` for every completed phase `m` before it.
    pub async fn gather_phase_input(&self, run: &Run, phase_number: u32) -> PipelineResult<Value> {
        let run_id = run.id;
        let completed = self
            .db
            .call(move |db| db.completed_phase_results(run_id, phase_number))
            .await
            .map_err(PipelineError::Database)?;

        let mut input = Map::new();
        input.insert("subject".into(), Value::String(run.subject.clone()));
        input.insert(
            "topic".into(),
            run.topic.clone().map_or(Value::Null, Value::String),
        );
        input.insert("run_config".into(), Value::Object(run.config.clone()));
        for result in completed {
            input.insert(
                format!("phase_{}_output", result.phase_number),
                result.output_snapshot.unwrap_or(Value::Null),
            );
        }
        Ok(Value::Object(input))
    }

    async fn drive(&self, run_id: i64, first_phase: u32, trace_id: &str) -> PipelineResult<RunOutcome> {
        let mut phase = first_phase;
        loop {
            match self.step(run_id, phase, trace_id).await? {
                PhaseStep::Advance => phase += 1,
                PhaseStep::Finished(outcome) => return Ok(outcome),
            }
        }
    }

    async fn step(&self, run_id: i64, phase_number: u32, trace_id: &str) -> PipelineResult<PhaseStep> {
        if phase_number > TOTAL_PHASES {
            return self.complete_run(run_id, TOTAL_PHASES + 1).await;
        }
        let definition = phase_definition(phase_number)
            .ok_or_else(|| PipelineError::invalid(format!("unknown phase {}", phase_number)))?;
        let agent = self.agents.get(phase_number).ok_or_else(|| {
            PipelineError::invalid(format!(
                "no agent registered for phase {} ({})",
                phase_number, definition.agent_name
            ))
        })?;

        let run = self.load_run(run_id).await?;
        if run.status != RunStatus::Running {
            return Ok(PhaseStep::Finished(RunOutcome::Interrupted {
                phase: phase_number,
                status: run.status,
            }));
        }

        let agent_name = agent.name().to_string();
        let attempt = {
            let agent_name = agent_name.clone();
            let trace = trace_id.to_string();
            self.db
                .call(move |db| {
                    let attempt = db.create_phase_result(run_id, phase_number, &agent_name, &trace)?;
                    if attempt.is_some() {
                        db.set_current_phase(run_id, phase_number)?;
                    }
                    Ok(attempt)
                })
                .await
                .map_err(PipelineError::Database)?
                .ok_or_else(|| {
                    PipelineError::invalid(format!(
                        "phase {} of run {} already has an open attempt",
                        phase_number, run_id
                    ))
                })?
        };
        info!(
            run_id,
            phase = phase_number,
            agent = %agent_name,
            trace_id,
            phase_result_id = attempt.id,
            "phase started"
        );

        let (input, learning) = match self.prepare_attempt(&run, &attempt).await {
            Ok(prepared) => prepared,
            Err(e) => {
                // Leave no running attempt behind to block the next one
                self.abort_run(run_id, &e).await?;
                return Err(e);
            }
        };

        let ctx = AgentContext {
            run_id,
            phase_result_id: attempt.id,
            phase_number,
            trace_id: trace_id.to_string(),
            subject: run.subject.clone(),
            learning,
            generation: self.generation.clone(),
        };
        let started = Instant::now();
        let result = agent.execute(&ctx, &input).await;
        let elapsed = started.elapsed();

        let output = match result {
            Ok(output) => output,
            Err(e) => return Err(self.fail_phase(&attempt, e).await),
        };

        // The run may have been stopped or timed out while the agent worked
        let current = self.load_run(run_id).await?;
        if current.status != RunStatus::Running {
            self.discard_attempt(&attempt, current.status).await?;
            return Ok(PhaseStep::Finished(RunOutcome::Interrupted {
                phase: phase_number,
                status: current.status,
            }));
        }

        let attempt_id = attempt.id;
        let duration_seconds = elapsed.as_secs_f64();
        let recorded = self
            .db
            .call(move |db| db.record_phase_output(attempt_id, &output, duration_seconds))
            .await
            .map_err(PipelineError::Database)?;
        if !recorded {
            return Err(PipelineError::invalid(format!(
                "phase result {} was closed while its agent ran",
                attempt_id
            )));
        }

        if self
            .gate
            .phase_requires_approval(phase_number, &run.config)
            .await?
        {
            let attempt = self.load_attempt(attempt_id).await?;
            let approval = self.gate.open(&attempt).await?;
            let paused = self
                .db
                .call(move |db| db.transition_run(run_id, RunStatus::Running, RunStatus::Paused, None))
                .await
                .map_err(PipelineError::Database)?;
            if !paused {
                let run = self.load_run(run_id).await?;
                warn!(run_id, phase = phase_number, status = %run.status, "run left running before it could pause");
                return Ok(PhaseStep::Finished(RunOutcome::Interrupted {
                    phase: phase_number,
                    status: run.status,
                }));
            }
            info!(
                run_id,
                phase = phase_number,
                agent = %agent_name,
                trace_id,
                approval_id = approval.id,
                duration_ms = elapsed.as_millis() as u64,
                "phase waiting for approval"
            );
            return Ok(PhaseStep::Finished(RunOutcome::Paused {
                phase: phase_number,
                phase_result_id: attempt_id,
                approval_id: approval.id,
            }));
        }

        let completed = self
            .db
            .call(move |db| {
                db.transition_phase_result(attempt_id, PhaseStatus::Running, PhaseStatus::Completed, None)
            })
            .await
            .map_err(PipelineError::Database)?;
        if !completed {
            return Err(PipelineError::invalid(format!(
                "phase result {} was closed before it could complete",
                attempt_id
            )));
        }
        info!(
            run_id,
            phase = phase_number,
            agent = %agent_name,
            trace_id,
            duration_ms = elapsed.as_millis() as u64,
            "phase completed"
        );
        Ok(PhaseStep::Advance)
    }

    /// Aggregate the attempt's input, snapshot it, and load the agent's learning examples.
    async fn prepare_attempt(
        &self,
        run: &Run,
        attempt: &PhaseResult,
    ) -> PipelineResult<(Value, Vec<LearningLogEntry>)> {
        let input = self.gather_phase_input(run, attempt.phase_number).await?;
        let snapshot = input.clone();
        let attempt_id = attempt.id;
        let phase_number = attempt.phase_number;
        let subject = run.subject.clone();
        let learning = self
            .db
            .call(move |db| {
                db.set_phase_input(attempt_id, &snapshot)?;
                db.learning_context(&subject, phase_number, LEARNING_CONTEXT_LIMIT)
            })
            .await
            .map_err(PipelineError::Database)?;
        Ok((input, learning))
    }

    async fn complete_run(&self, run_id: i64, final_phase: u32) -> PipelineResult<PhaseStep> {
        let completed = self
            .db
            .call(move |db| db.complete_run(run_id, final_phase))
            .await
            .map_err(PipelineError::Database)?;
        if !completed {
            let run = self.load_run(run_id).await?;
            return Ok(PhaseStep::Finished(RunOutcome::Interrupted {
                phase: run.current_phase,
                status: run.status,
            }));
        }
        info!(run_id, "pipeline completed");
        Ok(PhaseStep::Finished(RunOutcome::Completed))
    }

    /// Record an agent failure on the attempt and the run, and build the
    /// error handed back to the dispatch boundary.
    async fn fail_phase(&self, attempt: &PhaseResult, cause: anyhow::Error) -> PipelineError {
        let err = PipelineError::AgentExecutionFailure {
            phase: attempt.phase_number,
            message: format!("{:#}", cause),
        };
        let run_id = attempt.run_id;
        let attempt_id = attempt.id;
        let error_log = format!("{:#}", cause);
        let run_message = err.to_string();
        let written = self
            .db
            .call(move |db| {
                db.transition_phase_result(
                    attempt_id,
                    PhaseStatus::Running,
                    PhaseStatus::Failed,
                    Some(&error_log),
                )?;
                // A run stopped meanwhile keeps its own message
                db.transition_run(run_id, RunStatus::Running, RunStatus::Failed, Some(&run_message))
            })
            .await;
        match written {
            Ok(_) => error!(
                run_id,
                phase = attempt.phase_number,
                agent = %attempt.agent_name,
                trace_id = %attempt.trace_id,
                error = %err,
                "phase failed"
            ),
            Err(db_err) => {
                error!(run_id, phase = attempt.phase_number, error = %db_err, "failed to record phase failure");
                return PipelineError::Database(db_err);
            }
        }
        err
    }

    async fn discard_attempt(&self, attempt: &PhaseResult, run_status: RunStatus) -> PipelineResult<()> {
        let attempt_id = attempt.id;
        let note = format!("Output discarded: run was {} when the agent finished", run_status);
        self.db
            .call(move |db| {
                db.transition_phase_result(attempt_id, PhaseStatus::Running, PhaseStatus::Failed, Some(&note))
            })
            .await
            .map_err(PipelineError::Database)?;
        warn!(
            run_id = attempt.run_id,
            phase = attempt.phase_number,
            trace_id = %attempt.trace_id,
            status = %run_status,
            "discarded agent output for a run that is no longer running"
        );
        Ok(())
    }

    async fn swap_run_status(
        &self,
        run_id: i64,
        from: RunStatus,
        to: RunStatus,
        message: Option<&str>,
    ) -> PipelineResult<()> {
        let message = message.map(String::from);
        let swapped = self
            .db
            .call(move |db| db.transition_run(run_id, from, to, message.as_deref()))
            .await
            .map_err(PipelineError::Database)?;
        if swapped {
            Ok(())
        } else {
            Err(PipelineError::invalid(format!(
                "run {} is no longer {}; it changed state concurrently",
                run_id, from
            )))
        }
    }

    async fn load_run(&self, run_id: i64) -> PipelineResult<Run> {
        self.db
            .call(move |db| db.get_run(run_id))
            .await
            .map_err(PipelineError::Database)?
            .ok_or_else(|| PipelineError::not_found("Run", run_id))
    }

    async fn load_attempt(&self, phase_result_id: i64) -> PipelineResult<PhaseResult> {
        self.db
            .call(move |db| db.get_phase_result(phase_result_id))
            .await
            .map_err(PipelineError::Database)?
            .ok_or_else(|| PipelineError::not_found("PhaseResult", phase_result_id))
    }

    async fn latest_attempt(&self, run_id: i64, phase_number: u32) -> PipelineResult<PhaseResult> {
        self.db
            .call(move |db| db.latest_phase_result(run_id, phase_number))
            .await
            .map_err(PipelineError::Database)?
            .ok_or_else(|| {
                PipelineError::invalid(format!(
                    "phase {} of run {} has no result",
                    phase_number, run_id
                ))
            })
    }
}
