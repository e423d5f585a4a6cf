//! Approval gate: per-phase sign-off policy and the approval lifecycle.

use serde_json::{Map, Value};
use tracing::info;

use super::db::{DbHandle, NewLearningEntry, ResolutionRecord};
use super::models::{Approval, ApprovalStatus, Decision, PhaseResult, PhaseStatus, PhaseToggle, RunStatus};
use crate::errors::{PipelineError, PipelineResult};

/// Learning-log summaries keep this many characters of the serialized output.
pub const OUTPUT_SUMMARY_CHARS: usize = 1000;

/// Run-config key holding per-phase approval overrides, keyed by phase number.
pub const APPROVAL_OVERRIDES_KEY: &str = "approval_overrides";

/// Decide whether a phase needs human sign-off.
///
/// A per-run override wins over the global toggle; a missing toggle means
/// approval is required. Override values that are not booleans count as `true`.
pub fn requires_approval(
    phase_number: u32,
    run_config: &Map<String, Value>,
    toggle: Option<&PhaseToggle>,
) -> bool {
    if let Some(value) = approval_override(phase_number, run_config) {
        return value.as_bool().unwrap_or(true);
    }
    toggle.is_none_or(|t| t.requires_approval)
}

fn approval_override(phase_number: u32, run_config: &Map<String, Value>) -> Option<&Value> {
    run_config
        .get(APPROVAL_OVERRIDES_KEY)?
        .as_object()?
        .get(&phase_number.to_string())
}

/// Serialized output, cut to [`OUTPUT_SUMMARY_CHARS`] characters.
pub fn summarize_output(output: Option<&Value>) -> String {
    let text = match output {
        Some(value) => value.to_string(),
        None => String::new(),
    };
    text.chars().take(OUTPUT_SUMMARY_CHARS).collect()
}

#[derive(Clone)]
pub struct ApprovalGate {
    db: DbHandle,
}

impl ApprovalGate {
    pub fn new(db: DbHandle) -> Self {
        Self { db }
    }

    /// [`requires_approval`] against the stored toggle. The toggle is only
    /// read when the run carries no override for the phase.
    pub async fn phase_requires_approval(
        &self,
        phase_number: u32,
        run_config: &Map<String, Value>,
    ) -> PipelineResult<bool> {
        if approval_override(phase_number, run_config).is_some() {
            return Ok(requires_approval(phase_number, run_config, None));
        }
        let toggle = self
            .db
            .call(move |db| db.get_phase_toggle(phase_number))
            .await
            .map_err(PipelineError::Database)?;
        Ok(requires_approval(phase_number, run_config, toggle.as_ref()))
    }

    /// Open a pending approval for a running attempt and park the attempt
    /// in `waiting_approval`.
    pub async fn open(&self, phase_result: &PhaseResult) -> PipelineResult<Approval> {
        let phase_result = phase_result.clone();
        self.db
            .call(move |db| db.open_approval(&phase_result))
            .await
            .map_err(PipelineError::Database)
    }

    /// Record a reviewer's decision. Does not advance the run; callers
    /// resume it after an `approved` or `edited` resolution.
    pub async fn resolve(
        &self,
        approval_id: i64,
        decision: &str,
        notes: Option<String>,
        edited_output: Option<Value>,
    ) -> PipelineResult<Approval> {
        let stated: Decision = decision.parse().map_err(PipelineError::InvalidArgument)?;
        // Supplying an edit always makes the decision an edit
        let decision = if edited_output.is_some() {
            Decision::Edited
        } else {
            stated
        };

        let approval = self
            .db
            .call(move |db| db.get_approval(approval_id))
            .await
            .map_err(PipelineError::Database)?
            .ok_or_else(|| PipelineError::not_found("Approval", approval_id))?;
        if approval.status != ApprovalStatus::Pending {
            return Err(already_resolved(&approval));
        }

        let phase_result_id = approval.phase_result_id;
        let run_id = approval.run_id;
        let (phase_result, run) = self
            .db
            .call(move |db| Ok((db.get_phase_result(phase_result_id)?, db.get_run(run_id)?)))
            .await
            .map_err(PipelineError::Database)?;
        let phase_result =
            phase_result.ok_or_else(|| PipelineError::not_found("PhaseResult", phase_result_id))?;
        let run = run.ok_or_else(|| PipelineError::not_found("Run", run_id))?;

        let final_output = edited_output.as_ref().or(phase_result.output_snapshot.as_ref());
        let record = ResolutionRecord {
            approval_id,
            status: decision.approval_status(),
            reviewer_notes: notes,
            edited_output: edited_output.clone(),
            phase_status: if decision.is_forward() {
                PhaseStatus::Approved
            } else {
                PhaseStatus::Rejected
            },
            learning: NewLearningEntry {
                run_id,
                phase_number: approval.phase_number,
                agent_name: phase_result.agent_name.clone(),
                subject: run.subject.clone(),
                output_summary: summarize_output(final_output),
                feedback: decision,
            },
        };

        let resolved = self
            .db
            .call(move |db| db.apply_resolution(&record))
            .await
            .map_err(PipelineError::Database)?
            .ok_or_else(|| already_resolved(&approval))?;

        info!(
            run_id,
            phase = resolved.phase_number,
            approval_id,
            decision = %decision,
            run_paused = run.status == RunStatus::Paused,
            "approval resolved"
        );
        Ok(resolved)
    }
}

fn already_resolved(approval: &Approval) -> PipelineError {
    PipelineError::invalid(format!(
        "approval {} is already resolved ({})",
        approval.id, approval.status
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::db::PipelineDb;
    use serde_json::json;

    fn toggle(requires_approval: bool) -> PhaseToggle {
        PhaseToggle {
            phase_number: 3,
            phase_name: "Audience & Pain Points".into(),
            requires_approval,
            is_enabled: true,
        }
    }

    fn config(overrides: Value) -> Map<String, Value> {
        let mut config = Map::new();
        config.insert(APPROVAL_OVERRIDES_KEY.into(), overrides);
        config
    }

    #[test]
    fn missing_toggle_requires_approval() {
        assert!(requires_approval(3, &Map::new(), None));
    }

    #[test]
    fn toggle_decides_without_override() {
        assert!(!requires_approval(3, &Map::new(), Some(&toggle(false))));
        assert!(requires_approval(3, &Map::new(), Some(&toggle(true))));
    }

    #[test]
    fn override_beats_toggle() {
        let cfg = config(json!({"3": false}));
        assert!(!requires_approval(3, &cfg, Some(&toggle(true))));
        let cfg = config(json!({"3": true}));
        assert!(requires_approval(3, &cfg, Some(&toggle(false))));
        // Overrides for other phases do not apply
        assert!(!requires_approval(3, &config(json!({"4": true})), Some(&toggle(false))));
    }

    #[test]
    fn non_boolean_override_requires_approval() {
        let cfg = config(json!({"3": "no"}));
        assert!(requires_approval(3, &cfg, Some(&toggle(false))));
        // A malformed overrides map is ignored entirely
        let cfg = config(json!(["3"]));
        assert!(!requires_approval(3, &cfg, Some(&toggle(false))));
    }

    #[test]
    fn summary_is_truncated_on_char_boundaries() {
        let long = json!({"text": "é".repeat(2000)});
        let summary = summarize_output(Some(&long));
        assert_eq!(summary.chars().count(), OUTPUT_SUMMARY_CHARS);
        assert_eq!(summarize_output(None), "");
        assert_eq!(summarize_output(Some(&json!({"a": 1}))), r#"{"a":1}"#);
    }

    struct Fixture {
        db: DbHandle,
        gate: ApprovalGate,
        run_id: i64,
        phase_result_id: i64,
        approval_id: i64,
    }

    fn paused_fixture() -> anyhow::Result<Fixture> {
        let db = PipelineDb::new_in_memory()?;
        let run = db.create_run("keto diet", None, &Map::new())?;
        db.transition_run(run.id, RunStatus::Pending, RunStatus::Running, None)?;
        let pr = db
            .create_phase_result(run.id, 1, "trend_discovery", "abcd1234")?
            .expect("attempt");
        db.record_phase_output(pr.id, &json!({"trends": ["keto snacks"]}), 1.0)?;
        let pr = db.get_phase_result(pr.id)?.expect("attempt");
        let approval = db.open_approval(&pr)?;
        db.transition_run(run.id, RunStatus::Running, RunStatus::Paused, None)?;
        let db = DbHandle::new(db);
        Ok(Fixture {
            gate: ApprovalGate::new(db.clone()),
            db,
            run_id: run.id,
            phase_result_id: pr.id,
            approval_id: approval.id,
        })
    }

    #[tokio::test]
    async fn stored_toggle_is_consulted() -> anyhow::Result<()> {
        let f = paused_fixture()?;
        f.db.lock_sync()?.update_phase_toggle(2, "Niche Validation", Some(false), None)?;
        assert!(!f.gate.phase_requires_approval(2, &Map::new()).await?);
        assert!(f.gate.phase_requires_approval(5, &Map::new()).await?);
        let cfg = config(json!({"2": true}));
        assert!(f.gate.phase_requires_approval(2, &cfg).await?);
        Ok(())
    }

    #[tokio::test]
    async fn approve_marks_phase_approved_and_logs() -> anyhow::Result<()> {
        let f = paused_fixture()?;
        let approval = f
            .gate
            .resolve(f.approval_id, "approved", Some("ship it".into()), None)
            .await?;
        assert_eq!(approval.status, ApprovalStatus::Approved);
        assert_eq!(approval.reviewer_notes.as_deref(), Some("ship it"));

        let db = f.db.lock_sync()?;
        let pr = db.get_phase_result(f.phase_result_id)?.unwrap();
        assert_eq!(pr.status, PhaseStatus::Approved);
        // Resolving never advances the run
        assert_eq!(db.get_run(f.run_id)?.unwrap().status, RunStatus::Paused);
        let log = db.list_learning_entries(Some("keto diet"), Some(1), 10)?;
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].feedback, Decision::Approved);
        assert_eq!(log[0].agent_name, "trend_discovery");
        assert!(log[0].output_summary.contains("keto snacks"));
        Ok(())
    }

    #[tokio::test]
    async fn edited_output_forces_edited_decision() -> anyhow::Result<()> {
        let f = paused_fixture()?;
        let edited = json!({"trends": ["low-carb baking"]});
        let approval = f
            .gate
            .resolve(f.approval_id, "rejected", None, Some(edited.clone()))
            .await?;
        assert_eq!(approval.status, ApprovalStatus::Edited);
        assert_eq!(approval.edited_output, Some(edited.clone()));

        let db = f.db.lock_sync()?;
        let pr = db.get_phase_result(f.phase_result_id)?.unwrap();
        assert_eq!(pr.status, PhaseStatus::Approved);
        assert_eq!(pr.output_snapshot, Some(edited));
        let log = db.list_learning_entries(None, None, 10)?;
        assert_eq!(log[0].feedback, Decision::Edited);
        assert!(log[0].output_summary.contains("low-carb baking"));
        Ok(())
    }

    #[tokio::test]
    async fn reject_leaves_run_paused() -> anyhow::Result<()> {
        let f = paused_fixture()?;
        let approval = f.gate.resolve(f.approval_id, "rejected", None, None).await?;
        assert_eq!(approval.status, ApprovalStatus::Rejected);

        let db = f.db.lock_sync()?;
        assert_eq!(
            db.get_phase_result(f.phase_result_id)?.unwrap().status,
            PhaseStatus::Rejected
        );
        assert_eq!(db.get_run(f.run_id)?.unwrap().status, RunStatus::Paused);
        Ok(())
    }

    #[tokio::test]
    async fn invalid_decision_mutates_nothing() -> anyhow::Result<()> {
        let f = paused_fixture()?;
        let err = f
            .gate
            .resolve(f.approval_id, "maybe", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidArgument(_)));

        let db = f.db.lock_sync()?;
        assert_eq!(
            db.get_approval(f.approval_id)?.unwrap().status,
            ApprovalStatus::Pending
        );
        assert!(db.list_learning_entries(None, None, 10)?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn second_resolution_is_rejected() -> anyhow::Result<()> {
        let f = paused_fixture()?;
        f.gate.resolve(f.approval_id, "approved", None, None).await?;
        let err = f
            .gate
            .resolve(f.approval_id, "rejected", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidArgument(_)));
        assert!(err.to_string().contains("already resolved"));
        Ok(())
    }

    #[tokio::test]
    async fn unknown_approval_is_not_found() -> anyhow::Result<()> {
        let f = paused_fixture()?;
        let err = f.gate.resolve(9999, "approved", None, None).await.unwrap_err();
        assert!(matches!(err, PipelineError::NotFound { entity: "Approval", id: 9999 }));
        Ok(())
    }
}
