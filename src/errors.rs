//! Typed error hierarchy for the pipeline core.
//!
//! `PipelineError` is the single error type surfaced by the run driver, the
//! approval gate and the dispatch boundary:
//! - `NotFound` / `InvalidArgument`: local, return-to-caller, nothing mutated
//! - `AgentExecutionFailure` / `TimeoutFailure`: fatal to the run, no automatic retry
//! - `Database` / `Other`: infrastructure failures

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Phase {phase} failed: {message}")]
    AgentExecutionFailure { phase: u32, message: String },

    #[error("Phase {phase} failed: {} time limit of {limit_secs}s exceeded", limit_kind(.hard))]
    TimeoutFailure { phase: u32, limit_secs: u64, hard: bool },

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    pub fn not_found(entity: &'static str, id: i64) -> Self {
        Self::NotFound { entity, id }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    /// Agent and timeout failures end the run; everything else leaves it untouched.
    pub fn is_fatal_to_run(&self) -> bool {
        matches!(
            self,
            Self::AgentExecutionFailure { .. } | Self::TimeoutFailure { .. }
        )
    }
}

fn limit_kind(hard: &bool) -> &'static str {
    if *hard { "hard" } else { "soft" }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_carries_entity_and_id() {
        let err = PipelineError::not_found("Run", 42);
        match &err {
            PipelineError::NotFound { entity, id } => {
                assert_eq!(*entity, "Run");
                assert_eq!(*id, 42);
            }
            _ => panic!("Expected NotFound"),
        }
        assert_eq!(err.to_string(), "Run 42 not found");
    }

    #[test]
    fn agent_failure_message_embeds_phase_and_cause() {
        let err = PipelineError::AgentExecutionFailure {
            phase: 3,
            message: "upstream returned 502".to_string(),
        };
        assert_eq!(err.to_string(), "Phase 3 failed: upstream returned 502");
    }

    #[test]
    fn timeout_message_distinguishes_soft_and_hard() {
        let soft = PipelineError::TimeoutFailure {
            phase: 5,
            limit_secs: 600,
            hard: false,
        };
        let hard = PipelineError::TimeoutFailure {
            phase: 5,
            limit_secs: 900,
            hard: true,
        };
        assert!(soft.to_string().contains("soft time limit of 600s"));
        assert!(hard.to_string().contains("hard time limit of 900s"));
    }

    #[test]
    fn only_agent_and_timeout_failures_are_fatal() {
        assert!(
            PipelineError::AgentExecutionFailure {
                phase: 1,
                message: "x".into()
            }
            .is_fatal_to_run()
        );
        assert!(
            PipelineError::TimeoutFailure {
                phase: 1,
                limit_secs: 1,
                hard: true
            }
            .is_fatal_to_run()
        );
        assert!(!PipelineError::not_found("Approval", 1).is_fatal_to_run());
        assert!(!PipelineError::invalid("bad decision").is_fatal_to_run());
        assert!(!PipelineError::Other(anyhow::anyhow!("io")).is_fatal_to_run());
    }

    #[test]
    fn converts_from_anyhow() {
        let err: PipelineError = anyhow::anyhow!("disk full").into();
        assert!(matches!(err, PipelineError::Other(_)));
        assert_eq!(err.to_string(), "disk full");
    }
}
