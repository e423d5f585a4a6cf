//! Run and phase state machines plus the fixed phase catalogue.
//!
//! Every status write in the crate goes through [`can_transition`]; the
//! storage layer refuses compare-and-set updates whose edge is not listed
//! here.

use super::models::{PhaseStatus, RunStatus};
use crate::errors::{PipelineError, PipelineResult};

/// Number of phases in every run.
pub const TOTAL_PHASES: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseDefinition {
    pub number: u32,
    pub name: &'static str,
    pub agent_name: &'static str,
}

pub const PHASES: [PhaseDefinition; TOTAL_PHASES as usize] = [
    PhaseDefinition {
        number: 1,
        name: "Trend Discovery",
        agent_name: "trend_discovery",
    },
    PhaseDefinition {
        number: 2,
        name: "Niche Validation",
        agent_name: "niche_validator",
    },
    PhaseDefinition {
        number: 3,
        name: "Audience & Pain Points",
        agent_name: "audience_profiler",
    },
    PhaseDefinition {
        number: 4,
        name: "Product Structure",
        agent_name: "product_architect",
    },
    PhaseDefinition {
        number: 5,
        name: "Content Writing",
        agent_name: "content_writer",
    },
    PhaseDefinition {
        number: 6,
        name: "Visual Design",
        agent_name: "designer",
    },
    PhaseDefinition {
        number: 7,
        name: "Funnel & Copy",
        agent_name: "funnel_builder",
    },
    PhaseDefinition {
        number: 8,
        name: "Campaign Launch",
        agent_name: "campaign_launcher",
    },
];

/// Look up a phase by its 1-based number.
pub fn phase_definition(number: u32) -> Option<&'static PhaseDefinition> {
    if number == 0 {
        return None;
    }
    PHASES.get((number - 1) as usize)
}

pub fn phase_name(number: u32) -> &'static str {
    phase_definition(number).map_or("Unknown", |p| p.name)
}

/// A status type with a fixed table of permitted successors.
pub trait Transition: Copy + PartialEq + std::fmt::Display + 'static {
    fn allowed_targets(self) -> &'static [Self];
}

impl Transition for RunStatus {
    fn allowed_targets(self) -> &'static [Self] {
        use RunStatus::*;
        match self {
            Pending => &[Running, Failed],
            Running => &[Paused, Completed, Failed],
            Paused => &[Running, Failed],
            Completed => &[],
            Failed => &[Pending],
        }
    }
}

impl Transition for PhaseStatus {
    fn allowed_targets(self) -> &'static [Self] {
        use PhaseStatus::*;
        match self {
            Pending => &[Running],
            Running => &[Completed, WaitingApproval, Failed],
            WaitingApproval => &[Approved, Rejected],
            Approved => &[Completed],
            Rejected => &[Running],
            Completed => &[],
            Failed => &[Pending],
        }
    }
}

/// Pure check: is `current -> target` listed in the status type's table?
pub fn can_transition<S: Transition>(current: S, target: S) -> bool {
    current.allowed_targets().contains(&target)
}

/// Like [`can_transition`] but produces an `InvalidArgument` naming the edge.
pub fn ensure_transition<S: Transition>(what: &str, current: S, target: S) -> PipelineResult<()> {
    if can_transition(current, target) {
        Ok(())
    } else {
        Err(PipelineError::invalid(format!(
            "{} cannot move from '{}' to '{}'",
            what, current, target
        )))
    }
}
