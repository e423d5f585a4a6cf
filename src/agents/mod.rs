//! Phase agents and the registry the run driver resolves them from.

pub mod client;
pub mod phases;

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::errors::{PipelineError, PipelineResult};
use crate::pipeline::models::LearningLogEntry;
use crate::pipeline::state::{TOTAL_PHASES, phase_definition};
use client::GenerationClient;

/// Everything an agent gets besides its aggregated input.
#[derive(Clone)]
pub struct AgentContext {
    pub run_id: i64,
    pub phase_result_id: i64,
    pub phase_number: u32,
    pub trace_id: String,
    pub subject: String,
    /// Approved or edited outputs from earlier runs on the same subject and phase.
    pub learning: Vec<LearningLogEntry>,
    pub generation: Arc<dyn GenerationClient>,
}

/// One unit of phase work. Any error is treated by the driver as a phase failure.
#[async_trait]
pub trait Agent: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self, ctx: &AgentContext, input: &Value) -> Result<Value>;
}

/// Fixed mapping from phase number to agent, built once at startup.
#[derive(Clone, Default)]
pub struct AgentRegistry {
    agents: BTreeMap<u32, Arc<dyn Agent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry with the built-in agent for every phase.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        for agent in phases::standard_agents() {
            let number = agent.phase_number();
            registry.agents.insert(number, Arc::new(agent));
        }
        registry
    }

    /// Register `agent` for `phase_number`. Unknown phases and agents whose
    /// name does not match the phase catalogue are rejected here rather than
    /// at call time.
    pub fn register(&mut self, phase_number: u32, agent: Arc<dyn Agent>) -> PipelineResult<()> {
        let definition = phase_definition(phase_number).ok_or_else(|| {
            PipelineError::invalid(format!(
                "unknown phase {} (phases are 1..={})",
                phase_number, TOTAL_PHASES
            ))
        })?;
        if agent.name() != definition.agent_name {
            return Err(PipelineError::invalid(format!(
                "unknown agent name '{}' for phase {} (expected '{}')",
                agent.name(),
                phase_number,
                definition.agent_name
            )));
        }
        self.agents.insert(phase_number, agent);
        Ok(())
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, phase_number: u32, agent: Arc<dyn Agent>) -> PipelineResult<Self> {
        self.register(phase_number, agent)?;
        Ok(self)
    }

    pub fn get(&self, phase_number: u32) -> Option<Arc<dyn Agent>> {
        self.agents.get(&phase_number).cloned()
    }

    /// Fail unless every phase has an agent.
    pub fn ensure_complete(&self) -> PipelineResult<()> {
        let missing: Vec<String> = (1..=TOTAL_PHASES)
            .filter(|n| !self.agents.contains_key(n))
            .map(|n| n.to_string())
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(PipelineError::invalid(format!(
                "no agent registered for phase(s) {}",
                missing.join(", ")
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str);

    #[async_trait]
    impl Agent for Named {
        fn name(&self) -> &str {
            self.0
        }

        async fn execute(&self, _ctx: &AgentContext, _input: &Value) -> Result<Value> {
            Ok(Value::Null)
        }
    }

    #[test]
    fn standard_registry_is_complete() {
        let registry = AgentRegistry::standard();
        registry.ensure_complete().unwrap();
        assert_eq!(registry.get(5).unwrap().name(), "content_writer");
    }

    #[test]
    fn register_rejects_unknown_phase() {
        let mut registry = AgentRegistry::new();
        let err = registry
            .register(9, Arc::new(Named("trend_discovery")))
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidArgument(_)));
        assert!(registry.get(9).is_none());
    }

    #[test]
    fn register_rejects_mismatched_agent_name() {
        let mut registry = AgentRegistry::new();
        let err = registry.register(2, Arc::new(Named("designer"))).unwrap_err();
        assert!(err.to_string().contains("unknown agent name 'designer'"));
    }

    #[test]
    fn ensure_complete_lists_missing_phases() {
        let registry = AgentRegistry::new()
            .with(1, Arc::new(Named("trend_discovery")))
            .unwrap();
        let err = registry.ensure_complete().unwrap_err();
        assert!(err.to_string().contains("2, 3, 4, 5, 6, 7, 8"));
    }
}
