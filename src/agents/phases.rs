//! Built-in agents: one prompt brief per phase, all backed by the injected
//! generation client.

use std::fmt::Write as _;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::debug;

use super::client::GenerationRequest;
use super::{Agent, AgentContext};
use crate::pipeline::state::phase_definition;
use crate::util::{ParsedResponse, parse_json_response};

const SYSTEM_PROMPT: &str = "You are part of an automated digital-product studio. \
Respond with a single JSON object and nothing else.";

struct PhaseBrief {
    phase_number: u32,
    task: &'static str,
    /// Earlier phases whose output this phase reads.
    depends_on: &'static [u32],
}

static BRIEFS: [PhaseBrief; 8] = [
    PhaseBrief {
        phase_number: 1,
        task: "Identify rising trends and search demand around the subject. \
               Return {\"trends\": [...], \"opportunities\": [...], \"summary\": \"...\"}.",
        depends_on: &[],
    },
    PhaseBrief {
        phase_number: 2,
        task: "Validate whether the niche has paying demand and beatable competition. \
               Return {\"viable\": bool, \"score\": 0-10, \"competitors\": [...], \"risks\": [...]}.",
        depends_on: &[1],
    },
    PhaseBrief {
        phase_number: 3,
        task: "Profile the target audience: personas, pains, desires and objections. \
               Return {\"personas\": [...], \"pain_points\": [...], \"objections\": [...]}.",
        depends_on: &[1, 2],
    },
    PhaseBrief {
        phase_number: 4,
        task: "Design the product: title, promise, modules and lessons, price point. \
               Return {\"title\": \"...\", \"promise\": \"...\", \"modules\": [...], \"price\": number}.",
        depends_on: &[2, 3],
    },
    PhaseBrief {
        phase_number: 5,
        task: "Write the product content for every module in the structure. \
               Return {\"modules\": [{\"title\": \"...\", \"content\": \"...\"}]}.",
        depends_on: &[3, 4],
    },
    PhaseBrief {
        phase_number: 6,
        task: "Describe the visual identity and cover/mockup assets for the product. \
               Return {\"palette\": [...], \"typography\": \"...\", \"assets\": [...]}.",
        depends_on: &[4, 5],
    },
    PhaseBrief {
        phase_number: 7,
        task: "Build the sales funnel and copy: landing page sections, email sequence, upsells. \
               Return {\"landing_page\": {...}, \"emails\": [...], \"upsells\": [...]}.",
        depends_on: &[3, 4, 6],
    },
    PhaseBrief {
        phase_number: 8,
        task: "Plan the launch campaign: channels, ad angles, budget split and schedule. \
               Return {\"channels\": [...], \"ads\": [...], \"budget\": {...}, \"schedule\": [...]}.",
        depends_on: &[3, 7],
    },
];

/// Agent for one phase of the catalogue.
pub struct PhaseAgent {
    phase_number: u32,
    name: &'static str,
    brief: &'static PhaseBrief,
}

impl PhaseAgent {
    pub fn phase_number(&self) -> u32 {
        self.phase_number
    }

    fn build_prompt(&self, ctx: &AgentContext, input: &Value) -> String {
        let mut prompt = String::new();
        let _ = writeln!(prompt, "SUBJECT: {}", ctx.subject);
        if let Some(topic) = input.get("topic").and_then(Value::as_str) {
            let _ = writeln!(prompt, "TOPIC: {}", topic);
        }
        let _ = writeln!(prompt, "\nTASK:\n{}", self.brief.task);

        for dep in self.brief.depends_on {
            let key = format!("phase_{}_output", dep);
            if let Some(output) = input.get(&key) {
                let title = phase_definition(*dep).map_or("Earlier phase", |p| p.name);
                let _ = writeln!(prompt, "\n{} (phase {}):\n{}", title.to_uppercase(), dep, output);
            }
        }

        if !ctx.learning.is_empty() {
            let _ = writeln!(prompt, "\nPAST APPROVED RESULTS FOR THIS SUBJECT:");
            for entry in &ctx.learning {
                let score = entry
                    .performance_score
                    .map_or_else(|| "N/A".to_string(), |s| s.to_string());
                let _ = writeln!(prompt, "- Score: {} | {}", score, entry.output_summary);
            }
        }
        prompt
    }
}

#[async_trait]
impl Agent for PhaseAgent {
    fn name(&self) -> &str {
        self.name
    }

    async fn execute(&self, ctx: &AgentContext, input: &Value) -> Result<Value> {
        let request = GenerationRequest {
            system_prompt: Some(SYSTEM_PROMPT.to_string()),
            prompt: self.build_prompt(ctx, input),
            json_mode: true,
        };
        debug!(
            run_id = ctx.run_id,
            phase = self.phase_number,
            agent = self.name,
            trace_id = %ctx.trace_id,
            "calling generation service"
        );
        let response = ctx.generation.generate(&request).await?;
        match parse_json_response(&response) {
            ParsedResponse::Parsed(result) => Ok(json!({
                "phase": self.phase_number,
                "agent": self.name,
                "result": result,
            })),
            ParsedResponse::Malformed(excerpt) => Err(anyhow!(
                "could not parse JSON from {} response: {}",
                self.name,
                excerpt
            )),
        }
    }
}

/// One agent per catalogue entry, in phase order.
pub fn standard_agents() -> Vec<PhaseAgent> {
    BRIEFS
        .iter()
        .filter_map(|brief| {
            phase_definition(brief.phase_number).map(|def| PhaseAgent {
                phase_number: def.number,
                name: def.agent_name,
                brief,
            })
        })
        .collect()
}
