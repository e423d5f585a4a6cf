//! Reviewer commands: `pipewright approvals …`.

use anyhow::{Context, Result};
use serde_json::Value;

use pipewright::config::Settings;
use pipewright::pipeline::models::ApprovalStatus;

use super::{open_dispatcher, print_json};

pub enum ApprovalsAction {
    List,
    Show {
        id: i64,
    },
    Resolve {
        id: i64,
        decision: String,
        notes: Option<String>,
        edited_output: Option<String>,
        inline: bool,
    },
}

/// Accepts inline JSON, or `@path` to read it from a file.
fn read_edited_output(raw: &str) -> Result<Value> {
    let text = match raw.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read edited output from {}", path))?,
        None => raw.to_string(),
    };
    serde_json::from_str(&text).context("Edited output must be valid JSON")
}

pub async fn cmd_approvals(settings: &Settings, action: ApprovalsAction) -> Result<()> {
    let dispatcher = open_dispatcher(settings)?;
    let driver = dispatcher.driver();

    match action {
        ApprovalsAction::List => {
            let pending = driver
                .db()
                .call(|db| db.pending_approval_details())
                .await?;
            if pending.is_empty() {
                println!("No pending approvals.");
                return Ok(());
            }
            println!("{:<6} {:<6} {:<6} PHASE NAME", "ID", "RUN", "PHASE");
            for detail in pending {
                println!(
                    "{:<6} {:<6} {:<6} {}",
                    detail.approval.id,
                    detail.approval.run_id,
                    detail.approval.phase_number,
                    detail.phase_name
                );
            }
        }
        ApprovalsAction::Show { id } => {
            let detail = driver
                .db()
                .call(move |db| db.get_approval(id)?.map(|a| db.approval_detail(a)).transpose())
                .await?
                .with_context(|| format!("Approval {} not found", id))?;
            print_json(&detail)?;
        }
        ApprovalsAction::Resolve {
            id,
            decision,
            notes,
            edited_output,
            inline,
        } => {
            let edited_output = edited_output.as_deref().map(read_edited_output).transpose()?;
            let approval = driver
                .gate()
                .resolve(id, &decision, notes, edited_output)
                .await?;
            println!("Approval {} is now {}", approval.id, approval.status);

            if matches!(approval.status, ApprovalStatus::Approved | ApprovalStatus::Edited) {
                if inline {
                    let outcome = driver
                        .resume_after_approval(approval.run_id, approval.phase_number)
                        .await?;
                    print_json(&outcome)?;
                } else {
                    let task = dispatcher
                        .enqueue_resume(approval.run_id, approval.phase_number)
                        .await?;
                    println!("Queued resume of run {} as task {}", approval.run_id, task.id);
                }
            }
        }
    }
    Ok(())
}
