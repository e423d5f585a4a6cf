//! Global approval toggles: `pipewright toggles …`.

use anyhow::{Result, bail};

use pipewright::config::Settings;
use pipewright::pipeline::db::PipelineDb;
use pipewright::pipeline::state::phase_definition;

pub enum TogglesAction {
    List,
    Set {
        phase: u32,
        requires_approval: Option<bool>,
        enabled: Option<bool>,
    },
}

pub fn cmd_toggles(settings: &Settings, action: TogglesAction) -> Result<()> {
    let db = PipelineDb::new(&settings.database.path)?;
    db.seed_phase_toggles()?;

    match action {
        TogglesAction::List => {
            println!("{:<6} {:<24} {:<10} ENABLED", "PHASE", "NAME", "APPROVAL");
            for toggle in db.list_phase_toggles()? {
                println!(
                    "{:<6} {:<24} {:<10} {}",
                    toggle.phase_number,
                    toggle.phase_name,
                    if toggle.requires_approval { "required" } else { "skipped" },
                    toggle.is_enabled
                );
            }
        }
        TogglesAction::Set {
            phase,
            requires_approval,
            enabled,
        } => {
            let Some(definition) = phase_definition(phase) else {
                bail!("Unknown phase {}", phase);
            };
            if requires_approval.is_none() && enabled.is_none() {
                bail!("Nothing to change: pass --requires-approval and/or --enabled");
            }
            let toggle =
                db.update_phase_toggle(phase, definition.name, requires_approval, enabled)?;
            println!(
                "Phase {} ({}): requires_approval={} is_enabled={}",
                toggle.phase_number, toggle.phase_name, toggle.requires_approval, toggle.is_enabled
            );
        }
    }
    Ok(())
}
