//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module      | Commands handled            |
//! |-------------|-----------------------------|
//! | `service`   | `Init`, `Serve`, `Worker`   |
//! | `run`       | `Run`                       |
//! | `approvals` | `Approvals`                 |
//! | `toggles`   | `Toggles`                   |

pub mod approvals;
pub mod run;
pub mod service;
pub mod toggles;

pub use approvals::cmd_approvals;
pub use run::cmd_run;
pub use service::{cmd_init, cmd_serve, cmd_worker};
pub use toggles::cmd_toggles;

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;

use pipewright::agents::AgentRegistry;
use pipewright::agents::client::HttpGenerationClient;
use pipewright::config::Settings;
use pipewright::pipeline::db::{DbHandle, PipelineDb};
use pipewright::pipeline::dispatch::TaskDispatcher;
use pipewright::pipeline::driver::RunDriver;

/// Open the database (seeding default toggles) and assemble the driver and
/// dispatcher the commands run against.
pub fn open_dispatcher(settings: &Settings) -> Result<TaskDispatcher> {
    let db = PipelineDb::new(&settings.database.path).with_context(|| {
        format!(
            "Failed to open pipeline database at {}",
            settings.database.path.display()
        )
    })?;
    db.seed_phase_toggles()?;

    let generation = HttpGenerationClient::new(
        &settings.generation.base_url,
        &settings.generation.model,
        settings.generation.api_key.clone(),
        settings.request_timeout(),
        settings.retry_policy(),
    )?;
    let agents = AgentRegistry::standard();
    agents.ensure_complete()?;
    let driver = RunDriver::new(DbHandle::new(db), agents, Arc::new(generation));
    Ok(TaskDispatcher::new(driver, settings.dispatch_limits()))
}

pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("Failed to render JSON")?;
    println!("{}", rendered);
    Ok(())
}
