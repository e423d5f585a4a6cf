//! Run management: `pipewright run …`.

use anyhow::{Context, Result, bail};
use serde_json::{Map, Value};

use pipewright::config::Settings;
use pipewright::pipeline::models::RunStatus;

use super::{open_dispatcher, print_json};

pub enum RunAction {
    Create {
        subject: String,
        topic: Option<String>,
        config: Option<String>,
        start: bool,
    },
    List {
        status: Option<String>,
        limit: i64,
    },
    Show {
        id: i64,
    },
    Start {
        id: i64,
        inline: bool,
    },
    Stop {
        id: i64,
    },
    Restart {
        id: i64,
    },
    Retry {
        id: i64,
        phase: u32,
        inline: bool,
    },
}

fn parse_run_config(raw: Option<&str>) -> Result<Map<String, Value>> {
    let Some(raw) = raw else {
        return Ok(Map::new());
    };
    match serde_json::from_str(raw).context("--config-json must be valid JSON")? {
        Value::Object(map) => Ok(map),
        other => bail!("--config-json must be a JSON object, got {}", other),
    }
}

pub async fn cmd_run(settings: &Settings, action: RunAction) -> Result<()> {
    let dispatcher = open_dispatcher(settings)?;
    let driver = dispatcher.driver();

    match action {
        RunAction::Create {
            subject,
            topic,
            config,
            start,
        } => {
            let config = parse_run_config(config.as_deref())?;
            let run = driver.create_run(&subject, topic.as_deref(), config).await?;
            println!("Created run {} for '{}'", run.id, run.subject);
            if start {
                let task = dispatcher.enqueue_start(run.id).await?;
                println!("Queued start as task {}", task.id);
            }
        }
        RunAction::List { status, limit } => {
            let status = status
                .as_deref()
                .map(str::parse::<RunStatus>)
                .transpose()
                .map_err(anyhow::Error::msg)?;
            let runs = driver
                .db()
                .call(move |db| db.list_runs(status, limit, 0))
                .await?;
            if runs.is_empty() {
                println!("No runs.");
                return Ok(());
            }
            println!("{:<6} {:<10} {:<6} SUBJECT", "ID", "STATUS", "PHASE");
            for run in runs {
                println!(
                    "{:<6} {:<10} {:<6} {}",
                    run.id, run.status, run.current_phase, run.subject
                );
            }
        }
        RunAction::Show { id } => {
            let detail = driver
                .db()
                .call(move |db| db.run_detail(id))
                .await?
                .with_context(|| format!("Run {} not found", id))?;
            print_json(&detail)?;
        }
        RunAction::Start { id, inline } => {
            if inline {
                let outcome = driver.start(id).await?;
                print_json(&outcome)?;
            } else {
                driver.check_startable(id).await?;
                let task = dispatcher.enqueue_start(id).await?;
                println!("Queued start of run {} as task {}", id, task.id);
            }
        }
        RunAction::Stop { id } => {
            let run = driver.stop(id).await?;
            println!("Run {} is now {}", run.id, run.status);
        }
        RunAction::Restart { id } => {
            let run = driver.restart(id).await?;
            println!(
                "Run {} is now {} at phase {}",
                run.id, run.status, run.current_phase
            );
        }
        RunAction::Retry { id, phase, inline } => {
            if inline {
                let outcome = driver.retry_phase(id, phase).await?;
                print_json(&outcome)?;
            } else {
                driver.check_retryable(id, phase).await?;
                let task = dispatcher.enqueue_retry(id, phase).await?;
                println!("Queued retry of phase {} of run {} as task {}", phase, id, task.id);
            }
        }
    }
    Ok(())
}
