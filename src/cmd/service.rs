//! Long-running and setup commands: `pipewright init`, `serve` and `worker`.

use std::path::Path;

use anyhow::{Context, Result};
use tokio::sync::watch;

use pipewright::config::{DEFAULT_CONFIG_FILE, Settings};
use pipewright::pipeline::db::PipelineDb;
use pipewright::pipeline::server::{self, start_server};

use super::open_dispatcher;

pub fn cmd_init(settings: &Settings) -> Result<()> {
    let db = PipelineDb::new(&settings.database.path).with_context(|| {
        format!(
            "Failed to create pipeline database at {}",
            settings.database.path.display()
        )
    })?;
    let seeded = db.seed_phase_toggles()?;
    println!(
        "Pipeline database ready at {}",
        settings.database.path.display()
    );
    println!("Seeded {} phase toggle(s)", seeded);

    let config_path = Path::new(DEFAULT_CONFIG_FILE);
    if config_path.exists() {
        println!("{} already exists, left unchanged", DEFAULT_CONFIG_FILE);
    } else {
        let content = toml::to_string_pretty(settings).context("Failed to render settings")?;
        std::fs::write(config_path, content)
            .with_context(|| format!("Failed to write {}", DEFAULT_CONFIG_FILE))?;
        println!("Wrote {}", DEFAULT_CONFIG_FILE);
    }
    Ok(())
}

pub async fn cmd_serve(
    mut settings: Settings,
    host: Option<String>,
    port: Option<u16>,
    cors: bool,
    no_workers: bool,
) -> Result<()> {
    if let Some(host) = host {
        settings.server.host = host;
    }
    if let Some(port) = port {
        settings.server.port = port;
    }
    if cors {
        settings.server.cors_permissive = true;
    }
    let dispatcher = open_dispatcher(&settings)?;
    start_server(settings.server_config(!no_workers), dispatcher).await
}

pub async fn cmd_worker(mut settings: Settings, workers: Option<usize>, drain: bool) -> Result<()> {
    if let Some(workers) = workers {
        settings.dispatch.workers = workers;
        settings.validate()?;
    }
    let dispatcher = open_dispatcher(&settings)?;

    if drain {
        dispatcher.requeue_stale().await?;
        let mut processed = 0usize;
        while let Some(task) = dispatcher.run_next().await? {
            processed += 1;
            match &task.error {
                Some(error) => println!(
                    "task {} {} run {}: {} ({})",
                    task.id, task.kind, task.run_id, task.status, error
                ),
                None => println!("task {} {} run {}: {}", task.id, task.kind, task.run_id, task.status),
            }
        }
        println!("Processed {} task(s)", processed);
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let pool = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move { dispatcher.run_pool(shutdown_rx).await })
    };
    server::shutdown_signal().await;
    let _ = shutdown_tx.send(true);
    pool.await.context("Dispatch pool panicked")??;
    Ok(())
}
