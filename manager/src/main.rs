//! `ds-manager` binary entry point.
//!
//! The real client-embedding API (submit/wait/cancel/delete from an
//! external process) is out of scope for this crate (spec.md §1); what
//! ships here is a standalone runner that demonstrates the same
//! contract against [`ds_manager::Manager`] directly: it optionally
//! reads a JSON task list at startup, submits it, and drains the
//! manager's event loop until every task is retrieved or a shutdown
//! signal arrives.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use tracing::{error, info, warn};

use ds_manager::{Manager, NewTask};
use shared::config::ManagerConfig;

/// Command-line arguments for the manager.
#[derive(Parser, Debug)]
#[command(name = "ds-manager")]
#[command(about = "Cluster manager for a distributed task-execution system", long_about = None)]
struct CliArgs {
    /// Path to the manager configuration file (manager.toml)
    #[arg(value_name = "CONFIG_FILE")]
    config_file: PathBuf,

    /// Override the listen port from the config file
    #[arg(long = "port", value_name = "PORT")]
    port: Option<u16>,

    /// Override the advertised project name from the config file
    #[arg(long = "name", value_name = "NAME")]
    name: Option<String>,

    /// Optional JSON file of tasks to submit at startup. Without this,
    /// the manager runs as a bare server until a shutdown signal
    /// arrives, with no client ever calling `submit`.
    #[arg(long = "tasks-file", value_name = "FILE")]
    tasks_file: Option<PathBuf>,
}

/// One entry in a `--tasks-file` JSON array, the minimal shape the
/// out-of-scope client-embedding API would otherwise collect before
/// calling `submit` (spec.md §1, §3).
#[derive(Debug, Deserialize)]
struct TaskSpec {
    command_line: String,
    #[serde(default = "default_category")]
    category: String,
    #[serde(default)]
    tag: Option<String>,
    #[serde(default)]
    priority: i64,
    #[serde(default)]
    cores: Option<f64>,
    #[serde(default)]
    memory: Option<f64>,
    #[serde(default)]
    disk: Option<f64>,
}

fn default_category() -> String {
    "default".to_string()
}

impl From<TaskSpec> for NewTask {
    fn from(spec: TaskSpec) -> Self {
        let mut task = NewTask::new(spec.command_line, spec.category);
        task.tag = spec.tag;
        task.priority = spec.priority;
        task.request.cores = spec.cores;
        task.request.memory = spec.memory;
        task.request.disk = spec.disk;
        task
    }
}

fn load_task_specs(path: &PathBuf) -> Result<Vec<TaskSpec>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading tasks file {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing tasks file {}", path.display()))
}

/// Waits for either SIGTERM or SIGINT (Ctrl+C on non-Unix).
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let sigterm = signal(SignalKind::terminate());
        let sigint = signal(SignalKind::interrupt());
        match (sigterm, sigint) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("received SIGTERM"),
                    _ = sigint.recv() => info!("received SIGINT"),
                }
            }
            (Err(e), _) | (_, Err(e)) => {
                error!(error = %e, "failed to register signal handlers, falling back to Ctrl+C");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let file_appender = tracing_appender::rolling::daily("./logs", "manager.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("ds_manager=info,shared=info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .json()
        .with_current_span(false)
        .with_span_list(false)
        .with_writer(non_blocking)
        .init();

    let cli = CliArgs::parse();

    info!("cluster manager starting up");
    info!(config_file = %cli.config_file.display(), "loading configuration");

    let mut config = ManagerConfig::load(&cli.config_file)
        .with_context(|| format!("loading config file {}", cli.config_file.display()))?;
    config.apply_env_fallbacks();

    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(name) = cli.name.clone() {
        config.name = Some(name);
    }

    let mut manager = Manager::new(config)
        .await
        .context("constructing cluster manager")?;
    info!(listen_addr = %manager.local_addr(), "manager listening");

    let submitted = match &cli.tasks_file {
        Some(path) => {
            let specs = load_task_specs(path)?;
            let count = specs.len();
            for spec in specs {
                let taskid = manager.submit(spec.into());
                info!(%taskid, "task submitted from tasks file");
            }
            info!(count, "submitted all tasks from tasks file");
            count
        }
        None => 0,
    };

    let run_until_drained = async {
        if submitted == 0 {
            // No client ever calls submit in this mode; run until told to
            // stop.
            loop {
                manager.run_once(std::time::Duration::from_secs(1)).await;
            }
        }
        while manager.pending_task_count() > 0 {
            if let Some(task) = manager.wait(std::time::Duration::from_secs(5)).await {
                info!(
                    taskid = task.taskid,
                    result = ?task.result,
                    exit_code = ?task.exit_code,
                    "task retrieved"
                );
            }
        }
    };

    tokio::select! {
        _ = run_until_drained => {
            info!("all submitted tasks retrieved");
        }
        _ = wait_for_shutdown_signal() => {
            warn!("shutdown signal received, stopping manager");
        }
    }

    manager.shutdown().await;
    info!("cluster manager shutdown complete");
    Ok(())
}
