use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;

use devflow_monitor::config::MonitorConfig;
use devflow_monitor::scheduler::DetailEvent;
use devflow_monitor::{ExecutionId, ExecutionMonitor, ExecutionRecord, ProjectId};

#[derive(Parser)]
#[command(
    name = "devflow",
    about = "Monitor and control DevFlow agent executions",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (defaults to $DEVFLOW_CONFIG, then ./devflow.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Backend URL, overriding the config file
    #[arg(long, global = true, env = "DEVFLOW_BASE_URL")]
    base_url: Option<String>,

    /// Bearer token, overriding the config file and environment
    #[arg(long, global = true)]
    token: Option<String>,

    /// JSON output for machine parsing
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List executions, most recent first
    List,

    /// Keep the execution list in sync and print every change (Ctrl-C to stop)
    Watch,

    /// Show the logs of one execution
    Logs {
        /// Execution id
        id: i64,

        /// Keep polling and stream new output until the execution finishes
        #[arg(long, short)]
        follow: bool,
    },

    /// Cancel a pending or running execution
    Cancel {
        /// Execution id
        id: i64,
    },

    /// Launch a new execution of a project
    Launch {
        /// Project id
        #[arg(long)]
        project: i64,

        /// Input parameters as a JSON object
        #[arg(long, default_value = "{}")]
        params: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut cfg = MonitorConfig::resolve(cli.config.as_deref())?;
    if let Some(url) = cli.base_url {
        cfg.backend.base_url = url;
    }
    if let Some(token) = cli.token {
        cfg.auth.token = Some(token);
    }
    cfg.validate()?;

    devflow_monitor::init_tracing(&cfg.logging);

    let monitor = ExecutionMonitor::from_config(&cfg)?;

    match cli.command {
        Commands::List => {
            monitor.refresh().await.context("failed to load executions")?;
            print_records(&monitor.store().list(), cli.json)?;
        }
        Commands::Watch => watch(&monitor, cli.json).await?,
        Commands::Logs { id, follow } => logs(&monitor, ExecutionId(id), follow).await?,
        Commands::Cancel { id } => {
            let id = ExecutionId(id);
            monitor.refresh().await.context("failed to load executions")?;
            monitor
                .cancel(id)
                .await
                .with_context(|| format!("failed to cancel execution {id}"))?;
            let status = monitor
                .store()
                .status_of(id)
                .map(|s| s.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            println!("Cancellation of execution {} requested (current status: {}).", id, status);
        }
        Commands::Launch { project, params } => {
            let params: serde_json::Value =
                serde_json::from_str(&params).context("--params must be valid JSON")?;
            let record = monitor
                .launch(ProjectId(project), params)
                .await
                .context("failed to launch execution")?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&record)?);
            } else {
                println!("Execution {} launched for project {} ({}).", record.id, record.project_id, record.status);
            }
        }
    }

    monitor.shutdown().await;
    Ok(())
}

async fn watch(monitor: &ExecutionMonitor, json: bool) -> Result<()> {
    monitor.refresh().await.context("failed to load executions")?;
    print_records(&monitor.store().list(), json)?;

    let mut changes = monitor.store().subscribe();
    let list_scope = monitor.watch_list();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            change = changes.recv() => match change {
                Ok(event) => {
                    let Some(rec) = monitor.store().get(event.id) else { continue };
                    if json {
                        println!("{}", serde_json::to_string(&rec)?);
                    } else if event.previous.is_none() {
                        println!("+ {} project {} {}", rec.id, rec.project_id, rec.status);
                    } else if event.is_transition() {
                        println!("~ {} {} -> {}", rec.id, event.previous.map(|s| s.as_str()).unwrap_or("-"), rec.status);
                    }
                }
                Err(RecvError::Lagged(_)) => print_records(&monitor.store().list(), json)?,
                Err(RecvError::Closed) => break,
            },
        }
    }

    list_scope.stop();
    Ok(())
}

async fn logs(monitor: &ExecutionMonitor, id: ExecutionId, follow: bool) -> Result<()> {
    let first = monitor
        .refresh_execution(id)
        .await
        .with_context(|| format!("failed to load execution {id}"))?;

    let mut printed = monitor.store().get(id).map(|r| r.logs).unwrap_or_default();
    print!("{}", printed);

    if follow && !first.is_done() {
        let mut scope = monitor.watch_execution(id);
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                event = scope.next() => match event {
                    Some(DetailEvent::Merged(_)) => {
                        let current = monitor.store().get(id).map(|r| r.logs).unwrap_or_default();
                        match current.strip_prefix(printed.as_str()) {
                            Some(tail) => print!("{}", tail),
                            None => print!("{}", current),
                        }
                        printed = current;
                    }
                    Some(DetailEvent::Failed(e)) => {
                        scope.stop();
                        return Err(e).with_context(|| format!("stopped following execution {id}"));
                    }
                    None => break,
                },
            }
        }
        scope.stop();
    }

    if let Some(rec) = monitor.store().get(id) {
        println!("\n--- execution {} {} ---", rec.id, rec.status);
        if let Some(result) = &rec.result {
            println!("{}", serde_json::to_string_pretty(result)?);
        }
    }
    Ok(())
}

fn print_records(records: &[ExecutionRecord], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(records)?);
        return Ok(());
    }
    if records.is_empty() {
        println!("No executions found.");
        return Ok(());
    }

    println!("{:<8} | {:<8} | {:<10} | {:<25} | Finished", "ID", "Project", "Status", "Started");
    println!("{:-<8}-|-{:-<8}-|-{:-<10}-|-{:-<25}-|-{:-<25}", "", "", "", "", "");
    for r in records {
        let finished = r
            .finished_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<8} | {:<8} | {:<10} | {:<25} | {}",
            r.id.to_string(),
            r.project_id.to_string(),
            r.status.as_str(),
            r.started_at.to_rfc3339(),
            finished
        );
    }
    Ok(())
}
