use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use fleetdump::{
    BackupConfig, BackupCoordinator, ControlClient, Endpoint, MysqlCliClient, PlanStoreConfig,
    ReplicaId, discover_replicas, plan_chunks,
};
use std::path::PathBuf;
use tracing::{Level, event};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "fleetdump")]
#[command(about = "Consistent parallel backup across a MySQL replica fleet")]
struct Cli {
    /// JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Primary endpoint, e.g. mysql://backup@db1:3306
    #[arg(long, global = true)]
    primary: Option<String>,

    /// Schema to back up
    #[arg(long, global = true)]
    schema: Option<String>,

    /// Keep the plan in a JSON file instead of the configured store
    #[arg(long, global = true)]
    plan_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a full backup
    Run {
        /// Directory receiving the per-replica dump files
        #[arg(long)]
        destination: Option<PathBuf>,
        /// Write the JSON run report here instead of stdout
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Show the chunk plan a run would use, without touching the fleet
    Plan,
    /// Show the chunk stored for one replica
    Lookup {
        #[arg(long)]
        replica: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let mut config = load_config(&cli)?;

    match cli.command {
        Command::Run {
            destination,
            report,
        } => {
            if let Some(destination) = destination {
                config.destination = destination;
            }
            let code = run_backup(&config, report).await?;
            std::process::exit(code);
        }
        Command::Plan => show_plan(&config).await,
        Command::Lookup { replica } => lookup_chunk(&config, &replica).await,
    }
}

fn load_config(cli: &Cli) -> Result<BackupConfig> {
    let mut config = match &cli.config {
        Some(path) => BackupConfig::from_json_file(path)?,
        None => BackupConfig::default(),
    };
    if let Some(primary) = &cli.primary {
        config.primary = Endpoint::from_url(primary)
            .map_err(|err| anyhow!("Invalid --primary '{}': {}", primary, err))?;
    }
    if let Some(schema) = &cli.schema {
        config.schema = schema.clone();
    }
    if let Some(plan_file) = &cli.plan_file {
        config.plan_store = PlanStoreConfig::JsonFile {
            path: plan_file.clone(),
        };
    }
    config
        .validate()
        .map_err(|err| anyhow!("Invalid configuration: {}", err))?;
    Ok(config)
}

async fn run_backup(config: &BackupConfig, report_path: Option<PathBuf>) -> Result<i32> {
    let coordinator = BackupCoordinator::from_config(config)?;
    let tracker = coordinator.tracker();
    let client = coordinator.client();

    let report = tokio::select! {
        report = coordinator.run() => report,
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl-C")?;
            event!(Level::WARN, "interrupted, rolling the fleet back");
            for failure in tracker.rollback(client.as_ref()).await {
                event!(Level::ERROR, error = %failure, "rollback step failed");
            }
            return Ok(130);
        }
    };

    let json = serde_json::to_string_pretty(&report)?;
    match report_path {
        Some(path) => std::fs::write(&path, json)
            .with_context(|| format!("Failed to write report to '{}'", path.display()))?,
        None => println!("{}", json),
    }
    if !report.succeeded() {
        eprintln!("{}", report.error_summary());
    }
    Ok(report.exit_code())
}

async fn show_plan(config: &BackupConfig) -> Result<()> {
    let client = MysqlCliClient::new(config);
    let replicas = discover_replicas(&client).await?;
    let tables = client
        .list_tables(&config.schema)
        .await
        .with_context(|| format!("Failed to list tables of '{}'", config.schema))?;
    let plan = plan_chunks(tables.len(), &replicas)?;

    for chunk in &plan {
        let names = tables.chunk(chunk);
        println!(
            "{}\tstart={}\tsize={}\t{}",
            chunk.replica,
            chunk.chunk_start,
            chunk.chunk_size,
            names.join(",")
        );
    }
    Ok(())
}

async fn lookup_chunk(config: &BackupConfig, replica: &str) -> Result<()> {
    let coordinator = BackupCoordinator::from_config(config)?;
    let replica = ReplicaId::new(replica)?;
    let chunk = coordinator
        .store()
        .lookup(&replica)
        .await?
        .ok_or_else(|| anyhow!("No chunk stored for replica '{}'", replica))?;
    println!("{}", serde_json::to_string_pretty(&chunk)?);
    Ok(())
}
