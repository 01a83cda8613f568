use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use runway::{
    ComputeTier, ConfigLoader, InProcEventBus, ProvisionError, ProvisionResponse, RunReport,
    RunTrigger, RunwayConfig, bootstrap, validate_response,
};
use serde_json::json;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "runway", version, about = "Just-in-time CI runner provisioning")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Provision runners for a workflow run and start the consumer job
    Provision(ProvisionArgs),
    /// Validate a raw provisioning response (file path, or - for stdin)
    CheckResponse {
        path: Option<PathBuf>,
    },
    /// Configuration helpers
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Load and validate configuration without contacting any backend
    Check(ConfigArgs),
}

#[derive(Args)]
struct ProvisionArgs {
    /// Repository the runners attach to, as owner/name
    #[arg(long)]
    repository: String,
    /// Workflow name, half of the run key
    #[arg(long)]
    workflow: String,
    /// Git ref, the other half of the run key
    #[arg(long = "ref")]
    git_ref: String,
    /// Number of runners; defaults to runner.count
    #[arg(long)]
    runner_count: Option<i64>,
    /// Compute tier (XS, S, M, L, XL); defaults to runner.compute
    #[arg(long)]
    compute_type: Option<ComputeTier>,
    /// Stop once the runner is confirmed
    #[arg(long)]
    skip_consumer: bool,
    #[command(flatten)]
    config: ConfigArgs,
}

#[derive(Args)]
struct ConfigArgs {
    /// Config file; defaults to RUNWAY_CONFIG, then runway.toml
    #[arg(long)]
    config: Option<PathBuf>,
    /// Dotenv file loaded before reading the environment
    #[arg(long)]
    env_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    // stdout carries the run report, logs go to stderr
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match execute(cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("runway: {err:#}");
            let code = err
                .downcast_ref::<ProvisionError>()
                .map_or(1, ProvisionError::exit_code);
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
    }
}

async fn execute(command: Command) -> Result<()> {
    match command {
        Command::Provision(args) => provision(args).await,
        Command::CheckResponse { path } => check_response(path.as_deref()),
        Command::Config {
            action: ConfigAction::Check(args),
        } => config_check(&args),
    }
}

async fn provision(args: ProvisionArgs) -> Result<()> {
    let config = load_config(&args.config)?;

    let sdk_config = bootstrap::shared_sdk_config(&config).await?;

    let bus = Arc::new(InProcEventBus::default());
    let event_log = tokio::spawn(log_events(bus.subscribe_runs()));

    let orchestrator =
        bootstrap::orchestrator_builder(&config, !args.skip_consumer, &sdk_config, |name| {
            std::env::var(name).ok()
        })?
        .with_events(bus.clone())
        .build()
        .map_err(|err| ProvisionError::Config(err.to_string()))?;

    let trigger = RunTrigger::new(args.repository, args.workflow, args.git_ref)
        .with_runner_count(args.runner_count.unwrap_or(config.runner.count))
        .with_compute_tier(args.compute_type.unwrap_or(config.runner.compute));

    let outcome = orchestrator.run(&trigger).await;
    event_log.abort();

    let report = outcome?;
    print_report(&report)?;
    Ok(())
}

async fn log_events(mut events: broadcast::Receiver<runway::RunEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => match serde_json::to_string(&event.payload) {
                Ok(payload) => tracing::debug!(run_key = %event.meta.run_key, %payload, "run event"),
                Err(err) => tracing::warn!("failed to encode run event: {err}"),
            },
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "run event log lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn print_report(report: &RunReport) -> Result<()> {
    let summary = json!({
        "run_id": report.run_id,
        "run_key": report.run_key.to_string(),
        "states": report.states,
        "status_code": report.confirmation.status_code,
        "consumer_exit_code": report.consumer.as_ref().and_then(|outcome| outcome.exit_code),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn check_response(path: Option<&Path>) -> Result<()> {
    let raw = match path {
        Some(path) if path != Path::new("-") => std::fs::read(path)
            .with_context(|| format!("failed to read {}", path.display()))?,
        _ => {
            let mut buf = Vec::new();
            std::io::stdin()
                .read_to_end(&mut buf)
                .context("failed to read response from stdin")?;
            buf
        }
    };

    let response = ProvisionResponse::from_slice(&raw);
    let confirmation = validate_response(&response)?;
    println!("runner confirmed (statusCode {})", confirmation.status_code);
    Ok(())
}

fn config_check(args: &ConfigArgs) -> Result<()> {
    let config = load_config(args)?;
    let identity = if config.github.uses_app() {
        "github app"
    } else {
        "pre-shared token"
    };
    println!(
        "configuration ok: identity={identity} region={} function={} consumer={}",
        config.cloud.region.as_deref().unwrap_or_default(),
        config.dispatch.function_name.as_deref().unwrap_or_default(),
        config
            .consumer
            .as_ref()
            .map_or("none", |consumer| consumer.program.as_str()),
    );
    Ok(())
}

fn load_config(args: &ConfigArgs) -> Result<RunwayConfig> {
    let mut loader = ConfigLoader::new();
    if let Some(path) = &args.config {
        loader = loader.with_config_path(path);
    }
    if let Some(path) = &args.env_file {
        loader = loader.with_env_file(path);
    }
    let config = loader.load().map_err(ProvisionError::from)?;
    config.validate()?;
    Ok(config)
}
