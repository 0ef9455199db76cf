// SPDX-License-Identifier: GPL-3.0-or-later
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use cinarr_application::{
    ContentSourceDriver, HttpConnectivityProbe, HttpJsonScraper, PipelineContext, ProbeTarget,
    RealDebridClient, ScraperBackend, ScraperManager,
};
use cinarr_config::{load as load_config, AppConfig, TelemetryConfig};
use cinarr_infrastructure::repositories::Repositories;
use cinarr_infrastructure::state_files::StateDir;
use cinarr_infrastructure::{http_client, init_database};
use cinarr_scheduler::jobs::default_interval_for;
use cinarr_scheduler::registry::validate_interval;
use cinarr_scheduler::{ControlRequest, RunnerStatus, Scheduler, Services, TaskSettings};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "cinarr", about = "Automated movie and episode acquisition")]
struct Cli {
    /// TOML configuration file layered over the defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Command {
    /// Run the service in the foreground until SIGINT or SIGTERM
    Start,
    /// Ask a running service to stop after its current task
    Stop,
    /// Print the state of the running service
    Status,
    /// Run a task as soon as possible
    Trigger { task: String },
    Enable { task: String },
    Disable { task: String },
    /// Override a task's interval, in seconds
    SetInterval { task: String, seconds: u64 },
    ClearInterval { task: String },
    /// Forget every task toggle and custom interval
    ResetTasks,
    /// Hand an Overseerr request payload to the running service
    Webhook { payload: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    init_tracing(&config.telemetry);

    match cli.command {
        Command::Start => start(config).await,
        command => {
            let state = StateDir::new(&config.paths.data_dir)?;
            control(&state, command)
        }
    }
}

fn init_tracing(telemetry: &TelemetryConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(telemetry.log_level.as_str()));
    let registry = tracing_subscriber::registry().with(env_filter);

    if telemetry.json {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        let fmt_layer = fmt::layer().with_target(true).with_thread_names(true).with_level(true);
        registry.with(fmt_layer).init();
    }
}

async fn start(config: AppConfig) -> Result<()> {
    let pool = init_database(&config).await.context("database initialization failed")?;
    let state = StateDir::new(&config.paths.data_dir).context("state directory unusable")?;
    let timeout = Duration::from_secs(config.scraping.scraper_timeout_seconds);
    let client = http_client(timeout)?;

    let api_key = match config.debrid.api_key.clone() {
        Some(key) if !key.trim().is_empty() => key,
        _ => bail!("debrid.api_key must be configured"),
    };
    let debrid = Arc::new(RealDebridClient::new(
        client.clone(),
        &config.debrid.base_url,
        api_key.clone(),
    ));
    let probe = HttpConnectivityProbe::new(client.clone(), probe_targets(&config, &api_key));
    let backends = scraper_backends(&config, &client);
    info!(target: "cli", backends = backends.len(), data_dir = %config.paths.data_dir.display(), "starting service");

    let ctx = PipelineContext::builder(
        config,
        Repositories::sqlite(pool),
        state,
        ScraperManager::new(backends, timeout),
        debrid,
    )
    .build();
    let sources = ContentSourceDriver::from_config(ctx.clone(), client);
    let services = Services::new(ctx, sources).with_probe(Arc::new(probe));
    let scheduler = Scheduler::new(services);

    let mut worker = scheduler.clone().start();
    let joined = tokio::select! {
        joined = &mut worker => joined,
        signal = shutdown_signal() => {
            signal?;
            scheduler.stop();
            worker.await
        }
    };
    joined.context("scheduler worker panicked")??;
    info!(target: "cli", "service stopped");
    Ok(())
}

fn scraper_backends(config: &AppConfig, client: &reqwest::Client) -> Vec<Arc<dyn ScraperBackend>> {
    config
        .scraping
        .backends
        .iter()
        .filter(|(_, backend)| backend.enabled)
        .map(|(id, backend)| {
            Arc::new(HttpJsonScraper::new(id.clone(), client.clone(), backend.url.clone()))
                as Arc<dyn ScraperBackend>
        })
        .collect()
}

fn probe_targets(config: &AppConfig, api_key: &str) -> Vec<ProbeTarget> {
    let mut targets = vec![ProbeTarget {
        service: config.debrid.provider.clone(),
        url: config
            .debrid
            .probe_url
            .clone()
            .unwrap_or_else(|| format!("{}/user", config.debrid.base_url.trim_end_matches('/'))),
        bearer_token: Some(api_key.to_string()),
    }];
    if let Some(plex) = &config.file_management.plex_url {
        targets.push(ProbeTarget {
            service: "plex".into(),
            url: format!("{}/identity", plex.trim_end_matches('/')),
            bearer_token: None,
        });
    }
    targets
}

/// Queue `command` for the running service; toggles and intervals are also
/// written to the settings files so they hold after a restart.
fn control(state: &StateDir, command: Command) -> Result<()> {
    let settings = TaskSettings::new(Arc::new(state.clone()));
    let request = match command {
        Command::Start => bail!("start is not a control command"),
        Command::Status => return print_status(state),
        Command::Stop => ControlRequest::Stop,
        Command::Trigger { task } => {
            known_task(&task)?;
            ControlRequest::Trigger { task }
        }
        Command::Enable { task } => {
            known_task(&task)?;
            settings.save_toggle(&task, true)?;
            ControlRequest::Enable { task }
        }
        Command::Disable { task } => {
            known_task(&task)?;
            settings.save_toggle(&task, false)?;
            ControlRequest::Disable { task }
        }
        Command::SetInterval { task, seconds } => {
            let default = known_task(&task)?;
            validate_interval(&task, seconds)?;
            settings.save_interval(&task, Some(seconds), Some(default))?;
            ControlRequest::SetInterval { task, seconds }
        }
        Command::ClearInterval { task } => {
            let default = known_task(&task)?;
            settings.save_interval(&task, None, Some(default))?;
            ControlRequest::ClearInterval { task }
        }
        Command::ResetTasks => {
            settings.reset()?;
            ControlRequest::ResetTasks
        }
        Command::Webhook { payload } => ControlRequest::Webhook {
            payload: read_payload(&payload)?,
        },
    };
    request.submit(state)?;
    info!(target: "cli", ?request, "control request queued");
    Ok(())
}

fn known_task(task: &str) -> Result<u64> {
    default_interval_for(task).with_context(|| format!("unknown task: {}", task))
}

fn read_payload(path: &Path) -> Result<serde_json::Value> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("{} is not valid JSON", path.display()))
}

fn print_status(state: &StateDir) -> Result<()> {
    let Some(status) = RunnerStatus::read(state)? else {
        println!("state: stopped");
        return Ok(());
    };
    println!("state: {}", status.state.as_str());
    println!("updated: {}", status.updated_at.to_rfc3339());
    match &status.pause_info {
        Some(info) => println!(
            "paused: {} ({}){}",
            info.error_type(),
            info.reason(),
            info.service_name()
                .map(|s| format!(" service={}", s))
                .unwrap_or_default()
        ),
        None => println!("paused: no"),
    }
    if !status.currently_executing.is_empty() {
        println!("running: {}", status.currently_executing.join(", "));
    }
    if !status.paused_jobs.is_empty() {
        println!("paused jobs: {}", status.paused_jobs.len());
    }
    for (queue, size) in &status.queue_sizes {
        println!("  {:<16}{}", queue, size);
    }
    Ok(())
}

async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut interrupt = signal(SignalKind::interrupt()).context("install SIGINT handler")?;
        let mut terminate = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
        tokio::select! {
            _ = interrupt.recv() => {},
            _ = terminate.recv() => {},
        }
    }

    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await.context("install ctrl_c handler")?;

    warn!(target: "cli", "shutdown signal received, finishing current task");
    Ok(())
}
