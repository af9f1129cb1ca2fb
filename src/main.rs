//! daq-cnc: coordinator server and operator tool.
//!
//! `daq-cnc serve` runs the coordinator. Every other subcommand talks to a
//! running coordinator and exits with 0 on success, 1 for an unhealthy run,
//! 2 for configuration errors, 3 for connectivity failures and 4 when
//! cancelled.

use anyhow::Context;
use clap::{Parser, Subcommand};
use daq_cnc::component::FlasherSetting;
use daq_cnc::config::{CncConfig, ConfigError};
use daq_cnc::coordinator::{CoordinatorClient, CoordinatorService};
use daq_cnc::env::DaqEnvironment;
use daq_cnc::error::{CncError, ExitStatus};
use daq_cnc::logging::init_tracing;
use daq_cnc::rpc::RpcServer;
use daq_cnc::runset::{RunOptions, RunSetState};
use daq_cnc::tasks::MonitorTarget;
use daq_cnc::Coordinator;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "daq-cnc")]
#[command(about = "Command-and-control for the DAQ cluster", long_about = None)]
struct Cli {
    /// Coordinator address
    #[arg(long, global = true, default_value = "127.0.0.1:8080")]
    server: String,

    /// Seconds to wait for any single coordinator call
    #[arg(long, global = true, default_value = "300")]
    timeout_secs: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the coordinator service
    Serve {
        /// Configuration file (TOML); DAQCNC_* variables override it
        #[arg(long, default_value = "daq-cnc.toml")]
        config: PathBuf,
    },
    /// Check that the coordinator answers
    Ping,
    /// List free components
    List,
    /// Build a run-set from a run configuration
    MakeRunset {
        config: String,
        /// Build even if some components are missing
        #[arg(long)]
        lenient: bool,
    },
    /// Start a run on a run-set
    Start {
        id: u32,
        run: u32,
        #[arg(long, default_value = "both")]
        monitor: MonitorTarget,
    },
    /// Stop the run on a run-set
    Stop { id: u32 },
    /// Show the state of a run-set
    State {
        id: u32,
        /// Print the full snapshot as json
        #[arg(long)]
        json: bool,
    },
    /// List run-set ids
    Runsets,
    /// List the members of a run-set
    Members { id: u32 },
    /// Reset a run-set and release its components
    Break { id: u32 },
    /// Start a subrun; without a settings file the flashers are turned off
    Subrun {
        id: u32,
        /// Json file holding a list of flasher settings
        #[arg(long)]
        settings: Option<PathBuf>,
    },
    /// Make a run-set, run it for a while, then stop and break it
    Run {
        config: String,
        /// Run number; defaults to one past the last run
        #[arg(long)]
        run: Option<u32>,
        /// Run length in seconds
        #[arg(long, default_value = "60")]
        duration: u64,
        #[arg(long, default_value = "both")]
        monitor: MonitorTarget,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let status = match execute(cli).await {
        Ok(status) => status,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            exit_status_of(&e)
        }
    };
    std::process::exit(status.code());
}

fn exit_status_of(err: &anyhow::Error) -> ExitStatus {
    if let Some(e) = err.downcast_ref::<CncError>() {
        e.exit_status()
    } else if err.downcast_ref::<ConfigError>().is_some() {
        ExitStatus::ConfigError
    } else {
        ExitStatus::Unhealthy
    }
}

async fn execute(cli: Cli) -> anyhow::Result<ExitStatus> {
    let client = CoordinatorClient::new(cli.server.clone(), Duration::from_secs(cli.timeout_secs));
    match cli.command {
        Command::Serve { config } => return serve(&config).await,
        Command::Ping => {
            println!("{}", client.ping().await?);
        }
        Command::List => {
            for c in client.list_components().await? {
                println!(
                    "{:>4}  {:<24} {}:{}  {}",
                    c.descriptor.id,
                    c.descriptor.full_name(),
                    c.descriptor.host,
                    c.descriptor.cmd_port,
                    c.state
                );
            }
        }
        Command::MakeRunset { config, lenient } => {
            let strict = if lenient { Some(false) } else { None };
            println!("{}", client.make_runset(&config, strict).await?);
        }
        Command::Start { id, run, monitor } => {
            let options = RunOptions {
                monitor_target: monitor,
            };
            println!("{}", client.start_run(id, run, &options).await?);
        }
        Command::Stop { id } => {
            println!("{}", client.stop_run(id).await?);
        }
        Command::State { id, json } => {
            if json {
                println!("{}", serde_json::to_string_pretty(&client.snapshot(id).await?)?);
            } else {
                println!("{}", client.state(id).await?);
            }
        }
        Command::Runsets => {
            for id in client.runset_ids().await? {
                println!("{}", id);
            }
        }
        Command::Members { id } => {
            for m in client.members(id).await? {
                println!(
                    "{:>4}  {:<24} order {:<3} {}{}",
                    m.descriptor.id,
                    m.descriptor.full_name(),
                    m.order,
                    m.state,
                    if m.quarantined { " (quarantined)" } else { "" }
                );
            }
        }
        Command::Break { id } => {
            let report = client.break_runset(id).await?;
            println!(
                "released {} components, quarantined {}",
                report.returned.len(),
                report.quarantined.len()
            );
            if !report.quarantined.is_empty() {
                return Ok(ExitStatus::Unhealthy);
            }
        }
        Command::Subrun { id, settings } => {
            let settings: Vec<FlasherSetting> = match settings {
                Some(path) => {
                    let text = std::fs::read_to_string(&path)
                        .with_context(|| format!("reading {}", path.display()))?;
                    serde_json::from_str(&text)
                        .map_err(|e| CncError::Configuration(format!("{}: {}", path.display(), e)))?
                }
                None => Vec::new(),
            };
            println!("{}", client.subrun(id, &settings).await?);
        }
        Command::Run {
            config,
            run,
            duration,
            monitor,
        } => {
            return run_for(
                &cli.server,
                &client,
                &config,
                run,
                Duration::from_secs(duration),
                monitor,
            )
            .await;
        }
    }
    Ok(ExitStatus::Success)
}

async fn serve(path: &Path) -> anyhow::Result<ExitStatus> {
    let config = CncConfig::load_from(path)?;
    init_tracing(&config.server);
    let env = DaqEnvironment::from_env()?;
    info!(
        "config dir {}, spool dir {}",
        env.config_dir().display(),
        env.spool_dir().display()
    );

    let listen = config.server.listen.clone();
    let coordinator = Coordinator::new(config, env);
    let service = Arc::new(CoordinatorService::new(coordinator.clone()));
    let server = RpcServer::bind(&listen, service)
        .await
        .with_context(|| format!("binding {}", listen))?;

    let shutdown = CancellationToken::new();
    let task = server.spawn(shutdown.clone());
    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    shutdown.cancel();
    coordinator.shutdown().await;
    if let Err(e) = task.await {
        warn!("server task failed: {}", e);
    }
    Ok(ExitStatus::Success)
}

/// Makes a run-set, runs it for `duration` and tears it down again. Ctrl-C
/// breaks the run-set and reports cancellation.
async fn run_for(
    server: &str,
    client: &CoordinatorClient,
    config: &str,
    run: Option<u32>,
    duration: Duration,
    monitor: MonitorTarget,
) -> anyhow::Result<ExitStatus> {
    let id = client.make_runset(config, None).await?;
    let run = match run {
        Some(run) => run,
        None => client.next_run_number().await?,
    };
    println!("run set {}: starting run {}", id, run);

    // Breaks go over their own connection so they are not queued behind a
    // start that is still in flight.
    let breaker = CoordinatorClient::new(server.to_string(), Duration::from_secs(300));
    let options = RunOptions {
        monitor_target: monitor,
    };

    let started = tokio::select! {
        result = client.start_run(id, run, &options) => result,
        _ = tokio::signal::ctrl_c() => {
            breaker.break_runset(id).await?;
            return Ok(ExitStatus::Cancelled);
        }
    };
    if let Err(e) = started {
        eprintln!("start failed: {}", e);
        let _ = breaker.break_runset(id).await;
        return Ok(e.exit_status());
    }

    let deadline = Instant::now() + duration;
    let mut healthy = true;
    while Instant::now() < deadline {
        let wait = deadline
            .saturating_duration_since(Instant::now())
            .min(Duration::from_secs(5));
        tokio::select! {
            _ = sleep(wait) => {}
            _ = tokio::signal::ctrl_c() => {
                breaker.break_runset(id).await?;
                return Ok(ExitStatus::Cancelled);
            }
        }
        let state = client.state(id).await?;
        if state != RunSetState::Running {
            eprintln!("run {} ended early, run set is {}", run, state);
            healthy = false;
            break;
        }
    }

    if healthy {
        println!("run set {}: {}", id, client.stop_run(id).await?);
    }
    let report = client.break_runset(id).await?;
    if !report.quarantined.is_empty() {
        healthy = false;
    }
    Ok(if healthy {
        ExitStatus::Success
    } else {
        ExitStatus::Unhealthy
    })
}
