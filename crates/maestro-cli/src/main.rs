mod config;
mod config_watcher;

use crate::config::MaestroConfig;
use crate::config_watcher::{apply_agent_reloads, ConfigWatcher};
use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use maestro_core::BackendKind;
use maestro_gateway::{AppState, AuthConfig, GatewayServer};
use maestro_orchestrator::{
    parse_plan, AgentInvoker, AgentMonitor, CouncilEngine, NoopMemory, Orchestrator, ParsedPlan,
    PooledInvoker, UltraWorkManager, WorkflowEngine,
};
use maestro_pool::{PoolRegistry, StdioSpawner, WorkerSpawner};
use maestro_security::{AuditLog, RateLimiter};
use maestro_session::FilePhaseStore;
use maestro_watchdog::control::{is_running, read_pid, remove_if_exists, write_pid};
use maestro_watchdog::{
    stop_all, CommandDaemon, HttpHealthProbe, RunFiles, Watchdog, WatchdogState,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "maestro", about = "Maestro — multi-agent orchestration daemon")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "maestro.toml", global = true)]
    config: PathBuf,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Json, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Json,
    Pretty,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon: worker pools, engines and the HTTP gateway
    Serve {
        /// Host to bind to (overrides config)
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Supervise the daemon, restarting it when its health check fails
    Watchdog,
    /// Stop the watchdog, then the daemon
    Stop {
        /// Seconds to wait for each process to exit
        #[arg(long, default_value_t = 30)]
        wait_secs: u64,
    },
    /// Show daemon and watchdog status
    Status,
    /// Work with conductor plans
    Plan {
        #[command(subcommand)]
        action: PlanAction,
    },
}

#[derive(Subcommand)]
enum PlanAction {
    /// Parse and validate a workflow or council plan without running it
    Check {
        /// File holding the plan (raw JSON or agent output with a fenced block)
        file: PathBuf,
    },
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.pretty().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = MaestroConfig::load(&cli.config)?;

    match cli.command {
        Commands::Serve { host, port } => {
            let host = host.unwrap_or_else(|| config.server.host.clone());
            let port = port.unwrap_or(config.server.port);
            serve(&cli.config, config, host, port).await
        }
        Commands::Watchdog => watchdog(&cli.config, &config).await,
        Commands::Stop { wait_secs } => {
            let report = stop_all(&config.run_files(), Duration::from_secs(wait_secs)).await?;
            match (report.watchdog_pid, report.daemon_pid) {
                (None, None) => println!("Nothing was running."),
                (watchdog, daemon) => {
                    if let Some(pid) = watchdog {
                        println!("Stopped watchdog (pid {pid})");
                    }
                    if let Some(pid) = daemon {
                        println!("Stopped daemon (pid {pid})");
                    }
                }
            }
            Ok(())
        }
        Commands::Status => status(&config.run_files()).await,
        Commands::Plan { action } => match action {
            PlanAction::Check { file } => check_plan(&config, &file).await,
        },
    }
}

/// Pools, invoker and engines wired together from the config.
struct Runtime {
    registry: Arc<PoolRegistry>,
    invoker: Arc<dyn AgentInvoker>,
    monitor: AgentMonitor,
    orchestrator: Arc<Orchestrator>,
}

async fn build_runtime(config: &MaestroConfig, audit: Arc<AuditLog>) -> anyhow::Result<Runtime> {
    let spawners: HashMap<BackendKind, Arc<dyn WorkerSpawner>> = config
        .backends
        .iter()
        .map(|(kind, command)| {
            let spawner: Arc<dyn WorkerSpawner> = Arc::new(StdioSpawner::new(*kind, command.clone()));
            (*kind, spawner)
        })
        .collect();
    let registry = Arc::new(PoolRegistry::new(
        spawners,
        config.pool_config(),
        config.agents.clone(),
        audit.clone(),
    )?);

    let monitor = AgentMonitor::new();
    let invoker: Arc<dyn AgentInvoker> =
        Arc::new(PooledInvoker::new(registry.clone(), audit.clone(), monitor.clone()));
    let orchestrator = Orchestrator::new(invoker.clone(), audit, config.orchestrator_config());

    let store = Arc::new(FilePhaseStore::new(config.data_dir.join("sessions")).await?);
    let ultrawork = UltraWorkManager::new(
        invoker.clone(),
        store,
        Arc::new(NoopMemory),
        config.ultrawork_config(),
    )
    .with_council_config(config.council_config())
    .with_delegation(orchestrator.delegation());
    let orchestrator = Arc::new(orchestrator.with_ultrawork(Arc::new(ultrawork)));

    Ok(Runtime {
        registry,
        invoker,
        monitor,
        orchestrator,
    })
}

async fn serve(config_path: &Path, config: MaestroConfig, host: String, port: u16) -> anyhow::Result<()> {
    let audit = Arc::new(AuditLog::new(config.data_dir.join("audit")));
    let runtime = build_runtime(&config, audit).await?;
    info!(
        agents = config.agents.len(),
        backends = ?runtime.registry.backends(),
        "Worker pools ready"
    );

    let shutdown = CancellationToken::new();
    let sweeper = runtime.registry.spawn_sweeper(shutdown.clone());

    let (reload_tx, reload_rx) = mpsc::unbounded_channel();
    let _watcher = match ConfigWatcher::start(config_path.to_path_buf(), 500, move |next| {
        let _ = reload_tx.send(next);
    }) {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            warn!(error = %e, "Config hot reload disabled");
            None
        }
    };
    let reloader = tokio::spawn(apply_agent_reloads(
        runtime.registry.clone(),
        config.agents.clone(),
        reload_rx,
        shutdown.clone(),
    ));

    let rate_limiter = Arc::new(RateLimiter::new(
        config.server.max_burst,
        config.server.max_requests_per_second,
    ));
    // Idle callers' buckets are dropped so the limiter map stays bounded.
    let pruner = {
        let limiter = rate_limiter.clone();
        let stop = shutdown.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(std::time::Duration::from_secs(300));
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tick.tick() => limiter.cleanup(std::time::Duration::from_secs(600)).await,
                }
            }
        })
    };
    let auth_config = AuthConfig::new(config.server.api_keys.clone());
    if auth_config.is_enabled() {
        info!(keys = config.server.api_keys.len(), "API key auth enabled");
    }
    let state = Arc::new(AppState::new(
        runtime.orchestrator.clone(),
        runtime.registry.clone(),
        runtime.monitor.clone(),
    ));
    let app = GatewayServer::build_with_middleware(state, Some(rate_limiter), auth_config);

    let files = config.run_files();
    let pid = std::process::id();
    write_pid(&files.daemon_pid(), pid).await?;

    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("cannot bind {addr}"))?;
    info!(%addr, pid, "Maestro daemon listening");

    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            signal.cancel();
        })
        .await?;

    runtime.orchestrator.shutdown();
    shutdown.cancel();
    let drained = runtime.registry.shutdown_all().await;
    let _ = sweeper.await;
    let _ = reloader.await;
    let _ = pruner.await;
    // A replacement daemon may already own the pid file.
    if read_pid(&files.daemon_pid()).await == Some(pid) {
        remove_if_exists(&files.daemon_pid()).await?;
    }
    info!(workers_terminated = drained, "Maestro daemon stopped");
    Ok(())
}

async fn watchdog(config_path: &Path, config: &MaestroConfig) -> anyhow::Result<()> {
    let files = config.run_files();
    let command = if config.watchdog.daemon_command.is_empty() {
        let exe = std::env::current_exe().context("cannot locate the maestro binary")?;
        vec![
            exe.display().to_string(),
            "--config".to_string(),
            config_path.display().to_string(),
            "serve".to_string(),
        ]
    } else {
        config.watchdog.daemon_command.clone()
    };

    let probe = HttpHealthProbe::new(
        config.health_url(),
        Duration::from_secs(config.watchdog.probe_timeout_secs),
    )?;
    let control = CommandDaemon::new(&command, files.clone())?;
    let mut watchdog = Watchdog::new(
        Arc::new(probe),
        Arc::new(control),
        files,
        config.watchdog_config(),
    );

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal.cancel();
    });

    match watchdog.run(shutdown).await {
        Ok(state) => {
            info!(status = ?state.status, restarts = state.restart_count, "Watchdog exited");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Watchdog gave up on the daemon");
            Err(e.into())
        }
    }
}

async fn status(files: &RunFiles) -> anyhow::Result<()> {
    for (name, path) in [("daemon", files.daemon_pid()), ("watchdog", files.watchdog_pid())] {
        match read_pid(&path).await {
            Some(pid) if is_running(pid).await => println!("{name}: running (pid {pid})"),
            Some(pid) => println!("{name}: not running (stale pid {pid})"),
            None => println!("{name}: not running"),
        }
    }
    if files.stop_requested().await {
        println!("stop requested");
    }
    if let Some(state) = WatchdogState::load(files).await {
        println!("{}", serde_json::to_string_pretty(&state)?);
    }
    Ok(())
}

async fn check_plan(config: &MaestroConfig, file: &Path) -> anyhow::Result<()> {
    let text = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("cannot read {}", file.display()))?;
    let runtime = build_runtime(config, Arc::new(AuditLog::disabled())).await?;

    match parse_plan(&text) {
        ParsedPlan::Workflow(plan) => {
            let engine = WorkflowEngine::new(runtime.invoker, config.orchestrator_config().workflow);
            let graph = engine.validate(&plan)?;
            println!("Workflow plan OK: {} step(s)", graph.len());
            for node in graph.nodes() {
                if node.plan.depends_on.is_empty() {
                    println!("  {}", node.plan.id);
                } else {
                    println!("  {} <- {}", node.plan.id, node.plan.depends_on.join(", "));
                }
            }
        }
        ParsedPlan::Council(plan) => {
            CouncilEngine::new(runtime.invoker, config.council_config())
                .validate(&plan)
                .await?;
            println!(
                "Council plan OK: {} agent(s), {} round(s)",
                plan.agents.len(),
                plan.rounds
            );
        }
        ParsedPlan::Malformed { reason, .. } => anyhow::bail!("Malformed plan: {reason}"),
        ParsedPlan::Absent => {
            anyhow::bail!("No workflow_plan or council_plan found in {}", file.display())
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
