//! liftd — the Liftoff control plane daemon.
//!
//! Single binary that assembles every subsystem:
//! - State store (redb)
//! - Metrics facade
//! - LogHub + retention sweep
//! - WebSocket gateway (+ status fan-out, idle sweep)
//! - Autoscaler
//! - Resource optimizer (+ budget alert bridge)
//! - Health supervisor
//! - Orchestrator + sandbox reaper
//!
//! # Usage
//!
//! ```text
//! liftd serve --port 8080 --data-dir /var/lib/liftoff --dev
//! ```
//!
//! The daemon wires the in-memory sandbox provider; a hosted runtime
//! plugs in by implementing the same `SandboxProvider` trait.

mod config;
mod server;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;

use liftoff_autoscale::Autoscaler;
use liftoff_gateway::{AuthContext, Gateway, ServerFrame, StaticTokenVerifier};
use liftoff_health::{HealthSupervisor, ProbeSettings, probe};
use liftoff_loghub::LogHub;
use liftoff_metrics::MetricsFacade;
use liftoff_optimizer::ResourceOptimizer;
use liftoff_orchestrator::Orchestrator;
use liftoff_sandbox::MockSandboxProvider;
use liftoff_state::{ProjectRecord, StateStore, UserRecord};

use config::DaemonConfig;

#[derive(Parser)]
#[command(name = "liftd", about = "Liftoff control plane daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control plane (all subsystems in one process).
    Serve {
        /// Port to listen on.
        #[arg(long, default_value = "8080")]
        port: u16,

        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/liftoff")]
        data_dir: PathBuf,

        /// Development mode: seeds a dev principal and treats mocked
        /// probes as healthy.
        #[arg(long)]
        dev: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,liftd=debug,liftoff=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve {
            port,
            data_dir,
            dev,
        } => run_serve(port, data_dir, dev).await,
    }
}

async fn run_serve(port: u16, data_dir: PathBuf, dev: bool) -> anyhow::Result<()> {
    info!(dev, "liftoff control plane starting");
    let config = DaemonConfig::from_env(dev);

    std::fs::create_dir_all(&data_dir)?;
    let db_path = data_dir.join("liftoff.redb");

    // ── Subsystems ─────────────────────────────────────────────────

    let state = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let metrics = MetricsFacade::new();
    let loghub = LogHub::new(config.loghub.clone());

    let verifier = StaticTokenVerifier::new();
    if dev {
        seed_dev_principal(&state, &verifier)?;
    }

    let gateway = Gateway::new(
        config.gateway.clone(),
        verifier,
        state.clone(),
        loghub.clone(),
        metrics.clone(),
    );

    let provider = Arc::new(MockSandboxProvider::new());
    let orchestrator = Orchestrator::new(
        state.clone(),
        provider,
        loghub.clone(),
        metrics.clone(),
        config.orchestrator.clone(),
    );
    info!("orchestrator initialized");

    let scale_target = orchestrator.clone();
    let autoscaler = Autoscaler::new(state.clone(), metrics.clone()).with_executor(Arc::new(
        move |deployment_id: &str, target: u32| {
            let orchestrator = scale_target.clone();
            let deployment_id = deployment_id.to_string();
            Box::pin(async move {
                orchestrator.set_instances(&deployment_id, target).await?;
                Ok(())
            })
        },
    ));
    info!(tick_ms = config.autoscale_tick.as_millis() as u64, "autoscaler initialized");

    let optimizer = ResourceOptimizer::new(state.clone(), metrics.clone(), config.optimizer.clone());

    let supervisor = HealthSupervisor::new(config.supervisor.clone());
    register_probes(&supervisor, &config, &state, &metrics, &gateway, dev).await;
    info!("health supervisor initialized");

    // ── Background tasks ───────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::new();

    {
        let loghub = loghub.clone();
        let shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move { loghub.run(shutdown).await }));
    }
    {
        let gateway = gateway.clone();
        let shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move { gateway.run_idle_sweep(shutdown).await }));
    }
    {
        let gateway = gateway.clone();
        let changes = orchestrator.subscribe_status();
        let shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            gateway.run_status_fanout(changes, shutdown).await
        }));
    }
    {
        let autoscaler = autoscaler.clone();
        let tick = config.autoscale_tick;
        let shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move { autoscaler.run(tick, shutdown).await }));
    }
    {
        let optimizer = optimizer.clone();
        let shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move { optimizer.run(shutdown).await }));
    }
    {
        // Bridge budget alerts into the deployment's room.
        let gateway = gateway.clone();
        let mut alerts = optimizer.subscribe_alerts();
        let mut shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    alert = alerts.recv() => {
                        let Ok(alert) = alert else { break };
                        let frame = ServerFrame::BudgetAlert {
                            deployment_id: alert.deployment_id.clone(),
                            payload: serde_json::json!({
                                "level": format!("{:?}", alert.level).to_lowercase(),
                                "spent_usd": alert.spent_usd,
                                "limit_usd": alert.limit_usd,
                                "month": alert.month,
                            }),
                        };
                        gateway.send_to_room(&alert.deployment_id, frame).await;
                    }
                    _ = shutdown.changed() => break,
                }
            }
        }));
    }
    {
        let supervisor = supervisor.clone();
        let shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move { supervisor.run(shutdown).await }));
    }
    {
        let orchestrator = orchestrator.clone();
        let shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move { orchestrator.run_reaper(shutdown).await }));
    }

    // ── HTTP server ────────────────────────────────────────────────

    let router = server::build_router(&gateway, supervisor, metrics);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "server starting");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install CTRL+C handler");
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });
    server.await?;

    for task in tasks {
        let _ = task.await;
    }
    info!("liftoff control plane stopped");
    Ok(())
}

/// Register the built-in probe set.
async fn register_probes(
    supervisor: &HealthSupervisor,
    config: &DaemonConfig,
    state: &StateStore,
    metrics: &MetricsFacade,
    gateway: &Gateway,
    dev: bool,
) {
    let critical = ProbeSettings {
        timeout: config.probe_timeout,
        critical: true,
        enabled: true,
    };
    let standard = ProbeSettings {
        timeout: config.probe_timeout,
        critical: false,
        enabled: true,
    };

    supervisor
        .register("database", probe::database(state.clone()), critical.clone())
        .await;
    supervisor
        .register("metrics", probe::metrics(metrics.clone()), critical)
        .await;
    supervisor
        .register("system", probe::system(metrics.clone()), standard.clone())
        .await;

    // Gateway probe: degraded when nearing the connection cap.
    let gw = gateway.clone();
    let max_connections = config.gateway.max_connections;
    supervisor
        .register(
            "gateway",
            liftoff_health::from_fn(move || {
                let gw = gw.clone();
                async move {
                    let connections = gw.connection_count().await;
                    let details = serde_json::json!({
                        "connections": connections,
                        "max_connections": max_connections,
                    });
                    if connections * 10 >= max_connections * 9 {
                        liftoff_health::ProbeOutcome::degraded(0, details)
                    } else {
                        liftoff_health::ProbeOutcome::healthy(0, details)
                    }
                }
            }),
            standard.clone(),
        )
        .await;

    if dev {
        supervisor
            .register("network", probe::mocked(), standard.clone())
            .await;
    } else {
        supervisor
            .register(
                "network",
                probe::network(
                    "example.com".to_string(),
                    "http://example.com/".to_string(),
                    config.probe_timeout,
                ),
                standard.clone(),
            )
            .await;
    }

    for (i, url) in config.dependency_urls.iter().enumerate() {
        supervisor
            .register(
                &format!("dependency-{i}"),
                probe::http_dependency(url.clone(), config.probe_timeout),
                standard.clone(),
            )
            .await;
    }
}

/// Seed a development principal and token.
fn seed_dev_principal(
    state: &StateStore,
    verifier: &Arc<StaticTokenVerifier>,
) -> anyhow::Result<()> {
    if state.get_user("dev")?.is_none() {
        state.put_user(&UserRecord {
            id: "dev".to_string(),
            email: "dev@localhost".to_string(),
            plan_type: "pro".to_string(),
            created_at: 0,
        })?;
        state.put_project(&ProjectRecord {
            id: "dev-project".to_string(),
            user_id: "dev".to_string(),
            name: "dev project".to_string(),
            created_at: 0,
        })?;
    }
    verifier.insert(
        "dev-token",
        AuthContext {
            user_id: "dev".to_string(),
            email: "dev@localhost".to_string(),
            plan_type: "pro".to_string(),
        },
    );
    info!("dev principal seeded (token: dev-token)");
    Ok(())
}
