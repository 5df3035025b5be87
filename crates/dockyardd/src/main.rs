//! dockyardd — the Dockyard daemon.
//!
//! Provisions build agents as containers on container engine hosts,
//! discovers those hosts from a label-indexed node pool, and serves the
//! management REST API.
//!
//! # Usage
//!
//! ```text
//! dockyardd serve --config /etc/dockyard/dockyard.toml --port 8480
//! dockyardd check --config dockyard.toml --cloud docker-local
//! dockyardd hosts --config dockyard.toml --cloud docker-local
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use dockyard_core::DockyardConfig;
use dockyardd::{Assembly, EngineMode, assemble, spawn_dispatcher};

#[derive(Parser)]
#[command(name = "dockyardd", about = "Dockyard daemon")]
struct Cli {
    /// Log output format.
    #[arg(long, value_enum, default_value = "text", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run the provisioning daemon and its API server.
    Serve {
        /// Path to dockyard.toml.
        #[arg(long, default_value = "/etc/dockyard/dockyard.toml")]
        config: PathBuf,

        /// Port to listen on.
        #[arg(long, default_value = "8480")]
        port: u16,

        /// Use an in-process engine instead of real Docker daemons.
        #[arg(long)]
        dry_run: bool,
    },
    /// Validate a configuration file and print what it declares.
    Check {
        #[arg(long)]
        config: PathBuf,

        /// Also query the engine version on each reachable host of this cloud.
        #[arg(long)]
        cloud: Option<String>,
    },
    /// List reachable hosts and their active container counts.
    Hosts {
        #[arg(long)]
        config: PathBuf,

        /// Only this cloud.
        #[arg(long)]
        cloud: Option<String>,
    },
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,dockyardd=debug,dockyard=debug"));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Serve {
            config,
            port,
            dry_run,
        } => {
            let mode = if dry_run { EngineMode::DryRun } else { EngineMode::Docker };
            run_serve(config, port, mode).await
        }
        Command::Check { config, cloud } => run_check(config, cloud).await,
        Command::Hosts { config, cloud } => run_hosts(config, cloud).await,
    }
}

async fn run_serve(config_path: PathBuf, port: u16, mode: EngineMode) -> anyhow::Result<()> {
    info!(path = ?config_path, "dockyard daemon starting");
    let config = DockyardConfig::from_file(&config_path)?;
    if config.clouds.is_empty() {
        warn!("no clouds configured; provisioning requests will be rejected");
    }

    let Assembly { state, provisioning } = assemble(&config, mode)?;

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let dispatcher = spawn_dispatcher(provisioning, state.substitution.clone(), shutdown_rx);

    // ── Start API server ───────────────────────────────────────

    let router = dockyard_api::build_router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for ctrl-c");
            }
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    let _ = dispatcher.await;
    info!("dockyard daemon stopped");
    Ok(())
}

async fn run_check(config_path: PathBuf, cloud: Option<String>) -> anyhow::Result<()> {
    let config = DockyardConfig::from_file(&config_path)?;
    println!("{}: ok", config_path.display());
    println!("  nodes: {}", config.nodes.len());
    for cloud in &config.clouds {
        println!(
            "  cloud {} -> {} (cap {}, discovery {})",
            cloud.name,
            cloud.fallback_url,
            cloud.container_cap,
            cloud.discovery_label.as_deref().unwrap_or("-"),
        );
        for template in &cloud.templates {
            println!(
                "    {} [{}] executors={} instance_cap={}",
                template.image,
                template.labels.join(" "),
                template.executors,
                template.instance_cap,
            );
        }
    }

    let Some(name) = cloud else {
        return Ok(());
    };
    let Assembly { state, .. } = assemble(&config, EngineMode::Docker)?;
    let Some(cloud) = state.clouds.get(&name) else {
        anyhow::bail!("unknown cloud: {name}");
    };

    let mut failures = 0;
    for host in cloud.resolver().find_all().await {
        match cloud.engine().version(&host).await {
            Ok(version) => println!(
                "  {host}: engine {} (api {})",
                version.version.as_deref().unwrap_or("?"),
                version.api_version.as_deref().unwrap_or("?"),
            ),
            Err(e) => {
                println!("  {host}: {e}");
                failures += 1;
            }
        }
    }
    if failures > 0 {
        anyhow::bail!("{failures} host(s) failed the version query");
    }
    Ok(())
}

async fn run_hosts(config_path: PathBuf, only: Option<String>) -> anyhow::Result<()> {
    let config = DockyardConfig::from_file(&config_path)?;
    let Assembly { state, .. } = assemble(&config, EngineMode::Docker)?;

    let mut listed = 0;
    for cloud in state.clouds.all() {
        let name = cloud.name();
        if only.as_deref().is_some_and(|o| o != name) {
            continue;
        }
        for host in cloud.resolver().find_all().await {
            let active = match cloud.engine().list_containers(&host).await {
                Ok(containers) => format!("({})", containers.len()),
                Err(_) => "Error".to_string(),
            };
            println!("{name}\t{host}\t{active}");
            listed += 1;
        }
    }
    if listed == 0 {
        anyhow::bail!("no hosts found");
    }
    Ok(())
}
