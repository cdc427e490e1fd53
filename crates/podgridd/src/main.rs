//! podgridd — the podgrid daemon.
//!
//! Single binary that assembles the scheduler and its REST API:
//! - Compute provider client (or an in-memory provider with `--dry-run`)
//! - Scheduler loop (assignment, provisioning, pause/terminate sweep)
//! - REST API for workflow executors
//!
//! On Ctrl-C the API drains, the loop stops (pausing running nodes) and
//! every node is released unless `--keep-nodes` is given.
//!
//! # Usage
//!
//! ```text
//! podgridd run --config /etc/podgrid/podgrid.toml --port 8470
//! podgridd check-config --config /etc/podgrid/podgrid.toml
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use podgrid_core::PodgridConfig;
use podgrid_provider::{ComputeProvider, HttpProvider, InMemoryProvider};
use podgrid_scheduler::Scheduler;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "podgridd", about = "podgrid GPU worker-pool daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler and the API server.
    Run {
        /// Path to the TOML config file.
        #[arg(long, default_value = "podgrid.toml")]
        config: PathBuf,

        /// Port to listen on.
        #[arg(long, default_value = "8470")]
        port: u16,

        /// Emit logs as JSON lines.
        #[arg(long)]
        log_json: bool,

        /// Leave nodes allocated at the provider on shutdown.
        #[arg(long)]
        keep_nodes: bool,

        /// Use an in-memory provider instead of the provider API.
        #[arg(long)]
        dry_run: bool,
    },
    /// Parse and validate a config file, then print its workload pools.
    CheckConfig {
        #[arg(long, default_value = "podgrid.toml")]
        config: PathBuf,
    },
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new("info,podgridd=debug,podgrid=debug")
    });

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            port,
            log_json,
            keep_nodes,
            dry_run,
        } => {
            init_tracing(log_json);
            run(&config, port, keep_nodes, dry_run).await
        }
        Command::CheckConfig { config } => check_config(&config),
    }
}

fn load_config(path: &Path) -> anyhow::Result<PodgridConfig> {
    PodgridConfig::from_file(path)
        .with_context(|| format!("loading config from {}", path.display()))
}

fn check_config(path: &Path) -> anyhow::Result<()> {
    let config = load_config(path)?;
    println!("{}", serde_json::to_string_pretty(&pool_summary(&config))?);
    Ok(())
}

/// Per-workload-type pool settings, keyed by workload type.
fn pool_summary(config: &PodgridConfig) -> serde_json::Value {
    let pools: serde_json::Map<String, serde_json::Value> = config
        .workloads
        .iter()
        .map(|(name, workload)| {
            (
                name.clone(),
                serde_json::json!({
                    "capacity": workload.capacity,
                    "hardware": workload.hardware,
                    "pause_timeout": workload.pause_timeout,
                    "terminate_timeout": workload.terminate_timeout,
                }),
            )
        })
        .collect();
    serde_json::Value::Object(pools)
}

fn build_provider(
    config: &PodgridConfig,
    dry_run: bool,
) -> anyhow::Result<Arc<dyn ComputeProvider>> {
    if dry_run {
        info!("dry run: using in-memory provider");
        return Ok(Arc::new(InMemoryProvider::new()));
    }

    let api_key = std::env::var(&config.provider.api_key_env).ok();
    if api_key.is_none() {
        warn!(var = %config.provider.api_key_env, "provider API key not set");
    }
    let provider = HttpProvider::new(
        &config.provider.base_url,
        api_key,
        config.scheduler.provider_timeout(),
    )
    .context("building provider client")?;
    info!(base_url = %config.provider.base_url, "provider client initialized");
    Ok(Arc::new(provider))
}

async fn run(
    config_path: &Path,
    port: u16,
    keep_nodes: bool,
    dry_run: bool,
) -> anyhow::Result<()> {
    info!("podgrid daemon starting");

    let config = load_config(config_path)?;
    info!(
        path = %config_path.display(),
        workload_types = config.workloads.len(),
        "config loaded"
    );

    // ── Initialize subsystems ──────────────────────────────────

    let provider = build_provider(&config, dry_run)?;
    let scheduler = Scheduler::new(&config, provider);
    scheduler.start();
    info!(
        tick_interval = ?config.scheduler.tick_interval(),
        "scheduler started"
    );

    // ── Start API server ───────────────────────────────────────

    let router = podgrid_api::build_router(scheduler.clone());
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
            info!("shutdown signal received");
        })
        .await?;

    // ── Shutdown ───────────────────────────────────────────────

    let paused = scheduler.stop().await;
    info!(paused, "scheduler stopped");

    if keep_nodes {
        info!("leaving nodes allocated");
    } else {
        let released = scheduler.cleanup().await;
        info!(released, "nodes released");
    }

    info!("podgrid daemon stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use podgrid_core::WorkloadTypeConfig;

    #[test]
    fn cli_parses_run_flags() {
        let cli = Cli::try_parse_from([
            "podgridd",
            "run",
            "--config",
            "/etc/podgrid/podgrid.toml",
            "--port",
            "9000",
            "--keep-nodes",
            "--dry-run",
        ])
        .unwrap();

        match cli.command {
            Command::Run {
                config,
                port,
                log_json,
                keep_nodes,
                dry_run,
            } => {
                assert_eq!(config, PathBuf::from("/etc/podgrid/podgrid.toml"));
                assert_eq!(port, 9000);
                assert!(!log_json);
                assert!(keep_nodes);
                assert!(dry_run);
            }
            Command::CheckConfig { .. } => panic!("expected run"),
        }
    }

    #[test]
    fn cli_defaults() {
        let cli = Cli::try_parse_from(["podgridd", "check-config"]).unwrap();
        match cli.command {
            Command::CheckConfig { config } => assert_eq!(config, PathBuf::from("podgrid.toml")),
            Command::Run { .. } => panic!("expected check-config"),
        }
    }

    #[test]
    fn pool_summary_lists_each_workload_type() {
        let config = PodgridConfig::default()
            .with_workload("render", WorkloadTypeConfig::new(3, "render:1", &["A40", "L4"]))
            .with_workload("transcribe", WorkloadTypeConfig::new(1, "asr:2", &["T4"]));

        let summary = pool_summary(&config);
        assert_eq!(summary["render"]["capacity"], 3);
        assert_eq!(summary["render"]["hardware"], serde_json::json!(["A40", "L4"]));
        assert_eq!(summary["transcribe"]["hardware"], serde_json::json!(["T4"]));
        assert_eq!(
            summary["render"]["pause_timeout"],
            config.workloads["render"].pause_timeout.as_str()
        );
        assert_eq!(summary.as_object().unwrap().len(), 2);
    }

    #[test]
    fn load_config_reports_missing_file() {
        let err = load_config(Path::new("/nonexistent/podgrid.toml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/podgrid.toml"));
    }

    #[tokio::test]
    async fn dry_run_provider_serves_a_scheduler() {
        let config = PodgridConfig::default()
            .with_workload("render", WorkloadTypeConfig::new(1, "render:1", &["A40"]));
        let provider = build_provider(&config, true).unwrap();
        assert!(provider.list_storage_volumes().await.unwrap().is_empty());

        let scheduler = Scheduler::new(&config, provider);
        assert_eq!(scheduler.workload_types().collect::<Vec<_>>(), vec!["render"]);
    }
}
