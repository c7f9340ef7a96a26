//! berthd — the BerthGrid daemon.
//!
//! The scheduler and executor are libraries; production deployments
//! embed them next to a concrete resource-manager driver. This binary
//! runs the **standalone** development loop: scheduler and executor in
//! one process, wired over an in-process driver, with a synthetic offer
//! feed and a simulated node agent. It exists so the full
//! pod→offer→launch→running loop can be exercised locally.
//!
//! # Usage
//!
//! ```text
//! berthd standalone --listen 127.0.0.1:10251 --offer-ttl-secs 30
//! curl -XPOST localhost:10251/api/v1/pods -d @pod.json
//! curl localhost:10251/debug/scheduler/tasks
//! ```

mod devloop;

use std::net::SocketAddr;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;

#[derive(Parser)]
#[command(name = "berthd", about = "BerthGrid daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the standalone development loop (scheduler + executor in
    /// one process over an in-process driver).
    Standalone {
        /// Address for the debug/metrics/pod-intake HTTP server.
        #[arg(long, default_value = "127.0.0.1:10251")]
        listen: SocketAddr,

        /// Offer TTL in seconds.
        #[arg(long, default_value = "30")]
        offer_ttl_secs: u64,

        /// Interval between synthetic offer batches, in seconds.
        #[arg(long, default_value = "5")]
        offer_interval_secs: u64,

        /// Hostname advertised by the simulated agent.
        #[arg(long, default_value = "dev-node")]
        node_name: String,

        /// Simulated pod startup delay, in milliseconds.
        #[arg(long, default_value = "500")]
        startup_delay_ms: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,berthd=debug,berthgrid=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Standalone {
            listen,
            offer_ttl_secs,
            offer_interval_secs,
            node_name,
            startup_delay_ms,
        } => {
            run_standalone(
                listen,
                Duration::from_secs(offer_ttl_secs),
                Duration::from_secs(offer_interval_secs),
                node_name,
                Duration::from_millis(startup_delay_ms),
            )
            .await
        }
    }
}

async fn run_standalone(
    listen: SocketAddr,
    offer_ttl: Duration,
    offer_interval: Duration,
    node_name: String,
    startup_delay: Duration,
) -> anyhow::Result<()> {
    info!("berthd starting in standalone mode");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let loop_config = devloop::DevLoopConfig {
        offer_ttl,
        offer_interval,
        node_name,
        startup_delay,
    };
    let devloop = devloop::DevLoop::start(loop_config, shutdown_rx.clone());

    let router = devloop.router();
    let listener = tokio::net::TcpListener::bind(listen).await?;
    info!(%listen, "debug server listening");

    let server = tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
    devloop.stop().await;
    server.abort();

    Ok(())
}
