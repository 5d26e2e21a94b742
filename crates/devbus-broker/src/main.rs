//! devbus broker entry point.
//!
//! Wires together the broker context, both transport listeners, and the
//! telemetry generators, then parks until a shutdown signal arrives.
//!
//! # Usage
//!
//! ```text
//! devbus-broker [OPTIONS]
//!
//! Options:
//!   --config <PATH>           Config file path [default: config.toml]
//!   --duplex-addr <ADDR>      Strict duplex listener address
//!   --ws-addr <ADDR>          WebSocket listener address
//!   --seed <SEED>             Deterministic simulation seed
//!   --request-timeout-ms <MS> Per-request dispatch deadline
//!   --buffer-capacity <N>     Trace buffer capacity
//! ```
//!
//! Every option can also come from the environment (`DEVBUS_CONFIG`,
//! `DEVBUS_DUPLEX_ADDR`, `DEVBUS_WS_ADDR`, `DEVBUS_SEED`,
//! `DEVBUS_TIMEOUT_MS`, `DEVBUS_BUFFER`); CLI flags take precedence.
//!
//! # Runtime
//!
//! A single-threaded (`current_thread`) Tokio runtime: every listener,
//! connection, and telemetry generator is a cooperatively scheduled task on
//! one thread, and all waits are async suspension points.

use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use devbus_broker::config::BrokerConfig;
use devbus_broker::telemetry::spawn_telemetry_tasks;
use devbus_broker::transport::duplex::DuplexListener;
use devbus_broker::transport::ws::WsListener;
use devbus_broker::Broker;

// ── CLI argument definitions ──────────────────────────────────────────────────

/// devbus message broker.
#[derive(Debug, Parser)]
#[command(
    name = "devbus-broker",
    about = "Message broker routing structured commands to simulated device buses",
    version
)]
struct Cli {
    /// Path to the TOML configuration file. Missing file means defaults.
    #[arg(long, default_value = "config.toml", env = "DEVBUS_CONFIG")]
    config: PathBuf,

    /// Strict duplex (request/reply TCP) listener address.
    #[arg(long, env = "DEVBUS_DUPLEX_ADDR")]
    duplex_addr: Option<String>,

    /// Multi-client WebSocket listener address.
    #[arg(long, env = "DEVBUS_WS_ADDR")]
    ws_addr: Option<String>,

    /// Seed for the simulated devices' jitter generators.
    #[arg(long, env = "DEVBUS_SEED")]
    seed: Option<u64>,

    /// Per-request dispatch deadline in milliseconds.
    #[arg(long, env = "DEVBUS_TIMEOUT_MS")]
    request_timeout_ms: Option<u64>,

    /// Trace buffer capacity in envelopes.
    #[arg(long, env = "DEVBUS_BUFFER")]
    buffer_capacity: Option<usize>,
}

impl Cli {
    /// Loads the config file and layers the CLI/environment overrides on top.
    fn into_config(self) -> anyhow::Result<BrokerConfig> {
        let mut config = BrokerConfig::load(&self.config)
            .with_context(|| format!("loading config from {}", self.config.display()))?;

        if let Some(addr) = self.duplex_addr {
            config.transport.duplex_addr = addr;
        }
        if let Some(addr) = self.ws_addr {
            config.transport.ws_addr = addr;
        }
        if let Some(seed) = self.seed {
            config.broker.seed = seed;
        }
        if let Some(ms) = self.request_timeout_ms {
            config.broker.request_timeout_ms = ms;
        }
        if let Some(capacity) = self.buffer_capacity {
            config.broker.buffer_capacity = capacity;
        }
        Ok(config)
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.into_config()?;

    // Configuration problems are the only fatal errors; everything past
    // this point logs and keeps the process alive.
    let duplex_addr = config.duplex_addr().context("invalid duplex endpoint")?;
    let ws_addr = config.ws_addr().context("invalid websocket endpoint")?;
    let broker = Arc::new(Broker::new(config).context("broker initialization failed")?);

    info!("devbus broker starting: duplex={duplex_addr}, ws={ws_addr}");

    let running = Arc::new(AtomicBool::new(true));

    // ── Transport listeners ───────────────────────────────────────────────────
    let duplex = DuplexListener::bind(duplex_addr)
        .await
        .context("binding duplex listener")?;
    let ws = WsListener::bind(ws_addr)
        .await
        .context("binding websocket listener")?;

    let duplex_task = tokio::spawn(duplex.run(Arc::clone(&broker), Arc::clone(&running)));
    let ws_task = tokio::spawn(ws.run(Arc::clone(&broker), Arc::clone(&running)));

    // ── Telemetry generators ──────────────────────────────────────────────────
    let telemetry_tasks = spawn_telemetry_tasks(Arc::clone(&broker), Arc::clone(&running));

    // ── Ctrl-C / SIGTERM handler ──────────────────────────────────────────────
    let running_clone = Arc::clone(&running);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("shutdown signal received");
                running_clone.store(false, Ordering::Relaxed);
            }
            Err(e) => error!("failed to listen for Ctrl+C: {e}"),
        }
    });

    info!("devbus broker ready; press Ctrl-C to exit");

    let _ = duplex_task.await;
    let _ = ws_task.await;
    for task in telemetry_tasks {
        let _ = task.await;
    }

    info!("devbus broker stopped");
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
