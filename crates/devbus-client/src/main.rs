//! devbus command-line client.
//!
//! One-shot commands against a running broker over either transport shape:
//!
//! ```text
//! devbus --endpoint tcp://127.0.0.1:5555 health
//! devbus gpio-set --pin 17 --value 1
//! devbus gpio-get --pin 17
//! devbus cmd i2c_read --params '{"address":118,"register":208,"length":1}'
//! devbus --endpoint ws://127.0.0.1:8080 watch
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use tracing_subscriber::EnvFilter;

use devbus_client::{BrokerClient, ClientConfig, Endpoint};

#[derive(Debug, Parser)]
#[command(
    name = "devbus",
    about = "Client for the devbus message broker",
    version
)]
struct Cli {
    /// Broker endpoint: `tcp://host:port` (strict duplex) or
    /// `ws://host:port` (multi-client).
    #[arg(long, default_value = "tcp://127.0.0.1:5555", env = "DEVBUS_ENDPOINT")]
    endpoint: String,

    /// Per-request deadline in milliseconds.
    #[arg(long, default_value_t = 5000, env = "DEVBUS_TIMEOUT_MS")]
    timeout_ms: u64,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Debug, Subcommand)]
enum CliCommand {
    /// Query broker status and per-device connection state.
    Health,
    /// Drive a GPIO pin.
    GpioSet {
        #[arg(long)]
        pin: u8,
        #[arg(long)]
        value: u8,
    },
    /// Read a GPIO pin.
    GpioGet {
        #[arg(long)]
        pin: u8,
    },
    /// Send an arbitrary action with JSON parameters.
    Cmd {
        /// Action name, e.g. `rs485_read_holding`.
        action: String,
        /// JSON object of parameters.
        #[arg(long, default_value = "{}")]
        params: String,
    },
    /// Subscribe to broadcast events (WebSocket endpoint only).
    Watch,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    let endpoint = Endpoint::parse(&cli.endpoint)
        .with_context(|| format!("invalid endpoint {:?}", cli.endpoint))?;
    let mut config = ClientConfig::new(endpoint);
    config.request_timeout = std::time::Duration::from_millis(cli.timeout_ms);

    let client = BrokerClient::connect(config)
        .await
        .context("connecting to broker")?;

    match cli.command {
        CliCommand::Health => {
            let health = client.health().await?;
            println!("{}", serde_json::to_string_pretty(&Value::Object(health))?);
        }
        CliCommand::GpioSet { pin, value } => {
            client.gpio_set(pin, value).await?;
            println!("pin {pin} = {value}");
        }
        CliCommand::GpioGet { pin } => {
            let value = client.gpio_get(pin).await?;
            println!("{value}");
        }
        CliCommand::Cmd { action, params } => {
            let params: Map<String, Value> = serde_json::from_str(&params)
                .context("--params must be a JSON object")?;
            let payload = client.request(&action, params).await?;
            println!("{}", serde_json::to_string_pretty(&Value::Object(payload))?);
        }
        CliCommand::Watch => {
            let Some(mut events) = client.subscribe_events() else {
                anyhow::bail!("watch requires a ws:// endpoint");
            };
            eprintln!("watching for events; Ctrl-C to stop");
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(envelope) => {
                            println!("{}", serde_json::to_string(&envelope)?);
                        }
                        Err(e) => {
                            eprintln!("event stream ended: {e}");
                            break;
                        }
                    },
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
        }
    }

    client.close().await;
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
