//! Command-line interface for the fieldlink device gateway.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use fieldlink_core::config::env_vars;
use fieldlink_core::{ConnectionState, GatewayConfig};
use fieldlink_devices::topic::response_wildcard;
use fieldlink_devices::Gateway;
use tracing::{debug, info};

/// fieldlink - MQTT command/response gateway for field devices.
#[derive(Parser, Debug)]
#[command(name = "fieldlink")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Action to perform.
    #[command(subcommand)]
    command: Command,

    /// Configuration file (TOML).
    #[arg(short, long, global = true, env = "FIELDLINK_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Run the gateway until interrupted.
    Serve,
    /// Send one command to a device and wait for its acknowledgment.
    Send {
        /// Target device id.
        device: String,
        /// Command kind, e.g. gpio, pwm, servo, read_sensor, restart.
        kind: String,
        /// Command data as JSON.
        #[arg(default_value = "{}")]
        data: String,
        /// Acknowledgment timeout; defaults to commands.ack_timeout_ms.
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Print the effective configuration with secrets redacted.
    CheckConfig,
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    // JSON output for containers, compact output otherwise. Logs go to
    // stderr so command output on stdout stays parseable.
    let json_logging = std::env::var(env_vars::LOG_JSON)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(false);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("fieldlink={},warn", level))
    });

    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_writer(std::io::stderr)
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_env_filter(env_filter)
            .with_target(false)
            .compact()
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let config = GatewayConfig::load(args.config.as_deref()).context("Failed to load configuration")?;

    match args.command {
        Command::Serve => run_serve(config).await,
        Command::Send {
            device,
            kind,
            data,
            timeout_ms,
        } => run_send(config, &device, &kind, &data, timeout_ms).await,
        Command::CheckConfig => check_config(&config),
    }
}

fn start_gateway(config: GatewayConfig) -> Result<Gateway> {
    let store = fieldlink_storage::open_store(&config.storage).context("Failed to open storage")?;
    info!(
        broker = %config.mqtt.broker_addr(),
        storage = %config.storage.backend,
        "Starting gateway"
    );
    Ok(Gateway::start(config, store))
}

async fn run_serve(config: GatewayConfig) -> Result<()> {
    let gateway = start_gateway(config)?;

    let mut events = gateway.event_bus().subscribe();
    let logger = tokio::spawn(async move {
        while let Some((event, _meta)) = events.recv().await {
            debug!(event = event.type_name(), device_id = ?event.device_id(), "Gateway event");
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested");

    gateway.disconnect().await?;
    logger.abort();
    Ok(())
}

/// Wait until the connection is up and device responses are routed.
async fn wait_until_ready(gateway: &Gateway, limit: Duration) -> Result<()> {
    let responses = response_wildcard(&gateway.config().topics);
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if gateway.state() == ConnectionState::Connected && gateway.router().has_route(&responses) {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            bail!(
                "Broker {} not ready after {:?} (state: {})",
                gateway.config().mqtt.broker_addr(),
                limit,
                gateway.state()
            );
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

async fn run_send(
    config: GatewayConfig,
    device: &str,
    kind: &str,
    data: &str,
    timeout_ms: Option<u64>,
) -> Result<()> {
    let data: serde_json::Value =
        serde_json::from_str(data).with_context(|| format!("Command data is not JSON: {}", data))?;
    let timeout = Duration::from_millis(timeout_ms.unwrap_or(config.commands.ack_timeout_ms));
    let connect_limit = Duration::from_secs(config.mqtt.connect_timeout_secs);

    let gateway = start_gateway(config)?;
    let outcome = async {
        wait_until_ready(&gateway, connect_limit).await?;
        let id = gateway.send_command(device, kind, data).await?;
        let acknowledged = gateway.wait_for_ack(&id, timeout).await;
        Ok::<_, anyhow::Error>((id, acknowledged))
    }
    .await;
    gateway.disconnect().await?;

    let (id, acknowledged) = outcome?;
    println!(
        "{}",
        serde_json::json!({ "command_id": id, "device": device, "acknowledged": acknowledged })
    );
    if !acknowledged {
        bail!("Command {} was not acknowledged within {:?}", id, timeout);
    }
    Ok(())
}

fn check_config(config: &GatewayConfig) -> Result<()> {
    let rendered = toml::to_string_pretty(&config.redacted()).context("Failed to render configuration")?;
    println!("{}", rendered);
    Ok(())
}
