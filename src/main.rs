//! relaymq - MQTT upstream to downstream relay
//!
//! Usage:
//!   relaymq [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>          Configuration file path
//!   -u, --upstream <HOST:PORT>   Broker to receive from
//!   -d, --downstream <HOST:PORT> Broker to republish to
//!   -t, --topic <FILTER>         Topic filter (default: sensors/#)
//!   -l, --log-level              Log level (error, warn, info, debug, trace)
//!   -h, --help                   Print help
//!
//! Exit status: 0 after a clean shutdown, 2 on a configuration error,
//! 1 on any other failure.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio::sync::broadcast;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use relaymq::bridge::{log_events, Bridge};
use relaymq::config::{Config, Overrides};
use relaymq::transport::MqttTransport;

const EXIT_RUNTIME: u8 = 1;
const EXIT_CONFIG: u8 = 2;

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    #[default]
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }

    fn parse(level: &str) -> Self {
        match level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    }
}

/// relaymq - relay MQTT messages from one broker to another
#[derive(Parser, Debug)]
#[command(name = "relaymq")]
#[command(version)]
#[command(about = "Relay MQTT messages from an upstream broker to a downstream broker")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Upstream broker address (host:port)
    #[arg(short, long)]
    upstream: Option<String>,

    /// Downstream broker address (host:port)
    #[arg(short, long)]
    downstream: Option<String>,

    /// Topic filter to relay
    #[arg(short, long)]
    topic: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

fn main() -> ExitCode {
    let args = Args::parse();

    // Configuration errors are reported before any connection is attempted
    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    // Setup logging - CLI overrides config, config overrides default (info)
    let log_level = args
        .log_level
        .unwrap_or_else(|| LogLevel::parse(&config.log.level));

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level.to_tracing_level())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Error installing logger: {}", e);
        return ExitCode::from(EXIT_RUNTIME);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start runtime: {}", e);
            return ExitCode::from(EXIT_RUNTIME);
        }
    };

    match runtime.block_on(run(config, args.config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::from(EXIT_RUNTIME)
        }
    }
}

fn load_config(args: &Args) -> Result<Config, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => Config::read(path)?,
        None => Config::from_env()?,
    };
    config.apply_overrides(&Overrides {
        upstream: args.upstream.clone(),
        downstream: args.downstream.clone(),
        topic_filter: args.topic.clone(),
        log_level: None,
    });
    config.validate()?;
    Ok(config)
}

async fn run(config: Config, config_path: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(path) = &config_path {
        info!("Loaded configuration from {:?}", path);
    }

    let settings = relaymq::BridgeSettings::from(&config.relay);
    info!("Starting relaymq");
    info!("  Upstream: {} ({})", config.upstream.address, config.upstream.client_id);
    info!("  Downstream: {} ({})", config.downstream.address, config.downstream.client_id);
    info!(
        "  Filter: {} (QoS {})",
        settings.subscription_filter(),
        settings.subscribe_qos
    );
    info!("  Poll interval: {:?}", settings.poll_interval);
    info!("  Reconnect: {:?}", settings.reconnect);

    let mut bridge = Bridge::from_config(&config, Arc::new(MqttTransport::new()))?;
    let logger = tokio::spawn(log_events(bridge.subscribe_events()));

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown signal received");
        let _ = shutdown_tx.send(());
    });

    let report = bridge.start().await?;
    if !report.is_complete() {
        warn!("Not all brokers reachable at startup, supervisor keeps retrying");
    }

    bridge.run(shutdown_rx).await?;

    // Closing the event channel ends the logger once it has drained
    drop(bridge);
    let _ = tokio::time::timeout(Duration::from_secs(1), logger).await;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            warn!("Cannot listen for SIGTERM: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
