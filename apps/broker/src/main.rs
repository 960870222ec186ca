//! arpdb - operator console for many remote debugging sessions
//!
//! Debuggees started with `set_trace_active` dial in here. Their output is
//! printed with a session label; typed lines go to the current session and
//! `/switch` moves to the next one.

use std::path::PathBuf;

use clap::Parser;
use rpdb_core::{BrokerConfig, SessionBroker};
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

/// arpdb - relay one console to many rpdb sessions
#[derive(Parser, Debug)]
#[command(
    name = "arpdb",
    author,
    version,
    about = "arpdb - relay one console to many rpdb sessions",
    long_about = "arpdb accepts any number of rpdb sessions dialing in over TCP.\nLines typed here go to the current session; /switch selects the next one."
)]
struct Args {
    /// Address to listen on (overrides RPDB_ADDRESS)
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on (overrides RPDB_PORT)
    #[arg(short, long)]
    port: Option<u16>,

    /// Optional TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "warn")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "error" => Level::ERROR,
        _ => Level::WARN,
    };
    // Stdout is the operator console.
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .without_time()
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = BrokerConfig::load_from(args.config.as_deref(), None)?;
    if let Some(host) = args.host {
        config.address = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }

    let broker = SessionBroker::bind(&config).await?;
    info!(address = %broker.local_addr()?, "arpdb ready");

    let shutdown = CancellationToken::new();
    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    broker.run(BufReader::new(tokio::io::stdin()), tokio::io::stdout(), shutdown).await?;
    Ok(())
}
