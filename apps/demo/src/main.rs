//! rpdb-demo - a small debuggee for trying rpdb sessions by hand
//!
//! `passive` waits for `nc 127.0.0.1 4444`, `workers` dials an `arpdb`
//! broker from several tasks, `post-mortem` opens a session on a captured
//! failure and `trap` enters the debugger on SIGTRAP.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use rpdb_core::{BasicEngine, DebugConfig, DebugSessionController, Frame, SessionOutcome, Traceback};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// rpdb-demo - sample debuggee for rpdb
#[derive(Parser, Debug)]
#[command(name = "rpdb-demo", author, version, about = "rpdb-demo - sample debuggee for rpdb")]
struct Args {
    /// Address to bind or dial (overrides RPDB_ADDRESS)
    #[arg(long, global = true)]
    host: Option<String>,

    /// Port to bind or dial (overrides RPDB_PORT)
    #[arg(short, long, global = true)]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Count up and stop in a listening session every few iterations
    Passive {
        /// Number of iterations
        #[arg(long, default_value_t = 3)]
        iterations: u32,
    },

    /// Start several workers that each dial a broker
    Workers {
        /// Number of worker tasks
        #[arg(long, default_value_t = 3)]
        count: u32,
    },

    /// Fail, then open a listening session on the failure
    PostMortem,

    /// Wait for SIGTRAP and stop in a listening session each time
    Trap,
}

fn debug_config(args: &Args) -> anyhow::Result<DebugConfig> {
    let mut config = DebugConfig::load()?;
    if let Some(host) = &args.host {
        config.address.clone_from(host);
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    Ok(config)
}

fn controller(config: DebugConfig) -> Arc<DebugSessionController> {
    Arc::new(DebugSessionController::new(config, Arc::new(BasicEngine::factory())))
}

async fn report(controller: &DebugSessionController, who: &str, outcome: &SessionOutcome) {
    let text = match outcome {
        SessionOutcome::Detached(terminal) => format!("{who}: session closed with {terminal}\n"),
        SessionOutcome::Recurrent => format!("{who}: already being debugged\n"),
        SessionOutcome::Unavailable(e) => format!("{who}: continuing undebugged ({e})\n"),
        SessionOutcome::EngineFailed(e) => format!("{who}: debugger failed ({e})\n"),
    };
    controller.registry().stdio().write_str(&text).await.ok();
}

async fn passive(config: DebugConfig, iterations: u32) -> anyhow::Result<()> {
    let controller = controller(config);
    let stdio = controller.registry().stdio().clone();
    for i in 0..iterations {
        stdio.write_str(&format!("iteration {i}\n")).await?;
        let outcome = controller.set_trace(Frame::here(format!("iteration {i}"))).await;
        report(&controller, "main", &outcome).await;
    }
    Ok(())
}

async fn workers(config: DebugConfig, count: u32) -> anyhow::Result<()> {
    let mut handles = Vec::new();
    for worker in 0..count {
        // One controller per worker: each gets its own broker session.
        let controller = controller(config.clone());
        handles.push(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(u64::from(worker) * 50)).await;
            let who = format!("worker {worker}");
            let outcome = controller.set_trace_active(Frame::here(who.clone())).await;
            report(&controller, &who, &outcome).await;
        }));
    }
    for handle in handles {
        handle.await.context("worker task panicked")?;
    }
    Ok(())
}

fn parse_ratio(numerator: &str, denominator: &str) -> anyhow::Result<u32> {
    let numerator: u32 = numerator.parse().context("parsing numerator")?;
    let denominator: u32 = denominator.parse().context("parsing denominator")?;
    numerator.checked_div(denominator).context("denominator is zero")
}

async fn post_mortem(config: DebugConfig) -> anyhow::Result<()> {
    let controller = controller(config);
    match parse_ratio("10", "zero").context("computing ratio") {
        Ok(ratio) => {
            controller.registry().stdio().write_str(&format!("ratio = {ratio}\n")).await?;
        }
        Err(e) => {
            let outcome = controller.post_mortem(Traceback::from_anyhow(&e)).await;
            report(&controller, "post-mortem", &outcome).await;
        }
    }
    Ok(())
}

#[cfg(unix)]
async fn trap(config: DebugConfig) -> anyhow::Result<()> {
    let controller = controller(config);
    let handler = Arc::clone(&controller).handle_trap()?;
    controller
        .registry()
        .stdio()
        .write_str(&format!("send SIGTRAP to {} to debug, Ctrl-C to quit\n", std::process::id()))
        .await?;
    tokio::signal::ctrl_c().await?;
    handler.abort();
    Ok(())
}

#[cfg(not(unix))]
async fn trap(_config: DebugConfig) -> anyhow::Result<()> {
    anyhow::bail!("SIGTRAP handling is only available on unix")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .without_time()
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = debug_config(&args)?;
    match args.command {
        Command::Passive { iterations } => passive(config, iterations).await,
        Command::Workers { count } => workers(config, count).await,
        Command::PostMortem => post_mortem(config).await,
        Command::Trap => trap(config).await,
    }
}
