//! mirisdr CLI: list, inspect, tune and stream Mirics MSi2500/MSi001 receivers.

use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::Parser;
use mirisdr_lib::stream::CancelHandle;

mod cli;

/// Shared shutdown flag, cleared by the Ctrl+C handler.
pub static RUNNING: AtomicBool = AtomicBool::new(true);

/// Cancel handle of the stream currently running, if any.
pub static ACTIVE_STREAM: Mutex<Option<CancelHandle>> = Mutex::new(None);

#[derive(Parser)]
#[command(
    name = "mirisdr",
    version,
    about = "Receiver tool for Mirics MSi2500/MSi001 USB SDR sticks"
)]
struct Args {
    /// Output as JSON (for devices, info, plan, rx, config)
    #[arg(long, global = true)]
    json: bool,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Use this config file instead of the platform default
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: cli::Command,
}

// ── Ctrl+C handler ──

fn on_interrupt() {
    RUNNING.store(false, Ordering::SeqCst);
    if let Ok(guard) = ACTIVE_STREAM.lock()
        && let Some(handle) = guard.as_ref()
    {
        let _ = handle.cancel();
    }
}

fn main() {
    let args = Args::parse();

    let default_filter = if args.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .format_timestamp(None)
        .format_target(false)
        .init();

    ctrlc::set_handler(on_interrupt).ok();

    if let Err(e) = cli::run(args.command, args.json, args.config.as_deref()) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
