//! btrfs-clone - Main entry point
//!
//! Copies a UrBackup btrfs snapshot tree to another volume.

use anyhow::Result;
use btrfs_clone::shutdown::ShutdownCoordinator;
use btrfs_clone::transport::Endpoint;
use btrfs_clone::{utils, Config, Driver, RunOptions};
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Source volume: a local path or ssh://[[user@]host[:port]]/path
    src: String,

    /// Destination volume: a local path or ssh://[[user@]host[:port]]/path
    dst: String,

    /// More output (repeatable)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Delete destination subvolumes and directories with no source counterpart
    #[arg(long)]
    delete_strays: bool,

    /// Log what would be done without changing anything
    #[arg(long)]
    dry_run: bool,

    /// Show live progress and countdowns before destructive steps
    #[arg(long)]
    interactive: bool,

    /// Keep going after individual failures
    #[arg(long)]
    ignore_errors: bool,

    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = if let Some(config_path) = &args.config {
        Config::from_file(config_path)?
    } else {
        Config::default()
    };

    // Initialize logging
    let configured = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(&utils::logger::level_for_verbosity(args.verbose, configured))?;

    tracing::info!("Starting btrfs-clone v{}", env!("CARGO_PKG_VERSION"));

    let options = RunOptions {
        verbose: args.verbose,
        delete_strays: args.delete_strays,
        dry_run: args.dry_run,
        interactive: args.interactive,
        ignore_errors: args.ignore_errors,
    };
    let src = Endpoint::parse(&args.src)?;
    let dst = Endpoint::parse(&args.dst)?;

    let (cancel, listener) = ShutdownCoordinator::new().spawn_listener();
    let driver = Driver::new(&config, &options, cancel.clone());
    let code = match driver.run(src, dst).await {
        Ok(summary) if summary.is_success() => 0,
        Ok(_) => 1,
        Err(_) => 1,
    };

    cancel.cancel();
    let _ = listener.await;

    // the console reader may still be blocked on stdin
    std::process::exit(code);
}
