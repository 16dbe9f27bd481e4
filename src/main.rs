//! Mount a directory read-only, with every listing in a chosen sort order.
use std::path::PathBuf;

use clap::Parser;
use sort_fuse::fs::SortKey;
use tracing::{debug, error};

mod app_config;
mod daemon;
mod fuse_check;
mod trc;

use crate::app_config::{Config, Overrides};
use crate::trc::Trc;

#[derive(Parser)]
#[command(
    version,
    about = "Present a directory through FUSE with its entries sorted by name, size or mtime."
)]
struct Args {
    /// Where to mount the sorted view. Overrides `mount-point` from the config file.
    mount_point: Option<PathBuf>,

    #[arg(short, long, help = "Directory whose contents are presented.")]
    target: Option<PathBuf>,

    #[arg(short = 'k', long, help = "Sort key: name, size or mtime.")]
    sort_key: Option<SortKey>,

    #[arg(short, long, help = "Sort in descending order.")]
    reverse: bool,

    #[arg(long, help = "List directories before everything else.")]
    dirs_first: bool,

    #[arg(long, help = "How long a directory listing is cached, in milliseconds.")]
    freshness_ms: Option<u64>,

    #[arg(long, help = "Allow other users to access the mount.")]
    allow_other: bool,

    #[arg(short, long, help = "Log at debug level.")]
    verbose: bool,

    #[arg(
        short,
        long,
        value_parser,
        help = "Optional path to a sort-fuse config TOML."
    )]
    config_path: Option<PathBuf>,
}

impl Args {
    fn overrides(&self) -> Overrides {
        Overrides {
            target: self.target.clone(),
            mount_point: self.mount_point.clone(),
            sort_key: self.sort_key,
            reverse: self.reverse,
            dirs_first: self.dirs_first,
            freshness_ms: self.freshness_ms,
            allow_other: self.allow_other,
        }
    }
}

/// Main entry point for the application.
fn main() {
    let args = Args::parse();

    // Errors use eprintln until tracing is initialized.
    if let Err(e) = Trc::default().verbose(args.verbose).init() {
        eprintln!(
            "Failed to initialize logging. Without logging, we can't provide any useful error \
             messages, so we have to exit: {e}"
        );
        std::process::exit(1);
    }

    let config = Config::load(args.config_path.as_deref())
        .map(|config| config.with_overrides(args.overrides()))
        .and_then(Config::absolutize)
        .unwrap_or_else(|e| {
            error!("Failed to load configuration: {e}");
            std::process::exit(1);
        });
    if let Err(error_messages) = config.validate() {
        error!("Configuration is invalid.");
        for msg in &error_messages {
            error!(" - {msg}");
        }
        std::process::exit(1);
    }

    if let Err(e) = fuse_check::ensure_fuse() {
        error!("{e}");
        std::process::exit(1);
    }

    debug!(config = ?config, "Starting with configuration...");
    if let Err(e) = daemon::spawn(config) {
        error!("Daemon failed: {e}");
        std::process::exit(1);
    }
}
