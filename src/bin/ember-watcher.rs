//! ember-watcher - SyndrDB metrics sidecar.
//!
//! Polls the shared memory region the database writes its counters into and
//! pushes every decoded snapshot to WebSocket clients on `/ws`.

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;
#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use std::time::Duration;

use clap::Parser;
use tracing::{Level, error, info, warn};
use tracing_subscriber::EnvFilter;

use ember_watcher::config::{DEFAULT_HTTP_PORT, DEFAULT_POLL_INTERVAL, DEFAULT_WRITE_TIMEOUT};
use ember_watcher::{Config, Shutdown, app};

/// Real-time metrics sidecar for SyndrDB.
#[derive(Parser)]
#[command(name = "ember-watcher", about = "Real-time metrics sidecar for SyndrDB", version)]
struct Args {
    /// Port of the HTTP/WebSocket listener.
    #[arg(long, env = "EMBER_HTTP_PORT", default_value_t = DEFAULT_HTTP_PORT)]
    http_port: u16,

    /// Poll interval in milliseconds.
    #[arg(long, env = "EMBER_INTERVAL_MS", default_value_t = DEFAULT_POLL_INTERVAL.as_millis() as u64)]
    interval_ms: u64,

    /// Bound on a single write to one subscriber, in milliseconds.
    #[arg(long, default_value_t = DEFAULT_WRITE_TIMEOUT.as_millis() as u64)]
    write_timeout_ms: u64,

    /// Increase logging verbosity (-v for debug, -vv for trace). Default is info level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let mut filter = EnvFilter::from_default_env();
    if let Ok(directive) = format!("ember_watcher={}", level).parse() {
        filter = filter.add_directive(directive);
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    let config = Config {
        http_port: args.http_port,
        poll_interval: Duration::from_millis(args.interval_ms),
        write_timeout: Duration::from_millis(args.write_timeout_ms),
        ..Config::default()
    };

    info!("ember-watcher {} starting", ember_watcher::VERSION);
    info!(
        "Config: port={}, interval={}ms, region={}",
        config.http_port,
        config.poll_interval.as_millis(),
        config.region_path.display()
    );

    let shutdown = Shutdown::new();
    let s = shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        if s.trigger() {
            info!("Received shutdown signal");
        }
    }) {
        warn!("Failed to set Ctrl-C handler: {}", e);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!("Failed to start async runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(app::run(config, shutdown)) {
        error!("{}", e);
        std::process::exit(1);
    }
    info!("ember-watcher stopped");
}
