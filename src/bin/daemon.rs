use std::path::PathBuf;
use std::sync::atomic::Ordering;

use clap::Parser;
use env_logger::Env;
use log::{info, warn};

use traceprobe::{Config, Daemon};

/// Traceroute every new remote endpoint of this host's established TCP
/// connections.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// JSON config file; flags below override it
    #[arg(long, env = "TRACEPROBE_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, env = "TRACEPROBE_SS")]
    ss_binary: Option<String>,

    #[arg(long, env = "TRACEPROBE_SCAMPER")]
    probe_binary: Option<PathBuf>,

    #[arg(long, env = "TRACEPROBE_OUTPUT")]
    output_root: Option<PathBuf>,

    /// Path whose mtime stands in for the boot time
    #[arg(long)]
    boot_marker: Option<PathBuf>,

    /// Remote address prefix to never probe (repeatable, replaces the defaults)
    #[arg(long = "ignore-prefix")]
    ignored_prefixes: Vec<String>,

    /// Seconds before the same remote IP may be probed again
    #[arg(long)]
    ttl: Option<u64>,

    /// Seconds between connection table reads
    #[arg(long)]
    interval: Option<u64>,

    /// Maximum probes dispatched per poll cycle
    #[arg(long)]
    cycle_cap: Option<usize>,

    #[arg(long)]
    workers: Option<usize>,

    #[arg(long)]
    queue_capacity: Option<usize>,

    /// Seconds before a running probe is killed
    #[arg(long)]
    probe_timeout: Option<u64>,

    /// Use mlabN.siteNN instead of the full host name in filenames
    #[arg(long)]
    short_hostname: bool,

    /// Run a single poll cycle, wait for its probes, then exit
    #[arg(long)]
    once: bool,

    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn into_config(self) -> anyhow::Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };

        if let Some(v) = self.ss_binary {
            config.ss_binary = v;
        }
        if let Some(v) = self.probe_binary {
            config.probe_binary = v;
        }
        if let Some(v) = self.output_root {
            config.output_root = v;
        }
        if let Some(v) = self.boot_marker {
            config.boot_marker = v;
        }
        if !self.ignored_prefixes.is_empty() {
            config.ignored_prefixes = self.ignored_prefixes;
        }
        if let Some(v) = self.ttl {
            config.dedup_ttl_secs = v;
        }
        if let Some(v) = self.interval {
            config.poll_interval_secs = v;
        }
        if let Some(v) = self.cycle_cap {
            config.cycle_cap = v;
        }
        if let Some(v) = self.workers {
            config.workers = v;
        }
        if let Some(v) = self.queue_capacity {
            config.queue_capacity = v;
        }
        if let Some(v) = self.probe_timeout {
            config.probe_timeout_secs = v;
        }
        if self.short_hostname {
            config.short_hostname = true;
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(level)).init();

    let once = args.once;
    let config = args.into_config()?;
    info!("traceprobe starting; config={}", serde_json::to_string(&config)?);

    let daemon = Daemon::start(&config)?;

    if once {
        let cycle = daemon.cycle().await;
        let stats = daemon.stats();
        daemon.shutdown().await;
        let report = cycle?;
        info!(
            "single cycle done: {} dispatched, {} succeeded, {} failed",
            report.dispatched,
            stats.succeeded.load(Ordering::Relaxed),
            stats.failed.load(Ordering::Relaxed)
        );
        return Ok(());
    }

    daemon
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("cannot listen for ctrl-c: {e}");
                std::future::pending::<()>().await;
            }
        })
        .await
}
