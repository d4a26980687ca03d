//! Connection discovery and deduplicated probe dispatch.
//!
//! Every poll interval the daemon reads `ss -e`, keeps established TCP rows
//! whose remote address has not been probed within the dedup window, and
//! hands up to `cycle_cap` of them to a bounded worker pool that runs one
//! traceroute per connection.

pub mod cache;
pub mod config;
pub mod output;
pub mod parser;
pub mod pool;
pub mod probe;
pub mod ss;
pub mod types;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info};
use tokio::time::MissedTickBehavior;

use crate::daemon::cache::{RecentIpCache, SweepHandle};
use crate::daemon::config::Config;
use crate::daemon::output::OutputLayout;
use crate::daemon::parser::ConnectionParser;
use crate::daemon::pool::{CycleReport, ProbePool, ProbeStats};
use crate::daemon::probe::ProbeCommand;
use crate::daemon::ss::SsSource;

pub struct Daemon {
    source: SsSource,
    cache: RecentIpCache,
    sweep: SweepHandle,
    pool: ProbePool,
    poll_interval: Duration,
    cycle_cap: usize,
}

impl Daemon {
    /// Validates `config` and wires the components from it. Spawns tasks, so
    /// it must be called inside a tokio runtime.
    pub fn start(config: &Config) -> anyhow::Result<Self> {
        let parser = ConnectionParser::new(config.ignored_prefixes.clone(), config.cookie_field);
        let source = SsSource::new(config.ss_binary.clone(), parser);
        Self::with_source(config, source)
    }

    /// Like [`Daemon::start`] with a caller supplied connection source.
    pub fn with_source(config: &Config, source: SsSource) -> anyhow::Result<Self> {
        config.validate()?;
        let (cache, sweep) = RecentIpCache::start(config.dedup_ttl(), config.sweep_interval());
        let probe = ProbeCommand::new(config.probe_binary.clone(), config.probe_timeout());
        let layout = OutputLayout::new(
            config.output_root.clone(),
            config.boot_marker.clone(),
            config.short_hostname,
        );
        let pool = ProbePool::start(config.workers, config.queue_capacity, probe, layout);

        Ok(Self {
            source,
            cache,
            sweep,
            pool,
            poll_interval: config.poll_interval(),
            cycle_cap: config.cycle_cap,
        })
    }

    pub fn cache(&self) -> &RecentIpCache {
        &self.cache
    }

    pub fn stats(&self) -> Arc<ProbeStats> {
        self.pool.stats()
    }

    /// One poll: read fresh connections and dispatch them. Only a broken
    /// connection-table command makes this fail.
    pub async fn cycle(&self) -> anyhow::Result<CycleReport> {
        debug!("cycle start, {} cached", self.cache.len());
        let conns = self.source.get_connections(&self.cache).await?;
        let found = conns.len();
        let report = self.pool.dispatch(conns, self.cycle_cap);
        info!(
            "cycle: {} new, {} dispatched, {} over cap, {} queue full, {} queue closed, {} cached",
            found,
            report.dispatched,
            report.over_cap,
            report.queue_full,
            report.closed,
            self.cache.len()
        );
        Ok(report)
    }

    /// Polls every interval until `shutdown` resolves or a cycle fails.
    pub async fn run_until<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()>,
    {
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        let result = loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.cycle().await {
                        error!("connection table unavailable: {e:#}");
                        break Err(e);
                    }
                }
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break Ok(());
                }
            }
        };

        self.shutdown().await;
        result
    }

    /// Stops polling resources: drains the probe queue, then stops the sweep.
    pub async fn shutdown(self) {
        let Self { sweep, pool, .. } = self;
        pool.shutdown().await;
        sweep.stop().await;
        info!("daemon stopped");
    }
}
