use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, info};
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub const DEFAULT_SWEEP_EVERY: Duration = Duration::from_secs(1);

/// Remote addresses probed recently, keyed by IP, valued by first-seen
/// unix seconds.
///
/// Fixed window: `add` never refreshes an existing entry, so an address that
/// stays in the connection table is probed again only once its first
/// sighting has aged past the TTL and the sweep has dropped it.
#[derive(Clone, Debug)]
pub struct RecentIpCache {
    entries: Arc<Mutex<HashMap<String, u64>>>,
    ttl: Duration,
}

impl RecentIpCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::with_capacity(1000))),
            ttl,
        }
    }

    /// Builds the cache and starts its background sweep. A zero sweep period
    /// falls back to [`DEFAULT_SWEEP_EVERY`].
    pub fn start(ttl: Duration, sweep_every: Duration) -> (Self, SweepHandle) {
        let cache = Self::new(ttl);
        let handle = cache.spawn_sweep(sweep_every);
        (cache, handle)
    }

    pub fn has(&self, ip: &str) -> bool {
        self.lock().contains_key(ip)
    }

    /// Inserts `ip` with the current time unless it is already present.
    /// Returns true when a new entry was created.
    pub fn add(&self, ip: &str) -> bool {
        self.add_at(ip, unix_now())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// First-seen time of `ip`, if cached.
    pub fn first_seen(&self, ip: &str) -> Option<u64> {
        self.lock().get(ip).copied()
    }

    pub(crate) fn add_at(&self, ip: &str, now: u64) -> bool {
        let mut entries = self.lock();
        if entries.contains_key(ip) {
            return false;
        }
        entries.insert(ip.to_string(), now);
        true
    }

    /// Drops every entry older than the TTL as of `now`; returns how many.
    pub(crate) fn sweep_at(&self, now: u64) -> usize {
        let ttl = self.ttl.as_secs();
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|ip, first_seen| {
            let keep = now.saturating_sub(*first_seen) <= ttl;
            if !keep {
                debug!("cache expire {ip}");
            }
            keep
        });
        before - entries.len()
    }

    fn spawn_sweep(&self, every: Duration) -> SweepHandle {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let cache = self.clone();
        let every = if every.is_zero() { DEFAULT_SWEEP_EVERY } else { every };
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let expired = cache.sweep_at(unix_now());
                        if expired > 0 {
                            debug!("cache sweep expired {expired}, {} remain", cache.len());
                        }
                    }
                    _ = stop_rx.changed() => {
                        info!("cache sweep stopping");
                        break;
                    }
                }
            }
        });
        SweepHandle { stop_tx, task }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, u64>> {
        // Every critical section leaves the map consistent, so poisoning is ignored.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Stops the background sweep started by [`RecentIpCache::start`].
#[derive(Debug)]
pub struct SweepHandle {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SweepHandle {
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        let _ = self.task.await;
    }
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
