use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, info, warn};
use tokio::sync::{Mutex, mpsc};
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;

use crate::daemon::output::OutputLayout;
use crate::daemon::probe::{ProbeCommand, probe_and_log};
use crate::daemon::types::Connection;

/// Fixed set of workers draining a bounded queue of probe requests.
///
/// At most `workers` probes run at once and at most `queue_capacity` wait,
/// however many cycles have dispatched into the pool.
pub struct ProbePool {
    tx: mpsc::Sender<Connection>,
    workers: Vec<JoinHandle<()>>,
    stats: Arc<ProbeStats>,
}

#[derive(Debug, Default)]
pub struct ProbeStats {
    pub succeeded: AtomicU64,
    pub failed: AtomicU64,
}

impl ProbeStats {
    pub fn finished(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed) + self.failed.load(Ordering::Relaxed)
    }
}

/// What happened to one cycle's connections.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub dispatched: usize,
    pub over_cap: usize,
    pub queue_full: usize,
    pub closed: usize,
}

impl ProbePool {
    pub fn start(workers: usize, queue_capacity: usize, probe: ProbeCommand, layout: OutputLayout) -> Self {
        let (tx, rx) = mpsc::channel::<Connection>(queue_capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let stats = Arc::new(ProbeStats::default());
        let probe = Arc::new(probe);
        let layout = Arc::new(layout);

        let workers = (0..workers)
            .map(|id| {
                let rx = rx.clone();
                let stats = stats.clone();
                let probe = probe.clone();
                let layout = layout.clone();
                tokio::spawn(async move {
                    loop {
                        let next = rx.lock().await.recv().await;
                        let Some(conn) = next else { break };
                        debug!("worker {id} took {}", conn.remote_ip);
                        if probe_and_log(conn, &probe, &layout).await {
                            stats.succeeded.fetch_add(1, Ordering::Relaxed);
                        } else {
                            stats.failed.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    debug!("worker {id} exiting");
                })
            })
            .collect();

        Self { tx, workers, stats }
    }

    pub fn stats(&self) -> Arc<ProbeStats> {
        self.stats.clone()
    }

    /// Queues at most `cycle_cap` connections without waiting. Whatever does
    /// not fit is dropped; it gets another chance only if it shows up again
    /// after its dedup window.
    pub fn dispatch(&self, conns: Vec<Connection>, cycle_cap: usize) -> CycleReport {
        let mut report = CycleReport::default();
        for conn in conns {
            if report.dispatched >= cycle_cap {
                warn!("cycle cap {cycle_cap} reached, dropping {}", conn.remote_ip);
                report.over_cap += 1;
                continue;
            }
            let ip = conn.remote_ip.clone();
            let port = conn.remote_port;
            match self.tx.try_send(conn) {
                Ok(()) => {
                    info!("PT start: {ip} {port}");
                    report.dispatched += 1;
                }
                Err(TrySendError::Full(_)) => {
                    warn!("probe queue full, dropping {ip}");
                    report.queue_full += 1;
                }
                Err(TrySendError::Closed(_)) => {
                    warn!("probe queue closed, dropping {ip}");
                    report.closed += 1;
                }
            }
        }
        report
    }

    /// Closes the queue and waits for the workers to drain it.
    pub async fn shutdown(self) {
        let Self { tx, workers, .. } = self;
        drop(tx);
        for worker in workers {
            let _ = worker.await;
        }
    }
}
