//! Idle reaper — the periodic tend pass that closes idle-expired connections.
//!
//! Borrow traffic discovers stale connections on its own, but a pool nobody
//! borrows from would keep its sockets open forever. The reaper sweeps every
//! node's idle container on a fixed period, independent of the idle timeout,
//! and never touches borrowed connections.

use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::PoolError;
use crate::registry::NodeSet;

/// Outcome of one sweep over every node.
#[derive(Debug, Default)]
pub struct ReapReport {
    /// Pools swept successfully.
    pub nodes_swept: usize,
    /// Connections closed across all pools.
    pub reaped: usize,
    /// Pools that could not be swept this pass, by node name.
    pub failures: Vec<(String, PoolError)>,
}

/// Sweeps all pools in a [`NodeSet`].
#[derive(Debug, Clone)]
pub struct IdleReaper {
    nodes: NodeSet,
}

impl IdleReaper {
    pub fn new(nodes: NodeSet) -> Self {
        Self { nodes }
    }

    /// Run a single pass. A pool that fails is reported and skipped; the
    /// remaining pools are still swept.
    pub async fn reap_once(&self) -> ReapReport {
        let now = Instant::now();
        let mut report = ReapReport::default();

        for node in self.nodes.nodes().await {
            match node.pool().reap_idle(now) {
                Ok(reaped) => {
                    report.nodes_swept += 1;
                    report.reaped += reaped;
                }
                Err(e) => {
                    match &e {
                        PoolError::Closed { .. } => {
                            debug!(node = %node.name(), "skipping closed node");
                        }
                        _ => warn!(node = %node.name(), error = %e, "idle reap failed"),
                    }
                    report.failures.push((node.name().to_string(), e));
                }
            }
        }

        if report.reaped > 0 {
            info!(
                nodes = report.nodes_swept,
                reaped = report.reaped,
                "idle reap pass complete"
            );
        }
        report
    }

    /// Run [`reap_once`](Self::reap_once) every `period` on a background task.
    pub fn spawn(self, period: Duration) -> ReaperHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let period = period.max(Duration::from_millis(1));
        let handle = tokio::spawn(async move {
            run_reaper_loop(self, period, shutdown_rx).await;
        });
        info!(period = ?period, "idle reaper started");
        ReaperHandle {
            handle,
            shutdown_tx,
        }
    }
}

/// Handle to a running reaper task.
#[derive(Debug)]
pub struct ReaperHandle {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl ReaperHandle {
    /// Stop the reaper and wait for its task to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.handle.await {
            warn!(error = %e, "idle reaper task ended abnormally");
        }
        info!("idle reaper stopped");
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

async fn run_reaper_loop(reaper: IdleReaper, period: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately; the first pass runs one period in.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let report = reaper.reap_once().await;
                debug!(
                    nodes = report.nodes_swept,
                    reaped = report.reaped,
                    failures = report.failures.len(),
                    "tend pass"
                );
            }
            _ = shutdown.changed() => {
                debug!("idle reaper shutting down");
                break;
            }
        }
    }
}
