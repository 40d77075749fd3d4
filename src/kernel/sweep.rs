//! Background monitor sweep.
//!
//! MonitorSweep periodically asks the kernel to check on its assets, so job
//! nodes waiting past their deadline are failed with a timeout and escalated.
//! It holds the kernel weakly and stops on its own once the kernel is gone.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::time::{interval, MissedTickBehavior};

use super::KernelCore;

/// Statistics over the sweep's lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepStats {
    /// Completed check cycles.
    pub cycles: u64,
    /// Job nodes failed with a timeout.
    pub timed_out: u64,
    /// When the last cycle completed.
    pub completed_at: Option<DateTime<Utc>>,
}

/// Periodic `check_on_assets` driver.
#[derive(Debug)]
pub struct MonitorSweep {
    core: Weak<KernelCore>,
    interval: Duration,
    stop_tx: Option<oneshot::Sender<()>>,
    stats_tx: Arc<watch::Sender<SweepStats>>,
}

impl MonitorSweep {
    pub(crate) fn new(core: &Arc<KernelCore>, interval: Duration) -> Self {
        let (stats_tx, _) = watch::channel(SweepStats::default());
        Self {
            core: Arc::downgrade(core),
            interval,
            stop_tx: None,
            stats_tx: Arc::new(stats_tx),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Start the sweep loop in the background.
    /// Returns immediately; the loop runs in a spawned task.
    pub fn start(&mut self) -> tokio::task::JoinHandle<()> {
        let core = self.core.clone();
        let period = self.interval;
        let stats_tx = self.stats_tx.clone();
        let (stop_tx, mut stop_rx) = oneshot::channel();
        self.stop_tx = Some(stop_tx);

        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(core) = core.upgrade() else {
                            tracing::info!("monitor_sweep_stopped: kernel dropped");
                            break;
                        };
                        let timed_out = match tokio::task::spawn_blocking(move || Self::run_cycle(&core)).await {
                            Ok(timed_out) => timed_out,
                            Err(e) => {
                                tracing::error!("sweep_cycle_failed: {}", e);
                                0
                            }
                        };
                        stats_tx.send_modify(|stats| {
                            stats.cycles += 1;
                            stats.timed_out += timed_out as u64;
                            stats.completed_at = Some(Utc::now());
                        });
                    }
                    _ = &mut stop_rx => {
                        tracing::info!("monitor_sweep_stopped");
                        break;
                    }
                }
            }
        })
    }

    /// Stop the sweep loop.
    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
    }

    pub fn stats(&self) -> SweepStats {
        self.stats_tx.borrow().clone()
    }

    /// Run a single check cycle. Runs on the blocking pool: expired job
    /// nodes may execute inline on passive teams.
    fn run_cycle(core: &Arc<KernelCore>) -> usize {
        let timed_out = core.check_on_assets();
        if timed_out > 0 {
            tracing::debug!("sweep_cycle_completed: timed_out={}", timed_out);
        }
        timed_out
    }
}

impl Drop for MonitorSweep {
    fn drop(&mut self) {
        self.stop();
    }
}
