use std::sync::Arc;
use std::time::Duration;

use herald_core::config::SweepConfig;
use tokio::{sync::watch, time::MissedTickBehavior};
use tracing::{error, info, warn};

use crate::{error::Result, store::MessageStore};

/// Runtime knobs for the stuck-job sweep.
#[derive(Debug, Clone)]
pub struct SweepOptions {
    pub interval: Duration,
    /// How long a row may sit in `sending` before it is considered abandoned.
    /// Keep this several times above the send timeout.
    pub stuck_after: Duration,
    /// When set, stuck rows that already used this many claims are failed
    /// instead of revived.
    pub max_attempts: Option<u32>,
}

impl Default for SweepOptions {
    fn default() -> Self {
        Self::from(&SweepConfig::default())
    }
}

impl From<&SweepConfig> for SweepOptions {
    fn from(cfg: &SweepConfig) -> Self {
        Self {
            interval: Duration::from_secs(cfg.interval_secs.max(1)),
            stuck_after: Duration::from_secs(cfg.stuck_after_secs.max(1)),
            max_attempts: cfg.max_attempts.filter(|n| *n > 0),
        }
    }
}

/// What one sweep pass changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Rows returned to `pending`.
    pub reset: usize,
    /// Rows failed for exceeding `max_attempts`.
    pub exhausted: usize,
}

/// Crash recovery: puts messages whose claimant died mid-send back in the pool.
///
/// Runs on its own timer and talks to the dispatcher only through the store.
pub struct StuckSweeper {
    store: Arc<MessageStore>,
    opts: SweepOptions,
}

impl StuckSweeper {
    pub fn new(store: Arc<MessageStore>, opts: SweepOptions) -> Self {
        Self { store, opts }
    }

    /// Sweep every `interval` until `shutdown` broadcasts `true`.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            stuck_after_secs = self.opts.stuck_after.as_secs(),
            max_attempts = ?self.opts.max_attempts,
            "stuck-job sweep started"
        );

        let mut interval = tokio::time::interval(self.opts.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.sweep() {
                        error!("stuck-job sweep error: {e}");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("stuck-job sweep shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One pass: optionally fail exhausted rows, then revive the rest.
    pub fn sweep(&self) -> Result<SweepReport> {
        let older_than = chrono::Duration::seconds(self.opts.stuck_after.as_secs() as i64);

        let exhausted = match self.opts.max_attempts {
            Some(max) => self.store.fail_exhausted(older_than, max)?,
            None => 0,
        };
        if exhausted > 0 {
            warn!(count = exhausted, "stuck messages failed after max attempts");
        }

        let reset = self.store.reset_stuck(older_than)?;
        if reset > 0 {
            warn!(count = reset, "stuck messages returned to pending");
        }
        Ok(SweepReport { reset, exhausted })
    }
}
