//! Periodic removal of idle users from the rate limiter and conversation store.

use crate::rate_limit::RateLimiter;
use crate::store::ConversationStore;
use crate::types::now_millis;
use relay_common::config::SessionConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Counts removed by one sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub conversations: usize,
    pub rate_records: usize,
}

/// Evicts users idle for longer than `stale_threshold`.
pub struct Sweeper {
    limiter: Arc<RateLimiter>,
    store: Arc<ConversationStore>,
    stale_threshold: Duration,
    interval: Duration,
}

impl Sweeper {
    pub fn new(
        limiter: Arc<RateLimiter>,
        store: Arc<ConversationStore>,
        stale_threshold: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            limiter,
            store,
            stale_threshold,
            interval,
        }
    }

    pub fn from_config(
        limiter: Arc<RateLimiter>,
        store: Arc<ConversationStore>,
        config: &SessionConfig,
    ) -> Self {
        Self::new(limiter, store, config.stale_threshold(), config.sweep_interval())
    }

    /// Run one pass at `now` (Unix millis).
    pub fn sweep(&self, now: i64) -> SweepReport {
        let report = SweepReport {
            conversations: self.store.sweep_stale(now, self.stale_threshold),
            rate_records: self.limiter.sweep_stale(now, self.stale_threshold),
        };

        if report != SweepReport::default() {
            tracing::info!(
                conversations = report.conversations,
                rate_records = report.rate_records,
                tracked = self.store.len(),
                "Swept idle users"
            );
        }
        report
    }

    /// Sweep on a fixed interval until the returned handle is aborted.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            tracing::info!(
                interval_secs = self.interval.as_secs(),
                stale_threshold_secs = self.stale_threshold.as_secs(),
                "Idle-user sweeper started"
            );

            loop {
                interval.tick().await;
                self.sweep(now_millis());
            }
        })
    }
}
