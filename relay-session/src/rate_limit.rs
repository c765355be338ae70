//! Per-user sliding-window rate limiting.
//!
//! Every user gets two overlapping windows (one minute, one hour). Only
//! admitted requests consume quota, so a rejected request can be retried
//! without making things worse.

use crate::capacity::{select_victims, Candidate};
use dashmap::DashMap;
use relay_common::config::SessionConfig;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

const MINUTE_MS: i64 = 60_000;
const HOUR_MS: i64 = 3_600_000;

/// Which window rejected a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateScope {
    Minute,
    Hour,
}

impl fmt::Display for RateScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Minute => write!(f, "minute"),
            Self::Hour => write!(f, "hour"),
        }
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub admitted: bool,
    /// Rejecting window; `None` when admitted.
    pub scope: Option<RateScope>,
}

impl RateDecision {
    pub const fn admit() -> Self {
        Self {
            admitted: true,
            scope: None,
        }
    }

    pub const fn reject(scope: RateScope) -> Self {
        Self {
            admitted: false,
            scope: Some(scope),
        }
    }
}

/// Rate limiter thresholds.
#[derive(Debug, Clone)]
pub struct RateLimits {
    pub per_minute: usize,
    pub per_hour: usize,
    pub max_tracked_users: usize,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self::from(&SessionConfig::default())
    }
}

impl From<&SessionConfig> for RateLimits {
    fn from(config: &SessionConfig) -> Self {
        Self {
            per_minute: config.per_minute_limit,
            per_hour: config.per_hour_limit,
            max_tracked_users: config.max_tracked_users,
        }
    }
}

/// Admission history for one user.
#[derive(Debug)]
struct RateRecord {
    minute_hits: VecDeque<i64>,
    hour_hits: VecDeque<i64>,
    last_seen: i64,
    seq: u64,
}

impl RateRecord {
    fn new(seq: u64, now: i64) -> Self {
        Self {
            minute_hits: VecDeque::new(),
            hour_hits: VecDeque::new(),
            last_seen: now,
            seq,
        }
    }

    fn prune(&mut self, now: i64) {
        prune_window(&mut self.minute_hits, now, MINUTE_MS);
        prune_window(&mut self.hour_hits, now, HOUR_MS);
    }
}

/// Drop timestamps at least `window_ms` old. Hits are in arrival order.
fn prune_window(hits: &mut VecDeque<i64>, now: i64, window_ms: i64) {
    while let Some(&front) = hits.front() {
        if now - front >= window_ms {
            hits.pop_front();
        } else {
            break;
        }
    }
}

/// Concurrent per-user rate limiter.
///
/// Records live in a sharded map; a check for one user only contends with
/// users hashed to the same shard, and only for the duration of the check.
pub struct RateLimiter {
    limits: RateLimits,
    records: DashMap<String, RateRecord>,
    next_seq: AtomicU64,
}

impl RateLimiter {
    pub fn new(limits: RateLimits) -> Self {
        Self {
            limits,
            records: DashMap::new(),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Check whether `user_key` may make a request at `now` (Unix millis),
    /// recording the hit if admitted.
    pub fn check_and_record(&self, user_key: &str, now: i64) -> RateDecision {
        let decision = {
            let mut record = self
                .records
                .entry(user_key.to_string())
                .or_insert_with(|| RateRecord::new(self.next_seq.fetch_add(1, Ordering::Relaxed), now));

            record.last_seen = now;
            record.prune(now);

            if record.minute_hits.len() >= self.limits.per_minute {
                RateDecision::reject(RateScope::Minute)
            } else if record.hour_hits.len() >= self.limits.per_hour {
                RateDecision::reject(RateScope::Hour)
            } else {
                record.minute_hits.push_back(now);
                record.hour_hits.push_back(now);
                RateDecision::admit()
            }
        };

        if let Some(scope) = decision.scope {
            tracing::debug!(user = %user_key, %scope, "Request throttled");
        }

        self.enforce_capacity(user_key);
        decision
    }

    /// Remaining admissions for `user_key` in each window, without recording.
    pub fn remaining(&self, user_key: &str, now: i64) -> (usize, usize) {
        match self.records.get_mut(user_key) {
            Some(mut record) => {
                record.prune(now);
                (
                    self.limits.per_minute.saturating_sub(record.minute_hits.len()),
                    self.limits.per_hour.saturating_sub(record.hour_hits.len()),
                )
            }
            None => (self.limits.per_minute, self.limits.per_hour),
        }
    }

    /// Forget all history for `user_key`.
    pub fn remove(&self, user_key: &str) -> bool {
        self.records.remove(user_key).is_some()
    }

    pub fn contains(&self, user_key: &str) -> bool {
        self.records.contains_key(user_key)
    }

    /// Number of tracked users.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Remove users idle for longer than `threshold`. Returns how many were removed.
    pub fn sweep_stale(&self, now: i64, threshold: Duration) -> usize {
        let threshold_ms = threshold.as_millis() as i64;
        let before = self.records.len();
        self.records
            .retain(|_, record| now - record.last_seen <= threshold_ms);
        before.saturating_sub(self.records.len())
    }

    fn enforce_capacity(&self, keep: &str) {
        let tracked = self.records.len();
        if tracked <= self.limits.max_tracked_users {
            return;
        }

        let candidates: Vec<Candidate> = self
            .records
            .iter()
            .filter(|entry| entry.key() != keep)
            .map(|entry| Candidate {
                key: entry.key().clone(),
                last_seen: entry.last_seen,
                seq: entry.seq,
            })
            .collect();

        let victims = select_victims(candidates, tracked - self.limits.max_tracked_users);
        for key in &victims {
            self.records.remove(key);
        }
        tracing::debug!(evicted = victims.len(), "Rate limiter over capacity");
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimits::default())
    }
}
