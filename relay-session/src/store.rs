//! Per-user conversation history with a capped log and a running summary.
//!
//! Each user's record keeps at most `history_limit` turns. The newest
//! `recent_raw_limit` turns go to the model verbatim; anything older is
//! folded, once, into a text summary by the [`Summarizer`].
//!
//! ## Locking
//!
//! The user map is a sharded [`DashMap`], touched only to look up, insert
//! or evict a slot. Mutation happens under the slot's own async mutex, so a
//! summarizer call for one user never blocks another user. Hold a
//! [`SessionGuard`] across a multi-step exchange to keep it atomic for that
//! user.

use crate::capacity::{select_victims, Candidate};
use crate::summarizer::Summarizer;
use crate::types::{ChatMessage, Turn, TurnRole};
use dashmap::DashMap;
use relay_common::config::SessionConfig;
use std::ops::Range;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Conversation store limits.
#[derive(Debug, Clone)]
pub struct StoreLimits {
    /// Hard cap on stored turns per user.
    pub history_limit: usize,
    /// Newest turns sent verbatim.
    pub recent_raw_limit: usize,
    /// Tracked users before least recently seen ones are evicted.
    pub max_tracked_users: usize,
    /// Instruction leading every prompt.
    pub system_prompt: String,
}

impl Default for StoreLimits {
    fn default() -> Self {
        Self::from(&SessionConfig::default())
    }
}

impl From<&SessionConfig> for StoreLimits {
    fn from(config: &SessionConfig) -> Self {
        Self {
            history_limit: config.history_limit,
            recent_raw_limit: config.recent_raw_limit,
            max_tracked_users: config.max_tracked_users,
            system_prompt: config.system_prompt.clone(),
        }
    }
}

/// What `build_context` must do with the summary before rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SummaryPlan {
    /// Everything fits in the recent window; drop any old summary.
    Reset,
    /// These turn indices aged out since the last build and need folding.
    Fold(Range<usize>),
    /// Summary already covers every aged-out turn.
    UpToDate,
}

/// One user's stored conversation.
#[derive(Debug, Clone, Default)]
pub struct ConversationRecord {
    messages: Vec<Turn>,
    summary: String,
    summarized_count: usize,
}

impl ConversationRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[Turn] {
        &self.messages
    }

    pub fn summary(&self) -> &str {
        &self.summary
    }

    /// Turns, counted from the oldest stored one, already folded into the summary.
    pub fn summarized_count(&self) -> usize {
        self.summarized_count
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Append a turn, dropping the oldest ones beyond `history_limit`.
    ///
    /// Returns how many turns were dropped.
    pub fn push(&mut self, turn: Turn, history_limit: usize) -> usize {
        self.messages.push(turn);

        let overflow = self.messages.len().saturating_sub(history_limit);
        if overflow > 0 {
            self.messages.drain(..overflow);
            // Dropped turns that were never folded in are gone for good.
            self.summarized_count = self.summarized_count.saturating_sub(overflow);
        }

        self.check_invariants(history_limit);
        overflow
    }

    /// Number of stored turns outside the recent window.
    pub fn older_count(&self, recent_raw_limit: usize) -> usize {
        self.messages.len().saturating_sub(recent_raw_limit)
    }

    /// Decide how the summary must change before the next prompt.
    pub fn plan(&self, recent_raw_limit: usize) -> SummaryPlan {
        let older = self.older_count(recent_raw_limit);
        if older == 0 {
            SummaryPlan::Reset
        } else if self.summarized_count < older {
            SummaryPlan::Fold(self.summarized_count..older)
        } else {
            SummaryPlan::UpToDate
        }
    }

    /// Drop the summary once the conversation fits the recent window again.
    pub fn reset_summary(&mut self) {
        self.summary.clear();
        self.summarized_count = 0;
    }

    /// Store a new summary covering the first `summarized_count` turns.
    pub fn set_summary(&mut self, summary: String, summarized_count: usize) {
        self.summary = summary;
        self.summarized_count = summarized_count;
    }

    /// Render the model prompt: instruction, optional summary, recent turns.
    pub fn render(&self, system_prompt: &str, recent_raw_limit: usize) -> Vec<ChatMessage> {
        let recent = recent_raw_limit.min(self.messages.len());
        let mut context = Vec::with_capacity(recent + 2);

        context.push(ChatMessage::system(system_prompt));
        if !self.summary.is_empty() {
            context.push(ChatMessage::system(format!(
                "Summary of the earlier conversation:\n{}",
                self.summary
            )));
        }
        context.extend(
            self.messages[self.messages.len() - recent..]
                .iter()
                .map(ChatMessage::from),
        );

        context
    }

    fn check_invariants(&mut self, history_limit: usize) {
        let bound = self.messages.len().min(history_limit);
        debug_assert!(
            self.summarized_count <= bound,
            "summarized_count {} out of range (bound {bound})",
            self.summarized_count
        );
        if self.summarized_count > bound {
            tracing::error!(
                summarized_count = self.summarized_count,
                bound,
                "Summary boundary out of range, clamping"
            );
            self.summarized_count = bound;
        }
    }
}

/// A tracked user's record plus bookkeeping read without taking its lock.
#[derive(Debug)]
struct Slot {
    seq: u64,
    last_seen: AtomicI64,
    record: Arc<Mutex<ConversationRecord>>,
}

impl Slot {
    fn new(seq: u64, now: i64) -> Self {
        Self {
            seq,
            last_seen: AtomicI64::new(now),
            record: Arc::new(Mutex::new(ConversationRecord::new())),
        }
    }

    fn touch(&self, now: i64) {
        self.last_seen.fetch_max(now, Ordering::Relaxed);
    }

    fn last_seen(&self) -> i64 {
        self.last_seen.load(Ordering::Relaxed)
    }

    /// A handler currently holds this record.
    fn is_busy(&self) -> bool {
        self.record.try_lock().is_err()
    }
}

/// Concurrent map of user conversations.
pub struct ConversationStore {
    limits: StoreLimits,
    summarizer: Arc<Summarizer>,
    slots: DashMap<String, Arc<Slot>>,
    next_seq: AtomicU64,
}

impl ConversationStore {
    pub fn new(limits: StoreLimits, summarizer: Arc<Summarizer>) -> Self {
        Self {
            limits,
            summarizer,
            slots: DashMap::new(),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Lock `user_key`'s record for an exclusive sequence of operations.
    ///
    /// Creates the record on first use. Waits if another handler for the
    /// same user holds it; other users are unaffected.
    pub async fn session(&self, user_key: &str, now: i64) -> SessionGuard<'_> {
        let slot = self.slot(user_key, now);
        slot.touch(now);
        let record = Arc::clone(&slot.record).lock_owned().await;
        SessionGuard {
            store: self,
            user_key: user_key.to_string(),
            slot,
            record,
            now,
        }
    }

    /// Append one turn for `user_key`.
    pub async fn append(&self, user_key: &str, role: TurnRole, content: &str, now: i64) {
        self.session(user_key, now).await.append(role, content);
    }

    /// Build the model prompt for `user_key`, summarizing aged-out turns first.
    pub async fn build_context(&self, user_key: &str, now: i64) -> Vec<ChatMessage> {
        self.session(user_key, now).await.build_context().await
    }

    /// Copy of the record for inspection. Does not count as activity.
    pub async fn snapshot(&self, user_key: &str) -> Option<ConversationRecord> {
        let slot = self.slots.get(user_key).map(|s| Arc::clone(s.value()))?;
        let record = slot.record.lock().await;
        Some(record.clone())
    }

    /// Last activity for `user_key`, Unix millis.
    pub fn last_seen(&self, user_key: &str) -> Option<i64> {
        self.slots.get(user_key).map(|s| s.last_seen())
    }

    pub fn contains(&self, user_key: &str) -> bool {
        self.slots.contains_key(user_key)
    }

    pub fn remove(&self, user_key: &str) -> bool {
        self.slots.remove(user_key).is_some()
    }

    /// Number of tracked users.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Remove users idle for longer than `threshold`.
    ///
    /// Records held by an in-flight handler are left for the next sweep.
    pub fn sweep_stale(&self, now: i64, threshold: Duration) -> usize {
        let threshold_ms = threshold.as_millis() as i64;
        let before = self.slots.len();
        self.slots
            .retain(|_, slot| now - slot.last_seen() <= threshold_ms || slot.is_busy());
        before.saturating_sub(self.slots.len())
    }

    fn slot(&self, user_key: &str, now: i64) -> Arc<Slot> {
        if let Some(slot) = self.slots.get(user_key) {
            return Arc::clone(slot.value());
        }
        let slot = {
            let entry = self.slots.entry(user_key.to_string()).or_insert_with(|| {
                Arc::new(Slot::new(self.next_seq.fetch_add(1, Ordering::Relaxed), now))
            });
            Arc::clone(entry.value())
        };
        self.enforce_capacity(user_key);
        slot
    }

    fn enforce_capacity(&self, keep: &str) {
        let tracked = self.slots.len();
        if tracked <= self.limits.max_tracked_users {
            return;
        }

        // A record held by a handler stays; evicting it would orphan the
        // handler's turns and let a second handler start on a fresh record.
        let candidates: Vec<Candidate> = self
            .slots
            .iter()
            .filter(|entry| entry.key() != keep && !entry.is_busy())
            .map(|entry| Candidate {
                key: entry.key().clone(),
                last_seen: entry.last_seen(),
                seq: entry.seq,
            })
            .collect();

        let excess = tracked - self.limits.max_tracked_users;
        let victims = select_victims(candidates, excess);
        for key in &victims {
            self.slots.remove_if(key, |_, slot| !slot.is_busy());
        }
        tracing::info!(
            evicted = victims.len(),
            deferred = excess.saturating_sub(victims.len()),
            limit = self.limits.max_tracked_users,
            "Conversation store over capacity"
        );
    }
}

/// Exclusive access to one user's conversation.
///
/// Turns appended and contexts built through the same guard can't interleave
/// with another handler for that user.
pub struct SessionGuard<'a> {
    store: &'a ConversationStore,
    user_key: String,
    slot: Arc<Slot>,
    record: OwnedMutexGuard<ConversationRecord>,
    now: i64,
}

impl SessionGuard<'_> {
    pub fn user_key(&self) -> &str {
        &self.user_key
    }

    pub fn record(&self) -> &ConversationRecord {
        &self.record
    }

    /// Append one turn, enforcing the history cap.
    pub fn append(&mut self, role: TurnRole, content: &str) {
        let dropped = self
            .record
            .push(Turn::new(role, content), self.store.limits.history_limit);
        self.slot.touch(self.now);

        if dropped > 0 {
            tracing::debug!(
                user = %self.user_key,
                dropped,
                summarized_count = self.record.summarized_count(),
                "History cap reached, dropped oldest turns"
            );
        }
    }

    /// Build the model prompt.
    ///
    /// Turns that left the recent window since the last build are folded
    /// into the summary first, so each turn is summarized at most once.
    pub async fn build_context(&mut self) -> Vec<ChatMessage> {
        let store = self.store;
        let limits = &store.limits;
        self.slot.touch(self.now);

        match self.record.plan(limits.recent_raw_limit) {
            SummaryPlan::Reset => {
                if !self.record.summary().is_empty() {
                    tracing::debug!(user = %self.user_key, "Conversation back inside recent window, summary reset");
                }
                self.record.reset_summary();
            }
            SummaryPlan::Fold(range) => {
                let folded_to = range.end;
                let summary = store
                    .summarizer
                    .compact(self.record.summary(), &self.record.messages()[range])
                    .await;
                self.record.set_summary(summary, folded_to);
            }
            SummaryPlan::UpToDate => {}
        }

        self.record
            .render(&limits.system_prompt, limits.recent_raw_limit)
    }
}
