//! Per-message flow: admit, record, prompt, reply.
//!
//! ```text
//! inbound text → RateLimiter ─┬─ rejected → throttle notice
//!                             └─ admitted → append user turn
//!                                         → build context (may summarize)
//!                                         → Provider::complete
//!                                         → append assistant turn
//!                                         → MessageSender::send
//! ```

use crate::rate_limit::{RateDecision, RateLimiter, RateScope};
use crate::store::ConversationStore;
use crate::traits::{MessageSender, Provider};
use crate::types::TurnRole;
use dashmap::DashMap;
use relay_common::config::SessionConfig;
use std::sync::Arc;
use tokio::sync::mpsc;

/// How an inbound message was handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOutcome {
    /// The model replied and the reply was recorded.
    Replied,
    /// The model failed; the fallback text was sent instead.
    Fallback,
    /// Rejected by the rate limiter.
    Throttled(RateScope),
}

/// User-facing texts for the non-model paths.
#[derive(Debug, Clone)]
pub struct ReplyTexts {
    pub fallback: String,
    pub rate_limited: String,
}

impl From<&SessionConfig> for ReplyTexts {
    fn from(config: &SessionConfig) -> Self {
        Self {
            fallback: config.fallback_reply.clone(),
            rate_limited: config.rate_limited_reply.clone(),
        }
    }
}

impl Default for ReplyTexts {
    fn default() -> Self {
        Self::from(&SessionConfig::default())
    }
}

/// A dispatched message waiting for its user's worker.
struct Job {
    text: String,
    now: i64,
    decision: RateDecision,
}

/// Wires the session stores to the model and delivery collaborators.
pub struct Orchestrator {
    limiter: Arc<RateLimiter>,
    store: Arc<ConversationStore>,
    provider: Arc<dyn Provider>,
    sender: Arc<dyn MessageSender>,
    replies: ReplyTexts,
    /// Per-user FIFO of dispatched messages; present while a worker drains it.
    queues: DashMap<String, mpsc::UnboundedSender<Job>>,
}

impl Orchestrator {
    pub fn new(
        limiter: Arc<RateLimiter>,
        store: Arc<ConversationStore>,
        provider: Arc<dyn Provider>,
        sender: Arc<dyn MessageSender>,
        replies: ReplyTexts,
    ) -> Self {
        Self {
            limiter,
            store,
            provider,
            sender,
            replies,
            queues: DashMap::new(),
        }
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    /// Handle one inbound message end to end.
    ///
    /// Collaborator failures are absorbed here; this never returns an error.
    pub async fn on_message(&self, user_key: &str, text: &str, now: i64) -> MessageOutcome {
        let decision = self.limiter.check_and_record(user_key, now);
        self.complete_admitted(user_key, text, now, decision).await
    }

    /// Decide admission synchronously and finish the exchange on the user's worker.
    ///
    /// The webhook layer can acknowledge as soon as this returns; the caller
    /// is not expected to be around when the reply goes out. Messages from
    /// one user are queued here, before returning, and handled one at a time
    /// in dispatch order.
    pub fn dispatch(self: &Arc<Self>, user_key: String, text: String, now: i64) -> RateDecision {
        let decision = self.limiter.check_and_record(&user_key, now);
        let job = Job {
            text,
            now,
            decision,
        };

        let mut queue = self
            .queues
            .entry(user_key.clone())
            .or_insert_with(|| self.spawn_worker(&user_key));
        if let Err(mpsc::error::SendError(job)) = queue.send(job) {
            // Worker task died without deregistering.
            tracing::warn!(user = %user_key, "Message worker gone, restarting");
            *queue = self.spawn_worker(&user_key);
            if queue.send(job).is_err() {
                tracing::error!(user = %user_key, "Fresh message worker rejected job");
            }
        }

        decision
    }

    /// Number of users with queued or in-flight dispatched messages.
    pub fn pending_users(&self) -> usize {
        self.queues.len()
    }

    fn spawn_worker(self: &Arc<Self>, user_key: &str) -> mpsc::UnboundedSender<Job> {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(Arc::clone(self).drain(user_key.to_string(), rx));
        tx
    }

    async fn drain(self: Arc<Self>, user_key: String, mut rx: mpsc::UnboundedReceiver<Job>) {
        loop {
            while let Ok(job) = rx.try_recv() {
                let outcome = self
                    .complete_admitted(&user_key, &job.text, job.now, job.decision)
                    .await;
                tracing::debug!(user = %user_key, ?outcome, "Message handled");
            }

            // Checked under the map's shard lock, which `dispatch` holds while
            // sending, so no job can land after the queue is deregistered.
            if self
                .queues
                .remove_if(&user_key, |_, _| rx.is_empty())
                .is_some()
            {
                break;
            }
        }
    }

    async fn complete_admitted(
        &self,
        user_key: &str,
        text: &str,
        now: i64,
        decision: RateDecision,
    ) -> MessageOutcome {
        match decision.scope {
            Some(scope) if !decision.admitted => {
                tracing::info!(user = %user_key, %scope, "Rate limit exceeded");
                self.deliver(user_key, &self.replies.rate_limited).await;
                MessageOutcome::Throttled(scope)
            }
            _ => self.respond(user_key, text, now).await,
        }
    }

    async fn respond(&self, user_key: &str, text: &str, now: i64) -> MessageOutcome {
        let (reply, outcome) = {
            // Held until the reply is recorded so the next message from this
            // user sees it.
            let mut session = self.store.session(user_key, now).await;
            session.append(TurnRole::User, text);
            let context = session.build_context().await;

            match self.provider.complete(None, &context).await {
                Ok(reply) if !reply.trim().is_empty() => {
                    session.append(TurnRole::Assistant, &reply);
                    (reply, MessageOutcome::Replied)
                }
                Ok(_) => {
                    tracing::warn!(
                        user = %user_key,
                        provider = self.provider.name(),
                        "Model returned an empty reply"
                    );
                    (self.replies.fallback.clone(), MessageOutcome::Fallback)
                }
                Err(e) => {
                    tracing::error!(
                        user = %user_key,
                        provider = self.provider.name(),
                        error = %e,
                        "Model completion failed"
                    );
                    (self.replies.fallback.clone(), MessageOutcome::Fallback)
                }
            }
        };

        self.deliver(user_key, &reply).await;
        outcome
    }

    async fn deliver(&self, user_key: &str, text: &str) {
        let Err(e) = self.sender.send(user_key, text).await else {
            return;
        };
        let transient = e
            .downcast_ref::<relay_common::Error>()
            .is_some_and(relay_common::Error::is_transient);
        if transient {
            tracing::warn!(user = %user_key, error = %e, "Reply not delivered, platform busy");
        } else {
            tracing::error!(user = %user_key, error = %e, "Failed to send reply");
        }
    }
}
