//! End-to-end behaviour of the session core with in-memory collaborators.

use async_trait::async_trait;
use relay_session::{
    ChatMessage, ConversationStore, MessageOutcome, MessageRole, MessageSender, Orchestrator,
    Provider, RateLimiter, RateLimits, RateScope, ReplyTexts, StoreLimits, Summarizer, Sweeper,
    TurnRole, SUMMARY_SYSTEM_PROMPT,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const HOUR_MS: i64 = 3_600_000;

/// Answers summary requests with numbered digests and replies with "ok".
#[derive(Default)]
struct MockProvider {
    summary_prompts: Mutex<Vec<String>>,
    replies: AtomicUsize,
    fail_summaries: AtomicBool,
}

impl MockProvider {
    fn summary_calls(&self) -> usize {
        self.summary_prompts.lock().unwrap().len()
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn complete(
        &self,
        system: Option<&str>,
        messages: &[ChatMessage],
    ) -> anyhow::Result<String> {
        if system == Some(SUMMARY_SYSTEM_PROMPT) {
            let n = {
                let mut prompts = self.summary_prompts.lock().unwrap();
                prompts.push(messages[0].content.clone());
                prompts.len()
            };
            if self.fail_summaries.load(Ordering::SeqCst) {
                anyhow::bail!("summary backend timed out");
            }
            return Ok(format!("digest #{n}"));
        }

        // Give concurrent handlers a chance to interleave.
        tokio::task::yield_now().await;
        let n = self.replies.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("ok {n}"))
    }
}

#[derive(Default)]
struct Outbox {
    sent: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl MessageSender for Outbox {
    async fn send(&self, user_key: &str, text: &str) -> anyhow::Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push((user_key.to_string(), text.to_string()));
        Ok(())
    }
}

fn store_with(provider: Arc<MockProvider>, limits: StoreLimits) -> ConversationStore {
    ConversationStore::new(limits, Arc::new(Summarizer::new(provider)))
}

fn default_store(provider: Arc<MockProvider>) -> ConversationStore {
    store_with(provider, StoreLimits::default())
}

async fn append_users(store: &ConversationStore, user: &str, range: std::ops::RangeInclusive<usize>) {
    for i in range {
        store
            .append(user, TurnRole::User, &format!("msg-{i:03}"), i as i64)
            .await;
    }
}

#[tokio::test]
async fn short_conversation_never_summarizes() {
    let provider = Arc::new(MockProvider::default());
    let store = default_store(provider.clone());

    append_users(&store, "u", 1..=50).await;
    let context = store.build_context("u", 100).await;

    assert_eq!(provider.summary_calls(), 0);
    assert_eq!(context.len(), 51);
    assert_eq!(context[0].role, MessageRole::System);
    assert_eq!(context[1].content, "msg-001");
    assert_eq!(context[50].content, "msg-050");
    assert_eq!(store.snapshot("u").await.unwrap().summary(), "");
}

#[tokio::test]
async fn fifty_first_message_folds_exactly_the_first() {
    let provider = Arc::new(MockProvider::default());
    let store = default_store(provider.clone());

    append_users(&store, "u", 1..=51).await;
    let context = store.build_context("u", 100).await;

    let prompts = provider.summary_prompts.lock().unwrap().clone();
    assert_eq!(prompts.len(), 1);
    assert!(prompts[0].contains("User: msg-001"));
    assert!(!prompts[0].contains("msg-002"));

    let record = store.snapshot("u").await.unwrap();
    assert_eq!(record.summarized_count(), 1);
    assert_eq!(record.summary(), "digest #1");

    // system prompt, summary, 50 recent turns
    assert_eq!(context.len(), 52);
    assert_eq!(context[1].role, MessageRole::System);
    assert!(context[1].content.contains("digest #1"));
    assert_eq!(context[2].content, "msg-002");
    assert_eq!(context[51].content, "msg-051");
}

#[tokio::test]
async fn build_context_is_idempotent() {
    let provider = Arc::new(MockProvider::default());
    let store = default_store(provider.clone());

    append_users(&store, "u", 1..=60).await;
    let first = store.build_context("u", 100).await;
    let second = store.build_context("u", 101).await;

    assert_eq!(first, second);
    assert_eq!(provider.summary_calls(), 1);
}

#[tokio::test]
async fn each_aged_out_chunk_is_folded_once() {
    let provider = Arc::new(MockProvider::default());
    let store = default_store(provider.clone());

    append_users(&store, "u", 1..=53).await;
    store.build_context("u", 100).await;
    append_users(&store, "u", 54..=55).await;
    store.build_context("u", 101).await;

    let prompts = provider.summary_prompts.lock().unwrap().clone();
    assert_eq!(prompts.len(), 2);
    assert!(prompts[0].contains("msg-003") && !prompts[0].contains("msg-004"));
    assert!(prompts[1].contains("Existing summary:\ndigest #1"));
    assert!(prompts[1].contains("msg-004") && prompts[1].contains("msg-005"));
    assert!(!prompts[1].contains("msg-003"));
    assert_eq!(store.snapshot("u").await.unwrap().summarized_count(), 5);
}

#[tokio::test]
async fn summarizer_failure_keeps_summary_and_moves_on() {
    let provider = Arc::new(MockProvider::default());
    let store = default_store(provider.clone());

    append_users(&store, "u", 1..=51).await;
    store.build_context("u", 100).await;

    provider.fail_summaries.store(true, Ordering::SeqCst);
    append_users(&store, "u", 52..=52).await;
    store.build_context("u", 101).await;

    let record = store.snapshot("u").await.unwrap();
    assert_eq!(record.summary(), "digest #1");
    assert_eq!(record.summarized_count(), 2);

    // The failed batch is not retried.
    store.build_context("u", 102).await;
    assert_eq!(provider.summary_calls(), 2);
}

#[tokio::test]
async fn history_cap_keeps_summary_boundary_in_range() {
    let provider = Arc::new(MockProvider::default());
    let store = default_store(provider.clone());

    for i in 1..=250usize {
        store
            .append("u", TurnRole::User, &format!("msg-{i:03}"), i as i64)
            .await;
        if i % 7 == 0 {
            store.build_context("u", i as i64).await;
        }
        let record = store.snapshot("u").await.unwrap();
        assert!(record.len() <= 100);
        assert!(record.summarized_count() <= record.len());
    }

    let record = store.snapshot("u").await.unwrap();
    assert_eq!(record.len(), 100);
    assert_eq!(record.messages()[0].content, "msg-151");
}

#[tokio::test]
async fn evicted_conversation_restarts_without_summary() {
    let provider = Arc::new(MockProvider::default());
    let store = store_with(
        provider.clone(),
        StoreLimits {
            max_tracked_users: 1,
            ..StoreLimits::default()
        },
    );

    append_users(&store, "u", 1..=60).await;
    store.build_context("u", 100).await;
    assert!(!store.snapshot("u").await.unwrap().summary().is_empty());

    // A newer user pushes "u" out of the store.
    store.append("other", TurnRole::User, "hi", 200).await;
    assert!(!store.contains("u"));

    store.append("u", TurnRole::User, "back again", 300).await;
    let context = store.build_context("u", 300).await;
    assert_eq!(context.len(), 2);
    assert_eq!(store.snapshot("u").await.unwrap().summary(), "");
}

#[tokio::test]
async fn capacity_eviction_removes_least_recently_seen() {
    let provider = Arc::new(MockProvider::default());
    let store = store_with(
        provider,
        StoreLimits {
            max_tracked_users: 3,
            ..StoreLimits::default()
        },
    );

    store.append("a", TurnRole::User, "1", 10).await;
    store.append("b", TurnRole::User, "1", 20).await;
    store.append("c", TurnRole::User, "1", 30).await;
    store.build_context("a", 40).await;
    store.append("d", TurnRole::User, "1", 50).await;

    assert_eq!(store.len(), 3);
    assert!(store.contains("a"));
    assert!(!store.contains("b"));
    assert!(store.contains("c"));
    assert!(store.contains("d"));
}

#[tokio::test]
async fn concurrent_messages_from_one_user_stay_paired() {
    let provider = Arc::new(MockProvider::default());
    let store = Arc::new(default_store(provider.clone()));
    let outbox = Arc::new(Outbox::default());
    let orch = Arc::new(Orchestrator::new(
        Arc::new(RateLimiter::new(RateLimits {
            per_minute: 100,
            per_hour: 100,
            max_tracked_users: 500,
        })),
        store.clone(),
        provider.clone(),
        outbox.clone(),
        ReplyTexts::default(),
    ));

    let mut handles = Vec::new();
    for i in 0..20 {
        for user in ["alice", "bob"] {
            let orch = Arc::clone(&orch);
            handles.push(tokio::spawn(async move {
                orch.on_message(user, &format!("{user} says {i}"), i).await
            }));
        }
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap(), MessageOutcome::Replied);
    }

    for user in ["alice", "bob"] {
        let record = store.snapshot(user).await.unwrap();
        assert_eq!(record.len(), 40);
        for pair in record.messages().chunks(2) {
            assert_eq!(pair[0].role, TurnRole::User);
            assert!(pair[0].content.starts_with(user));
            assert_eq!(pair[1].role, TurnRole::Assistant);
        }
    }
    assert_eq!(outbox.sent.lock().unwrap().len(), 40);
}

#[tokio::test]
async fn rate_limit_scenario_through_orchestrator() {
    let provider = Arc::new(MockProvider::default());
    let outbox = Arc::new(Outbox::default());
    let orch = Orchestrator::new(
        Arc::new(RateLimiter::new(RateLimits {
            per_minute: 2,
            per_hour: 60,
            max_tracked_users: 500,
        })),
        Arc::new(default_store(provider.clone())),
        provider,
        outbox.clone(),
        ReplyTexts::default(),
    );

    assert_eq!(orch.on_message("u", "a", 1_000).await, MessageOutcome::Replied);
    assert_eq!(orch.on_message("u", "b", 1_300).await, MessageOutcome::Replied);
    assert_eq!(
        orch.on_message("u", "c", 1_600).await,
        MessageOutcome::Throttled(RateScope::Minute)
    );
    assert_eq!(orch.store().snapshot("u").await.unwrap().len(), 4);
}

#[tokio::test]
async fn idle_user_is_swept_and_starts_fresh() {
    let provider = Arc::new(MockProvider::default());
    let limiter = Arc::new(RateLimiter::new(RateLimits::default()));
    let store = Arc::new(default_store(provider.clone()));
    let orch = Orchestrator::new(
        limiter.clone(),
        store.clone(),
        provider,
        Arc::new(Outbox::default()),
        ReplyTexts::default(),
    );

    orch.on_message("u", "hello", 0).await;
    assert_eq!(limiter.remaining("u", 1), (5, 59));

    let sweeper = Sweeper::new(
        limiter.clone(),
        store.clone(),
        Duration::from_secs(24 * 3600),
        Duration::from_secs(1800),
    );
    let report = sweeper.sweep(25 * HOUR_MS);
    assert_eq!(report.conversations, 1);
    assert_eq!(report.rate_records, 1);

    assert_eq!(limiter.remaining("u", 25 * HOUR_MS), (6, 60));
    orch.on_message("u", "hi again", 25 * HOUR_MS).await;
    let record = store.snapshot("u").await.unwrap();
    assert_eq!(record.len(), 2);
    assert_eq!(record.messages()[0].content, "hi again");
    assert_eq!(record.summary(), "");
}

#[test]
fn rejected_retry_yields_same_decision() {
    let limiter = RateLimiter::new(RateLimits {
        per_minute: 2,
        per_hour: 60,
        max_tracked_users: 500,
    });
    limiter.check_and_record("u", 0);
    limiter.check_and_record("u", 1);

    let first = limiter.check_and_record("u", 2);
    let retry = limiter.check_and_record("u", 3);
    assert_eq!(first, retry);
    assert_eq!(limiter.remaining("u", 4), (0, 58));
}

#[test]
fn session_guard_works_outside_async_tests() {
    let provider = Arc::new(MockProvider::default());
    let store = default_store(provider);

    let context = tokio_test::block_on(async {
        let mut session = store.session("u", 0).await;
        session.append(TurnRole::User, "ping");
        session.append(TurnRole::Assistant, "pong");
        session.build_context().await
    });

    assert_eq!(context.len(), 3);
    assert_eq!(context[2].content, "pong");
}
