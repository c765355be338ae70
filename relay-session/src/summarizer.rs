//! Incremental conversation summarization using the model backend.

use crate::traits::Provider;
use crate::types::{ChatMessage, Turn};
use std::sync::Arc;

/// Instructions given to the model when folding turns into the summary.
pub const SUMMARY_SYSTEM_PROMPT: &str = "You maintain a running summary of a chat between a user \
and an assistant. Merge the new conversation turns into the existing summary. Preserve names, \
decisions, stated preferences and open questions. Drop greetings and small talk. Write in the \
third person, keep it compact, and reply with the updated summary text only.";

/// Folds aged-out turns into a standing summary.
pub struct Summarizer {
    provider: Arc<dyn Provider>,
}

impl Summarizer {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self { provider }
    }

    /// Merge `new_turns` into `existing`.
    ///
    /// Never fails: if the model call errors or returns nothing usable, the
    /// existing summary comes back unchanged and the batch is not retried.
    pub async fn compact(&self, existing: &str, new_turns: &[Turn]) -> String {
        if new_turns.is_empty() {
            return existing.to_string();
        }

        let prompt = Self::build_prompt(existing, new_turns);
        let messages = [ChatMessage::user(prompt)];

        match self
            .provider
            .complete(Some(SUMMARY_SYSTEM_PROMPT), &messages)
            .await
        {
            Ok(text) if !text.trim().is_empty() => {
                tracing::debug!(
                    provider = self.provider.name(),
                    folded = new_turns.len(),
                    "Summary updated"
                );
                text.trim().to_string()
            }
            Ok(_) => {
                tracing::warn!(
                    provider = self.provider.name(),
                    dropped = new_turns.len(),
                    "Summarizer returned empty text, keeping previous summary"
                );
                existing.to_string()
            }
            Err(e) => {
                tracing::warn!(
                    provider = self.provider.name(),
                    dropped = new_turns.len(),
                    error = %e,
                    "Summarization failed, keeping previous summary"
                );
                existing.to_string()
            }
        }
    }

    fn build_prompt(existing: &str, new_turns: &[Turn]) -> String {
        let existing = if existing.trim().is_empty() {
            "(none yet)"
        } else {
            existing
        };
        format!(
            "Existing summary:\n{existing}\n\nNew conversation turns:\n{}",
            format_turns(new_turns)
        )
    }
}

/// Render turns as a compact role-tagged block.
pub fn format_turns(turns: &[Turn]) -> String {
    turns
        .iter()
        .map(|turn| format!("{}: {}", turn.role.label(), turn.content))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Records every prompt and answers with a canned response.
    struct ScriptedProvider {
        response: anyhow::Result<String>,
        calls: AtomicUsize,
        last_prompt: Mutex<Option<(Option<String>, String)>>,
    }

    impl ScriptedProvider {
        fn ok(text: &str) -> Self {
            Self::with(Ok(text.to_string()))
        }

        fn failing() -> Self {
            Self::with(Err(anyhow::anyhow!("backend unavailable")))
        }

        fn with(response: anyhow::Result<String>) -> Self {
            Self {
                response,
                calls: AtomicUsize::new(0),
                last_prompt: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl Provider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn complete(
            &self,
            system: Option<&str>,
            messages: &[ChatMessage],
        ) -> anyhow::Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_prompt.lock().unwrap() =
                Some((system.map(String::from), messages[0].content.clone()));
            match &self.response {
                Ok(text) => Ok(text.clone()),
                Err(e) => Err(anyhow::anyhow!("{e}")),
            }
        }
    }

    #[tokio::test]
    async fn test_empty_batch_skips_model() {
        let provider = Arc::new(ScriptedProvider::ok("unused"));
        let summarizer = Summarizer::new(provider.clone());

        let summary = summarizer.compact("Prefers Rust.", &[]).await;

        assert_eq!(summary, "Prefers Rust.");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_merges_turns_into_summary() {
        let provider = Arc::new(ScriptedProvider::ok("  Ana prefers Rust and asked about lifetimes.\n"));
        let summarizer = Summarizer::new(provider.clone());
        let turns = vec![
            Turn::user("I'm Ana, I like Rust"),
            Turn::assistant("Nice to meet you, Ana!"),
        ];

        let summary = summarizer.compact("", &turns).await;

        assert_eq!(summary, "Ana prefers Rust and asked about lifetimes.");
        let (system, prompt) = provider.last_prompt.lock().unwrap().clone().unwrap();
        assert_eq!(system.as_deref(), Some(SUMMARY_SYSTEM_PROMPT));
        assert!(prompt.contains("Existing summary:\n(none yet)"));
        assert!(prompt.contains("User: I'm Ana, I like Rust\nAssistant: Nice to meet you, Ana!"));
    }

    #[tokio::test]
    async fn test_failure_keeps_existing_summary() {
        let provider = Arc::new(ScriptedProvider::failing());
        let summarizer = Summarizer::new(provider.clone());

        let summary = summarizer.compact("Old digest.", &[Turn::user("hello")]).await;

        assert_eq!(summary, "Old digest.");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_blank_answer_keeps_existing_summary() {
        let provider = Arc::new(ScriptedProvider::ok("   "));
        let summarizer = Summarizer::new(provider);

        let summary = summarizer.compact("Old digest.", &[Turn::user("hello")]).await;

        assert_eq!(summary, "Old digest.");
    }

    #[test]
    fn test_format_turns() {
        let block = format_turns(&[Turn::user("a"), Turn::assistant("b")]);
        assert_eq!(block, "User: a\nAssistant: b");
    }
}
