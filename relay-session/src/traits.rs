//! Collaborator traits for the model backend and outbound delivery.
//!
//! The session core never talks HTTP itself. It drives these two seams,
//! which the channel layer implements.

use crate::types::ChatMessage;
use async_trait::async_trait;

/// Language-model completion backend.
///
/// Implementations handle authentication, request formatting and
/// response parsing for a specific API.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Provider name (e.g., "openai").
    fn name(&self) -> &str;

    /// Generate a completion.
    ///
    /// # Arguments
    /// - `system`: Optional system prompt placed before `messages`
    /// - `messages`: Ordered prompt entries
    ///
    /// # Errors
    /// Must fail rather than return empty or malformed text.
    async fn complete(
        &self,
        system: Option<&str>,
        messages: &[ChatMessage],
    ) -> anyhow::Result<String>;
}

/// Outbound delivery of a reply to a user.
#[async_trait]
pub trait MessageSender: Send + Sync {
    /// Deliver `text` to the user identified by `user_key`.
    async fn send(&self, user_key: &str, text: &str) -> anyhow::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MessageRole;

    struct EchoProvider;

    #[async_trait]
    impl Provider for EchoProvider {
        fn name(&self) -> &str {
            "echo"
        }

        async fn complete(
            &self,
            _system: Option<&str>,
            messages: &[ChatMessage],
        ) -> anyhow::Result<String> {
            messages
                .iter()
                .rev()
                .find(|m| m.role == MessageRole::User)
                .map(|m| format!("Echo: {}", m.content))
                .ok_or_else(|| anyhow::anyhow!("no user message"))
        }
    }

    #[tokio::test]
    async fn echo_provider_replies_to_last_user_message() {
        let provider = EchoProvider;
        let messages = vec![ChatMessage::system("be nice"), ChatMessage::user("Hi")];
        let reply = provider.complete(None, &messages).await.unwrap();
        assert_eq!(provider.name(), "echo");
        assert_eq!(reply, "Echo: Hi");
    }

    #[tokio::test]
    async fn echo_provider_fails_closed() {
        let provider = EchoProvider;
        assert!(provider.complete(Some("sys"), &[]).await.is_err());
    }
}
