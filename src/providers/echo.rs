//! Loopback provider for local smoke runs and tests.

use async_trait::async_trait;

use crate::error::ProviderError;

use super::{ChatMessage, ChatRole, Completion, ProviderAdapter, ToolDescriptor};

/// Echoes the last user message back. No network, no state.
///
/// Useful for exercising the full event loop (`yoctoclaw run`) without any
/// backend configured; real deployments swap in an actual adapter.
pub struct EchoProvider;

#[async_trait]
impl ProviderAdapter for EchoProvider {
    async fn send(
        &self,
        history: Vec<ChatMessage>,
        _tools: Vec<ToolDescriptor>,
    ) -> Result<Completion, ProviderError> {
        let last_user = history
            .iter()
            .rev()
            .find(|m| m.role == ChatRole::User)
            .map(|m| m.content.clone())
            .ok_or_else(|| {
                ProviderError::InvalidRequest("conversation has no user message".into())
            })?;

        Ok(Completion::Reply {
            text: format!("You said: {}", last_user),
        })
    }

    fn name(&self) -> &str {
        "echo"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_echo_replies_with_last_user_message() {
        let provider = EchoProvider;
        let history = vec![
            ChatMessage::user("first"),
            ChatMessage::assistant("You said: first"),
            ChatMessage::user("second"),
        ];
        match provider.send(history, vec![]).await.unwrap() {
            Completion::Reply { text } => assert_eq!(text, "You said: second"),
            _ => panic!("expected reply"),
        }
    }

    #[tokio::test]
    async fn test_echo_rejects_empty_history() {
        let provider = EchoProvider;
        let err = provider.send(vec![], vec![]).await.unwrap_err();
        assert!(matches!(err, ProviderError::InvalidRequest(_)));
    }
}
