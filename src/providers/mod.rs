//! Providers module - the model-backend adapter boundary
//!
//! The runtime core never talks to a model API directly. Each backend
//! implements [`ProviderAdapter`]; the dispatcher hands it the conversation
//! history and the tool catalog, and the adapter returns either a reply or
//! a tool-use request, surfacing failures as typed [`ProviderError`]s so
//! the retry policy can tell retryable from fatal.
//!
//! # Example
//!
//! ```rust,ignore
//! use yoctoclaw::providers::{ChatMessage, Completion, ProviderAdapter};
//!
//! async fn example(provider: &dyn ProviderAdapter) {
//!     let history = vec![ChatMessage::user("Hello!")];
//!     match provider.send(history, vec![]).await {
//!         Ok(Completion::Reply { text }) => println!("{}", text),
//!         Ok(Completion::ToolUse { name, .. }) => println!("wants tool {}", name),
//!         Err(e) => eprintln!("provider failed: {}", e),
//!     }
//! }
//! ```

pub mod echo;

pub use echo::EchoProvider;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;

/// The role of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
    Tool,
}

/// One message of conversation history handed to a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: &str) -> Self {
        Self {
            role: ChatRole::User,
            content: content.to_string(),
        }
    }

    pub fn assistant(content: &str) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.to_string(),
        }
    }

    pub fn tool(content: &str) -> Self {
        Self {
            role: ChatRole::Tool,
            content: content.to_string(),
        }
    }
}

/// A tool the provider may request, built from the skill registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub help: String,
}

/// A successful provider completion.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    /// Final text answer; the turn can conclude
    Reply { text: String },
    /// The model wants a tool invoked before it can answer
    ToolUse { name: String, arguments: String },
}

/// Serializable form a provider call reports back on the bus inside a
/// `ProviderResult` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderOutcome {
    Reply { text: String },
    ToolUse { name: String, arguments: String },
    Failed { error: ProviderError },
}

impl From<Result<Completion, ProviderError>> for ProviderOutcome {
    fn from(result: Result<Completion, ProviderError>) -> Self {
        match result {
            Ok(Completion::Reply { text }) => ProviderOutcome::Reply { text },
            Ok(Completion::ToolUse { name, arguments }) => {
                ProviderOutcome::ToolUse { name, arguments }
            }
            Err(error) => ProviderOutcome::Failed { error },
        }
    }
}

/// Trait every model backend implements.
///
/// Implementations must be safe to call concurrently; the dispatcher never
/// issues two concurrent calls for the same session, but different sessions
/// overlap freely.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Send the conversation and tool catalog, await a completion.
    async fn send(
        &self,
        history: Vec<ChatMessage>,
        tools: Vec<ToolDescriptor>,
    ) -> Result<Completion, ProviderError>;

    /// Provider name for logs and config.
    fn name(&self) -> &str;
}
