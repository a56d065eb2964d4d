//! Conversation state and streaming text generation.
use std::pin::Pin;

use anyhow::Result;
use async_trait::async_trait;
use futures::{Stream, StreamExt};

mod history;
mod openai;
mod response;
mod sse;

pub use history::{ChatMessage, History, Role};
pub use openai::{OpenAiClient, OpenAiConfig};
pub use response::{ResponseStream, APOLOGY};

/// Incremental text fragments from a generator, in generation order.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Text-generation collaborator.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Open a streaming completion for `messages`.
    async fn generate_stream(&self, messages: &[ChatMessage]) -> Result<FragmentStream>;

    /// Whole completion in one call. Defaults to draining the stream.
    async fn generate(&self, messages: &[ChatMessage]) -> Result<String> {
        let mut stream = self.generate_stream(messages).await?;
        let mut text = String::new();
        while let Some(fragment) = stream.next().await {
            text.push_str(&fragment?);
        }
        Ok(text)
    }
}
