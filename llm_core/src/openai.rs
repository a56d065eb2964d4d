use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};

use crate::history::ChatMessage;
use crate::sse::SseDecoder;
use crate::{FragmentStream, TextGenerator};

/// Connection and sampling settings for an OpenAI-compatible chat API.
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub max_tokens: u16,
    pub temperature: f32,
    pub request_timeout: Duration,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: String::new(),
            model: "gpt-3.5-turbo".to_string(),
            max_tokens: 150,
            temperature: 0.7,
            request_timeout: Duration::from_secs(120),
        }
    }
}

/// Structure for the OpenAI Chat API request
#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    max_tokens: u16,
    temperature: f32,
    stream: bool,
}

/// Structure for the OpenAI Chat API response
#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

/// One `data:` event of a streamed completion
#[derive(Deserialize)]
struct ChatChunk {
    choices: Vec<ChunkChoice>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Delta,
}

#[derive(Default, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
}

const DONE: &str = "[DONE]";

pub struct OpenAiClient {
    config: OpenAiConfig,
    client: reqwest::Client,
}

impl OpenAiClient {
    pub fn new(config: OpenAiConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .context("failed to build chat HTTP client")?;
        Ok(Self { config, client })
    }

    pub fn config(&self) -> &OpenAiConfig {
        &self.config
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        )
    }

    async fn send(&self, messages: &[ChatMessage], stream: bool) -> Result<reqwest::Response> {
        let req_body = ChatRequest {
            model: &self.config.model,
            messages,
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
            stream,
        };

        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.config.api_key)
            .json(&req_body)
            .send()
            .await
            .context("chat completion request failed")?
            .error_for_status()?; // convert non-200 into error
        Ok(response)
    }
}

/// Text carried by one streamed event, if any.
fn parse_delta(payload: &str) -> Result<Option<String>> {
    let chunk: ChatChunk =
        serde_json::from_str(payload).context("malformed completion chunk")?;
    Ok(chunk
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta.content)
        .filter(|text| !text.is_empty()))
}

#[async_trait]
impl TextGenerator for OpenAiClient {
    async fn generate_stream(&self, messages: &[ChatMessage]) -> Result<FragmentStream> {
        let mut body = self.send(messages, true).await?.bytes_stream();

        let stream = async_stream::stream! {
            let mut decoder = SseDecoder::default();
            'read: while let Some(chunk) = body.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        yield Err(anyhow::Error::from(e).context("completion stream interrupted"));
                        break;
                    }
                };
                for payload in decoder.feed(&chunk) {
                    if payload == DONE {
                        break 'read;
                    }
                    match parse_delta(&payload) {
                        Ok(Some(text)) => {
                            yield Ok(text);
                        }
                        Ok(None) => {}
                        Err(e) => {
                            yield Err(e);
                            break 'read;
                        }
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }

    async fn generate(&self, messages: &[ChatMessage]) -> Result<String> {
        let response = self
            .send(messages, false)
            .await?
            .json::<ChatResponse>()
            .await
            .context("malformed chat completion response")?;

        let reply = response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .unwrap_or_default();
        Ok(reply)
    }
}
