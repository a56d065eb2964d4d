use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::Serialize;

use crate::Synthesizer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioEncoding {
    Wav,
    Mp3,
}

impl AudioEncoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            AudioEncoding::Wav => "wav",
            AudioEncoding::Mp3 => "mp3",
        }
    }
}

impl std::str::FromStr for AudioEncoding {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "wav" => Ok(AudioEncoding::Wav),
            "mp3" => Ok(AudioEncoding::Mp3),
            other => anyhow::bail!("unsupported audio encoding: {other}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpSynthConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub voice: String,
    pub encoding: AudioEncoding,
    pub timeout: Duration,
}

impl Default for HttpSynthConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: String::new(),
            model: "tts-1".to_string(),
            voice: "alloy".to_string(),
            encoding: AudioEncoding::Wav,
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Serialize)]
struct SpeechRequest<'a> {
    model: &'a str,
    input: &'a str,
    voice: &'a str,
    response_format: &'a str,
}

/// Client for an OpenAI-compatible `/audio/speech` endpoint.
pub struct HttpSpeechSynthesizer {
    config: HttpSynthConfig,
    client: reqwest::Client,
}

impl HttpSpeechSynthesizer {
    pub fn new(config: HttpSynthConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("failed to build speech HTTP client")?;
        Ok(Self { config, client })
    }

    fn endpoint(&self) -> String {
        format!("{}/audio/speech", self.config.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl Synthesizer for HttpSpeechSynthesizer {
    async fn synthesize(&self, text: &str) -> anyhow::Result<Vec<u8>> {
        let body = SpeechRequest {
            model: &self.config.model,
            input: text,
            voice: &self.config.voice,
            response_format: self.config.encoding.as_str(),
        };

        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .context("speech request failed")?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            anyhow::bail!("speech API error ({status}): {detail}");
        }

        Ok(response.bytes().await?.to_vec())
    }

    fn extension(&self) -> &'static str {
        self.config.encoding.as_str()
    }
}
