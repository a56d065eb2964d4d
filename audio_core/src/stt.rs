use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use tracing::debug;

use crate::frame::AudioFormat;
use crate::wav::pcm16_to_wav;

/// Speech-to-text collaborator.
///
/// `Ok(None)` means the audio held nothing worth answering (too short, or
/// the recognizer returned no text).
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, pcm: &[u8]) -> Result<Option<String>>;
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    #[serde(default)]
    text: String,
}

/// Client for an OpenAI-compatible `/audio/transcriptions` endpoint.
pub struct WhisperApiTranscriber {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    language: Option<String>,
    format: AudioFormat,
    min_duration_ms: u64,
}

impl WhisperApiTranscriber {
    /// Segments shorter than this are not worth a round trip.
    pub const DEFAULT_MIN_DURATION_MS: u64 = 500;

    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        format: AudioFormat,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build transcription HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            language: None,
            format,
            min_duration_ms: Self::DEFAULT_MIN_DURATION_MS,
        })
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        let language = language.into();
        self.language = (!language.is_empty()).then_some(language);
        self
    }

    pub fn with_min_duration_ms(mut self, min_duration_ms: u64) -> Self {
        self.min_duration_ms = min_duration_ms;
        self
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/audio/transcriptions",
            self.base_url.trim_end_matches('/')
        )
    }
}

#[async_trait]
impl Transcriber for WhisperApiTranscriber {
    async fn transcribe(&self, pcm: &[u8]) -> Result<Option<String>> {
        let duration_ms = self.format.duration_ms(pcm.len());
        if duration_ms < self.min_duration_ms {
            debug!(duration_ms, "audio too short to transcribe");
            return Ok(None);
        }

        let wav = pcm16_to_wav(pcm, self.format.sample_rate)?;
        let part = Part::bytes(wav)
            .file_name("segment.wav")
            .mime_str("audio/wav")?;
        let mut form = Form::new()
            .part("file", part)
            .text("model", self.model.clone());
        if let Some(language) = &self.language {
            form = form.text("language", language.clone());
        }

        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .context("transcription request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("transcription API error ({status}): {body}");
        }

        let body: TranscriptionResponse = response
            .json()
            .await
            .context("malformed transcription response")?;
        Ok(clean_transcript(&body.text))
    }
}

fn clean_transcript(text: &str) -> Option<String> {
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}
