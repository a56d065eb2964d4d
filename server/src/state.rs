use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use anyhow::Context;
use audio_core::{AudioFormat, EnergyClassifier, SegmenterConfig, VoiceClassifier, WhisperApiTranscriber};
use llm_core::{OpenAiClient, OpenAiConfig, ResponseStream};
use tracing::info;
use tts_core::{
    ArtifactStore, ChunkerConfig, HttpSpeechSynthesizer, HttpSynthConfig, RetentionPolicy,
    SpeechChunker, Synthesizer,
};

use crate::config::{ServerConfig, TtsBackend};
use crate::metrics::{MeteredSynthesizer, VoiceMetrics};
use crate::registry::SessionRegistry;
use crate::session::{ClassifierFactory, SessionServices};

pub const ARTIFACT_URL_PREFIX: &str = "/api/artifact";

#[derive(Clone)]
pub struct AppState {
    pub services: SessionServices,
    pub registry: Arc<SessionRegistry>,
    pub request_count: Arc<AtomicU64>,
    pub config: ServerConfig,
}

impl AppState {
    pub fn new(config: ServerConfig, services: SessionServices) -> Self {
        Self {
            services,
            registry: Arc::new(SessionRegistry::new()),
            request_count: Arc::new(AtomicU64::new(0)),
            config,
        }
    }

    /// Build every collaborator from configuration.
    pub async fn from_config(config: &ServerConfig) -> anyhow::Result<Self> {
        let retention = RetentionPolicy {
            max_age: config.audio_max_age(),
            sweep_interval: config.audio_cleanup_interval(),
        };
        let store = Arc::new(ArtifactStore::open(&config.audio_dir, retention).await?);
        info!("Artifacts stored in {}", store.dir().display());

        let metrics = Arc::new(VoiceMetrics::new());

        let llm = OpenAiClient::new(OpenAiConfig {
            base_url: config.llm_base_url.clone(),
            api_key: config.llm_api_key.clone(),
            model: config.llm_model.clone(),
            max_tokens: config.llm_max_tokens,
            temperature: config.llm_temperature,
            request_timeout: config.llm_timeout(),
        })?;
        let responder = ResponseStream::new(Arc::new(llm)).with_timeout(config.llm_timeout());

        let format = AudioFormat {
            sample_rate: config.sample_rate,
            frame_duration_ms: config.frame_duration_ms,
        };
        let mut transcriber = WhisperApiTranscriber::new(
            config.stt_base_url.clone(),
            config.stt_api_key.clone(),
            config.stt_model.clone(),
            format,
        )?;
        if !config.stt_language.trim().is_empty() {
            transcriber = transcriber.with_language(config.stt_language.clone());
        }

        let synthesizer: Arc<dyn Synthesizer> = Arc::new(MeteredSynthesizer::new(
            build_synthesizer(config)?,
            metrics.clone(),
        ));
        let chunker = SpeechChunker::new(
            ChunkerConfig {
                soft_length: config.chunk_soft_length,
                ..ChunkerConfig::default()
            },
            synthesizer,
            store.clone(),
        );

        let threshold = config.vad_energy_threshold;
        let classifier: ClassifierFactory =
            Arc::new(move || Box::new(EnergyClassifier::new(threshold)) as Box<dyn VoiceClassifier>);

        let services = SessionServices {
            segmenter: SegmenterConfig {
                format,
                padding_duration_ms: config.vad_padding_ms,
                ratio: config.vad_ratio,
                min_segment_ms: config.min_segment_ms,
            },
            classifier,
            transcriber: Arc::new(transcriber),
            responder,
            chunker,
            store,
            metrics,
            history_cap: config.history_cap,
            system_prompt: config.system_prompt.clone(),
            artifact_url_prefix: ARTIFACT_URL_PREFIX.to_string(),
        };

        Ok(Self::new(config.clone(), services))
    }
}

fn build_synthesizer(config: &ServerConfig) -> anyhow::Result<Arc<dyn Synthesizer>> {
    match config.tts_backend {
        TtsBackend::Http => {
            let encoding = config.tts_format.parse()?;
            let synth = HttpSpeechSynthesizer::new(HttpSynthConfig {
                base_url: config.tts_base_url.clone(),
                api_key: config.tts_api_key.clone(),
                model: config.tts_model.clone(),
                voice: config.tts_voice.clone(),
                encoding,
                ..HttpSynthConfig::default()
            })?;
            info!("Using HTTP speech synthesis ({})", config.tts_model);
            Ok(Arc::new(synth))
        }
        TtsBackend::Piper => build_piper(config),
    }
}

#[cfg(feature = "piper")]
fn build_piper(config: &ServerConfig) -> anyhow::Result<Arc<dyn Synthesizer>> {
    let path = config
        .piper_config
        .as_ref()
        .context("TTS_BACKEND=piper requires PIPER_CONFIG")?;
    let synth = tts_core::PiperSynthesizer::from_config_path(path)?;
    info!("Loaded Piper voice from {} ({} Hz)", path.display(), synth.sample_rate());
    Ok(Arc::new(synth))
}

#[cfg(not(feature = "piper"))]
fn build_piper(config: &ServerConfig) -> anyhow::Result<Arc<dyn Synthesizer>> {
    let _ = config.piper_config.as_ref().context("TTS_BACKEND=piper requires PIPER_CONFIG")?;
    anyhow::bail!("TTS_BACKEND=piper but the server was built without the `piper` feature")
}
