// Configuration constants for the server

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Which speech synthesizer backs the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtsBackend {
    Http,
    Piper,
}

impl FromStr for TtsBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(TtsBackend::Http),
            "piper" => Ok(TtsBackend::Piper),
            other => Err(format!("unknown TTS backend: {other}")),
        }
    }
}

pub const DEFAULT_SYSTEM_PROMPT: &str =
    "你是一个友好的AI助手。\n请用简洁、自然的中文回答，就像日常聊天一样。\n回答要简短但有用，不要太正式。";

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub rate_limit_per_minute: u32,
    pub llm_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub cors_allowed_origins: Option<Vec<String>>,

    // Inbound audio and segmentation
    pub sample_rate: u32,
    pub frame_duration_ms: u32,
    pub vad_padding_ms: u32,
    pub vad_ratio: f32,
    pub vad_energy_threshold: f64,
    pub min_segment_ms: u32,

    // Conversation
    pub chunk_soft_length: usize,
    pub history_cap: usize,
    pub system_prompt: String,

    // Artifacts
    pub audio_dir: PathBuf,
    pub audio_max_age_secs: u64,
    pub audio_cleanup_interval_secs: u64,

    // Collaborators
    pub llm_base_url: String,
    pub llm_api_key: String,
    pub llm_model: String,
    pub llm_max_tokens: u16,
    pub llm_temperature: f32,
    pub stt_base_url: String,
    pub stt_api_key: String,
    pub stt_model: String,
    pub stt_language: String,
    pub tts_backend: TtsBackend,
    pub tts_base_url: String,
    pub tts_api_key: String,
    pub tts_model: String,
    pub tts_voice: String,
    pub tts_format: String,
    pub piper_config: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8085,
            rate_limit_per_minute: 60,
            llm_timeout_secs: 120,
            request_timeout_secs: 60,
            cors_allowed_origins: None,
            sample_rate: 16_000,
            frame_duration_ms: 30,
            vad_padding_ms: 300,
            vad_ratio: 0.9,
            vad_energy_threshold: 500.0,
            min_segment_ms: 500,
            chunk_soft_length: 20,
            history_cap: 10,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            audio_dir: PathBuf::from("audio"),
            audio_max_age_secs: 3600,
            audio_cleanup_interval_secs: 300,
            llm_base_url: "https://api.openai.com/v1".to_string(),
            llm_api_key: String::new(),
            llm_model: "gpt-3.5-turbo".to_string(),
            llm_max_tokens: 150,
            llm_temperature: 0.7,
            stt_base_url: "https://api.openai.com/v1".to_string(),
            stt_api_key: String::new(),
            stt_model: "whisper-1".to_string(),
            stt_language: "zh".to_string(),
            tts_backend: TtsBackend::Http,
            tts_base_url: "https://api.openai.com/v1".to_string(),
            tts_api_key: String::new(),
            tts_model: "tts-1".to_string(),
            tts_voice: "alloy".to_string(),
            tts_format: "wav".to_string(),
            piper_config: None,
        }
    }
}

/// Parsed environment variable, or `None` when unset or unparsable.
fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let cors_allowed_origins = std::env::var("CORS_ALLOWED_ORIGINS")
            .ok()
            .map(|origins| {
                origins
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .collect()
            });

        // Collaborator keys fall back to the shared OpenAI key.
        let openai_key = env_string("OPENAI_API_KEY").unwrap_or_default();
        let llm_api_key = env_string("LLM_API_KEY").unwrap_or_else(|| openai_key.clone());
        let stt_api_key = env_string("STT_API_KEY").unwrap_or_else(|| openai_key.clone());
        let tts_api_key = env_string("TTS_API_KEY").unwrap_or_else(|| openai_key.clone());

        Self {
            port: env_parse("PORT").unwrap_or(defaults.port),
            rate_limit_per_minute: env_parse("RATE_LIMIT_PER_MINUTE").unwrap_or(defaults.rate_limit_per_minute),
            llm_timeout_secs: env_parse("LLM_TIMEOUT_SECS").unwrap_or(defaults.llm_timeout_secs),
            request_timeout_secs: env_parse("REQUEST_TIMEOUT_SECS").unwrap_or(defaults.request_timeout_secs),
            cors_allowed_origins,
            sample_rate: env_parse("SAMPLE_RATE").unwrap_or(defaults.sample_rate),
            frame_duration_ms: env_parse("FRAME_DURATION_MS").unwrap_or(defaults.frame_duration_ms),
            vad_padding_ms: env_parse("VAD_PADDING_MS").unwrap_or(defaults.vad_padding_ms),
            vad_ratio: env_parse("VAD_RATIO").unwrap_or(defaults.vad_ratio),
            vad_energy_threshold: env_parse("VAD_ENERGY_THRESHOLD").unwrap_or(defaults.vad_energy_threshold),
            min_segment_ms: env_parse("MIN_SEGMENT_MS").unwrap_or(defaults.min_segment_ms),
            chunk_soft_length: env_parse("CHUNK_SOFT_LENGTH").unwrap_or(defaults.chunk_soft_length),
            history_cap: env_parse("HISTORY_CAP").unwrap_or(defaults.history_cap),
            system_prompt: env_string("SYSTEM_PROMPT").unwrap_or(defaults.system_prompt),
            audio_dir: env_string("AUDIO_DIR").map(PathBuf::from).unwrap_or(defaults.audio_dir),
            audio_max_age_secs: env_parse("AUDIO_MAX_AGE_SECS").unwrap_or(defaults.audio_max_age_secs),
            audio_cleanup_interval_secs: env_parse("AUDIO_CLEANUP_INTERVAL_SECS")
                .unwrap_or(defaults.audio_cleanup_interval_secs),
            llm_base_url: env_string("LLM_BASE_URL").unwrap_or(defaults.llm_base_url),
            llm_api_key,
            llm_model: env_string("LLM_MODEL").unwrap_or(defaults.llm_model),
            llm_max_tokens: env_parse("LLM_MAX_TOKENS").unwrap_or(defaults.llm_max_tokens),
            llm_temperature: env_parse("LLM_TEMPERATURE").unwrap_or(defaults.llm_temperature),
            stt_base_url: env_string("STT_BASE_URL").unwrap_or(defaults.stt_base_url),
            stt_api_key,
            stt_model: env_string("STT_MODEL").unwrap_or(defaults.stt_model),
            stt_language: std::env::var("STT_LANGUAGE").unwrap_or(defaults.stt_language),
            tts_backend: env_parse("TTS_BACKEND").unwrap_or(defaults.tts_backend),
            tts_base_url: env_string("TTS_BASE_URL").unwrap_or(defaults.tts_base_url),
            tts_api_key,
            tts_model: env_string("TTS_MODEL").unwrap_or(defaults.tts_model),
            tts_voice: env_string("TTS_VOICE").unwrap_or(defaults.tts_voice),
            tts_format: env_string("TTS_FORMAT").unwrap_or(defaults.tts_format),
            piper_config: env_string("PIPER_CONFIG").map(PathBuf::from),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn llm_timeout(&self) -> Duration {
        Duration::from_secs(self.llm_timeout_secs)
    }

    pub fn audio_max_age(&self) -> Duration {
        Duration::from_secs(self.audio_max_age_secs)
    }

    pub fn audio_cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.audio_cleanup_interval_secs)
    }
}
