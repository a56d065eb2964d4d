use std::fs;
use std::path::Path;
use std::sync::{Arc, RwLock};

use anyhow::Context;
use async_trait::async_trait;
use piper_rs::synth::{PiperSpeechStreamParallel, PiperSpeechSynthesizer};
use tracing::info;

use crate::wav::encode_wav;
use crate::Synthesizer;

/// Local Piper voice loaded from a model config JSON.
pub struct PiperSynthesizer {
    synth: Arc<RwLock<PiperSpeechSynthesizer>>,
    sample_rate: u32,
}

impl PiperSynthesizer {
    pub fn from_config_path<P: AsRef<Path>>(cfg_path: P) -> anyhow::Result<Self> {
        let sample_rate = read_sample_rate(&cfg_path)?;
        let model = piper_rs::from_config_path(cfg_path.as_ref())
            .map_err(|e| anyhow::anyhow!("piper load error: {e}"))?;
        let synth = PiperSpeechSynthesizer::new(model)?;
        info!(config = %cfg_path.as_ref().display(), sample_rate, "piper voice loaded");
        Ok(Self {
            synth: Arc::new(RwLock::new(synth)),
            sample_rate,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

/// Read sample rate from model config JSON
fn read_sample_rate<P: AsRef<Path>>(cfg_path: P) -> anyhow::Result<u32> {
    let text = fs::read_to_string(cfg_path.as_ref())
        .with_context(|| format!("Failed to read config file: {}", cfg_path.as_ref().display()))?;
    let json: serde_json::Value =
        serde_json::from_str(&text).with_context(|| "Config file is not valid JSON")?;

    let sample_rate = json
        .get("audio")
        .and_then(|a| a.get("sample_rate"))
        .and_then(|sr| sr.as_u64())
        .ok_or_else(|| anyhow::anyhow!("Missing or invalid 'audio.sample_rate' in config"))?;

    Ok(sample_rate as u32)
}

#[async_trait]
impl Synthesizer for PiperSynthesizer {
    async fn synthesize(&self, text: &str) -> anyhow::Result<Vec<u8>> {
        let synth = Arc::clone(&self.synth);
        let text = text.to_string();
        let sample_rate = self.sample_rate;

        tokio::task::spawn_blocking(move || {
            let synth = synth
                .read()
                .map_err(|_| anyhow::anyhow!("Synthesizer lock poisoned"))?;
            let iter: PiperSpeechStreamParallel = synth
                .synthesize_parallel(text, None)
                .map_err(|e| anyhow::anyhow!("piper synth error: {e}"))?;

            let mut samples: Vec<f32> = Vec::new();
            for part in iter {
                samples.extend(
                    part.map_err(|e| anyhow::anyhow!("chunk error: {e}"))?
                        .into_vec(),
                );
            }
            encode_wav(&samples, sample_rate)
        })
        .await
        .map_err(|e| anyhow::anyhow!("synthesis task failed: {e}"))?
    }
}
