//! Speech output: text chunking, synthesis backends and the on-disk audio
//! artifact store.
use async_trait::async_trait;

mod artifact;
mod chunker;
mod http;
#[cfg(feature = "piper")]
mod piper;
mod text;
mod wav;

pub use artifact::{is_valid_artifact_id, ArtifactStats, ArtifactStore, RetentionPolicy, Sweeper};
pub use chunker::{ChunkSplitter, ChunkerConfig, PlaybackEvent, SpeechChunker};
pub use http::{AudioEncoding, HttpSpeechSynthesizer, HttpSynthConfig};
#[cfg(feature = "piper")]
pub use piper::PiperSynthesizer;
pub use text::{filter_speakable, is_speakable, speakable_text};
pub use wav::encode_wav;

/// Text-to-speech collaborator producing one encoded audio file per call.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(&self, text: &str) -> anyhow::Result<Vec<u8>>;

    /// File extension of the produced audio.
    fn extension(&self) -> &'static str {
        "wav"
    }
}
