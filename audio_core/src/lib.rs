//! Inbound audio handling for voice sessions.
//!
//! Clients stream raw 16-bit little-endian mono PCM in chunks of any size.
//! [`FrameBuffer`] slices those chunks into fixed analysis frames,
//! [`SpeechSegmenter`] turns the frame sequence into discrete speech segments
//! using a pluggable [`VoiceClassifier`], and a [`Transcriber`] turns each
//! finished segment into text.
mod classifier;
mod frame;
mod segmenter;
mod stt;
mod wav;

pub use classifier::{EnergyClassifier, VoiceClassifier};
pub use frame::{AudioFormat, AudioFrame, FrameBuffer, BYTES_PER_SAMPLE};
pub use segmenter::{SegmenterConfig, SegmenterState, SpeechSegment, SpeechSegmenter};
pub use stt::{Transcriber, WhisperApiTranscriber};
pub use wav::pcm16_to_wav;
