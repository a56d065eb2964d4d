use std::collections::VecDeque;

use tracing::debug;

use crate::classifier::VoiceClassifier;
use crate::frame::{AudioFormat, AudioFrame};

/// Segmenter tuning.
#[derive(Debug, Clone)]
pub struct SegmenterConfig {
    pub format: AudioFormat,
    /// Length of the smoothing window, in milliseconds.
    pub padding_duration_ms: u32,
    /// Fraction of the window that must agree before the state flips.
    pub ratio: f32,
    /// Finalized segments shorter than this are discarded.
    pub min_segment_ms: u32,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            format: AudioFormat::default(),
            padding_duration_ms: 300,
            ratio: 0.9,
            min_segment_ms: 0,
        }
    }
}

impl SegmenterConfig {
    /// Number of frames held in the smoothing window.
    pub fn window_frames(&self) -> usize {
        let frame_ms = self.format.frame_duration_ms.max(1);
        ((self.padding_duration_ms / frame_ms) as usize).max(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmenterState {
    Idle,
    Triggered,
}

/// One utterance: the buffered lead-in frames plus everything up to the
/// frame that released the trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeechSegment {
    pub bytes: Vec<u8>,
    pub frames: usize,
}

impl SpeechSegment {
    pub fn duration_ms(&self, format: &AudioFormat) -> u64 {
        format.duration_ms(self.bytes.len())
    }
}

/// Ring-buffer voice activity segmenter.
///
/// While idle, the last `window_frames` classifications are kept; once more
/// than `ratio` of them are voiced the segmenter triggers and the buffered
/// frames open the segment. While triggered every frame is appended, and once
/// more than `ratio` of the window is unvoiced the segment is finalized.
pub struct SpeechSegmenter {
    config: SegmenterConfig,
    classifier: Box<dyn VoiceClassifier>,
    capacity: usize,
    ring: VecDeque<(AudioFrame, bool)>,
    state: SegmenterState,
    segment: Vec<u8>,
    segment_frames: usize,
}

impl SpeechSegmenter {
    pub fn new(config: SegmenterConfig, classifier: Box<dyn VoiceClassifier>) -> Self {
        let capacity = config.window_frames();
        Self {
            config,
            classifier,
            capacity,
            ring: VecDeque::with_capacity(capacity),
            state: SegmenterState::Idle,
            segment: Vec::new(),
            segment_frames: 0,
        }
    }

    pub fn state(&self) -> SegmenterState {
        self.state
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn process(&mut self, frame: AudioFrame) -> Option<SpeechSegment> {
        let voiced = match self.classifier.is_voiced(&frame) {
            Ok(voiced) => voiced,
            Err(e) => {
                debug!(error = %e, "voice classifier failed, treating frame as silence");
                false
            }
        };
        let threshold = self.config.ratio * self.capacity as f32;

        if self.ring.len() == self.capacity {
            self.ring.pop_front();
        }

        match self.state {
            SegmenterState::Idle => {
                self.ring.push_back((frame, voiced));
                let voiced_count = self.ring.iter().filter(|(_, v)| *v).count();
                if voiced_count as f32 > threshold {
                    self.state = SegmenterState::Triggered;
                    for (buffered, _) in self.ring.drain(..) {
                        self.segment.extend_from_slice(buffered.as_bytes());
                        self.segment_frames += 1;
                    }
                    debug!(frames = self.segment_frames, "speech triggered");
                }
                None
            }
            SegmenterState::Triggered => {
                self.segment.extend_from_slice(frame.as_bytes());
                self.segment_frames += 1;
                self.ring.push_back((frame, voiced));
                let unvoiced_count = self.ring.iter().filter(|(_, v)| !*v).count();
                if unvoiced_count as f32 > threshold {
                    self.state = SegmenterState::Idle;
                    self.ring.clear();
                    return self.finalize();
                }
                None
            }
        }
    }

    /// Drops any partial segment and returns to idle.
    pub fn reset(&mut self) {
        self.ring.clear();
        self.segment.clear();
        self.segment_frames = 0;
        self.state = SegmenterState::Idle;
    }

    fn finalize(&mut self) -> Option<SpeechSegment> {
        let segment = SpeechSegment {
            bytes: std::mem::take(&mut self.segment),
            frames: std::mem::take(&mut self.segment_frames),
        };
        let duration_ms = segment.duration_ms(&self.config.format);
        if duration_ms < self.config.min_segment_ms as u64 {
            debug!(duration_ms, "discarding segment shorter than the minimum");
            return None;
        }
        debug!(duration_ms, frames = segment.frames, "speech segment finalized");
        Some(segment)
    }
}
