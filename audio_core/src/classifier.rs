use anyhow::{bail, Result};

use crate::frame::{AudioFrame, BYTES_PER_SAMPLE};

/// Decides whether a single frame contains speech.
///
/// Implementations may keep state between frames, hence `&mut self`. Each
/// session owns its own classifier.
pub trait VoiceClassifier: Send {
    fn is_voiced(&mut self, frame: &AudioFrame) -> Result<bool>;
}

impl<F> VoiceClassifier for F
where
    F: FnMut(&AudioFrame) -> Result<bool> + Send,
{
    fn is_voiced(&mut self, frame: &AudioFrame) -> Result<bool> {
        self(frame)
    }
}

/// Root-mean-square energy gate over the frame's i16 samples.
#[derive(Debug, Clone, Copy)]
pub struct EnergyClassifier {
    threshold: f64,
}

impl EnergyClassifier {
    pub const DEFAULT_THRESHOLD: f64 = 500.0;

    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn rms(frame: &AudioFrame) -> Result<f64> {
        if frame.len() % BYTES_PER_SAMPLE != 0 {
            bail!("frame of {} bytes is not whole 16-bit samples", frame.len());
        }
        if frame.is_empty() {
            return Ok(0.0);
        }
        let (sum, count) = frame.samples().fold((0f64, 0usize), |(sum, count), s| {
            let s = s as f64;
            (sum + s * s, count + 1)
        });
        Ok((sum / count as f64).sqrt())
    }
}

impl Default for EnergyClassifier {
    fn default() -> Self {
        Self::new(Self::DEFAULT_THRESHOLD)
    }
}

impl VoiceClassifier for EnergyClassifier {
    fn is_voiced(&mut self, frame: &AudioFrame) -> Result<bool> {
        Ok(Self::rms(frame)? > self.threshold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(amplitude: i16, samples: usize) -> AudioFrame {
        let bytes: Vec<u8> = (0..samples)
            .flat_map(|i| {
                let s = if i % 2 == 0 { amplitude } else { -amplitude };
                s.to_le_bytes()
            })
            .collect();
        AudioFrame::new(bytes)
    }

    #[test]
    fn test_rms_of_square_wave() {
        let rms = EnergyClassifier::rms(&tone(1000, 480)).unwrap();
        assert!((rms - 1000.0).abs() < 1e-6);
    }

    #[test]
    fn test_threshold_decides_voicing() {
        let mut classifier = EnergyClassifier::default();
        assert!(classifier.is_voiced(&tone(2000, 480)).unwrap());
        assert!(!classifier.is_voiced(&tone(100, 480)).unwrap());
        assert!(!classifier.is_voiced(&tone(0, 480)).unwrap());
    }

    #[test]
    fn test_odd_length_frame_is_an_error() {
        let mut classifier = EnergyClassifier::default();
        let frame = AudioFrame::new(vec![0u8; 7]);
        assert!(classifier.is_voiced(&frame).is_err());
    }

    #[test]
    fn test_closures_are_classifiers() {
        let mut classifier =
            |frame: &AudioFrame| -> Result<bool> { Ok(frame.as_bytes().first() == Some(&1)) };
        assert!(classifier.is_voiced(&AudioFrame::new(vec![1, 0])).unwrap());
        assert!(!classifier.is_voiced(&AudioFrame::new(vec![0, 0])).unwrap());
    }
}
