use std::sync::Arc;

/// Inbound audio is 16-bit PCM.
pub const BYTES_PER_SAMPLE: usize = 2;

/// Sample rate and analysis frame length of a session's audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub frame_duration_ms: u32,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            frame_duration_ms: 30,
        }
    }
}

impl AudioFormat {
    pub fn new(sample_rate: u32, frame_duration_ms: u32) -> Self {
        Self {
            sample_rate,
            frame_duration_ms,
        }
    }

    pub fn samples_per_frame(&self) -> usize {
        self.sample_rate as usize * self.frame_duration_ms as usize / 1000
    }

    /// Size of one analysis frame in bytes (never zero).
    pub fn frame_bytes(&self) -> usize {
        (self.samples_per_frame() * BYTES_PER_SAMPLE).max(BYTES_PER_SAMPLE)
    }

    /// Playback duration of `bytes` worth of PCM.
    pub fn duration_ms(&self, bytes: usize) -> u64 {
        let bytes_per_second = self.sample_rate as u64 * BYTES_PER_SAMPLE as u64;
        if bytes_per_second == 0 {
            return 0;
        }
        bytes as u64 * 1000 / bytes_per_second
    }
}

/// One fixed-length block of PCM bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    bytes: Arc<[u8]>,
}

impl AudioFrame {
    pub fn new(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Little-endian i16 samples; a trailing odd byte is ignored.
    pub fn samples(&self) -> impl Iterator<Item = i16> + '_ {
        self.bytes
            .chunks_exact(BYTES_PER_SAMPLE)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
    }
}

/// Re-frames arbitrarily sized inbound chunks into [`AudioFrame`]s.
///
/// At most one partial frame is held between calls; bytes are never dropped
/// or duplicated, so concatenating every emitted frame plus
/// [`FrameBuffer::pending_len`] trailing bytes reproduces the input exactly.
#[derive(Debug)]
pub struct FrameBuffer {
    frame_bytes: usize,
    pending: Vec<u8>,
}

impl FrameBuffer {
    pub fn new(format: AudioFormat) -> Self {
        Self::with_frame_bytes(format.frame_bytes())
    }

    pub fn with_frame_bytes(frame_bytes: usize) -> Self {
        let frame_bytes = frame_bytes.max(1);
        Self {
            frame_bytes,
            pending: Vec::with_capacity(frame_bytes),
        }
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<AudioFrame> {
        let mut frames = Vec::new();
        let mut input = bytes;

        if !self.pending.is_empty() {
            let missing = self.frame_bytes - self.pending.len();
            if input.len() < missing {
                self.pending.extend_from_slice(input);
                return frames;
            }
            self.pending.extend_from_slice(&input[..missing]);
            frames.push(AudioFrame::new(std::mem::take(&mut self.pending)));
            input = &input[missing..];
        }

        let mut chunks = input.chunks_exact(self.frame_bytes);
        for chunk in &mut chunks {
            frames.push(AudioFrame::new(chunk.to_vec()));
        }
        self.pending.extend_from_slice(chunks.remainder());

        frames
    }

    pub fn frame_bytes(&self) -> usize {
        self.frame_bytes
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numbered(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_frame_bytes_for_default_format() {
        let format = AudioFormat::default();
        assert_eq!(format.samples_per_frame(), 480);
        assert_eq!(format.frame_bytes(), 960);
        assert_eq!(format.duration_ms(32_000), 1000);
    }

    #[test]
    fn test_push_reassembles_unaligned_chunks() {
        let input = numbered(10_000);
        let sizes = [1usize, 7, 960, 3, 1500, 959, 2, 961, 0, 4000, 13];

        let mut buffer = FrameBuffer::with_frame_bytes(960);
        let mut output = Vec::new();
        let mut offset = 0;
        for size in sizes.iter().cycle() {
            if offset >= input.len() {
                break;
            }
            let end = (offset + size).min(input.len());
            for frame in buffer.push(&input[offset..end]) {
                assert_eq!(frame.len(), 960);
                output.extend_from_slice(frame.as_bytes());
            }
            assert!(buffer.pending_len() < 960);
            offset = end;
        }

        assert_eq!(output.len() + buffer.pending_len(), input.len());
        assert_eq!(&input[..output.len()], output.as_slice());
    }

    #[test]
    fn test_push_exact_multiple_leaves_no_remainder() {
        let mut buffer = FrameBuffer::with_frame_bytes(4);
        let frames = buffer.push(&numbered(12));
        assert_eq!(frames.len(), 3);
        assert_eq!(buffer.pending_len(), 0);
    }

    #[test]
    fn test_small_chunks_accumulate_into_one_frame() {
        let mut buffer = FrameBuffer::with_frame_bytes(4);
        assert!(buffer.push(&[1]).is_empty());
        assert!(buffer.push(&[2, 3]).is_empty());
        let frames = buffer.push(&[4, 5]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].as_bytes(), &[1, 2, 3, 4]);
        assert_eq!(buffer.pending_len(), 1);

        buffer.clear();
        assert_eq!(buffer.pending_len(), 0);
    }

    #[test]
    fn test_samples_are_little_endian() {
        let frame = AudioFrame::new(vec![0x01, 0x00, 0xff, 0xff]);
        let samples: Vec<i16> = frame.samples().collect();
        assert_eq!(samples, vec![1, -1]);
    }
}
