use std::sync::Arc;

use futures::{Stream, StreamExt};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::artifact::ArtifactStore;
use crate::text::speakable_text;
use crate::Synthesizer;

/// Where reply text is cut into speakable chunks.
#[derive(Debug, Clone)]
pub struct ChunkerConfig {
    /// Chunks without sentence-ending punctuation are cut near this many
    /// characters.
    pub soft_length: usize,
    /// Sentence-ending marks; a chunk always ends right after one.
    pub strong_marks: Vec<char>,
    /// Preferred cut points when a chunk runs past `soft_length`.
    pub weak_delimiters: Vec<char>,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            soft_length: 20,
            strong_marks: "。！？.!?".chars().collect(),
            weak_delimiters: "，,、 \n".chars().collect(),
        }
    }
}

/// Accumulates text fragments and cuts them into chunks.
#[derive(Debug, Clone, Default)]
pub struct ChunkSplitter {
    config: ChunkerConfig,
    buffer: String,
}

impl ChunkSplitter {
    pub fn new(config: ChunkerConfig) -> Self {
        Self {
            config,
            buffer: String::new(),
        }
    }

    /// Append a fragment and return every chunk that is now complete.
    pub fn push(&mut self, fragment: &str) -> Vec<String> {
        self.buffer.push_str(fragment);

        let mut chunks = Vec::new();
        while let Some(at) = self.split_point() {
            let rest = self.buffer.split_off(at);
            chunks.push(std::mem::replace(&mut self.buffer, rest));
        }
        chunks
    }

    /// Whatever is left once the fragments have ended.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        (!rest.is_empty()).then_some(rest)
    }

    pub fn pending(&self) -> &str {
        &self.buffer
    }

    /// Byte offset just past the end of the next complete chunk.
    fn split_point(&self) -> Option<usize> {
        if let Some((i, c)) = self
            .buffer
            .char_indices()
            .find(|(_, c)| self.config.strong_marks.contains(c))
        {
            return Some(i + c.len_utf8());
        }

        let limit = self.config.soft_length.max(1);
        // Byte offset of the character at index `limit`; None while the
        // buffer holds no more than `limit` characters.
        let (limit_byte, _) = self.buffer.char_indices().nth(limit)?;
        let head = &self.buffer[..limit_byte];
        let cut = head
            .char_indices()
            .rev()
            .find(|(_, c)| self.config.weak_delimiters.contains(c))
            .map_or(limit_byte, |(i, c)| i + c.len_utf8());
        Some(cut)
    }
}

/// One synthesized chunk ready for playback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlaybackEvent {
    pub text: String,
    pub artifact_id: String,
    pub sequence_index: u32,
}

enum Spoken {
    Event(PlaybackEvent),
    Skipped,
    Cancelled,
}

/// Turns a stream of reply fragments into synthesized, persisted audio
/// chunks.
#[derive(Clone)]
pub struct SpeechChunker {
    config: ChunkerConfig,
    synthesizer: Arc<dyn Synthesizer>,
    store: Arc<ArtifactStore>,
}

impl SpeechChunker {
    pub fn new(config: ChunkerConfig, synthesizer: Arc<dyn Synthesizer>, store: Arc<ArtifactStore>) -> Self {
        Self {
            config,
            synthesizer,
            store,
        }
    }

    pub fn store(&self) -> &Arc<ArtifactStore> {
        &self.store
    }

    /// Playback events for `fragments`, in order.
    ///
    /// Chunks that fail to synthesize are skipped. Once `cancel` fires the
    /// stream ends without persisting anything further.
    pub fn playback<'a, S>(
        &'a self,
        session_id: &'a str,
        fragments: S,
        cancel: CancellationToken,
    ) -> impl Stream<Item = PlaybackEvent> + Send + 'a
    where
        S: Stream<Item = String> + Send + 'a,
    {
        async_stream::stream! {
            futures::pin_mut!(fragments);
            let mut splitter = ChunkSplitter::new(self.config.clone());
            let mut sequence_index = 0u32;

            'playback: loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break 'playback,
                    next = fragments.next() => next,
                };
                let (chunks, done) = match next {
                    Some(fragment) => (splitter.push(&fragment), false),
                    None => (splitter.finish().into_iter().collect(), true),
                };

                for chunk in chunks {
                    match self.speak(session_id, &chunk, sequence_index, &cancel).await {
                        Spoken::Event(event) => {
                            sequence_index += 1;
                            yield event;
                        }
                        Spoken::Skipped => {}
                        Spoken::Cancelled => break 'playback,
                    }
                }
                if done {
                    break;
                }
            }

            if cancel.is_cancelled() {
                debug!(session_id, "playback cancelled");
            }
        }
    }

    /// Synthesize `text` as a single artifact owned by `session_id`.
    ///
    /// Returns `Ok(None)` when nothing speakable is left after filtering.
    pub async fn render(&self, session_id: &str, text: &str) -> anyhow::Result<Option<String>> {
        let Some(text) = speakable_text(text) else {
            return Ok(None);
        };
        let audio = self.synthesizer.synthesize(&text).await?;
        if audio.is_empty() {
            anyhow::bail!("synthesizer returned no audio");
        }
        let artifact_id = self
            .store
            .persist(session_id, &audio, self.synthesizer.extension())
            .await?;
        Ok(Some(artifact_id))
    }

    async fn speak(&self, session_id: &str, chunk: &str, sequence_index: u32, cancel: &CancellationToken) -> Spoken {
        let Some(text) = speakable_text(chunk) else {
            debug!(chunk, "nothing speakable in chunk");
            return Spoken::Skipped;
        };

        let audio = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Spoken::Cancelled,
            audio = self.synthesizer.synthesize(&text) => audio,
        };
        let audio = match audio {
            Ok(audio) if !audio.is_empty() => audio,
            Ok(_) => {
                warn!(chunk = %text, "synthesizer returned no audio, chunk skipped");
                return Spoken::Skipped;
            }
            Err(e) => {
                error!(chunk = %text, error = %e, "speech synthesis failed, chunk skipped");
                return Spoken::Skipped;
            }
        };
        if cancel.is_cancelled() {
            return Spoken::Cancelled;
        }

        let artifact_id = match self
            .store
            .persist(session_id, &audio, self.synthesizer.extension())
            .await
        {
            Ok(id) => id,
            Err(e) => {
                error!(chunk = %text, error = %e, "failed to persist synthesized audio");
                return Spoken::Skipped;
            }
        };
        if cancel.is_cancelled() {
            self.store.delete(&artifact_id).await;
            return Spoken::Cancelled;
        }

        debug!(session_id, sequence_index, artifact_id = %artifact_id, "chunk synthesized");
        Spoken::Event(PlaybackEvent {
            text,
            artifact_id,
            sequence_index,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use futures::stream;

    use super::*;
    use crate::artifact::RetentionPolicy;

    fn split_all(fragments: &[&str]) -> Vec<String> {
        let mut splitter = ChunkSplitter::default();
        let mut chunks: Vec<String> = fragments.iter().flat_map(|f| splitter.push(f)).collect();
        chunks.extend(splitter.finish());
        chunks
    }

    #[test]
    fn test_strong_mark_ends_chunk() {
        assert_eq!(split_all(&["今天", "天气", "不错。"]), vec!["今天天气不错。"]);
        assert_eq!(
            split_all(&["你好！我是", "助手。谢谢"]),
            vec!["你好！", "我是助手。", "谢谢"]
        );
    }

    #[test]
    fn test_waits_for_more_text_below_soft_length() {
        let mut splitter = ChunkSplitter::default();
        assert!(splitter.push("一二三四五六七八九十").is_empty());
        assert_eq!(splitter.pending(), "一二三四五六七八九十");
    }

    #[test]
    fn test_long_text_cuts_at_last_weak_delimiter() {
        let mut splitter = ChunkSplitter::default();
        let chunks = splitter.push("一二三四五，六七八九十一二三四五六七八九十一");
        assert_eq!(chunks, vec!["一二三四五，"]);
        assert_eq!(splitter.pending(), "六七八九十一二三四五六七八九十一");
    }

    #[test]
    fn test_long_text_without_delimiters_is_hard_split() {
        let mut splitter = ChunkSplitter::default();
        let text: String = std::iter::repeat('字').take(45).collect();
        let chunks = splitter.push(&text);
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.chars().count() == 20));
        assert_eq!(splitter.finish().map(|r| r.chars().count()), Some(5));
    }

    #[test]
    fn test_exactly_soft_length_waits() {
        let mut splitter = ChunkSplitter::default();
        let text: String = std::iter::repeat('字').take(20).collect();
        assert!(splitter.push(&text).is_empty());
        assert_eq!(splitter.push("字").len(), 1);
    }

    #[derive(Default)]
    struct RecordingSynthesizer {
        spoken: Mutex<Vec<String>>,
        fail_on: Option<&'static str>,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl Synthesizer for RecordingSynthesizer {
        async fn synthesize(&self, text: &str) -> anyhow::Result<Vec<u8>> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail_on.is_some_and(|f| text.contains(f)) {
                anyhow::bail!("voice unavailable");
            }
            self.spoken.lock().unwrap().push(text.to_string());
            Ok(text.as_bytes().to_vec())
        }
    }

    async fn chunker(
        dir: &tempfile::TempDir,
        synthesizer: Arc<RecordingSynthesizer>,
    ) -> SpeechChunker {
        let store = ArtifactStore::open(dir.path(), RetentionPolicy::default())
            .await
            .unwrap();
        SpeechChunker::new(ChunkerConfig::default(), synthesizer, Arc::new(store))
    }

    fn fragments(parts: &[&str]) -> impl Stream<Item = String> + Send + 'static {
        stream::iter(parts.iter().map(|p| p.to_string()).collect::<Vec<_>>())
    }

    #[tokio::test]
    async fn test_playback_emits_ordered_events() {
        let dir = tempfile::tempdir().unwrap();
        let synth = Arc::new(RecordingSynthesizer::default());
        let chunker = chunker(&dir, synth.clone()).await;

        let events: Vec<PlaybackEvent> = chunker
            .playback("s1", fragments(&["你好！", "今天", "天气不错。", "再见"]), CancellationToken::new())
            .collect()
            .await;

        let texts: Vec<&str> = events.iter().map(|e| e.text.as_str()).collect();
        assert_eq!(texts, vec!["你好！", "今天天气不错。", "再见"]);
        let indices: Vec<u32> = events.iter().map(|e| e.sequence_index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        for event in &events {
            assert_eq!(
                chunker.store().read(&event.artifact_id).await.unwrap(),
                Some(event.text.as_bytes().to_vec())
            );
        }
    }

    #[tokio::test]
    async fn test_failed_and_unspeakable_chunks_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let synth = Arc::new(RecordingSynthesizer {
            fail_on: Some("坏"),
            ..Default::default()
        });
        let chunker = chunker(&dir, synth.clone()).await;

        let events: Vec<PlaybackEvent> = chunker
            .playback("s1", fragments(&["😀。", "坏句子。", "好句子。"]), CancellationToken::new())
            .collect()
            .await;

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].text, "好句子。");
        assert_eq!(events[0].sequence_index, 0);
        assert_eq!(chunker.store().session_artifact_count("s1"), 1);
    }

    #[tokio::test]
    async fn test_punctuation_only_chunks_are_not_synthesized() {
        let dir = tempfile::tempdir().unwrap();
        let synth = Arc::new(RecordingSynthesizer::default());
        let chunker = chunker(&dir, synth.clone()).await;

        let events: Vec<PlaybackEvent> = chunker
            .playback("s1", fragments(&["好的。", "！", "再见。", "）"]), CancellationToken::new())
            .collect()
            .await;

        let texts: Vec<&str> = events.iter().map(|e| e.text.as_str()).collect();
        assert_eq!(texts, vec!["好的。", "再见。"]);
        assert_eq!(events[1].sequence_index, 1);
        assert_eq!(*synth.spoken.lock().unwrap(), vec!["好的。", "再见。"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_discards_inflight_synthesis() {
        let dir = tempfile::tempdir().unwrap();
        let synth = Arc::new(RecordingSynthesizer {
            delay: Some(Duration::from_secs(1)),
            ..Default::default()
        });
        let chunker = chunker(&dir, synth.clone()).await;
        let cancel = CancellationToken::new();

        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(500)).await;
                cancel.cancel();
            })
        };
        let events: Vec<PlaybackEvent> = chunker
            .playback("s1", fragments(&["第一句。", "第二句。"]), cancel)
            .collect()
            .await;
        canceller.await.unwrap();

        assert!(events.is_empty());
        assert!(synth.spoken.lock().unwrap().is_empty());
        assert_eq!(chunker.store().session_artifact_count("s1"), 0);
    }

    #[tokio::test]
    async fn test_render_whole_text() {
        let dir = tempfile::tempdir().unwrap();
        let chunker = chunker(&dir, Arc::new(RecordingSynthesizer::default())).await;

        let id = chunker.render("api", "**你好**").await.unwrap();
        let id = id.unwrap();
        assert_eq!(chunker.store().read(&id).await.unwrap(), Some("你好".as_bytes().to_vec()));
        assert_eq!(chunker.render("api", "🎉").await.unwrap(), None);
    }
}
