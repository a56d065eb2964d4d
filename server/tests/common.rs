//! Common utilities for integration tests
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use audio_core::{AudioFormat, EnergyClassifier, SegmenterConfig, Transcriber, VoiceClassifier};
use futures_util::{stream, StreamExt};
use llm_core::{ChatMessage, FragmentStream, ResponseStream, TextGenerator};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tts_core::{ArtifactStore, ChunkerConfig, RetentionPolicy, SpeechChunker, Synthesizer};

use voice_server::metrics::VoiceMetrics;
use voice_server::protocol::{Inbound, ServerEvent};
use voice_server::session::{ClassifierFactory, SessionOrchestrator, SessionServices};

/// 10 ms of 16 kHz PCM.
pub const FRAME_BYTES: usize = 320;

pub fn voiced_frame() -> Vec<u8> {
    // Every sample is 4096, far above the energy threshold.
    [0x00u8, 0x10].repeat(FRAME_BYTES / 2)
}

pub fn silent_frame() -> Vec<u8> {
    vec![0u8; FRAME_BYTES]
}

/// Enough speech to trigger the segmenter followed by enough silence to
/// release it.
pub fn utterance() -> Vec<u8> {
    let mut pcm = Vec::new();
    for _ in 0..3 {
        pcm.extend(voiced_frame());
    }
    for _ in 0..3 {
        pcm.extend(silent_frame());
    }
    pcm
}

/// Returns the queued transcripts in order, then nothing.
pub struct ScriptedTranscriber {
    transcripts: Mutex<VecDeque<String>>,
}

impl ScriptedTranscriber {
    pub fn new(transcripts: &[&str]) -> Self {
        Self {
            transcripts: Mutex::new(transcripts.iter().map(|t| t.to_string()).collect()),
        }
    }
}

#[async_trait]
impl Transcriber for ScriptedTranscriber {
    async fn transcribe(&self, _pcm: &[u8]) -> Result<Option<String>> {
        Ok(self.transcripts.lock().unwrap().pop_front())
    }
}

/// Streams one queued reply per call, pausing before each fragment.
pub struct ScriptedGenerator {
    replies: Mutex<VecDeque<Vec<&'static str>>>,
    fragment_delay: Duration,
    pub prompts: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedGenerator {
    pub fn new(replies: Vec<Vec<&'static str>>, fragment_delay: Duration) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            fragment_delay,
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn prompt(&self, call: usize) -> Vec<ChatMessage> {
        self.prompts.lock().unwrap()[call].clone()
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }
}

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    async fn generate_stream(&self, messages: &[ChatMessage]) -> Result<FragmentStream> {
        self.prompts.lock().unwrap().push(messages.to_vec());
        let parts = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow!("no scripted reply"))?;
        let delay = self.fragment_delay;
        Ok(Box::pin(stream::iter(parts).then(move |part| async move {
            tokio::time::sleep(delay).await;
            Ok::<_, anyhow::Error>(part.to_string())
        })))
    }
}

/// Echoes the text back as "audio" and remembers what it spoke.
#[derive(Default)]
pub struct RecordingSynthesizer {
    pub spoken: Mutex<Vec<String>>,
}

#[async_trait]
impl Synthesizer for RecordingSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
        self.spoken.lock().unwrap().push(text.to_string());
        Ok(text.as_bytes().to_vec())
    }
}

pub struct Harness {
    pub services: SessionServices,
    pub generator: Arc<ScriptedGenerator>,
    pub synthesizer: Arc<RecordingSynthesizer>,
    pub store: Arc<ArtifactStore>,
    _dir: TempDir,
}

pub async fn harness(
    transcripts: &[&str],
    replies: Vec<Vec<&'static str>>,
    fragment_delay: Duration,
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(
        ArtifactStore::open(dir.path(), RetentionPolicy::default())
            .await
            .unwrap(),
    );
    let generator = Arc::new(ScriptedGenerator::new(replies, fragment_delay));
    let synthesizer = Arc::new(RecordingSynthesizer::default());
    let chunker = SpeechChunker::new(ChunkerConfig::default(), synthesizer.clone(), store.clone());
    let classifier: ClassifierFactory =
        Arc::new(|| Box::new(EnergyClassifier::default()) as Box<dyn VoiceClassifier>);

    let services = SessionServices {
        segmenter: SegmenterConfig {
            format: AudioFormat::new(16_000, 10),
            padding_duration_ms: 30,
            ratio: 0.9,
            min_segment_ms: 0,
        },
        classifier,
        transcriber: Arc::new(ScriptedTranscriber::new(transcripts)),
        responder: ResponseStream::new(generator.clone()),
        chunker,
        store: store.clone(),
        metrics: Arc::new(VoiceMetrics::new()),
        history_cap: 10,
        system_prompt: "你是助手".to_string(),
        artifact_url_prefix: "/api/artifact".to_string(),
    };

    Harness {
        services,
        generator,
        synthesizer,
        store,
        _dir: dir,
    }
}

/// A running session fed through channels instead of a socket.
pub struct SessionHandle {
    inbound: Option<mpsc::UnboundedSender<Inbound>>,
    events: mpsc::Receiver<ServerEvent>,
    pub shutdown: CancellationToken,
    task: JoinHandle<()>,
}

pub fn start_session(services: SessionServices, session_id: &str) -> SessionHandle {
    start_session_with_buffer(services, session_id, 64)
}

/// Like [`start_session`], with `buffer` outbound events queued before the
/// session has to wait for the test to read.
pub fn start_session_with_buffer(services: SessionServices, session_id: &str, buffer: usize) -> SessionHandle {
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::channel(buffer);
    let shutdown = CancellationToken::new();

    let inbound = stream::unfold(inbound_rx, |mut rx| async move {
        rx.recv().await.map(|message| (message, rx))
    });
    let session = SessionOrchestrator::new(session_id, services, events_tx, shutdown.clone());
    let task = tokio::spawn(session.run(inbound));

    SessionHandle {
        inbound: Some(inbound_tx),
        events: events_rx,
        shutdown,
        task,
    }
}

impl SessionHandle {
    pub fn say(&self) {
        self.send(Inbound::Audio(utterance()));
    }

    pub fn control(&self, json: &str) {
        self.send(Inbound::Text(json.to_string()));
    }

    pub fn send(&self, message: Inbound) {
        if let Some(inbound) = &self.inbound {
            inbound.send(message).unwrap();
        }
    }

    pub async fn next_event(&mut self) -> Option<ServerEvent> {
        tokio::time::timeout(Duration::from_secs(5), self.events.recv())
            .await
            .ok()
            .flatten()
    }

    pub async fn expect_event(&mut self) -> ServerEvent {
        self.next_event().await.expect("session went quiet")
    }

    /// Events up to and including the next `end_of_response`.
    pub async fn until_end_of_response(&mut self) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        loop {
            let event = self.expect_event().await;
            let done = matches!(event, ServerEvent::EndOfResponse { .. });
            events.push(event);
            if done {
                return events;
            }
        }
    }

    /// Events up to and including the next one matching `pred`.
    pub async fn until(&mut self, pred: impl Fn(&ServerEvent) -> bool) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        loop {
            let event = self.expect_event().await;
            let done = pred(&event);
            events.push(event);
            if done {
                return events;
            }
        }
    }

    /// Disconnect the client and return whatever the session still sent.
    pub async fn disconnect(mut self) -> Vec<ServerEvent> {
        self.inbound.take();
        self.drain().await
    }

    /// Wait for the session to end on its own and return its last events.
    pub async fn drain(mut self) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.next_event().await {
            events.push(event);
        }
        tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .expect("session did not stop")
            .unwrap();
        events
    }
}

pub fn is_audio(event: &ServerEvent) -> bool {
    matches!(event, ServerEvent::Audio { .. })
}
