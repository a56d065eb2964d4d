//! Per-connection conversation loop.
//!
//! A [`SessionOrchestrator`] owns everything about one voice session: the
//! inbound audio pipeline, the conversation history and at most one running
//! reply. Replies run as separate tasks that report back over a channel;
//! the session loop is the only writer of outbound events and drops anything
//! reported by a reply that has since been cancelled.
use std::ops::ControlFlow;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use audio_core::{
    FrameBuffer, SegmenterConfig, SegmenterState, SpeechSegment, SpeechSegmenter, Transcriber,
    VoiceClassifier,
};
use futures_util::{FutureExt, Stream, StreamExt};
use llm_core::{History, ResponseStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tts_core::{ArtifactStore, PlaybackEvent, SpeechChunker};

use crate::metrics::VoiceMetrics;
use crate::protocol::{ControlMessage, Inbound, ServerEvent};
use crate::validation::{validate_session_id, validate_system_prompt};

/// Builds a fresh voice classifier for each session.
pub type ClassifierFactory = Arc<dyn Fn() -> Box<dyn VoiceClassifier> + Send + Sync>;

/// Collaborators and settings shared by every session.
#[derive(Clone)]
pub struct SessionServices {
    pub segmenter: SegmenterConfig,
    pub classifier: ClassifierFactory,
    pub transcriber: Arc<dyn Transcriber>,
    pub responder: ResponseStream,
    pub chunker: SpeechChunker,
    pub store: Arc<ArtifactStore>,
    pub metrics: Arc<VoiceMetrics>,
    pub history_cap: usize,
    pub system_prompt: String,
    /// Public path under which artifacts are served.
    pub artifact_url_prefix: String,
}

impl SessionServices {
    pub fn artifact_url(&self, artifact_id: &str) -> String {
        format!(
            "{}/{}",
            self.artifact_url_prefix.trim_end_matches('/'),
            artifact_id
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Listening,
    Generating,
}

pub fn new_session_id() -> String {
    format!("voice_session_{}", uuid::Uuid::new_v4().simple())
}

#[derive(Debug)]
enum GenerationEventKind {
    Playback(PlaybackEvent),
    Finished { text: String },
    Failed,
}

#[derive(Debug)]
struct GenerationEvent {
    id: u64,
    kind: GenerationEventKind,
}

struct ActiveGeneration {
    id: u64,
    cancel: CancellationToken,
    handle: JoinHandle<History>,
}

/// Everything a reply task needs; the history travels separately so it
/// can be handed back through the join handle.
struct GenerationJob {
    id: u64,
    session_id: String,
    user_text: String,
    system_prompt: String,
    services: SessionServices,
    cancel: CancellationToken,
    events: mpsc::UnboundedSender<GenerationEvent>,
}

impl GenerationJob {
    async fn run(self, mut history: History) -> History {
        let outcome = AssertUnwindSafe(self.reply(&mut history)).catch_unwind().await;
        if outcome.is_err() {
            error!(session_id = %self.session_id, generation = self.id, "response task panicked");
            let _ = self.events.send(GenerationEvent {
                id: self.id,
                kind: GenerationEventKind::Failed,
            });
            history = History::new(history.cap());
        }
        history
    }

    async fn reply(&self, history: &mut History) {
        let started = Instant::now();
        {
            let fragments =
                self.services
                    .responder
                    .generate(&self.user_text, &self.system_prompt, history);
            let playback =
                self.services
                    .chunker
                    .playback(&self.session_id, fragments, self.cancel.clone());
            futures_util::pin_mut!(playback);

            while let Some(event) = playback.next().await {
                if self.cancel.is_cancelled() {
                    break;
                }
                let event = GenerationEvent {
                    id: self.id,
                    kind: GenerationEventKind::Playback(event),
                };
                if self.events.send(event).is_err() {
                    return;
                }
            }
        }

        if self.cancel.is_cancelled() {
            debug!(session_id = %self.session_id, generation = self.id, "response cancelled");
            return;
        }

        let text = history.last_reply().unwrap_or_default().to_string();
        info!(
            session_id = %self.session_id,
            generation = self.id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "response complete"
        );
        let _ = self.events.send(GenerationEvent {
            id: self.id,
            kind: GenerationEventKind::Finished { text },
        });
    }
}

/// Drives one voice session from connection open to close.
pub struct SessionOrchestrator {
    session_id: String,
    services: SessionServices,
    frames: FrameBuffer,
    segmenter: SpeechSegmenter,
    /// `None` while lent to the active reply task.
    history: Option<History>,
    system_prompt: String,
    state: SessionState,
    active: Option<ActiveGeneration>,
    generation_seq: u64,
    events_tx: mpsc::UnboundedSender<GenerationEvent>,
    events_rx: mpsc::UnboundedReceiver<GenerationEvent>,
    outbound: mpsc::Sender<ServerEvent>,
    shutdown: CancellationToken,
}

impl SessionOrchestrator {
    pub fn new(
        session_id: impl Into<String>,
        services: SessionServices,
        outbound: mpsc::Sender<ServerEvent>,
        shutdown: CancellationToken,
    ) -> Self {
        let segmenter = SpeechSegmenter::new(services.segmenter.clone(), (services.classifier)());
        let frames = FrameBuffer::new(services.segmenter.format);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            session_id: session_id.into(),
            history: Some(History::new(services.history_cap)),
            system_prompt: services.system_prompt.clone(),
            services,
            frames,
            segmenter,
            state: SessionState::Idle,
            active: None,
            generation_seq: 0,
            events_tx,
            events_rx,
            outbound,
            shutdown,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Process `inbound` until the client goes away, ends the session or
    /// `shutdown` fires, then release everything the session owns.
    pub async fn run<S>(mut self, inbound: S)
    where
        S: Stream<Item = Inbound> + Send,
    {
        futures_util::pin_mut!(inbound);
        self.state = SessionState::Listening;
        self.services.metrics.session_opened();
        info!(session_id = %self.session_id, "voice session started");

        let mut flow = self
            .send(ServerEvent::Session {
                session_id: self.session_id.clone(),
            })
            .await;

        while flow.is_continue() {
            flow = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    info!(session_id = %self.session_id, "session terminated");
                    ControlFlow::Break(())
                }
                Some(event) = self.events_rx.recv() => self.on_generation_event(event).await,
                message = inbound.next() => match message {
                    Some(Inbound::Audio(bytes)) => self.on_audio(&bytes).await,
                    Some(Inbound::Text(text)) => self.on_control(&text).await,
                    None => {
                        info!(session_id = %self.session_id, "client disconnected");
                        ControlFlow::Break(())
                    }
                },
            };
        }

        self.close().await;
    }

    async fn send(&mut self, event: ServerEvent) -> ControlFlow<()> {
        if self.outbound.send(event).await.is_err() {
            debug!(session_id = %self.session_id, "outbound channel closed");
            return ControlFlow::Break(());
        }
        ControlFlow::Continue(())
    }

    async fn on_audio(&mut self, bytes: &[u8]) -> ControlFlow<()> {
        for frame in self.frames.push(bytes) {
            let before = self.segmenter.state();
            let segment = self.segmenter.process(frame);
            match (before, self.segmenter.state()) {
                (SegmenterState::Idle, SegmenterState::Triggered) => {
                    debug!(session_id = %self.session_id, "speech started");
                    self.send(ServerEvent::SpeechStart).await?;
                }
                (SegmenterState::Triggered, SegmenterState::Idle) => {
                    debug!(session_id = %self.session_id, "speech ended");
                    self.send(ServerEvent::SpeechEnd).await?;
                }
                _ => {}
            }
            if let Some(segment) = segment {
                self.on_segment(segment).await?;
            }
        }
        ControlFlow::Continue(())
    }

    async fn on_segment(&mut self, segment: SpeechSegment) -> ControlFlow<()> {
        self.services.metrics.segment_finalized();
        debug!(
            session_id = %self.session_id,
            state = ?self.state,
            frames = segment.frames,
            "speech segment finalized"
        );

        self.deliver_queued_events().await?;
        if self.cancel_generation("barge-in").await {
            self.send(ServerEvent::Interrupted).await?;
        }

        let transcript = tokio::select! {
            _ = self.shutdown.cancelled() => return ControlFlow::Break(()),
            result = self.services.transcriber.transcribe(&segment.bytes) => result,
        };
        let text = match transcript {
            Ok(Some(text)) if !text.trim().is_empty() => text.trim().to_string(),
            Ok(_) => {
                debug!(session_id = %self.session_id, "no speech recognized in segment");
                return ControlFlow::Continue(());
            }
            Err(e) => {
                error!(session_id = %self.session_id, error = %e, "transcription failed");
                return ControlFlow::Continue(());
            }
        };

        self.services.metrics.transcript_received();
        info!(session_id = %self.session_id, transcript = %text, "user turn recognized");
        self.send(ServerEvent::Transcript { text: text.clone() }).await?;
        self.start_generation(text);
        ControlFlow::Continue(())
    }

    async fn on_control(&mut self, raw: &str) -> ControlFlow<()> {
        let message = match serde_json::from_str::<ControlMessage>(raw) {
            Ok(message) => message,
            Err(e) => {
                warn!(session_id = %self.session_id, error = %e, "ignoring malformed control message");
                return ControlFlow::Continue(());
            }
        };

        match message {
            ControlMessage::Interrupt => {
                self.deliver_queued_events().await?;
                if self.cancel_generation("interrupt").await {
                    return self.send(ServerEvent::Interrupted).await;
                }
                debug!(session_id = %self.session_id, "interrupt with no active response");
                ControlFlow::Continue(())
            }
            ControlMessage::SystemPrompt { prompt } => {
                if let Err(e) = validate_system_prompt(&prompt) {
                    warn!(session_id = %self.session_id, error = %e, "ignoring system prompt");
                    return ControlFlow::Continue(());
                }
                self.system_prompt = prompt.trim().to_string();
                info!(session_id = %self.session_id, "system prompt updated");
                ControlFlow::Continue(())
            }
            ControlMessage::EndSession { session_id: Some(target) } if target != self.session_id => {
                if let Err(e) = validate_session_id(&target) {
                    warn!(session_id = %self.session_id, error = %e, "ignoring end_session");
                    return ControlFlow::Continue(());
                }
                let deleted = self.services.store.cleanup_session(&target).await;
                info!(session_id = %self.session_id, target = %target, deleted, "client ended another session");
                self.send(ServerEvent::SessionEnded { session_id: target }).await
            }
            ControlMessage::EndSession { .. } => {
                info!(session_id = %self.session_id, "client ended the session");
                self.send(ServerEvent::SessionEnded {
                    session_id: self.session_id.clone(),
                })
                .await?;
                ControlFlow::Break(())
            }
        }
    }

    fn start_generation(&mut self, user_text: String) {
        let history = self.history.take().unwrap_or_else(|| {
            warn!(session_id = %self.session_id, "history missing, starting a new one");
            History::new(self.services.history_cap)
        });

        self.generation_seq += 1;
        let id = self.generation_seq;
        let cancel = self.shutdown.child_token();
        let job = GenerationJob {
            id,
            session_id: self.session_id.clone(),
            user_text,
            system_prompt: self.system_prompt.clone(),
            services: self.services.clone(),
            cancel: cancel.clone(),
            events: self.events_tx.clone(),
        };
        let handle = tokio::spawn(job.run(history));

        self.active = Some(ActiveGeneration { id, cancel, handle });
        self.state = SessionState::Generating;
        self.services.metrics.generation_started();
        debug!(session_id = %self.session_id, generation = id, "response started");
    }

    async fn on_generation_event(&mut self, event: GenerationEvent) -> ControlFlow<()> {
        if self.active.as_ref().map(|a| a.id) != Some(event.id) {
            debug!(session_id = %self.session_id, generation = event.id, "dropping event from superseded response");
            return ControlFlow::Continue(());
        }

        match event.kind {
            GenerationEventKind::Playback(playback) => {
                let url = self.services.artifact_url(&playback.artifact_id);
                self.send(ServerEvent::Audio {
                    text: playback.text,
                    artifact_id: playback.artifact_id,
                    url,
                    sequence_index: playback.sequence_index,
                })
                .await
            }
            GenerationEventKind::Finished { text } => {
                self.finish_generation().await;
                self.services.metrics.generation_completed();
                self.send(ServerEvent::EndOfResponse { text }).await
            }
            GenerationEventKind::Failed => {
                self.finish_generation().await;
                self.send(ServerEvent::Error {
                    message: "response generation failed".to_string(),
                })
                .await
            }
        }
    }

    async fn finish_generation(&mut self) {
        if let Some(active) = self.active.take() {
            self.reclaim(active).await;
        }
        self.state = SessionState::Listening;
    }

    /// Apply generation events that are already queued, so a reply that
    /// finished before this point completes normally instead of being
    /// cancelled.
    async fn deliver_queued_events(&mut self) -> ControlFlow<()> {
        while self.active.is_some() {
            let Ok(event) = self.events_rx.try_recv() else {
                break;
            };
            self.on_generation_event(event).await?;
        }
        ControlFlow::Continue(())
    }

    /// Cancel the running reply and wait until it has fully unwound.
    async fn cancel_generation(&mut self, reason: &'static str) -> bool {
        let Some(active) = self.active.take() else {
            return false;
        };
        info!(session_id = %self.session_id, generation = active.id, reason, "cancelling response");
        active.cancel.cancel();
        self.reclaim(active).await;
        self.state = SessionState::Listening;
        self.services.metrics.generation_cancelled();
        true
    }

    async fn reclaim(&mut self, active: ActiveGeneration) {
        match active.handle.await {
            Ok(history) => self.history = Some(history),
            Err(e) => {
                error!(session_id = %self.session_id, generation = active.id, error = %e, "response task failed");
                self.history = Some(History::new(self.services.history_cap));
            }
        }
    }

    async fn close(mut self) {
        self.cancel_generation("session closed").await;
        self.frames.clear();
        self.segmenter.reset();
        let deleted = self.services.store.cleanup_session(&self.session_id).await;
        self.services.metrics.session_closed();
        self.state = SessionState::Idle;
        info!(session_id = %self.session_id, deleted, "voice session closed");
    }
}
