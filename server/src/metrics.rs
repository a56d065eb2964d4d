// Metrics collection and tracking

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tts_core::{ArtifactStats, Synthesizer};

/// Keep the last N latency samples for percentiles
const MAX_LATENCY_SAMPLES: usize = 1000;

/// Call count, failures and latency distribution of one operation
#[derive(Debug)]
pub struct LatencyStats {
    count: AtomicU64,
    error_count: AtomicU64,
    total_latency_ms: AtomicU64,
    min_latency_ms: AtomicU64,
    max_latency_ms: AtomicU64,
    latency_samples: Mutex<Vec<u64>>,
}

impl LatencyStats {
    pub fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            total_latency_ms: AtomicU64::new(0),
            min_latency_ms: AtomicU64::new(u64::MAX),
            max_latency_ms: AtomicU64::new(0),
            latency_samples: Mutex::new(Vec::new()),
        }
    }

    pub fn record(&self, latency_ms: u64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_latency_ms.fetch_add(latency_ms, Ordering::Relaxed);
        self.min_latency_ms.fetch_min(latency_ms, Ordering::Relaxed);
        self.max_latency_ms.fetch_max(latency_ms, Ordering::Relaxed);

        if let Ok(mut samples) = self.latency_samples.lock() {
            samples.push(latency_ms);
            if samples.len() > MAX_LATENCY_SAMPLES {
                samples.remove(0);
            }
        }
    }

    pub fn record_error(&self) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::Relaxed)
    }

    pub fn avg_latency_ms(&self) -> f64 {
        let count = self.count();
        if count == 0 {
            return 0.0;
        }
        self.total_latency_ms.load(Ordering::Relaxed) as f64 / count as f64
    }

    fn percentile(&self, p: u8) -> u64 {
        let Ok(samples) = self.latency_samples.lock() else {
            return 0;
        };
        if samples.is_empty() {
            return 0;
        }
        let mut sorted = samples.clone();
        sorted.sort_unstable();
        let index = (sorted.len() * p as usize / 100).min(sorted.len() - 1);
        sorted[index]
    }

    pub fn snapshot(&self) -> LatencySnapshot {
        let min = self.min_latency_ms.load(Ordering::Relaxed);
        LatencySnapshot {
            count: self.count(),
            error_count: self.error_count(),
            avg_latency_ms: self.avg_latency_ms(),
            min_latency_ms: if min == u64::MAX { 0 } else { min },
            max_latency_ms: self.max_latency_ms.load(Ordering::Relaxed),
            p50_latency_ms: self.percentile(50),
            p95_latency_ms: self.percentile(95),
            p99_latency_ms: self.percentile(99),
        }
    }
}

impl Default for LatencyStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-wide voice pipeline counters
#[derive(Debug, Default)]
pub struct VoiceMetrics {
    sessions_opened: AtomicU64,
    sessions_active: AtomicU64,
    segments: AtomicU64,
    transcripts: AtomicU64,
    generations_started: AtomicU64,
    generations_completed: AtomicU64,
    generations_cancelled: AtomicU64,
    pub synthesis: LatencyStats,
}

impl VoiceMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_opened(&self) {
        self.sessions_opened.fetch_add(1, Ordering::Relaxed);
        self.sessions_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_closed(&self) {
        // Never wraps below zero.
        let _ = self
            .sessions_active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn segment_finalized(&self) {
        self.segments.fetch_add(1, Ordering::Relaxed);
    }

    pub fn transcript_received(&self) {
        self.transcripts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn generation_started(&self) {
        self.generations_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn generation_completed(&self) {
        self.generations_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn generation_cancelled(&self) {
        self.generations_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sessions(&self) -> SessionStats {
        SessionStats {
            sessions_opened: self.sessions_opened.load(Ordering::Relaxed),
            sessions_active: self.sessions_active.load(Ordering::Relaxed),
            segments: self.segments.load(Ordering::Relaxed),
            transcripts: self.transcripts.load(Ordering::Relaxed),
            generations_started: self.generations_started.load(Ordering::Relaxed),
            generations_completed: self.generations_completed.load(Ordering::Relaxed),
            generations_cancelled: self.generations_cancelled.load(Ordering::Relaxed),
        }
    }
}

/// Records every synthesis call of the wrapped synthesizer into
/// [`VoiceMetrics::synthesis`].
pub struct MeteredSynthesizer {
    inner: Arc<dyn Synthesizer>,
    metrics: Arc<VoiceMetrics>,
}

impl MeteredSynthesizer {
    pub fn new(inner: Arc<dyn Synthesizer>, metrics: Arc<VoiceMetrics>) -> Self {
        Self { inner, metrics }
    }
}

#[async_trait]
impl Synthesizer for MeteredSynthesizer {
    async fn synthesize(&self, text: &str) -> anyhow::Result<Vec<u8>> {
        let start = Instant::now();
        let result = self.inner.synthesize(text).await;
        match &result {
            Ok(_) => self.metrics.synthesis.record(start.elapsed().as_millis() as u64),
            Err(_) => self.metrics.synthesis.record_error(),
        }
        result
    }

    fn extension(&self) -> &'static str {
        self.inner.extension()
    }
}

#[derive(Serialize)]
pub struct DetailedMetricsResponse {
    pub timestamp: DateTime<Utc>,
    pub system: SystemMetrics,
    pub sessions: SessionStats,
    pub synthesis: LatencySnapshot,
    pub artifacts: ArtifactStats,
}

#[derive(Serialize)]
pub struct SystemMetrics {
    pub cpu_usage_percent: f32,
    pub memory_used_mb: u64,
    pub memory_total_mb: u64,
    pub memory_usage_percent: f32,
    pub request_count: u64,
    pub uptime_seconds: u64,
    pub system_load: Option<f64>,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct SessionStats {
    pub sessions_opened: u64,
    pub sessions_active: u64,
    pub segments: u64,
    pub transcripts: u64,
    pub generations_started: u64,
    pub generations_completed: u64,
    pub generations_cancelled: u64,
}

#[derive(Debug, Serialize)]
pub struct LatencySnapshot {
    pub count: u64,
    pub error_count: u64,
    pub avg_latency_ms: f64,
    pub min_latency_ms: u64,
    pub max_latency_ms: u64,
    pub p50_latency_ms: u64,
    pub p95_latency_ms: u64,
    pub p99_latency_ms: u64,
}
