use std::collections::{HashMap, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Context;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long artifacts live and how often expired ones are swept.
#[derive(Debug, Clone, Copy)]
pub struct RetentionPolicy {
    pub max_age: Duration,
    pub sweep_interval: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ArtifactStats {
    pub total_files: usize,
    pub active_sessions: usize,
    pub total_bytes: u64,
    pub sweep_interval_secs: u64,
    pub max_age_secs: u64,
}

#[derive(Debug, Clone)]
struct ArtifactEntry {
    session_id: String,
    registered_at: Instant,
}

#[derive(Debug, Default)]
struct Ledger {
    sessions: HashMap<String, HashSet<String>>,
    artifacts: HashMap<String, ArtifactEntry>,
}

/// Artifact names are `<32 lowercase hex>.<ext>`; anything else never
/// touches the filesystem.
pub fn is_valid_artifact_id(artifact_id: &str) -> bool {
    let Some((stem, ext)) = artifact_id.split_once('.') else {
        return false;
    };
    stem.len() == 32
        && stem.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
        && (1..=5).contains(&ext.len())
        && ext.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
}

/// Synthesized audio on disk, owned by sessions and bounded in age.
///
/// Bookkeeping lives behind one short-lived lock; file I/O happens after the
/// lock is released.
#[derive(Debug)]
pub struct ArtifactStore {
    dir: PathBuf,
    retention: RetentionPolicy,
    ledger: Mutex<Ledger>,
}

impl ArtifactStore {
    /// Open (and create if needed) the artifact directory.
    pub async fn open(dir: impl Into<PathBuf>, retention: RetentionPolicy) -> anyhow::Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create artifact directory: {}", dir.display()))?;
        Ok(Self {
            dir,
            retention,
            ledger: Mutex::new(Ledger::default()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn retention(&self) -> RetentionPolicy {
        self.retention
    }

    pub fn new_artifact_id(extension: &str) -> String {
        format!("{}.{}", uuid::Uuid::new_v4().simple(), extension)
    }

    /// Record that `artifact_id` belongs to `session_id`, starting its clock.
    pub fn register(&self, artifact_id: &str, session_id: &str) {
        let mut ledger = self.lock();
        let entry = ArtifactEntry {
            session_id: session_id.to_string(),
            registered_at: Instant::now(),
        };
        if let Some(previous) = ledger.artifacts.insert(artifact_id.to_string(), entry) {
            if previous.session_id != session_id {
                if let Some(ids) = ledger.sessions.get_mut(&previous.session_id) {
                    ids.remove(artifact_id);
                    if ids.is_empty() {
                        ledger.sessions.remove(&previous.session_id);
                    }
                }
            }
        }
        ledger
            .sessions
            .entry(session_id.to_string())
            .or_default()
            .insert(artifact_id.to_string());
        debug!(artifact_id, session_id, "artifact registered");
    }

    /// Write `bytes` under a fresh name and register it to `session_id`.
    pub async fn persist(&self, session_id: &str, bytes: &[u8], extension: &str) -> anyhow::Result<String> {
        let artifact_id = Self::new_artifact_id(extension);
        let path = self.dir.join(&artifact_id);
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("Failed to write artifact: {}", path.display()))?;
        self.register(&artifact_id, session_id);
        Ok(artifact_id)
    }

    /// Remove an artifact's bytes and bookkeeping.
    ///
    /// Returns `false` for unknown ids and when the file could not be
    /// removed; in the latter case the entry is kept so a later sweep
    /// retries.
    pub async fn delete(&self, artifact_id: &str) -> bool {
        let entry = {
            let mut ledger = self.lock();
            let Some(entry) = ledger.artifacts.remove(artifact_id) else {
                return false;
            };
            if let Some(ids) = ledger.sessions.get_mut(&entry.session_id) {
                ids.remove(artifact_id);
                if ids.is_empty() {
                    ledger.sessions.remove(&entry.session_id);
                }
            }
            entry
        };

        match tokio::fs::remove_file(self.dir.join(artifact_id)).await {
            Ok(()) => {
                debug!(artifact_id, "artifact deleted");
                true
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(artifact_id, "artifact file already gone");
                true
            }
            Err(e) => {
                error!(artifact_id, error = %e, "failed to delete artifact");
                let mut ledger = self.lock();
                ledger
                    .sessions
                    .entry(entry.session_id.clone())
                    .or_default()
                    .insert(artifact_id.to_string());
                ledger.artifacts.insert(artifact_id.to_string(), entry);
                false
            }
        }
    }

    /// Delete every artifact of a session and forget the session.
    pub async fn cleanup_session(&self, session_id: &str) -> usize {
        let ids: Vec<String> = {
            let mut ledger = self.lock();
            ledger
                .sessions
                .remove(session_id)
                .map(|ids| ids.into_iter().collect())
                .unwrap_or_default()
        };

        let mut deleted = 0;
        for artifact_id in &ids {
            if self.delete(artifact_id).await {
                deleted += 1;
            }
        }
        info!(session_id, deleted, "session artifacts cleaned up");
        deleted
    }

    /// Delete every artifact older than the retention window.
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<String> = {
            let ledger = self.lock();
            ledger
                .artifacts
                .iter()
                .filter(|(_, entry)| now.duration_since(entry.registered_at) > self.retention.max_age)
                .map(|(id, _)| id.clone())
                .collect()
        };

        let mut deleted = 0;
        for artifact_id in &expired {
            if self.delete(artifact_id).await {
                deleted += 1;
            }
        }
        if deleted > 0 {
            info!(deleted, "expired artifacts swept");
        }
        deleted
    }

    /// Registered, owned by a live session and inside the retention window.
    pub fn is_reachable(&self, artifact_id: &str) -> bool {
        let ledger = self.lock();
        let Some(entry) = ledger.artifacts.get(artifact_id) else {
            return false;
        };
        let owned = ledger
            .sessions
            .get(&entry.session_id)
            .is_some_and(|ids| ids.contains(artifact_id));
        owned && entry.registered_at.elapsed() <= self.retention.max_age
    }

    pub fn is_registered(&self, artifact_id: &str) -> bool {
        self.lock().artifacts.contains_key(artifact_id)
    }

    pub fn session_artifact_count(&self, session_id: &str) -> usize {
        self.lock().sessions.get(session_id).map_or(0, HashSet::len)
    }

    /// Bytes of a reachable artifact; `Ok(None)` when it is unknown,
    /// expired or its session is gone.
    pub async fn read(&self, artifact_id: &str) -> anyhow::Result<Option<Vec<u8>>> {
        if !is_valid_artifact_id(artifact_id) || !self.is_reachable(artifact_id) {
            return Ok(None);
        }
        match tokio::fs::read(self.dir.join(artifact_id)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!(artifact_id, "registered artifact is missing on disk");
                Ok(None)
            }
            Err(e) => Err(e).with_context(|| format!("Failed to read artifact {artifact_id}")),
        }
    }

    pub async fn stats(&self) -> ArtifactStats {
        let (ids, active_sessions): (Vec<String>, usize) = {
            let ledger = self.lock();
            (ledger.artifacts.keys().cloned().collect(), ledger.sessions.len())
        };

        let mut total_bytes = 0;
        for artifact_id in &ids {
            if let Ok(meta) = tokio::fs::metadata(self.dir.join(artifact_id)).await {
                total_bytes += meta.len();
            }
        }

        ArtifactStats {
            total_files: ids.len(),
            active_sessions,
            total_bytes,
            sweep_interval_secs: self.retention.sweep_interval.as_secs(),
            max_age_secs: self.retention.max_age.as_secs(),
        }
    }

    /// Start the periodic expiry sweep.
    pub fn spawn_sweeper(self: &Arc<Self>) -> Sweeper {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let store = Arc::clone(self);
        let period = self.retention.sweep_interval.max(Duration::from_millis(1));

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        store.sweep().await;
                    }
                }
            }
            info!("artifact sweeper stopped");
        });

        info!(interval_secs = period.as_secs(), "artifact sweeper started");
        Sweeper { cancel, handle }
    }

    fn lock(&self) -> MutexGuard<'_, Ledger> {
        // The ledger stays consistent between statements, so a poisoned lock
        // is still usable.
        self.ledger.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Handle to the background sweep task.
pub struct Sweeper {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Sweeper {
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            warn!(error = %e, "artifact sweeper ended abnormally");
        }
    }
}
