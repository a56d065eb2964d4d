use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Live sessions by id, each with the token that terminates it.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, CancellationToken>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, session_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.sessions.insert(session_id.to_string(), token.clone());
        token
    }

    pub fn remove(&self, session_id: &str) {
        self.sessions.remove(session_id);
    }

    /// Ask a live session to shut down. Returns `false` if it is not live.
    pub fn terminate(&self, session_id: &str) -> bool {
        match self.sessions.remove(session_id) {
            Some((_, token)) => {
                token.cancel();
                info!(session_id, "session termination requested");
                true
            }
            None => false,
        }
    }

    pub fn terminate_all(&self) {
        for entry in self.sessions.iter() {
            entry.value().cancel();
        }
    }

    pub fn is_live(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
