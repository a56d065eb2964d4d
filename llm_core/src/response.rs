use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use tracing::{debug, error, warn};

use crate::history::{ChatMessage, History};
use crate::{FragmentStream, TextGenerator};

/// Spoken in place of a reply when generation fails.
pub const APOLOGY: &str = "抱歉，我现在无法回答您的问题。";

/// A user turn appended to a [`History`] whose reply is still being
/// produced. Dropping it uncommitted removes the user turn again.
struct PendingTurn<'a> {
    history: &'a mut History,
    committed: bool,
}

impl<'a> PendingTurn<'a> {
    fn open(history: &'a mut History, user_text: &str) -> Self {
        history.push_user(user_text);
        Self {
            history,
            committed: false,
        }
    }

    fn prompt(&self, system_prompt: &str) -> Vec<ChatMessage> {
        self.history.to_prompt(system_prompt)
    }

    fn commit(mut self, reply: String) {
        self.history.push_assistant(reply);
        self.committed = true;
    }
}

impl Drop for PendingTurn<'_> {
    fn drop(&mut self) {
        if !self.committed && self.history.discard_pending_user() {
            debug!("reply abandoned, user turn removed from history");
        }
    }
}

/// Drives a [`TextGenerator`] for one exchange and keeps the conversation
/// history consistent with what was actually produced.
#[derive(Clone)]
pub struct ResponseStream {
    generator: Arc<dyn TextGenerator>,
    open_timeout: Duration,
}

impl ResponseStream {
    pub fn new(generator: Arc<dyn TextGenerator>) -> Self {
        Self {
            generator,
            open_timeout: Duration::from_secs(120),
        }
    }

    /// Bound on how long the generator may take to start answering.
    pub fn with_timeout(mut self, open_timeout: Duration) -> Self {
        self.open_timeout = open_timeout;
        self
    }

    /// Stream reply fragments for `user_text`.
    ///
    /// The user turn is appended before the generator is called and the
    /// accumulated reply is recorded once the generator finishes. Failures
    /// surface as a single [`APOLOGY`] fragment; the stream itself never
    /// errors. Dropping the stream early removes the user turn.
    pub fn generate<'a>(
        &'a self,
        user_text: &'a str,
        system_prompt: &'a str,
        history: &'a mut History,
    ) -> impl Stream<Item = String> + Send + 'a {
        async_stream::stream! {
            let turn = PendingTurn::open(history, user_text);
            let messages = turn.prompt(system_prompt);
            let mut reply = String::new();
            let mut failed = false;

            match self.open(&messages).await {
                Ok(mut fragments) => {
                    while let Some(item) = fragments.next().await {
                        match item {
                            Ok(fragment) if fragment.is_empty() => {}
                            Ok(fragment) => {
                                reply.push_str(&fragment);
                                yield fragment;
                            }
                            Err(e) => {
                                error!(error = %e, "generation stream failed");
                                failed = true;
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    error!(error = %e, "failed to start generation");
                    failed = true;
                }
            }

            if !failed && reply.trim().is_empty() {
                warn!("generator returned an empty reply");
                failed = true;
            }
            if failed {
                reply.push_str(APOLOGY);
                yield APOLOGY.to_string();
            }

            turn.commit(reply);
        }
    }

    /// Non-streaming variant of [`ResponseStream::generate`] with the same
    /// history and failure policy.
    pub async fn reply(&self, user_text: &str, system_prompt: &str, history: &mut History) -> String {
        let turn = PendingTurn::open(history, user_text);
        let messages = turn.prompt(system_prompt);

        let reply = match tokio::time::timeout(self.open_timeout, self.generator.generate(&messages)).await {
            Ok(Ok(text)) if !text.trim().is_empty() => text.trim().to_string(),
            Ok(Ok(_)) => {
                warn!("generator returned an empty reply");
                APOLOGY.to_string()
            }
            Ok(Err(e)) => {
                error!(error = %e, "generation failed");
                APOLOGY.to_string()
            }
            Err(_) => {
                error!(timeout_secs = self.open_timeout.as_secs(), "generation timed out");
                APOLOGY.to_string()
            }
        };

        turn.commit(reply.clone());
        reply
    }

    async fn open(&self, messages: &[ChatMessage]) -> anyhow::Result<FragmentStream> {
        match tokio::time::timeout(self.open_timeout, self.generator.generate_stream(messages)).await {
            Ok(result) => result,
            Err(_) => anyhow::bail!(
                "generator did not respond within {}s",
                self.open_timeout.as_secs()
            ),
        }
    }
}
