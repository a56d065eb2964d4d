//! WebSocket message types.
//!
//! Binary frames from the client carry raw PCM audio; text frames carry
//! JSON control messages. Every server frame is a JSON [`ServerEvent`].
use serde::{Deserialize, Serialize};

/// One inbound WebSocket message, already split by frame type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Audio(Vec<u8>),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Stop the reply currently being spoken.
    Interrupt,
    /// Replace the system prompt for the following replies.
    SystemPrompt {
        #[serde(alias = "content")]
        prompt: String,
    },
    /// Close the session from the client side, or only clean up the
    /// artifacts of the named session.
    EndSession {
        #[serde(default)]
        session_id: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Session {
        session_id: String,
    },
    SpeechStart,
    /// The segmenter released; sent even when the segment is discarded.
    SpeechEnd,
    Transcript {
        text: String,
    },
    Audio {
        text: String,
        artifact_id: String,
        url: String,
        sequence_index: u32,
    },
    EndOfResponse {
        text: String,
    },
    Interrupted,
    SessionEnded {
        session_id: String,
    },
    Error {
        message: String,
    },
}
