//! Real-time voice conversation server.
//!
//! Clients stream microphone audio over a WebSocket; the server segments
//! it into utterances, transcribes them, streams a reply from the language
//! model and speaks it back chunk by chunk. A new utterance or an explicit
//! interrupt cancels the reply in flight.
pub mod config;
pub mod error;
pub mod metrics;
pub mod protocol;
pub mod registry;
pub mod routes;
pub mod session;
pub mod state;
pub mod validation;
