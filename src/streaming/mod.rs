//! Streaming transport to the remote live model
//!
//! This module provides the WebSocket session with the live generation endpoint:
//! microphone frames go out as base64 PCM16, and the model's audio, transcription
//! and turn signals come back as `TransportEvent`s.
//!
//! # Architecture
//!
//! ```text
//! CaptureDevice ──▶ bounded mpsc ──▶ writer task ──▶ WebSocket
//!                                                       │
//!                                                       ▼
//!                   session loop ◀── TransportEvent ◀── reader task
//! ```
//!
//! # Failure Strategy
//!
//! - A failed connect or setup is reported once; there are no automatic retries
//! - Mid-session errors and closes surface as events and end the session

mod live_client;
mod protocol;
mod transcript_aggregator;

pub use live_client::{get_api_key, EventCallback, LiveConfig, LiveSession};
pub use protocol::{ClientMessage, ServerMessage, SetupConfig, LIVE_API_URL};
pub use transcript_aggregator::{TranscriptAggregator, DEFAULT_TRANSCRIPT_LINES};

/// Inbound happenings on an open transport, in arrival order
#[derive(Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Raw PCM16 audio from the model
    AudioDelta(Vec<u8>),
    /// An inline audio part that could not be decoded
    MalformedAudio(String),
    /// Transcription of the model's speech
    TranscriptDelta(String),
    TurnComplete,
    /// The user barged in; queued playback should stop
    Interrupted,
    Error(String),
    Closed,
}

impl std::fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportEvent::AudioDelta(bytes) => write!(f, "AudioDelta({} bytes)", bytes.len()),
            TransportEvent::MalformedAudio(e) => write!(f, "MalformedAudio({:?})", e),
            TransportEvent::TranscriptDelta(text) => write!(f, "TranscriptDelta({:?})", text),
            TransportEvent::TurnComplete => write!(f, "TurnComplete"),
            TransportEvent::Interrupted => write!(f, "Interrupted"),
            TransportEvent::Error(e) => write!(f, "Error({:?})", e),
            TransportEvent::Closed => write!(f, "Closed"),
        }
    }
}

/// An open transport. Closing is idempotent and emits no further events.
pub trait TransportHandle: Send {
    fn close(&mut self);
}

/// Errors that can occur on the streaming transport
#[derive(Debug, Clone)]
pub enum StreamingError {
    /// API key not configured
    MissingApiKey,
    /// Failed to establish WebSocket connection
    ConnectionFailed(String),
    /// Setup was rejected or never acknowledged
    SetupFailed(String),
    /// WebSocket protocol error
    ProtocolError(String),
    /// Connection was closed unexpectedly
    Disconnected(String),
    /// Failed to send audio data
    SendFailed(String),
}

impl std::fmt::Display for StreamingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamingError::MissingApiKey => {
                write!(
                    f,
                    "API key not configured. Set GEMINI_API_KEY environment variable."
                )
            }
            StreamingError::ConnectionFailed(e) => {
                write!(f, "Failed to connect to live endpoint: {}", e)
            }
            StreamingError::SetupFailed(e) => {
                write!(f, "Session setup failed: {}", e)
            }
            StreamingError::ProtocolError(e) => {
                write!(f, "WebSocket protocol error: {}", e)
            }
            StreamingError::Disconnected(e) => {
                write!(f, "WebSocket disconnected: {}", e)
            }
            StreamingError::SendFailed(e) => {
                write!(f, "Failed to send audio: {}", e)
            }
        }
    }
}

impl std::error::Error for StreamingError {}
