//! State machine for the duplex voice session
//!
//! This module implements the core state machine using a single-writer pattern.
//! All phase transitions go through the `reduce()` function, which returns
//! a new phase and a list of effects to execute.

use uuid::Uuid;

use crate::audio::{AudioError, CodecError, HandleId};
use crate::metrics::SessionOutcome;
use crate::streaming::{StreamingError, TransportEvent};

/// Errors surfaced by the session manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Microphone or output device could not be acquired
    DeviceUnavailable(String),
    /// Connect, handshake or mid-session transport failure
    TransportError(String),
    /// An inbound audio chunk could not be decoded (non-fatal)
    MalformedFrame { len: usize },
    /// A session is already connecting or connected
    AlreadyActive,
    /// The session loop is no longer running
    Closed,
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::DeviceUnavailable(e) => write!(f, "Audio device unavailable: {}", e),
            SessionError::TransportError(e) => write!(f, "Transport error: {}", e),
            SessionError::MalformedFrame { len } => {
                write!(f, "Malformed audio chunk ({} bytes)", len)
            }
            SessionError::AlreadyActive => write!(f, "A voice session is already active"),
            SessionError::Closed => write!(f, "Session loop is not running"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<AudioError> for SessionError {
    fn from(e: AudioError) -> Self {
        SessionError::DeviceUnavailable(e.to_string())
    }
}

impl From<StreamingError> for SessionError {
    fn from(e: StreamingError) -> Self {
        SessionError::TransportError(e.to_string())
    }
}

impl From<CodecError> for SessionError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::MalformedFrame { len, .. } => SessionError::MalformedFrame { len },
        }
    }
}

/// Session phase. This is the authoritative state; all transitions go through the reducer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Phase {
    #[default]
    Idle,
    Connecting {
        session_id: Uuid,
    },
    Connected {
        session_id: Uuid,
    },
    Error {
        message: String,
    },
}

impl Phase {
    pub fn session_id(&self) -> Option<Uuid> {
        match self {
            Phase::Connecting { session_id } | Phase::Connected { session_id } => Some(*session_id),
            Phase::Idle | Phase::Error { .. } => None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.session_id().is_some()
    }
}

/// Events that can trigger phase transitions.
/// Sent from the front end, the open task, the transport and the output device.
#[derive(Debug, Clone)]
pub enum Event {
    Start,
    Stop,
    Toggle,

    // Open task results
    OpenOk {
        id: Uuid,
    },
    OpenFail {
        id: Uuid,
        err: String,
    },

    /// Inbound transport event, tagged with the session it belongs to
    Inbound {
        id: Uuid,
        event: TransportEvent,
    },

    /// A playback buffer reached its natural end
    PlaybackEnded {
        id: Uuid,
        handle: HandleId,
    },
}

/// Effects to be executed after a phase transition.
/// The session manager applies these in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Acquire devices and open the transport for a new session
    OpenSession {
        id: Uuid,
    },
    /// Install the opened link as the active session
    Activate {
        id: Uuid,
    },
    /// Drop a link whose session is no longer current
    ReleaseLink {
        id: Uuid,
    },
    /// Close the transport, flush playback, release capture
    Teardown {
        id: Uuid,
        outcome: SessionOutcome,
        error: Option<String>,
    },
    SchedulePlayback {
        pcm: Vec<u8>,
    },
    CancelPlayback,
    /// Count an inbound chunk that could not be decoded
    RecordMalformed {
        reason: String,
    },
    AppendTranscript {
        text: String,
    },
    CompleteTurn,
    ReleaseHandle {
        handle: HandleId,
    },
    /// Hold an inbound event until the session is activated
    Defer {
        event: TransportEvent,
    },
    /// Publish the status feed
    EmitStatus,
}

fn begin_session() -> (Phase, Vec<Effect>) {
    let id = Uuid::new_v4();
    (
        Phase::Connecting { session_id: id },
        vec![Effect::OpenSession { id }, Effect::EmitStatus],
    )
}

fn end_session(
    id: Uuid,
    next: Phase,
    outcome: SessionOutcome,
    error: Option<String>,
) -> (Phase, Vec<Effect>) {
    (
        next,
        vec![
            Effect::Teardown { id, outcome, error },
            Effect::EmitStatus,
        ],
    )
}

/// Reducer function: (phase, event) -> (next_phase, effects)
///
/// Key rules:
/// - Never mutate the phase directly
/// - `Start` while connecting or connected is rejected with `AlreadyActive`
/// - Ignore events with stale session IDs; a stale successful open is released
/// - Always emit EmitStatus after visible changes
pub fn reduce(phase: &Phase, event: Event) -> Result<(Phase, Vec<Effect>), SessionError> {
    use Effect::*;
    use Event::*;

    let current_id = phase.session_id();
    let is_current = |eid: Uuid| current_id == Some(eid);

    let result = match (phase, event) {
        // -----------------
        // Start / Stop / Toggle
        // -----------------
        (Phase::Idle | Phase::Error { .. }, Start | Toggle) => begin_session(),
        (Phase::Connecting { .. } | Phase::Connected { .. }, Start) => {
            return Err(SessionError::AlreadyActive)
        }
        (
            Phase::Connecting { session_id } | Phase::Connected { session_id },
            Stop | Toggle,
        ) => end_session(*session_id, Phase::Idle, SessionOutcome::Stopped, None),
        (Phase::Idle, Stop) => (Phase::Idle, vec![]),
        (Phase::Error { .. }, Stop) => (Phase::Idle, vec![EmitStatus]),

        // -----------------
        // Connecting
        // -----------------
        (Phase::Connecting { session_id }, OpenOk { id }) if *session_id == id => (
            Phase::Connected { session_id: id },
            vec![Activate { id }, EmitStatus],
        ),
        (Phase::Connecting { session_id }, OpenFail { id, err }) if *session_id == id => end_session(
            id,
            Phase::Error {
                message: err.clone(),
            },
            SessionOutcome::OpenFailed,
            Some(err),
        ),

        // The reader starts before the open completes
        (Phase::Connecting { session_id }, Inbound { id, event }) if *session_id == id => {
            match event {
                TransportEvent::Error(message) => end_session(
                    id,
                    Phase::Error {
                        message: message.clone(),
                    },
                    SessionOutcome::Failed,
                    Some(message),
                ),
                TransportEvent::Closed => {
                    end_session(id, Phase::Idle, SessionOutcome::Closed, None)
                }
                event => (phase.clone(), vec![Defer { event }]),
            }
        }

        // -----------------
        // Connected
        // -----------------
        (Phase::Connected { session_id }, Inbound { id, event }) if *session_id == id => {
            match event {
                TransportEvent::AudioDelta(pcm) => (phase.clone(), vec![SchedulePlayback { pcm }, EmitStatus]),
                TransportEvent::MalformedAudio(reason) => (phase.clone(), vec![RecordMalformed { reason }]),
                TransportEvent::TranscriptDelta(text) => {
                    (phase.clone(), vec![AppendTranscript { text }, EmitStatus])
                }
                TransportEvent::TurnComplete => (phase.clone(), vec![CompleteTurn, EmitStatus]),
                TransportEvent::Interrupted => (phase.clone(), vec![CancelPlayback, EmitStatus]),
                TransportEvent::Error(message) => end_session(
                    id,
                    Phase::Error {
                        message: message.clone(),
                    },
                    SessionOutcome::Failed,
                    Some(message),
                ),
                TransportEvent::Closed => {
                    end_session(id, Phase::Idle, SessionOutcome::Closed, None)
                }
            }
        }
        (Phase::Connected { session_id }, PlaybackEnded { id, handle }) if *session_id == id => {
            (phase.clone(), vec![ReleaseHandle { handle }, EmitStatus])
        }

        // -----------------
        // Stale events
        // -----------------
        // An open that finished after its session was stopped still holds devices
        (_, OpenOk { id }) => {
            log::info!("Releasing link for stale session {}", id);
            (phase.clone(), vec![ReleaseLink { id }])
        }
        (_, OpenFail { id, err }) => {
            log::debug!("Ignoring open failure for stale session {}: {}", id, err);
            (phase.clone(), vec![])
        }
        (_, Inbound { id, event }) => {
            if !is_current(id) {
                log::debug!("Dropping {:?} for stale session {}", event, id);
            }
            (phase.clone(), vec![])
        }
        (_, PlaybackEnded { .. }) => (phase.clone(), vec![]),
    };

    Ok(result)
}
