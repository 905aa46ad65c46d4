//! Duplex session manager
//!
//! One loop task owns the phase, the playback scheduler, the transcript and every
//! per-session resource. Front ends talk to it through `SessionHandle`; devices and
//! the transport talk to it through `EventSender`. Both only send messages, so all
//! mutation happens on the loop.
//!
//! ```text
//! SessionHandle ──control──▶ ┌──────────────────────┐ ──watch──▶ SessionStatus
//!                            │ DuplexSessionManager │
//! EventSender ──internal──▶  │  reduce() + effects  │
//!  (transport, playback)     └──────────────────────┘
//! ```

use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::audio::output::EndedCallback;
use crate::audio::{CaptureLease, HandleId, OutputDevice, PlaybackScheduler};
use crate::metrics::{MetricsCollector, MetricsSummary, SessionOutcome};
use crate::settings::VoiceSettings;
use crate::state_machine::{reduce, Effect, Event, Phase, SessionError};
use crate::streaming::{EventCallback, TranscriptAggregator, TransportEvent, TransportHandle};

/// Resources held by one open session
pub struct Link {
    pub output: Box<dyn OutputDevice>,
    pub transport: Box<dyn TransportHandle>,
    pub capture: Box<dyn CaptureLease>,
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("frames_captured", &self.capture.frames_captured())
            .finish_non_exhaustive()
    }
}

/// Opens the devices and transport for a session.
///
/// Implementations must release everything they acquired when they fail or when
/// the returned future is dropped before completion.
pub trait Connector: Send + Sync + 'static {
    fn open(
        &self,
        session_id: Uuid,
        events: EventSender,
    ) -> impl Future<Output = Result<Link, SessionError>> + Send;
}

enum Control {
    Dispatch {
        event: Event,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Metrics(oneshot::Sender<MetricsSummary>),
    Shutdown,
}

enum Internal {
    Event(Event),
    Opened {
        id: Uuid,
        result: Result<Link, SessionError>,
    },
}

/// Delivers transport and playback events for one session into the loop
#[derive(Clone)]
pub struct EventSender {
    session_id: Uuid,
    tx: mpsc::UnboundedSender<Internal>,
}

impl EventSender {
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Sender whose events go nowhere, for exercising a connector on its own
    #[cfg(test)]
    pub(crate) fn detached(session_id: Uuid) -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self { session_id, tx }
    }

    pub fn transport(&self, event: TransportEvent) {
        self.send(Event::Inbound {
            id: self.session_id,
            event,
        });
    }

    pub fn playback_ended(&self, handle: HandleId) {
        self.send(Event::PlaybackEnded {
            id: self.session_id,
            handle,
        });
    }

    /// Callback form of `transport`, for the live client
    pub fn transport_callback(&self) -> EventCallback {
        let sender = self.clone();
        Arc::new(move |event| sender.transport(event))
    }

    /// Callback form of `playback_ended`, for the output device
    pub fn ended_callback(&self) -> EndedCallback {
        let sender = self.clone();
        Arc::new(move |handle| sender.playback_ended(handle))
    }

    fn send(&self, event: Event) {
        // The loop is gone; nothing left to notify
        let _ = self.tx.send(Internal::Event(event));
    }
}

/// Phase as shown to front ends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionPhase {
    Idle,
    Connecting,
    Connected,
    Error,
}

/// Read-only status feed
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub phase: SessionPhase,
    pub session_id: Option<Uuid>,
    pub error: Option<String>,
    pub last_transcript_lines: Vec<String>,
    pub is_audio_active: bool,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self {
            phase: SessionPhase::Idle,
            session_id: None,
            error: None,
            last_transcript_lines: Vec::new(),
            is_audio_active: false,
        }
    }
}

struct ActiveSession {
    id: Uuid,
    scheduler: PlaybackScheduler<Box<dyn OutputDevice>>,
    transport: Box<dyn TransportHandle>,
    capture: Box<dyn CaptureLease>,
}

/// Owns the session phase and every per-session resource
pub struct DuplexSessionManager<C: Connector> {
    phase: Phase,
    settings: VoiceSettings,
    connector: Arc<C>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    active: Option<ActiveSession>,
    /// In-flight open task, aborted if the session ends first
    pending_open: Option<(Uuid, JoinHandle<()>)>,
    /// Link delivered by the open task, waiting for the reducer's verdict
    pending_link: Option<(Uuid, Link)>,
    /// Inbound events that arrived before activation
    deferred: Vec<TransportEvent>,
    transcript: TranscriptAggregator,
    metrics: MetricsCollector,
    status_tx: watch::Sender<SessionStatus>,
}

impl<C: Connector> DuplexSessionManager<C> {
    fn new(
        settings: VoiceSettings,
        connector: C,
        internal_tx: mpsc::UnboundedSender<Internal>,
        status_tx: watch::Sender<SessionStatus>,
    ) -> Self {
        let transcript = TranscriptAggregator::new(settings.transcript_lines);
        Self {
            phase: Phase::Idle,
            settings,
            connector: Arc::new(connector),
            internal_tx,
            active: None,
            pending_open: None,
            pending_link: None,
            deferred: Vec::new(),
            transcript,
            metrics: MetricsCollector::new(),
            status_tx,
        }
    }

    /// Run one event through the reducer and apply its effects
    pub fn dispatch(&mut self, event: Event) -> Result<(), SessionError> {
        log::debug!("Received event: {:?}", event);

        let (next, effects) = reduce(&self.phase, event)?;

        if std::mem::discriminant(&self.phase) != std::mem::discriminant(&next) {
            log::info!("Session transition: {:?} -> {:?}", self.phase, next);
        }
        self.phase = next;

        for effect in effects {
            self.apply(effect);
        }
        Ok(())
    }

    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    pub fn status(&self) -> SessionStatus {
        let (phase, error) = match &self.phase {
            Phase::Idle => (SessionPhase::Idle, None),
            Phase::Connecting { .. } => (SessionPhase::Connecting, None),
            Phase::Connected { .. } => (SessionPhase::Connected, None),
            Phase::Error { message } => (SessionPhase::Error, Some(message.clone())),
        };

        SessionStatus {
            phase,
            session_id: self.phase.session_id(),
            error,
            last_transcript_lines: self.transcript.lines(),
            is_audio_active: self
                .active
                .as_ref()
                .map(|s| s.scheduler.is_active())
                .unwrap_or(false),
        }
    }

    fn handle_opened(&mut self, id: Uuid, result: Result<Link, SessionError>) {
        if matches!(&self.pending_open, Some((pending, _)) if *pending == id) {
            self.pending_open = None;
        }

        let event = match result {
            Ok(link) => {
                self.pending_link = Some((id, link));
                Event::OpenOk { id }
            }
            Err(e) => {
                log::warn!("Session {} failed to open: {}", id, e);
                Event::OpenFail {
                    id,
                    err: e.to_string(),
                }
            }
        };

        if let Err(e) = self.dispatch(event) {
            log::warn!("Open result for {} rejected: {}", id, e);
        }

        // Whatever the reducer did not claim is released here
        if let Some((id, _link)) = self.pending_link.take() {
            log::info!("Released unclaimed link for session {}", id);
        }
    }

    fn apply(&mut self, effect: Effect) {
        match effect {
            Effect::OpenSession { id } => self.open_session(id),
            Effect::Activate { id } => self.activate(id),
            Effect::ReleaseLink { id } => {
                if let Some((link_id, link)) = self.pending_link.take() {
                    if link_id == id {
                        drop(link);
                        log::info!("Released link for stale session {}", id);
                    } else {
                        self.pending_link = Some((link_id, link));
                    }
                }
            }
            Effect::Teardown { id, outcome, error } => self.teardown(id, outcome, error),
            Effect::SchedulePlayback { pcm } => self.schedule_playback(&pcm),
            Effect::CancelPlayback => {
                if let Some(session) = self.active.as_mut() {
                    session.scheduler.cancel_all();
                }
                self.metrics.interrupted();
            }
            Effect::RecordMalformed { reason } => {
                log::warn!("Dropping inbound chunk: {}", reason);
                self.metrics.chunk_malformed(reason);
            }
            Effect::AppendTranscript { text } => {
                self.transcript.append_delta(&text);
            }
            Effect::CompleteTurn => {
                self.transcript.complete_turn();
                self.metrics.turn_completed();
            }
            Effect::ReleaseHandle { handle } => {
                if let Some(session) = self.active.as_mut() {
                    session.scheduler.on_ended(handle);
                }
            }
            Effect::Defer { event } => {
                log::debug!("Deferring {:?} until the session is active", event);
                self.deferred.push(event);
            }
            Effect::EmitStatus => self.publish_status(),
        }
    }

    fn open_session(&mut self, id: Uuid) {
        self.deferred.clear();
        self.transcript.reset();
        self.metrics.start_session(id);

        let connector = self.connector.clone();
        let events = EventSender {
            session_id: id,
            tx: self.internal_tx.clone(),
        };
        let tx = self.internal_tx.clone();

        log::info!("Opening session {}", id);
        let task = tokio::spawn(async move {
            let result = connector.open(id, events).await;
            // If the loop is gone the link is dropped (and released) here
            let _ = tx.send(Internal::Opened { id, result });
        });
        self.pending_open = Some((id, task));
    }

    fn activate(&mut self, id: Uuid) {
        let Some((link_id, link)) = self.pending_link.take() else {
            log::warn!("Activate for session {} without a link", id);
            return;
        };
        if link_id != id {
            self.pending_link = Some((link_id, link));
            return;
        }

        self.active = Some(ActiveSession {
            id,
            scheduler: PlaybackScheduler::new(link.output, self.settings.playback_sample_rate),
            transport: link.transport,
            capture: link.capture,
        });
        self.metrics.session_connected();
        log::info!("Session {} connected", id);

        let deferred = std::mem::take(&mut self.deferred);
        if !deferred.is_empty() {
            log::debug!("Replaying {} deferred events", deferred.len());
        }
        for event in deferred {
            if let Err(e) = self.dispatch(Event::Inbound { id, event }) {
                log::warn!("Deferred event rejected: {}", e);
            }
        }
    }

    /// Close transport, flush playback, release capture (in that order)
    fn teardown(&mut self, id: Uuid, outcome: SessionOutcome, error: Option<String>) {
        self.deferred.clear();
        if let Some((pending, task)) = self.pending_open.take() {
            task.abort();
            log::debug!("Aborted in-flight open for session {}", pending);
        }

        let frames = match self.active.take() {
            Some(mut session) => {
                if session.id != id {
                    log::warn!("Teardown for {} found active session {}", id, session.id);
                }
                session.transport.close();
                let cancelled = session.scheduler.cancel_all();
                let frames = (
                    session.capture.frames_captured(),
                    session.capture.frames_dropped(),
                );
                drop(session.capture);
                log::info!(
                    "Session {} torn down ({:?}), {} chunks flushed",
                    session.id,
                    outcome,
                    cancelled
                );
                frames
            }
            None => (0, 0),
        };

        self.metrics.session_ended(outcome, frames, error);
    }

    fn schedule_playback(&mut self, pcm: &[u8]) {
        let Some(session) = self.active.as_mut() else {
            return;
        };

        match session.scheduler.schedule(pcm) {
            Ok(Some(_)) => self.metrics.chunk_scheduled(),
            Ok(None) => log::debug!("Skipping empty audio chunk"),
            Err(e) => {
                let err = SessionError::from(e);
                log::warn!("Dropping inbound chunk: {}", err);
                self.metrics.chunk_malformed(err.to_string());
            }
        }
    }

    fn publish_status(&self) {
        self.status_tx.send_replace(self.status());
    }

    fn shutdown(&mut self) {
        if let Some(id) = self.phase.session_id() {
            self.teardown(id, SessionOutcome::Stopped, None);
        }
        self.phase = Phase::Idle;
        self.publish_status();
    }
}

/// Cloneable front-end handle to the session loop
#[derive(Clone)]
pub struct SessionHandle {
    control: mpsc::UnboundedSender<Control>,
    status: watch::Receiver<SessionStatus>,
}

impl SessionHandle {
    /// Begin a session. Returns once the session is connecting.
    pub async fn start(&self) -> Result<(), SessionError> {
        self.dispatch(Event::Start).await
    }

    pub async fn stop(&self) -> Result<(), SessionError> {
        self.dispatch(Event::Stop).await
    }

    pub async fn toggle(&self) -> Result<(), SessionError> {
        self.dispatch(Event::Toggle).await
    }

    /// Latest published status
    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    pub async fn metrics(&self) -> Result<MetricsSummary, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.control
            .send(Control::Metrics(reply))
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    /// Tear down any active session and stop the loop
    pub fn shutdown(&self) {
        let _ = self.control.send(Control::Shutdown);
    }

    async fn dispatch(&self, event: Event) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.control
            .send(Control::Dispatch { event, reply })
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)?
    }
}

/// Spawn the session loop on the current runtime
pub fn spawn_session<C: Connector>(
    settings: VoiceSettings,
    connector: C,
) -> (SessionHandle, JoinHandle<()>) {
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let (internal_tx, internal_rx) = mpsc::unbounded_channel();
    let (status_tx, status_rx) = watch::channel(SessionStatus::default());

    let manager = DuplexSessionManager::new(settings, connector, internal_tx, status_tx);
    let task = tokio::spawn(run_session_loop(manager, control_rx, internal_rx));

    (
        SessionHandle {
            control: control_tx,
            status: status_rx,
        },
        task,
    )
}

async fn run_session_loop<C: Connector>(
    mut manager: DuplexSessionManager<C>,
    mut control_rx: mpsc::UnboundedReceiver<Control>,
    mut internal_rx: mpsc::UnboundedReceiver<Internal>,
) {
    manager.publish_status();
    log::info!("Session loop started");

    loop {
        tokio::select! {
            control = control_rx.recv() => match control {
                Some(Control::Dispatch { event, reply }) => {
                    let result = manager.dispatch(event);
                    if let Err(e) = &result {
                        log::info!("Request rejected: {}", e);
                    }
                    let _ = reply.send(result);
                }
                Some(Control::Metrics(reply)) => {
                    let _ = reply.send(manager.metrics.get_summary());
                }
                Some(Control::Shutdown) | None => break,
            },
            Some(internal) = internal_rx.recv() => match internal {
                Internal::Event(event) => {
                    if let Err(e) = manager.dispatch(event) {
                        log::warn!("Internal event rejected: {}", e);
                    }
                }
                Internal::Opened { id, result } => manager.handle_opened(id, result),
            },
        }
    }

    manager.shutdown();
    log::info!("Session loop ended");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serializes_camel_case() {
        let status = SessionStatus {
            phase: SessionPhase::Connected,
            session_id: None,
            error: None,
            last_transcript_lines: vec!["Hello".to_string()],
            is_audio_active: true,
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["phase"], "connected");
        assert_eq!(json["lastTranscriptLines"][0], "Hello");
        assert_eq!(json["isAudioActive"], true);
        assert!(json["sessionId"].is_null());
    }

    #[test]
    fn test_event_sender_tags_session_id() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        let sender = EventSender { session_id: id, tx };

        (sender.transport_callback())(TransportEvent::TurnComplete);
        (sender.ended_callback())(HandleId(3));

        match rx.try_recv() {
            Ok(Internal::Event(Event::Inbound { id: got, event })) => {
                assert_eq!(got, id);
                assert_eq!(event, TransportEvent::TurnComplete);
            }
            _ => panic!("expected inbound event"),
        }
        match rx.try_recv() {
            Ok(Internal::Event(Event::PlaybackEnded { id: got, handle })) => {
                assert_eq!(got, id);
                assert_eq!(handle, HandleId(3));
            }
            _ => panic!("expected playback ended"),
        }
    }

    #[test]
    fn test_event_sender_survives_closed_loop() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let sender = EventSender {
            session_id: Uuid::new_v4(),
            tx,
        };
        sender.transport(TransportEvent::Closed);
    }
}
