//! Integration tests for the session loop
//!
//! These drive `SessionHandle` end to end with a fake connector, output device,
//! transport and capture lease, so no audio hardware or API key is needed.
//!
//! ```bash
//! cargo test --test session_integration
//! ```

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use uuid::Uuid;

use duplex_voice::audio::{CaptureLease, HandleId, OutputDevice};
use duplex_voice::session::{
    spawn_session, Connector, EventSender, Link, SessionHandle, SessionPhase, SessionStatus,
};
use duplex_voice::settings::VoiceSettings;
use duplex_voice::state_machine::SessionError;
use duplex_voice::streaming::{TransportEvent, TransportHandle};

// ============================================================================
// Fakes
// ============================================================================

/// Shared observations of what the fakes were asked to do
#[derive(Default)]
struct Observed {
    now: Mutex<f64>,
    played: Mutex<Vec<(HandleId, f64)>>,
    stopped: Mutex<Vec<HandleId>>,
    transport_closed: AtomicBool,
    capture_released: AtomicBool,
    opens: AtomicUsize,
    events: Mutex<Option<EventSender>>,
}

impl Observed {
    fn events(&self) -> EventSender {
        self.events
            .lock()
            .unwrap()
            .clone()
            .expect("connector was never asked to open")
    }

    fn played(&self) -> Vec<(HandleId, f64)> {
        self.played.lock().unwrap().clone()
    }

    fn stopped(&self) -> Vec<HandleId> {
        let mut stopped = self.stopped.lock().unwrap().clone();
        stopped.sort();
        stopped
    }
}

struct FakeOutput(Arc<Observed>);

impl OutputDevice for FakeOutput {
    fn current_time(&self) -> f64 {
        *self.0.now.lock().unwrap()
    }

    fn play(&mut self, id: HandleId, _buffer: Arc<[f32]>, _sample_rate: u32, start_time: f64) {
        self.0.played.lock().unwrap().push((id, start_time));
    }

    fn stop(&mut self, id: HandleId) {
        self.0.stopped.lock().unwrap().push(id);
    }
}

struct FakeTransport(Arc<Observed>);

impl TransportHandle for FakeTransport {
    fn close(&mut self) {
        self.0.transport_closed.store(true, Ordering::SeqCst);
    }
}

struct FakeCapture(Arc<Observed>);

impl CaptureLease for FakeCapture {
    fn frames_captured(&self) -> u64 {
        42
    }

    fn frames_dropped(&self) -> u64 {
        2
    }
}

impl Drop for FakeCapture {
    fn drop(&mut self) {
        self.0.capture_released.store(true, Ordering::SeqCst);
    }
}

struct FakeConnector {
    seen: Arc<Observed>,
    /// Fail after the microphone was acquired
    fail_with: Option<SessionError>,
    /// Hold the open (with the microphone acquired) until notified
    gate: Option<Arc<Notify>>,
    /// Delivered from inside the open, before the link is returned
    early_events: Vec<TransportEvent>,
}

impl FakeConnector {
    fn new(seen: &Arc<Observed>) -> Self {
        Self {
            seen: seen.clone(),
            fail_with: None,
            gate: None,
            early_events: Vec::new(),
        }
    }
}

impl Connector for FakeConnector {
    async fn open(&self, _session_id: Uuid, events: EventSender) -> Result<Link, SessionError> {
        self.seen.opens.fetch_add(1, Ordering::SeqCst);
        self.seen.capture_released.store(false, Ordering::SeqCst);
        self.seen.transport_closed.store(false, Ordering::SeqCst);
        for event in &self.early_events {
            events.transport(event.clone());
        }
        *self.seen.events.lock().unwrap() = Some(events);

        let capture = FakeCapture(self.seen.clone());

        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if let Some(err) = &self.fail_with {
            return Err(err.clone());
        }

        Ok(Link {
            output: Box::new(FakeOutput(self.seen.clone())),
            transport: Box::new(FakeTransport(self.seen.clone())),
            capture: Box::new(capture),
        })
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Mono PCM16 at 24kHz lasting `secs`
fn pcm(secs: f64) -> Vec<u8> {
    vec![0u8; (24000.0 * secs) as usize * 2]
}

async fn wait_until(
    handle: &SessionHandle,
    what: &str,
    pred: impl FnMut(&SessionStatus) -> bool,
) -> SessionStatus {
    let mut rx = handle.subscribe();
    let status = tokio::time::timeout(Duration::from_secs(2), rx.wait_for(pred))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {}", what))
        .expect("session loop ended")
        .clone();
    status
}

async fn wait_for_phase(handle: &SessionHandle, phase: SessionPhase) -> SessionStatus {
    wait_until(handle, &format!("{:?}", phase), |s| s.phase == phase).await
}

async fn wait_for_flag(flag: &AtomicBool) {
    for _ in 0..200 {
        if flag.load(Ordering::SeqCst) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("flag never set");
}

async fn connected_session(seen: &Arc<Observed>) -> SessionHandle {
    let (handle, _task) = spawn_session(VoiceSettings::default(), FakeConnector::new(seen));
    handle.start().await.unwrap();
    wait_for_phase(&handle, SessionPhase::Connected).await;
    handle
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn start_connects_and_second_start_is_rejected() {
    let seen = Arc::new(Observed::default());
    let handle = connected_session(&seen).await;

    let before = handle.status();
    assert!(before.session_id.is_some());

    assert_eq!(handle.start().await, Err(SessionError::AlreadyActive));
    assert_eq!(handle.status(), before);
    assert_eq!(seen.opens.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn start_while_connecting_is_rejected() {
    let seen = Arc::new(Observed::default());
    let gate = Arc::new(Notify::new());
    let connector = FakeConnector {
        gate: Some(gate.clone()),
        ..FakeConnector::new(&seen)
    };
    let (handle, _task) = spawn_session(VoiceSettings::default(), connector);

    handle.start().await.unwrap();
    assert_eq!(handle.status().phase, SessionPhase::Connecting);
    assert_eq!(handle.start().await, Err(SessionError::AlreadyActive));

    gate.notify_one();
    wait_for_phase(&handle, SessionPhase::Connected).await;
}

#[tokio::test]
async fn audio_chunks_play_back_to_back() {
    let seen = Arc::new(Observed::default());
    let handle = connected_session(&seen).await;
    *seen.now.lock().unwrap() = 1.5;

    let events = seen.events();
    events.transport(TransportEvent::AudioDelta(pcm(1.0)));
    events.transport(TransportEvent::AudioDelta(pcm(0.5)));
    events.transport(TransportEvent::TranscriptDelta("done".to_string()));
    wait_until(&handle, "transcript", |s| !s.last_transcript_lines.is_empty()).await;

    let played = seen.played();
    assert_eq!(played.len(), 2);
    assert_eq!(played[0].1, 1.5);
    assert_eq!(played[1].1, 2.5);
    assert!(handle.status().is_audio_active);
}

#[tokio::test]
async fn interrupted_flushes_playback_but_keeps_session() {
    let seen = Arc::new(Observed::default());
    let handle = connected_session(&seen).await;

    let events = seen.events();
    events.transport(TransportEvent::AudioDelta(pcm(1.0)));
    events.transport(TransportEvent::AudioDelta(pcm(0.5)));
    wait_until(&handle, "audio", |s| s.is_audio_active).await;

    events.transport(TransportEvent::Interrupted);
    let status = wait_until(&handle, "flush", |s| !s.is_audio_active).await;

    assert_eq!(status.phase, SessionPhase::Connected);
    let scheduled: Vec<HandleId> = seen.played().into_iter().map(|(id, _)| id).collect();
    assert_eq!(seen.stopped(), scheduled);

    // The next chunk starts from "now", not from the old timeline
    *seen.now.lock().unwrap() = 0.25;
    events.transport(TransportEvent::AudioDelta(pcm(0.5)));
    wait_until(&handle, "audio", |s| s.is_audio_active).await;
    assert_eq!(seen.played()[2].1, 0.25);
    assert!(!seen.capture_released.load(Ordering::SeqCst));
}

#[tokio::test]
async fn natural_end_releases_handles() {
    let seen = Arc::new(Observed::default());
    let handle = connected_session(&seen).await;

    let events = seen.events();
    events.transport(TransportEvent::AudioDelta(pcm(0.1)));
    wait_until(&handle, "audio", |s| s.is_audio_active).await;

    let (id, _) = seen.played()[0];
    events.playback_ended(id);
    // Repeated completion is harmless
    events.playback_ended(id);
    wait_until(&handle, "ended", |s| !s.is_audio_active).await;
    assert!(seen.stopped().is_empty());
}

#[tokio::test]
async fn transcript_rolls_and_turns_complete() {
    let seen = Arc::new(Observed::default());
    let handle = connected_session(&seen).await;

    let events = seen.events();
    for i in 0..10 {
        events.transport(TransportEvent::TranscriptDelta(format!("w{} ", i)));
    }
    let status = wait_until(&handle, "ten deltas", |s| {
        s.last_transcript_lines.last().map(String::as_str)
            == Some("w0 w1 w2 w3 w4 w5 w6 w7 w8 w9 ")
    })
    .await;
    assert_eq!(status.last_transcript_lines.len(), 5);

    events.transport(TransportEvent::TurnComplete);
    events.transport(TransportEvent::TranscriptDelta("Next".to_string()));
    let status = wait_until(&handle, "next turn", |s| {
        s.last_transcript_lines.last().map(String::as_str) == Some("Next")
    })
    .await;
    assert_eq!(status.last_transcript_lines.len(), 5);
}

#[tokio::test]
async fn transport_close_returns_to_idle_and_releases() {
    let seen = Arc::new(Observed::default());
    let handle = connected_session(&seen).await;

    let events = seen.events();
    events.transport(TransportEvent::AudioDelta(pcm(1.0)));
    events.transport(TransportEvent::AudioDelta(pcm(1.0)));
    events.transport(TransportEvent::Closed);

    let status = wait_for_phase(&handle, SessionPhase::Idle).await;
    assert!(status.session_id.is_none());
    assert!(!status.is_audio_active);
    assert!(seen.capture_released.load(Ordering::SeqCst));
    assert!(seen.transport_closed.load(Ordering::SeqCst));
    assert_eq!(seen.stopped().len(), 2);

    let summary = handle.metrics().await.unwrap();
    assert_eq!(summary.total_sessions, 1);
    assert_eq!(summary.total_chunks_scheduled, 2);
    assert_eq!(summary.total_frames_dropped, 2);
}

#[tokio::test]
async fn transport_error_enters_error_phase() {
    let seen = Arc::new(Observed::default());
    let handle = connected_session(&seen).await;

    seen
        .events()
        .transport(TransportEvent::Error("connection reset".to_string()));

    let status = wait_for_phase(&handle, SessionPhase::Error).await;
    assert_eq!(status.error.as_deref(), Some("connection reset"));
    assert!(seen.capture_released.load(Ordering::SeqCst));
    assert!(seen.transport_closed.load(Ordering::SeqCst));

    // Stop clears the error
    handle.stop().await.unwrap();
    assert_eq!(
        wait_for_phase(&handle, SessionPhase::Idle).await.error,
        None
    );
}

#[tokio::test]
async fn open_failure_releases_devices() {
    let seen = Arc::new(Observed::default());
    let connector = FakeConnector {
        fail_with: Some(SessionError::TransportError("handshake refused".to_string())),
        ..FakeConnector::new(&seen)
    };
    let (handle, _task) = spawn_session(VoiceSettings::default(), connector);

    handle.toggle().await.unwrap();
    let status = wait_for_phase(&handle, SessionPhase::Error).await;

    assert!(status.error.unwrap().contains("handshake refused"));
    assert!(seen.capture_released.load(Ordering::SeqCst));

    let summary = handle.metrics().await.unwrap();
    assert_eq!(summary.failed_sessions, 1);
}

#[tokio::test]
async fn stop_during_connect_releases_the_pending_open() {
    let seen = Arc::new(Observed::default());
    let gate = Arc::new(Notify::new());
    let connector = FakeConnector {
        gate: Some(gate.clone()),
        ..FakeConnector::new(&seen)
    };
    let (handle, _task) = spawn_session(VoiceSettings::default(), connector);

    handle.start().await.unwrap();
    // Let the open task run far enough to hold the microphone
    for _ in 0..200 {
        if seen.opens.load(Ordering::SeqCst) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(seen.opens.load(Ordering::SeqCst), 1);
    handle.stop().await.unwrap();
    assert_eq!(handle.status().phase, SessionPhase::Idle);

    gate.notify_one();
    wait_for_flag(&seen.capture_released).await;
    assert_eq!(handle.status().phase, SessionPhase::Idle);
}

#[tokio::test]
async fn stale_session_events_are_ignored() {
    let seen = Arc::new(Observed::default());
    let handle = connected_session(&seen).await;
    let stale = seen.events();

    handle.stop().await.unwrap();
    handle.start().await.unwrap();
    wait_for_phase(&handle, SessionPhase::Connected).await;
    let current = seen.events();
    assert_ne!(stale.session_id(), current.session_id());

    stale.transport(TransportEvent::AudioDelta(pcm(0.5)));
    stale.transport(TransportEvent::Closed);
    current.transport(TransportEvent::TranscriptDelta("fresh".to_string()));
    wait_until(&handle, "fresh transcript", |s| {
        s.last_transcript_lines.last().map(String::as_str) == Some("fresh")
    })
    .await;

    assert_eq!(handle.status().phase, SessionPhase::Connected);
    assert!(seen.played().is_empty());
}

#[tokio::test]
async fn malformed_chunk_is_dropped_and_counted() {
    let seen = Arc::new(Observed::default());
    let handle = connected_session(&seen).await;

    let events = seen.events();
    events.transport(TransportEvent::AudioDelta(vec![1, 2, 3]));
    events.transport(TransportEvent::TranscriptDelta("still here".to_string()));
    wait_until(&handle, "transcript", |s| !s.last_transcript_lines.is_empty()).await;

    assert_eq!(handle.status().phase, SessionPhase::Connected);
    let summary = handle.metrics().await.unwrap();
    assert_eq!(summary.current_session.unwrap().chunks_malformed, 1);
    assert_eq!(summary.last_error.unwrap().error_type, "codec");
}

#[tokio::test]
async fn undecodable_audio_part_is_counted() {
    let seen = Arc::new(Observed::default());
    let handle = connected_session(&seen).await;

    let events = seen.events();
    events.transport(TransportEvent::MalformedAudio("invalid base64".to_string()));
    events.transport(TransportEvent::TranscriptDelta("ok".to_string()));
    wait_until(&handle, "transcript", |s| !s.last_transcript_lines.is_empty()).await;

    assert_eq!(handle.status().phase, SessionPhase::Connected);
    let summary = handle.metrics().await.unwrap();
    assert_eq!(summary.current_session.unwrap().chunks_malformed, 1);
    assert!(seen.played().is_empty());
}

#[tokio::test]
async fn shutdown_tears_down_active_session() {
    let seen = Arc::new(Observed::default());
    let (handle, task) = spawn_session(VoiceSettings::default(), FakeConnector::new(&seen));
    handle.start().await.unwrap();
    wait_for_phase(&handle, SessionPhase::Connected).await;

    handle.shutdown();
    task.await.unwrap();

    assert!(seen.capture_released.load(Ordering::SeqCst));
    assert!(seen.transport_closed.load(Ordering::SeqCst));
    assert_eq!(handle.start().await, Err(SessionError::Closed));
}

#[tokio::test]
async fn close_during_open_returns_to_idle_and_releases() {
    let seen = Arc::new(Observed::default());
    let connector = FakeConnector {
        early_events: vec![TransportEvent::Closed],
        ..FakeConnector::new(&seen)
    };
    let (handle, _task) = spawn_session(VoiceSettings::default(), connector);

    handle.start().await.unwrap();
    wait_for_flag(&seen.capture_released).await;

    // Give the late open result time to arrive and be released
    tokio::time::sleep(Duration::from_millis(50)).await;
    let status = handle.status();
    assert_eq!(status.phase, SessionPhase::Idle);
    assert!(status.session_id.is_none());

    let summary = handle.metrics().await.unwrap();
    assert!(summary.current_session.is_none());
}

#[tokio::test]
async fn error_during_open_enters_error_phase() {
    let seen = Arc::new(Observed::default());
    let connector = FakeConnector {
        early_events: vec![TransportEvent::Error("server went away".to_string())],
        ..FakeConnector::new(&seen)
    };
    let (handle, _task) = spawn_session(VoiceSettings::default(), connector);

    handle.start().await.unwrap();
    let status = wait_for_phase(&handle, SessionPhase::Error).await;
    assert_eq!(status.error.as_deref(), Some("server went away"));
    wait_for_flag(&seen.capture_released).await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(handle.status().phase, SessionPhase::Error);
}

#[tokio::test]
async fn events_during_open_are_replayed_once_connected() {
    let seen = Arc::new(Observed::default());
    let connector = FakeConnector {
        early_events: vec![
            TransportEvent::TranscriptDelta("early".to_string()),
            TransportEvent::AudioDelta(pcm(0.5)),
        ],
        ..FakeConnector::new(&seen)
    };
    let (handle, _task) = spawn_session(VoiceSettings::default(), connector);

    handle.start().await.unwrap();
    let status = wait_until(&handle, "replayed transcript", |s| {
        s.phase == SessionPhase::Connected
            && s.last_transcript_lines.last().map(String::as_str) == Some("early")
    })
    .await;

    assert!(status.is_audio_active);
    assert_eq!(seen.played().len(), 1);
    assert!(!seen.capture_released.load(Ordering::SeqCst));
}
