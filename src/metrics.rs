//! Metrics collection for voice sessions
//!
//! Tracks per-session counters and error history for diagnostics. The session
//! loop owns the collector; front ends read it through `SessionHandle::metrics`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Instant;
use uuid::Uuid;

/// Maximum number of finished sessions to retain in history
const MAX_SESSION_HISTORY: usize = 50;

/// Maximum number of errors to retain in history
const MAX_ERROR_HISTORY: usize = 20;

/// How a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionOutcome {
    /// Still running (only seen in snapshots of the current session)
    Active,
    /// Stopped by the user
    Stopped,
    /// Closed by the remote side
    Closed,
    /// Ended by a transport error
    Failed,
    /// Never reached the connected phase
    OpenFailed,
}

/// Metrics for one voice session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetrics {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// Time from start to the transport being ready
    pub connect_ms: Option<u64>,
    pub frames_captured: u64,
    pub frames_dropped: u64,
    pub chunks_scheduled: u64,
    pub chunks_malformed: u64,
    pub interruptions: u64,
    pub turns: u64,
    pub outcome: SessionOutcome,
    pub error_message: Option<String>,
}

/// Summary statistics across all recorded sessions
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSummary {
    pub total_sessions: u64,
    pub failed_sessions: u64,
    /// Average duration (ms) of sessions that reached the connected phase
    pub avg_session_duration_ms: u64,
    /// Average time (ms) to open a session
    pub avg_connect_ms: u64,
    pub total_chunks_scheduled: u64,
    pub total_chunks_malformed: u64,
    pub total_frames_dropped: u64,
    pub total_interruptions: u64,
    pub current_session: Option<SessionMetrics>,
    /// Most recent error, if any
    pub last_error: Option<ErrorRecord>,
}

/// Record of an error that occurred during operation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    pub timestamp: DateTime<Utc>,
    /// Category of error (e.g., "device", "transport", "codec")
    pub error_type: String,
    pub message: String,
    pub session_id: Option<String>,
}

/// Internal state for the session in progress
struct SessionInProgress {
    session_id: Uuid,
    started_at: Instant,
    started_at_utc: DateTime<Utc>,
    connect_ms: Option<u64>,
    chunks_scheduled: u64,
    chunks_malformed: u64,
    interruptions: u64,
    turns: u64,
}

impl SessionInProgress {
    fn new(session_id: Uuid) -> Self {
        Self {
            session_id,
            started_at: Instant::now(),
            started_at_utc: Utc::now(),
            connect_ms: None,
            chunks_scheduled: 0,
            chunks_malformed: 0,
            interruptions: 0,
            turns: 0,
        }
    }

    fn to_metrics(
        &self,
        outcome: SessionOutcome,
        frames: (u64, u64),
        error_message: Option<String>,
    ) -> SessionMetrics {
        SessionMetrics {
            session_id: self.session_id.to_string(),
            started_at: self.started_at_utc,
            duration_ms: self.started_at.elapsed().as_millis() as u64,
            connect_ms: self.connect_ms,
            frames_captured: frames.0,
            frames_dropped: frames.1,
            chunks_scheduled: self.chunks_scheduled,
            chunks_malformed: self.chunks_malformed,
            interruptions: self.interruptions,
            turns: self.turns,
            outcome,
            error_message,
        }
    }
}

/// Collects and stores metrics for voice sessions
pub struct MetricsCollector {
    /// History of finished sessions (newest first)
    history: VecDeque<SessionMetrics>,
    /// History of errors (newest first)
    errors: VecDeque<ErrorRecord>,
    current: Option<SessionInProgress>,
    total_sessions: u64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            history: VecDeque::with_capacity(MAX_SESSION_HISTORY),
            errors: VecDeque::with_capacity(MAX_ERROR_HISTORY),
            current: None,
            total_sessions: 0,
        }
    }

    /// Start tracking a new session
    ///
    /// A session still in progress is recorded as failed first.
    pub fn start_session(&mut self, session_id: Uuid) {
        if let Some(old) = self.current.take() {
            log::warn!(
                "Metrics: discarding in-progress session {} to start {}",
                old.session_id,
                session_id
            );
            let metrics = old.to_metrics(
                SessionOutcome::Failed,
                (0, 0),
                Some("Discarded: new session started".to_string()),
            );
            self.add_to_history(metrics);
        }

        log::debug!("Metrics: starting session {}", session_id);
        self.current = Some(SessionInProgress::new(session_id));
        self.total_sessions += 1;
    }

    /// The transport is open and capture is streaming
    pub fn session_connected(&mut self) {
        if let Some(ref mut session) = self.current {
            let elapsed = session.started_at.elapsed().as_millis() as u64;
            session.connect_ms = Some(elapsed);
            log::info!(
                "Metrics: session {} connected in {}ms",
                session.session_id,
                elapsed
            );
        }
    }

    pub fn chunk_scheduled(&mut self) {
        if let Some(ref mut session) = self.current {
            session.chunks_scheduled += 1;
        }
    }

    pub fn chunk_malformed(&mut self, message: String) {
        let session_id = self.current.as_mut().map(|s| {
            s.chunks_malformed += 1;
            s.session_id.to_string()
        });
        self.record_error("codec".to_string(), message, session_id);
    }

    pub fn interrupted(&mut self) {
        if let Some(ref mut session) = self.current {
            session.interruptions += 1;
        }
    }

    pub fn turn_completed(&mut self) {
        if let Some(ref mut session) = self.current {
            session.turns += 1;
        }
    }

    /// Finish the current session
    ///
    /// `frames` is (captured, dropped) as reported by the capture device.
    pub fn session_ended(
        &mut self,
        outcome: SessionOutcome,
        frames: (u64, u64),
        error: Option<String>,
    ) {
        let Some(session) = self.current.take() else {
            return;
        };

        let metrics = session.to_metrics(outcome, frames, error.clone());
        log::info!(
            "Metrics: session {} ended ({:?}) after {}ms - {} frames sent, {} dropped, {} chunks, {} interruptions",
            metrics.session_id,
            outcome,
            metrics.duration_ms,
            metrics.frames_captured.saturating_sub(metrics.frames_dropped),
            metrics.frames_dropped,
            metrics.chunks_scheduled,
            metrics.interruptions
        );
        let session_id = Some(metrics.session_id.clone());
        self.add_to_history(metrics);

        if let Some(message) = error {
            let error_type = match outcome {
                SessionOutcome::OpenFailed => "open",
                _ => "transport",
            };
            self.record_error(error_type.to_string(), message, session_id);
        }
    }

    /// Record an error (not necessarily tied to a session)
    pub fn record_error(
        &mut self,
        error_type: String,
        message: String,
        session_id: Option<String>,
    ) {
        let error = ErrorRecord {
            timestamp: Utc::now(),
            error_type,
            message,
            session_id,
        };

        log::debug!("Metrics: recording error - {:?}", error);

        self.errors.push_front(error);
        while self.errors.len() > MAX_ERROR_HISTORY {
            self.errors.pop_back();
        }
    }

    /// Get summary statistics
    pub fn get_summary(&self) -> MetricsSummary {
        let connected: Vec<_> = self
            .history
            .iter()
            .filter(|s| s.connect_ms.is_some())
            .collect();
        let count = connected.len() as u64;

        let (avg_duration, avg_connect) = if count > 0 {
            let sum_duration: u64 = connected.iter().map(|s| s.duration_ms).sum();
            let sum_connect: u64 = connected.iter().filter_map(|s| s.connect_ms).sum();
            (sum_duration / count, sum_connect / count)
        } else {
            (0, 0)
        };

        let failed = self
            .history
            .iter()
            .filter(|s| matches!(s.outcome, SessionOutcome::Failed | SessionOutcome::OpenFailed))
            .count() as u64;

        MetricsSummary {
            total_sessions: self.total_sessions,
            failed_sessions: failed,
            avg_session_duration_ms: avg_duration,
            avg_connect_ms: avg_connect,
            total_chunks_scheduled: self.history.iter().map(|s| s.chunks_scheduled).sum(),
            total_chunks_malformed: self.history.iter().map(|s| s.chunks_malformed).sum(),
            total_frames_dropped: self.history.iter().map(|s| s.frames_dropped).sum(),
            total_interruptions: self.history.iter().map(|s| s.interruptions).sum(),
            current_session: self
                .current
                .as_ref()
                .map(|s| s.to_metrics(SessionOutcome::Active, (0, 0), None)),
            last_error: self.errors.front().cloned(),
        }
    }

    /// Get the session history (newest first)
    pub fn get_history(&self) -> Vec<SessionMetrics> {
        self.history.iter().cloned().collect()
    }

    /// Get the error history (newest first)
    pub fn get_errors(&self) -> Vec<ErrorRecord> {
        self.errors.iter().cloned().collect()
    }

    pub fn is_active_session(&self, session_id: Uuid) -> bool {
        self.current
            .as_ref()
            .map(|s| s.session_id == session_id)
            .unwrap_or(false)
    }

    fn add_to_history(&mut self, metrics: SessionMetrics) {
        self.history.push_front(metrics);
        while self.history.len() > MAX_SESSION_HISTORY {
            self.history.pop_back();
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
