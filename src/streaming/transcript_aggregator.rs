//! Transcript aggregation for the model's spoken output
//!
//! Aggregates output-transcription deltas into a per-turn accumulator and keeps
//! a short rolling view of snapshots for display.
//!
//! # Aggregation Strategy
//!
//! - **Deltas**: Appended to the accumulator; each one pushes a snapshot of the
//!   accumulator onto the rolling view (bounded, oldest dropped first)
//! - **Turn complete**: Clears the accumulator; the view keeps its lines
//!
//! Within a turn, consecutive snapshots are therefore prefix-extensions of each
//! other, so a front end can render the last line as "what is being said now".

use std::collections::VecDeque;

/// Default number of snapshots kept in the rolling view
pub const DEFAULT_TRANSCRIPT_LINES: usize = 5;

/// Aggregates transcript deltas into a bounded rolling view
#[derive(Debug, Clone)]
pub struct TranscriptAggregator {
    /// Text of the turn in progress
    current: String,
    /// Most recent snapshots, oldest first
    lines: VecDeque<String>,
    max_lines: usize,
    /// Count of delta events processed
    delta_count: u64,
    turn_count: u64,
}

impl Default for TranscriptAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_TRANSCRIPT_LINES)
    }
}

impl TranscriptAggregator {
    /// Create an empty aggregator keeping at most `max_lines` snapshots
    pub fn new(max_lines: usize) -> Self {
        let max_lines = max_lines.max(1);
        Self {
            current: String::new(),
            lines: VecDeque::with_capacity(max_lines),
            max_lines,
            delta_count: 0,
            turn_count: 0,
        }
    }

    /// Process an incoming transcript delta
    ///
    /// Appends the delta to the turn accumulator and records a snapshot.
    /// Returns the accumulated text of the current turn.
    pub fn append_delta(&mut self, delta: &str) -> &str {
        if delta.is_empty() {
            return &self.current;
        }

        self.current.push_str(delta);
        self.delta_count += 1;

        if self.lines.len() == self.max_lines {
            self.lines.pop_front();
        }
        self.lines.push_back(self.current.clone());

        if self.delta_count % 10 == 0 {
            log::debug!(
                "TranscriptAggregator: {} deltas, {} chars in current turn",
                self.delta_count,
                self.current.len()
            );
        }
        &self.current
    }

    /// End the current turn
    pub fn complete_turn(&mut self) {
        if !self.current.is_empty() {
            log::info!(
                "TranscriptAggregator: turn complete with {} chars",
                self.current.len()
            );
        }
        self.current.clear();
        self.turn_count += 1;
    }

    /// Text of the turn in progress
    pub fn current_text(&self) -> &str {
        &self.current
    }

    /// Rolling view, oldest first
    pub fn lines(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }

    /// Most recent snapshot, if any
    pub fn last_line(&self) -> Option<&str> {
        self.lines.back().map(String::as_str)
    }

    pub fn has_text(&self) -> bool {
        !self.current.is_empty()
    }

    /// Get count of deltas processed
    pub fn delta_count(&self) -> u64 {
        self.delta_count
    }

    pub fn turn_count(&self) -> u64 {
        self.turn_count
    }

    /// Reset the aggregator for a new session
    pub fn reset(&mut self) {
        self.current.clear();
        self.lines.clear();
        self.delta_count = 0;
        self.turn_count = 0;
    }
}
