//! Gapless playback scheduling
//!
//! Inbound audio arrives as a stream of short PCM16 chunks. Each chunk is queued on
//! the output device to start exactly where the previous one ends, or at "now" if
//! the queue has drained. Every scheduled chunk is tracked by handle so that a
//! barge-in can silence all of them at once.

use std::collections::HashMap;
use std::sync::Arc;

use super::pcm::{self, CodecError};

/// Identifies one scheduled buffer on an output device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(pub u64);

impl std::fmt::Display for HandleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A chunk that has been handed to the output device
#[derive(Debug, Clone)]
pub struct PlaybackHandle {
    pub id: HandleId,
    /// Start time on the device clock, in seconds
    pub start_time: f64,
    pub duration_secs: f64,
    /// Mono samples at the scheduler's sample rate
    pub buffer: Arc<[f32]>,
}

impl PlaybackHandle {
    pub fn end_time(&self) -> f64 {
        self.start_time + self.duration_secs
    }
}

/// An output device with a monotonic clock that plays buffers at absolute times
///
/// The device reports natural completion out of band (by `HandleId`); `stop` must
/// not report completion and must tolerate unknown or already-finished ids.
pub trait OutputDevice: Send {
    /// Current position of the device clock, in seconds
    fn current_time(&self) -> f64;

    /// Play `buffer` (mono, `sample_rate` Hz) starting at `start_time`
    fn play(&mut self, id: HandleId, buffer: Arc<[f32]>, sample_rate: u32, start_time: f64);

    /// Stop a buffer immediately
    fn stop(&mut self, id: HandleId);
}

impl<O: OutputDevice + ?Sized> OutputDevice for Box<O> {
    fn current_time(&self) -> f64 {
        (**self).current_time()
    }

    fn play(&mut self, id: HandleId, buffer: Arc<[f32]>, sample_rate: u32, start_time: f64) {
        (**self).play(id, buffer, sample_rate, start_time)
    }

    fn stop(&mut self, id: HandleId) {
        (**self).stop(id)
    }
}

/// Schedules inbound chunks back-to-back on an output device
pub struct PlaybackScheduler<O: OutputDevice> {
    device: O,
    sample_rate: u32,
    /// Where the next chunk starts, in device seconds. 0 after a cancel.
    next_start_time: f64,
    active: HashMap<HandleId, PlaybackHandle>,
    next_id: u64,
    chunks_scheduled: u64,
}

impl<O: OutputDevice> PlaybackScheduler<O> {
    /// Create a scheduler for mono PCM16 at `sample_rate` Hz
    pub fn new(device: O, sample_rate: u32) -> Self {
        Self {
            device,
            sample_rate,
            next_start_time: 0.0,
            active: HashMap::new(),
            next_id: 0,
            chunks_scheduled: 0,
        }
    }

    /// Decode a PCM16 chunk and queue it after everything already scheduled
    ///
    /// Returns `Ok(None)` for an empty payload.
    pub fn schedule(&mut self, pcm_bytes: &[u8]) -> Result<Option<PlaybackHandle>, CodecError> {
        let decoded = pcm::decode(pcm_bytes, self.sample_rate, 1)?;
        if decoded.frames() == 0 {
            return Ok(None);
        }

        let duration_secs = decoded.duration_secs();
        let buffer: Arc<[f32]> = decoded.into_mono().into();

        let start_time = self.next_start_time.max(self.device.current_time());
        self.next_id += 1;
        let id = HandleId(self.next_id);

        self.device
            .play(id, buffer.clone(), self.sample_rate, start_time);
        self.next_start_time = start_time + duration_secs;

        let handle = PlaybackHandle {
            id,
            start_time,
            duration_secs,
            buffer,
        };
        self.active.insert(id, handle.clone());
        self.chunks_scheduled += 1;

        log::debug!(
            "Playback: scheduled {} at {:.3}s for {:.3}s ({} active)",
            id,
            start_time,
            duration_secs,
            self.active.len()
        );

        Ok(Some(handle))
    }

    /// Stop everything scheduled and restart the timeline at "now"
    ///
    /// Returns how many handles were stopped.
    pub fn cancel_all(&mut self) -> usize {
        let count = self.active.len();
        for id in self.active.keys() {
            self.device.stop(*id);
        }
        self.active.clear();
        self.next_start_time = 0.0;

        if count > 0 {
            log::info!("Playback: cancelled {} scheduled chunks", count);
        }
        count
    }

    /// Natural end of a chunk. Returns false if the handle was not active.
    pub fn on_ended(&mut self, id: HandleId) -> bool {
        self.active.remove(&id).is_some()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn is_active(&self) -> bool {
        !self.active.is_empty()
    }

    pub fn next_start_time(&self) -> f64 {
        self.next_start_time
    }

    pub fn chunks_scheduled(&self) -> u64 {
        self.chunks_scheduled
    }

    pub fn device(&self) -> &O {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut O {
        &mut self.device
    }
}

impl<O: OutputDevice> std::fmt::Debug for PlaybackScheduler<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackScheduler")
            .field("sample_rate", &self.sample_rate)
            .field("next_start_time", &self.next_start_time)
            .field("active", &self.active.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct FakeClock {
        now: f64,
        played: Vec<(HandleId, f64, usize)>,
        stopped: Vec<HandleId>,
    }

    impl OutputDevice for FakeClock {
        fn current_time(&self) -> f64 {
            self.now
        }

        fn play(&mut self, id: HandleId, buffer: Arc<[f32]>, _sample_rate: u32, start_time: f64) {
            self.played.push((id, start_time, buffer.len()));
        }

        fn stop(&mut self, id: HandleId) {
            self.stopped.push(id);
        }
    }

    fn chunk(secs: f64) -> Vec<u8> {
        vec![0u8; (24000.0 * secs) as usize * 2]
    }

    fn scheduler(now: f64) -> PlaybackScheduler<FakeClock> {
        PlaybackScheduler::new(
            FakeClock {
                now,
                ..Default::default()
            },
            24000,
        )
    }

    #[test]
    fn test_chunks_play_back_to_back() {
        let mut sched = scheduler(2.0);

        let a = sched.schedule(&chunk(1.0)).unwrap().unwrap();
        let b = sched.schedule(&chunk(0.5)).unwrap().unwrap();

        assert_eq!(a.start_time, 2.0);
        assert_eq!(b.start_time, 3.0);
        assert_eq!(b.start_time, a.end_time());
        assert_eq!(sched.active_count(), 2);
        assert!((sched.next_start_time() - 3.5).abs() < 1e-9);
        assert_eq!(sched.device().played.len(), 2);
        assert_eq!(sched.device().played[0].2, 24000);
    }

    #[test]
    fn test_drained_queue_starts_at_now() {
        let mut sched = scheduler(0.0);
        sched.schedule(&chunk(0.5)).unwrap();

        // Clock moved past the end of everything queued
        sched.device_mut().now = 4.0;
        let late = sched.schedule(&chunk(0.5)).unwrap().unwrap();

        assert_eq!(late.start_time, 4.0);
    }

    #[test]
    fn test_cancel_all_stops_and_resets() {
        let mut sched = scheduler(1.0);
        let a = sched.schedule(&chunk(1.0)).unwrap().unwrap();
        let b = sched.schedule(&chunk(0.5)).unwrap().unwrap();

        assert_eq!(sched.cancel_all(), 2);

        assert_eq!(sched.active_count(), 0);
        assert_eq!(sched.next_start_time(), 0.0);
        let mut stopped = sched.device().stopped.clone();
        stopped.sort();
        assert_eq!(stopped, vec![a.id, b.id]);

        // Next chunk is relative to now, not the old timeline
        sched.device_mut().now = 1.25;
        let c = sched.schedule(&chunk(0.5)).unwrap().unwrap();
        assert_eq!(c.start_time, 1.25);
    }

    #[test]
    fn test_cancel_all_is_idempotent() {
        let mut sched = scheduler(0.0);
        sched.schedule(&chunk(0.25)).unwrap();

        assert_eq!(sched.cancel_all(), 1);
        assert_eq!(sched.cancel_all(), 0);
        assert_eq!(sched.device().stopped.len(), 1);
    }

    #[test]
    fn test_on_ended_removes_once() {
        let mut sched = scheduler(0.0);
        let a = sched.schedule(&chunk(0.25)).unwrap().unwrap();

        assert!(sched.on_ended(a.id));
        assert!(!sched.on_ended(a.id));
        assert!(!sched.is_active());
    }

    #[test]
    fn test_ended_after_cancel_is_noop() {
        let mut sched = scheduler(0.0);
        let a = sched.schedule(&chunk(0.25)).unwrap().unwrap();
        sched.cancel_all();

        assert!(!sched.on_ended(a.id));
    }

    #[test]
    fn test_empty_chunk_is_ignored() {
        let mut sched = scheduler(0.0);
        assert!(sched.schedule(&[]).unwrap().is_none());
        assert_eq!(sched.active_count(), 0);
        assert_eq!(sched.next_start_time(), 0.0);
        assert!(sched.device().played.is_empty());
    }

    #[test]
    fn test_malformed_chunk_leaves_timeline_untouched() {
        let mut sched = scheduler(0.0);
        sched.schedule(&chunk(0.5)).unwrap();

        let err = sched.schedule(&[1, 2, 3]).unwrap_err();
        assert!(matches!(err, CodecError::MalformedFrame { len: 3, .. }));
        assert_eq!(sched.active_count(), 1);
        assert!((sched.next_start_time() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_handle_ids_are_unique() {
        let mut sched = scheduler(0.0);
        let ids: Vec<HandleId> = (0..5)
            .map(|_| sched.schedule(&chunk(0.1)).unwrap().unwrap().id)
            .collect();
        let mut dedup = ids.clone();
        dedup.dedup();
        assert_eq!(ids, dedup);
        assert_eq!(sched.chunks_scheduled(), 5);
    }
}
