//! Microphone capture encoder
//!
//! Opens the default input device, turns every driver callback into fixed-size
//! PCM16 frames and hands each frame to the session's outbound queue.
//!
//! # Architecture
//!
//! ```text
//! Capture Thread (owns cpal Stream)          Tokio Runtime
//! ┌──────────────────────────────┐           ┌─────────────────────┐
//! │ CPAL callback                │           │ transport writer    │
//! │   ├─ to f32, downmix, 16kHz  │──try_send─▶  (bounded queue)   │
//! │   └─ FrameAssembler (4096)   │           └─────────────────────┘
//! └──────────────────────────────┘
//! ```
//!
//! Frames are never buffered beyond the bounded queue: when the transport is not
//! keeping up, the frame is dropped and capture continues.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample, Stream, StreamConfig};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};

use super::pcm;
use super::resample::{downmix, resample};
use super::AudioError;

/// One outbound frame of captured audio
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    /// PCM16 mono samples
    pub samples: Vec<i16>,
    pub sample_rate_hz: u32,
}

impl AudioFrame {
    /// Raw little-endian PCM16 payload
    pub fn to_le_bytes(&self) -> Vec<u8> {
        pcm::to_le_bytes(&self.samples)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Duration of this frame in milliseconds
    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate_hz == 0 {
            return 0;
        }
        (self.samples.len() as u64 * 1000) / self.sample_rate_hz as u64
    }
}

/// Capture format negotiated at session start
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConfig {
    /// Wire sample rate (16000)
    pub sample_rate: u32,
    /// Samples per emitted frame (4096)
    pub frame_size: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            frame_size: 4096,
        }
    }
}

/// Accumulates resampled audio and cuts it into fixed-size frames
#[derive(Debug)]
pub struct FrameAssembler {
    pending: Vec<f32>,
    frame_size: usize,
    sample_rate: u32,
}

impl FrameAssembler {
    pub fn new(config: CaptureConfig) -> Self {
        Self {
            pending: Vec::with_capacity(config.frame_size * 2),
            frame_size: config.frame_size.max(1),
            sample_rate: config.sample_rate,
        }
    }

    /// Append samples, returning every frame that is now complete
    pub fn push(&mut self, samples: &[f32]) -> Vec<AudioFrame> {
        self.pending.extend_from_slice(samples);

        let mut frames = Vec::new();
        while self.pending.len() >= self.frame_size {
            let chunk: Vec<f32> = self.pending.drain(..self.frame_size).collect();
            frames.push(AudioFrame {
                samples: pcm::quantize(&chunk),
                sample_rate_hz: self.sample_rate,
            });
        }
        frames
    }

    /// Samples waiting for a full frame
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

/// Frame counters shared between the audio thread and the session
#[derive(Debug, Default)]
pub struct CaptureStats {
    produced: AtomicU64,
    dropped: AtomicU64,
}

impl CaptureStats {
    pub fn produced(&self) -> u64 {
        self.produced.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Frames that actually reached the outbound queue
    pub fn sent(&self) -> u64 {
        self.produced().saturating_sub(self.dropped())
    }
}

/// Hands frames to the single outbound consumer, dropping when it is not ready
#[derive(Debug, Clone)]
pub struct FrameSink {
    tx: mpsc::Sender<AudioFrame>,
    stats: Arc<CaptureStats>,
}

impl FrameSink {
    pub fn new(tx: mpsc::Sender<AudioFrame>, stats: Arc<CaptureStats>) -> Self {
        Self { tx, stats }
    }

    /// Offer a frame to the queue. Returns false if it was dropped.
    pub fn offer(&self, frame: AudioFrame) -> bool {
        self.stats.produced.fetch_add(1, Ordering::Relaxed);

        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                let dropped = self.stats.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped % 50 == 1 {
                    log::debug!(
                        "Capture: outbound queue full, {} frames dropped so far",
                        dropped
                    );
                }
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }
}

/// Per-callback processing that runs on the audio thread
struct CapturePipeline {
    assembler: FrameAssembler,
    device_rate: u32,
    device_channels: usize,
    sink: FrameSink,
    armed: Arc<AtomicBool>,
}

impl CapturePipeline {
    fn process(&mut self, interleaved: &[f32]) {
        if !self.armed.load(Ordering::Acquire) {
            self.assembler.clear();
            return;
        }

        let mono = downmix(interleaved, self.device_channels);
        let resampled = resample(&mono, self.device_rate, self.assembler.sample_rate());
        for frame in self.assembler.push(&resampled) {
            self.sink.offer(frame);
        }
    }
}

/// A held capture device. Dropping the lease releases the device.
pub trait CaptureLease: Send {
    /// Frames produced by the encoder
    fn frames_captured(&self) -> u64;
    /// Frames dropped because the transport was not ready
    fn frames_dropped(&self) -> u64;
}

enum Control {
    Start(oneshot::Sender<Result<(), AudioError>>),
    Stop,
}

/// Exclusive handle to the microphone for one session
///
/// The cpal stream lives on a dedicated thread because streams are not `Send` on
/// every platform; this handle talks to it over a channel.
pub struct CaptureDevice {
    control: std_mpsc::Sender<Control>,
    thread: Option<JoinHandle<()>>,
    stats: Arc<CaptureStats>,
    device_name: String,
}

impl CaptureDevice {
    /// Open the default input device. Capture stays disarmed until `start()`.
    pub async fn acquire(
        config: CaptureConfig,
        frames: mpsc::Sender<AudioFrame>,
    ) -> Result<Self, AudioError> {
        let stats = Arc::new(CaptureStats::default());
        let sink = FrameSink::new(frames, stats.clone());
        let (ready_tx, ready_rx) = oneshot::channel();
        let (control_tx, control_rx) = std_mpsc::channel();

        let thread = std::thread::Builder::new()
            .name("voice-capture".to_string())
            .spawn(move || run_capture_thread(config, sink, ready_tx, control_rx))
            .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))?;

        let device_name = ready_rx.await.map_err(|_| AudioError::DeviceThreadExited)??;

        Ok(Self {
            control: control_tx,
            thread: Some(thread),
            stats,
            device_name,
        })
    }

    /// Start delivering frames to the outbound queue
    pub async fn start(&self) -> Result<(), AudioError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.control
            .send(Control::Start(reply_tx))
            .map_err(|_| AudioError::DeviceThreadExited)?;
        reply_rx.await.map_err(|_| AudioError::DeviceThreadExited)?
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn stats(&self) -> Arc<CaptureStats> {
        self.stats.clone()
    }
}

impl CaptureLease for CaptureDevice {
    fn frames_captured(&self) -> u64 {
        self.stats.produced()
    }

    fn frames_dropped(&self) -> u64 {
        self.stats.dropped()
    }
}

impl Drop for CaptureDevice {
    fn drop(&mut self) {
        let _ = self.control.send(Control::Stop);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::warn!("Capture thread panicked during release");
            }
        }
        log::info!(
            "Capture released: {} frames produced, {} dropped",
            self.stats.produced(),
            self.stats.dropped()
        );
    }
}

fn run_capture_thread(
    config: CaptureConfig,
    sink: FrameSink,
    ready_tx: oneshot::Sender<Result<String, AudioError>>,
    control_rx: std_mpsc::Receiver<Control>,
) {
    let armed = Arc::new(AtomicBool::new(false));

    let stream = match open_input_stream(config, sink, armed.clone()) {
        Ok((stream, name)) => {
            let _ = ready_tx.send(Ok(name));
            stream
        }
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    // Exits on Stop or when the owning handle is gone
    while let Ok(cmd) = control_rx.recv() {
        match cmd {
            Control::Start(reply) => {
                let result = stream
                    .play()
                    .map_err(|e| AudioError::StreamStartFailed(e.to_string()));
                if result.is_ok() {
                    armed.store(true, Ordering::Release);
                    log::info!("Capture started");
                }
                let _ = reply.send(result);
            }
            Control::Stop => break,
        }
    }

    armed.store(false, Ordering::Release);
    drop(stream);
}

fn open_input_stream(
    config: CaptureConfig,
    sink: FrameSink,
    armed: Arc<AtomicBool>,
) -> Result<(Stream, String), AudioError> {
    let host = cpal::default_host();

    let device = host
        .default_input_device()
        .ok_or(AudioError::NoInputDevice)?;
    let name = device.name().unwrap_or_else(|_| "unknown".to_string());

    let supported_config = device
        .default_input_config()
        .map_err(|_| AudioError::NoSupportedConfig)?;

    log::info!(
        "Capture device {:?}: {} Hz, {} channels, {:?} -> {} Hz mono, {} sample frames",
        name,
        supported_config.sample_rate().0,
        supported_config.channels(),
        supported_config.sample_format(),
        config.sample_rate,
        config.frame_size
    );

    let sample_format = supported_config.sample_format();
    let stream_config: StreamConfig = supported_config.into();

    let pipeline = CapturePipeline {
        assembler: FrameAssembler::new(config),
        device_rate: stream_config.sample_rate.0,
        device_channels: stream_config.channels as usize,
        sink,
        armed,
    };

    let stream = match sample_format {
        SampleFormat::I16 => build_input_typed::<i16>(&device, &stream_config, pipeline),
        SampleFormat::U16 => build_input_typed::<u16>(&device, &stream_config, pipeline),
        SampleFormat::F32 => build_input_typed::<f32>(&device, &stream_config, pipeline),
        _ => Err(AudioError::NoSupportedConfig),
    }?;

    Ok((stream, name))
}

fn build_input_typed<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut pipeline: CapturePipeline,
) -> Result<Stream, AudioError>
where
    T: SizedSample + Send + 'static,
    f32: FromSample<T>,
{
    let mut scratch: Vec<f32> = Vec::new();

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                scratch.clear();
                scratch.extend(data.iter().map(|&s| f32::from_sample(s)));
                pipeline.process(&scratch);
            },
            |err: cpal::StreamError| log::error!("Capture stream error: {}", err),
            None,
        )
        .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))
}
