//! CPAL output device with a sample-accurate clock
//!
//! The device clock is the number of frames the driver has pulled, so scheduled
//! start times line up with what is actually heard. Buffers registered with a start
//! time are mixed in at that frame; when one finishes, its id is reported through
//! the `on_ended` callback from the audio thread.

use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample, Stream, StreamConfig};
use tokio::sync::oneshot;

use super::playback::{HandleId, OutputDevice};
use super::resample::resample_to_len;
use super::AudioError;

/// Callback invoked on the audio thread when a buffer finishes naturally
pub type EndedCallback = Arc<dyn Fn(HandleId) + Send + Sync>;

struct Voice {
    id: HandleId,
    samples: Arc<[f32]>,
    start_frame: u64,
}

impl Voice {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

/// Mixes scheduled mono buffers into an interleaved output block
pub struct Mixer {
    sample_rate: u32,
    channels: usize,
    frames_rendered: u64,
    voices: Vec<Voice>,
}

impl Mixer {
    pub fn new(sample_rate: u32, channels: usize) -> Self {
        Self {
            sample_rate,
            channels: channels.max(1),
            frames_rendered: 0,
            voices: Vec::new(),
        }
    }

    /// Device clock in seconds
    pub fn now_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames_rendered as f64 / self.sample_rate as f64
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Frame range `[start, end)` covered by audio scheduled at `start_secs` for
    /// `duration_secs`. Both ends round the same way, so a chunk scheduled at the
    /// previous chunk's end time starts on the previous span's end frame.
    pub fn frame_span(sample_rate: u32, start_secs: f64, duration_secs: f64) -> (u64, u64) {
        let to_frame = |secs: f64| (secs * sample_rate as f64).round().max(0.0) as u64;
        let start = to_frame(start_secs);
        (start, to_frame(start_secs + duration_secs).max(start))
    }

    /// Register a buffer (already at the device rate). Start times in the past
    /// are pulled forward to the next rendered frame.
    pub fn add(&mut self, id: HandleId, samples: Arc<[f32]>, start_secs: f64) {
        let (start_frame, _) = Self::frame_span(self.sample_rate, start_secs, 0.0);
        self.add_at(id, samples, start_frame);
    }

    /// Register a buffer at an absolute frame
    pub fn add_at(&mut self, id: HandleId, samples: Arc<[f32]>, start_frame: u64) {
        self.voices.push(Voice {
            id,
            samples,
            start_frame: start_frame.max(self.frames_rendered),
        });
    }

    /// Drop a buffer without reporting it as ended
    pub fn remove(&mut self, id: HandleId) -> bool {
        let before = self.voices.len();
        self.voices.retain(|v| v.id != id);
        self.voices.len() != before
    }

    pub fn voice_count(&self) -> usize {
        self.voices.len()
    }

    /// Fill `out` (interleaved) and advance the clock. Returns buffers that finished.
    pub fn render(&mut self, out: &mut [f32]) -> Vec<HandleId> {
        out.fill(0.0);
        let frames = out.len() / self.channels;
        let block_start = self.frames_rendered;
        let block_end = block_start + frames as u64;

        for voice in &self.voices {
            if voice.start_frame >= block_end || voice.end_frame() <= block_start {
                continue;
            }
            let first = voice.start_frame.max(block_start);
            let last = voice.end_frame().min(block_end);
            for abs in first..last {
                let sample = voice.samples[(abs - voice.start_frame) as usize];
                let offset = (abs - block_start) as usize * self.channels;
                for slot in &mut out[offset..offset + self.channels] {
                    *slot += sample;
                }
            }
        }

        self.frames_rendered = block_end;

        let mut ended = Vec::new();
        self.voices.retain(|v| {
            if v.end_frame() <= block_end {
                ended.push(v.id);
                false
            } else {
                true
            }
        });
        ended
    }
}

/// Convert a chunk scheduled in seconds at `source_rate` into device frames.
/// The chunk is stretched to its exact span so consecutive chunks neither gap
/// nor overlap when the rates do not divide evenly.
fn place_chunk(
    buffer: &Arc<[f32]>,
    source_rate: u32,
    device_rate: u32,
    start_secs: f64,
) -> (u64, Arc<[f32]>) {
    if source_rate == 0 {
        return (0, Arc::from(Vec::new()));
    }
    let duration = buffer.len() as f64 / source_rate as f64;
    let (start, end) = Mixer::frame_span(device_rate, start_secs, duration);
    let len = (end - start) as usize;

    let samples = if len == buffer.len() {
        buffer.clone()
    } else {
        resample_to_len(buffer, len).into()
    };
    (start, samples)
}

fn lock_mixer(mixer: &Mutex<Mixer>) -> MutexGuard<'_, Mixer> {
    mixer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Default output device, played from a dedicated thread
pub struct CpalOutput {
    mixer: Arc<Mutex<Mixer>>,
    device_rate: u32,
    shutdown: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl CpalOutput {
    /// Open the default output device and start its clock
    pub async fn open(on_ended: EndedCallback) -> Result<Self, AudioError> {
        let (ready_tx, ready_rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = std_mpsc::channel::<()>();

        let thread = std::thread::Builder::new()
            .name("voice-playback".to_string())
            .spawn(move || {
                let (stream, mixer) = match open_output_stream(on_ended) {
                    Ok(opened) => opened,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(AudioError::StreamStartFailed(e.to_string())));
                    return;
                }
                let _ = ready_tx.send(Ok(mixer));

                // Blocks until the handle sends or is dropped
                let _ = shutdown_rx.recv();
                drop(stream);
            })
            .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))?;

        let mixer = ready_rx.await.map_err(|_| AudioError::DeviceThreadExited)??;
        let device_rate = lock_mixer(&mixer).sample_rate();

        Ok(Self {
            mixer,
            device_rate,
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        })
    }
}

impl OutputDevice for CpalOutput {
    fn current_time(&self) -> f64 {
        lock_mixer(&self.mixer).now_secs()
    }

    fn play(&mut self, id: HandleId, buffer: Arc<[f32]>, sample_rate: u32, start_time: f64) {
        let (start, samples) = place_chunk(&buffer, sample_rate, self.device_rate, start_time);
        lock_mixer(&self.mixer).add_at(id, samples, start);
    }

    fn stop(&mut self, id: HandleId) {
        lock_mixer(&self.mixer).remove(id);
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::warn!("Playback thread panicked during release");
            }
        }
        log::info!("Output device released");
    }
}

fn open_output_stream(on_ended: EndedCallback) -> Result<(Stream, Arc<Mutex<Mixer>>), AudioError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or(AudioError::NoOutputDevice)?;
    let name = device.name().unwrap_or_else(|_| "unknown".to_string());

    let supported_config = device
        .default_output_config()
        .map_err(|_| AudioError::NoSupportedConfig)?;

    log::info!(
        "Output device {:?}: {} Hz, {} channels, {:?}",
        name,
        supported_config.sample_rate().0,
        supported_config.channels(),
        supported_config.sample_format()
    );

    let sample_format = supported_config.sample_format();
    let stream_config: StreamConfig = supported_config.into();
    let mixer = Arc::new(Mutex::new(Mixer::new(
        stream_config.sample_rate.0,
        stream_config.channels as usize,
    )));

    let stream = match sample_format {
        SampleFormat::I16 => build_output_typed::<i16>(&device, &stream_config, &mixer, on_ended),
        SampleFormat::U16 => build_output_typed::<u16>(&device, &stream_config, &mixer, on_ended),
        SampleFormat::F32 => build_output_typed::<f32>(&device, &stream_config, &mixer, on_ended),
        _ => Err(AudioError::NoSupportedConfig),
    }?;

    Ok((stream, mixer))
}

fn build_output_typed<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mixer: &Arc<Mutex<Mixer>>,
    on_ended: EndedCallback,
) -> Result<Stream, AudioError>
where
    T: SizedSample + FromSample<f32> + Send + 'static,
{
    let mixer = mixer.clone();
    let mut scratch: Vec<f32> = Vec::new();

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                scratch.resize(data.len(), 0.0);
                let ended = lock_mixer(&mixer).render(&mut scratch);
                for (out, &sample) in data.iter_mut().zip(scratch.iter()) {
                    *out = T::from_sample(sample);
                }
                for id in ended {
                    on_ended(id);
                }
            },
            |err: cpal::StreamError| log::error!("Playback stream error: {}", err),
            None,
        )
        .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))
}
