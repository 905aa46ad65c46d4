//! Audio I/O for the duplex voice session
//!
//! Capture turns the microphone into fixed-size PCM16 frames; playback schedules
//! inbound PCM16 chunks back-to-back on an output device clock.
//! Both directions use CPAL on dedicated threads.

pub mod capture;
pub mod output;
pub mod pcm;
pub mod playback;
pub mod resample;

pub use capture::{AudioFrame, CaptureConfig, CaptureDevice, CaptureLease, CaptureStats};
pub use output::{CpalOutput, Mixer};
pub use pcm::{CodecError, DecodedAudio};
pub use playback::{HandleId, OutputDevice, PlaybackHandle, PlaybackScheduler};

/// Errors from acquiring or driving audio devices
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioError {
    NoInputDevice,
    NoOutputDevice,
    NoSupportedConfig,
    StreamCreationFailed(String),
    StreamStartFailed(String),
    /// The device thread exited before answering
    DeviceThreadExited,
}

impl std::fmt::Display for AudioError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AudioError::NoInputDevice => write!(f, "No audio input device found"),
            AudioError::NoOutputDevice => write!(f, "No audio output device found"),
            AudioError::NoSupportedConfig => write!(f, "No supported audio configuration"),
            AudioError::StreamCreationFailed(e) => write!(f, "Failed to create stream: {}", e),
            AudioError::StreamStartFailed(e) => write!(f, "Failed to start stream: {}", e),
            AudioError::DeviceThreadExited => write!(f, "Audio device thread exited"),
        }
    }
}

impl std::error::Error for AudioError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_error_display() {
        assert_eq!(
            AudioError::NoInputDevice.to_string(),
            "No audio input device found"
        );
        assert!(AudioError::StreamStartFailed("busy".to_string())
            .to_string()
            .contains("busy"));
    }
}
