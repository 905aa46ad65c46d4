use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::streaming::LIVE_API_URL;

const SETTINGS_DIR_NAME: &str = "duplex-voice";
const SETTINGS_FILE_NAME: &str = "settings.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceSettings {
    /// Live model name, sent verbatim in the session setup.
    pub model: String,

    /// Prebuilt voice used for the model's replies.
    pub voice_name: String,

    /// System instruction for the session. Empty to send none.
    pub system_instruction: String,

    /// WebSocket endpoint of the live API (without the key query parameter).
    pub endpoint: String,

    /// Sample rate of outbound microphone frames.
    pub capture_sample_rate: u32,

    /// Samples per outbound frame. Every frame has exactly this many samples.
    pub capture_buffer_size: usize,

    /// Sample rate of inbound model audio.
    pub playback_sample_rate: u32,

    /// Transcript snapshots kept in the rolling view.
    pub transcript_lines: usize,

    /// Frames the capture queue holds before new frames are dropped.
    pub outbound_queue_frames: usize,

    /// Upper bound on acquiring the microphone and output device.
    pub device_timeout_ms: u64,

    /// Upper bound on the WebSocket handshake.
    pub connect_timeout_ms: u64,

    /// Upper bound on waiting for the setup acknowledgement.
    pub setup_timeout_ms: u64,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            model: "gemini-2.5-flash-native-audio-preview-12-2025".to_string(),
            voice_name: "Zephyr".to_string(),
            system_instruction: "You are the Sovereign Map AI Intelligence. You assist high-level spatial architects with geopolitical insights and network data. Your tone is professional, analytical, and futuristic.".to_string(),
            endpoint: LIVE_API_URL.to_string(),
            capture_sample_rate: 16000,
            capture_buffer_size: 4096,
            playback_sample_rate: 24000,
            transcript_lines: 5,
            outbound_queue_frames: 8,
            device_timeout_ms: 5000,
            connect_timeout_ms: 10000,
            setup_timeout_ms: 5000,
        }
    }
}

impl VoiceSettings {
    /// Reject values no session can run with.
    pub fn validate(&self) -> Result<(), String> {
        let checks = [
            (self.capture_sample_rate == 0, "capture_sample_rate must be > 0"),
            (self.capture_buffer_size == 0, "capture_buffer_size must be > 0"),
            (self.playback_sample_rate == 0, "playback_sample_rate must be > 0"),
            (self.transcript_lines == 0, "transcript_lines must be > 0"),
            (self.outbound_queue_frames == 0, "outbound_queue_frames must be > 0"),
            (self.model.trim().is_empty(), "model must not be empty"),
            (self.endpoint.trim().is_empty(), "endpoint must not be empty"),
        ];

        match checks.iter().find(|(failed, _)| *failed) {
            Some((_, message)) => Err(message.to_string()),
            None => Ok(()),
        }
    }

    pub fn device_timeout(&self) -> Duration {
        Duration::from_millis(self.device_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn setup_timeout(&self) -> Duration {
        Duration::from_millis(self.setup_timeout_ms)
    }
}

/// `<config_dir>/duplex-voice/settings.json`
pub fn default_settings_path() -> Result<PathBuf, String> {
    let dir = dirs::config_dir().ok_or("Could not determine config directory")?;
    Ok(dir.join(SETTINGS_DIR_NAME).join(SETTINGS_FILE_NAME))
}

/// Load settings, falling back to defaults when the file is missing or invalid.
pub fn load_settings(path: &Path) -> VoiceSettings {
    let settings = match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<VoiceSettings>(&contents) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("Settings: failed to parse {:?}: {}", path, e);
                return VoiceSettings::default();
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return VoiceSettings::default(),
        Err(e) => {
            log::warn!("Settings: failed to read {:?}: {}", path, e);
            return VoiceSettings::default();
        }
    };

    if let Err(e) = settings.validate() {
        log::warn!("Settings: {:?} is invalid ({}), using defaults", path, e);
        return VoiceSettings::default();
    }
    settings
}

pub fn save_settings(path: &Path, settings: &VoiceSettings) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory {:?}: {}", parent, e))?;
    }

    let contents =
        serde_json::to_string_pretty(settings).map_err(|e| format!("Serialize settings: {}", e))?;

    // Write to a temp file in the same directory, then rename over the target.
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &contents)
        .map_err(|e| format!("Write temp settings {:?}: {}", tmp_path, e))?;

    // Windows rename fails if the destination exists.
    if cfg!(windows) {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(format!("Remove existing settings file {:?}: {}", path, e));
            }
        }
    }

    std::fs::rename(&tmp_path, path)
        .map_err(|e| format!("Rename temp settings {:?} to {:?}: {}", tmp_path, path, e))?;
    Ok(())
}
