//! Live API protocol types
//!
//! This module defines the JSON message types exchanged with the bidirectional
//! live generation endpoint over WebSocket.
//!
//! # Protocol Overview
//!
//! 1. Connect to `wss://.../GenerativeService.BidiGenerateContent?key=...`
//! 2. Send `setup` with model, voice, system instruction and transcription options
//! 3. Receive `setupComplete`
//! 4. Stream microphone audio via `realtimeInput.mediaChunks`
//! 5. Receive `serverContent`: inline audio parts, output transcription,
//!    `turnComplete` and `interrupted` flags

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};

use super::TransportEvent;
use crate::audio::AudioFrame;

/// Live API endpoint (the API key is passed as a query parameter)
pub const LIVE_API_URL: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Response modality for spoken replies
pub const MODALITY_AUDIO: &str = "AUDIO";

/// Session setup sent once after connecting
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupConfig {
    /// Fully qualified model name (`models/...`)
    pub model: String,

    pub generation_config: GenerationConfig,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,

    /// Present (as `{}`) to request transcription of the model's speech
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_audio_transcription: Option<AudioTranscriptionConfig>,
}

impl SetupConfig {
    /// Audio-only session with output transcription enabled
    pub fn new(model: &str, voice_name: &str, system_instruction: &str) -> Self {
        let model = if model.starts_with("models/") {
            model.to_string()
        } else {
            format!("models/{}", model)
        };

        Self {
            model,
            generation_config: GenerationConfig {
                response_modalities: vec![MODALITY_AUDIO.to_string()],
                speech_config: Some(SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: voice_name.to_string(),
                        },
                    },
                }),
            },
            system_instruction: (!system_instruction.is_empty())
                .then(|| Content::text(system_instruction)),
            output_audio_transcription: Some(AudioTranscriptionConfig {}),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub speech_config: Option<SpeechConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

/// Empty marker object enabling transcription
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AudioTranscriptionConfig {}

/// Text content (used for the system instruction)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Content {
    pub parts: Vec<TextPart>,
}

impl Content {
    pub fn text(text: &str) -> Self {
        Self {
            parts: vec![TextPart {
                text: text.to_string(),
            }],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextPart {
    pub text: String,
}

/// A base64 media payload with its MIME type
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<Blob>,
}

// ============================================================================
// Client Messages (sent TO the live endpoint)
// ============================================================================

/// Messages sent from client to the live endpoint
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    /// Configure the session (first message only)
    Setup(SetupConfig),

    /// Stream a chunk of microphone audio
    RealtimeInput(RealtimeInput),
}

impl ClientMessage {
    pub fn setup(config: SetupConfig) -> Self {
        Self::Setup(config)
    }

    /// Create a realtime input message from a captured frame
    pub fn audio_frame(frame: &AudioFrame) -> Self {
        Self::RealtimeInput(RealtimeInput {
            media_chunks: vec![Blob {
                mime_type: format!("audio/pcm;rate={}", frame.sample_rate_hz),
                data: STANDARD.encode(frame.to_le_bytes()),
            }],
        })
    }
}

// ============================================================================
// Server Messages (received FROM the live endpoint)
// ============================================================================

/// Messages received from the live endpoint
///
/// Every field is optional; a message normally carries exactly one of them.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default)]
    pub setup_complete: Option<serde_json::Value>,

    #[serde(default)]
    pub server_content: Option<ServerContent>,

    #[serde(default)]
    pub go_away: Option<GoAway>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub model_turn: Option<ModelTurn>,

    #[serde(default)]
    pub turn_complete: bool,

    #[serde(default)]
    pub interrupted: bool,

    #[serde(default)]
    pub output_transcription: Option<Transcription>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelTurn {
    #[serde(default)]
    pub parts: Vec<ContentPart>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentPart {
    #[serde(default)]
    pub inline_data: Option<Blob>,

    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Transcription {
    #[serde(default)]
    pub text: String,
}

/// Server notice that the connection will be closed soon
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoAway {
    #[serde(default)]
    pub time_left: Option<String>,
}

impl ServerMessage {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn is_setup_complete(&self) -> bool {
        self.setup_complete.is_some()
    }

    /// Decompose into transport events, in order: audio, transcript,
    /// turn complete, interrupted
    pub fn into_events(self) -> Vec<TransportEvent> {
        let mut events = Vec::new();

        if let Some(go_away) = &self.go_away {
            log::warn!(
                "Live endpoint will close the connection (time left: {})",
                go_away.time_left.as_deref().unwrap_or("unknown")
            );
        }

        let Some(content) = self.server_content else {
            return events;
        };

        if let Some(turn) = content.model_turn {
            for part in turn.parts {
                let Some(blob) = part.inline_data else {
                    continue;
                };
                if !blob.mime_type.starts_with("audio/") {
                    log::debug!("Ignoring inline {} part", blob.mime_type);
                    continue;
                }
                match STANDARD.decode(blob.data.as_bytes()) {
                    Ok(bytes) => events.push(TransportEvent::AudioDelta(bytes)),
                    Err(e) => events.push(TransportEvent::MalformedAudio(format!(
                        "invalid base64 in audio part: {}",
                        e
                    ))),
                }
            }
        }

        if let Some(transcription) = content.output_transcription {
            if !transcription.text.is_empty() {
                events.push(TransportEvent::TranscriptDelta(transcription.text));
            }
        }

        if content.turn_complete {
            events.push(TransportEvent::TurnComplete);
        }

        if content.interrupted {
            events.push(TransportEvent::Interrupted);
        }

        events
    }
}
