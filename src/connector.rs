//! Production wiring of a session: microphone, speakers and the live transport

use tokio::sync::mpsc;
use tokio::time::timeout;
use uuid::Uuid;

use crate::audio::{CaptureConfig, CaptureDevice, CpalOutput};
use crate::session::{Connector, EventSender, Link};
use crate::settings::VoiceSettings;
use crate::state_machine::SessionError;
use crate::streaming::{LiveConfig, LiveSession};

/// Opens real devices and a live session
///
/// Acquisition order is capture, output, transport, then arming capture. Each
/// step owns what it acquired, so any failure (or the open being abandoned)
/// releases everything opened so far.
pub struct LiveConnector {
    settings: VoiceSettings,
    api_key: String,
}

impl LiveConnector {
    pub fn new(settings: VoiceSettings, api_key: String) -> Self {
        Self { settings, api_key }
    }
}

impl Connector for LiveConnector {
    async fn open(&self, session_id: Uuid, events: EventSender) -> Result<Link, SessionError> {
        let device_timeout = self.settings.device_timeout();
        let (frame_tx, frame_rx) = mpsc::channel(self.settings.outbound_queue_frames);

        let capture_config = CaptureConfig {
            sample_rate: self.settings.capture_sample_rate,
            frame_size: self.settings.capture_buffer_size,
        };
        let capture = timeout(device_timeout, CaptureDevice::acquire(capture_config, frame_tx))
            .await
            .map_err(|_| {
                SessionError::DeviceUnavailable("Timed out acquiring microphone".to_string())
            })??;
        log::info!(
            "Session {}: microphone {:?} acquired",
            session_id,
            capture.device_name()
        );

        let output = timeout(device_timeout, CpalOutput::open(events.ended_callback()))
            .await
            .map_err(|_| {
                SessionError::DeviceUnavailable("Timed out opening output device".to_string())
            })??;

        let config = LiveConfig::from_settings(&self.settings, &self.api_key);
        let transport = LiveSession::connect(&config, frame_rx, events.transport_callback()).await?;

        capture.start().await?;

        Ok(Link {
            output: Box::new(output),
            transport: Box::new(transport),
            capture: Box::new(capture),
        })
    }
}
