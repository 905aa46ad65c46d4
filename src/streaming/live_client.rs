//! Live endpoint WebSocket client
//!
//! Manages the WebSocket connection lifecycle for one voice session.
//!
//! # Connection Flow
//!
//! 1. `connect()` - Establish WebSocket, send `setup`, wait for `setupComplete`
//! 2. Writer task - drains the capture queue into `realtimeInput` messages
//! 3. Reader task - turns `serverContent` into `TransportEvent`s
//! 4. `close()` - Stop both tasks and send a close frame
//!
//! A failed connect is not retried; the user starts a new session instead.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{client::IntoClientRequest, Message},
    MaybeTlsStream, WebSocketStream,
};
use tokio_util::sync::CancellationToken;

use super::protocol::{ClientMessage, ServerMessage, SetupConfig};
use super::{StreamingError, TransportEvent, TransportHandle};
use crate::audio::AudioFrame;
use crate::settings::VoiceSettings;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWrite = SplitSink<WsStream, Message>;
type WsRead = SplitStream<WsStream>;

/// How long the writer waits for the close frame to go out
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Receives inbound transport events (called from the reader/writer tasks)
pub type EventCallback = Arc<dyn Fn(TransportEvent) + Send + Sync>;

/// Everything needed to open one live session
#[derive(Clone)]
pub struct LiveConfig {
    pub endpoint: String,
    pub api_key: String,
    pub setup: SetupConfig,
    pub connect_timeout: Duration,
    pub setup_timeout: Duration,
}

impl LiveConfig {
    pub fn from_settings(settings: &VoiceSettings, api_key: &str) -> Self {
        Self {
            endpoint: settings.endpoint.clone(),
            api_key: api_key.to_string(),
            setup: SetupConfig::new(
                &settings.model,
                &settings.voice_name,
                &settings.system_instruction,
            ),
            connect_timeout: settings.connect_timeout(),
            setup_timeout: settings.setup_timeout(),
        }
    }

    fn url(&self) -> String {
        format!("{}?key={}", self.endpoint, self.api_key)
    }
}

impl std::fmt::Debug for LiveConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveConfig")
            .field("endpoint", &self.endpoint)
            .field("api_key", &"<redacted>")
            .field("model", &self.setup.model)
            .field("connect_timeout", &self.connect_timeout)
            .field("setup_timeout", &self.setup_timeout)
            .finish()
    }
}

/// Handle to an open live session
///
/// The session owns the writer and reader tasks. Dropping it closes the session.
pub struct LiveSession {
    cancel: CancellationToken,
    writer_task: Option<JoinHandle<()>>,
    reader_task: Option<JoinHandle<()>>,
}

impl LiveSession {
    /// Connect, run the setup handshake, and start streaming `frames`
    ///
    /// # Arguments
    /// * `config` - Endpoint, key, setup payload and timeouts
    /// * `frames` - Capture queue; each frame becomes one `realtimeInput` message
    /// * `on_event` - Receives inbound events until the session closes
    pub async fn connect(
        config: &LiveConfig,
        frames: mpsc::Receiver<AudioFrame>,
        on_event: EventCallback,
    ) -> Result<Self, StreamingError> {
        if config.api_key.is_empty() {
            return Err(StreamingError::MissingApiKey);
        }

        let request = config
            .url()
            .into_client_request()
            .map_err(|e| StreamingError::ConnectionFailed(e.to_string()))?;

        log::info!("Connecting to live endpoint {}...", config.endpoint);

        let (ws_stream, _response) = timeout(
            config.connect_timeout,
            connect_async_with_config(
                request, None, false, // disable_nagle (we want low latency)
            ),
        )
        .await
        .map_err(|_| StreamingError::ConnectionFailed("Connection timeout".to_string()))?
        .map_err(|e| StreamingError::ConnectionFailed(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();

        send_message(&mut write, &ClientMessage::setup(config.setup.clone())).await?;
        log::info!("WebSocket connected, waiting for setupComplete...");

        timeout(config.setup_timeout, wait_for_setup(&mut read))
            .await
            .map_err(|_| StreamingError::SetupFailed("Setup acknowledgement timeout".to_string()))??;

        log::info!("Live session ready ({})", config.setup.model);

        let cancel = CancellationToken::new();
        let writer_task = tokio::spawn(run_writer(write, frames, cancel.clone(), on_event.clone()));
        let reader_task = tokio::spawn(run_reader(read, cancel.clone(), on_event));

        Ok(Self {
            cancel,
            writer_task: Some(writer_task),
            reader_task: Some(reader_task),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl TransportHandle for LiveSession {
    fn close(&mut self) {
        if self.reader_task.is_none() && self.writer_task.is_none() {
            return;
        }
        log::info!("Closing live session");

        self.cancel.cancel();
        // No events after close: the reader goes immediately, the writer
        // finishes by sending a close frame.
        if let Some(reader) = self.reader_task.take() {
            reader.abort();
        }
        self.writer_task.take();
    }
}

impl Drop for LiveSession {
    fn drop(&mut self) {
        self.close();
    }
}

async fn send_message(write: &mut WsWrite, msg: &ClientMessage) -> Result<(), StreamingError> {
    let json =
        serde_json::to_string(msg).map_err(|e| StreamingError::ProtocolError(e.to_string()))?;

    write
        .send(Message::Text(json))
        .await
        .map_err(|e| StreamingError::SendFailed(e.to_string()))
}

/// Frame payloads arrive as text or binary JSON
fn message_text(msg: Message) -> Option<String> {
    match msg {
        Message::Text(text) => Some(text),
        Message::Binary(bytes) => match String::from_utf8(bytes) {
            Ok(text) => Some(text),
            Err(e) => {
                log::warn!("Ignoring non-UTF-8 binary frame: {}", e);
                None
            }
        },
        _ => None,
    }
}

async fn wait_for_setup(read: &mut WsRead) -> Result<(), StreamingError> {
    while let Some(msg_result) = read.next().await {
        match msg_result {
            Ok(Message::Close(frame)) => {
                let reason = frame
                    .map(|f| format!("{} {}", f.code, f.reason))
                    .unwrap_or_else(|| "no reason given".to_string());
                return Err(StreamingError::SetupFailed(format!(
                    "Connection closed during setup: {}",
                    reason
                )));
            }
            Ok(msg) => {
                let Some(text) = message_text(msg) else {
                    continue;
                };
                match ServerMessage::parse(&text) {
                    Ok(server_msg) if server_msg.is_setup_complete() => return Ok(()),
                    Ok(_) => log::debug!("Ignoring message while waiting for setupComplete"),
                    Err(e) => log::warn!("Failed to parse message: {}", e),
                }
            }
            Err(e) => return Err(StreamingError::ProtocolError(e.to_string())),
        }
    }
    Err(StreamingError::Disconnected("Stream ended during setup".to_string()))
}

async fn run_writer(
    mut write: WsWrite,
    mut frames: mpsc::Receiver<AudioFrame>,
    cancel: CancellationToken,
    on_event: EventCallback,
) {
    let mut sent: u64 = 0;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame = frames.recv() => {
                let Some(frame) = frame else {
                    log::debug!("Capture queue closed, writer exiting");
                    break;
                };
                if let Err(e) = send_message(&mut write, &ClientMessage::audio_frame(&frame)).await {
                    if !cancel.is_cancelled() {
                        log::warn!("{}", e);
                        on_event(TransportEvent::Error(e.to_string()));
                        cancel.cancel();
                    }
                    break;
                }
                sent += 1;
                if sent % 100 == 0 {
                    log::debug!("Live writer: {} frames sent", sent);
                }
            }
        }
    }

    if timeout(CLOSE_TIMEOUT, write.close()).await.is_err() {
        log::debug!("Close frame not flushed in time");
    }
    log::debug!("Writer task exiting after {} frames", sent);
}

async fn run_reader(mut read: WsRead, cancel: CancellationToken, on_event: EventCallback) {
    while let Some(msg_result) = read.next().await {
        match msg_result {
            Ok(Message::Close(frame)) => {
                match frame {
                    Some(f) => log::info!("WebSocket closed by server: {} {}", f.code, f.reason),
                    None => log::info!("WebSocket closed by server"),
                }
                break;
            }
            Ok(msg) => {
                let Some(text) = message_text(msg) else {
                    continue;
                };
                match ServerMessage::parse(&text) {
                    Ok(server_msg) => {
                        for event in server_msg.into_events() {
                            on_event(event);
                        }
                    }
                    Err(e) => log::warn!("Failed to parse message: {}", e),
                }
            }
            Err(e) => {
                log::warn!("WebSocket error: {}", e);
                cancel.cancel();
                on_event(TransportEvent::Error(e.to_string()));
                return;
            }
        }
    }

    cancel.cancel();
    on_event(TransportEvent::Closed);
    log::debug!("Reader task exiting");
}

/// Get the live API key from environment
///
/// Reads `GEMINI_API_KEY`, falling back to `API_KEY`.
pub fn get_api_key() -> Option<String> {
    ["GEMINI_API_KEY", "API_KEY"]
        .iter()
        .filter_map(|name| std::env::var(name).ok())
        .find(|k| !k.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> LiveConfig {
        LiveConfig::from_settings(&VoiceSettings::default(), "secret-key")
    }

    #[test]
    fn test_get_api_key_does_not_panic() {
        // Depends on environment, but must never panic
        let _ = get_api_key();
    }

    #[test]
    fn test_config_from_settings() {
        let config = config();
        assert_eq!(config.connect_timeout, Duration::from_millis(10000));
        assert_eq!(config.setup_timeout, Duration::from_millis(5000));
        assert!(config.setup.model.starts_with("models/"));
        assert!(config.url().ends_with("?key=secret-key"));
    }

    #[test]
    fn test_config_debug_redacts_key() {
        let debug = format!("{:?}", config());
        assert!(!debug.contains("secret-key"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn test_message_text_accepts_binary_json() {
        let text = message_text(Message::Binary(br#"{"setupComplete":{}}"#.to_vec()));
        assert_eq!(text.as_deref(), Some(r#"{"setupComplete":{}}"#));
        assert!(message_text(Message::Binary(vec![0xFF, 0xFE])).is_none());
        assert!(message_text(Message::Ping(vec![])).is_none());
    }

    #[tokio::test]
    async fn test_connect_without_key_fails_fast() {
        let (_tx, rx) = mpsc::channel(1);
        let mut config = config();
        config.api_key.clear();

        let result = LiveSession::connect(&config, rx, Arc::new(|_: TransportEvent| {})).await;
        assert!(matches!(result, Err(StreamingError::MissingApiKey)));
    }

    #[tokio::test]
    async fn test_connect_refused_reports_connection_failed() {
        let (_tx, rx) = mpsc::channel(1);
        let mut config = config();
        config.endpoint = "ws://127.0.0.1:9/live".to_string();
        config.connect_timeout = Duration::from_secs(2);

        let result = LiveSession::connect(&config, rx, Arc::new(|_: TransportEvent| {})).await;
        assert!(matches!(result, Err(StreamingError::ConnectionFailed(_))));
    }

    #[tokio::test]
    #[ignore] // Requires valid API key
    async fn test_live_connection() {
        let api_key = get_api_key().expect("GEMINI_API_KEY required");
        let _ = rustls::crypto::ring::default_provider().install_default();
        let config = LiveConfig::from_settings(&VoiceSettings::default(), &api_key);
        let (tx, rx) = mpsc::channel(8);

        let mut session = LiveSession::connect(&config, rx, Arc::new(|_: TransportEvent| {}))
            .await
            .expect("Connection failed");

        // Send some silence
        let silence = AudioFrame {
            samples: vec![0; 4096],
            sample_rate_hz: 16000,
        };
        tx.send(silence).await.expect("Writer gone");

        session.close();
        assert!(session.is_closed());
    }
}
