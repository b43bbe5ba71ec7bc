//! Duplex channel to the remote model
//!
//! The session only sees [`Connector`] and [`ChannelSink`]. [`WsConnector`]
//! talks to a relay over a WebSocket: it sends the `config` frame, waits for
//! `{type: "open"}`, then splits the socket so reads and writes proceed
//! independently.

use crate::config::{AudioFraming, LiveConfig};
use crate::error::{LiveError, Result};
use crate::protocol::{ChannelEvent, ClientFrame, SessionSetup};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// Type alias for the WebSocket write half
type WsSink = futures_util::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;

/// Type alias for the WebSocket read half
type WsStream = futures_util::stream::SplitStream<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
>;

const OPEN_TIMEOUT: Duration = Duration::from_secs(15);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// An established channel: the write half plus inbound events in arrival
/// order.
pub struct OpenChannel {
    pub sink: Box<dyn ChannelSink>,
    pub events: mpsc::Receiver<ChannelEvent>,
}

/// Opens duplex channels to the remote model.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Fail fast with a configuration error before any device is touched.
    fn check_configured(&self) -> Result<()>;

    /// Negotiate a session. Resolves once the remote side reports open.
    async fn open(&self, setup: SessionSetup) -> Result<OpenChannel>;
}

/// Write half of an established channel. Frames are sent in call order.
#[async_trait]
pub trait ChannelSink: Send {
    async fn send(&mut self, frame: ClientFrame) -> Result<()>;

    async fn close(&mut self);
}

/// Connector for a WebSocket relay.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
    framing: AudioFraming,
    open_timeout: Duration,
}

impl WsConnector {
    pub fn new(url: impl Into<String>, framing: AudioFraming) -> Self {
        Self {
            url: url.into(),
            framing,
            open_timeout: OPEN_TIMEOUT,
        }
    }

    pub fn from_config(config: &LiveConfig) -> Self {
        Self::new(config.relay_url.clone(), config.audio_framing)
    }

    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }
}

#[async_trait]
impl Connector for WsConnector {
    fn check_configured(&self) -> Result<()> {
        let url = self.url.trim();
        if url.is_empty() {
            return Err(LiveError::Configuration("relay URL is not set".to_string()));
        }
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(LiveError::Configuration(format!(
                "relay URL must use ws:// or wss://, got {}",
                url
            )));
        }
        Ok(())
    }

    async fn open(&self, setup: SessionSetup) -> Result<OpenChannel> {
        info!("Connecting to relay at {} (model {})", self.url, setup.model);

        let (ws_stream, resp) = connect_async(self.url.trim())
            .await
            .map_err(|e| LiveError::ChannelOpen(e.to_string()))?;
        debug!("WebSocket connection response: {:?}", resp.status());

        let (mut sink, mut stream) = ws_stream.split();

        let config = ClientFrame::Config { config: setup }.to_text()?;
        sink.send(Message::Text(config.into()))
            .await
            .map_err(|e| LiveError::ChannelOpen(e.to_string()))?;
        info!("Config sent, waiting for the remote session to open");

        tokio::time::timeout(self.open_timeout, wait_for_open(&mut stream))
            .await
            .map_err(|_| LiveError::ChannelOpen("timed out waiting for session to open".to_string()))??;
        info!("Remote session open");

        let (events_tx, events_rx) = mpsc::channel(100);
        let reader = tokio::spawn(read_loop(stream, events_tx));

        Ok(OpenChannel {
            sink: Box::new(WsChannelSink {
                sink,
                framing: self.framing,
                reader,
            }),
            events: events_rx,
        })
    }
}

/// Error for a socket that closed before the session opened. The relay
/// closes with a policy violation when it has no credential.
fn closed_before_open(frame: Option<CloseFrame>) -> LiveError {
    match frame {
        Some(frame) if frame.code == CloseCode::Policy => LiveError::Configuration(frame.reason.as_str().to_string()),
        Some(frame) => LiveError::ChannelOpen(format!("closed before open ({}): {}", frame.code, frame.reason.as_str())),
        None => LiveError::ChannelOpen("connection closed before open".to_string()),
    }
}

/// Consume frames until the relay reports the session open.
async fn wait_for_open(stream: &mut WsStream) -> Result<()> {
    while let Some(message) = stream.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text.to_string(),
            Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                Ok(text) => text,
                Err(_) => {
                    debug!("Ignoring binary frame ({} bytes) before open", bytes.len());
                    continue;
                }
            },
            Ok(Message::Close(frame)) => return Err(closed_before_open(frame)),
            Ok(_) => continue,
            Err(e) => return Err(LiveError::ChannelOpen(e.to_string())),
        };

        match ChannelEvent::from_text(&text) {
            Ok(ChannelEvent::Open) => return Ok(()),
            Ok(ChannelEvent::Error { error }) => return Err(LiveError::ChannelOpen(error)),
            Ok(ChannelEvent::Close) => {
                return Err(LiveError::ChannelOpen("remote session closed before open".to_string()))
            }
            Ok(ChannelEvent::Message { .. }) => debug!("Ignoring server message before open"),
            Err(e) => warn!("Failed to parse frame before open: {}", e),
        }
    }
    Err(closed_before_open(None))
}

/// Forward inbound frames as [`ChannelEvent`]s until the socket ends. Always
/// finishes with a `Close` or `Error` event.
async fn read_loop(mut stream: WsStream, events: mpsc::Sender<ChannelEvent>) {
    info!("Inbound message task started");

    let last = loop {
        let text = match stream.next().await {
            Some(Ok(Message::Text(text))) => text.to_string(),
            Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                Ok(text) => text,
                Err(_) => {
                    warn!("Dropping non-UTF-8 binary frame ({} bytes)", bytes.len());
                    continue;
                }
            },
            Some(Ok(Message::Close(frame))) => {
                info!("WebSocket closed: {:?}", frame);
                break ChannelEvent::Close;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                error!("WebSocket error: {:?}", e);
                break ChannelEvent::Error { error: e.to_string() };
            }
            None => break ChannelEvent::Close,
        };

        match ChannelEvent::from_text(&text) {
            Ok(event) => {
                if events.send(event).await.is_err() {
                    debug!("Session dropped the channel, stopping reader");
                    return;
                }
            }
            Err(e) => {
                warn!("Failed to parse inbound frame: {}", e);
                debug!("Raw frame: {}", text);
            }
        }
    };

    let _ = events.send(last).await;
    info!("Inbound message task terminated");
}

struct WsChannelSink {
    sink: WsSink,
    framing: AudioFraming,
    reader: JoinHandle<()>,
}

#[async_trait]
impl ChannelSink for WsChannelSink {
    async fn send(&mut self, frame: ClientFrame) -> Result<()> {
        let message = match frame {
            ClientFrame::Audio { media } if self.framing == AudioFraming::Binary => Message::Binary(media.data.into()),
            frame => {
                if !matches!(frame, ClientFrame::Audio { .. }) {
                    debug!("Sending {} frame", frame.kind());
                }
                Message::Text(frame.to_text()?.into())
            }
        };

        self.sink
            .send(message)
            .await
            .map_err(|e| LiveError::ChannelRuntime(e.to_string()))
    }

    async fn close(&mut self) {
        match tokio::time::timeout(CLOSE_TIMEOUT, self.sink.close()).await {
            Ok(Ok(())) => debug!("WebSocket closed cleanly"),
            Ok(Err(e)) => debug!("WebSocket close failed: {}", e),
            Err(_) => warn!("Timed out closing WebSocket"),
        }
        // The peer may never echo the close frame
        self.reader.abort();
    }
}

impl Drop for WsChannelSink {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
