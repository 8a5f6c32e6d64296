//! The single duplex WebSocket channel to a Continuum server.
//!
//! A [`Connection`] only knows how to connect, send a serialisable frame,
//! yield the next parsed inbound frame and close. Routing and correlation
//! live above it.

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use continuum_core::{BridgeConfig, Error, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Closing,
    Closed,
}

impl ConnectionState {
    pub fn is_open(self) -> bool {
        self == Self::Open
    }
}

struct Inbound {
    source: WsSource,
    /// Frames read during the handshake that turned out not to be greetings.
    backlog: VecDeque<Value>,
}

pub struct Connection {
    url: String,
    state_tx: watch::Sender<ConnectionState>,
    writer: Mutex<WsSink>,
    reader: Mutex<Inbound>,
    /// Outbound sequence counter.
    frames_sent: AtomicU64,
}

impl Connection {
    /// Open the channel and consume the server's greeting frames.
    ///
    /// The whole exchange, upgrade plus greetings, must finish within the
    /// configured handshake timeout.
    pub async fn connect(config: &BridgeConfig) -> Result<Self> {
        let url = url::Url::parse(&config.url)
            .map_err(|e| Error::Connection(format!("Invalid endpoint {}: {}", config.url, e)))?;

        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        state_tx.send_replace(ConnectionState::Connecting);

        let deadline = Instant::now() + config.handshake_timeout();
        let (ws_stream, _) = match tokio::time::timeout_at(deadline, connect_async(url.as_str())).await {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                state_tx.send_replace(ConnectionState::Closed);
                return Err(Error::Connection(format!(
                    "Failed to connect to {}: {}",
                    config.url, e
                )));
            }
            Err(_) => {
                state_tx.send_replace(ConnectionState::Closed);
                return Err(Error::Connection(format!(
                    "Handshake with {} timed out after {}ms",
                    config.url, config.handshake_timeout_ms
                )));
            }
        };

        let (sink, source) = ws_stream.split();
        let connection = Self {
            url: config.url.clone(),
            state_tx,
            writer: Mutex::new(sink),
            reader: Mutex::new(Inbound {
                source,
                backlog: VecDeque::new(),
            }),
            frames_sent: AtomicU64::new(0),
        };

        if let Err(e) = connection.discard_greeting(&config.greeting_frames, deadline).await {
            connection.close().await;
            return Err(e);
        }

        connection.state_tx.send_replace(ConnectionState::Open);
        info!(url = %connection.url, "Connected to Continuum server");
        Ok(connection)
    }

    async fn discard_greeting(&self, expected: &[String], deadline: Instant) -> Result<()> {
        let mut inbound = self.reader.lock().await;
        for greeting in expected {
            let frame = match tokio::time::timeout_at(deadline, next_frame(&mut inbound.source)).await {
                Ok(Ok(Some(frame))) => frame,
                Ok(Ok(None)) => {
                    return Err(Error::Connection(format!(
                        "Server closed the connection before sending '{}' greeting",
                        greeting
                    )))
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    return Err(Error::Connection(format!(
                        "Handshake with {} timed out waiting for '{}' greeting",
                        self.url, greeting
                    )))
                }
            };

            let frame_type = frame.get("type").and_then(|v| v.as_str()).unwrap_or("");
            if frame_type == greeting {
                debug!(frame_type = %frame_type, "Discarded greeting frame");
            } else {
                warn!(
                    expected = %greeting,
                    got = %frame_type,
                    "Unexpected frame during greeting; keeping it for the receive loop"
                );
                inbound.backlog.push_back(frame);
                break;
            }
        }
        Ok(())
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Watch lifecycle transitions, e.g. to notice `Closed` and reconnect.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Number of frames written so far.
    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::SeqCst)
    }

    /// Serialise `frame` and write it as one text message.
    ///
    /// Returns the frame's outbound sequence number.
    pub async fn send<T: Serialize + ?Sized>(&self, frame: &T) -> Result<u64> {
        if !self.state().is_open() {
            return Err(Error::Connection(format!(
                "Cannot send on a {:?} connection",
                self.state()
            )));
        }
        let text = serde_json::to_string(frame)?;

        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.send(Message::Text(text)).await {
            drop(writer);
            warn!(error = %e, "WebSocket write failed");
            self.state_tx.send_replace(ConnectionState::Closed);
            return Err(Error::Connection(format!("Failed to write frame: {}", e)));
        }
        Ok(self.frames_sent.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Next parsed inbound frame.
    ///
    /// `Ok(None)` means the server closed the channel; an `Err` means the
    /// transport failed. Either way the connection is `Closed` afterwards.
    /// Frames that are not JSON objects are logged and skipped.
    pub async fn receive(&self) -> Result<Option<Value>> {
        let mut inbound = self.reader.lock().await;
        if let Some(frame) = inbound.backlog.pop_front() {
            return Ok(Some(frame));
        }
        match next_frame(&mut inbound.source).await {
            Ok(Some(frame)) => Ok(Some(frame)),
            Ok(None) => {
                self.state_tx.send_replace(ConnectionState::Closed);
                Ok(None)
            }
            Err(e) => {
                self.state_tx.send_replace(ConnectionState::Closed);
                Err(e)
            }
        }
    }

    /// Close the channel. Calling it again is a no-op.
    pub async fn close(&self) {
        if matches!(
            self.state(),
            ConnectionState::Closing | ConnectionState::Closed
        ) {
            return;
        }

        self.state_tx.send_replace(ConnectionState::Closing);
        {
            let mut writer = self.writer.lock().await;
            if let Err(e) = writer.send(Message::Close(None)).await {
                debug!(error = %e, "Close frame not delivered (socket may already be gone)");
            }
            let _ = writer.close().await;
        }
        self.state_tx.send_replace(ConnectionState::Closed);
        info!(url = %self.url, "Connection closed");
    }
}

async fn next_frame(source: &mut WsSource) -> Result<Option<Value>> {
    while let Some(msg_result) = source.next().await {
        let text = match msg_result {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(data)) => match String::from_utf8(data) {
                Ok(text) => text,
                Err(_) => {
                    warn!("Skipping non-UTF-8 binary frame");
                    continue;
                }
            },
            Ok(Message::Close(_)) => {
                debug!("WebSocket closed by server");
                return Ok(None);
            }
            Ok(_) => continue,
            Err(e) => {
                warn!(error = %e, "WebSocket read error");
                return Err(Error::Connection(format!("WebSocket read failed: {}", e)));
            }
        };

        match serde_json::from_str::<Value>(&text) {
            Ok(frame) if frame.is_object() => return Ok(Some(frame)),
            Ok(_) => warn!(raw = %truncate(&text, 200), "Skipping non-object frame"),
            Err(e) => warn!(error = %e, raw = %truncate(&text, 200), "Skipping malformed frame"),
        }
    }
    Ok(None)
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
