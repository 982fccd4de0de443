//! Websocket link task: dials the push channel, runs the Engine.IO session
//! and shuttles Socket.IO event and ack packets between the socket and the
//! event loop.
//!
//! The dial only counts as open once the server accepts the namespace
//! connect carrying the token. Anything that ends the session before that
//! is a dial failure.

use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, warn};

use callwatch_core::{Dial, FrameSink};
use callwatch_protocol::{decode_packet, engine_io_url, Packet};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// What the link task reports back. Every variant carries the generation of
/// the dial that produced it so the engine can drop stale reports.
pub enum SocketEvent {
    Opened {
        generation: u64,
        sink: ChannelSink,
    },
    DialFailed {
        generation: u64,
        reason: String,
    },
    Frame {
        generation: u64,
        text: String,
    },
    Closed {
        generation: u64,
        reason: String,
    },
}

/// Outbound half handed to the engine. Dropping it closes the socket.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<String>,
}

impl FrameSink for ChannelSink {
    fn send_text(&mut self, text: String) -> std::result::Result<(), String> {
        self.tx
            .send(text)
            .map_err(|_| "socket task has exited".to_string())
    }
}

/// What one inbound text frame means for the link.
#[derive(Debug, PartialEq, Eq)]
enum LinkStep {
    /// Write this back to the server.
    Reply(String),
    /// The namespace connect was accepted.
    Connected,
    /// Hand the frame to the engine.
    Forward,
    /// The server ended or refused the session.
    Closed(String),
    Ignore,
}

/// Engine.IO session state for one dial.
struct LinkSession {
    token: String,
    connected: bool,
    ping_window: Duration,
}

impl LinkSession {
    fn new(token: &str) -> Self {
        Self {
            token: token.to_string(),
            connected: false,
            ping_window: HANDSHAKE_TIMEOUT,
        }
    }

    fn step(&mut self, text: &str) -> LinkStep {
        let packet = match decode_packet(text) {
            Ok(packet) => packet,
            Err(err) => {
                warn!(error = %err, "Dropping unreadable frame");
                return LinkStep::Ignore;
            }
        };
        match packet {
            Packet::Open(handshake) => {
                self.ping_window =
                    Duration::from_millis(handshake.ping_interval + handshake.ping_timeout);
                debug!(
                    sid = %handshake.sid,
                    ping_window_ms = self.ping_window.as_millis() as u64,
                    "Engine session opened"
                );
                match Packet::connect(&self.token).encode() {
                    Ok(text) => LinkStep::Reply(text),
                    Err(err) => LinkStep::Closed(err.to_string()),
                }
            }
            Packet::Ping => match Packet::Pong.encode() {
                Ok(text) => LinkStep::Reply(text),
                Err(err) => LinkStep::Closed(err.to_string()),
            },
            Packet::Connect(_) if !self.connected => {
                self.connected = true;
                LinkStep::Connected
            }
            Packet::ConnectError(message) => {
                LinkStep::Closed(format!("connection refused: {}", message))
            }
            Packet::Disconnect => LinkStep::Closed("disconnected by server".to_string()),
            Packet::Close => LinkStep::Closed("session closed by server".to_string()),
            Packet::Event { .. } | Packet::Ack { .. } if self.connected => LinkStep::Forward,
            other => {
                debug!(packet = other.kind(), connected = self.connected, "Ignoring packet");
                LinkStep::Ignore
            }
        }
    }
}

pub fn spawn_link(
    url: String,
    dial: Dial,
    events: mpsc::UnboundedSender<SocketEvent>,
) -> JoinHandle<()> {
    tokio::spawn(run_link(url, dial, events))
}

async fn run_link(url: String, dial: Dial, events: mpsc::UnboundedSender<SocketEvent>) {
    let generation = dial.generation;
    let url = engine_io_url(&url);
    debug!(generation, attempt = dial.attempt, url = %url, "Dialing push channel");

    let stream = match open(&url).await {
        Ok(stream) => stream,
        Err(err) => {
            let _ = events.send(SocketEvent::DialFailed {
                generation,
                reason: format!("{:#}", err),
            });
            return;
        }
    };
    let (mut sink, mut source) = stream.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
    let mut handoff = Some(ChannelSink { tx: outbound_tx });
    let mut session = LinkSession::new(&dial.token);
    let mut deadline = Instant::now() + HANDSHAKE_TIMEOUT;

    let reason = loop {
        tokio::select! {
            outbound = outbound_rx.recv(), if session.connected => {
                let Some(text) = outbound else {
                    // Engine dropped the sink: orderly shutdown.
                    if let Ok(goodbye) = Packet::Disconnect.encode() {
                        let _ = sink.send(WsMessage::Text(goodbye.into())).await;
                    }
                    let _ = sink.send(WsMessage::Close(None)).await;
                    return;
                };
                if let Err(err) = sink.send(WsMessage::Text(text.into())).await {
                    break format!("send failed: {}", err);
                }
            }
            _ = tokio::time::sleep_until(deadline) => {
                break if session.connected {
                    "ping timeout".to_string()
                } else {
                    "handshake timed out".to_string()
                };
            }
            inbound = source.next() => {
                let Some(message) = inbound else {
                    break "stream ended".to_string();
                };
                let message = match message {
                    Ok(message) => message,
                    Err(err) => break format!("read failed: {}", err),
                };
                let text = match message {
                    WsMessage::Text(text) => text.as_str().to_string(),
                    WsMessage::Binary(_) => {
                        warn!(generation, "Dropping binary frame");
                        continue;
                    }
                    WsMessage::Ping(payload) => {
                        if let Err(err) = sink.send(WsMessage::Pong(payload)).await {
                            break format!("pong failed: {}", err);
                        }
                        continue;
                    }
                    WsMessage::Close(frame) => {
                        break frame
                            .map(|frame| format!("closed by server: {}", frame.reason.as_str()))
                            .unwrap_or_else(|| "closed by server".to_string());
                    }
                    WsMessage::Pong(_) | WsMessage::Frame(_) => continue,
                };

                deadline = Instant::now() + session.ping_window;
                match session.step(&text) {
                    LinkStep::Reply(reply) => {
                        if let Err(err) = sink.send(WsMessage::Text(reply.into())).await {
                            break format!("send failed: {}", err);
                        }
                    }
                    LinkStep::Connected => {
                        let Some(outbound) = handoff.take() else {
                            continue;
                        };
                        if events
                            .send(SocketEvent::Opened { generation, sink: outbound })
                            .is_err()
                        {
                            return;
                        }
                    }
                    LinkStep::Forward => {
                        let _ = events.send(SocketEvent::Frame { generation, text });
                    }
                    LinkStep::Closed(reason) => break reason,
                    LinkStep::Ignore => {}
                }
            }
        }
    };

    let event = if session.connected {
        SocketEvent::Closed { generation, reason }
    } else {
        SocketEvent::DialFailed { generation, reason }
    };
    let _ = events.send(event);
}

async fn open(
    url: &str,
) -> Result<
    tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
> {
    let (stream, _) = connect_async(url)
        .await
        .with_context(|| format!("failed to connect to {}", url))?;
    Ok(stream)
}
