//! The session link: one full-duplex WebSocket to the session server.
//!
//! A spawned supervisor task owns the socket and reconnects transparently
//! with capped exponential backoff. Inbound text frames are decoded into
//! [`ServerFrame`]s and forwarded, in arrival order, to the client loop;
//! outbound payloads are queued through an unbounded channel and drained
//! whenever the socket is up, so callers never observe a down link.

use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, warn};

use crate::config::Config;
use crate::protocol::{self, ServerFrame};
use crate::telemetry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Debug)]
pub enum LinkEvent {
    State(LinkState),
    Frame(ServerFrame),
}

/// Handle to the supervisor task. Dropping it tears the link down.
pub struct SessionLink {
    outbound: mpsc::UnboundedSender<String>,
    task: tokio::task::JoinHandle<()>,
}

impl SessionLink {
    /// Open the link and start the supervisor. Events (state changes and
    /// decoded frames) arrive on `events` in order.
    pub fn open(config: &Config, events: mpsc::UnboundedSender<LinkEvent>) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_link(
            config.session_url(),
            config.reconnect_initial,
            config.reconnect_max,
            outbound_rx,
            events,
        ));
        SessionLink {
            outbound: outbound_tx,
            task,
        }
    }

    /// Queue one serialized argument-map payload. Never raises: while the
    /// link is down the payload waits in the queue and drains after
    /// reconnect.
    pub fn send(&self, payload: String) {
        let _ = self.outbound.send(payload);
    }

    /// Outbound queue endpoint, for wiring the sync coordinator's pump.
    pub fn sender(&self) -> mpsc::UnboundedSender<String> {
        self.outbound.clone()
    }
}

impl Drop for SessionLink {
    fn drop(&mut self) {
        self.task.abort();
    }
}

enum PumpEnd {
    /// Socket closed or errored; the supervisor reconnects.
    PeerClosed,
    /// The client loop went away; the supervisor stops.
    ConsumerGone,
}

async fn run_link(
    url: String,
    initial_delay: Duration,
    max_delay: Duration,
    mut outbound: mpsc::UnboundedReceiver<String>,
    events: mpsc::UnboundedSender<LinkEvent>,
) {
    let mut delay = initial_delay;
    let mut ever_connected = false;
    loop {
        let attempt_state = if ever_connected {
            LinkState::Reconnecting
        } else {
            LinkState::Connecting
        };
        if events.send(LinkEvent::State(attempt_state)).is_err() {
            return;
        }

        match connect_async(&url).await {
            Ok((stream, _)) => {
                ever_connected = true;
                delay = initial_delay;
                if events.send(LinkEvent::State(LinkState::Connected)).is_err() {
                    return;
                }
                match pump(stream, &mut outbound, &events).await {
                    PumpEnd::PeerClosed => {
                        warn!(target = "transport::link", url = %url, "session link dropped; reconnecting");
                    }
                    PumpEnd::ConsumerGone => return,
                }
            }
            Err(err) => {
                warn!(target = "transport::link", url = %url, error = %err, "session connect failed");
            }
        }

        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..100));
        sleep(delay + jitter).await;
        delay = (delay * 2).min(max_delay);
    }
}

async fn pump(
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    outbound: &mut mpsc::UnboundedReceiver<String>,
    events: &mpsc::UnboundedSender<LinkEvent>,
) -> PumpEnd {
    let (mut sink, mut source) = stream.split();
    loop {
        tokio::select! {
            payload = outbound.recv() => {
                let Some(text) = payload else {
                    // Every SessionLink handle is gone.
                    return PumpEnd::ConsumerGone;
                };
                telemetry::sync_sent(text.len());
                if let Err(err) = sink.send(Message::Text(text)).await {
                    // The dequeued payload is lost with the socket; sync is
                    // fire-and-forget, so nobody is told.
                    warn!(target = "transport::link", error = %err, "outbound send failed");
                    return PumpEnd::PeerClosed;
                }
            }
            inbound = source.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        let started = Instant::now();
                        match protocol::decode_server_frame(&text) {
                            Ok(frame) => {
                                telemetry::frame_decoded(text.len(), started.elapsed());
                                debug!(target = "transport::link", frame = ?frame_tag(&frame), "frame received");
                                if events.send(LinkEvent::Frame(frame)).is_err() {
                                    return PumpEnd::ConsumerGone;
                                }
                            }
                            Err(err) => {
                                warn!(target = "transport::link", error = %err, "undecodable frame skipped");
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return PumpEnd::PeerClosed,
                    Some(Ok(_)) => {} // Ping/Pong/Binary ignored
                    Some(Err(err)) => {
                        warn!(target = "transport::link", error = %err, "session socket error");
                        return PumpEnd::PeerClosed;
                    }
                }
            }
        }
    }
}

fn frame_tag(frame: &ServerFrame) -> &'static str {
    match frame {
        ServerFrame::Data { .. } => "data",
        ServerFrame::Message { .. } => "message",
        ServerFrame::Reset => "reset",
    }
}
