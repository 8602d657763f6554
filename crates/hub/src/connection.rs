//! Per-connection plumbing: the outbound queue and its pumps.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{Sink, SinkExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use roomcast_protocol::constants::events;
use roomcast_protocol::envelope::{Envelope, Event, Response};
use roomcast_protocol::messages::TickEvent;

/// Outbound queue depth per connection. A receiver that stays this far
/// behind starts losing broadcasts rather than stalling the hub.
const SEND_BUFFER: usize = 256;

/// Cloneable handle for sending frames to one connection.
///
/// All sends are non-blocking: a full queue drops the frame. Request
/// responses and broadcasts share the same queue, so a wedged client
/// only ever hurts itself.
#[derive(Clone)]
pub struct Sender {
    tx: mpsc::Sender<Message>,
    connected: Arc<AtomicBool>,
}

impl Sender {
    /// Returns `true` while the write pump is alive.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Queues a raw WebSocket message. Returns `false` if the queue is
    /// full or the connection is gone.
    pub fn try_send(&self, msg: Message) -> bool {
        match self.tx.try_send(msg) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("outbound queue full, dropping frame");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Serializes and queues an envelope.
    pub fn send_envelope(&self, envelope: &Envelope) -> bool {
        match envelope.to_text() {
            Ok(text) => self.try_send(Message::Text(text.into())),
            Err(e) => {
                warn!("failed to serialize envelope: {e}");
                false
            }
        }
    }

    /// Queues a pre-serialized envelope. Used by fan-out so a broadcast
    /// is serialized once, not per receiver.
    pub fn send_text(&self, text: &str) -> bool {
        self.try_send(Message::Text(text.to_string().into()))
    }

    /// Queues a response frame.
    pub fn respond(&self, response: Response) -> bool {
        self.send_envelope(&Envelope::Res(response))
    }

    /// Queues an event frame.
    pub fn emit(&self, event: Event) -> bool {
        self.send_envelope(&Envelope::Event(event))
    }
}

/// Spawns the write pump for a connection and returns its [`Sender`].
///
/// The pump drains the queue into the sink until cancellation or a
/// write error, then sends a Close frame and marks the sender dead.
pub fn spawn_write_pump<S, E>(sink: S, cancel: CancellationToken) -> (Sender, JoinHandle<()>)
where
    S: Sink<Message, Error = E> + Unpin + Send + 'static,
    E: std::fmt::Display + Send,
{
    let (tx, rx) = mpsc::channel(SEND_BUFFER);
    let connected = Arc::new(AtomicBool::new(true));
    let sender = Sender {
        tx,
        connected: connected.clone(),
    };
    let handle = tokio::spawn(async move {
        write_pump(rx, sink, cancel).await;
        connected.store(false, Ordering::Relaxed);
    });
    (sender, handle)
}

async fn write_pump<S, E>(mut rx: mpsc::Receiver<Message>, mut sink: S, cancel: CancellationToken)
where
    S: Sink<Message, Error = E> + Unpin,
    E: std::fmt::Display,
{
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                trace!("write pump cancelled");
                let _ = sink.send(Message::Close(None)).await;
                break;
            }

            msg = rx.recv() => {
                match msg {
                    Some(msg) => {
                        if let Err(e) = sink.send(msg).await {
                            debug!("write failed, closing: {e}");
                            break;
                        }
                    }
                    None => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
        }
    }
    let _ = sink.close().await;
}

/// Spawns the liveness tick pump: emits a `tick` event at the keepalive
/// interval promised in the handshake policy, until cancellation.
pub fn spawn_tick_pump(
    sender: Sender,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so the cadence
        // starts one interval after the handshake.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let payload = TickEvent {
                        ts: roomcast_protocol::constants::now_ts(),
                    };
                    match Event::new(events::TICK, Some(&payload)) {
                        Ok(ev) => {
                            if !sender.emit(ev) && !sender.is_connected() {
                                break;
                            }
                        }
                        Err(e) => warn!("failed to build tick event: {e}"),
                    }
                }
            }
        }
        trace!("tick pump stopped");
    })
}
