//! Raw WebSocket link to a hub.
//!
//! Implements request-response with counter correlation, ping/pong
//! keepalive, push event dispatch, and inbound request handling for
//! agent-mode clients.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_tungstenite::tungstenite;

use roomcast_protocol::constants::{DEFAULT_KEEPALIVE_INTERVAL_MS, REQUEST_TIMEOUT, WS_MAX_MESSAGE_SIZE};
use roomcast_protocol::envelope::{Envelope, Event, Request, Response};
use roomcast_protocol::handshake::ChallengeEvent;

use crate::types::ClientError;

/// Callback type for push events from the hub.
pub type EventCallback = Box<dyn Fn(Event) + Send + Sync>;

/// Callback type for inbound requests (agent-mode clients serve
/// `agent.chat` calls pushed by the hub).
pub type RequestCallback = Box<dyn Fn(Request, LinkSender) + Send + Sync>;

/// Callback type for disconnect notification.
pub(crate) type DisconnectCallback = Arc<Mutex<Option<Box<dyn Fn() + Send + Sync>>>>;

pub(crate) type EventHandlers = Arc<Mutex<HashMap<String, EventCallback>>>;
pub(crate) type RequestHandler = Arc<Mutex<Option<RequestCallback>>>;

/// Hand-off point between the read pump and the handshake.
///
/// The hub emits `connect.challenge` as soon as the socket is accepted,
/// which can be before the handshake has started waiting for it. The
/// slot therefore buffers an early challenge until someone asks.
pub(crate) enum ChallengeState {
    Empty,
    Buffered(ChallengeEvent),
    Waiting(oneshot::Sender<ChallengeEvent>),
}

pub(crate) type ChallengeSlot = Arc<Mutex<ChallengeState>>;

/// Routes a challenge to the waiter if one is parked, otherwise keeps
/// it for the next [`Connection::await_challenge`] call. A newer
/// challenge replaces a buffered one.
pub(crate) async fn deliver_challenge(slot: &ChallengeSlot, challenge: ChallengeEvent) {
    let mut guard = slot.lock().await;
    match std::mem::replace(&mut *guard, ChallengeState::Empty) {
        ChallengeState::Waiting(tx) => {
            if let Err(challenge) = tx.send(challenge) {
                *guard = ChallengeState::Buffered(challenge);
            }
        }
        _ => *guard = ChallengeState::Buffered(challenge),
    }
}

pub(crate) async fn wait_challenge(
    slot: &ChallengeSlot,
    timeout: Duration,
) -> Result<ChallengeEvent, ClientError> {
    let rx = {
        let mut guard = slot.lock().await;
        match std::mem::replace(&mut *guard, ChallengeState::Empty) {
            ChallengeState::Buffered(challenge) => return Ok(challenge),
            ChallengeState::Waiting(_) | ChallengeState::Empty => {
                let (tx, rx) = oneshot::channel();
                *guard = ChallengeState::Waiting(tx);
                rx
            }
        }
    };
    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(challenge)) => Ok(challenge),
        Ok(Err(_)) => Err(ClientError::Closed),
        Err(_) => Err(ClientError::Handshake("no challenge from hub".into())),
    }
}

/// Cloneable handle for writing envelopes to the link out of band,
/// used by request handlers to reply and stream events.
#[derive(Clone)]
pub struct LinkSender {
    write_tx: mpsc::Sender<tungstenite::Message>,
}

impl LinkSender {
    pub(crate) fn from_write_tx(write_tx: mpsc::Sender<tungstenite::Message>) -> Self {
        Self { write_tx }
    }

    /// Sends an envelope, failing if the link is gone.
    pub async fn send(&self, envelope: &Envelope) -> Result<(), ClientError> {
        let json = envelope.to_text()?;
        self.write_tx
            .send(tungstenite::Message::Text(json.into()))
            .await
            .map_err(|_| ClientError::Closed)
    }

    /// Sends a response to an inbound request.
    pub async fn respond(&self, response: Response) -> Result<(), ClientError> {
        self.send(&Envelope::Res(response)).await
    }

    /// Sends a fire-and-forget event.
    pub async fn emit(&self, event: Event) -> Result<(), ClientError> {
        self.send(&Envelope::Event(event)).await
    }
}

/// WebSocket link to a single hub.
///
/// The link carries no session semantics of its own. Authentication
/// happens through the handshake performed by the endpoint after
/// [`Connection::connect`] returns.
pub struct Connection {
    write_tx: mpsc::Sender<tungstenite::Message>,
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<Response>>>>,
    next_id: AtomicU64,
    handlers: EventHandlers,
    on_request: RequestHandler,
    on_disconnect: DisconnectCallback,
    challenge: ChallengeSlot,
    /// Read deadline: the link is declared dead if nothing arrives for
    /// this long. Updated once the handshake learns the hub's keepalive
    /// policy.
    idle_timeout: Arc<std::sync::Mutex<Duration>>,
    _read_handle: tokio::task::JoinHandle<()>,
    _write_handle: tokio::task::JoinHandle<()>,
    cancel: tokio_util::sync::CancellationToken,
}

impl Connection {
    /// Connects to a hub WebSocket and starts the pumps.
    pub async fn connect(url: &str) -> Result<Self, ClientError> {
        let mut ws_config = tungstenite::protocol::WebSocketConfig::default();
        ws_config.max_message_size = Some(WS_MAX_MESSAGE_SIZE);
        ws_config.max_frame_size = Some(WS_MAX_MESSAGE_SIZE);
        let (ws_stream, _) =
            tokio_tungstenite::connect_async_with_config(url, Some(ws_config), false).await?;
        let (write, read) = ws_stream.split();

        let (write_tx, write_rx) = mpsc::channel::<tungstenite::Message>(256);
        let pending: Arc<Mutex<HashMap<u64, oneshot::Sender<Response>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let handlers: EventHandlers = Arc::new(Mutex::new(HashMap::new()));
        let on_request: RequestHandler = Arc::new(Mutex::new(None));
        let on_disconnect: DisconnectCallback = Arc::new(Mutex::new(None));
        let challenge: ChallengeSlot = Arc::new(Mutex::new(ChallengeState::Empty));
        let idle_timeout = Arc::new(std::sync::Mutex::new(Duration::from_millis(
            DEFAULT_KEEPALIVE_INTERVAL_MS * 2,
        )));
        let cancel = tokio_util::sync::CancellationToken::new();

        let write_handle = {
            let cancel = cancel.clone();
            tokio::spawn(crate::pumps::write::write_pump(write, write_rx, cancel))
        };

        let read_handle = {
            let pending = pending.clone();
            let handlers = handlers.clone();
            let on_request = on_request.clone();
            let on_disconnect = on_disconnect.clone();
            let challenge = challenge.clone();
            let idle_timeout = idle_timeout.clone();
            let cancel = cancel.clone();
            let write_tx = write_tx.clone();
            tokio::spawn(crate::pumps::read::read_pump(
                read,
                pending,
                handlers,
                on_request,
                on_disconnect,
                challenge,
                idle_timeout,
                write_tx,
                cancel,
            ))
        };

        Ok(Self {
            write_tx,
            pending,
            next_id: AtomicU64::new(1),
            handlers,
            on_request,
            on_disconnect,
            challenge,
            idle_timeout,
            _read_handle: read_handle,
            _write_handle: write_handle,
            cancel,
        })
    }

    /// Sends a request and waits for the response with the default timeout.
    pub async fn request<T: serde::Serialize>(
        &self,
        method: &str,
        params: Option<&T>,
    ) -> Result<Response, ClientError> {
        self.request_with_timeout(method, params, REQUEST_TIMEOUT)
            .await
    }

    /// Sends a request and waits for the response.
    ///
    /// A response with `ok: false` is surfaced as [`ClientError::Rejected`].
    pub async fn request_with_timeout<T: serde::Serialize>(
        &self,
        method: &str,
        params: Option<&T>,
        timeout: Duration,
    ) -> Result<Response, ClientError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let req = Request::new(id, method, params)?;
        let json = Envelope::Req(req).to_text()?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        self.write_tx
            .send(tungstenite::Message::Text(json.into()))
            .await
            .map_err(|_| ClientError::Closed)?;

        let result = tokio::time::timeout(timeout, rx).await;

        // Clean up pending entry on any exit path.
        self.pending.lock().await.remove(&id);

        match result {
            Ok(Ok(resp)) => {
                if !resp.ok {
                    let (code, message) = match &resp.error {
                        Some(err) => (err.code.clone(), err.message.clone()),
                        None => ("internal".into(), "unspecified error".into()),
                    };
                    return Err(ClientError::Rejected { code, message });
                }
                Ok(resp)
            }
            Ok(Err(_)) => Err(ClientError::Closed),
            Err(_) => Err(ClientError::Timeout),
        }
    }

    /// Sends a fire-and-forget event to the hub.
    pub async fn emit(&self, event: Event) -> Result<(), ClientError> {
        self.sender().emit(event).await
    }

    /// Waits for the hub's `connect.challenge` event. Returns
    /// immediately if the read pump already saw one.
    pub async fn await_challenge(&self, timeout: Duration) -> Result<ChallengeEvent, ClientError> {
        wait_challenge(&self.challenge, timeout).await
    }

    /// Registers a callback for a named push event.
    pub async fn on_event(&self, name: &str, cb: EventCallback) {
        self.handlers.lock().await.insert(name.to_string(), cb);
    }

    /// Sets the handler for inbound requests from the hub.
    pub async fn set_request_handler(&self, cb: RequestCallback) {
        *self.on_request.lock().await = Some(cb);
    }

    /// Sets the callback for disconnection.
    pub async fn set_disconnect_callback(&self, cb: Box<dyn Fn() + Send + Sync>) {
        *self.on_disconnect.lock().await = Some(cb);
    }

    /// Updates the read deadline after the handshake learns the hub's
    /// keepalive interval. The deadline is twice the interval, so a
    /// single missed tick is tolerated.
    pub fn set_keepalive_interval(&self, interval: Duration) {
        if let Ok(mut t) = self.idle_timeout.lock() {
            *t = interval * 2;
        }
    }

    /// Returns a cloneable out-of-band sender for this link.
    pub fn sender(&self) -> LinkSender {
        LinkSender {
            write_tx: self.write_tx.clone(),
        }
    }

    /// Gracefully closes the connection.
    pub async fn close(&self) {
        self.cancel.cancel();
        let _ = self.write_tx.send(tungstenite::Message::Close(None)).await;
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.cancel.cancel();
        self._read_handle.abort();
        self._write_handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn challenge(nonce: &str) -> ChallengeEvent {
        ChallengeEvent {
            nonce: nonce.to_string(),
            ts: "2026-01-01T00:00:00.000Z".to_string(),
        }
    }

    #[tokio::test]
    async fn challenge_before_waiter_is_buffered() {
        let slot: ChallengeSlot = Arc::new(Mutex::new(ChallengeState::Empty));

        // The hub's challenge lands before the handshake starts waiting.
        deliver_challenge(&slot, challenge("early-nonce")).await;

        let got = wait_challenge(&slot, Duration::from_millis(100))
            .await
            .expect("buffered challenge must be returned");
        assert_eq!(got.nonce, "early-nonce");
    }

    #[tokio::test]
    async fn challenge_wakes_a_parked_waiter() {
        let slot: ChallengeSlot = Arc::new(Mutex::new(ChallengeState::Empty));

        let waiter = {
            let slot = slot.clone();
            tokio::spawn(async move { wait_challenge(&slot, Duration::from_secs(2)).await })
        };
        tokio::task::yield_now().await;

        deliver_challenge(&slot, challenge("late-nonce")).await;

        let got = waiter.await.unwrap().expect("waiter must see the challenge");
        assert_eq!(got.nonce, "late-nonce");
    }

    #[tokio::test]
    async fn newer_challenge_replaces_a_buffered_one() {
        let slot: ChallengeSlot = Arc::new(Mutex::new(ChallengeState::Empty));

        deliver_challenge(&slot, challenge("stale")).await;
        deliver_challenge(&slot, challenge("fresh")).await;

        let got = wait_challenge(&slot, Duration::from_millis(100)).await.unwrap();
        assert_eq!(got.nonce, "fresh");
    }

    #[tokio::test]
    async fn wait_without_challenge_times_out() {
        let slot: ChallengeSlot = Arc::new(Mutex::new(ChallengeState::Empty));
        let result = wait_challenge(&slot, Duration::from_millis(20)).await;
        assert!(matches!(result, Err(ClientError::Handshake(_))));
    }

    #[test]
    fn client_error_display() {
        assert_eq!(ClientError::Timeout.to_string(), "request timed out");
        assert_eq!(ClientError::Closed.to_string(), "connection closed");

        let err = ClientError::Rejected {
            code: "forbidden".into(),
            message: "not a member".into(),
        };
        assert!(err.to_string().contains("forbidden"));
        assert!(err.to_string().contains("not a member"));
    }
}
