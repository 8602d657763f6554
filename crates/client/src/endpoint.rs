//! Managed endpoint: one hub link with automatic reconnection.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{Mutex, RwLock, mpsc};
use tracing::{debug, info, warn};

use roomcast_identity::{DeviceIdentity, TokenStore};
use roomcast_protocol::envelope::{Event, Request, Response};

use crate::connection::{Connection, LinkSender};
use crate::reconnect::{
    LinkContext, cancel_any_reconnect, dial_and_handshake, set_state, wire_connection,
};
use crate::types::{BackoffConfig, ClientError, EndpointConfig, LinkEvent, LinkState};

/// A managed link to one hub.
///
/// `connect` is idempotent, `call` only works while connected, and
/// unexpected drops trigger a background reconnect loop that keeps the
/// registered handlers across links.
pub struct Endpoint {
    ctx: LinkContext,
    events_rx: Mutex<Option<mpsc::Receiver<LinkEvent>>>,
    /// Serializes `connect` calls: a second caller waits for the
    /// in-flight dial instead of racing it with a duplicate one.
    connect_lock: Mutex<()>,
}

impl Endpoint {
    /// Creates a new endpoint. Nothing is dialed until
    /// [`connect`](Self::connect) is called.
    pub fn new(
        config: EndpointConfig,
        identity: Arc<DeviceIdentity>,
        token_store: Option<Arc<TokenStore>>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(64);
        let ctx = LinkContext {
            config,
            identity,
            token_store,
            conn: Arc::new(Mutex::new(None)),
            state: Arc::new(RwLock::new(LinkState::Disconnected)),
            handlers: Arc::new(std::sync::Mutex::new(Vec::new())),
            request_handler: Arc::new(std::sync::Mutex::new(None)),
            events_tx,
            reconnect_cancel: Arc::new(std::sync::Mutex::new(None)),
            manual_disconnect: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            backoff: BackoffConfig::default(),
        };
        Self {
            ctx,
            events_rx: Mutex::new(Some(events_rx)),
            connect_lock: Mutex::new(()),
        }
    }

    /// Overrides the reconnect backoff. Must be called before `connect`.
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.ctx.backoff = backoff;
        self
    }

    /// Takes the event receiver. Can only be called once.
    pub async fn take_events(&self) -> Option<mpsc::Receiver<LinkEvent>> {
        self.events_rx.lock().await.take()
    }

    /// Returns the current link state.
    pub async fn state(&self) -> LinkState {
        self.ctx.state.read().await.clone()
    }

    /// Returns `true` if the link is connected and authenticated.
    pub async fn is_connected(&self) -> bool {
        matches!(*self.ctx.state.read().await, LinkState::Connected)
    }

    /// Connects and performs the handshake. Idempotent while connecting
    /// or connected: a concurrent call waits for the in-flight dial and
    /// then returns without dialing again; calling while connected is a
    /// no-op.
    pub async fn connect(&self) -> Result<(), ClientError> {
        let _dialing = self.connect_lock.lock().await;
        if self.is_connected().await {
            return Ok(());
        }

        cancel_any_reconnect(&self.ctx.reconnect_cancel);
        self.ctx.manual_disconnect.store(false, Ordering::Relaxed);
        set_state(&self.ctx, LinkState::Connecting).await;

        match dial_and_handshake(&self.ctx).await {
            Ok((conn, _accepted)) => {
                wire_connection(&conn, self.ctx.clone()).await;
                *self.ctx.conn.lock().await = Some(conn);
                set_state(&self.ctx, LinkState::Connected).await;
                info!(url = %self.ctx.config.url, "connected to hub");
                Ok(())
            }
            Err(ClientError::PairingRequired) => {
                set_state(&self.ctx, LinkState::PairingRequired).await;
                Err(ClientError::PairingRequired)
            }
            Err(e) => {
                warn!(url = %self.ctx.config.url, error = %e, "connection failed");
                set_state(&self.ctx, LinkState::Disconnected).await;
                Err(e)
            }
        }
    }

    /// Disconnects (user-initiated). No reconnect will follow.
    pub async fn disconnect(&self) {
        self.ctx.manual_disconnect.store(true, Ordering::Relaxed);
        cancel_any_reconnect(&self.ctx.reconnect_cancel);
        if let Some(conn) = self.ctx.conn.lock().await.take() {
            conn.close().await;
        }
        set_state(&self.ctx, LinkState::Disconnected).await;
        debug!("disconnected from hub");
    }

    /// Calls a hub method and deserializes the response payload.
    ///
    /// Fails with [`ClientError::Closed`] when the link is down; calls
    /// are never queued across reconnects.
    pub async fn call<T: Serialize, R: DeserializeOwned>(
        &self,
        method: &str,
        params: Option<&T>,
    ) -> Result<R, ClientError> {
        let resp = self.call_raw(method, params).await?;
        Ok(resp.parse_payload()?)
    }

    /// Calls a hub method, returning the raw response.
    pub async fn call_raw<T: Serialize>(
        &self,
        method: &str,
        params: Option<&T>,
    ) -> Result<Response, ClientError> {
        let conn = self.current_conn().await?;
        conn.request(method, params).await
    }

    /// Calls a hub method with a custom timeout, for slow operations
    /// such as agent completions.
    pub async fn call_with_timeout<T: Serialize>(
        &self,
        method: &str,
        params: Option<&T>,
        timeout: Duration,
    ) -> Result<Response, ClientError> {
        let conn = self.current_conn().await?;
        conn.request_with_timeout(method, params, timeout).await
    }

    /// Registers a handler for a named push event. Handlers survive
    /// reconnects.
    pub async fn on(&self, event: &str, handler: impl Fn(Event) + Send + Sync + 'static) {
        let handler: Arc<dyn Fn(Event) + Send + Sync> = Arc::new(handler);
        if let Ok(mut handlers) = self.ctx.handlers.lock() {
            handlers.retain(|(name, _)| name != event);
            handlers.push((event.to_string(), handler.clone()));
        }
        if let Some(conn) = self.ctx.conn.lock().await.as_ref() {
            let h = handler.clone();
            conn.on_event(event, Box::new(move |ev| h(ev))).await;
        }
    }

    /// Sets the handler for requests pushed by the hub (agent mode).
    /// The handler survives reconnects.
    pub async fn serve_requests(
        &self,
        handler: impl Fn(Request, LinkSender) + Send + Sync + 'static,
    ) {
        let handler: Arc<dyn Fn(Request, LinkSender) + Send + Sync> = Arc::new(handler);
        if let Ok(mut slot) = self.ctx.request_handler.lock() {
            *slot = Some(handler.clone());
        }
        if let Some(conn) = self.ctx.conn.lock().await.as_ref() {
            let h = handler.clone();
            conn.set_request_handler(Box::new(move |req, sender| h(req, sender)))
                .await;
        }
    }

    /// Returns an out-of-band sender for the current link.
    pub async fn sender(&self) -> Result<LinkSender, ClientError> {
        Ok(self.current_conn().await?.sender())
    }

    async fn current_conn(&self) -> Result<Arc<Connection>, ClientError> {
        if !self.is_connected().await {
            return Err(ClientError::Closed);
        }
        self.ctx
            .conn
            .lock()
            .await
            .clone()
            .ok_or(ClientError::Closed)
    }
}
