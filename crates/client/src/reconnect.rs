//! Automatic reconnection with exponential backoff.
//!
//! Contains the shared [`LinkContext`], cancellation helpers, connection
//! wiring, and the reconnect loop.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use roomcast_identity::{DeviceIdentity, TokenStore};
use roomcast_protocol::envelope::{Event, Request};
use roomcast_protocol::handshake::ConnectAccepted;

use crate::connection::{Connection, LinkSender};
use crate::handshake::perform_handshake;
use crate::types::{BackoffConfig, ClientError, EndpointConfig, LinkEvent, LinkState};

/// Handlers kept by the endpoint so they survive reconnects: each new
/// connection gets them re-registered.
pub(crate) type SharedEventHandlers =
    Arc<std::sync::Mutex<Vec<(String, Arc<dyn Fn(Event) + Send + Sync>)>>>;
pub(crate) type SharedRequestHandler =
    Arc<std::sync::Mutex<Option<Arc<dyn Fn(Request, LinkSender) + Send + Sync>>>>;

/// Shared state passed to free functions for connection wiring and
/// reconnection. Avoids threading a dozen separate Arc parameters.
#[derive(Clone)]
pub(crate) struct LinkContext {
    pub(crate) config: EndpointConfig,
    pub(crate) identity: Arc<DeviceIdentity>,
    pub(crate) token_store: Option<Arc<TokenStore>>,
    pub(crate) conn: Arc<Mutex<Option<Arc<Connection>>>>,
    pub(crate) state: Arc<RwLock<LinkState>>,
    pub(crate) handlers: SharedEventHandlers,
    pub(crate) request_handler: SharedRequestHandler,
    pub(crate) events_tx: mpsc::Sender<LinkEvent>,
    pub(crate) reconnect_cancel: Arc<std::sync::Mutex<Option<CancellationToken>>>,
    pub(crate) manual_disconnect: Arc<AtomicBool>,
    pub(crate) backoff: BackoffConfig,
}

/// Cancels any active reconnect loop.
pub(crate) fn cancel_any_reconnect(
    reconnect_cancel: &std::sync::Mutex<Option<CancellationToken>>,
) {
    if let Ok(mut guard) = reconnect_cancel.lock()
        && let Some(token) = guard.take()
    {
        token.cancel();
    }
}

/// Updates the link state and emits a [`LinkEvent::StateChanged`].
pub(crate) async fn set_state(ctx: &LinkContext, new_state: LinkState) {
    *ctx.state.write().await = new_state.clone();
    let _ = ctx.events_tx.send(LinkEvent::StateChanged(new_state)).await;
}

/// Sync variant for use inside the disconnect callback.
fn try_set_state(ctx: &LinkContext, new_state: LinkState) {
    if let Ok(mut s) = ctx.state.try_write() {
        *s = new_state.clone();
    }
    let _ = ctx.events_tx.try_send(LinkEvent::StateChanged(new_state));
}

/// Dials the hub and performs the handshake, preferring a stored device
/// token over the bootstrap credential. A freshly issued device token is
/// persisted for the next connection.
pub(crate) async fn dial_and_handshake(
    ctx: &LinkContext,
) -> Result<(Arc<Connection>, ConnectAccepted), ClientError> {
    let token = ctx
        .token_store
        .as_ref()
        .and_then(|s| s.get_token(&ctx.config.url))
        .unwrap_or_else(|| ctx.config.token.clone());

    let conn = Connection::connect(&ctx.config.url).await?;
    let accepted = perform_handshake(&conn, &ctx.config, &ctx.identity, &token).await?;

    if let Some(store) = &ctx.token_store
        && let Err(e) = store.save_token(&ctx.config.url, &accepted.device_token)
    {
        warn!("failed to persist device token: {e}");
    }

    Ok((Arc::new(conn), accepted))
}

/// Registers the endpoint's handlers and the disconnect callback (with
/// reconnect logic) on a freshly handshaken connection.
pub(crate) async fn wire_connection(conn: &Connection, ctx: LinkContext) {
    let registered: Vec<(String, Arc<dyn Fn(Event) + Send + Sync>)> = ctx
        .handlers
        .lock()
        .map(|h| h.clone())
        .unwrap_or_default();
    for (name, handler) in registered {
        let handler = handler.clone();
        conn.on_event(&name, Box::new(move |ev| handler(ev))).await;
    }

    let request_handler = ctx.request_handler.lock().ok().and_then(|h| h.clone());
    if let Some(handler) = request_handler {
        conn.set_request_handler(Box::new(move |req, sender| handler(req, sender)))
            .await;
    }

    // Disconnect callback — handles manual and unexpected disconnects.
    let ctx_dc = ctx;
    conn.set_disconnect_callback(Box::new(move || {
        // Always clear the connection slot.
        if let Ok(mut c) = ctx_dc.conn.try_lock() {
            *c = None;
        }

        if ctx_dc.manual_disconnect.load(Ordering::Relaxed) {
            try_set_state(&ctx_dc, LinkState::Disconnected);
        } else {
            try_set_state(&ctx_dc, LinkState::Disconnected);

            let cancel = CancellationToken::new();
            cancel_any_reconnect(&ctx_dc.reconnect_cancel);
            if let Ok(mut guard) = ctx_dc.reconnect_cancel.lock() {
                *guard = Some(cancel.clone());
            }

            tokio::spawn(reconnect_loop(ctx_dc.clone(), cancel));
        }
    }))
    .await;
}

/// Reconnection loop with exponential backoff.
///
/// Returns a boxed future to break the recursive type cycle with
/// `wire_connection` (which spawns this function from its disconnect
/// callback).
pub(crate) fn reconnect_loop(
    ctx: LinkContext,
    cancel: CancellationToken,
) -> Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
    Box::pin(async move {
        let mut attempt: u32 = 0;

        loop {
            let delay = ctx.backoff.delay_for_attempt(attempt);
            set_state(&ctx, LinkState::Reconnecting { attempt: attempt + 1 }).await;

            info!(
                attempt = attempt + 1,
                delay_secs = format_args!("{:.1}", delay.as_secs_f64()),
                "reconnecting to hub"
            );

            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("reconnect cancelled");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
            if cancel.is_cancelled() {
                return;
            }

            match dial_and_handshake(&ctx).await {
                Ok((conn, _accepted)) => {
                    wire_connection(&conn, ctx.clone()).await;
                    *ctx.conn.lock().await = Some(conn);
                    set_state(&ctx, LinkState::Connected).await;
                    info!("reconnected to hub");
                    break;
                }
                Err(ClientError::PairingRequired) => {
                    // Our credential is no longer recognized. Retrying
                    // with the same one cannot succeed.
                    warn!("hub requires re-pairing, stopping reconnect");
                    set_state(&ctx, LinkState::PairingRequired).await;
                    break;
                }
                Err(e) => {
                    warn!(attempt = attempt + 1, error = %e, "reconnect attempt failed");
                    attempt = attempt.saturating_add(1);
                }
            }

            if cancel.is_cancelled() {
                return;
            }
        }

        if let Ok(mut guard) = ctx.reconnect_cancel.lock() {
            *guard = None;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use roomcast_protocol::handshake::ClientInfo;

    fn test_ctx(events_tx: mpsc::Sender<LinkEvent>) -> (tempfile::TempDir, LinkContext) {
        let tmp = tempfile::tempdir().unwrap();
        let identity = DeviceIdentity::load_or_create(&tmp.path().join("device.json")).unwrap();
        let ctx = LinkContext {
            config: EndpointConfig {
                // Port 1 is never listening; dials fail fast.
                url: "ws://127.0.0.1:1/ws".into(),
                client: ClientInfo {
                    id: "client-test".into(),
                    display_name: "Test".into(),
                    version: "0.1.0".into(),
                    platform: "linux".into(),
                    mode: "interactive".into(),
                },
                role: "user".into(),
                scopes: vec!["chat".into()],
                caps: vec![],
                token: "test-token".into(),
            },
            identity: Arc::new(identity),
            token_store: None,
            conn: Arc::new(Mutex::new(None)),
            state: Arc::new(RwLock::new(LinkState::Disconnected)),
            handlers: Arc::new(std::sync::Mutex::new(Vec::new())),
            request_handler: Arc::new(std::sync::Mutex::new(None)),
            events_tx,
            reconnect_cancel: Arc::new(std::sync::Mutex::new(None)),
            manual_disconnect: Arc::new(AtomicBool::new(false)),
            backoff: BackoffConfig {
                base: Duration::from_millis(5),
                multiplier: 2.0,
                cap: Duration::from_millis(40),
            },
        };
        (tmp, ctx)
    }

    /// Pulls `Reconnecting` attempt numbers off the event stream.
    async fn next_attempt(events_rx: &mut mpsc::Receiver<LinkEvent>) -> u32 {
        loop {
            match events_rx.recv().await {
                Some(LinkEvent::StateChanged(LinkState::Reconnecting { attempt })) => {
                    return attempt;
                }
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    }

    #[tokio::test]
    async fn attempt_counter_resets_for_each_new_loop() {
        let (events_tx, mut events_rx) = mpsc::channel(64);
        let (_tmp, ctx) = test_ctx(events_tx);

        // First drop: let the counter escalate across failed dials.
        let cancel = CancellationToken::new();
        let first = tokio::spawn(reconnect_loop(ctx.clone(), cancel.clone()));
        assert_eq!(next_attempt(&mut events_rx).await, 1);
        assert_eq!(next_attempt(&mut events_rx).await, 2);
        assert_eq!(next_attempt(&mut events_rx).await, 3);
        cancel.cancel();
        let _ = first.await;
        while events_rx.try_recv().is_ok() {}

        // A later drop spawns a fresh loop; the escalation from the
        // previous outage must not carry over.
        let cancel = CancellationToken::new();
        let second = tokio::spawn(reconnect_loop(ctx.clone(), cancel.clone()));
        assert_eq!(
            next_attempt(&mut events_rx).await,
            1,
            "a new reconnect loop must start at the base delay"
        );
        cancel.cancel();
        let _ = second.await;
    }

    #[test]
    fn cancel_any_reconnect_clears_token() {
        let cancel = std::sync::Mutex::new(None);
        let token = CancellationToken::new();
        *cancel.lock().unwrap() = Some(token.clone());

        cancel_any_reconnect(&cancel);

        assert!(cancel.lock().unwrap().is_none());
        assert!(token.is_cancelled());
    }

    #[test]
    fn cancel_any_reconnect_noop_when_empty() {
        let cancel = std::sync::Mutex::new(None);
        cancel_any_reconnect(&cancel);
        assert!(cancel.lock().unwrap().is_none());
    }
}
