//! The hub WebSocket acceptor.
//!
//! Listens on a TCP port, upgrades each connection, drives the
//! challenge handshake and then serves the session: RPC dispatch, room
//! resubscription, liveness ticks and the read deadline.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_tungstenite::accept_async_with_config;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use roomcast_identity::{TokenStore, generate_token};
use roomcast_protocol::constants::{
    DEFAULT_KEEPALIVE_INTERVAL_MS, HANDSHAKE_TIMEOUT, PROTOCOL_VERSION, WS_MAX_MESSAGE_SIZE,
    codes, events, methods, now_ts,
};
use roomcast_protocol::envelope::{Envelope, Event, Request};
use roomcast_protocol::handshake::{ChallengeEvent, ConnectAccepted, ConnectRequest, HandshakePolicy};

use crate::HubError;
use crate::connection::{Sender, spawn_tick_pump, spawn_write_pump};
use crate::handshake::{SessionInfo, new_nonce, validate_connect};
use crate::rpc::{self, HubContext};

/// Hub server configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// TCP port to listen on (0 = OS-assigned).
    pub port: u16,
    /// Static pairing credential new devices must present.
    pub static_token: String,
    /// Interval promised to clients in the handshake policy.
    pub keepalive_interval: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            port: 0,
            static_token: String::new(),
            keepalive_interval: Duration::from_millis(DEFAULT_KEEPALIVE_INTERVAL_MS),
        }
    }
}

/// The hub WebSocket server.
pub struct HubServer {
    config: HubConfig,
    ctx: Arc<HubContext>,
    tokens: Arc<TokenStore>,
    cancel: CancellationToken,
    local_addr: Mutex<Option<SocketAddr>>,
    next_conn_id: AtomicU64,
}

impl HubServer {
    pub fn new(config: HubConfig, ctx: Arc<HubContext>, tokens: Arc<TokenStore>) -> Arc<Self> {
        Arc::new(Self {
            config,
            ctx,
            tokens,
            cancel: CancellationToken::new(),
            local_addr: Mutex::new(None),
            next_conn_id: AtomicU64::new(1),
        })
    }

    /// Returns the bound address, once [`run`](Self::run) has bound it.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().await
    }

    /// Returns the listening port (0 if not yet bound).
    pub async fn port(&self) -> u16 {
        self.local_addr.lock().await.map(|a| a.port()).unwrap_or(0)
    }

    /// Gracefully shuts down the server and every session.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Runs the accept loop until cancellation.
    pub async fn run(self: &Arc<Self>) -> Result<(), HubError> {
        let addr: SocketAddr = ([0, 0, 0, 0], self.config.port).into();
        let listener = TcpListener::bind(addr).await?;

        let local_addr = listener.local_addr()?;
        *self.local_addr.lock().await = Some(local_addr);
        info!("hub listening on {local_addr}");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("hub shutting down");
                    break Ok(());
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let server = Arc::clone(self);
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream, peer_addr).await {
                                    debug!(%peer_addr, "connection ended with error: {e}");
                                }
                            });
                        }
                        Err(e) => {
                            warn!("accept error: {e}");
                        }
                    }
                }
            }
        }
    }

    /// Drives one connection from upgrade to teardown.
    async fn handle_connection(
        self: &Arc<Self>,
        stream: TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), HubError> {
        let mut ws_config = tokio_tungstenite::tungstenite::protocol::WebSocketConfig::default();
        ws_config.max_message_size = Some(WS_MAX_MESSAGE_SIZE);
        ws_config.max_frame_size = Some(WS_MAX_MESSAGE_SIZE);
        let ws_stream = accept_async_with_config(stream, Some(ws_config)).await?;
        trace!(%peer_addr, "websocket established");

        // Each session gets a child token so server shutdown tears it
        // down but one session's teardown never touches another.
        let conn_cancel = self.cancel.child_token();
        let (sink, mut stream) = ws_stream.split();
        let (sender, _write_handle) = spawn_write_pump(sink, conn_cancel.clone());

        let session = match self
            .accept_handshake(&sender, &mut stream, peer_addr)
            .await
        {
            Ok(Some(session)) => Arc::new(session),
            Ok(None) => {
                // Let the queued rejection flush before the Close frame.
                tokio::time::sleep(Duration::from_millis(50)).await;
                conn_cancel.cancel();
                return Ok(());
            }
            Err(e) => {
                conn_cancel.cancel();
                return Err(e);
            }
        };

        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        info!(%peer_addr, conn_id, device = %session.device_id, "session established");

        self.ctx
            .registry
            .register(conn_id, &session.user_id, sender.clone())
            .await;

        // Resubscribe every room the user is already a member of.
        match self.ctx.store.rooms_for_user(&session.user_id) {
            Ok(rooms) => {
                for room in rooms {
                    self.ctx.registry.subscribe(conn_id, &room.id).await;
                }
            }
            Err(e) => warn!(conn_id, "failed to resubscribe rooms: {e}"),
        }

        let tick_handle =
            spawn_tick_pump(sender.clone(), self.config.keepalive_interval, conn_cancel.clone());

        self.read_loop(conn_id, &session, &sender, &mut stream, &conn_cancel)
            .await;

        conn_cancel.cancel();
        tick_handle.abort();
        self.ctx.registry.unregister(conn_id).await;
        info!(conn_id, device = %session.device_id, "session closed");
        Ok(())
    }

    /// Pushes the challenge and waits for a valid `connect` request.
    ///
    /// `Ok(None)` means the handshake was rejected or abandoned; the
    /// rejection response, if any, has already been queued.
    async fn accept_handshake(
        &self,
        sender: &Sender,
        stream: &mut (impl StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
              + Unpin),
        peer_addr: SocketAddr,
    ) -> Result<Option<SessionInfo>, HubError> {
        let nonce = new_nonce();
        let challenge = ChallengeEvent {
            nonce: nonce.clone(),
            ts: now_ts(),
        };
        sender.emit(Event::new(events::CONNECT_CHALLENGE, Some(&challenge))?);

        let connect_req = match tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            self.await_connect(sender, stream),
        )
        .await
        {
            Ok(Ok(Some(req))) => req,
            Ok(Ok(None)) => return Ok(None),
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                debug!(%peer_addr, "handshake timed out");
                return Ok(None);
            }
        };

        let params: ConnectRequest = match connect_req.parse_params() {
            Ok(params) => params,
            Err(e) => {
                sender.respond(
                    connect_req.reply_error(codes::INVALID_PARAMS, format!("bad connect: {e}")),
                );
                return Ok(None);
            }
        };

        let stored = self.tokens.get_token(&params.device.id);
        let session = match validate_connect(
            &params,
            &nonce,
            chrono::Utc::now(),
            &self.config.static_token,
            stored.as_deref(),
        ) {
            Ok(session) => session,
            Err(reject) => {
                debug!(%peer_addr, code = reject.code, "handshake rejected: {}", reject.message);
                sender.respond(connect_req.reply_error(reject.code, reject.message));
                return Ok(None);
            }
        };

        // Rotate the device token on every successful handshake.
        let device_token = generate_token();
        if let Err(e) = self.tokens.save_token(&session.device_id, &device_token) {
            warn!(device = %session.device_id, "failed to persist device token: {e}");
        }

        let accepted = ConnectAccepted {
            device_token,
            policy: HandshakePolicy {
                keepalive_interval_ms: self.config.keepalive_interval.as_millis() as u64,
            },
            protocol: PROTOCOL_VERSION,
        };
        sender.respond(connect_req.reply(Some(&accepted))?);

        Ok(Some(session))
    }

    /// Reads frames until the `connect` request arrives. Any other
    /// request before the handshake is rejected and the wait continues.
    /// `Ok(None)` means the peer closed first.
    async fn await_connect(
        &self,
        sender: &Sender,
        stream: &mut (impl StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
              + Unpin),
    ) -> Result<Option<Request>, HubError> {
        loop {
            let msg = match stream.next().await {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => return Err(HubError::WebSocket(e)),
                None => return Ok(None),
            };
            match msg {
                Message::Text(text) => match Envelope::from_text(text.as_str()) {
                    Ok(Envelope::Req(req)) if req.method == methods::CONNECT => {
                        return Ok(Some(req));
                    }
                    Ok(Envelope::Req(req)) => {
                        sender.respond(
                            req.reply_error(codes::FORBIDDEN, "handshake required"),
                        );
                    }
                    Ok(_) => {}
                    Err(e) => debug!("malformed frame before handshake: {e}"),
                },
                Message::Ping(data) => {
                    sender.try_send(Message::Pong(data));
                }
                Message::Close(_) => return Ok(None),
                _ => {}
            }
        }
    }

    /// Serves an authenticated session until close, cancellation or
    /// the read deadline. Any inbound frame counts as liveness.
    async fn read_loop(
        self: &Arc<Self>,
        conn_id: u64,
        session: &Arc<SessionInfo>,
        sender: &Sender,
        stream: &mut (impl StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
              + Unpin),
        conn_cancel: &CancellationToken,
    ) {
        let idle_timeout = self.config.keepalive_interval * 2;
        let deadline = tokio::time::sleep(idle_timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = conn_cancel.cancelled() => {
                    trace!(conn_id, "session cancelled");
                    break;
                }

                _ = &mut deadline => {
                    debug!(conn_id, "read deadline expired, dropping connection");
                    break;
                }

                msg = stream.next() => {
                    let msg = match msg {
                        Some(Ok(msg)) => msg,
                        Some(Err(e)) => {
                            debug!(conn_id, "read error: {e}");
                            break;
                        }
                        None => break,
                    };
                    deadline.as_mut().reset(tokio::time::Instant::now() + idle_timeout);

                    match msg {
                        Message::Text(text) => match Envelope::from_text(text.as_str()) {
                            Ok(Envelope::Req(req)) => {
                                let ctx = self.ctx.clone();
                                let session = session.clone();
                                let sender = sender.clone();
                                tokio::spawn(async move {
                                    rpc::dispatch(ctx, session, conn_id, req, sender).await;
                                });
                            }
                            Ok(Envelope::Res(res)) => {
                                trace!(conn_id, id = res.id, "unexpected response frame");
                            }
                            Ok(Envelope::Event(ev)) => {
                                trace!(conn_id, event = %ev.event, "ignoring client event");
                            }
                            Err(e) => debug!(conn_id, "malformed frame: {e}"),
                        },
                        Message::Ping(data) => {
                            sender.try_send(Message::Pong(data));
                        }
                        Message::Close(_) => {
                            trace!(conn_id, "peer closed");
                            break;
                        }
                        _ => {}
                    }
                }
            }
        }
    }
}
