//! WebSocket read pump — dispatches incoming envelopes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use roomcast_protocol::constants::{WS_MAX_MESSAGE_SIZE, events};
use roomcast_protocol::envelope::{Envelope, Response};

use crate::connection::{
    ChallengeSlot, DisconnectCallback, EventHandlers, LinkSender, RequestHandler,
};

/// Reads envelopes from the WebSocket and dispatches them.
///
/// Uses an idle deadline to detect dead links: any inbound frame (ticks,
/// pongs, responses) resets the timer. If nothing arrives within the
/// deadline the link is considered dead and the loop exits, which
/// triggers the disconnect callback and, in turn, reconnection.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn read_pump<S>(
    mut read: S,
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<Response>>>>,
    handlers: EventHandlers,
    on_request: RequestHandler,
    on_disconnect: DisconnectCallback,
    challenge: ChallengeSlot,
    idle_timeout: Arc<std::sync::Mutex<Duration>>,
    write_tx: mpsc::Sender<tungstenite::Message>,
    cancel: CancellationToken,
) where
    S: StreamExt<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
{
    let deadline = tokio::time::sleep(current_timeout(&idle_timeout));
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            () = &mut deadline => {
                warn!("read deadline expired — link dead, closing");
                break;
            }

            msg = read.next() => {
                match msg {
                    Some(Ok(msg)) => {
                        deadline.as_mut().reset(
                            tokio::time::Instant::now() + current_timeout(&idle_timeout),
                        );

                        match msg {
                            tungstenite::Message::Text(text) => {
                                handle_text(
                                    &text,
                                    &pending,
                                    &handlers,
                                    &on_request,
                                    &challenge,
                                    &write_tx,
                                )
                                .await;
                            }
                            tungstenite::Message::Ping(data) => {
                                trace!("received ping, sending pong");
                                let _ = write_tx.send(tungstenite::Message::Pong(data)).await;
                            }
                            tungstenite::Message::Pong(_) => {
                                trace!("received pong");
                            }
                            tungstenite::Message::Close(_) => {
                                debug!("received close frame");
                                break;
                            }
                            _ => {} // Binary — not part of the protocol
                        }
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket read error: {e}");
                        break;
                    }
                    None => {
                        debug!("WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    // Fail any in-flight calls so their waiters see a closed link
    // instead of a timeout.
    pending.lock().await.clear();

    if let Some(cb) = on_disconnect.lock().await.as_ref() {
        cb();
    }
}

fn current_timeout(idle_timeout: &std::sync::Mutex<Duration>) -> Duration {
    idle_timeout
        .lock()
        .map(|d| *d)
        .unwrap_or(Duration::from_secs(30))
}

/// Handles one text frame from the WebSocket.
async fn handle_text(
    text: &str,
    pending: &Arc<Mutex<HashMap<u64, oneshot::Sender<Response>>>>,
    handlers: &EventHandlers,
    on_request: &RequestHandler,
    challenge: &ChallengeSlot,
    write_tx: &mpsc::Sender<tungstenite::Message>,
) {
    if text.len() > WS_MAX_MESSAGE_SIZE {
        warn!("envelope too large ({} bytes), dropping", text.len());
        return;
    }

    let envelope = match Envelope::from_text(text) {
        Ok(e) => e,
        Err(e) => {
            warn!("failed to parse envelope: {e}");
            return;
        }
    };

    match envelope {
        Envelope::Res(resp) => {
            let mut map = pending.lock().await;
            match map.remove(&resp.id) {
                Some(tx) => {
                    let _ = tx.send(resp);
                }
                None => debug!(id = resp.id, "response for unknown request id"),
            }
        }
        Envelope::Event(event) => {
            trace!(event = %event.event, "received event");

            // The challenge is consumed by the handshake, not the
            // handler registry. It may arrive before the handshake is
            // listening, so the slot buffers it.
            if event.event == events::CONNECT_CHALLENGE {
                match event.parse_payload() {
                    Ok(ch) => crate::connection::deliver_challenge(challenge, ch).await,
                    Err(e) => warn!("malformed challenge: {e}"),
                }
                return;
            }

            let guard = handlers.lock().await;
            match guard.get(&event.event) {
                Some(cb) => cb(event),
                // Unknown event names are ignorable by contract.
                None => debug!(event = %event.event, "no handler, dropping event"),
            }
        }
        Envelope::Req(req) => {
            let guard = on_request.lock().await;
            match guard.as_ref() {
                Some(cb) => {
                    let sender = LinkSender::from_write_tx(write_tx.clone());
                    cb(req, sender);
                }
                None => {
                    warn!(method = %req.method, "no request handler, replying unknown_method");
                    let resp = req.reply_error("unknown_method", "not serving requests");
                    if let Ok(json) = Envelope::Res(resp).to_text() {
                        let _ = write_tx.send(tungstenite::Message::Text(json.into())).await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ChallengeState;
    use futures_util::stream;
    use roomcast_protocol::envelope::{Event, Request};

    fn empty_parts() -> (
        Arc<Mutex<HashMap<u64, oneshot::Sender<Response>>>>,
        EventHandlers,
        RequestHandler,
        ChallengeSlot,
    ) {
        (
            Arc::new(Mutex::new(HashMap::new())),
            Arc::new(Mutex::new(HashMap::new())),
            Arc::new(Mutex::new(None)),
            Arc::new(Mutex::new(ChallengeState::Empty)),
        )
    }

    #[tokio::test]
    async fn routes_response_to_pending() {
        let (pending, handlers, on_request, challenge) = empty_parts();
        let (write_tx, _write_rx) = mpsc::channel(16);

        let (tx, rx) = oneshot::channel();
        pending.lock().await.insert(7, tx);

        let resp = Response::success(7, Some(&serde_json::json!({"ok": 1}))).unwrap();
        let json = Envelope::Res(resp).to_text().unwrap();
        handle_text(&json, &pending, &handlers, &on_request, &challenge, &write_tx).await;

        let got = rx.await.unwrap();
        assert_eq!(got.id, 7);
        assert!(got.ok);
        assert!(pending.lock().await.is_empty());
    }

    #[tokio::test]
    async fn fires_event_handler() {
        let (pending, handlers, on_request, challenge) = empty_parts();
        let (write_tx, _write_rx) = mpsc::channel(16);

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_cb = seen.clone();
        handlers.lock().await.insert(
            "room.message".into(),
            Box::new(move |ev| seen_cb.lock().unwrap().push(ev.event)),
        );

        let ev = Event::new("room.message", Some(&serde_json::json!({"body": "hi"}))).unwrap();
        let json = Envelope::Event(ev).to_text().unwrap();
        handle_text(&json, &pending, &handlers, &on_request, &challenge, &write_tx).await;

        assert_eq!(seen.lock().unwrap().as_slice(), ["room.message"]);
    }

    #[tokio::test]
    async fn unknown_event_is_dropped() {
        let (pending, handlers, on_request, challenge) = empty_parts();
        let (write_tx, _write_rx) = mpsc::channel(16);

        let ev = Event::new("future.event", Some(&serde_json::json!({}))).unwrap();
        let json = Envelope::Event(ev).to_text().unwrap();
        // Must not panic or error.
        handle_text(&json, &pending, &handlers, &on_request, &challenge, &write_tx).await;
    }

    #[tokio::test]
    async fn challenge_goes_to_waiting_slot() {
        let (pending, handlers, on_request, challenge) = empty_parts();
        let (write_tx, _write_rx) = mpsc::channel(16);

        let (tx, rx) = oneshot::channel();
        *challenge.lock().await = ChallengeState::Waiting(tx);

        let ev = Event::new(
            events::CONNECT_CHALLENGE,
            Some(&serde_json::json!({"nonce": "abc", "ts": "t"})),
        )
        .unwrap();
        let json = Envelope::Event(ev).to_text().unwrap();
        handle_text(&json, &pending, &handlers, &on_request, &challenge, &write_tx).await;

        let ch: roomcast_protocol::handshake::ChallengeEvent = rx.await.unwrap();
        assert_eq!(ch.nonce, "abc");
    }

    #[tokio::test]
    async fn early_challenge_is_kept_for_the_handshake() {
        let (pending, handlers, on_request, challenge) = empty_parts();
        let (write_tx, _write_rx) = mpsc::channel(16);

        // No waiter yet: the hub raced us to the challenge.
        let ev = Event::new(
            events::CONNECT_CHALLENGE,
            Some(&serde_json::json!({"nonce": "raced", "ts": "t"})),
        )
        .unwrap();
        let json = Envelope::Event(ev).to_text().unwrap();
        handle_text(&json, &pending, &handlers, &on_request, &challenge, &write_tx).await;

        let ch = crate::connection::wait_challenge(&challenge, Duration::from_millis(100))
            .await
            .expect("challenge consumed before the handshake asked must not be lost");
        assert_eq!(ch.nonce, "raced");
    }

    #[tokio::test]
    async fn inbound_request_reaches_handler() {
        let (pending, handlers, on_request, challenge) = empty_parts();
        let (write_tx, _write_rx) = mpsc::channel(16);

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_cb = seen.clone();
        *on_request.lock().await = Some(Box::new(move |req: Request, _sender| {
            seen_cb.lock().unwrap().push(req.method);
        }));

        let req = Request::new::<()>(3, "agent.chat", None).unwrap();
        let json = Envelope::Req(req).to_text().unwrap();
        handle_text(&json, &pending, &handlers, &on_request, &challenge, &write_tx).await;

        assert_eq!(seen.lock().unwrap().as_slice(), ["agent.chat"]);
    }

    #[tokio::test]
    async fn inbound_request_without_handler_is_rejected() {
        let (pending, handlers, on_request, challenge) = empty_parts();
        let (write_tx, mut write_rx) = mpsc::channel(16);

        let req = Request::new::<()>(9, "agent.chat", None).unwrap();
        let json = Envelope::Req(req).to_text().unwrap();
        handle_text(&json, &pending, &handlers, &on_request, &challenge, &write_tx).await;

        let reply = write_rx.recv().await.unwrap();
        let text = match reply {
            tungstenite::Message::Text(t) => t.to_string(),
            other => panic!("expected text, got {other:?}"),
        };
        match Envelope::from_text(&text).unwrap() {
            Envelope::Res(r) => {
                assert_eq!(r.id, 9);
                assert!(!r.ok);
                assert_eq!(r.error.unwrap().code, "unknown_method");
            }
            other => panic!("expected res, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn ignores_malformed_json() {
        let (pending, handlers, on_request, challenge) = empty_parts();
        let (write_tx, _write_rx) = mpsc::channel(16);
        handle_text(
            "not valid json {{{",
            &pending,
            &handlers,
            &on_request,
            &challenge,
            &write_tx,
        )
        .await;
    }

    #[tokio::test]
    async fn pump_fires_disconnect_and_drains_pending_on_stream_end() {
        let (pending, handlers, on_request, challenge) = empty_parts();
        let disconnected = Arc::new(std::sync::Mutex::new(false));
        let dc = disconnected.clone();
        let on_disconnect: DisconnectCallback = Arc::new(Mutex::new(Some(Box::new(move || {
            *dc.lock().unwrap() = true;
        }))));

        // An in-flight call whose waiter must be released.
        let (tx, rx) = oneshot::channel();
        pending.lock().await.insert(1, tx);

        let cancel = CancellationToken::new();
        let (write_tx, _write_rx) = mpsc::channel(16);
        let idle = Arc::new(std::sync::Mutex::new(Duration::from_secs(30)));
        let empty = stream::empty::<Result<tungstenite::Message, tungstenite::Error>>();

        read_pump(
            empty, pending, handlers, on_request, on_disconnect, challenge, idle, write_tx, cancel,
        )
        .await;

        assert!(*disconnected.lock().unwrap());
        assert!(rx.await.is_err(), "pending waiter should be released");
    }

    #[tokio::test]
    async fn pump_times_out_on_silence() {
        tokio::time::pause();

        let (pending, handlers, on_request, challenge) = empty_parts();
        let disconnected = Arc::new(std::sync::Mutex::new(false));
        let dc = disconnected.clone();
        let on_disconnect: DisconnectCallback = Arc::new(Mutex::new(Some(Box::new(move || {
            *dc.lock().unwrap() = true;
        }))));

        let cancel = CancellationToken::new();
        let (write_tx, _write_rx) = mpsc::channel(16);
        let idle = Arc::new(std::sync::Mutex::new(Duration::from_secs(30)));

        // A stream that never yields — total silence.
        let silent = stream::pending::<Result<tungstenite::Message, tungstenite::Error>>();

        read_pump(
            silent, pending, handlers, on_request, on_disconnect, challenge, idle, write_tx, cancel,
        )
        .await;

        assert!(
            *disconnected.lock().unwrap(),
            "should disconnect on idle deadline"
        );
    }

    #[tokio::test]
    async fn inbound_traffic_resets_deadline() {
        tokio::time::pause();

        let (pending, handlers, on_request, challenge) = empty_parts();
        let disconnected = Arc::new(std::sync::Mutex::new(false));
        let dc = disconnected.clone();
        let on_disconnect: DisconnectCallback = Arc::new(Mutex::new(Some(Box::new(move || {
            *dc.lock().unwrap() = true;
        }))));

        let cancel = CancellationToken::new();
        let (write_tx, _write_rx) = mpsc::channel(16);
        let timeout = Duration::from_secs(30);
        let idle = Arc::new(std::sync::Mutex::new(timeout));

        // One tick event arrives just before the deadline, then silence.
        let wait = timeout - Duration::from_secs(1);
        let ev = Event::new("tick", Some(&serde_json::json!({"ts": "t"}))).unwrap();
        let json = Envelope::Event(ev).to_text().unwrap();
        let tick: Result<tungstenite::Message, tungstenite::Error> =
            Ok(tungstenite::Message::Text(json.into()));
        let delayed = stream::once(async move {
            tokio::time::sleep(wait).await;
            tick
        });
        let combined = Box::pin(delayed.chain(stream::pending()));

        let handle = tokio::spawn(read_pump(
            combined, pending, handlers, on_request, on_disconnect, challenge, idle, write_tx,
            cancel,
        ));

        // Past the original deadline — the tick should have reset it.
        tokio::time::advance(timeout + Duration::from_secs(1)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(
            !*disconnected.lock().unwrap(),
            "deadline should have been reset by the tick"
        );

        // Past the reset deadline.
        tokio::time::advance(timeout).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        handle.await.unwrap();
        assert!(*disconnected.lock().unwrap());
    }
}
