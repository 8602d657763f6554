//! WebSocket write pump.
//!
//! Single owner of the sink half: every outbound frame, including the
//! periodic keepalive ping, funnels through here so frames are never
//! interleaved. On shutdown a close frame is attempted so the hub sees
//! an orderly goodbye instead of a reset.

use futures_util::SinkExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use roomcast_protocol::constants::WS_PING_PERIOD;

pub(crate) async fn write_pump<S>(
    mut sink: S,
    mut outbound: mpsc::Receiver<tungstenite::Message>,
    cancel: CancellationToken,
) where
    S: SinkExt<tungstenite::Message, Error = tungstenite::Error> + Unpin,
{
    let mut keepalive = tokio::time::interval(WS_PING_PERIOD);
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    keepalive.tick().await; // first tick fires immediately

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            _ = keepalive.tick() => {
                let ping = tungstenite::Message::Ping(Vec::new().into());
                if sink.send(ping).await.is_err() {
                    break;
                }
            }

            frame = outbound.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = sink.send(frame).await {
                        warn!("outbound frame failed: {e}");
                        break;
                    }
                }
                // All senders dropped, the link is being torn down.
                None => break,
            },
        }
    }

    let _ = sink.send(tungstenite::Message::Close(None)).await;
}
