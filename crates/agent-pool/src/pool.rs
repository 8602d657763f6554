//! The upstream pool: one live link per agent service address.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use roomcast_client::{ClientError, Endpoint};
use roomcast_identity::DeviceIdentity;
use roomcast_protocol::constants::{AGENT_CALL_TIMEOUT, events, methods};
use roomcast_protocol::messages::{AgentChatRequest, AgentChatResponse, ChatDeltaEvent};

use crate::dispatch::{AgentTarget, ChatCall, Dispatcher};
use crate::link::{Link, connect_endpoint, to_params};

/// Errors from the agent pool.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("a reply from this agent is already in flight for the room")]
    InFlight,

    #[error("malformed agent reply: {0}")]
    BadReply(String),
}

/// Dials a new link to a target.
type Connector<L> =
    Box<dyn Fn(AgentTarget) -> BoxFuture<'static, Result<Arc<L>, ClientError>> + Send + Sync>;

type InFlightSet = Arc<std::sync::Mutex<HashSet<(String, String)>>>;

struct PoolInner<L: Link> {
    connector: Connector<L>,
    /// One slot per (address, credential). The slot mutex serializes
    /// dials so concurrent calls to the same service share one link.
    links: Mutex<HashMap<(String, String), Arc<Mutex<Option<Arc<L>>>>>>,
    /// At most one completion per (room, agent) at a time.
    in_flight: InFlightSet,
    /// Streamed fragments accumulated by call id.
    deltas: Arc<std::sync::Mutex<HashMap<String, String>>>,
}

/// Pool of outbound links to agent services.
pub struct AgentPool<L: Link> {
    inner: Arc<PoolInner<L>>,
}

impl<L: Link> AgentPool<L> {
    /// Creates a pool that dials with the given connector.
    pub fn new(connector: Connector<L>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                connector,
                links: Mutex::new(HashMap::new()),
                in_flight: Arc::new(std::sync::Mutex::new(HashSet::new())),
                deltas: Arc::new(std::sync::Mutex::new(HashMap::new())),
            }),
        }
    }

    /// Runs one completion against the target agent service.
    pub async fn chat(&self, call: ChatCall) -> Result<String, PoolError> {
        run_chat(self.inner.clone(), call).await
    }

    /// Tears down every pooled link.
    pub async fn close(&self) {
        let links = self.inner.links.lock().await;
        for slot in links.values() {
            if let Some(link) = slot.lock().await.take() {
                link.close().await;
            }
        }
    }
}

impl AgentPool<Endpoint> {
    /// Creates a pool that dials real agent services as this hub.
    pub fn with_endpoints(identity: Arc<DeviceIdentity>) -> Self {
        Self::new(Box::new(move |target| {
            let identity = identity.clone();
            Box::pin(async move { connect_endpoint(&target, identity).await })
        }))
    }
}

impl<L: Link> Dispatcher for AgentPool<L> {
    fn chat(&self, call: ChatCall) -> BoxFuture<'static, Result<String, PoolError>> {
        Box::pin(run_chat(self.inner.clone(), call))
    }
}

/// Removes its (room, agent) key from the in-flight set on drop, so a
/// panicking or cancelled completion never wedges the pair.
struct FlightGuard {
    set: InFlightSet,
    key: (String, String),
}

impl FlightGuard {
    fn try_acquire(set: InFlightSet, key: (String, String)) -> Option<Self> {
        let mut guard = set.lock().ok()?;
        if !guard.insert(key.clone()) {
            return None;
        }
        drop(guard);
        Some(Self { set, key })
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        if let Ok(mut set) = self.set.lock() {
            set.remove(&self.key);
        }
    }
}

async fn run_chat<L: Link>(inner: Arc<PoolInner<L>>, call: ChatCall) -> Result<String, PoolError> {
    let key = (call.room_id.clone(), call.target.id.clone());
    let _guard = FlightGuard::try_acquire(inner.in_flight.clone(), key)
        .ok_or(PoolError::InFlight)?;

    let link = link_for(&inner, &call.target).await?;

    let call_id = uuid::Uuid::new_v4().to_string();
    if let Ok(mut map) = inner.deltas.lock() {
        map.insert(call_id.clone(), String::new());
    }

    let request = AgentChatRequest {
        call_id: call_id.clone(),
        room_id: call.room_id.clone(),
        context: call.context.clone(),
        prompt: call.prompt.clone(),
    };
    let params = to_params(&request).map_err(|e| PoolError::Client(ClientError::Json(e)))?;

    debug!(agent = %call.target.id, room = %call.room_id, %call_id, "relaying chat call");
    let result = link
        .call_with_timeout(methods::AGENT_CHAT, params, AGENT_CALL_TIMEOUT)
        .await;

    let streamed = inner
        .deltas
        .lock()
        .ok()
        .and_then(|mut map| map.remove(&call_id))
        .unwrap_or_default();

    let payload = result?;
    let response: AgentChatResponse =
        serde_json::from_value(payload).map_err(|e| PoolError::BadReply(e.to_string()))?;

    // A non-empty final text is authoritative; otherwise the reply was
    // fully streamed via deltas.
    let text = if response.text.is_empty() {
        streamed
    } else {
        response.text
    };
    if text.is_empty() {
        return Err(PoolError::BadReply("empty completion".into()));
    }
    Ok(text)
}

/// Returns a live link for the target, dialing if necessary. The
/// per-address slot lock guarantees a single dial even under
/// concurrent calls.
async fn link_for<L: Link>(
    inner: &Arc<PoolInner<L>>,
    target: &AgentTarget,
) -> Result<Arc<L>, PoolError> {
    let slot = {
        let mut links = inner.links.lock().await;
        links
            .entry((target.address.clone(), target.credential.clone()))
            .or_default()
            .clone()
    };

    let mut guard = slot.lock().await;
    if let Some(link) = guard.as_ref()
        && link.is_connected().await
    {
        return Ok(link.clone());
    }

    debug!(address = %target.address, "dialing agent service");
    let link = (inner.connector)(target.clone()).await?;

    // Route streamed fragments into the shared accumulator. Fragments
    // for unknown call ids (e.g. after a timeout) are dropped.
    let deltas = inner.deltas.clone();
    link.on_event(
        events::CHAT_DELTA,
        Box::new(move |ev| match ev.parse_payload::<ChatDeltaEvent>() {
            Ok(delta) => {
                if let Ok(mut map) = deltas.lock()
                    && let Some(buf) = map.get_mut(&delta.call_id)
                {
                    buf.push_str(&delta.text);
                }
            }
            Err(e) => warn!("malformed chat.delta: {e}"),
        }),
    )
    .await;

    *guard = Some(link.clone());
    Ok(link)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use roomcast_protocol::envelope::Event;

    type Handlers = std::sync::Mutex<Vec<(String, Box<dyn Fn(Event) + Send + Sync>)>>;

    /// Scripted agent service: streams `fragments` as deltas, then
    /// returns `final_text`.
    struct MockLink {
        handlers: Handlers,
        fragments: Vec<String>,
        final_text: String,
        delay: Duration,
        connected: AtomicBool,
    }

    impl MockLink {
        fn new(fragments: &[&str], final_text: &str, delay: Duration) -> Self {
            Self {
                handlers: std::sync::Mutex::new(Vec::new()),
                fragments: fragments.iter().map(|s| s.to_string()).collect(),
                final_text: final_text.to_string(),
                delay,
                connected: AtomicBool::new(true),
            }
        }
    }

    impl Link for MockLink {
        async fn is_connected(&self) -> bool {
            self.connected.load(Ordering::Relaxed)
        }

        async fn call_with_timeout(
            &self,
            _method: &str,
            params: Value,
            _timeout: Duration,
        ) -> Result<Value, ClientError> {
            let req: AgentChatRequest = serde_json::from_value(params).unwrap();
            tokio::time::sleep(self.delay).await;

            for frag in &self.fragments {
                let payload = ChatDeltaEvent {
                    call_id: req.call_id.clone(),
                    text: frag.clone(),
                };
                let ev = Event::new("chat.delta", Some(&payload)).unwrap();
                for (name, cb) in self.handlers.lock().unwrap().iter() {
                    if name == "chat.delta" {
                        cb(ev.clone());
                    }
                }
            }

            let resp = AgentChatResponse {
                call_id: req.call_id,
                text: self.final_text.clone(),
            };
            Ok(serde_json::to_value(&resp).unwrap())
        }

        async fn on_event(&self, event: &str, handler: Box<dyn Fn(Event) + Send + Sync>) {
            self.handlers
                .lock()
                .unwrap()
                .push((event.to_string(), handler));
        }

        async fn close(&self) {
            self.connected.store(false, Ordering::Relaxed);
        }
    }

    fn target() -> AgentTarget {
        AgentTarget {
            id: "agent-1".into(),
            name: "helper".into(),
            address: "ws://agents.test/ws".into(),
            credential: "cred".into(),
        }
    }

    fn call_for(room: &str) -> ChatCall {
        ChatCall {
            room_id: room.into(),
            target: target(),
            context: "Alice: hi".into(),
            prompt: "@helper hi".into(),
        }
    }

    fn scripted_pool(
        fragments: &'static [&'static str],
        final_text: &'static str,
        delay: Duration,
    ) -> (AgentPool<MockLink>, Arc<AtomicUsize>) {
        let dials = Arc::new(AtomicUsize::new(0));
        let dials_conn = dials.clone();
        let pool = AgentPool::new(Box::new(move |_target| {
            dials_conn.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                Ok(Arc::new(MockLink::new(fragments, final_text, delay)))
            })
        }));
        (pool, dials)
    }

    #[tokio::test]
    async fn returns_final_text() {
        let (pool, _) = scripted_pool(&[], "hello there", Duration::ZERO);
        let text = pool.chat(call_for("room-1")).await.unwrap();
        assert_eq!(text, "hello there");
    }

    #[tokio::test]
    async fn accumulates_streamed_deltas() {
        let (pool, _) = scripted_pool(&["Hel", "lo ", "world"], "", Duration::ZERO);
        let text = pool.chat(call_for("room-1")).await.unwrap();
        assert_eq!(text, "Hello world");
    }

    #[tokio::test]
    async fn final_text_wins_over_deltas() {
        let (pool, _) = scripted_pool(&["partial"], "the full reply", Duration::ZERO);
        let text = pool.chat(call_for("room-1")).await.unwrap();
        assert_eq!(text, "the full reply");
    }

    #[tokio::test]
    async fn empty_completion_is_an_error() {
        let (pool, _) = scripted_pool(&[], "", Duration::ZERO);
        let err = pool.chat(call_for("room-1")).await.unwrap_err();
        assert!(matches!(err, PoolError::BadReply(_)));
    }

    #[tokio::test]
    async fn concurrent_calls_share_one_dial() {
        let (pool, dials) = scripted_pool(&[], "ok", Duration::from_millis(50));
        let (a, b) = tokio::join!(pool.chat(call_for("room-1")), pool.chat(call_for("room-2")));
        assert_eq!(a.unwrap(), "ok");
        assert_eq!(b.unwrap(), "ok");
        assert_eq!(dials.load(Ordering::SeqCst), 1, "one link per target");
    }

    #[tokio::test]
    async fn duplicate_in_flight_call_is_rejected() {
        let (pool, _) = scripted_pool(&[], "ok", Duration::from_millis(100));
        let pool = Arc::new(pool);

        let p = pool.clone();
        let first = tokio::spawn(async move { p.chat(call_for("room-1")).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let second = pool.chat(call_for("room-1")).await;
        assert!(matches!(second, Err(PoolError::InFlight)));

        assert_eq!(first.await.unwrap().unwrap(), "ok");

        // After the first completes, the pair is free again.
        let third = pool.chat(call_for("room-1")).await.unwrap();
        assert_eq!(third, "ok");
    }

    #[tokio::test]
    async fn dead_link_is_redialed() {
        let (pool, dials) = scripted_pool(&[], "ok", Duration::ZERO);
        pool.chat(call_for("room-1")).await.unwrap();
        assert_eq!(dials.load(Ordering::SeqCst), 1);

        pool.close().await;

        pool.chat(call_for("room-1")).await.unwrap();
        assert_eq!(dials.load(Ordering::SeqCst), 2, "closed link must be replaced");
    }
}
