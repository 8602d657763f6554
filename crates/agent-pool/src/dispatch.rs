//! Dispatcher trait and chat-call plumbing shared with the hub.

use futures_util::future::BoxFuture;

use roomcast_protocol::messages::RoomMessage;

use crate::pool::PoolError;

/// A downstream agent service, as configured for a room.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentTarget {
    pub id: String,
    pub name: String,
    /// WebSocket URL of the agent service.
    pub address: String,
    /// Bearer credential the hub presents when dialing.
    pub credential: String,
}

/// One chat completion relayed to an agent service.
#[derive(Debug, Clone)]
pub struct ChatCall {
    pub room_id: String,
    pub target: AgentTarget,
    /// Context built from recent room history.
    pub context: String,
    /// The message that mentioned the agent.
    pub prompt: String,
}

/// Relays chat completions to agent services.
///
/// Boxed futures keep the trait object-safe: the hub holds a
/// `dyn Dispatcher` so tests can substitute a fake.
pub trait Dispatcher: Send + Sync + 'static {
    /// Runs one completion, returning the agent's full reply text.
    fn chat(&self, call: ChatCall) -> BoxFuture<'static, Result<String, PoolError>>;
}

/// How much room history is packed into an agent's context.
const CONTEXT_MESSAGES: usize = 20;

/// Builds the textual context sent to agents from recent room history,
/// oldest first.
pub fn build_context(history: &[RoomMessage]) -> String {
    let start = history.len().saturating_sub(CONTEXT_MESSAGES);
    history[start..]
        .iter()
        .map(|m| format!("{}: {}", m.sender_name, m.body))
        .collect::<Vec<_>>()
        .join("\n")
}
