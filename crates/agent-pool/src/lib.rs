//! Pooled upstream links to agent services.
//!
//! The hub keeps at most one authenticated link per agent service
//! address and relays chat completions over it, accumulating streamed
//! `chat.delta` fragments until the final response arrives.

pub mod dispatch;
pub mod link;
pub mod pool;

pub use dispatch::{AgentTarget, ChatCall, Dispatcher, build_context};
pub use link::Link;
pub use pool::{AgentPool, PoolError};
