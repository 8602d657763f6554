//! Connection endpoint for Roomcast hubs.
//!
//! Provides the raw WebSocket link ([`Connection`]), the challenge/sign
//! handshake, and the managed [`Endpoint`] that reconnects automatically
//! with exponential backoff.

pub mod connection;
pub mod endpoint;
pub(crate) mod handshake;
pub(crate) mod pumps;
pub(crate) mod reconnect;
pub mod types;

pub use connection::{Connection, EventCallback, LinkSender, RequestCallback};
pub use endpoint::Endpoint;
pub use types::{BackoffConfig, ClientError, EndpointConfig, LinkEvent, LinkState};
