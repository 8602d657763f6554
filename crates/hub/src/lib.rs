//! The Roomcast hub.
//!
//! Accepts WebSocket connections from clients, authenticates them with
//! the challenge/signature handshake, and routes room traffic: RPC
//! dispatch, message fan-out, history, invites and agent relay.

pub mod connection;
pub mod handshake;
pub mod http;
pub mod rooms;
pub mod rpc;
pub mod server;
pub mod store;

pub use rpc::HubContext;
pub use server::{HubConfig, HubServer};
pub use store::{AgentConfig, MemoryStore, Store, StoreError};

use roomcast_identity::TokenStoreError;

/// Errors surfaced by the hub server.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    TokenStore(#[from] TokenStoreError),
}
