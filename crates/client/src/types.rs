//! Public types for the connection endpoint.

use std::time::Duration;

use tokio_tungstenite::tungstenite;

use roomcast_protocol::handshake::ClientInfo;

/// Errors from the connection endpoint.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("WebSocket error: {0}")]
    Ws(#[from] tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("request timed out")]
    Timeout,

    #[error("connection closed")]
    Closed,

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("hub requires pairing: credential not recognized")]
    PairingRequired,

    #[error("hub error {code}: {message}")]
    Rejected { code: String, message: String },
}

/// State of the link to a hub.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkState {
    /// Not connected and not trying to be.
    Disconnected,
    /// Handshake in progress.
    Connecting,
    /// Connected and authenticated.
    Connected,
    /// Connection lost, attempting to reconnect.
    Reconnecting { attempt: u32 },
    /// Stopped: the hub no longer recognizes our credential.
    PairingRequired,
}

/// Events emitted by a managed endpoint.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// The link state changed.
    StateChanged(LinkState),
}

/// Configuration for an endpoint.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// WebSocket URL of the hub, e.g. `ws://host:9470/ws`.
    pub url: String,
    /// Client identity block sent in the handshake.
    pub client: ClientInfo,
    /// Role requested from the hub (`"user"` or `"agent"`).
    pub role: String,
    /// Scopes requested from the hub.
    pub scopes: Vec<String>,
    /// Capability strings advertised to the hub.
    pub caps: Vec<String>,
    /// Bootstrap credential, used until the hub issues a device token.
    pub token: String,
}

/// Configuration for automatic reconnection with exponential backoff.
///
/// Delays are deterministic and non-decreasing: callers can rely on
/// attempt N+1 never firing sooner than attempt N would have.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first reconnection attempt.
    pub base: Duration,
    /// Multiplier for each subsequent attempt.
    pub multiplier: f64,
    /// Maximum delay between attempts.
    pub cap: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            multiplier: 2.0,
            cap: Duration::from_secs(30),
        }
    }
}

impl BackoffConfig {
    /// Calculates the delay for a given attempt number (0-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.min(63) as i32;
        let secs = self.base.as_secs_f64() * self.multiplier.powi(exp);
        Duration::from_secs_f64(secs.min(self.cap.as_secs_f64()))
    }
}
