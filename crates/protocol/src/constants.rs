use std::time::Duration;

/// Current protocol version spoken by this build.
pub const PROTOCOL_VERSION: u32 = 1;

/// Oldest protocol version this build still accepts.
pub const MIN_PROTOCOL: u32 = 1;

/// Default keepalive interval declared in the handshake policy.
pub const DEFAULT_KEEPALIVE_INTERVAL_MS: u64 = 15_000;

/// Time allowed for the challenge/connect exchange to finish.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for ordinary request/response operations.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for downstream agent completions, which may take far longer
/// than a plain RPC while the agent generates its reply.
pub const AGENT_CALL_TIMEOUT: Duration = Duration::from_secs(120);

/// How often the client sends transport-level pings (must stay well
/// under the hub's read deadline).
pub const WS_PING_PERIOD: Duration = Duration::from_secs(5);

/// Maximum envelope size in bytes (1 MB — chat payloads are small).
pub const WS_MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Fixed format tag that anchors the canonical device-signature string.
pub const SIGNATURE_FORMAT: &str = "roomcast-device-sig-v1";

/// Maximum tolerated difference between `signedAt` and the acceptor's
/// clock before a handshake is rejected.
pub const SIGNATURE_MAX_SKEW: Duration = Duration::from_secs(600);

/// Returns `true` if a peer advertising `[min, max]` overlaps with the
/// protocol range this build speaks.
pub fn protocol_compatible(peer_min: u32, peer_max: u32) -> bool {
    peer_min <= PROTOCOL_VERSION && peer_max >= MIN_PROTOCOL
}

/// Wire timestamp: ISO-8601 UTC with fractional seconds.
pub fn now_ts() -> String {
    chrono::Utc::now()
        .to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Structured error codes carried in `res.error.code`.
///
/// Receivers must treat unrecognized codes as opaque failures.
pub mod codes {
    pub const INVALID_PARAMS: &str = "invalid_params";
    pub const NOT_FOUND: &str = "not_found";
    pub const FORBIDDEN: &str = "forbidden";
    pub const DB_ERROR: &str = "db_error";
    pub const UNKNOWN_METHOD: &str = "unknown_method";
    pub const AUTH_REJECTED: &str = "auth_rejected";
    pub const PAIRING_REQUIRED: &str = "pairing_required";
    pub const INTERNAL: &str = "internal";
}

/// Event names pushed over the wire.
pub mod events {
    /// Acceptor → initiator: single-use handshake nonce.
    pub const CONNECT_CHALLENGE: &str = "connect.challenge";
    /// Acceptor → initiator: periodic liveness tick.
    pub const TICK: &str = "tick";
    /// New message broadcast to a room.
    pub const ROOM_MESSAGE: &str = "room.message";
    /// An agent is composing a reply for a room.
    pub const AGENT_TYPING: &str = "agent.typing";
    /// Streamed fragment of an agent completion.
    pub const CHAT_DELTA: &str = "chat.delta";
}

/// RPC method names.
pub mod methods {
    pub const CONNECT: &str = "connect";
    pub const ROOM_LIST: &str = "room.list";
    pub const ROOM_CREATE: &str = "room.create";
    pub const ROOM_JOIN: &str = "room.join";
    pub const ROOM_LEAVE: &str = "room.leave";
    pub const ROOM_INFO: &str = "room.info";
    pub const ROOM_HISTORY: &str = "room.history";
    pub const ROOM_SEND: &str = "room.send";
    pub const ROOM_AGENT_ADD: &str = "room.agent.add";
    pub const ROOM_AGENT_REMOVE: &str = "room.agent.remove";
    pub const INVITE_CREATE: &str = "invite.create";
    pub const PROFILE_UPDATE: &str = "profile.update";
    pub const AGENT_CHAT: &str = "agent.chat";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_overlap() {
        assert!(protocol_compatible(1, 1));
        assert!(protocol_compatible(1, 99));
        assert!(!protocol_compatible(PROTOCOL_VERSION + 1, PROTOCOL_VERSION + 5));
    }

    #[test]
    fn now_ts_has_fractional_seconds() {
        let ts = now_ts();
        assert!(ts.ends_with('Z'));
        assert!(ts.contains('.'), "expected fractional seconds in {ts}");
        chrono::DateTime::parse_from_rfc3339(&ts).unwrap();
    }
}
