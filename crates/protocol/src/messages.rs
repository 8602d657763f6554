//! RPC parameter and payload types shared by hub, client and agent pool.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Core entities
// ---------------------------------------------------------------------------

/// A message delivered to a room, both on the wire and in history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomMessage {
    pub id: String,
    pub room_id: String,
    /// Sender's permanent identity (device id for users, agent id for agents).
    pub sender: String,
    pub sender_name: String,
    /// `"user"` or `"agent"`.
    pub sender_kind: String,
    pub body: String,
    pub ts: String,
}

/// Public room metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSummary {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub topic: String,
    pub owner: String,
    pub created_at: String,
}

/// A user profile attached to a device identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub user_id: String,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status: String,
}

/// A room member annotated with live presence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberInfo {
    pub user_id: String,
    pub display_name: String,
    pub online: bool,
}

/// Public view of an agent participant (credentials never leave the hub).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRef {
    pub id: String,
    pub name: String,
}

/// An invite minted for a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InviteInfo {
    pub code: String,
    /// Portable self-describing form (see [`crate::joincode`]).
    pub join_code: String,
}

// ---------------------------------------------------------------------------
// Request parameters
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomCreateRequest {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub topic: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomJoinRequest {
    pub code: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomIdRequest {
    pub room_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomHistoryRequest {
    pub room_id: String,
    /// Cursor: only messages strictly before this wire timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSendRequest {
    pub room_id: String,
    pub body: String,
    /// At-least-once delivery dedupe key chosen by the sender.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentAddRequest {
    pub room_id: String,
    pub name: String,
    pub address: String,
    pub credential: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRemoveRequest {
    pub room_id: String,
    pub agent_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileUpdateRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

// ---------------------------------------------------------------------------
// Response payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomListResponse {
    pub rooms: Vec<RoomSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomCreateResponse {
    pub room: RoomSummary,
    pub invite: InviteInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomJoinResponse {
    pub room: RoomSummary,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomInfoResponse {
    pub room: RoomSummary,
    pub members: Vec<MemberInfo>,
    pub agents: Vec<AgentRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomHistoryResponse {
    pub messages: Vec<RoomMessage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomSendResponse {
    pub message: RoomMessage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentAddResponse {
    pub agent: AgentRef,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileUpdateResponse {
    pub profile: Profile,
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Payload of the periodic `tick` liveness event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickEvent {
    pub ts: String,
}

/// Broadcast while an agent composes a reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentTypingEvent {
    pub room_id: String,
    pub agent_id: String,
    pub agent_name: String,
}

// ---------------------------------------------------------------------------
// Agent service calls
// ---------------------------------------------------------------------------

/// Chat request relayed to a downstream agent service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentChatRequest {
    pub call_id: String,
    pub room_id: String,
    /// Short context built from recent room history.
    pub context: String,
    pub prompt: String,
}

/// Final agent completion. An empty `text` means the reply was fully
/// streamed via `chat.delta` events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentChatResponse {
    pub call_id: String,
    #[serde(default)]
    pub text: String,
}

/// One streamed fragment of an agent completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatDeltaEvent {
    pub call_id: String,
    pub text: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_message_json_is_camel_case() {
        let msg = RoomMessage {
            id: "m1".into(),
            room_id: "r1".into(),
            sender: "d1".into(),
            sender_name: "Alice".into(),
            sender_kind: "user".into(),
            body: "hello".into(),
            ts: "2026-01-01T00:00:00.000Z".into(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"roomId\":\"r1\""));
        assert!(json.contains("\"senderKind\":\"user\""));
        let back: RoomMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn history_request_optional_fields() {
        let req: RoomHistoryRequest =
            serde_json::from_str("{\"roomId\":\"r1\"}").unwrap();
        assert_eq!(req.room_id, "r1");
        assert!(req.before.is_none());
        assert!(req.limit.is_none());
    }

    #[test]
    fn agent_chat_response_text_defaults_empty() {
        let resp: AgentChatResponse =
            serde_json::from_str("{\"callId\":\"c1\"}").unwrap();
        assert_eq!(resp.call_id, "c1");
        assert!(resp.text.is_empty());
    }
}
