//! Handshake payload types and the canonical device-signature string.
//!
//! Every field that matters for authentication is part of the signed
//! canonical string, so a replay with a swapped token or nonce is
//! detectable by signature verification alone.

use serde::{Deserialize, Serialize};

use crate::constants::SIGNATURE_FORMAT;

/// Client identity block submitted with `connect`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub id: String,
    pub display_name: String,
    pub version: String,
    pub platform: String,
    pub mode: String,
}

/// Bearer credential: the static server token, or a previously issued
/// device token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthBlock {
    pub token: String,
}

/// Signed device identity block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceBlock {
    /// Permanent device identifier: hex SHA-256 of the public key.
    pub id: String,
    /// Base64-encoded Ed25519 verifying key.
    pub public_key: String,
    /// Base64-encoded Ed25519 signature over the canonical string.
    pub signature: String,
    /// Wire timestamp the signature was produced at.
    pub signed_at: String,
    /// Echo of the single-use challenge nonce.
    pub nonce: String,
}

/// The `connect` request parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectRequest {
    pub min_protocol: u32,
    pub max_protocol: u32,
    pub client: ClientInfo,
    pub role: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub caps: Vec<String>,
    pub auth: AuthBlock,
    pub device: DeviceBlock,
}

/// Policy returned by the acceptor on a successful handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakePolicy {
    pub keepalive_interval_ms: u64,
}

/// Successful `connect` response payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectAccepted {
    /// Fresh opaque device token, reusable on future handshakes instead
    /// of re-presenting the static credential.
    pub device_token: String,
    pub policy: HandshakePolicy,
    pub protocol: u32,
}

/// Payload of the `connect.challenge` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChallengeEvent {
    pub nonce: String,
    pub ts: String,
}

/// The exact set of fields covered by the device signature.
#[derive(Debug, Clone)]
pub struct SigningFields<'a> {
    pub device_id: &'a str,
    pub client_id: &'a str,
    pub mode: &'a str,
    pub role: &'a str,
    pub scopes: &'a [String],
    pub signed_at: &'a str,
    pub token: &'a str,
    pub nonce: &'a str,
}

impl SigningFields<'_> {
    /// Builds the canonical newline-delimited string the device signs.
    pub fn canonical_string(&self) -> String {
        [
            SIGNATURE_FORMAT,
            self.device_id,
            self.client_id,
            self.mode,
            self.role,
            &self.scopes.join(","),
            self.signed_at,
            self.token,
            self.nonce,
        ]
        .join("\n")
    }
}

impl ConnectRequest {
    /// Extracts the signed fields exactly as submitted.
    pub fn signing_fields(&self) -> SigningFields<'_> {
        SigningFields {
            device_id: &self.device.id,
            client_id: &self.client.id,
            mode: &self.client.mode,
            role: &self.role,
            scopes: &self.scopes,
            signed_at: &self.device.signed_at,
            token: &self.auth.token,
            nonce: &self.device.nonce,
        }
    }
}
