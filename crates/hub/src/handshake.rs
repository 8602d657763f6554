//! Acceptor side of the connect handshake.
//!
//! The hub pushes a single-use challenge nonce, then validates the
//! `connect` request against it: protocol overlap, device identity,
//! signature, timestamp freshness and the presented credential. All
//! checks are pure so they can be tested without a socket.

use chrono::{DateTime, Utc};
use rand::RngCore;

use roomcast_identity::{device_id_for, validate_token, verify_signature};
use roomcast_protocol::constants::{SIGNATURE_MAX_SKEW, codes, protocol_compatible};
use roomcast_protocol::handshake::ConnectRequest;

/// An authenticated session, produced by a successful handshake.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    /// Permanent device id; also the user id for room membership.
    pub device_id: String,
    pub user_id: String,
    pub display_name: String,
    pub role: String,
    pub mode: String,
    pub scopes: Vec<String>,
}

/// A handshake rejection, carrying its wire error code.
#[derive(Debug, Clone, PartialEq)]
pub struct Reject {
    pub code: &'static str,
    pub message: String,
}

impl Reject {
    fn auth(message: impl Into<String>) -> Self {
        Self {
            code: codes::AUTH_REJECTED,
            message: message.into(),
        }
    }
}

/// Generates a fresh challenge nonce.
pub fn new_nonce() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Validates a `connect` request against the challenge we issued.
///
/// `stored_token` is the device token from a previous handshake, if
/// any. The presented credential must match either the static server
/// token or the stored device token; everything else is checked first
/// so a wrong credential is only reported on an otherwise valid
/// request.
pub fn validate_connect(
    req: &ConnectRequest,
    nonce: &str,
    now: DateTime<Utc>,
    static_token: &str,
    stored_token: Option<&str>,
) -> Result<SessionInfo, Reject> {
    if !protocol_compatible(req.min_protocol, req.max_protocol) {
        return Err(Reject {
            code: codes::INVALID_PARAMS,
            message: format!(
                "no protocol overlap with [{}, {}]",
                req.min_protocol, req.max_protocol
            ),
        });
    }

    // The device id must be derived from the submitted public key, so
    // a caller cannot claim another device's identity.
    let derived = device_id_for(&req.device.public_key)
        .map_err(|e| Reject::auth(format!("bad public key: {e}")))?;
    if derived != req.device.id {
        return Err(Reject::auth("device id does not match public key"));
    }

    if req.device.nonce != nonce {
        return Err(Reject::auth("challenge nonce mismatch"));
    }

    let signed_at = DateTime::parse_from_rfc3339(&req.device.signed_at)
        .map_err(|_| Reject::auth("unparseable signedAt timestamp"))?
        .with_timezone(&Utc);
    let skew = (now - signed_at).abs();
    if skew.num_seconds().unsigned_abs() > SIGNATURE_MAX_SKEW.as_secs() {
        return Err(Reject::auth("signature timestamp outside allowed skew"));
    }

    let canonical = req.signing_fields().canonical_string();
    verify_signature(
        &req.device.public_key,
        canonical.as_bytes(),
        &req.device.signature,
    )
    .map_err(|_| Reject::auth("device signature verification failed"))?;

    let presented = &req.auth.token;
    let credential_ok = validate_token(presented, static_token)
        || stored_token.is_some_and(|stored| validate_token(presented, stored));
    if !credential_ok {
        return Err(Reject {
            code: codes::PAIRING_REQUIRED,
            message: "unknown credential, pair with the hub first".into(),
        });
    }

    Ok(SessionInfo {
        device_id: req.device.id.clone(),
        user_id: req.device.id.clone(),
        display_name: req.client.display_name.clone(),
        role: req.role.clone(),
        mode: req.client.mode.clone(),
        scopes: req.scopes.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use roomcast_identity::DeviceIdentity;
    use roomcast_protocol::constants::{MIN_PROTOCOL, PROTOCOL_VERSION, now_ts};
    use roomcast_protocol::handshake::{AuthBlock, ClientInfo, DeviceBlock, SigningFields};

    const STATIC_TOKEN: &str = "static-server-token";
    const NONCE: &str = "abcd1234abcd1234";

    fn identity() -> (tempfile::TempDir, DeviceIdentity) {
        let dir = tempfile::tempdir().unwrap();
        let id = DeviceIdentity::load_or_create(&dir.path().join("device.json")).unwrap();
        (dir, id)
    }

    fn signed_request(identity: &DeviceIdentity, token: &str, nonce: &str) -> ConnectRequest {
        let signed_at = now_ts();
        let scopes = vec!["chat".to_string()];
        let fields = SigningFields {
            device_id: identity.id(),
            client_id: "client-1",
            mode: "interactive",
            role: "user",
            scopes: &scopes,
            signed_at: &signed_at,
            token,
            nonce,
        };
        let signature = identity.sign(fields.canonical_string().as_bytes());

        ConnectRequest {
            min_protocol: MIN_PROTOCOL,
            max_protocol: PROTOCOL_VERSION,
            client: ClientInfo {
                id: "client-1".into(),
                display_name: "Alice".into(),
                version: "0.1.0".into(),
                platform: "linux".into(),
                mode: "interactive".into(),
            },
            role: "user".into(),
            scopes,
            caps: vec![],
            auth: AuthBlock {
                token: token.into(),
            },
            device: DeviceBlock {
                id: identity.id().into(),
                public_key: identity.public_key_base64(),
                signature,
                signed_at,
                nonce: nonce.into(),
            },
        }
    }

    #[test]
    fn accepts_valid_request_with_static_token() {
        let (_dir, id) = identity();
        let req = signed_request(&id, STATIC_TOKEN, NONCE);
        let session = validate_connect(&req, NONCE, Utc::now(), STATIC_TOKEN, None).unwrap();
        assert_eq!(session.device_id, id.id());
        assert_eq!(session.user_id, id.id());
        assert_eq!(session.display_name, "Alice");
        assert_eq!(session.scopes, ["chat"]);
    }

    #[test]
    fn accepts_stored_device_token() {
        let (_dir, id) = identity();
        let req = signed_request(&id, "issued-device-token", NONCE);
        let session =
            validate_connect(&req, NONCE, Utc::now(), STATIC_TOKEN, Some("issued-device-token"));
        assert!(session.is_ok());
    }

    #[test]
    fn unknown_credential_requires_pairing() {
        let (_dir, id) = identity();
        let req = signed_request(&id, "made-up", NONCE);
        let err = validate_connect(&req, NONCE, Utc::now(), STATIC_TOKEN, None).unwrap_err();
        assert_eq!(err.code, codes::PAIRING_REQUIRED);
    }

    #[test]
    fn rejects_nonce_mismatch() {
        let (_dir, id) = identity();
        let req = signed_request(&id, STATIC_TOKEN, "other-nonce");
        let err = validate_connect(&req, NONCE, Utc::now(), STATIC_TOKEN, None).unwrap_err();
        assert_eq!(err.code, codes::AUTH_REJECTED);
    }

    #[test]
    fn rejects_stale_signature() {
        let (_dir, id) = identity();
        let req = signed_request(&id, STATIC_TOKEN, NONCE);
        let future = Utc::now() + chrono::Duration::hours(2);
        let err = validate_connect(&req, NONCE, future, STATIC_TOKEN, None).unwrap_err();
        assert_eq!(err.code, codes::AUTH_REJECTED);
        assert!(err.message.contains("skew"));
    }

    #[test]
    fn rejects_tampered_signature() {
        let (_dir, id) = identity();
        let mut req = signed_request(&id, STATIC_TOKEN, NONCE);
        // Re-sign over a different token than the one presented.
        req.auth.token = "swapped".into();
        let err = validate_connect(&req, NONCE, Utc::now(), STATIC_TOKEN, None).unwrap_err();
        assert_eq!(err.code, codes::AUTH_REJECTED);
    }

    #[test]
    fn rejects_claimed_device_id() {
        let (_dir, id) = identity();
        let mut req = signed_request(&id, STATIC_TOKEN, NONCE);
        req.device.id = "0".repeat(64);
        let err = validate_connect(&req, NONCE, Utc::now(), STATIC_TOKEN, None).unwrap_err();
        assert_eq!(err.code, codes::AUTH_REJECTED);
        assert!(err.message.contains("device id"));
    }

    #[test]
    fn rejects_protocol_mismatch() {
        let (_dir, id) = identity();
        let mut req = signed_request(&id, STATIC_TOKEN, NONCE);
        req.min_protocol = PROTOCOL_VERSION + 1;
        req.max_protocol = PROTOCOL_VERSION + 2;
        let err = validate_connect(&req, NONCE, Utc::now(), STATIC_TOKEN, None).unwrap_err();
        assert_eq!(err.code, codes::INVALID_PARAMS);
    }

    #[test]
    fn nonces_are_unique_hex() {
        let a = new_nonce();
        let b = new_nonce();
        assert_eq!(a.len(), 32);
        assert!(a.bytes().all(|b| b.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }
}
