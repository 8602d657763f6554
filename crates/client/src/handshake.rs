//! Initiator side of the challenge/sign handshake.

use std::time::Duration;

use tracing::debug;

use roomcast_identity::DeviceIdentity;
use roomcast_protocol::constants::{HANDSHAKE_TIMEOUT, MIN_PROTOCOL, PROTOCOL_VERSION, codes, methods, now_ts};
use roomcast_protocol::handshake::{
    AuthBlock, ConnectAccepted, ConnectRequest, DeviceBlock, SigningFields,
};

use crate::connection::Connection;
use crate::types::{ClientError, EndpointConfig};

/// Performs the handshake on a freshly opened link.
///
/// Waits for the hub's challenge, signs the canonical string with the
/// device key, and sends `connect`. On success the link's read deadline
/// is retuned to the hub's keepalive policy.
pub(crate) async fn perform_handshake(
    conn: &Connection,
    config: &EndpointConfig,
    identity: &DeviceIdentity,
    token: &str,
) -> Result<ConnectAccepted, ClientError> {
    let challenge = conn.await_challenge(HANDSHAKE_TIMEOUT).await?;
    debug!(nonce = %challenge.nonce, "received handshake challenge");

    let signed_at = now_ts();
    let fields = SigningFields {
        device_id: identity.id(),
        client_id: &config.client.id,
        mode: &config.client.mode,
        role: &config.role,
        scopes: &config.scopes,
        signed_at: &signed_at,
        token,
        nonce: &challenge.nonce,
    };
    let signature = identity.sign(fields.canonical_string().as_bytes());

    let request = ConnectRequest {
        min_protocol: MIN_PROTOCOL,
        max_protocol: PROTOCOL_VERSION,
        client: config.client.clone(),
        role: config.role.clone(),
        scopes: config.scopes.clone(),
        caps: config.caps.clone(),
        auth: AuthBlock {
            token: token.to_string(),
        },
        device: DeviceBlock {
            id: identity.id().to_string(),
            public_key: identity.public_key_base64(),
            signature,
            signed_at,
            nonce: challenge.nonce,
        },
    };

    let response = conn
        .request_with_timeout(methods::CONNECT, Some(&request), HANDSHAKE_TIMEOUT)
        .await
        .map_err(map_handshake_error)?;

    let accepted: ConnectAccepted = response.parse_payload()?;
    conn.set_keepalive_interval(Duration::from_millis(accepted.policy.keepalive_interval_ms));
    debug!(
        protocol = accepted.protocol,
        keepalive_ms = accepted.policy.keepalive_interval_ms,
        "handshake accepted"
    );
    Ok(accepted)
}

/// Maps wire rejections to handshake-specific errors. A
/// `pairing_required` rejection means our credential is not recognized
/// and retrying with the same one is pointless.
fn map_handshake_error(err: ClientError) -> ClientError {
    match err {
        ClientError::Rejected { ref code, .. } if code == codes::PAIRING_REQUIRED => {
            ClientError::PairingRequired
        }
        ClientError::Rejected { code, message } if code == codes::AUTH_REJECTED => {
            ClientError::Handshake(message)
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pairing_required_is_terminal() {
        let err = map_handshake_error(ClientError::Rejected {
            code: "pairing_required".into(),
            message: "unknown device".into(),
        });
        assert!(matches!(err, ClientError::PairingRequired));
    }

    #[test]
    fn auth_rejection_becomes_handshake_error() {
        let err = map_handshake_error(ClientError::Rejected {
            code: "auth_rejected".into(),
            message: "bad signature".into(),
        });
        match err {
            ClientError::Handshake(msg) => assert_eq!(msg, "bad signature"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn other_errors_pass_through() {
        let err = map_handshake_error(ClientError::Timeout);
        assert!(matches!(err, ClientError::Timeout));

        let err = map_handshake_error(ClientError::Rejected {
            code: "invalid_params".into(),
            message: "bad request".into(),
        });
        assert!(matches!(err, ClientError::Rejected { .. }));
    }
}
