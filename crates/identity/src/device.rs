//! Ed25519 device identity: keypair generation, persistence and signing.
//!
//! The keypair lives in a JSON file readable only by the owner. The
//! device id is the hex SHA-256 of the public key, so any peer holding
//! the public key can derive and cross-check the id.

use std::fs;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

/// Errors from identity operations.
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid key material: {0}")]
    BadKey(String),

    #[error("signature verification failed")]
    BadSignature,
}

/// On-disk form of the keypair, both halves base64-encoded.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredIdentity {
    secret_key: String,
    public_key: String,
}

/// A loaded device identity.
pub struct DeviceIdentity {
    signing_key: SigningKey,
    id: String,
    path: PathBuf,
}

impl std::fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("id", &self.id)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl DeviceIdentity {
    /// Loads the identity at `path`, creating a fresh keypair on first run.
    pub fn load_or_create(path: &Path) -> Result<Self, IdentityError> {
        if path.exists() {
            Self::load(path)
        } else {
            Self::create(path)
        }
    }

    fn load(path: &Path) -> Result<Self, IdentityError> {
        let data = fs::read_to_string(path)?;
        let stored: StoredIdentity = serde_json::from_str(&data)?;
        let secret = decode_key_bytes(&stored.secret_key)?;
        let signing_key = SigningKey::from_bytes(&secret);

        // The stored public half must match the secret half.
        let derived = BASE64.encode(signing_key.verifying_key().as_bytes());
        if derived != stored.public_key {
            return Err(IdentityError::BadKey(
                "stored public key does not match secret key".into(),
            ));
        }

        let id = id_for_key(&signing_key.verifying_key());
        debug!(device_id = %id, "loaded device identity from {:?}", path);
        Ok(Self {
            signing_key,
            id,
            path: path.to_path_buf(),
        })
    }

    fn create(path: &Path) -> Result<Self, IdentityError> {
        let mut secret = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        let signing_key = SigningKey::from_bytes(&secret);

        let stored = StoredIdentity {
            secret_key: BASE64.encode(signing_key.to_bytes()),
            public_key: BASE64.encode(signing_key.verifying_key().as_bytes()),
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(&stored)?)?;
        #[cfg(unix)]
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;

        let id = id_for_key(&signing_key.verifying_key());
        info!(device_id = %id, "created new device identity at {:?}", path);
        Ok(Self {
            signing_key,
            id,
            path: path.to_path_buf(),
        })
    }

    /// Permanent device id: hex SHA-256 of the public key.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Base64-encoded public key, as sent in the handshake.
    pub fn public_key_base64(&self) -> String {
        BASE64.encode(self.signing_key.verifying_key().as_bytes())
    }

    /// Short colon-separated fingerprint for display.
    pub fn fingerprint(&self) -> String {
        let hash = Sha256::digest(self.signing_key.verifying_key().as_bytes());
        hash[..8]
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<Vec<_>>()
            .join(":")
    }

    /// Signs a message, returning the signature base64-encoded.
    pub fn sign(&self, message: &[u8]) -> String {
        BASE64.encode(self.signing_key.sign(message).to_bytes())
    }

    /// A display name for this host, used as the default profile name.
    pub fn host_name() -> String {
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "roomcast".to_string())
    }
}

/// Derives the device id from a base64-encoded public key.
pub fn device_id_for(public_key_b64: &str) -> Result<String, IdentityError> {
    let key = decode_verifying_key(public_key_b64)?;
    Ok(id_for_key(&key))
}

/// Verifies a base64-encoded signature against a base64-encoded public key.
pub fn verify_signature(
    public_key_b64: &str,
    message: &[u8],
    signature_b64: &str,
) -> Result<(), IdentityError> {
    let key = decode_verifying_key(public_key_b64)?;
    let sig_bytes = BASE64
        .decode(signature_b64)
        .map_err(|e| IdentityError::BadKey(format!("bad signature encoding: {e}")))?;
    let signature = Signature::from_slice(&sig_bytes)
        .map_err(|e| IdentityError::BadKey(format!("bad signature length: {e}")))?;
    key.verify(message, &signature)
        .map_err(|_| IdentityError::BadSignature)
}

fn id_for_key(key: &VerifyingKey) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

fn decode_verifying_key(public_key_b64: &str) -> Result<VerifyingKey, IdentityError> {
    let bytes = decode_key_bytes(public_key_b64)?;
    VerifyingKey::from_bytes(&bytes)
        .map_err(|e| IdentityError::BadKey(format!("invalid public key: {e}")))
}

fn decode_key_bytes(b64: &str) -> Result<[u8; 32], IdentityError> {
    let bytes = BASE64
        .decode(b64)
        .map_err(|e| IdentityError::BadKey(format!("bad key encoding: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| IdentityError::BadKey("key must be 32 bytes".into()))
}
