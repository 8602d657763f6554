//! Device identity and credential persistence.
//!
//! A device identity is an Ed25519 keypair stored on disk. The device id
//! is derived from the public key, so it is stable for the lifetime of
//! the keypair and needs no registration step. Acceptors persist issued
//! device tokens in a [`TokenStore`].

pub mod device;
pub mod token;
pub mod token_store;

pub use device::{DeviceIdentity, IdentityError, device_id_for, verify_signature};
pub use token::{generate_token, validate_token};
pub use token_store::{TokenStore, TokenStoreError};
