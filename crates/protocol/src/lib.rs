//! Wire protocol for Roomcast: the shared envelope format, handshake
//! payloads, canonical device-signature string, and portable join codes.
//!
//! Everything that crosses a socket between hub, client, or agent service
//! is defined here so all three sides agree on one vocabulary.

pub mod constants;
pub mod envelope;
pub mod handshake;
pub mod joincode;
pub mod messages;

pub use constants::{MIN_PROTOCOL, PROTOCOL_VERSION, codes, events, methods};
pub use envelope::{Envelope, Event, Request, Response, WireError};
