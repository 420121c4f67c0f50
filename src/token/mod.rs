//! Token wire format: claim shapes and the compact signed envelope.
//!
//! `claims` defines the serde types carried inside a token; `codec` turns a
//! header + claim set into the three-segment base64url envelope and back.
//! Nothing in this module performs I/O — key selection and trust decisions
//! live in `federation` and `selfsigned`.

pub mod claims;
pub mod codec;

pub use claims::{Audience, ClaimSet, Confirmation, Jwk, Scopes, TokenHeader};
pub use codec::{decode_unverified, encode, verify, DecodedToken};

/// The only signature algorithm accepted on this wire.
pub const ALG_EDDSA: &str = "EdDSA";

/// Scope granted when the caller requests none.
pub const DEFAULT_SCOPE: &str = "hytale:server hytale:client";

/// Scope that marks a server-session token; its subject doubles as an
/// audience during audience capture.
pub const SERVER_SCOPE: &str = "hytale:server";

/// Current Unix time in seconds, as carried in `iat`/`exp` claims.
#[must_use]
pub fn unix_now() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
