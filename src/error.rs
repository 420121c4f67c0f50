//! Error types for the session gateway.

use std::io;

use axum::http::StatusCode;
use thiserror::Error;

/// Result type alias for the session gateway
pub type Result<T> = std::result::Result<T, Error>;

/// Session gateway errors.
///
/// Verification-path failures deliberately carry no detail beyond their kind;
/// the HTTP shell renders them as a terse `{error: <string>}` envelope.
#[derive(Error, Debug)]
pub enum Error {
    /// Token does not split into three base64url segments, a segment fails to
    /// decode, or the header/claims JSON is invalid
    #[error("Malformed token: {0}")]
    MalformedToken(String),

    /// No verifying key could be located for the token
    #[error("Unknown signing key")]
    UnknownKey,

    /// A key was located but the signature does not verify
    #[error("Invalid token signature")]
    SignatureInvalid,

    /// A claim required for the requested operation is absent
    #[error("Missing claim: {0}")]
    MissingClaim(&'static str),

    /// Outbound JWKS fetch failed or timed out
    #[error("Upstream key fetch failed: {0}")]
    Upstream(String),

    /// Storage failed during a non-critical write; the request still succeeds
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Storage failed during a critical write
    #[error("Fatal persistence error: {0}")]
    PersistenceFatal(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl Error {
    /// Map this error to the HTTP status the shell should answer with.
    ///
    /// Upstream fetch failures collapse into the same 401 as an unknown key
    /// so callers cannot distinguish a missing key from an unreachable peer.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::MalformedToken(_) | Self::MissingClaim(_) => StatusCode::BAD_REQUEST,
            Self::UnknownKey | Self::SignatureInvalid | Self::Upstream(_) => {
                StatusCode::UNAUTHORIZED
            }
            Self::PersistenceFatal(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short machine-readable code for the JSON error envelope.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::MalformedToken(_) => "malformed_token",
            Self::UnknownKey | Self::Upstream(_) => "unknown_key",
            Self::SignatureInvalid => "invalid_signature",
            Self::MissingClaim(_) => "missing_claim",
            Self::Persistence(_) => "persistence",
            Self::PersistenceFatal(_) => "persistence_unavailable",
            Self::Config(_) => "config",
            _ => "internal",
        }
    }
}
