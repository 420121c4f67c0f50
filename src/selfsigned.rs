//! Self-signed token acceptance.
//!
//! A self-signed token carries its own Ed25519 verification key in the
//! header `jwk`. The embedded public key alone verifies the signature;
//! trust beyond that is deliberately anchored in whatever policy the game
//! server enforces downstream.
//!
//! When the bypass policy is active, the exchange endpoints do not run a
//! self-signed token through the normal grant machinery. Instead a
//! replacement token is synthesized on the spot, signed by the embedded
//! *private* key when the client shipped one — a client that signs its own
//! identity expects the response to verify under the same embedded key —
//! and by the local key store otherwise. The embedded private scalar is
//! read exactly once here and never persisted or cached.

use ed25519_dalek::Signer;
use uuid::Uuid;

use crate::keystore::KeyStore;
use crate::token::{self, ClaimSet, Confirmation, DecodedToken, TokenHeader, ALG_EDDSA};
use crate::token::claims::Audience;
use crate::Result;

/// Whether a header marks its token as self-signed: an embedded Ed25519
/// key with a public point and a matching algorithm tag. A private scalar
/// in the header is tolerated but not required.
#[must_use]
pub fn is_self_signed(header: &TokenHeader) -> bool {
    header.jwk.as_ref().is_some_and(|jwk| {
        jwk.is_ed25519() && jwk.alg.as_deref().map_or(true, |alg| alg == ALG_EDDSA)
    })
}

/// Verify a self-signed token against its own embedded public key.
///
/// No other check is performed.
pub fn verify_embedded(decoded: &DecodedToken) -> Result<()> {
    let jwk = decoded
        .header
        .jwk
        .as_ref()
        .ok_or(crate::Error::MissingClaim("jwk"))?;
    let key = jwk.verifying_key()?;
    token::verify(decoded.signing_input.as_bytes(), &decoded.signature, &key)
}

/// Policy hook deciding whether the exchange endpoints short-circuit for a
/// self-signed token.
#[derive(Debug, Clone, Copy)]
pub struct BypassPolicy {
    accept_self_signed: bool,
}

impl BypassPolicy {
    /// Build the policy from the configured flag.
    #[must_use]
    pub fn new(accept_self_signed: bool) -> Self {
        Self { accept_self_signed }
    }

    /// Whether this request should bypass the exchange for `header`.
    #[must_use]
    pub fn should_bypass(&self, header: &TokenHeader) -> bool {
        self.accept_self_signed && is_self_signed(header)
    }
}

/// Synthesize the replacement token the bypass hands back.
///
/// The subject (and display fields) come from the presented token; issuer,
/// audience, scope, and fingerprint come from the caller; the confirmation
/// field carries the fingerprint verbatim.
#[allow(clippy::too_many_arguments)]
pub fn mint_replacement(
    presented: &DecodedToken,
    issuer: &str,
    audience: Option<&str>,
    scope: &str,
    fingerprint: Option<&str>,
    ttl_secs: i64,
    keys: &KeyStore,
) -> Result<String> {
    let now = token::unix_now();
    let claims = ClaimSet {
        sub: presented.claims.sub.clone(),
        iat: now,
        exp: now + ttl_secs,
        iss: issuer.to_string(),
        jti: Uuid::new_v4().to_string(),
        name: presented.claims.name.clone(),
        username: presented.claims.username.clone(),
        scope: Some(scope.to_string()),
        aud: audience.map(|a| Audience::Single(a.to_string())),
        entitlements: None,
        cnf: fingerprint.map(|fp| Confirmation {
            x5t_s256: fp.to_string(),
        }),
    };

    if let Some(jwk) = presented.header.jwk.as_ref() {
        if let Some(signing_key) = jwk.signing_key() {
            let signing_key = signing_key?;
            let header = TokenHeader::embedded(jwk.without_private());
            return token::encode(&header, &claims, |input| signing_key.sign(input));
        }
    }

    let header = TokenHeader::local(keys.kid());
    token::encode(&header, &claims, |input| keys.sign(input))
}
