//! Compact token envelope: encode, decode, verify.
//!
//! The envelope is `header.claims.signature` where each segment is
//! base64url without padding. The signing input is the UTF-8 bytes of
//! `header.claims`. Decoding performs no cryptographic check — the caller
//! picks a key from the header and calls [`verify`] afterwards.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};

use crate::{Error, Result};

use super::claims::{ClaimSet, TokenHeader};
use super::ALG_EDDSA;

/// Result of decoding a compact token without verification.
///
/// Keeps the raw signing input alongside the typed header and claims so a
/// verifier can check the exact bytes that were signed.
#[derive(Debug, Clone)]
pub struct DecodedToken {
    /// Parsed header
    pub header: TokenHeader,
    /// Parsed claims
    pub claims: ClaimSet,
    /// `header.claims` exactly as received
    pub signing_input: String,
    /// Raw signature bytes
    pub signature: Vec<u8>,
}

/// Serialize and sign a token.
///
/// The signer closure receives the signing input and returns a detached
/// signature; this keeps the codec free of any key-selection policy.
pub fn encode<F>(header: &TokenHeader, claims: &ClaimSet, sign: F) -> Result<String>
where
    F: FnOnce(&[u8]) -> Signature,
{
    let header_segment = URL_SAFE_NO_PAD.encode(serde_json::to_vec(header)?);
    let claims_segment = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims)?);
    let signing_input = format!("{header_segment}.{claims_segment}");

    let signature = sign(signing_input.as_bytes());
    let signature_segment = URL_SAFE_NO_PAD.encode(signature.to_bytes());

    Ok(format!("{signing_input}.{signature_segment}"))
}

/// Split and parse a compact token without checking its signature.
///
/// # Errors
///
/// `MalformedToken` when the input does not have exactly three segments, a
/// segment fails base64 decoding, the JSON is invalid, or the header does
/// not advertise `EdDSA`.
pub fn decode_unverified(token: &str) -> Result<DecodedToken> {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        return Err(Error::MalformedToken(format!(
            "expected 3 segments, got {}",
            parts.len()
        )));
    }

    let header_bytes = URL_SAFE_NO_PAD
        .decode(parts[0])
        .map_err(|_| Error::MalformedToken("header segment is not base64url".into()))?;
    let claims_bytes = URL_SAFE_NO_PAD
        .decode(parts[1])
        .map_err(|_| Error::MalformedToken("claims segment is not base64url".into()))?;
    let signature = URL_SAFE_NO_PAD
        .decode(parts[2])
        .map_err(|_| Error::MalformedToken("signature segment is not base64url".into()))?;

    let header: TokenHeader = serde_json::from_slice(&header_bytes)
        .map_err(|e| Error::MalformedToken(format!("header JSON: {e}")))?;

    if header.alg != ALG_EDDSA {
        return Err(Error::MalformedToken(format!(
            "unsupported algorithm {}",
            header.alg
        )));
    }

    let claims: ClaimSet = serde_json::from_slice(&claims_bytes)
        .map_err(|e| Error::MalformedToken(format!("claims JSON: {e}")))?;

    Ok(DecodedToken {
        header,
        claims,
        signing_input: format!("{}.{}", parts[0], parts[1]),
        signature,
    })
}

/// Verify a detached signature over a signing input.
///
/// # Errors
///
/// `SignatureInvalid` when the signature bytes are not a valid Ed25519
/// signature or do not verify under `key`.
pub fn verify(signing_input: &[u8], signature: &[u8], key: &VerifyingKey) -> Result<()> {
    let signature = Signature::from_slice(signature).map_err(|_| Error::SignatureInvalid)?;
    key.verify(signing_input, &signature)
        .map_err(|_| Error::SignatureInvalid)
}
