//! Claim and header shapes carried inside tokens.
//!
//! The wire format is JSON; field order follows struct declaration order so
//! an encode/decode round trip reproduces the canonical bytes.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use ed25519_dalek::{SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

use super::{ALG_EDDSA, DEFAULT_SCOPE};

/// Token header: algorithm, type, and one of `kid` (discoverable key) or
/// `jwk` (embedded key).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenHeader {
    /// Signature algorithm; always `EdDSA`
    pub alg: String,
    /// Token type; always `JWT` on emitted tokens, defaulted when a peer
    /// omits it
    #[serde(default = "default_typ")]
    pub typ: String,
    /// Key id resolvable through JWKS discovery
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
    /// Embedded verification key for self-signed tokens
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwk: Option<Jwk>,
}

fn default_typ() -> String {
    "JWT".to_string()
}

impl TokenHeader {
    /// Header for a token signed by the local key store.
    #[must_use]
    pub fn local(kid: impl Into<String>) -> Self {
        Self {
            alg: ALG_EDDSA.to_string(),
            typ: "JWT".to_string(),
            kid: Some(kid.into()),
            jwk: None,
        }
    }

    /// Header carrying an embedded key.
    #[must_use]
    pub fn embedded(jwk: Jwk) -> Self {
        Self {
            alg: ALG_EDDSA.to_string(),
            typ: "JWT".to_string(),
            kid: None,
            jwk: Some(jwk),
        }
    }
}

/// JSON Web Key restricted to the shapes this service emits and accepts:
/// Ed25519 points on the OKP key type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    /// Key type; `OKP` for Ed25519
    pub kty: String,
    /// Curve name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crv: Option<String>,
    /// Public point, base64url without padding (32 bytes)
    pub x: String,
    /// Private scalar, base64url without padding (32 bytes). Tolerated in
    /// incoming headers; never consulted by verifiers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub d: Option<String>,
    /// Usage tag
    #[serde(rename = "use", skip_serializing_if = "Option::is_none")]
    pub use_: Option<String>,
    /// Algorithm tag
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,
    /// Key id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
}

impl Jwk {
    /// Build a public signature-use Ed25519 JWK from an encoded point.
    #[must_use]
    pub fn public_ed25519(x: impl Into<String>, kid: Option<String>) -> Self {
        Self {
            kty: "OKP".to_string(),
            crv: Some("Ed25519".to_string()),
            x: x.into(),
            d: None,
            use_: Some("sig".to_string()),
            alg: Some(ALG_EDDSA.to_string()),
            kid,
        }
    }

    /// True when this key is an Ed25519 signature key this service can use.
    #[must_use]
    pub fn is_ed25519(&self) -> bool {
        self.kty == "OKP" && self.crv.as_deref() == Some("Ed25519")
    }

    /// Decode the public point into a verifying key.
    pub fn verifying_key(&self) -> Result<VerifyingKey> {
        if !self.is_ed25519() {
            return Err(Error::UnknownKey);
        }
        let bytes = URL_SAFE_NO_PAD
            .decode(&self.x)
            .map_err(|_| Error::MalformedToken("jwk x is not base64url".into()))?;
        let point: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::MalformedToken("jwk x is not 32 bytes".into()))?;
        VerifyingKey::from_bytes(&point).map_err(|_| Error::UnknownKey)
    }

    /// Decode the private scalar into a signing key, when one is present.
    ///
    /// The caller is expected to use the result immediately and drop it; the
    /// scalar is never cached or persisted.
    pub fn signing_key(&self) -> Option<Result<SigningKey>> {
        let d = self.d.as_ref()?;
        let decoded = match URL_SAFE_NO_PAD.decode(d) {
            Ok(b) => b,
            Err(_) => {
                return Some(Err(Error::MalformedToken("jwk d is not base64url".into())))
            }
        };
        let scalar: [u8; 32] = match decoded.try_into() {
            Ok(s) => s,
            Err(_) => return Some(Err(Error::MalformedToken("jwk d is not 32 bytes".into()))),
        };
        Some(Ok(SigningKey::from_bytes(&scalar)))
    }

    /// Copy of this key with the private scalar stripped.
    #[must_use]
    pub fn without_private(&self) -> Self {
        Self {
            d: None,
            ..self.clone()
        }
    }
}

/// Claim set carried inside a token.
///
/// `sub`, `iat`, `exp`, `iss`, `jti` are always present on emitted tokens;
/// the rest appear as the operation requires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimSet {
    /// Player (or server) id
    pub sub: String,
    /// Issued-at, Unix epoch seconds
    pub iat: i64,
    /// Expires-at, Unix epoch seconds
    pub exp: i64,
    /// Issuer URL this token was bound to at emission
    pub iss: String,
    /// Unique token id
    pub jti: String,
    /// Display name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Account username
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Canonical space-separated scope string
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Server audience this token is bound to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aud: Option<Audience>,
    /// Owned entitlements
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entitlements: Option<Vec<String>>,
    /// Confirmation binding to an external secret
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cnf: Option<Confirmation>,
}

impl ClaimSet {
    /// First audience entry, if any.
    #[must_use]
    pub fn audience(&self) -> Option<&str> {
        self.aud.as_ref().and_then(Audience::first)
    }
}

/// Audience claim; peers emit both the single-string and array forms.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Audience {
    /// A single audience string
    Single(String),
    /// Multiple audiences; the first entry is authoritative here
    Multiple(Vec<String>),
}

impl Audience {
    /// The authoritative audience entry.
    #[must_use]
    pub fn first(&self) -> Option<&str> {
        match self {
            Self::Single(s) => Some(s),
            Self::Multiple(v) => v.first().map(String::as_str),
        }
    }
}

/// Confirmation claim binding a token to a transport certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Confirmation {
    /// SHA-256 certificate thumbprint, supplied verbatim by the caller
    #[serde(rename = "x5t#S256")]
    pub x5t_s256: String,
}

/// Scope input at the request boundary: clients send a list, a single
/// string, or nothing at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scopes {
    /// List form; joined by single spaces in input order
    List(Vec<String>),
    /// String form; passed through verbatim
    Single(String),
}

impl Scopes {
    /// Normalize an optional scope input into the canonical string.
    ///
    /// Duplicates in list input are preserved.
    #[must_use]
    pub fn normalize(input: Option<Scopes>) -> String {
        match input {
            None => DEFAULT_SCOPE.to_string(),
            Some(Scopes::Single(s)) => s,
            Some(Scopes::List(items)) => items.join(" "),
        }
    }
}
