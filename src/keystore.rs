//! Process signing key: load-else-generate with atomic persistence.
//!
//! The service owns exactly one Ed25519 keypair per process. On startup the
//! persisted record is loaded from the configured path; if it is absent or
//! unreadable a fresh keypair is generated and written back with a
//! write-then-rename so a crash mid-write never leaves a half-file for the
//! next start to pick up. Persist failures are logged and swallowed — the
//! in-memory key stays usable and a restart simply regenerates.

use std::fs;
use std::path::Path;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::token::{Jwk, ALG_EDDSA};
use crate::Result;

/// On-disk signing-key record.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedKey {
    /// Algorithm tag; always `EdDSA`
    algorithm: String,
    /// Stable key id
    kid: String,
    /// Private scalar, base64url without padding
    private_key: String,
    /// Public point, base64url without padding
    public_key: String,
    /// When the keypair was first generated
    created_at: DateTime<Utc>,
}

/// The process signing key and its stable identity.
///
/// Written once at startup; every reader afterwards borrows the public half
/// lock-free through a shared reference.
pub struct KeyStore {
    signing: SigningKey,
    kid: String,
    created_at: DateTime<Utc>,
}

impl KeyStore {
    /// Load the persisted key record, or generate and persist a new one.
    ///
    /// Load failures of any kind fall through to generation: availability is
    /// preferred over key continuity here.
    pub fn load_or_generate(path: &Path) -> Result<Self> {
        match Self::load(path) {
            Ok(store) => {
                info!(kid = %store.kid, path = %path.display(), "Loaded signing key");
                return Ok(store);
            }
            Err(e) if path.exists() => {
                warn!(path = %path.display(), error = %e, "Unreadable signing key record, regenerating");
            }
            Err(_) => {}
        }

        let store = Self::generate();
        if let Err(e) = store.persist(path) {
            warn!(path = %path.display(), error = %e, "Failed to persist signing key; continuing with in-memory key");
        } else {
            info!(kid = %store.kid, path = %path.display(), "Generated and persisted signing key");
        }
        Ok(store)
    }

    /// Generate a fresh keypair without touching storage.
    #[must_use]
    pub fn generate() -> Self {
        let signing = SigningKey::generate(&mut OsRng);
        let kid = derive_kid(&signing.verifying_key());
        Self {
            signing,
            kid,
            created_at: Utc::now(),
        }
    }

    fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)?;
        let record: PersistedKey = serde_json::from_slice(&bytes)?;

        if record.algorithm != ALG_EDDSA {
            return Err(crate::Error::Config(format!(
                "persisted key algorithm {} is not {ALG_EDDSA}",
                record.algorithm
            )));
        }

        let scalar = URL_SAFE_NO_PAD
            .decode(&record.private_key)
            .map_err(|e| crate::Error::Config(format!("private key encoding: {e}")))?;
        let scalar: [u8; 32] = scalar
            .try_into()
            .map_err(|_| crate::Error::Config("private key is not 32 bytes".into()))?;
        let signing = SigningKey::from_bytes(&scalar);

        // The persisted public point must match the scalar, otherwise the
        // record is treated as corrupt.
        let expected_public = URL_SAFE_NO_PAD.encode(signing.verifying_key().as_bytes());
        if record.public_key != expected_public {
            return Err(crate::Error::Config(
                "persisted public key does not match private scalar".into(),
            ));
        }

        Ok(Self {
            signing,
            kid: record.kid,
            created_at: record.created_at,
        })
    }

    /// Persist the key record atomically: write a sibling temp file, then
    /// rename over the target.
    pub fn persist(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let record = PersistedKey {
            algorithm: ALG_EDDSA.to_string(),
            kid: self.kid.clone(),
            private_key: URL_SAFE_NO_PAD.encode(self.signing.to_bytes()),
            public_key: URL_SAFE_NO_PAD.encode(self.signing.verifying_key().as_bytes()),
            created_at: self.created_at,
        };

        let tmp = path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&record)?)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Produce a detached signature over arbitrary bytes.
    #[must_use]
    pub fn sign(&self, bytes: &[u8]) -> Signature {
        self.signing.sign(bytes)
    }

    /// The public half of the signing key.
    #[must_use]
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }

    /// Stable key id, published as `kid` in headers and JWKS records.
    #[must_use]
    pub fn kid(&self) -> &str {
        &self.kid
    }

    /// Algorithm tag for emitted tokens.
    #[must_use]
    pub fn algorithm(&self) -> &'static str {
        ALG_EDDSA
    }

    /// When the keypair was first generated.
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Public key record published through the discovery endpoint.
    #[must_use]
    pub fn public_jwk(&self) -> Jwk {
        Jwk::public_ed25519(
            URL_SAFE_NO_PAD.encode(self.signing.verifying_key().as_bytes()),
            Some(self.kid.clone()),
        )
    }
}

/// Derive a stable key id from the public point.
fn derive_kid(key: &VerifyingKey) -> String {
    let digest = Sha256::digest(key.as_bytes());
    URL_SAFE_NO_PAD.encode(&digest[..12])
}
