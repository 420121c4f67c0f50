//! Configuration management

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// HTTP server configuration
    pub server: ServerConfig,
    /// Issuer binding and trust classification
    pub issuer: IssuerConfig,
    /// Token lifetimes and key storage
    pub tokens: TokenConfig,
    /// Foreign-key discovery and caching
    pub federation: FederationConfig,
    /// Backward-compatibility switches
    pub compat: CompatConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Environment variables use the `SESSION_GATEWAY_` prefix with `__` as
    /// the section separator, e.g. `SESSION_GATEWAY_ISSUER__BASE_DOMAIN`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed("SESSION_GATEWAY_").split("__"));

        figment.extract().map_err(|e| Error::Config(e.to_string()))
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8480,
        }
    }
}

/// Issuer resolution and classification
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IssuerConfig {
    /// Base domain for issuer binding; hosts inside it become their own
    /// issuer, everything else falls back to `https://<base_domain>`
    pub base_domain: String,
    /// Hosts treated as this deployment itself (the base domain is always
    /// included)
    pub local_hosts: Vec<String>,
    /// Allow-list of official vendor issuer hosts; their trust path is
    /// external to this service
    pub official_hosts: Vec<String>,
    /// Accept self-signed identity tokens on the exchange endpoints
    pub accept_self_signed: bool,
}

impl Default for IssuerConfig {
    fn default() -> Self {
        Self {
            base_domain: "localhost".to_string(),
            local_hosts: Vec::new(),
            official_hosts: vec!["sessions.hytale.com".to_string()],
            accept_self_signed: true,
        }
    }
}

/// Token lifetimes and signing-key storage
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    /// Where the persisted signing-key record lives
    pub signing_key_path: PathBuf,
    /// Session, grant, and access token lifetime in seconds
    pub session_ttl_secs: u64,
}

impl TokenConfig {
    /// Session TTL as a `Duration`.
    #[must_use]
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            signing_key_path: PathBuf::from("signing-key.json"),
            session_ttl_secs: 36_000,
        }
    }
}

/// Foreign-key discovery and caching
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FederationConfig {
    /// How long a fetched foreign key stays fresh, in seconds
    pub cache_ttl_secs: u64,
    /// How long a failed issuer is negatively cached, in seconds
    pub negative_cache_secs: u64,
    /// Hard deadline for an outbound JWKS fetch, in seconds
    pub fetch_timeout_secs: u64,
    /// Maximum number of cached foreign keys; oldest entries are evicted
    pub cache_capacity: usize,
    /// Surface fresh foreign keys through the local discovery endpoint
    pub publish_merged: bool,
}

impl FederationConfig {
    /// Foreign-key TTL as a `Duration`.
    #[must_use]
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    /// Negative-cache interval as a `Duration`.
    #[must_use]
    pub fn negative_cache(&self) -> Duration {
        Duration::from_secs(self.negative_cache_secs)
    }

    /// Fetch deadline as a `Duration`.
    #[must_use]
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 3_600,
            negative_cache_secs: 30,
            fetch_timeout_secs: 5,
            cache_capacity: 256,
            publish_merged: false,
        }
    }
}

/// Backward-compatibility switches
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CompatConfig {
    /// Emit a grant and access token from the catch-all route instead of
    /// returning 404. Development convenience for clients that probe
    /// unknown paths; off in production.
    pub catch_all_tokens: bool,
}
