//! JWKS federation — foreign verification keys, discovered on demand.
//!
//! # Key routing
//!
//! Every verifier funnels through [`KeyFederation::key_for_token`], which
//! routes on a single [`KeySource`] classification instead of re-examining
//! the header at each call site:
//!
//! 1. Header carries an embedded `jwk` → return it directly (whether the
//!    caller *trusts* it is the self-signed policy's decision).
//! 2. Issuer classifies local → the local key store's key, when the `kid`
//!    matches.
//! 3. Issuer classifies official → not found here; the official trust path
//!    is external to this service.
//! 4. Foreign → cache lookup by `(issuer, kid)`, fetching
//!    `<issuer>/.well-known/jwks.json` on a miss.
//!
//! # Caching
//!
//! Fetched keys live for a configured TTL; unreachable issuers are
//! negatively cached for a short interval so one dead peer cannot stall
//! every request. A document that arrives but fails to parse is not
//! negative-cached — the next request retries the fetch. Concurrent misses
//! for the same issuer coalesce into a single outbound fetch. Capacity is
//! bounded; the oldest entries are evicted first.
//!
//! All network, TLS, parse, and timeout failures collapse to `UnknownKey`;
//! verification paths reject the token without detail.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use ed25519_dalek::VerifyingKey;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::FederationConfig;
use crate::issuer::{IssuerClass, IssuerResolver};
use crate::keystore::KeyStore;
use crate::telemetry::{Event, Telemetry};
use crate::token::{Jwk, TokenHeader};
use crate::{Error, Result};

/// Where a token's verifying key comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySource {
    /// The header embeds its own key
    Embedded(Jwk),
    /// Signed by this deployment's key store
    Local {
        /// Key id from the header
        kid: String,
    },
    /// Official vendor issuer; verified elsewhere
    Official,
    /// Foreign issuer; key discovered through JWKS federation
    Foreign {
        /// Issuer URL from the claims
        issuer: String,
        /// Key id from the header
        kid: String,
    },
}

/// Classify a token header + issuer pair into a [`KeySource`].
pub fn key_source(
    header: &TokenHeader,
    issuer: &str,
    resolver: &IssuerResolver,
) -> Result<KeySource> {
    if let Some(jwk) = &header.jwk {
        if jwk.is_ed25519() {
            return Ok(KeySource::Embedded(jwk.clone()));
        }
        return Err(Error::UnknownKey);
    }

    let kid = header
        .kid
        .clone()
        .ok_or(Error::MissingClaim("kid"))?;

    Ok(match resolver.classify(issuer) {
        IssuerClass::Local => KeySource::Local { kid },
        IssuerClass::Official => KeySource::Official,
        IssuerClass::Foreign => KeySource::Foreign {
            issuer: issuer.to_string(),
            kid,
        },
    })
}

/// A JWKS discovery document.
#[derive(Debug, Clone, Deserialize)]
pub struct JwksDocument {
    /// Published verification keys
    pub keys: Vec<Jwk>,
}

/// Why an outbound JWKS fetch failed. Only [`FetchError::Transport`]
/// failures are negative-cached; a parse failure is retried on the next
/// request.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// Network, TLS, timeout, or cancellation failure
    #[error("transport: {0}")]
    Transport(String),
    /// The document arrived but did not parse as JWKS JSON
    #[error("parse: {0}")]
    Parse(String),
}

impl FetchError {
    /// True when the document arrived but could not be parsed.
    #[must_use]
    pub fn is_parse(&self) -> bool {
        matches!(self, Self::Parse(_))
    }
}

/// Outbound JWKS transport. A trait so tests can count and script fetches.
#[async_trait::async_trait]
pub trait JwksFetcher: Send + Sync + 'static {
    /// Fetch and parse the JWKS document at `url`.
    async fn fetch(&self, url: &str) -> std::result::Result<JwksDocument, FetchError>;
}

/// Production fetcher backed by `reqwest` with a hard deadline.
pub struct HttpJwksFetcher {
    http: reqwest::Client,
}

impl HttpJwksFetcher {
    /// Build a fetcher whose requests abort after `timeout`.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
        }
    }
}

#[async_trait::async_trait]
impl JwksFetcher for HttpJwksFetcher {
    async fn fetch(&self, url: &str) -> std::result::Result<JwksDocument, FetchError> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        response.json().await.map_err(|e| {
            if e.is_decode() {
                FetchError::Parse(e.to_string())
            } else {
                FetchError::Transport(e.to_string())
            }
        })
    }
}

/// A cached foreign key record.
struct CachedKey {
    jwk: Jwk,
    key: VerifyingKey,
    fetched_at: Instant,
    ttl: Duration,
}

impl CachedKey {
    fn is_stale(&self) -> bool {
        self.fetched_at.elapsed() >= self.ttl
    }
}

/// Foreign-key cache and key-routing front end.
pub struct KeyFederation {
    local: Arc<KeyStore>,
    resolver: IssuerResolver,
    fetcher: Arc<dyn JwksFetcher>,
    /// `(issuer, kid)` → cached key
    cache: DashMap<(String, String), CachedKey>,
    /// issuer → last fetch failure
    negative: DashMap<String, Instant>,
    /// issuer → single-flight guard
    inflight: DashMap<String, Arc<Mutex<()>>>,
    config: FederationConfig,
    telemetry: Telemetry,
}

impl KeyFederation {
    /// Build the federation front end with the production HTTP fetcher.
    #[must_use]
    pub fn new(
        local: Arc<KeyStore>,
        resolver: IssuerResolver,
        config: FederationConfig,
        telemetry: Telemetry,
    ) -> Self {
        let fetcher = Arc::new(HttpJwksFetcher::new(config.fetch_timeout()));
        Self::with_fetcher(local, resolver, config, fetcher, telemetry)
    }

    /// Build with a custom fetcher (tests).
    #[must_use]
    pub fn with_fetcher(
        local: Arc<KeyStore>,
        resolver: IssuerResolver,
        config: FederationConfig,
        fetcher: Arc<dyn JwksFetcher>,
        telemetry: Telemetry,
    ) -> Self {
        Self {
            local,
            resolver,
            fetcher,
            cache: DashMap::new(),
            negative: DashMap::new(),
            inflight: DashMap::new(),
            config,
            telemetry,
        }
    }

    /// Locate the verifying key for a token.
    ///
    /// # Errors
    ///
    /// `UnknownKey` when no key can be located, including every flavor of
    /// fetch failure. `MissingClaim` when the header carries neither `kid`
    /// nor a usable `jwk`.
    pub async fn key_for_token(
        &self,
        header: &TokenHeader,
        issuer: &str,
    ) -> Result<VerifyingKey> {
        match key_source(header, issuer, &self.resolver)? {
            KeySource::Embedded(jwk) => jwk.verifying_key(),
            KeySource::Local { kid } => {
                if kid == self.local.kid() {
                    Ok(self.local.verifying_key())
                } else {
                    Err(Error::UnknownKey)
                }
            }
            KeySource::Official => Err(Error::UnknownKey),
            KeySource::Foreign { issuer, kid } => self.foreign_key(&issuer, &kid).await,
        }
    }

    /// Look up a foreign key, fetching the issuer's JWKS on a miss.
    async fn foreign_key(&self, issuer: &str, kid: &str) -> Result<VerifyingKey> {
        let cache_key = (issuer.to_string(), kid.to_string());

        if let Some(entry) = self.cache.get(&cache_key) {
            if !entry.is_stale() {
                return Ok(entry.key);
            }
        }

        if self.is_negative_cached(issuer) {
            return Err(Error::UnknownKey);
        }

        // Single flight per issuer: the first miss fetches, concurrent
        // misses wait on the same guard and then re-read the cache.
        let guard = self
            .inflight
            .entry(issuer.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _held = guard.lock().await;

        if let Some(entry) = self.cache.get(&cache_key) {
            if !entry.is_stale() {
                return Ok(entry.key);
            }
        }
        if self.is_negative_cached(issuer) {
            return Err(Error::UnknownKey);
        }

        let url = jwks_url(issuer);
        debug!(issuer = %issuer, url = %url, "Fetching foreign JWKS");

        let document = match self.fetcher.fetch(&url).await {
            Ok(doc) => doc,
            Err(e) => {
                self.telemetry.record(Event::JwksFetchFailed);
                if e.is_parse() {
                    // The issuer is reachable; the next request retries
                    warn!(issuer = %issuer, error = %e, "JWKS document did not parse");
                } else {
                    warn!(issuer = %issuer, error = %e, "JWKS fetch failed; negative-caching issuer");
                    self.negative.insert(issuer.to_string(), Instant::now());
                }
                return Err(Error::UnknownKey);
            }
        };

        self.telemetry.record(Event::JwksFetchOk);
        self.negative.remove(issuer);
        self.insert_document(issuer, &document);
        self.evict_over_capacity();

        match self.cache.get(&cache_key) {
            Some(entry) => Ok(entry.key),
            None => Err(Error::UnknownKey),
        }
    }

    fn is_negative_cached(&self, issuer: &str) -> bool {
        let stale = match self.negative.get(issuer).map(|entry| entry.elapsed()) {
            Some(elapsed) if elapsed < self.config.negative_cache() => return true,
            Some(_) => true,
            None => false,
        };
        if stale {
            self.negative.remove(issuer);
        }
        false
    }

    /// Cache every usable Ed25519 key from a fetched document.
    fn insert_document(&self, issuer: &str, document: &JwksDocument) {
        for jwk in &document.keys {
            let Some(kid) = jwk.kid.clone() else { continue };
            let Ok(key) = jwk.verifying_key() else {
                continue;
            };
            self.cache.insert(
                (issuer.to_string(), kid),
                CachedKey {
                    jwk: jwk.without_private(),
                    key,
                    fetched_at: Instant::now(),
                    ttl: self.config.cache_ttl(),
                },
            );
        }
    }

    /// Drop the oldest entries until the cache is back under capacity.
    fn evict_over_capacity(&self) {
        while self.cache.len() > self.config.cache_capacity {
            let oldest = self
                .cache
                .iter()
                .min_by_key(|e| e.value().fetched_at)
                .map(|e| e.key().clone());
            match oldest {
                Some(key) => {
                    self.cache.remove(&key);
                }
                None => break,
            }
        }
    }

    /// Drop every cached key for an issuer.
    pub fn invalidate(&self, issuer: &str) {
        self.cache.retain(|(cached_issuer, _), _| cached_issuer != issuer);
        self.negative.remove(issuer);
    }

    /// Union of the local public key and every fresh foreign key, for
    /// consumers that cannot issue per-token lookups. Official keys are
    /// referenced by their own discovery endpoints, never copied here.
    #[must_use]
    pub fn merged_key_set(&self) -> Vec<Jwk> {
        let mut keys = vec![self.local.public_jwk()];
        for entry in &self.cache {
            if !entry.value().is_stale() {
                keys.push(entry.value().jwk.clone());
            }
        }
        keys
    }

    /// Number of cached foreign keys (fresh or stale).
    #[must_use]
    pub fn cached_key_count(&self) -> usize {
        self.cache.len()
    }
}

/// JWKS discovery URL for an issuer.
fn jwks_url(issuer: &str) -> String {
    let base = issuer.trim_end_matches('/');
    format!("{base}/.well-known/jwks.json")
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
    use ed25519_dalek::SigningKey;

    use super::*;
    use crate::config::IssuerConfig;

    fn resolver() -> IssuerResolver {
        IssuerResolver::new(&IssuerConfig {
            base_domain: "play.example".to_string(),
            local_hosts: Vec::new(),
            official_hosts: vec!["sessions.hytale.com".to_string()],
            accept_self_signed: true,
        })
    }

    fn foreign_jwk(kid: &str, seed: u8) -> Jwk {
        let key = SigningKey::from_bytes(&[seed; 32]);
        Jwk::public_ed25519(
            URL_SAFE_NO_PAD.encode(key.verifying_key().as_bytes()),
            Some(kid.to_string()),
        )
    }

    /// Scripted fetcher: returns the configured document and counts calls.
    struct ScriptedFetcher {
        document: Option<JwksDocument>,
        parse_error: bool,
        calls: AtomicUsize,
        delay: Duration,
    }

    impl ScriptedFetcher {
        fn ok(keys: Vec<Jwk>) -> Self {
            Self {
                document: Some(JwksDocument { keys }),
                parse_error: false,
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
            }
        }

        fn failing() -> Self {
            Self {
                document: None,
                parse_error: false,
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
            }
        }

        fn parse_failing() -> Self {
            Self {
                document: None,
                parse_error: true,
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl JwksFetcher for ScriptedFetcher {
        async fn fetch(&self, _url: &str) -> std::result::Result<JwksDocument, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            match &self.document {
                Some(doc) => Ok(doc.clone()),
                None if self.parse_error => {
                    Err(FetchError::Parse("scripted parse failure".into()))
                }
                None => Err(FetchError::Transport("scripted transport failure".into())),
            }
        }
    }

    fn federation(fetcher: Arc<ScriptedFetcher>, config: FederationConfig) -> KeyFederation {
        KeyFederation::with_fetcher(
            Arc::new(KeyStore::generate()),
            resolver(),
            config,
            fetcher,
            Telemetry::disabled(),
        )
    }

    #[test]
    fn jwks_url_appends_well_known_path() {
        assert_eq!(
            jwks_url("https://peer.example"),
            "https://peer.example/.well-known/jwks.json"
        );
        assert_eq!(
            jwks_url("https://peer.example/"),
            "https://peer.example/.well-known/jwks.json"
        );
    }

    #[test]
    fn key_source_routes_embedded_before_everything() {
        // GIVEN: a header with an embedded key and a local issuer
        let header = TokenHeader::embedded(foreign_jwk("k", 1));

        // THEN: the embedded key wins even for the local issuer
        let source = key_source(&header, "https://play.example", &resolver()).unwrap();
        assert!(matches!(source, KeySource::Embedded(_)));
    }

    #[test]
    fn key_source_routes_by_issuer_class() {
        let header = TokenHeader::local("kid-1");
        let r = resolver();

        assert!(matches!(
            key_source(&header, "https://play.example", &r).unwrap(),
            KeySource::Local { .. }
        ));
        assert!(matches!(
            key_source(&header, "https://sessions.hytale.com", &r).unwrap(),
            KeySource::Official
        ));
        assert!(matches!(
            key_source(&header, "https://peer.example", &r).unwrap(),
            KeySource::Foreign { .. }
        ));
    }

    #[test]
    fn key_source_requires_kid_without_jwk() {
        let header = TokenHeader {
            alg: "EdDSA".into(),
            typ: "JWT".into(),
            kid: None,
            jwk: None,
        };
        assert!(matches!(
            key_source(&header, "https://peer.example", &resolver()),
            Err(Error::MissingClaim("kid"))
        ));
    }

    #[tokio::test]
    async fn local_kid_resolves_to_local_key() {
        let local = Arc::new(KeyStore::generate());
        let federation = KeyFederation::with_fetcher(
            Arc::clone(&local),
            resolver(),
            FederationConfig::default(),
            Arc::new(ScriptedFetcher::failing()),
            Telemetry::disabled(),
        );

        let header = TokenHeader::local(local.kid());
        let key = federation
            .key_for_token(&header, "https://play.example")
            .await
            .unwrap();
        assert_eq!(key, local.verifying_key());
    }

    #[tokio::test]
    async fn unknown_local_kid_is_rejected_without_fetching() {
        let fetcher = Arc::new(ScriptedFetcher::failing());
        let federation = federation(Arc::clone(&fetcher), FederationConfig::default());

        let header = TokenHeader::local("not-the-local-kid");
        let result = federation
            .key_for_token(&header, "https://play.example")
            .await;

        assert!(matches!(result, Err(Error::UnknownKey)));
        assert_eq!(fetcher.calls(), 0);
    }

    #[tokio::test]
    async fn official_issuer_is_not_resolved_here() {
        let fetcher = Arc::new(ScriptedFetcher::failing());
        let federation = federation(Arc::clone(&fetcher), FederationConfig::default());

        let header = TokenHeader::local("any-kid");
        let result = federation
            .key_for_token(&header, "https://sessions.hytale.com")
            .await;

        // No fetch attempted: official trust is handled elsewhere
        assert!(matches!(result, Err(Error::UnknownKey)));
        assert_eq!(fetcher.calls(), 0);
    }

    #[tokio::test]
    async fn foreign_key_is_fetched_then_served_from_cache() {
        // GIVEN: a foreign issuer publishing one key
        let fetcher = Arc::new(ScriptedFetcher::ok(vec![foreign_jwk("peer-k1", 21)]));
        let federation = federation(Arc::clone(&fetcher), FederationConfig::default());
        let header = TokenHeader::local("peer-k1");

        // WHEN: the same key is requested twice within the TTL
        let first = federation
            .key_for_token(&header, "https://peer.example")
            .await;
        let second = federation
            .key_for_token(&header, "https://peer.example")
            .await;

        // THEN: both succeed and only one fetch went out
        assert!(first.is_ok());
        assert_eq!(first.unwrap(), second.unwrap());
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn fetch_failure_is_negative_cached() {
        let fetcher = Arc::new(ScriptedFetcher::failing());
        let federation = federation(Arc::clone(&fetcher), FederationConfig::default());
        let header = TokenHeader::local("k");

        // First miss fetches and fails; second miss inside the negative
        // window does not fetch again
        for _ in 0..3 {
            let result = federation
                .key_for_token(&header, "https://dead.example")
                .await;
            assert!(matches!(result, Err(Error::UnknownKey)));
        }
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn parse_failure_is_not_negative_cached() {
        // GIVEN: a reachable issuer serving a malformed JWKS document
        let fetcher = Arc::new(ScriptedFetcher::parse_failing());
        let federation = federation(Arc::clone(&fetcher), FederationConfig::default());
        let header = TokenHeader::local("k");

        // WHEN: the same key is requested three times
        for _ in 0..3 {
            let result = federation
                .key_for_token(&header, "https://mangled.example")
                .await;
            assert!(matches!(result, Err(Error::UnknownKey)));
        }

        // THEN: every request retried the fetch
        assert_eq!(fetcher.calls(), 3);
    }

    #[tokio::test]
    async fn negative_cache_expires_and_allows_retry() {
        let fetcher = Arc::new(ScriptedFetcher::failing());
        let config = FederationConfig {
            negative_cache_secs: 0,
            ..FederationConfig::default()
        };
        let federation = federation(Arc::clone(&fetcher), config);
        let header = TokenHeader::local("k");

        let _ = federation
            .key_for_token(&header, "https://dead.example")
            .await;
        let _ = federation
            .key_for_token(&header, "https://dead.example")
            .await;

        // Zero-length negative window: both misses fetch
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_misses_coalesce_into_one_fetch() {
        // GIVEN: a slow fetcher and eight concurrent requests for the same
        // unknown (issuer, kid)
        let fetcher = Arc::new(ScriptedFetcher {
            document: Some(JwksDocument {
                keys: vec![foreign_jwk("peer-k1", 33)],
            }),
            parse_error: false,
            calls: AtomicUsize::new(0),
            delay: Duration::from_millis(50),
        });
        let federation = Arc::new(federation(Arc::clone(&fetcher), FederationConfig::default()));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let federation = Arc::clone(&federation);
            handles.push(tokio::spawn(async move {
                federation
                    .key_for_token(&TokenHeader::local("peer-k1"), "https://peer.example")
                    .await
            }));
        }

        // THEN: every caller gets the key, from exactly one outbound fetch
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn successful_fetch_without_the_kid_is_unknown() {
        let fetcher = Arc::new(ScriptedFetcher::ok(vec![foreign_jwk("other-kid", 5)]));
        let federation = federation(Arc::clone(&fetcher), FederationConfig::default());

        let result = federation
            .key_for_token(&TokenHeader::local("wanted-kid"), "https://peer.example")
            .await;

        assert!(matches!(result, Err(Error::UnknownKey)));
        // The document's keys are still cached for later tokens
        assert_eq!(federation.cached_key_count(), 1);
    }

    #[tokio::test]
    async fn capacity_bound_evicts_oldest_entries() {
        let config = FederationConfig {
            cache_capacity: 2,
            ..FederationConfig::default()
        };
        let fetcher = Arc::new(ScriptedFetcher::ok(vec![
            foreign_jwk("k1", 1),
            foreign_jwk("k2", 2),
            foreign_jwk("k3", 3),
        ]));
        let federation = federation(fetcher, config);

        let _ = federation
            .key_for_token(&TokenHeader::local("k1"), "https://peer.example")
            .await;

        assert!(federation.cached_key_count() <= 2);
    }

    #[tokio::test]
    async fn invalidate_drops_an_issuers_keys() {
        let fetcher = Arc::new(ScriptedFetcher::ok(vec![foreign_jwk("k1", 9)]));
        let federation = federation(Arc::clone(&fetcher), FederationConfig::default());
        let header = TokenHeader::local("k1");

        let _ = federation
            .key_for_token(&header, "https://peer.example")
            .await;
        assert_eq!(federation.cached_key_count(), 1);

        federation.invalidate("https://peer.example");
        assert_eq!(federation.cached_key_count(), 0);

        // Next request fetches again
        let _ = federation
            .key_for_token(&header, "https://peer.example")
            .await;
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn merged_set_unions_local_and_fresh_foreign_keys() {
        let local = Arc::new(KeyStore::generate());
        let fetcher = Arc::new(ScriptedFetcher::ok(vec![foreign_jwk("peer-k1", 17)]));
        let federation = KeyFederation::with_fetcher(
            Arc::clone(&local),
            resolver(),
            FederationConfig::default(),
            fetcher,
            Telemetry::disabled(),
        );

        let _ = federation
            .key_for_token(&TokenHeader::local("peer-k1"), "https://peer.example")
            .await;

        let merged = federation.merged_key_set();
        assert_eq!(merged.len(), 2);
        assert!(merged.iter().any(|k| k.kid.as_deref() == Some(local.kid())));
        assert!(merged.iter().any(|k| k.kid.as_deref() == Some("peer-k1")));
        // Nothing in the merged set carries private material
        assert!(merged.iter().all(|k| k.d.is_none()));
    }

    #[tokio::test]
    async fn embedded_key_bypasses_the_cache_entirely() {
        let fetcher = Arc::new(ScriptedFetcher::failing());
        let federation = federation(Arc::clone(&fetcher), FederationConfig::default());

        let signing = SigningKey::from_bytes(&[42u8; 32]);
        let jwk = Jwk::public_ed25519(
            URL_SAFE_NO_PAD.encode(signing.verifying_key().as_bytes()),
            None,
        );
        let header = TokenHeader::embedded(jwk);

        let key = federation
            .key_for_token(&header, "https://peer.example")
            .await
            .unwrap();
        assert_eq!(key, signing.verifying_key());
        assert_eq!(fetcher.calls(), 0);
    }
}
