//! End-to-end token lifecycle tests
//!
//! Exercises the full session → grant → access-token handshake through the
//! library API: fresh sessions, refresh resilience, certificate binding,
//! self-signed bypass, and idempotent deletion.

use std::sync::Arc;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use ed25519_dalek::{Signer, SigningKey};

use session_gateway::config::{FederationConfig, IssuerConfig};
use session_gateway::exchange::Exchange;
use session_gateway::federation::{FetchError, JwksDocument, JwksFetcher, KeyFederation};
use session_gateway::issuer::IssuerResolver;
use session_gateway::keystore::KeyStore;
use session_gateway::selfsigned::{self, BypassPolicy};
use session_gateway::session::{InMemorySessionStore, SessionStore};
use session_gateway::telemetry::Telemetry;
use session_gateway::token::{
    self, decode_unverified, encode, ClaimSet, Jwk, TokenHeader, DEFAULT_SCOPE,
};

struct NoFetcher;

#[async_trait::async_trait]
impl JwksFetcher for NoFetcher {
    async fn fetch(&self, _url: &str) -> Result<JwksDocument, FetchError> {
        Err(FetchError::Transport("no network in tests".into()))
    }
}

fn resolver() -> IssuerResolver {
    IssuerResolver::new(&IssuerConfig {
        base_domain: "play.example".to_string(),
        local_hosts: Vec::new(),
        official_hosts: vec!["sessions.hytale.com".to_string()],
        accept_self_signed: true,
    })
}

fn harness() -> (Exchange, Arc<KeyStore>, Arc<InMemorySessionStore>) {
    let keys = Arc::new(KeyStore::generate());
    let store = Arc::new(InMemorySessionStore::new());
    let federation = Arc::new(KeyFederation::with_fetcher(
        Arc::clone(&keys),
        resolver(),
        FederationConfig::default(),
        Arc::new(NoFetcher),
        Telemetry::disabled(),
    ));
    let exchange = Exchange::new(
        Arc::clone(&keys),
        resolver(),
        federation,
        Arc::clone(&store) as Arc<dyn SessionStore>,
        BypassPolicy::new(true),
        36_000,
        Telemetry::disabled(),
    );
    (exchange, keys, store)
}

fn self_signed_identity(seed: u8, sub: &str) -> String {
    let signing = SigningKey::from_bytes(&[seed; 32]);
    let mut jwk = Jwk::public_ed25519(
        URL_SAFE_NO_PAD.encode(signing.verifying_key().as_bytes()),
        None,
    );
    jwk.d = Some(URL_SAFE_NO_PAD.encode(signing.to_bytes()));

    let now = token::unix_now();
    let claims = ClaimSet {
        sub: sub.to_string(),
        iat: now,
        exp: now + 36_000,
        iss: "https://client.example".to_string(),
        jti: "self-signed-1".to_string(),
        name: None,
        username: Some("Offline".to_string()),
        scope: Some(DEFAULT_SCOPE.to_string()),
        aud: None,
        entitlements: None,
        cnf: None,
    };
    encode(&TokenHeader::embedded(jwk), &claims, |input| {
        signing.sign(input)
    })
    .unwrap()
}

/// Scenario: a fresh session carries the documented claims and verifies
/// under the local public key.
#[tokio::test]
async fn fresh_session_issues_a_verifiable_identity() {
    let (exchange, keys, _) = harness();

    let pair = exchange
        .new_session(
            Some("play.example"),
            Some("u1".into()),
            Some("Alice".into()),
        )
        .await
        .unwrap();

    let identity = decode_unverified(&pair.identity_token).unwrap();
    assert_eq!(identity.claims.sub, "u1");
    assert_eq!(identity.claims.username.as_deref(), Some("Alice"));
    assert_eq!(identity.claims.scope.as_deref(), Some(DEFAULT_SCOPE));
    assert_eq!(identity.claims.iss, "https://play.example");
    assert_eq!(identity.claims.exp - identity.claims.iat, 36_000);
    assert_eq!(identity.header.kid.as_deref(), Some(keys.kid()));

    token::verify(
        identity.signing_input.as_bytes(),
        &identity.signature,
        &keys.verifying_key(),
    )
    .unwrap();

    // The session token verifies the same way
    let session = decode_unverified(&pair.session_token).unwrap();
    token::verify(
        session.signing_input.as_bytes(),
        &session.signature,
        &keys.verifying_key(),
    )
    .unwrap();
}

/// Scenario: authorize then exchange with a fingerprint produces an
/// audience-bound, certificate-bound access token.
#[tokio::test]
async fn authorize_and_exchange_produce_a_bound_access_token() {
    let (exchange, keys, _) = harness();

    let pair = exchange
        .new_session(None, Some("u1".into()), Some("Alice".into()))
        .await
        .unwrap();

    let grant = exchange
        .authorize(
            None,
            Some(&pair.identity_token),
            None,
            Some("s-42".into()),
            None,
            "ignored",
        )
        .await
        .unwrap();

    let grant_claims = decode_unverified(&grant.authorization_grant).unwrap().claims;
    assert_eq!(grant_claims.sub, "u1");
    assert_eq!(grant_claims.audience(), Some("s-42"));

    let access = exchange
        .exchange_grant(None, &grant.authorization_grant, Some("FP"), None)
        .await
        .unwrap();

    let decoded = decode_unverified(&access.access_token).unwrap();
    assert_eq!(decoded.claims.sub, "u1");
    assert_eq!(decoded.claims.audience(), Some("s-42"));
    assert_eq!(decoded.claims.cnf.as_ref().unwrap().x5t_s256, "FP");
    token::verify(
        decoded.signing_input.as_bytes(),
        &decoded.signature,
        &keys.verifying_key(),
    )
    .unwrap();

    // The refresh token is itself usable at the refresh endpoint
    let refreshed = exchange
        .refresh_session(None, Some(&access.refresh_token), "x")
        .await
        .unwrap();
    let refreshed_identity = decode_unverified(&refreshed.identity_token).unwrap();
    assert_eq!(refreshed_identity.claims.sub, "u1");
}

/// Scenario: refresh with an unparseable session token still emits a valid
/// pair bound to the contextual subject.
#[tokio::test]
async fn refresh_with_garbage_token_never_locks_the_client_out() {
    let (exchange, keys, _) = harness();

    let pair = exchange
        .refresh_session(None, Some("garbage"), "ctx-subject")
        .await
        .unwrap();

    let identity = decode_unverified(&pair.identity_token).unwrap();
    assert_eq!(identity.claims.sub, "ctx-subject");
    token::verify(
        identity.signing_input.as_bytes(),
        &identity.signature,
        &keys.verifying_key(),
    )
    .unwrap();
}

/// Scenario: a self-signed grant at the token exchange is answered with an
/// access token verifiable under the embedded public key.
#[tokio::test]
async fn self_signed_bypass_mints_under_the_embedded_key() {
    let (exchange, keys, _) = harness();
    let token = self_signed_identity(91, "u2");
    let embedded_aud = decode_unverified(&token).unwrap().claims.audience().map(str::to_string);

    let access = exchange
        .exchange_grant(None, &token, Some("FP2"), Some("s-7".into()))
        .await
        .unwrap();

    let decoded = decode_unverified(&access.access_token).unwrap();

    // Verifies under the embedded key, not the local key store
    selfsigned::verify_embedded(&decoded).unwrap();
    assert!(token::verify(
        decoded.signing_input.as_bytes(),
        &decoded.signature,
        &keys.verifying_key(),
    )
    .is_err());

    assert_eq!(decoded.claims.sub, "u2");
    assert_eq!(decoded.claims.audience(), Some("s-7"));
    assert_eq!(decoded.claims.cnf.as_ref().unwrap().x5t_s256, "FP2");
    assert!(embedded_aud.is_none());
}

/// Scenario: session deletion is idempotent, with or without a session.
#[tokio::test]
async fn delete_session_twice_is_the_same_as_once() {
    let (exchange, _, store) = harness();
    let pair = exchange
        .new_session(None, Some("u1".into()), None)
        .await
        .unwrap();
    assert!(store.get_session("u1").await.is_some());

    exchange.delete_session(Some(&pair.session_token)).await;
    assert!(store.get_session("u1").await.is_none());

    exchange.delete_session(Some(&pair.session_token)).await;
    exchange.delete_session(None).await;
    assert!(store.get_session("u1").await.is_none());
}

/// Invariant: every emitted token's issuer matches the resolver's output
/// for the request host.
#[tokio::test]
async fn issuer_follows_the_request_host() {
    let (exchange, _, _) = harness();

    let sub = Some("u1".to_string());
    let on_subdomain = exchange
        .new_session(Some("eu.play.example:8443"), sub.clone(), None)
        .await
        .unwrap();
    assert_eq!(
        decode_unverified(&on_subdomain.identity_token)
            .unwrap()
            .claims
            .iss,
        "https://eu.play.example"
    );

    let off_domain = exchange
        .new_session(Some("unrelated.example"), sub, None)
        .await
        .unwrap();
    assert_eq!(
        decode_unverified(&off_domain.identity_token)
            .unwrap()
            .claims
            .iss,
        "https://play.example"
    );
}
