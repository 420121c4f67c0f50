//! Exchange state machine — session, grant, and access token lifecycle.
//!
//! Drives the identity-token → authorization-grant → access-token
//! handshake per player session:
//!
//! ```text
//! none → identified → granted (per audience) → authorized (per audience)
//! ```
//!
//! Two reads here are deliberately unverified: refresh and grant redemption
//! take the presented token's claims at face value. Refresh is an
//! availability primitive — a broken refresh must not lock a client out —
//! and a grant reaches the exchange endpoint over the transport that is
//! itself the authentication boundary. Authorize, by contrast, verifies
//! the identity token's signature (through JWKS federation for foreign
//! issuers) before minting a grant.
//!
//! Either a complete token is returned or an error kind is returned and no
//! side effects persist.

use std::sync::Arc;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::federation::KeyFederation;
use crate::issuer::{IssuerClass, IssuerResolver};
use crate::keystore::KeyStore;
use crate::selfsigned::{self, BypassPolicy};
use crate::session::{GrantRecord, SessionRecord, SessionStore};
use crate::telemetry::{Event, Telemetry};
use crate::token::{
    self, decode_unverified, encode, Audience, ClaimSet, Confirmation, Scopes, TokenHeader,
    DEFAULT_SCOPE, SERVER_SCOPE,
};
use crate::{Error, Result};

/// Display name used when the caller supplies none.
const DEFAULT_USERNAME: &str = "Player";

/// A freshly issued identity/session token pair.
#[derive(Debug, Clone)]
pub struct TokenPair {
    /// The client's proof of identity
    pub identity_token: String,
    /// Token used to refresh or delete the session
    pub session_token: String,
    /// Unix seconds when both tokens expire
    pub expires_at: i64,
}

/// A freshly issued authorization grant.
#[derive(Debug, Clone)]
pub struct IssuedGrant {
    /// The grant token, redeemable at the token exchange
    pub authorization_grant: String,
    /// Unix seconds when the grant expires
    pub expires_at: i64,
}

/// The result of redeeming a grant.
#[derive(Debug, Clone)]
pub struct IssuedAccess {
    /// Audience-bound access token
    pub access_token: String,
    /// Fresh session token for later refresh
    pub refresh_token: String,
    /// Seconds until the access token expires
    pub expires_in: i64,
    /// Unix seconds when the access token expires
    pub expires_at: i64,
    /// Canonical scope string embedded in the access token
    pub scope: String,
}

/// The exchange state machine and its collaborators.
pub struct Exchange {
    keys: Arc<KeyStore>,
    resolver: IssuerResolver,
    federation: Arc<KeyFederation>,
    store: Arc<dyn SessionStore>,
    policy: BypassPolicy,
    session_ttl_secs: i64,
    telemetry: Telemetry,
}

impl Exchange {
    /// Wire up the state machine.
    #[must_use]
    pub fn new(
        keys: Arc<KeyStore>,
        resolver: IssuerResolver,
        federation: Arc<KeyFederation>,
        store: Arc<dyn SessionStore>,
        policy: BypassPolicy,
        session_ttl_secs: i64,
        telemetry: Telemetry,
    ) -> Self {
        Self {
            keys,
            resolver,
            federation,
            store,
            policy,
            session_ttl_secs,
            telemetry,
        }
    }

    /// `none → identified`: issue a fresh identity/session pair.
    ///
    /// A missing player id gets a generated one; a missing username gets
    /// the default. The session record must be visible before this
    /// returns, so a failed register is fatal for the request.
    pub async fn new_session(
        &self,
        host: Option<&str>,
        player_id: Option<String>,
        username: Option<String>,
    ) -> Result<TokenPair> {
        let issuer = self.resolver.resolve_for_request(host);
        let sub = player_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let username = username.unwrap_or_else(|| DEFAULT_USERNAME.to_string());

        self.issue_pair(&issuer, &sub, &username, DEFAULT_SCOPE, true)
            .await
    }

    /// `identified → identified`: re-issue a pair from a presented session
    /// or identity token.
    ///
    /// The subject and display name are read from the presented token's
    /// claims without signature verification. An unparseable token falls
    /// back to `fallback_subject` so a broken refresh never locks a client
    /// out.
    pub async fn refresh_session(
        &self,
        host: Option<&str>,
        presented: Option<&str>,
        fallback_subject: &str,
    ) -> Result<TokenPair> {
        let issuer = self.resolver.resolve_for_request(host);

        let (sub, username, scope) = match presented.and_then(|t| decode_unverified(t).ok()) {
            Some(decoded) => (
                decoded.claims.sub,
                decoded.claims.username,
                decoded.claims.scope,
            ),
            None => {
                debug!("Refresh with unparseable token; using contextual subject");
                (fallback_subject.to_string(), None, None)
            }
        };
        let username = username.unwrap_or_else(|| DEFAULT_USERNAME.to_string());
        let scope = scope.unwrap_or_else(|| DEFAULT_SCOPE.to_string());

        self.issue_pair(&issuer, &sub, &username, &scope, false).await
    }

    /// Scope-narrowed child session for the bearer's subject, same TTL.
    pub async fn child_session(
        &self,
        host: Option<&str>,
        bearer: Option<&str>,
        fallback_subject: &str,
        scopes: Option<Scopes>,
    ) -> Result<TokenPair> {
        let issuer = self.resolver.resolve_for_request(host);
        let scope = Scopes::normalize(scopes);

        let (sub, username) = match bearer.and_then(|t| decode_unverified(t).ok()) {
            Some(decoded) => (decoded.claims.sub, decoded.claims.username),
            None => (fallback_subject.to_string(), None),
        };
        let username = username.unwrap_or_else(|| DEFAULT_USERNAME.to_string());

        self.issue_pair(&issuer, &sub, &username, &scope, false).await
    }

    /// `identified → granted(audience)`: mint an authorization grant.
    ///
    /// The identity token may arrive in the body or as the bearer. Foreign
    /// and local issuers are signature-verified; official issuers are
    /// delegated to the vendor trust path. A self-signed identity under the
    /// bypass policy is answered with a replacement grant signed by its own
    /// embedded key.
    pub async fn authorize(
        &self,
        host: Option<&str>,
        identity_token: Option<&str>,
        bearer: Option<&str>,
        audience: Option<String>,
        scopes: Option<Scopes>,
        fallback_subject: &str,
    ) -> Result<IssuedGrant> {
        let issuer = self.resolver.resolve_for_request(host);
        let scope = Scopes::normalize(scopes);

        let decoded = match identity_token.or(bearer) {
            Some(presented) => Some(decode_unverified(presented)?),
            None => None,
        };

        if let Some(decoded) = &decoded {
            if self.policy.should_bypass(&decoded.header) {
                return self
                    .bypass_grant(decoded, &issuer, audience, &scope)
                    .await;
            }

            // The token is the authoritative identity carrier, so its
            // signature must hold. Official issuers are verified elsewhere.
            if self.resolver.classify(&decoded.claims.iss) != IssuerClass::Official {
                let key = match self
                    .federation
                    .key_for_token(&decoded.header, &decoded.claims.iss)
                    .await
                {
                    Ok(key) => key,
                    Err(e) => {
                        self.telemetry.record(Event::TokenRejected);
                        return Err(e);
                    }
                };
                token::verify(decoded.signing_input.as_bytes(), &decoded.signature, &key)
                    .inspect_err(|_| self.telemetry.record(Event::TokenRejected))?;
            }
        }

        // Token subject wins over whatever the request context believes
        let sub = decoded
            .as_ref()
            .map_or_else(|| fallback_subject.to_string(), |d| d.claims.sub.clone());
        let audience = capture_audience(audience, decoded.as_ref().map(|d| &d.claims))
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut claims = self.base_claims(&sub, &issuer, &scope);
        claims.aud = Some(Audience::Single(audience.clone()));
        if let Some(d) = &decoded {
            claims.username = d.claims.username.clone();
        }
        let grant_token = self.issue_local(&claims)?;

        self.register_grant(&claims, &audience).await;
        self.telemetry.record(Event::TokenIssued);

        Ok(IssuedGrant {
            authorization_grant: grant_token,
            expires_at: claims.exp,
        })
    }

    /// `granted(audience) → authorized(audience)`: redeem a grant for an
    /// access token, optionally certificate-bound.
    ///
    /// The grant's signature is not re-verified; its subject and audience
    /// are read as presented. The confirmation field carries the caller's
    /// fingerprint verbatim — this service never computes fingerprints.
    pub async fn exchange_grant(
        &self,
        host: Option<&str>,
        grant_token: &str,
        fingerprint: Option<&str>,
        audience_override: Option<String>,
    ) -> Result<IssuedAccess> {
        let issuer = self.resolver.resolve_for_request(host);
        let decoded = decode_unverified(grant_token)?;

        let scope = decoded
            .claims
            .scope
            .clone()
            .unwrap_or_else(|| DEFAULT_SCOPE.to_string());
        let audience = capture_audience(audience_override, Some(&decoded.claims))
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let access_token = if self.policy.should_bypass(&decoded.header) {
            selfsigned::verify_embedded(&decoded)
                .inspect_err(|_| self.telemetry.record(Event::TokenRejected))?;
            self.telemetry.record(Event::SelfSignedBypass);
            selfsigned::mint_replacement(
                &decoded,
                &issuer,
                Some(&audience),
                &scope,
                fingerprint,
                self.session_ttl_secs,
                &self.keys,
            )?
        } else {
            let mut claims = self.base_claims(&decoded.claims.sub, &issuer, &scope);
            claims.aud = Some(Audience::Single(audience.clone()));
            claims.username = decoded.claims.username.clone();
            claims.name = decoded.claims.name.clone();
            claims.cnf = fingerprint.map(|fp| Confirmation {
                x5t_s256: fp.to_string(),
            });
            self.issue_local(&claims)?
        };

        let expires_at = decode_unverified(&access_token)?.claims.exp;

        // Fresh session token so the client can refresh later
        let refresh_claims = self.base_claims(&decoded.claims.sub, &issuer, &scope);
        let refresh_token = self.issue_local(&refresh_claims)?;

        let record = SessionRecord {
            player_id: decoded.claims.sub.clone(),
            token_id: refresh_claims.jti.clone(),
            issuer,
            created_at: refresh_claims.iat,
            audience: Some(audience),
            expires_at: refresh_claims.exp,
        };
        if let Err(e) = self.store.put_session(record).await {
            warn!(error = %e, "Failed to register exchanged session; continuing");
        }
        self.telemetry.record(Event::TokenIssued);

        Ok(IssuedAccess {
            access_token,
            refresh_token,
            expires_in: self.session_ttl_secs,
            expires_at,
            scope,
        })
    }

    /// `any → none`: remove the bearer's session. Always succeeds — a
    /// delete of a missing or unidentifiable session is a no-op.
    pub async fn delete_session(&self, bearer: Option<&str>) {
        if let Some(decoded) = bearer.and_then(|t| decode_unverified(t).ok()) {
            let removed = self.store.delete_session(&decoded.claims.sub).await;
            debug!(player = %decoded.claims.sub, removed, "Session delete");
        }
        self.telemetry.record(Event::SessionDeleted);
    }

    /// Legacy catch-all behavior: a grant and an access token bound to the
    /// same freshly generated audience.
    pub async fn legacy_catch_all(
        &self,
        host: Option<&str>,
        fallback_subject: &str,
    ) -> Result<(IssuedGrant, IssuedAccess)> {
        let audience = Uuid::new_v4().to_string();
        let grant = self
            .authorize(
                host,
                None,
                None,
                Some(audience.clone()),
                None,
                fallback_subject,
            )
            .await?;
        let access = self
            .exchange_grant(host, &grant.authorization_grant, None, Some(audience))
            .await?;
        Ok((grant, access))
    }

    // ── Internals ─────────────────────────────────────────────────────────

    async fn issue_pair(
        &self,
        issuer: &str,
        sub: &str,
        username: &str,
        scope: &str,
        register_is_critical: bool,
    ) -> Result<TokenPair> {
        let mut identity = self.base_claims(sub, issuer, scope);
        identity.name = Some(username.to_string());
        identity.username = Some(username.to_string());
        let identity_token = self.issue_local(&identity)?;

        let session = self.base_claims(sub, issuer, scope);
        let session_token = self.issue_local(&session)?;

        let record = SessionRecord {
            player_id: sub.to_string(),
            token_id: session.jti.clone(),
            issuer: issuer.to_string(),
            created_at: session.iat,
            audience: None,
            expires_at: session.exp,
        };
        match self.store.put_session(record).await {
            Ok(()) => {}
            Err(e) if register_is_critical => {
                return Err(Error::PersistenceFatal(e.to_string()));
            }
            Err(e) => {
                warn!(error = %e, "Failed to register refreshed session; continuing");
            }
        }

        self.telemetry.record(Event::TokenIssued);
        self.telemetry.record(Event::TokenIssued);

        Ok(TokenPair {
            identity_token,
            session_token,
            expires_at: session.exp,
        })
    }

    async fn bypass_grant(
        &self,
        decoded: &token::DecodedToken,
        issuer: &str,
        audience: Option<String>,
        scope: &str,
    ) -> Result<IssuedGrant> {
        selfsigned::verify_embedded(decoded)
            .inspect_err(|_| self.telemetry.record(Event::TokenRejected))?;

        let audience = capture_audience(audience, Some(&decoded.claims))
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let grant = selfsigned::mint_replacement(
            decoded,
            issuer,
            Some(&audience),
            scope,
            None,
            self.session_ttl_secs,
            &self.keys,
        )?;

        let minted = decode_unverified(&grant)?;
        self.register_grant(&minted.claims, &audience).await;
        self.telemetry.record(Event::SelfSignedBypass);

        Ok(IssuedGrant {
            authorization_grant: grant,
            expires_at: minted.claims.exp,
        })
    }

    async fn register_grant(&self, claims: &ClaimSet, audience: &str) {
        let record = GrantRecord {
            player_id: claims.sub.clone(),
            token_id: claims.jti.clone(),
            audience: audience.to_string(),
            issued_at: claims.iat,
            expires_at: claims.exp,
        };
        if let Err(e) = self.store.put_grant(record).await {
            warn!(error = %e, "Failed to register grant; continuing");
        }
    }

    fn base_claims(&self, sub: &str, issuer: &str, scope: &str) -> ClaimSet {
        let now = token::unix_now();
        ClaimSet {
            sub: sub.to_string(),
            iat: now,
            exp: now + self.session_ttl_secs,
            iss: issuer.to_string(),
            jti: Uuid::new_v4().to_string(),
            name: None,
            username: None,
            scope: Some(scope.to_string()),
            aud: None,
            entitlements: None,
            cnf: None,
        }
    }

    fn issue_local(&self, claims: &ClaimSet) -> Result<String> {
        let header = TokenHeader::local(self.keys.kid());
        encode(&header, claims, |input| self.keys.sign(input))
    }
}

/// Audience capture order: the caller's explicit audience, then the
/// presented token's `aud`, then its `sub` when the token is a
/// server-session token.
fn capture_audience(explicit: Option<String>, claims: Option<&ClaimSet>) -> Option<String> {
    explicit
        .or_else(|| claims.and_then(|c| c.audience().map(str::to_string)))
        .or_else(|| {
            claims.and_then(|c| {
                (c.scope.as_deref() == Some(SERVER_SCOPE)).then(|| c.sub.clone())
            })
        })
}
