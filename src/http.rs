//! HTTP shell: router, handlers, and the JSON error envelope.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/.well-known/jwks.json` | Verification key discovery |
//! | `POST` | `/game-session/new` | Issue a fresh identity/session pair |
//! | `POST` | `/game-session/refresh` | Re-issue a pair from a presented token |
//! | `POST` | `/game-session/child` | Scope-narrowed child session |
//! | `POST` | `/game-session/authorize` | Mint an authorization grant |
//! | `POST` | `/server-join/auth-token` | Redeem a grant for an access token |
//! | `DELETE` | `/game-session` | Remove the bearer's session (idempotent) |
//! | `GET`  | `/my-account/game-profile` | Profile derived from the bearer |
//! | `GET`  | `/health` | Liveness |
//!
//! Errors are rendered as `{error, message}` with the status mapped by
//! [`Error::status_code`]; internal detail never leaks. Requests whose
//! bearer was issued under a different host of the same base domain are
//! answered with a `307` to the issuer's host.

use std::sync::Arc;

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, HeaderMap, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::json;
use tower_http::{catch_panic::CatchPanicLayer, compression::CompressionLayer, trace::TraceLayer};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::exchange::{Exchange, IssuedAccess, TokenPair};
use crate::federation::KeyFederation;
use crate::issuer::{issuer_host, IssuerClass, IssuerResolver};
use crate::keystore::KeyStore;
use crate::token::{self, decode_unverified, Scopes};
use crate::Error;

/// Shared application state
pub struct AppState {
    /// Service configuration
    pub config: Config,
    /// Process signing key
    pub keys: Arc<KeyStore>,
    /// Issuer binding and classification
    pub resolver: IssuerResolver,
    /// Foreign-key discovery
    pub federation: Arc<KeyFederation>,
    /// Exchange state machine
    pub exchange: Arc<Exchange>,
}

/// Create the router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/.well-known/jwks.json", get(jwks_handler))
        .route("/game-session/new", post(new_session_handler))
        .route("/game-session/refresh", post(refresh_handler))
        .route("/game-session/child", post(child_handler))
        .route("/game-session/authorize", post(authorize_handler))
        .route("/game-session", delete(delete_session_handler))
        .route("/server-join/auth-token", post(auth_token_handler))
        .route("/my-account/game-profile", get(game_profile_handler))
        .fallback(fallback_handler)
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            issuer_redirect_middleware,
        ))
        .layer(CatchPanicLayer::new())
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ── Request / Response types ───────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
struct NewSessionRequest {
    uuid: Option<String>,
    username: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest {
    session_token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChildRequest {
    scopes: Option<Scopes>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthorizeRequest {
    identity_token: Option<String>,
    audience: Option<String>,
    scopes: Option<Scopes>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthTokenRequest {
    authorization_grant: Option<String>,
    x509_fingerprint: Option<String>,
    audience: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionResponse {
    identity_token: String,
    session_token: String,
    expires_at: i64,
}

impl From<TokenPair> for SessionResponse {
    fn from(pair: TokenPair) -> Self {
        Self {
            identity_token: pair.identity_token,
            session_token: pair.session_token,
            expires_at: pair.expires_at,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AuthTokenResponse {
    access_token: String,
    token_type: &'static str,
    expires_in: i64,
    refresh_token: String,
    expires_at: i64,
    scope: String,
}

impl From<IssuedAccess> for AuthTokenResponse {
    fn from(access: IssuedAccess) -> Self {
        Self {
            access_token: access.access_token,
            token_type: "Bearer",
            expires_in: access.expires_in,
            refresh_token: access.refresh_token,
            expires_at: access.expires_at,
            scope: access.scope,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProfileResponse {
    uuid: String,
    username: String,
    entitlements: Vec<String>,
    created_at: String,
    next_name_change_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    skin: Option<serde_json::Value>,
}

// ── Middleware ─────────────────────────────────────────────────────────────

/// Redirect a request whose bearer was issued under a sibling host.
///
/// Fires only when the bearer parses, its issuer host lies inside the base
/// domain, and that host differs from the request `Host` — so callers are
/// never redirected toward foreign hosts.
async fn issuer_redirect_middleware(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let redirect = bearer_token(request.headers())
        .and_then(|t| decode_unverified(t).ok())
        .and_then(|decoded| {
            let iss = decoded.claims.iss;
            let resolved = state.resolver.resolve_for_request(request_host(request.headers()));
            let moved = issuer_host(&resolved) != issuer_host(&iss)
                && state.resolver.within_base_domain(&iss);
            moved.then(|| {
                let path = request
                    .uri()
                    .path_and_query()
                    .map_or("/", |pq| pq.as_str());
                format!("https://{}{path}", issuer_host(&iss))
            })
        });

    match redirect {
        Some(location) => {
            debug!(location = %location, "Bearer issued under a sibling host; redirecting");
            (
                StatusCode::TEMPORARY_REDIRECT,
                [(header::LOCATION, location)],
            )
                .into_response()
        }
        None => next.run(request).await,
    }
}

// ── Handlers ───────────────────────────────────────────────────────────────

/// `GET /health` — liveness.
async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// `GET /.well-known/jwks.json` — verification key discovery.
async fn jwks_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let keys = if state.config.federation.publish_merged {
        state.federation.merged_key_set()
    } else {
        vec![state.keys.public_jwk()]
    };
    Json(json!({ "keys": keys }))
}

/// `POST /game-session/new` — issue a fresh identity/session pair.
async fn new_session_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    bytes: Bytes,
) -> Response {
    let body: NewSessionRequest = match parse_body(&bytes) {
        Ok(b) => b,
        Err(r) => return r,
    };
    match state
        .exchange
        .new_session(request_host(&headers), body.uuid, body.username)
        .await
    {
        Ok(pair) => Json(SessionResponse::from(pair)).into_response(),
        Err(e) => error_response(&e),
    }
}

/// `POST /game-session/refresh` — re-issue a pair.
async fn refresh_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    bytes: Bytes,
) -> Response {
    let body: RefreshRequest = match parse_body(&bytes) {
        Ok(b) => b,
        Err(r) => return r,
    };
    let bearer = bearer_token(&headers).map(str::to_string);
    let presented = body.session_token.or(bearer);
    let fallback = contextual_subject(&headers);

    match state
        .exchange
        .refresh_session(request_host(&headers), presented.as_deref(), &fallback)
        .await
    {
        Ok(pair) => Json(SessionResponse::from(pair)).into_response(),
        Err(e) => error_response(&e),
    }
}

/// `POST /game-session/child` — scope-narrowed child session.
async fn child_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    bytes: Bytes,
) -> Response {
    let body: ChildRequest = match parse_body(&bytes) {
        Ok(b) => b,
        Err(r) => return r,
    };
    let fallback = contextual_subject(&headers);

    match state
        .exchange
        .child_session(
            request_host(&headers),
            bearer_token(&headers),
            &fallback,
            body.scopes,
        )
        .await
    {
        Ok(pair) => Json(SessionResponse::from(pair)).into_response(),
        Err(e) => error_response(&e),
    }
}

/// `POST /game-session/authorize` — mint an authorization grant.
async fn authorize_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    bytes: Bytes,
) -> Response {
    let body: AuthorizeRequest = match parse_body(&bytes) {
        Ok(b) => b,
        Err(r) => return r,
    };
    let fallback = contextual_subject(&headers);

    match state
        .exchange
        .authorize(
            request_host(&headers),
            body.identity_token.as_deref(),
            bearer_token(&headers),
            body.audience,
            body.scopes,
            &fallback,
        )
        .await
    {
        Ok(grant) => Json(json!({
            "authorizationGrant": grant.authorization_grant,
            "expiresAt": grant.expires_at,
        }))
        .into_response(),
        Err(e) => error_response(&e),
    }
}

/// `POST /server-join/auth-token` — redeem a grant for an access token.
async fn auth_token_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    bytes: Bytes,
) -> Response {
    let body: AuthTokenRequest = match parse_body(&bytes) {
        Ok(b) => b,
        Err(r) => return r,
    };
    let Some(grant) = body.authorization_grant else {
        return error_response(&Error::MissingClaim("authorizationGrant"));
    };

    match state
        .exchange
        .exchange_grant(
            request_host(&headers),
            &grant,
            body.x509_fingerprint.as_deref(),
            body.audience,
        )
        .await
    {
        Ok(access) => Json(AuthTokenResponse::from(access)).into_response(),
        Err(e) => error_response(&e),
    }
}

/// `DELETE /game-session` — idempotent session removal.
async fn delete_session_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    state.exchange.delete_session(bearer_token(&headers)).await;
    StatusCode::NO_CONTENT.into_response()
}

/// `GET /my-account/game-profile` — profile from the verified bearer.
async fn game_profile_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    let Some(bearer) = bearer_token(&headers) else {
        return error_response(&Error::UnknownKey);
    };
    let decoded = match decode_unverified(bearer) {
        Ok(d) => d,
        Err(e) => return error_response(&e),
    };

    // Official issuers are verified by the vendor path; everything else
    // must verify here before any profile data is derived from the claims.
    if state.resolver.classify(&decoded.claims.iss) != IssuerClass::Official {
        let key = match state
            .federation
            .key_for_token(&decoded.header, &decoded.claims.iss)
            .await
        {
            Ok(key) => key,
            Err(e) => return error_response(&e),
        };
        if let Err(e) =
            token::verify(decoded.signing_input.as_bytes(), &decoded.signature, &key)
        {
            return error_response(&e);
        }
    }

    let claims = decoded.claims;
    let created_at = rfc3339(claims.iat);
    let next_name_change_at = rfc3339(claims.iat + 30 * 24 * 3600);

    Json(ProfileResponse {
        uuid: claims.sub,
        username: claims.username.unwrap_or_else(|| "Player".to_string()),
        entitlements: claims.entitlements.unwrap_or_default(),
        created_at,
        next_name_change_at,
        skin: None,
    })
    .into_response()
}

/// Catch-all: 404 unless the legacy token-emitting compatibility mode is on.
async fn fallback_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if !state.config.compat.catch_all_tokens {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "not_found", "message": "Unknown path"})),
        )
            .into_response();
    }

    warn!("Catch-all token emission is enabled; issuing tokens for an unknown path");
    let fallback = contextual_subject(&headers);
    match state
        .exchange
        .legacy_catch_all(request_host(&headers), &fallback)
        .await
    {
        Ok((grant, access)) => Json(json!({
            "authorizationGrant": grant.authorization_grant,
            "accessToken": access.access_token,
            "tokenType": "Bearer",
            "expiresIn": access.expires_in,
            "expiresAt": access.expires_at,
            "scope": access.scope,
        }))
        .into_response(),
        Err(e) => error_response(&e),
    }
}

// ── Helpers ────────────────────────────────────────────────────────────────

/// Parse a request body leniently: an empty body yields the default shape,
/// present-but-invalid JSON yields a 400 envelope.
fn parse_body<T: DeserializeOwned + Default>(bytes: &Bytes) -> std::result::Result<T, Response> {
    if bytes.is_empty() {
        return Ok(T::default());
    }
    serde_json::from_slice(bytes).map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "invalid_request", "message": e.to_string()})),
        )
            .into_response()
    })
}

/// Extract the bearer token from the `Authorization` header.
fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            v.strip_prefix("Bearer ")
                .or_else(|| v.strip_prefix("bearer "))
        })
}

/// The request's `Host` header, verbatim.
fn request_host(headers: &HeaderMap) -> Option<&str> {
    headers.get("host").and_then(|v| v.to_str().ok())
}

/// Subject attached to the request context: the bearer's subject when one
/// parses, a generated id otherwise.
fn contextual_subject(headers: &HeaderMap) -> String {
    bearer_token(headers)
        .and_then(|t| decode_unverified(t).ok())
        .map_or_else(|| Uuid::new_v4().to_string(), |d| d.claims.sub)
}

/// Unix seconds to an RFC 3339 timestamp.
fn rfc3339(secs: i64) -> String {
    chrono::DateTime::from_timestamp(secs, 0)
        .unwrap_or_default()
        .to_rfc3339()
}

/// Render an error as the JSON envelope with its mapped status.
fn error_response(error: &Error) -> Response {
    (
        error.status_code(),
        Json(json!({"error": error.code(), "message": error.to_string()})),
    )
        .into_response()
}
