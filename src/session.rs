//! Session and grant registry.
//!
//! The [`SessionStore`] trait abstracts over storage backends; any key/value
//! store with atomic put/delete serves. The in-memory implementation is
//! backed by two `DashMap` indices with lazy eviction on read and a
//! background reaper for bulk expiry.
//!
//! Reads may be stale by up to one write — a refresh or delete racing with
//! a concurrent read is a no-op on the stale view, which the exchange
//! tolerates by construction.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::debug;

use crate::token::unix_now;
use crate::Result;

/// A live player (or server) session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    /// Player id this session belongs to
    pub player_id: String,
    /// `jti` of the session token that currently backs this session
    pub token_id: String,
    /// Issuer the session tokens were bound to
    pub issuer: String,
    /// Unix seconds at creation or last refresh
    pub created_at: i64,
    /// Server audience, for sessions registered at token exchange
    pub audience: Option<String>,
    /// Unix seconds after which the session is dead
    pub expires_at: i64,
}

impl SessionRecord {
    /// Whether this record has passed its expiry.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        unix_now() >= self.expires_at
    }
}

/// An authorization grant awaiting redemption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrantRecord {
    /// Player id the grant names
    pub player_id: String,
    /// `jti` of the grant token
    pub token_id: String,
    /// Server audience the grant is bound to
    pub audience: String,
    /// Unix seconds at issuance
    pub issued_at: i64,
    /// Unix seconds after which the grant is dead
    pub expires_at: i64,
}

impl GrantRecord {
    /// Whether this record has passed its expiry.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        unix_now() >= self.expires_at
    }
}

/// Storage backend for session and grant records.
///
/// Implementations must be `Send + Sync`; the registry is shared across
/// request tasks.
#[async_trait::async_trait]
pub trait SessionStore: Send + Sync + 'static {
    /// Register or replace the session for a player.
    async fn put_session(&self, record: SessionRecord) -> Result<()>;

    /// Look up a player's session. Returns `None` for missing or expired
    /// records.
    async fn get_session(&self, player_id: &str) -> Option<SessionRecord>;

    /// Remove a player's session. Returns whether anything was removed;
    /// callers treat removal of a missing session as success.
    async fn delete_session(&self, player_id: &str) -> bool;

    /// Register a grant.
    async fn put_grant(&self, record: GrantRecord) -> Result<()>;

    /// Look up a grant by its token id.
    async fn get_grant(&self, token_id: &str) -> Option<GrantRecord>;

    /// Remove all expired records. Called periodically by the reaper.
    async fn reap_expired(&self) -> usize;
}

/// In-memory registry backed by two `DashMap` indices:
///
/// - `sessions`: player id → `SessionRecord`
/// - `grants`:   grant jti → `GrantRecord`
#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: DashMap<String, SessionRecord>,
    grants: DashMap<String, GrantRecord>,
}

impl InMemorySessionStore {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl SessionStore for InMemorySessionStore {
    async fn put_session(&self, record: SessionRecord) -> Result<()> {
        self.sessions.insert(record.player_id.clone(), record);
        Ok(())
    }

    async fn get_session(&self, player_id: &str) -> Option<SessionRecord> {
        let entry = self.sessions.get(player_id)?;
        let record = entry.clone();
        drop(entry);

        if record.is_expired() {
            // Lazy eviction on access
            self.sessions.remove(player_id);
            debug!(player = %player_id, "Lazy-evicted expired session");
            return None;
        }

        Some(record)
    }

    async fn delete_session(&self, player_id: &str) -> bool {
        self.sessions.remove(player_id).is_some()
    }

    async fn put_grant(&self, record: GrantRecord) -> Result<()> {
        self.grants.insert(record.token_id.clone(), record);
        Ok(())
    }

    async fn get_grant(&self, token_id: &str) -> Option<GrantRecord> {
        let entry = self.grants.get(token_id)?;
        let record = entry.clone();
        drop(entry);

        if record.is_expired() {
            self.grants.remove(token_id);
            debug!(jti = %token_id, "Lazy-evicted expired grant");
            return None;
        }

        Some(record)
    }

    async fn reap_expired(&self) -> usize {
        let dead_sessions: Vec<String> = self
            .sessions
            .iter()
            .filter(|e| e.value().is_expired())
            .map(|e| e.key().clone())
            .collect();
        let dead_grants: Vec<String> = self
            .grants
            .iter()
            .filter(|e| e.value().is_expired())
            .map(|e| e.key().clone())
            .collect();

        let count = dead_sessions.len() + dead_grants.len();
        for key in dead_sessions {
            self.sessions.remove(&key);
        }
        for key in dead_grants {
            self.grants.remove(&key);
        }
        count
    }
}

/// Spawn a background task that reaps expired records every `interval`.
///
/// The task exits when the `shutdown` receiver fires.
pub fn spawn_reaper(
    store: Arc<dyn SessionStore>,
    interval: Duration,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let reaped = store.reap_expired().await;
                    if reaped > 0 {
                        debug!(count = reaped, "Reaped expired session records");
                    }
                }
                _ = shutdown.recv() => {
                    debug!("Session reaper shutting down");
                    break;
                }
            }
        }
    });
}
