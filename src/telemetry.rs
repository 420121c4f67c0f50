//! Non-critical event counters behind a bounded channel.
//!
//! Handlers record events with a non-blocking `try_send`; a background
//! flusher aggregates them and emits a periodic tracing summary. When the
//! channel is full the event is dropped — metrics are non-critical and must
//! never add backpressure to a request.

use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};

/// A countable service event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// A token of any kind was issued
    TokenIssued,
    /// A presented token was rejected on a verification path
    TokenRejected,
    /// The self-signed bypass minted a replacement token
    SelfSignedBypass,
    /// A foreign JWKS document was fetched successfully
    JwksFetchOk,
    /// A foreign JWKS fetch failed
    JwksFetchFailed,
    /// A session was deleted
    SessionDeleted,
}

/// Cheap cloneable handle for recording events.
#[derive(Clone)]
pub struct Telemetry {
    tx: Option<mpsc::Sender<Event>>,
}

impl Telemetry {
    /// A handle that drops every event. Used in tests and the CLI paths
    /// that never serve requests.
    #[must_use]
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Record an event. Never blocks; drops on overflow.
    pub fn record(&self, event: Event) {
        if let Some(tx) = &self.tx {
            if tx.try_send(event).is_err() {
                debug!(?event, "Telemetry buffer full, dropping event");
            }
        }
    }
}

/// Aggregated counters reported by the flusher.
#[derive(Debug, Default)]
struct Counters {
    issued: u64,
    rejected: u64,
    bypassed: u64,
    fetches_ok: u64,
    fetches_failed: u64,
    deleted: u64,
}

impl Counters {
    fn apply(&mut self, event: Event) {
        match event {
            Event::TokenIssued => self.issued += 1,
            Event::TokenRejected => self.rejected += 1,
            Event::SelfSignedBypass => self.bypassed += 1,
            Event::JwksFetchOk => self.fetches_ok += 1,
            Event::JwksFetchFailed => self.fetches_failed += 1,
            Event::SessionDeleted => self.deleted += 1,
        }
    }

    fn is_empty(&self) -> bool {
        self.issued == 0
            && self.rejected == 0
            && self.bypassed == 0
            && self.fetches_ok == 0
            && self.fetches_failed == 0
            && self.deleted == 0
    }

    fn report(&self) {
        info!(
            issued = self.issued,
            rejected = self.rejected,
            self_signed_bypassed = self.bypassed,
            jwks_fetches_ok = self.fetches_ok,
            jwks_fetches_failed = self.fetches_failed,
            sessions_deleted = self.deleted,
            "Session gateway activity"
        );
    }
}

/// Spawn the background flusher and return the recording handle.
///
/// The flusher reports accumulated counters every `interval` (skipping
/// empty windows) and once more on shutdown.
#[must_use]
pub fn spawn_flusher(
    capacity: usize,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> Telemetry {
    let (tx, mut rx) = mpsc::channel(capacity);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        let mut window = Counters::default();
        loop {
            tokio::select! {
                Some(event) = rx.recv() => {
                    window.apply(event);
                }
                _ = ticker.tick() => {
                    if !window.is_empty() {
                        window.report();
                        window = Counters::default();
                    }
                }
                _ = shutdown.recv() => {
                    if !window.is_empty() {
                        window.report();
                    }
                    debug!("Telemetry flusher shutting down");
                    break;
                }
            }
        }
    });

    Telemetry { tx: Some(tx) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_aggregate_by_kind() {
        let mut counters = Counters::default();
        counters.apply(Event::TokenIssued);
        counters.apply(Event::TokenIssued);
        counters.apply(Event::JwksFetchFailed);

        assert_eq!(counters.issued, 2);
        assert_eq!(counters.fetches_failed, 1);
        assert!(!counters.is_empty());
    }

    #[test]
    fn disabled_handle_swallows_events() {
        // Recording through a disabled handle must not panic or block
        let telemetry = Telemetry::disabled();
        telemetry.record(Event::TokenIssued);
    }

    #[tokio::test]
    async fn overflow_drops_instead_of_blocking() {
        // GIVEN: a tiny channel with no consumer
        let (tx, _rx) = mpsc::channel(1);
        let telemetry = Telemetry { tx: Some(tx) };

        // WHEN: more events than capacity are recorded
        // THEN: record returns immediately every time
        for _ in 0..16 {
            telemetry.record(Event::TokenIssued);
        }
    }

    #[tokio::test]
    async fn flusher_consumes_recorded_events() {
        let (shutdown_tx, _) = broadcast::channel(1);
        let telemetry = spawn_flusher(
            64,
            Duration::from_millis(10),
            shutdown_tx.subscribe(),
        );

        telemetry.record(Event::TokenIssued);
        telemetry.record(Event::SessionDeleted);

        // Give the flusher a tick to drain, then shut down
        tokio::time::sleep(Duration::from_millis(30)).await;
        let _ = shutdown_tx.send(());
    }
}
