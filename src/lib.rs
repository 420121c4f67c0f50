//! Session Gateway Library
//!
//! Federated authentication and session service for a game ecosystem in
//! which servers and clients must agree on player identity without a single
//! vendor-operated login provider.
//!
//! # Features
//!
//! - **Token lifecycle**: identity → authorization grant → audience-bound
//!   access token, all Ed25519-signed with 10-hour lifetimes
//! - **Dynamic issuer binding**: one deployment acts as a family of logical
//!   issuers keyed by the request host
//! - **JWKS federation**: verification keys for foreign issuers are
//!   discovered on demand, cached, and merged with the local key set
//! - **Self-signed acceptance**: clients may embed their own key in a token
//!   header; the exchange answers with tokens verifiable under that key
//! - **Certificate binding**: access tokens can carry a caller-supplied
//!   transport fingerprint in their confirmation claim

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod error;
pub mod exchange;
pub mod federation;
pub mod http;
pub mod issuer;
pub mod keystore;
pub mod selfsigned;
pub mod session;
pub mod telemetry;
pub mod token;

pub use error::{Error, Result};

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
