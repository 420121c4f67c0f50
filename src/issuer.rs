//! Issuer binding and trust classification.
//!
//! A single deployment answers under a family of hostnames; each request's
//! `Host` header decides which issuer URL freshly issued tokens carry. An
//! incoming token's issuer is classified as local (this deployment),
//! official (configured vendor allow-list), or foreign (anything else) to
//! drive the federation component's trust decisions.

use crate::config::IssuerConfig;

/// Trust classification of a token issuer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssuerClass {
    /// One of this deployment's own hosts
    Local,
    /// On the official vendor allow-list; verified elsewhere
    Official,
    /// Anything else; keys are discovered through JWKS federation
    Foreign,
}

/// Derives issuer URLs from request hosts and classifies incoming issuers.
#[derive(Debug, Clone)]
pub struct IssuerResolver {
    base_domain: String,
    local_hosts: Vec<String>,
    official_hosts: Vec<String>,
}

impl IssuerResolver {
    /// Build a resolver from configuration. The base domain is always a
    /// local host.
    #[must_use]
    pub fn new(config: &IssuerConfig) -> Self {
        let mut local_hosts = config.local_hosts.clone();
        if !local_hosts.iter().any(|h| h == &config.base_domain) {
            local_hosts.push(config.base_domain.clone());
        }
        Self {
            base_domain: config.base_domain.clone(),
            local_hosts,
            official_hosts: config.official_hosts.clone(),
        }
    }

    /// Issuer URL for a token issued in response to a request that arrived
    /// under `host_header`.
    ///
    /// The port is stripped; a host inside the base domain becomes its own
    /// issuer so clients patched for different subdomains each see the
    /// `iss` they expect. Anything else falls back to the default issuer.
    #[must_use]
    pub fn resolve_for_request(&self, host_header: Option<&str>) -> String {
        match host_header.map(strip_port) {
            Some(host) if !host.is_empty() && host.contains(&self.base_domain) => {
                format!("https://{host}")
            }
            _ => self.default_issuer(),
        }
    }

    /// The fallback issuer: `https://<base domain>`.
    #[must_use]
    pub fn default_issuer(&self) -> String {
        format!("https://{}", self.base_domain)
    }

    /// Classify an issuer URL for trust routing.
    #[must_use]
    pub fn classify(&self, issuer: &str) -> IssuerClass {
        let host = issuer_host(issuer);
        if self.local_hosts.iter().any(|h| h == host) {
            IssuerClass::Local
        } else if self.official_hosts.iter().any(|h| h == host) {
            IssuerClass::Official
        } else {
            IssuerClass::Foreign
        }
    }

    /// Whether `issuer` names a host inside the configured base domain.
    #[must_use]
    pub fn within_base_domain(&self, issuer: &str) -> bool {
        issuer_host(issuer).contains(&self.base_domain)
    }
}

/// Extract the bare host from an issuer URL: scheme, port, and path are
/// dropped.
#[must_use]
pub fn issuer_host(issuer: &str) -> &str {
    let rest = issuer
        .strip_prefix("https://")
        .or_else(|| issuer.strip_prefix("http://"))
        .unwrap_or(issuer);
    let rest = rest.split('/').next().unwrap_or(rest);
    strip_port(rest)
}

/// Drop a `:port` suffix from a host header value.
fn strip_port(host: &str) -> &str {
    host.split(':').next().unwrap_or(host)
}
