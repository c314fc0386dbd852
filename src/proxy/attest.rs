//! Third-party attestation of anonymized egress
//!
//! An open SOCKS port proves nothing: a misconfigured proxy can accept
//! connections and send them out in the clear. Attestation asks an
//! outside service which address the request arrived from and whether
//! that address is a known exit.

use super::{ProxyEndpoint, ProxyError};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Answer of the attestation service.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Attestation {
    #[serde(rename = "IsTor")]
    pub is_tor: bool,
    #[serde(rename = "IP", default)]
    pub ip: Option<String>,
}

#[async_trait]
pub trait Attestor: Send + Sync {
    /// Ask an external service whether traffic through `endpoint` exits
    /// the Tor network.
    ///
    /// # Errors
    ///
    /// Returns an error if the check service cannot be reached through the
    /// proxy or answers with something unreadable.
    async fn attest(&self, endpoint: &ProxyEndpoint) -> Result<Attestation, ProxyError>;
}

/// Attestation against `check.torproject.org`, fetched through the proxy.
#[derive(Debug, Clone)]
pub struct TorCheckAttestor {
    url: String,
    timeout: Duration,
}

impl TorCheckAttestor {
    #[must_use]
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            timeout,
        }
    }
}

#[async_trait]
impl Attestor for TorCheckAttestor {
    async fn attest(&self, endpoint: &ProxyEndpoint) -> Result<Attestation, ProxyError> {
        let proxy = reqwest::Proxy::all(endpoint.socks_url())
            .map_err(|e| ProxyError::Unreachable(format!("invalid proxy URL: {e}")))?;
        let client = reqwest::Client::builder()
            .proxy(proxy)
            .timeout(self.timeout)
            .build()
            .map_err(|e| ProxyError::Unreachable(e.to_string()))?;

        debug!("Attesting egress of {} via {}", endpoint, self.url);

        let attestation = client
            .get(&self.url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| ProxyError::Unreachable(format!("attestation request failed: {e}")))?
            .json::<Attestation>()
            .await
            .map_err(|e| ProxyError::Unreachable(format!("malformed attestation: {e}")))?;

        Ok(attestation)
    }
}
