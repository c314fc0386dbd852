//! Remote login probe
//!
//! A probe performs one handshake and login against a provider through
//! the proxy and reports what the provider said. Implementations own
//! their timeout and must close the connection on every exit path.

use crate::connection::{self, ImapClient};
use crate::error::Result;
use crate::proxy::ProxyEndpoint;
use crate::secret::Secret;
use crate::socks;
use async_trait::async_trait;
use rustls::ClientConfig;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Everything one probe needs.
#[derive(Debug, Clone)]
pub struct ProbeRequest {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
    pub user: String,
    pub secret: Secret,
    pub proxy: ProxyEndpoint,
    pub timeout: Duration,
    /// Token from a completed challenge, when this is a resumed attempt.
    pub challenge_token: Option<Secret>,
}

/// What the provider answered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub success: bool,
    pub provider_message: Option<String>,
    pub challenge_detected: bool,
}

impl ProbeOutcome {
    #[must_use]
    pub const fn accepted() -> Self {
        Self {
            success: true,
            provider_message: None,
            challenge_detected: false,
        }
    }

    /// A refused login; the provider text is kept verbatim.
    #[must_use]
    pub fn rejected(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            success: false,
            challenge_detected: looks_like_challenge(&message),
            provider_message: Some(message),
        }
    }
}

/// Failures that never reached a provider verdict.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    Transport(String),
}

#[async_trait]
pub trait RemoteProbe: Send + Sync {
    /// Attempt one authentication against the remote server.
    ///
    /// # Errors
    ///
    /// Returns an error if the server cannot be reached or the connection
    /// breaks before it answers. A refused login is an `Ok` outcome.
    async fn probe(&self, request: ProbeRequest) -> std::result::Result<ProbeOutcome, ProbeError>;
}

/// Whether a login refusal asks for human interaction rather than
/// different credentials.
///
/// Gmail answers `NO [WEBALERT https://...] Web login required` or
/// "Please log in via your web browser"; others mention a captcha or an
/// account unlock page.
#[must_use]
pub fn looks_like_challenge(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    ["webalert", "web browser", "web login", "captcha", "unlock"]
        .iter()
        .any(|needle| lower.contains(needle))
}

/// async-imap renders a tagged `NO`/`BAD` as
/// `code: Some(..), info: Some("text")`; the provider's own words are
/// the `info` part.
fn provider_text(raw: &str) -> String {
    const MARKER: &str = "info: Some(\"";
    let Some(start) = raw.find(MARKER) else {
        return raw.trim().to_string();
    };
    let body = &raw[start + MARKER.len()..];
    let end = body.rfind("\")").unwrap_or(body.len());
    body[..end].replace("\\\"", "\"").replace("\\\\", "\\")
}

/// Outcome of a refused login. Challenge keywords are looked for in the
/// full response, including the response code.
fn refusal(raw: &str) -> ProbeOutcome {
    ProbeOutcome {
        success: false,
        challenge_detected: looks_like_challenge(raw),
        provider_message: Some(provider_text(raw)),
    }
}

/// Probe that logs in over IMAP through the SOCKS proxy.
pub struct ImapProbe {
    tls: Arc<ClientConfig>,
}

impl ImapProbe {
    /// A probe trusting the public web PKI.
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS configuration cannot be built.
    pub fn new() -> Result<Self> {
        Ok(Self {
            tls: connection::default_tls_config()?,
        })
    }

    /// A probe with a custom TLS configuration, e.g. a private CA.
    #[must_use]
    pub const fn with_tls_config(tls: Arc<ClientConfig>) -> Self {
        Self { tls }
    }

    async fn login(&self, request: &ProbeRequest) -> std::result::Result<ProbeOutcome, ProbeError> {
        let stream = socks::connect(&request.proxy, &request.host, request.port)
            .await
            .map_err(|e| ProbeError::Transport(e.to_string()))?;

        let client: ImapClient = connection::open_client(
            stream,
            &request.host,
            request.use_tls,
            Arc::clone(&self.tls),
        )
        .await
        .map_err(|e| ProbeError::Transport(e.to_string()))?;

        if request.challenge_token.is_some() {
            debug!("Retrying login for {} after a completed challenge", request.user);
        }

        match client.login(&request.user, request.secret.expose()).await {
            Ok(mut session) => {
                session.logout().await.ok();
                info!("Login accepted by {}", request.host);
                Ok(ProbeOutcome::accepted())
            }
            Err((
                async_imap::error::Error::No(message) | async_imap::error::Error::Bad(message),
                _,
            )) => {
                info!("Login refused by {}: {}", request.host, message);
                Ok(refusal(&message))
            }
            Err((e, _)) => Err(ProbeError::Transport(format!("Login failed: {e}"))),
        }
    }
}

#[async_trait]
impl RemoteProbe for ImapProbe {
    async fn probe(&self, request: ProbeRequest) -> std::result::Result<ProbeOutcome, ProbeError> {
        let limit = request.timeout;
        // Dropping the login future on expiry drops the stream with it.
        if let Ok(result) = tokio::time::timeout(limit, self.login(&request)).await {
            result
        } else {
            warn!("Probe of {}:{} timed out", request.host, request.port);
            Err(ProbeError::Timeout(limit))
        }
    }
}
