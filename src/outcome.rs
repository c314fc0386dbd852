//! Terminal results of a verification attempt

use crate::challenge::AttemptId;
use serde::Serialize;
use std::fmt;

/// Why an attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    InvalidRequest,
    UnsupportedProvider,
    ProxyUnavailable,
    BootstrapTimeout,
    ProbeTimeout,
    AuthRejected,
    TransportError,
    Conflict,
    ChallengeAbandoned,
    Cancelled,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::InvalidRequest => "invalid_request",
            Self::UnsupportedProvider => "unsupported_provider",
            Self::ProxyUnavailable => "proxy_unavailable",
            Self::BootstrapTimeout => "bootstrap_timeout",
            Self::ProbeTimeout => "probe_timeout",
            Self::AuthRejected => "auth_rejected",
            Self::TransportError => "transport_error",
            Self::Conflict => "conflict",
            Self::ChallengeAbandoned => "challenge_abandoned",
            Self::Cancelled => "cancelled",
        })
    }
}

/// What `verify()` concluded.
///
/// `NeedsChallenge` is the only non-final variant: the attempt keeps
/// running in the background and its final result is available through
/// [`ConnectionVerifier::outcome`](crate::ConnectionVerifier::outcome).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum VerificationResult {
    Success {
        provider_id: String,
    },
    NeedsChallenge {
        attempt_id: AttemptId,
        url: String,
        /// Authenticates serialized completions of the challenge.
        completion_key: String,
        message: Option<String>,
    },
    NeedsBridgeSetup {
        provider_id: String,
        instructions: String,
    },
    Failed {
        kind: FailureKind,
        /// Finer cause, e.g. `BootstrapTimeout` behind `ProxyUnavailable`.
        #[serde(skip_serializing_if = "Option::is_none")]
        cause: Option<FailureKind>,
        message: String,
    },
}

impl VerificationResult {
    #[must_use]
    pub fn failed(kind: FailureKind, message: impl Into<String>) -> Self {
        Self::Failed {
            kind,
            cause: None,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn failed_because(
        kind: FailureKind,
        cause: FailureKind,
        message: impl Into<String>,
    ) -> Self {
        Self::Failed {
            kind,
            cause: Some(cause),
            message: message.into(),
        }
    }

    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Everything except `NeedsChallenge` ends the attempt.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::NeedsChallenge { .. })
    }

    #[must_use]
    pub const fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::Failed { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// A one-line description for people.
    #[must_use]
    pub fn message(&self) -> String {
        match self {
            Self::Success { provider_id } => {
                format!("Connection verified through Tor ({provider_id})")
            }
            Self::NeedsChallenge { url, message, .. } => message.as_ref().map_or_else(
                || format!("Provider requires verification at {url}"),
                |m| format!("Provider requires verification at {url}: {m}"),
            ),
            Self::NeedsBridgeSetup { instructions, .. } => instructions.clone(),
            Self::Failed { message, .. } => message.clone(),
        }
    }
}
