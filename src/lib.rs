//! Mail account onboarding through Tor
//!
//! Verifies that a mail account can be used by logging in to its
//! provider over IMAP, with every connection routed through a local Tor
//! SOCKS proxy. Providers that demand a human step (an unlock captcha,
//! a web login) are handed to a [`ChallengeCoordinator`] and the attempt
//! resumes once the step is completed. Providers that need a local
//! bridge are reported without touching the network.
//!
//! The entry point is [`ConnectionVerifier`]; [`onboarding`] builds one
//! from an [`OnboardConfig`], and [`api`] serves it over HTTP.

pub mod api;
mod challenge;
mod config;
mod connection;
mod credential;
mod error;
pub mod onboarding;
mod outcome;
mod probe;
mod provider;
pub mod proxy;
mod secret;
pub mod socks;
mod verifier;

pub use challenge::{
    AbandonReason, AttemptId, ChallengeCoordinator, ChallengeError, ChallengeHandle,
    ChallengeMessage, ChallengeOutcome, ChallengeSurface, LogSurface, PendingChallenge,
};
pub use config::{DEFAULT_ATTESTATION_URL, OnboardConfig, ProxyMode};
pub use connection::{ImapClient, default_tls_config};
pub use credential::{CredentialSink, VerifiedCredential, digest_matches, digest_secret};
pub use error::{Error, Result};
pub use outcome::{FailureKind, VerificationResult};
pub use probe::{
    ImapProbe, ProbeError, ProbeOutcome, ProbeRequest, RemoteProbe, looks_like_challenge,
};
pub use provider::{ChallengeKind, ProviderProfile, ProviderRegistry, UNSUPPORTED_ID, email_domain};
pub use secret::Secret;
pub use verifier::{
    AttemptState, ConnectionVerifier, VerificationAttempt, VerificationRequest, VerifierSettings,
};
