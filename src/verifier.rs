//! The verification state machine
//!
//! ```text
//!   Idle -> ProxyPending -> Probing -> Success
//!                              |    -> NeedsBridgeSetup (before ProxyPending)
//!                              |    -> Failed(kind)
//!                              v
//!                        NeedsChallenge --completed--> Probing -> ...
//!                              |
//!                              +--abandoned/cancelled--> Failed
//! ```
//!
//! An attempt holds an in-flight marker for its account from admission
//! until it reaches a terminal result. The marker is an RAII guard, so
//! every way out (return, cancellation, dropping the `verify()` future,
//! the resumption task finishing) releases it.

use crate::challenge::{AbandonReason, AttemptId, ChallengeCoordinator, ChallengeOutcome};
use crate::credential::{self, CredentialSink, VerifiedCredential};
use crate::outcome::{FailureKind, VerificationResult};
use crate::probe::{ProbeError, ProbeOutcome, ProbeRequest, RemoteProbe};
use crate::provider::{ChallengeKind, ProviderProfile, ProviderRegistry, email_domain};
use crate::proxy::{ProxyError, ProxyHandle, ProxyLifecycleManager};
use crate::secret::Secret;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A request to verify one account.
#[derive(Debug, Clone)]
pub struct VerificationRequest {
    pub account_email: String,
    pub secret: Secret,
    /// Provider id to use when the email domain is not in the table.
    pub provider_hint: Option<String>,
}

impl VerificationRequest {
    #[must_use]
    pub fn new(account_email: impl Into<String>, secret: impl Into<Secret>) -> Self {
        Self {
            account_email: account_email.into(),
            secret: secret.into(),
            provider_hint: None,
        }
    }

    #[must_use]
    pub fn with_provider_hint(mut self, hint: impl Into<String>) -> Self {
        self.provider_hint = Some(hint.into());
        self
    }

    /// Check required fields.
    ///
    /// # Errors
    ///
    /// Returns a message naming the first missing or malformed field.
    pub fn validate(&self) -> Result<(), String> {
        if self.account_email.trim().is_empty() {
            return Err("Email address is required".into());
        }
        if email_domain(&self.account_email).is_none() {
            return Err(format!("'{}' is not a valid email address", self.account_email.trim()));
        }
        if self.secret.is_blank() {
            return Err("Password or app token is required".into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptState {
    ProxyPending,
    Probing,
    NeedsChallenge,
}

/// Snapshot of a live attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationAttempt {
    pub attempt_id: AttemptId,
    pub account_email: String,
    pub provider_id: String,
    pub state: AttemptState,
    pub started_at: DateTime<Utc>,
    /// When the current suspension point gives up, if it has a bound.
    pub deadline: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy)]
pub struct VerifierSettings {
    pub probe_timeout: Duration,
    /// Require attested anonymous egress before any probe.
    pub require_attestation: bool,
    /// How long the final result of a challenged attempt waits to be
    /// claimed through [`ConnectionVerifier::outcome`].
    pub outcome_retention: Duration,
}

impl Default for VerifierSettings {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_secs(15),
            require_attestation: true,
            outcome_retention: Duration::from_secs(600),
        }
    }
}

struct Live {
    attempt: VerificationAttempt,
    cancel: CancellationToken,
}

type InFlight = Arc<Mutex<HashMap<String, Live>>>;
type OutcomeSlots = Mutex<HashMap<AttemptId, watch::Receiver<Option<VerificationResult>>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Holds the in-flight marker of one account.
struct InFlightGuard {
    in_flight: InFlight,
    key: String,
    attempt_id: AttemptId,
}

impl InFlightGuard {
    fn set_state(&self, state: AttemptState, deadline: Option<DateTime<Utc>>) {
        if let Some(live) = lock(&self.in_flight).get_mut(&self.key)
            && live.attempt.attempt_id == self.attempt_id
        {
            live.attempt.state = state;
            live.attempt.deadline = deadline;
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut map = lock(&self.in_flight);
        if map
            .get(&self.key)
            .is_some_and(|live| live.attempt.attempt_id == self.attempt_id)
        {
            map.remove(&self.key);
            debug!("Released attempt {} for {}", self.attempt_id, self.key);
        }
    }
}

enum Verdict {
    Final(VerificationResult),
    Challenge { url: String, message: Option<String> },
}

struct Shared {
    registry: ProviderRegistry,
    proxy: Arc<dyn ProxyLifecycleManager>,
    probe: Arc<dyn RemoteProbe>,
    challenges: Arc<ChallengeCoordinator>,
    sink: Option<Arc<dyn CredentialSink>>,
    settings: VerifierSettings,
    in_flight: InFlight,
    outcomes: OutcomeSlots,
}

/// Exclusive claim on the outcome slot of one attempt. Dropped before
/// the result arrives, it puts the slot back for the next caller.
struct OutcomeClaim<'a> {
    slots: &'a OutcomeSlots,
    attempt_id: AttemptId,
    rx: Option<watch::Receiver<Option<VerificationResult>>>,
}

impl Drop for OutcomeClaim<'_> {
    fn drop(&mut self) {
        if let Some(rx) = self.rx.take() {
            lock(self.slots).insert(self.attempt_id, rx);
        }
    }
}

/// Answers "can this account be used" by composing the registry, the
/// proxy, a probe and the challenge coordinator.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct ConnectionVerifier {
    shared: Arc<Shared>,
}

impl ConnectionVerifier {
    #[must_use]
    pub fn new(
        registry: ProviderRegistry,
        proxy: Arc<dyn ProxyLifecycleManager>,
        probe: Arc<dyn RemoteProbe>,
        challenges: Arc<ChallengeCoordinator>,
        settings: VerifierSettings,
    ) -> Self {
        Self::build(registry, proxy, probe, challenges, settings, None)
    }

    /// Like [`new`](Self::new), handing verified credentials to `sink`.
    #[must_use]
    pub fn with_sink(
        registry: ProviderRegistry,
        proxy: Arc<dyn ProxyLifecycleManager>,
        probe: Arc<dyn RemoteProbe>,
        challenges: Arc<ChallengeCoordinator>,
        settings: VerifierSettings,
        sink: Arc<dyn CredentialSink>,
    ) -> Self {
        Self::build(registry, proxy, probe, challenges, settings, Some(sink))
    }

    fn build(
        registry: ProviderRegistry,
        proxy: Arc<dyn ProxyLifecycleManager>,
        probe: Arc<dyn RemoteProbe>,
        challenges: Arc<ChallengeCoordinator>,
        settings: VerifierSettings,
        sink: Option<Arc<dyn CredentialSink>>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                registry,
                proxy,
                probe,
                challenges,
                sink,
                settings,
                in_flight: Arc::new(Mutex::new(HashMap::new())),
                outcomes: Mutex::new(HashMap::new()),
            }),
        }
    }

    #[must_use]
    pub fn registry(&self) -> &ProviderRegistry {
        &self.shared.registry
    }

    #[must_use]
    pub fn proxy(&self) -> &Arc<dyn ProxyLifecycleManager> {
        &self.shared.proxy
    }

    #[must_use]
    pub fn challenges(&self) -> &Arc<ChallengeCoordinator> {
        &self.shared.challenges
    }

    /// Run one verification.
    ///
    /// Returns a terminal result, or `NeedsChallenge` when the provider
    /// wants a human step; the attempt then continues in the background
    /// and [`outcome`](Self::outcome) yields its final result.
    pub async fn verify(&self, request: VerificationRequest) -> VerificationResult {
        if let Err(message) = request.validate() {
            return VerificationResult::failed(FailureKind::InvalidRequest, message);
        }
        let VerificationRequest {
            account_email,
            secret,
            provider_hint,
        } = request;
        let account_email = account_email.trim().to_string();

        let profile = self.resolve(&account_email, provider_hint.as_deref());
        let attempt_id = AttemptId::new();
        let cancel = CancellationToken::new();

        let Some(guard) = self.admit(&account_email, &profile, attempt_id, &cancel) else {
            info!("Rejected concurrent verification of {}", account_email);
            return VerificationResult::failed(
                FailureKind::Conflict,
                format!("A verification for {account_email} is already in progress"),
            );
        };

        if !profile.is_supported() {
            return VerificationResult::failed(
                FailureKind::UnsupportedProvider,
                format!("No supported provider for {account_email}"),
            );
        }

        if profile.challenge_kind == ChallengeKind::BridgeRequired {
            info!("{} needs a local bridge for {}", account_email, profile.id);
            return VerificationResult::NeedsBridgeSetup {
                provider_id: profile.id.clone(),
                instructions: profile.bridge_instructions.clone().unwrap_or_default(),
            };
        }

        info!("Verifying {} ({}) as attempt {}", account_email, profile.id, attempt_id);

        let verdict = match self
            .probe_once(&guard, &profile, &account_email, &secret, None, &cancel)
            .await
        {
            Ok(verdict) => verdict,
            Err(result) => return result,
        };

        match verdict {
            Verdict::Final(result) => {
                self.finish(&profile, &account_email, &secret, &result).await;
                result
            }
            Verdict::Challenge { url, message } => {
                let handle = match self.shared.challenges.open_challenge(attempt_id, &url) {
                    Ok(handle) => handle,
                    Err(e) => {
                        warn!("Cannot open challenge for attempt {}: {}", attempt_id, e);
                        return VerificationResult::failed(
                            FailureKind::AuthRejected,
                            message.unwrap_or_else(|| e.to_string()),
                        );
                    }
                };
                let expires = self
                    .shared
                    .challenges
                    .pending(attempt_id)
                    .map(|p| p.expires_at);
                guard.set_state(AttemptState::NeedsChallenge, expires);
                let completion_key = handle.key.clone();

                let (tx, rx) = watch::channel(None);
                lock(&self.shared.outcomes).insert(attempt_id, rx);

                info!("Attempt {} waiting for challenge at {}", attempt_id, url);
                let verifier = self.clone();
                tokio::spawn(async move {
                    let outcome = verifier.shared.challenges.wait(handle, &cancel).await;
                    let result = verifier
                        .resume(&guard, &profile, &account_email, &secret, outcome, &cancel)
                        .await;
                    drop(guard);
                    drop(secret);
                    info!("Attempt {} finished: {}", attempt_id, result.message());
                    tx.send_replace(Some(result));

                    tokio::time::sleep(verifier.shared.settings.outcome_retention).await;
                    if lock(&verifier.shared.outcomes).remove(&attempt_id).is_some() {
                        debug!("Dropped unclaimed outcome of attempt {}", attempt_id);
                    }
                });

                VerificationResult::NeedsChallenge {
                    attempt_id,
                    url,
                    completion_key,
                    message,
                }
            }
        }
    }

    /// Wait for the final result of a challenged attempt.
    ///
    /// The result is handed out once. Only one caller waits at a time:
    /// concurrent calls, calls after the result was claimed, calls for
    /// unknown attempts and calls after the retention period return
    /// `None`. A caller that stops waiting early leaves the result
    /// claimable.
    pub async fn outcome(&self, attempt_id: AttemptId) -> Option<VerificationResult> {
        let rx = lock(&self.shared.outcomes).remove(&attempt_id)?;
        let mut claim = OutcomeClaim {
            slots: &self.shared.outcomes,
            attempt_id,
            rx: Some(rx),
        };
        let Some(rx) = claim.rx.as_mut() else {
            return None;
        };
        let result = rx
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|value| value.clone());
        claim.rx = None;
        result
    }

    /// Snapshot of the live attempt for `email`.
    #[must_use]
    pub fn attempt(&self, email: &str) -> Option<VerificationAttempt> {
        lock(&self.shared.in_flight)
            .get(&normalize_email(email))
            .map(|live| live.attempt.clone())
    }

    /// Snapshot of the live attempt with `attempt_id`.
    #[must_use]
    pub fn attempt_by_id(&self, attempt_id: AttemptId) -> Option<VerificationAttempt> {
        lock(&self.shared.in_flight)
            .values()
            .find(|live| live.attempt.attempt_id == attempt_id)
            .map(|live| live.attempt.clone())
    }

    /// Cancel the live attempt for `email` at whatever point it is
    /// suspended.
    pub fn cancel(&self, email: &str) -> bool {
        let map = lock(&self.shared.in_flight);
        let Some(live) = map.get(&normalize_email(email)) else {
            return false;
        };
        info!("Cancelling attempt {}", live.attempt.attempt_id);
        live.cancel.cancel();
        true
    }

    fn resolve(&self, email: &str, hint: Option<&str>) -> ProviderProfile {
        let profile = self.shared.registry.resolve_provider(email);
        if profile.is_supported() {
            return profile;
        }
        hint.and_then(|h| self.shared.registry.resolve_hint(h))
            .cloned()
            .unwrap_or(profile)
    }

    fn admit(
        &self,
        email: &str,
        profile: &ProviderProfile,
        attempt_id: AttemptId,
        cancel: &CancellationToken,
    ) -> Option<InFlightGuard> {
        let key = normalize_email(email);
        let mut map = lock(&self.shared.in_flight);
        if map.contains_key(&key) {
            return None;
        }
        map.insert(
            key.clone(),
            Live {
                attempt: VerificationAttempt {
                    attempt_id,
                    account_email: email.to_string(),
                    provider_id: profile.id.clone(),
                    state: AttemptState::ProxyPending,
                    started_at: Utc::now(),
                    deadline: None,
                },
                cancel: cancel.clone(),
            },
        );
        Some(InFlightGuard {
            in_flight: Arc::clone(&self.shared.in_flight),
            key,
            attempt_id,
        })
    }

    /// Bring the proxy up and run exactly one probe.
    ///
    /// `Err` carries a result that ends the attempt before classification.
    async fn probe_once(
        &self,
        guard: &InFlightGuard,
        profile: &ProviderProfile,
        email: &str,
        secret: &Secret,
        token: Option<Secret>,
        cancel: &CancellationToken,
    ) -> Result<Verdict, VerificationResult> {
        guard.set_state(AttemptState::ProxyPending, None);
        let handle = tokio::select! {
            started = self.shared.proxy.start() => started.map_err(proxy_failure)?,
            () = cancel.cancelled() => return Err(cancelled()),
        };
        self.attest(&handle, cancel).await?;

        let limit = self.shared.settings.probe_timeout;
        guard.set_state(
            AttemptState::Probing,
            chrono::Duration::from_std(limit).ok().map(|d| Utc::now() + d),
        );

        let token_supplied = token.is_some();
        let request = ProbeRequest {
            host: profile.host.clone(),
            port: profile.port,
            use_tls: profile.use_tls,
            user: email.to_string(),
            secret: secret.clone(),
            proxy: handle.endpoint,
            timeout: limit,
            challenge_token: token,
        };

        let outcome = tokio::select! {
            outcome = self.dispatch(request) => outcome,
            () = cancel.cancelled() => return Err(cancelled()),
        };

        match outcome {
            Ok(outcome) => Ok(classify(profile, outcome, token_supplied)),
            Err(ProbeError::Timeout(d)) => Err(VerificationResult::failed(
                FailureKind::ProbeTimeout,
                format!("{} did not answer within {}s", profile.host, d.as_secs()),
            )),
            Err(ProbeError::Transport(message)) => Err(VerificationResult::failed(
                FailureKind::TransportError,
                message,
            )),
        }
    }

    async fn attest(
        &self,
        handle: &ProxyHandle,
        cancel: &CancellationToken,
    ) -> Result<(), VerificationResult> {
        if !self.shared.settings.require_attestation {
            return Ok(());
        }
        let live = tokio::select! {
            live = self.shared.proxy.check_live() => live,
            () = cancel.cancelled() => return Err(cancelled()),
        };
        if live {
            Ok(())
        } else {
            warn!("Egress through {} is not attested as Tor", handle.endpoint);
            Err(VerificationResult::failed(
                FailureKind::ProxyUnavailable,
                "Traffic through the proxy is not routed via Tor",
            ))
        }
    }

    /// One probe call, bounded by the probe timeout and isolated from
    /// panics.
    async fn dispatch(&self, request: ProbeRequest) -> Result<ProbeOutcome, ProbeError> {
        let limit = request.timeout;
        let host = request.host.clone();
        let call = AssertUnwindSafe(self.shared.probe.probe(request)).catch_unwind();

        match tokio::time::timeout(limit, call).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                error!("Probe of {} panicked", host);
                Err(ProbeError::Transport(format!(
                    "Internal error while probing {host}"
                )))
            }
            Err(_) => Err(ProbeError::Timeout(limit)),
        }
    }

    async fn resume(
        &self,
        guard: &InFlightGuard,
        profile: &ProviderProfile,
        email: &str,
        secret: &Secret,
        outcome: ChallengeOutcome,
        cancel: &CancellationToken,
    ) -> VerificationResult {
        let token = match outcome {
            ChallengeOutcome::Completed(token) => token,
            ChallengeOutcome::Abandoned(AbandonReason::Cancelled) => return cancelled(),
            ChallengeOutcome::Abandoned(reason) => {
                return VerificationResult::failed(
                    FailureKind::ChallengeAbandoned,
                    reason.to_string(),
                );
            }
        };

        debug!("Resuming attempt {} after challenge", guard.attempt_id);
        let result = match self
            .probe_once(guard, profile, email, secret, Some(token), cancel)
            .await
        {
            Ok(Verdict::Final(result)) => result,
            Ok(Verdict::Challenge { message, .. }) => VerificationResult::failed(
                FailureKind::AuthRejected,
                message.unwrap_or_else(|| "Provider still requires verification".into()),
            ),
            Err(result) => result,
        };
        self.finish(profile, email, secret, &result).await;
        result
    }

    async fn finish(
        &self,
        profile: &ProviderProfile,
        email: &str,
        secret: &Secret,
        result: &VerificationResult,
    ) {
        if !result.is_success() {
            return;
        }
        let Some(sink) = &self.shared.sink else {
            return;
        };

        let material = secret.clone();
        let hashing = tokio::task::spawn_blocking(move || credential::digest_secret(&material));
        let digest = match hashing.await {
            Ok(Ok(digest)) => digest,
            Ok(Err(e)) => {
                warn!("Cannot digest credential for {}: {}", email, e);
                return;
            }
            Err(e) => {
                warn!("Credential digest task failed: {}", e);
                return;
            }
        };

        let credential = VerifiedCredential {
            email: email.to_string(),
            provider_id: profile.id.clone(),
            secret_digest: digest,
        };
        if let Err(e) = sink.store(credential).await {
            warn!("Credential sink rejected {}: {}", email, e);
        }
    }
}

fn normalize_email(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}

fn cancelled() -> VerificationResult {
    VerificationResult::failed(FailureKind::Cancelled, "Verification was cancelled")
}

fn proxy_failure(err: ProxyError) -> VerificationResult {
    let message = format!("Tor proxy unavailable: {err}");
    match err {
        ProxyError::BootstrapTimeout(_) => VerificationResult::failed_because(
            FailureKind::ProxyUnavailable,
            FailureKind::BootstrapTimeout,
            message,
        ),
        _ => VerificationResult::failed(FailureKind::ProxyUnavailable, message),
    }
}

fn classify(profile: &ProviderProfile, outcome: ProbeOutcome, token_supplied: bool) -> Verdict {
    let wants_challenge = outcome.challenge_detected
        || (profile.challenge_kind == ChallengeKind::Captcha && !token_supplied);

    if wants_challenge {
        if token_supplied {
            return Verdict::Final(VerificationResult::failed(
                FailureKind::AuthRejected,
                outcome
                    .provider_message
                    .unwrap_or_else(|| "Provider still requires verification".into()),
            ));
        }
        let url = profile
            .challenge_url
            .clone()
            .or_else(|| outcome.provider_message.as_deref().and_then(first_https_url));
        return match url {
            Some(url) => Verdict::Challenge {
                url,
                message: outcome.provider_message,
            },
            None => Verdict::Final(VerificationResult::failed(
                FailureKind::AuthRejected,
                outcome
                    .provider_message
                    .unwrap_or_else(|| "Provider requires verification".into()),
            )),
        };
    }

    if outcome.success {
        Verdict::Final(VerificationResult::Success {
            provider_id: profile.id.clone(),
        })
    } else {
        Verdict::Final(VerificationResult::failed(
            FailureKind::AuthRejected,
            outcome
                .provider_message
                .unwrap_or_else(|| "Login rejected by provider".into()),
        ))
    }
}

/// First `https://` link in a provider message such as
/// `[WEBALERT https://accounts.google.com/...] Web login required`.
fn first_https_url(message: &str) -> Option<String> {
    let start = message.find("https://")?;
    let url: String = message[start..]
        .chars()
        .take_while(|c| !c.is_whitespace() && !matches!(c, ']' | ')' | '"' | '>'))
        .collect();
    url::Url::parse(&url).ok().map(|_| url)
}
