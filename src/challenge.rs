//! Out-of-band challenge coordination
//!
//! When a provider insists on a human step, the coordinator opens a
//! surface showing the challenge URL and parks a one-shot slot keyed by
//! the attempt id. Whatever transport delivers the completion (an HTTP
//! callback, a terminal prompt, a deep link) ends up in
//! [`ChallengeCoordinator::complete_challenge`], which fills the slot at
//! most once. A slot that is not filled within the inactivity grace
//! period, or whose surface is closed, is discarded.
//!
//! Serialized completions must come from the challenge URL's origin and
//! carry the random completion key issued when the challenge opened.

use crate::secret::Secret;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Identifies one verification attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttemptId(Uuid);

impl AttemptId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AttemptId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for AttemptId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChallengeError {
    #[error("a challenge is already pending for attempt {0}")]
    AlreadyPending(AttemptId),

    #[error("invalid challenge URL: {0}")]
    InvalidUrl(String),

    #[error("completion message from untrusted origin {0}")]
    UntrustedOrigin(String),

    #[error("completion message without a valid completion key")]
    BadKey,

    #[error("malformed completion message: {0}")]
    Malformed(String),
}

/// Where the human solves the challenge.
pub trait ChallengeSurface: Send + Sync {
    fn open(&self, attempt_id: AttemptId, url: &str);
    fn close(&self, attempt_id: AttemptId);
}

/// Surface that announces the challenge URL in the log, for callers
/// that render it themselves.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSurface;

impl ChallengeSurface for LogSurface {
    fn open(&self, attempt_id: AttemptId, url: &str) {
        info!("Challenge for attempt {} awaiting completion at {}", attempt_id, url);
    }

    fn close(&self, attempt_id: AttemptId) {
        debug!("Challenge surface for attempt {} closed", attempt_id);
    }
}

/// The message an external surface posts when the human is done.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChallengeMessage {
    ChallengeComplete { token: Secret },
}

/// Snapshot of a parked challenge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingChallenge {
    pub attempt_id: AttemptId,
    pub challenge_url: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Returned by [`ChallengeCoordinator::open_challenge`]; awaited through
/// [`ChallengeCoordinator::wait`].
#[derive(Debug)]
pub struct ChallengeHandle {
    pub attempt_id: AttemptId,
    pub url: String,
    /// Must accompany serialized completions of this challenge.
    pub key: String,
    completion: oneshot::Receiver<Secret>,
}

/// Why a challenge ended without a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbandonReason {
    /// The surface closed, or the entry was discarded.
    SurfaceClosed,
    /// Nobody touched the challenge within the grace period.
    GraceExpired,
    /// The owning attempt was cancelled.
    Cancelled,
}

impl fmt::Display for AbandonReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::SurfaceClosed => "challenge window closed before completion",
            Self::GraceExpired => "challenge not completed within the grace period",
            Self::Cancelled => "attempt cancelled while waiting for the challenge",
        })
    }
}

#[derive(Debug)]
pub enum ChallengeOutcome {
    Completed(Secret),
    Abandoned(AbandonReason),
}

struct Entry {
    info: PendingChallenge,
    origin: String,
    key: String,
    slot: oneshot::Sender<Secret>,
    deadline: Instant,
}

/// Owner of all pending challenges.
pub struct ChallengeCoordinator {
    surface: Arc<dyn ChallengeSurface>,
    grace: Duration,
    pending: Mutex<HashMap<AttemptId, Entry>>,
}

impl ChallengeCoordinator {
    #[must_use]
    pub fn new(surface: Arc<dyn ChallengeSurface>, grace: Duration) -> Self {
        Self {
            surface,
            grace,
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn pending_map(&self) -> MutexGuard<'_, HashMap<AttemptId, Entry>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn grace_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.grace).unwrap_or(chrono::Duration::MAX)
    }

    /// Park a completion slot for `attempt_id` and open the surface.
    ///
    /// # Errors
    ///
    /// Returns an error if `url` does not parse or a challenge is already
    /// pending for the attempt.
    pub fn open_challenge(
        &self,
        attempt_id: AttemptId,
        url: &str,
    ) -> Result<ChallengeHandle, ChallengeError> {
        let parsed =
            url::Url::parse(url).map_err(|e| ChallengeError::InvalidUrl(e.to_string()))?;
        let origin = parsed.origin().ascii_serialization();
        let key = Uuid::new_v4().simple().to_string();

        let (slot, completion) = oneshot::channel();
        let now = Utc::now();
        {
            let mut pending = self.pending_map();
            if pending.contains_key(&attempt_id) {
                return Err(ChallengeError::AlreadyPending(attempt_id));
            }
            pending.insert(
                attempt_id,
                Entry {
                    info: PendingChallenge {
                        attempt_id,
                        challenge_url: url.to_string(),
                        created_at: now,
                        expires_at: now + self.grace_chrono(),
                    },
                    origin,
                    key: key.clone(),
                    slot,
                    deadline: Instant::now() + self.grace,
                },
            );
        }

        self.surface.open(attempt_id, url);
        Ok(ChallengeHandle {
            attempt_id,
            url: url.to_string(),
            key,
            completion,
        })
    }

    /// Fill the slot of `attempt_id` with `token`.
    ///
    /// Returns `false` when there is no pending challenge for the
    /// attempt, which includes every call after the first successful one.
    pub fn complete_challenge(&self, attempt_id: AttemptId, token: Secret) -> bool {
        let Some(entry) = self.pending_map().remove(&attempt_id) else {
            debug!("No pending challenge for attempt {}", attempt_id);
            return false;
        };
        self.surface.close(attempt_id);

        if entry.slot.send(token).is_err() {
            warn!("Attempt {} stopped waiting before its challenge completed", attempt_id);
            return false;
        }
        info!("Challenge for attempt {} completed", attempt_id);
        true
    }

    /// Authenticate and apply a serialized completion message.
    ///
    /// The origin must match the origin of the challenge URL and `key`
    /// must be the completion key of the pending challenge.
    ///
    /// Returns `Ok(false)` when nothing is pending for the attempt.
    ///
    /// # Errors
    ///
    /// Returns an error if the origin or key does not match, or if the
    /// body is not a completion message with a non-empty token.
    pub fn accept_message(
        &self,
        attempt_id: AttemptId,
        origin: &str,
        key: Option<&str>,
        body: &str,
    ) -> Result<bool, ChallengeError> {
        let (expected_origin, expected_key) = match self.pending_map().get(&attempt_id) {
            Some(entry) => (entry.origin.clone(), entry.key.clone()),
            None => return Ok(false),
        };
        if origin.trim_end_matches('/') != expected_origin {
            warn!("Rejected completion for attempt {} from {}", attempt_id, origin);
            return Err(ChallengeError::UntrustedOrigin(origin.to_string()));
        }
        if !key.is_some_and(|key| keys_match(key, &expected_key)) {
            warn!("Rejected completion for attempt {} without its key", attempt_id);
            return Err(ChallengeError::BadKey);
        }

        let ChallengeMessage::ChallengeComplete { token } =
            serde_json::from_str(body).map_err(|e| ChallengeError::Malformed(e.to_string()))?;
        if token.is_blank() {
            return Err(ChallengeError::Malformed("empty token".into()));
        }
        Ok(self.complete_challenge(attempt_id, token))
    }

    /// Record activity on the surface, restarting the grace period.
    pub fn touch(&self, attempt_id: AttemptId) -> bool {
        let mut pending = self.pending_map();
        let Some(entry) = pending.get_mut(&attempt_id) else {
            return false;
        };
        entry.deadline = Instant::now() + self.grace;
        entry.info.expires_at = Utc::now() + self.grace_chrono();
        true
    }

    /// The surface went away without a completion.
    pub fn surface_closed(&self, attempt_id: AttemptId) -> bool {
        self.discard(attempt_id).is_some()
    }

    /// Drop the pending challenge of a cancelled attempt.
    pub fn abandon(&self, attempt_id: AttemptId) -> bool {
        self.discard(attempt_id).is_some()
    }

    #[must_use]
    pub fn pending(&self, attempt_id: AttemptId) -> Option<PendingChallenge> {
        self.pending_map().get(&attempt_id).map(|e| e.info.clone())
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending_map().len()
    }

    fn discard(&self, attempt_id: AttemptId) -> Option<Entry> {
        let entry = self.pending_map().remove(&attempt_id);
        if entry.is_some() {
            self.surface.close(attempt_id);
            debug!("Discarded challenge for attempt {}", attempt_id);
        }
        entry
    }

    fn deadline(&self, attempt_id: AttemptId) -> Option<Instant> {
        self.pending_map().get(&attempt_id).map(|e| e.deadline)
    }

    /// Wait until the challenge is completed, abandoned or cancelled.
    pub async fn wait(
        &self,
        handle: ChallengeHandle,
        cancel: &CancellationToken,
    ) -> ChallengeOutcome {
        let ChallengeHandle {
            attempt_id,
            mut completion,
            ..
        } = handle;

        loop {
            let Some(deadline) = self.deadline(attempt_id) else {
                // Completed or discarded; the slot already knows which.
                return match completion.await {
                    Ok(token) => ChallengeOutcome::Completed(token),
                    Err(_) => ChallengeOutcome::Abandoned(AbandonReason::SurfaceClosed),
                };
            };

            tokio::select! {
                result = &mut completion => {
                    return match result {
                        Ok(token) => ChallengeOutcome::Completed(token),
                        Err(_) => ChallengeOutcome::Abandoned(AbandonReason::SurfaceClosed),
                    };
                }
                () = tokio::time::sleep_until(deadline) => {
                    let expired = {
                        let pending = self.pending_map();
                        pending.get(&attempt_id).is_some_and(|e| e.deadline <= Instant::now())
                    };
                    if expired {
                        self.discard(attempt_id);
                        info!("Challenge for attempt {} abandoned after inactivity", attempt_id);
                        return ChallengeOutcome::Abandoned(AbandonReason::GraceExpired);
                    }
                }
                () = cancel.cancelled() => {
                    self.discard(attempt_id);
                    return ChallengeOutcome::Abandoned(AbandonReason::Cancelled);
                }
            }
        }
    }
}

/// Compares without short-circuiting on the first differing byte.
fn keys_match(given: &str, expected: &str) -> bool {
    given.len() == expected.len()
        && given
            .bytes()
            .zip(expected.bytes())
            .fold(0u8, |diff, (a, b)| diff | (a ^ b))
            == 0
}
