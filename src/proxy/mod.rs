//! Local anonymizing proxy lifecycle
//!
//! [`ProxyLifecycleManager`] is what the verifier sees. The crate ships
//! one implementation, [`ProxySupervisor`], which owns the state machine
//! and the single-flight bootstrap and delegates the actual process or
//! daemon handling to a [`ProxyBackend`]:
//!
//! - [`EmbeddedTor`] launches and supervises a `tor` child process
//! - [`ExternalDaemon`] waits for an already running daemon to be usable
//!
//! ```text
//!   Disconnected --start--> Bootstrapping --ready--> Connected
//!        ^                        |
//!        |                        +--timeout/error--> Failed(cause)
//!        +------------- stop (from any state) ------------+
//! ```

mod attest;
mod embedded;
mod external;

pub use attest::{Attestation, Attestor, TorCheckAttestor};
pub use embedded::EmbeddedTor;
pub use external::ExternalDaemon;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

/// Why the proxy is not usable.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProxyError {
    #[error("proxy bootstrap timed out after {0:?}")]
    BootstrapTimeout(Duration),

    #[error("proxy failed to launch: {0}")]
    Launch(String),

    #[error("proxy is unreachable: {0}")]
    Unreachable(String),

    #[error("proxy egress is not anonymized: {0}")]
    NotAnonymous(String),

    #[error("proxy was stopped while bootstrapping")]
    Stopped,
}

/// Proxy lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyState {
    Disconnected,
    Bootstrapping,
    Connected,
    Failed(ProxyError),
}

/// Where the SOCKS listener of a running proxy can be reached.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProxyEndpoint {
    pub host: String,
    pub port: u16,
}

impl ProxyEndpoint {
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// SOCKS URL with proxy-side name resolution, so no DNS query for
    /// the target ever leaves this host.
    #[must_use]
    pub fn socks_url(&self) -> String {
        format!("socks5h://{}:{}", self.host, self.port)
    }
}

impl fmt::Display for ProxyEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Proof that a bootstrap completed; shared by every attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyHandle {
    pub endpoint: ProxyEndpoint,
}

#[async_trait]
pub trait ProxyLifecycleManager: Send + Sync {
    /// Bring the proxy up, or join a bootstrap already in progress.
    ///
    /// # Errors
    ///
    /// Returns an error if the bootstrap fails, times out, or is
    /// interrupted by `stop()`, or if attestation is required and fails.
    async fn start(&self) -> Result<ProxyHandle, ProxyError>;

    /// Whether traffic actually leaves through the anonymizing network.
    async fn check_live(&self) -> bool;

    /// Tear down and reset to [`ProxyState::Disconnected`].
    async fn stop(&self);

    fn state(&self) -> ProxyState;
}

/// The process- or daemon-specific half of a proxy.
#[async_trait]
pub trait ProxyBackend: Send + Sync + 'static {
    /// Run the startup sequence until the proxy self-reports ready.
    ///
    /// Must be cancel-safe: the supervisor drops this future when the
    /// bootstrap deadline passes.
    ///
    /// # Errors
    ///
    /// Returns an error if the proxy cannot be launched or never becomes
    /// ready.
    async fn bootstrap(&self) -> Result<ProxyEndpoint, ProxyError>;

    /// Release whatever `bootstrap` acquired. Called after failures too.
    async fn shutdown(&self);
}

type Flight = Shared<BoxFuture<'static, Result<ProxyHandle, ProxyError>>>;

struct Inner {
    state: ProxyState,
    handle: Option<ProxyHandle>,
    flight: Option<Flight>,
    task: Option<AbortHandle>,
    /// Bumped by `stop()`; a flight from an older generation may not
    /// write state.
    generation: u64,
}

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Single-flight proxy supervisor.
///
/// Concurrent `start()` calls while a bootstrap runs all await the same
/// shared future, so the backend bootstraps exactly once per cycle.
pub struct ProxySupervisor<B> {
    backend: Arc<B>,
    attestor: Arc<dyn Attestor>,
    bootstrap_timeout: Duration,
    inner: Arc<Mutex<Inner>>,
}

impl<B: ProxyBackend> ProxySupervisor<B> {
    #[must_use]
    pub fn new(backend: B, attestor: Arc<dyn Attestor>, bootstrap_timeout: Duration) -> Self {
        Self {
            backend: Arc::new(backend),
            attestor,
            bootstrap_timeout,
            inner: Arc::new(Mutex::new(Inner {
                state: ProxyState::Disconnected,
                handle: None,
                flight: None,
                task: None,
                generation: 0,
            })),
        }
    }

    #[must_use]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Run one bootstrap in its own task. The task reaches a final state
    /// whether or not anyone still awaits the flight.
    fn launch(&self, generation: u64) -> (Flight, AbortHandle) {
        let backend = Arc::clone(&self.backend);
        let inner = Arc::clone(&self.inner);
        let limit = self.bootstrap_timeout;

        let task = tokio::spawn(async move {
            let bootstrap = AssertUnwindSafe(backend.bootstrap()).catch_unwind();
            let result = match tokio::time::timeout(limit, bootstrap).await {
                Ok(Ok(Ok(endpoint))) => Ok(ProxyHandle { endpoint }),
                Ok(Ok(Err(e))) => Err(e),
                Ok(Err(_)) => Err(ProxyError::Launch("bootstrap panicked".into())),
                Err(_) => Err(ProxyError::BootstrapTimeout(limit)),
            };

            let current = lock(&inner).generation == generation;
            if !current {
                debug!("Discarding result of a bootstrap cancelled by stop()");
                return Err(ProxyError::Stopped);
            }

            if let Err(e) = &result {
                warn!("Proxy bootstrap failed: {}", e);
                backend.shutdown().await;
            }

            let mut guard = lock(&inner);
            if guard.generation != generation {
                return Err(ProxyError::Stopped);
            }
            guard.flight = None;
            guard.task = None;
            match &result {
                Ok(handle) => {
                    info!("Proxy ready at {}", handle.endpoint);
                    guard.state = ProxyState::Connected;
                    guard.handle = Some(handle.clone());
                }
                Err(e) => {
                    guard.state = ProxyState::Failed(e.clone());
                    guard.handle = None;
                }
            }
            result
        });

        let abort = task.abort_handle();
        let flight = async move {
            match task.await {
                Ok(result) => result,
                Err(e) if e.is_cancelled() => Err(ProxyError::Stopped),
                Err(e) => Err(ProxyError::Launch(format!("bootstrap task failed: {e}"))),
            }
        }
        .boxed()
        .shared();
        (flight, abort)
    }
}

#[async_trait]
impl<B: ProxyBackend> ProxyLifecycleManager for ProxySupervisor<B> {
    async fn start(&self) -> Result<ProxyHandle, ProxyError> {
        let flight = {
            let mut inner = lock(&self.inner);
            if let (ProxyState::Connected, Some(handle)) = (&inner.state, &inner.handle) {
                return Ok(handle.clone());
            }
            if let Some(flight) = inner.flight.clone() {
                debug!("Joining proxy bootstrap already in progress");
                flight
            } else {
                info!("Bootstrapping proxy");
                let (flight, task) = self.launch(inner.generation);
                inner.state = ProxyState::Bootstrapping;
                inner.handle = None;
                inner.flight = Some(flight.clone());
                inner.task = Some(task);
                flight
            }
        };
        flight.await
    }

    async fn check_live(&self) -> bool {
        let endpoint = {
            let inner = lock(&self.inner);
            match (&inner.state, &inner.handle) {
                (ProxyState::Connected, Some(handle)) => handle.endpoint.clone(),
                _ => return false,
            }
        };

        match self.attestor.attest(&endpoint).await {
            Ok(attestation) if attestation.is_tor => true,
            Ok(attestation) => {
                warn!(
                    "Proxy at {} is open but egress is not anonymized (exit IP {})",
                    endpoint,
                    attestation.ip.as_deref().unwrap_or("unknown")
                );
                false
            }
            Err(e) => {
                warn!("Proxy attestation failed: {}", e);
                false
            }
        }
    }

    async fn stop(&self) {
        {
            let mut inner = lock(&self.inner);
            inner.generation += 1;
            inner.flight = None;
            if let Some(task) = inner.task.take() {
                task.abort();
            }
            inner.handle = None;
            inner.state = ProxyState::Disconnected;
        }
        self.backend.shutdown().await;
        info!("Proxy stopped");
    }

    fn state(&self) -> ProxyState {
        lock(&self.inner).state.clone()
    }
}
