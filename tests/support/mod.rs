//! Test doubles for the verifier's collaborators.
//!
//! - `ScriptedProbe` answers from a script and counts its calls; a
//!   hanging probe holds a `TransportHandle` that records whether it
//!   was dropped
//! - `TestBackend` is a proxy backend that can be told to hang
//! - `CountingProxy` wraps the real supervisor and counts calls
//! - `RecordingSurface` and `MemorySink` record what they are given

#![allow(dead_code)]

use async_trait::async_trait;
use onion_onboard::proxy::{
    Attestation, Attestor, ProxyBackend, ProxyEndpoint, ProxyError, ProxyHandle,
    ProxyLifecycleManager, ProxyState, ProxySupervisor,
};
use onion_onboard::{
    AttemptId, AttemptState, ChallengeCoordinator, ChallengeSurface, ConnectionVerifier,
    CredentialSink, ProbeError, ProbeOutcome, ProbeRequest, ProviderRegistry, RemoteProbe,
    VerifiedCredential, VerifierSettings,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ── Probe ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum ProbeStep {
    Answer(ProbeOutcome),
    Fail(ProbeError),
    /// Open a transport handle and never answer.
    Hang,
    Panic,
}

/// Stands in for a network connection; records when it is dropped.
pub struct TransportHandle {
    closed: Arc<AtomicBool>,
}

impl Drop for TransportHandle {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct ScriptedProbe {
    script: Mutex<VecDeque<ProbeStep>>,
    pub requests: Mutex<Vec<ProbeRequest>>,
    pub handles_opened: AtomicUsize,
    pub handle_closed: Arc<AtomicBool>,
}

impl ScriptedProbe {
    /// Answer each call with the next step; the last one repeats.
    pub fn new(steps: Vec<ProbeStep>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(steps.into()),
            ..Self::default()
        })
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn last_request(&self) -> Option<ProbeRequest> {
        self.requests.lock().unwrap().last().cloned()
    }

    fn next_step(&self) -> ProbeStep {
        let mut script = self.script.lock().unwrap();
        if script.len() > 1 {
            script.pop_front().unwrap()
        } else {
            script
                .front()
                .cloned()
                .unwrap_or(ProbeStep::Answer(ProbeOutcome::accepted()))
        }
    }
}

#[async_trait]
impl RemoteProbe for ScriptedProbe {
    async fn probe(&self, request: ProbeRequest) -> Result<ProbeOutcome, ProbeError> {
        self.requests.lock().unwrap().push(request);
        match self.next_step() {
            ProbeStep::Answer(outcome) => Ok(outcome),
            ProbeStep::Fail(err) => Err(err),
            ProbeStep::Hang => {
                self.handles_opened.fetch_add(1, Ordering::SeqCst);
                let _handle = TransportHandle {
                    closed: Arc::clone(&self.handle_closed),
                };
                std::future::pending::<()>().await;
                unreachable!()
            }
            ProbeStep::Panic => panic!("probe exploded"),
        }
    }
}

// ── Proxy ──────────────────────────────────────────────────────────

#[derive(Default)]
pub struct TestBackend {
    pub bootstraps: AtomicUsize,
    pub hang: AtomicBool,
}

#[async_trait]
impl ProxyBackend for TestBackend {
    async fn bootstrap(&self) -> Result<ProxyEndpoint, ProxyError> {
        self.bootstraps.fetch_add(1, Ordering::SeqCst);
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(ProxyEndpoint::new("127.0.0.1", 9050))
    }

    async fn shutdown(&self) {}
}

pub struct SwitchAttestor {
    pub is_tor: AtomicBool,
}

#[async_trait]
impl Attestor for SwitchAttestor {
    async fn attest(&self, _endpoint: &ProxyEndpoint) -> Result<Attestation, ProxyError> {
        Ok(Attestation {
            is_tor: self.is_tor.load(Ordering::SeqCst),
            ip: Some("203.0.113.9".to_string()),
        })
    }
}

/// The real supervisor, with call counters in front of it.
pub struct CountingProxy {
    pub inner: ProxySupervisor<TestBackend>,
    pub starts: AtomicUsize,
    pub live_checks: AtomicUsize,
}

impl CountingProxy {
    pub fn calls(&self) -> usize {
        self.starts.load(Ordering::SeqCst) + self.live_checks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProxyLifecycleManager for CountingProxy {
    async fn start(&self) -> Result<ProxyHandle, ProxyError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.inner.start().await
    }

    async fn check_live(&self) -> bool {
        self.live_checks.fetch_add(1, Ordering::SeqCst);
        self.inner.check_live().await
    }

    async fn stop(&self) {
        self.inner.stop().await;
    }

    fn state(&self) -> ProxyState {
        self.inner.state()
    }
}

// ── Challenge surface and credential sink ─────────────────────────

#[derive(Default)]
pub struct RecordingSurface {
    pub opened: Mutex<Vec<(AttemptId, String)>>,
    pub closed: Mutex<Vec<AttemptId>>,
}

impl ChallengeSurface for RecordingSurface {
    fn open(&self, attempt_id: AttemptId, url: &str) {
        self.opened.lock().unwrap().push((attempt_id, url.to_string()));
    }

    fn close(&self, attempt_id: AttemptId) {
        self.closed.lock().unwrap().push(attempt_id);
    }
}

#[derive(Default)]
pub struct MemorySink {
    pub stored: Mutex<Vec<VerifiedCredential>>,
}

#[async_trait]
impl CredentialSink for MemorySink {
    async fn store(&self, credential: VerifiedCredential) -> onion_onboard::Result<()> {
        self.stored.lock().unwrap().push(credential);
        Ok(())
    }
}

// ── Harness ────────────────────────────────────────────────────────

pub const BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(60);
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(15);
pub const CHALLENGE_GRACE: Duration = Duration::from_secs(300);
pub const OUTCOME_RETENTION: Duration = Duration::from_secs(600);

pub struct Harness {
    pub verifier: ConnectionVerifier,
    pub probe: Arc<ScriptedProbe>,
    pub attestor: Arc<SwitchAttestor>,
    pub proxy: Arc<CountingProxy>,
    pub surface: Arc<RecordingSurface>,
    pub sink: Arc<MemorySink>,
    pub challenges: Arc<ChallengeCoordinator>,
}

impl Harness {
    pub fn new(steps: Vec<ProbeStep>) -> Self {
        let probe = ScriptedProbe::new(steps);
        let attestor = Arc::new(SwitchAttestor {
            is_tor: AtomicBool::new(true),
        });
        let proxy = Arc::new(CountingProxy {
            inner: ProxySupervisor::new(
                TestBackend::default(),
                Arc::clone(&attestor) as Arc<dyn Attestor>,
                BOOTSTRAP_TIMEOUT,
            ),
            starts: AtomicUsize::new(0),
            live_checks: AtomicUsize::new(0),
        });
        let surface = Arc::new(RecordingSurface::default());
        let challenges = Arc::new(ChallengeCoordinator::new(
            Arc::clone(&surface) as Arc<dyn ChallengeSurface>,
            CHALLENGE_GRACE,
        ));
        let sink = Arc::new(MemorySink::default());

        let verifier = ConnectionVerifier::with_sink(
            ProviderRegistry::builtin().unwrap(),
            Arc::clone(&proxy) as Arc<dyn ProxyLifecycleManager>,
            Arc::clone(&probe) as Arc<dyn RemoteProbe>,
            Arc::clone(&challenges),
            VerifierSettings {
                probe_timeout: PROBE_TIMEOUT,
                require_attestation: true,
                outcome_retention: OUTCOME_RETENTION,
            },
            Arc::clone(&sink) as Arc<dyn CredentialSink>,
        );

        Self {
            verifier,
            probe,
            attestor,
            proxy,
            surface,
            sink,
            challenges,
        }
    }

    pub fn backend(&self) -> &TestBackend {
        self.proxy.inner.backend()
    }

    /// Yield until the attempt for `email` reaches `state`.
    pub async fn wait_for_state(&self, email: &str, state: AttemptState) {
        for _ in 0..1000 {
            if self
                .verifier
                .attempt(email)
                .is_some_and(|a| a.state == state)
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("attempt for {email} never reached {state:?}");
    }
}
