//! Wiring of the production components from an [`OnboardConfig`]

use crate::challenge::{ChallengeCoordinator, ChallengeSurface};
use crate::config::{OnboardConfig, ProxyMode};
use crate::error::Result;
use crate::probe::ImapProbe;
use crate::provider::ProviderRegistry;
use crate::proxy::{
    Attestor, EmbeddedTor, ExternalDaemon, ProxyEndpoint, ProxyLifecycleManager, ProxySupervisor,
    TorCheckAttestor,
};
use crate::verifier::{ConnectionVerifier, VerifierSettings};
use std::sync::Arc;
use tracing::info;

/// Build the proxy supervisor selected by `config.proxy_mode`.
#[must_use]
pub fn proxy_from_config(config: &OnboardConfig) -> Arc<dyn ProxyLifecycleManager> {
    let endpoint = ProxyEndpoint::new(config.socks_host.clone(), config.socks_port);
    let attestor: Arc<dyn Attestor> = Arc::new(TorCheckAttestor::new(
        config.attestation_url.clone(),
        config.probe_timeout,
    ));

    match config.proxy_mode {
        ProxyMode::External => {
            info!("Using external Tor daemon at {}", endpoint);
            let backend = ExternalDaemon::new(endpoint, Arc::clone(&attestor));
            Arc::new(ProxySupervisor::new(backend, attestor, config.bootstrap_timeout))
        }
        ProxyMode::Embedded => {
            info!("Using embedded {} on {}", config.tor_binary.display(), endpoint);
            let mut backend = EmbeddedTor::new(config.tor_binary.clone(), endpoint);
            if let Some(dir) = &config.tor_data_dir {
                backend = backend.with_data_dir(dir.clone());
            }
            Arc::new(ProxySupervisor::new(backend, attestor, config.bootstrap_timeout))
        }
    }
}

/// A verifier assembled from configuration, with the IMAP probe and the
/// given challenge surface.
///
/// # Errors
///
/// Returns an error if the provider table cannot be loaded or the TLS
/// configuration cannot be built.
pub fn verifier_from_config(
    config: &OnboardConfig,
    surface: Arc<dyn ChallengeSurface>,
) -> Result<ConnectionVerifier> {
    let registry = ProviderRegistry::load(config)?;
    let proxy = proxy_from_config(config);
    let probe = Arc::new(ImapProbe::new()?);
    let challenges = Arc::new(ChallengeCoordinator::new(surface, config.challenge_grace));
    let settings = VerifierSettings {
        probe_timeout: config.probe_timeout,
        require_attestation: config.require_attestation,
        ..VerifierSettings::default()
    };

    Ok(ConnectionVerifier::new(
        registry, proxy, probe, challenges, settings,
    ))
}
