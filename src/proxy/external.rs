//! Backend for a Tor daemon managed outside this process

use super::{Attestor, ProxyBackend, ProxyEndpoint, ProxyError};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info};

/// Health-checked external daemon.
///
/// Bootstrap polls until the SOCKS port accepts connections and the
/// attestor confirms anonymized egress. A daemon that answers but exits
/// in the clear fails immediately instead of being retried. The
/// supervisor's deadline bounds the polling.
pub struct ExternalDaemon {
    endpoint: ProxyEndpoint,
    attestor: Arc<dyn Attestor>,
    poll_interval: Duration,
}

impl ExternalDaemon {
    #[must_use]
    pub fn new(endpoint: ProxyEndpoint, attestor: Arc<dyn Attestor>) -> Self {
        Self {
            endpoint,
            attestor,
            poll_interval: Duration::from_secs(2),
        }
    }

    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

#[async_trait]
impl ProxyBackend for ExternalDaemon {
    async fn bootstrap(&self) -> Result<ProxyEndpoint, ProxyError> {
        let addr = (self.endpoint.host.as_str(), self.endpoint.port);
        loop {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    drop(stream);
                    match self.attestor.attest(&self.endpoint).await {
                        Ok(a) if a.is_tor => {
                            info!("External proxy at {} attested", self.endpoint);
                            return Ok(self.endpoint.clone());
                        }
                        Ok(a) => {
                            return Err(ProxyError::NotAnonymous(format!(
                                "exit address {} is not a Tor exit",
                                a.ip.as_deref().unwrap_or("unknown")
                            )));
                        }
                        Err(e) => debug!("Proxy not attested yet: {}", e),
                    }
                }
                Err(e) => debug!("SOCKS port {} not accepting yet: {}", self.endpoint, e),
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn shutdown(&self) {
        debug!("External proxy at {} is not ours to stop", self.endpoint);
    }
}
