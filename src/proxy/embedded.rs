//! Backend that launches and supervises a `tor` child process

use super::{ProxyBackend, ProxyEndpoint, ProxyError};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Embedded process supervisor.
///
/// Starts `tor` with its SOCKS listener on the configured port and logs
/// on stdout, then follows the log until it reports `Bootstrapped 100%`.
/// The child is killed on `shutdown()` and, via `kill_on_drop`, if the
/// supervisor itself goes away.
pub struct EmbeddedTor {
    binary: PathBuf,
    data_dir: Option<PathBuf>,
    endpoint: ProxyEndpoint,
    child: Mutex<Option<Child>>,
}

impl EmbeddedTor {
    #[must_use]
    pub fn new(binary: impl Into<PathBuf>, endpoint: ProxyEndpoint) -> Self {
        Self {
            binary: binary.into(),
            data_dir: None,
            endpoint,
            child: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("--SocksPort")
            .arg(format!("{}:{}", self.endpoint.host, self.endpoint.port))
            .arg("--Log")
            .arg("notice stdout");
        if let Some(dir) = &self.data_dir {
            cmd.arg("--DataDirectory").arg(dir);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl ProxyBackend for EmbeddedTor {
    async fn bootstrap(&self) -> Result<ProxyEndpoint, ProxyError> {
        let mut slot = self.child.lock().await;
        if let Some(mut stale) = slot.take() {
            stale.kill().await.ok();
        }

        let mut child = self.command().spawn().map_err(|e| {
            ProxyError::Launch(format!("cannot spawn {}: {e}", self.binary.display()))
        })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProxyError::Launch("tor stdout was not captured".into()))?;
        *slot = Some(child);
        drop(slot);

        info!("Launched {} for SOCKS {}", self.binary.display(), self.endpoint);

        let mut lines = BufReader::new(stdout).lines();
        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|e| ProxyError::Launch(format!("reading tor log: {e}")))?
        {
            if line.contains("[err]") {
                return Err(ProxyError::Launch(line));
            }
            if let Some(progress) = bootstrap_progress(&line) {
                debug!("tor bootstrap {}%", progress);
                if progress >= 100 {
                    // Keep the pipe drained so tor never blocks on a full stdout.
                    tokio::spawn(async move {
                        while let Ok(Some(line)) = lines.next_line().await {
                            debug!(target: "tor", "{}", line);
                        }
                    });
                    return Ok(self.endpoint.clone());
                }
            }
        }

        Err(ProxyError::Launch(
            "tor exited before finishing bootstrap".into(),
        ))
    }

    async fn shutdown(&self) {
        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.kill().await {
                warn!("Failed to kill tor: {}", e);
            } else {
                info!("tor process stopped");
            }
        }
    }
}

/// Percentage from a tor `Bootstrapped NN% (...)` log line.
fn bootstrap_progress(line: &str) -> Option<u8> {
    let rest = &line[line.find("Bootstrapped ")? + "Bootstrapped ".len()..];
    let digits = &rest[..rest.find('%')?];
    digits.trim().parse().ok()
}
