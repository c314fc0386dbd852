//! Onboarding configuration

use crate::error::{Error, Result};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Attestation endpoint answering `{"IsTor": bool, "IP": "..."}`.
pub const DEFAULT_ATTESTATION_URL: &str = "https://check.torproject.org/api/ip";

/// How the local anonymizing proxy is managed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProxyMode {
    /// A Tor daemon someone else runs; we only health-check it.
    #[default]
    External,
    /// A `tor` child process we launch and supervise.
    Embedded,
}

impl FromStr for ProxyMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "external" | "daemon" => Ok(Self::External),
            "embedded" | "process" => Ok(Self::Embedded),
            other => Err(Error::Config(format!("Unknown proxy mode: {other}"))),
        }
    }
}

/// Configuration for the onboarding subsystem
#[derive(Debug, Clone)]
pub struct OnboardConfig {
    pub socks_host: String,
    pub socks_port: u16,
    pub proxy_mode: ProxyMode,
    pub tor_binary: PathBuf,
    pub tor_data_dir: Option<PathBuf>,
    pub attestation_url: String,
    pub bootstrap_timeout: Duration,
    pub probe_timeout: Duration,
    pub challenge_grace: Duration,
    pub providers_file: Option<PathBuf>,
    pub require_attestation: bool,
}

impl Default for OnboardConfig {
    fn default() -> Self {
        Self {
            socks_host: "127.0.0.1".to_string(),
            socks_port: 9050,
            proxy_mode: ProxyMode::External,
            tor_binary: PathBuf::from("tor"),
            tor_data_dir: None,
            attestation_url: DEFAULT_ATTESTATION_URL.to_string(),
            bootstrap_timeout: Duration::from_secs(60),
            probe_timeout: Duration::from_secs(15),
            challenge_grace: Duration::from_secs(300),
            providers_file: None,
            require_attestation: true,
        }
    }
}

impl OnboardConfig {
    /// Load configuration from environment variables
    ///
    /// Reads from `.env` file if present. Every variable is optional:
    /// - `ONBOARD_SOCKS_HOST` (default: `127.0.0.1`)
    /// - `ONBOARD_SOCKS_PORT` (default: `9050`)
    /// - `ONBOARD_PROXY_MODE` (`external` or `embedded`, default: `external`)
    /// - `ONBOARD_TOR_BINARY` (default: `tor`)
    /// - `ONBOARD_TOR_DATA_DIR`
    /// - `ONBOARD_ATTESTATION_URL`
    /// - `ONBOARD_BOOTSTRAP_TIMEOUT_SECS` (default: `60`)
    /// - `ONBOARD_PROBE_TIMEOUT_SECS` (default: `15`)
    /// - `ONBOARD_CHALLENGE_GRACE_SECS` (default: `300`)
    /// - `ONBOARD_PROVIDERS_FILE` (replaces the built-in provider table)
    /// - `ONBOARD_REQUIRE_ATTESTATION` (default: `true`)
    ///
    /// # Errors
    ///
    /// Returns a configuration error if a variable is set to a value that
    /// does not parse.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if a looked-up value does not parse.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let secs = |key: &str, default: Duration| -> Result<Duration> {
            lookup(key).map_or(Ok(default), |raw| {
                raw.trim()
                    .parse::<u64>()
                    .map(Duration::from_secs)
                    .map_err(|e| Error::Config(format!("Invalid {key}: {e}")))
            })
        };

        Ok(Self {
            socks_host: lookup("ONBOARD_SOCKS_HOST").unwrap_or(defaults.socks_host),
            socks_port: lookup("ONBOARD_SOCKS_PORT")
                .map_or(Ok(defaults.socks_port), |p| p.trim().parse())
                .map_err(|e| Error::Config(format!("Invalid ONBOARD_SOCKS_PORT: {e}")))?,
            proxy_mode: lookup("ONBOARD_PROXY_MODE")
                .map_or(Ok(defaults.proxy_mode), |m| m.parse())?,
            tor_binary: lookup("ONBOARD_TOR_BINARY").map_or(defaults.tor_binary, PathBuf::from),
            tor_data_dir: lookup("ONBOARD_TOR_DATA_DIR").map(PathBuf::from),
            attestation_url: lookup("ONBOARD_ATTESTATION_URL").unwrap_or(defaults.attestation_url),
            bootstrap_timeout: secs("ONBOARD_BOOTSTRAP_TIMEOUT_SECS", defaults.bootstrap_timeout)?,
            probe_timeout: secs("ONBOARD_PROBE_TIMEOUT_SECS", defaults.probe_timeout)?,
            challenge_grace: secs("ONBOARD_CHALLENGE_GRACE_SECS", defaults.challenge_grace)?,
            providers_file: lookup("ONBOARD_PROVIDERS_FILE").map(PathBuf::from),
            require_attestation: lookup("ONBOARD_REQUIRE_ATTESTATION")
                .map_or(Ok(defaults.require_attestation), |v| parse_bool(&v))?,
        })
    }
}

fn parse_bool(raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(Error::Config(format!(
            "Invalid ONBOARD_REQUIRE_ATTESTATION: {other}"
        ))),
    }
}
