//! Provider capability table
//!
//! Maps an email address to the IMAP endpoint and challenge
//! requirements of its provider. The table is a single JSON document:
//! either the built-in one or a file named by configuration, never a
//! merge of both. Lookups are pure; nothing here touches the network.

use crate::config::OnboardConfig;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use tracing::debug;

const BUILTIN_TABLE: &str = include_str!("providers.json");

/// Id of the fallback profile returned for unknown domains.
pub const UNSUPPORTED_ID: &str = "unsupported";

/// What a provider demands before a programmatic login can succeed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeKind {
    /// Plain IMAP login works.
    #[default]
    None,
    /// A human must pass a web challenge first.
    Captcha,
    /// The provider is only reachable through a client-side bridge.
    BridgeRequired,
}

impl fmt::Display for ChallengeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::Captcha => "captcha",
            Self::BridgeRequired => "bridge_required",
        })
    }
}

/// Connection parameters for one provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderProfile {
    pub id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub domains: Vec<String>,
    pub host: String,
    pub port: u16,
    #[serde(default = "default_use_tls")]
    pub use_tls: bool,
    #[serde(default)]
    pub challenge_kind: ChallengeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub challenge_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bridge_instructions: Option<String>,
}

const fn default_use_tls() -> bool {
    true
}

impl ProviderProfile {
    /// The profile returned when no table entry matches.
    #[must_use]
    pub fn unsupported() -> Self {
        Self {
            id: UNSUPPORTED_ID.to_string(),
            display_name: "Unsupported provider".to_string(),
            domains: Vec::new(),
            host: String::new(),
            port: 0,
            use_tls: true,
            challenge_kind: ChallengeKind::None,
            challenge_url: None,
            bridge_instructions: None,
        }
    }

    #[must_use]
    pub fn is_supported(&self) -> bool {
        self.id != UNSUPPORTED_ID
    }
}

#[derive(Deserialize)]
struct ProviderTable {
    providers: Vec<ProviderProfile>,
}

/// Case-insensitive lookup of provider profiles.
///
/// # Examples
///
/// ```
/// use onion_onboard::{ChallengeKind, ProviderRegistry};
///
/// let registry = ProviderRegistry::builtin().unwrap();
///
/// let gmail = registry.resolve_provider("Someone@GMail.com");
/// assert_eq!(gmail.id, "gmail");
/// assert_eq!(gmail.challenge_kind, ChallengeKind::Captcha);
///
/// let unknown = registry.resolve_provider("someone@example.invalid");
/// assert!(!unknown.is_supported());
/// ```
#[derive(Debug, Clone)]
pub struct ProviderRegistry {
    profiles: Vec<ProviderProfile>,
    by_domain: HashMap<String, usize>,
    unsupported: ProviderProfile,
}

impl ProviderRegistry {
    /// The table compiled into the crate.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the built-in table is invalid.
    pub fn builtin() -> Result<Self> {
        Self::from_json(BUILTIN_TABLE)
    }

    /// Parse and validate a table document.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for malformed JSON, duplicate ids or
    /// domains, captcha profiles without a valid challenge URL, and bridge
    /// profiles without instructions.
    pub fn from_json(json: &str) -> Result<Self> {
        let table: ProviderTable = serde_json::from_str(json)?;
        Self::from_profiles(table.providers)
    }

    /// Read a table document from disk.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the file cannot be read or does
    /// not hold a valid table.
    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Cannot read provider table {}: {e}", path.display()))
        })?;
        Self::from_json(&json)
    }

    /// The configured table, or the built-in one when none is configured.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the selected table is invalid.
    pub fn load(config: &OnboardConfig) -> Result<Self> {
        match &config.providers_file {
            Some(path) => {
                debug!("Loading provider table from {}", path.display());
                Self::from_file(path)
            }
            None => Self::builtin(),
        }
    }

    fn from_profiles(profiles: Vec<ProviderProfile>) -> Result<Self> {
        let mut by_domain = HashMap::new();
        let mut ids = HashMap::new();

        for (index, profile) in profiles.iter().enumerate() {
            let id = profile.id.to_ascii_lowercase();
            if id.is_empty() || id == UNSUPPORTED_ID {
                return Err(Error::Config(format!("Invalid provider id '{}'", profile.id)));
            }
            if ids.insert(id, index).is_some() {
                return Err(Error::Config(format!("Duplicate provider id '{}'", profile.id)));
            }
            validate_challenge(profile)?;

            for domain in &profile.domains {
                let key = normalize_domain(domain);
                if by_domain.insert(key, index).is_some() {
                    return Err(Error::Config(format!(
                        "Domain '{domain}' is listed by more than one provider"
                    )));
                }
            }
        }

        Ok(Self {
            profiles,
            by_domain,
            unsupported: ProviderProfile::unsupported(),
        })
    }

    /// Resolve the profile serving `email`.
    ///
    /// Total: anything that does not match a known domain, including
    /// strings that are not email addresses at all, yields the
    /// [`ProviderProfile::unsupported`] profile.
    #[must_use]
    pub fn resolve_provider(&self, email: &str) -> ProviderProfile {
        email_domain(email)
            .and_then(|domain| self.by_domain.get(&domain))
            .map_or_else(|| self.unsupported.clone(), |&i| self.profiles[i].clone())
    }

    /// Resolve a profile by its id, e.g. a provider picked from a menu.
    #[must_use]
    pub fn resolve_hint(&self, hint: &str) -> Option<&ProviderProfile> {
        let hint = hint.trim();
        self.profiles.iter().find(|p| p.id.eq_ignore_ascii_case(hint))
    }

    #[must_use]
    pub fn profiles(&self) -> &[ProviderProfile] {
        &self.profiles
    }
}

fn validate_challenge(profile: &ProviderProfile) -> Result<()> {
    match profile.challenge_kind {
        ChallengeKind::Captcha => {
            let url = profile.challenge_url.as_deref().ok_or_else(|| {
                Error::Config(format!("Provider '{}' needs a challenge_url", profile.id))
            })?;
            url::Url::parse(url).map_err(|e| {
                Error::Config(format!(
                    "Provider '{}' has an invalid challenge_url: {e}",
                    profile.id
                ))
            })?;
        }
        ChallengeKind::BridgeRequired => {
            if profile.bridge_instructions.as_deref().is_none_or(str::is_empty) {
                return Err(Error::Config(format!(
                    "Provider '{}' needs bridge_instructions",
                    profile.id
                )));
            }
        }
        ChallengeKind::None => {}
    }
    Ok(())
}

fn normalize_domain(domain: &str) -> String {
    domain.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// The lower-cased domain of an address, if it has exactly one `@`
/// separating a non-empty local part from a non-empty domain.
#[must_use]
pub fn email_domain(email: &str) -> Option<String> {
    let (local, domain) = email.trim().split_once('@')?;
    if local.is_empty() || domain.is_empty() || domain.contains('@') {
        return None;
    }
    Some(normalize_domain(domain))
}
