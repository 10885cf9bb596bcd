//! Service configuration.
//!
//! Loaded from a TOML file, then overridden from the environment:
//!
//! - `TRIPWIRE_SERVICE_ACCOUNT`: bot login directives must mention
//! - `TRIPWIRE_RETEST_ALLOWLIST`: comma-separated logins allowed to request retests
//! - `TRIPWIRE_DEFAULT_TIMEOUT_SECS`: build timeout for backends without their own

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::domain::ConfigError;

pub const DEFAULT_SERVICE_ACCOUNT: &str = "tripwire";
pub const DEFAULT_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_PUBLISH_TOPIC: &str = "build.completed";

/// One configured build backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Program and arguments
    #[serde(default)]
    pub command: Vec<String>,
    /// Overrides `default_timeout_secs`
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

fn default_enabled() -> bool {
    true
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub service_account: String,
    pub retest_allowlist: Vec<String>,
    pub default_timeout_secs: u64,
    pub publish_topic: String,
    pub backends: Vec<BackendConfig>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            service_account: DEFAULT_SERVICE_ACCOUNT.to_string(),
            retest_allowlist: Vec::new(),
            default_timeout_secs: DEFAULT_TIMEOUT_SECS,
            publish_topic: DEFAULT_PUBLISH_TOPIC.to_string(),
            backends: Vec::new(),
        }
    }
}

impl ServiceConfig {
    /// Parse TOML text. Does not consult the environment.
    pub fn from_toml_str(text: &str, origin: &str) -> Result<Self, ConfigError> {
        let config: ServiceConfig = toml::from_str(text).map_err(|e| ConfigError::Parse {
            path: origin.to_string(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` (defaults when `None` or the file is absent), apply
    /// environment overrides, and validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) if p.exists() => {
                let text = std::fs::read_to_string(p).map_err(|e| ConfigError::Io {
                    path: p.display().to_string(),
                    source: e,
                })?;
                info!(path = %p.display(), "loading service config");
                toml::from_str(&text).map_err(|e| ConfigError::Parse {
                    path: p.display().to_string(),
                    source: e,
                })?
            }
            Some(p) => {
                debug!(path = %p.display(), "config file not found, using defaults");
                ServiceConfig::default()
            }
            None => ServiceConfig::default(),
        };
        config.apply_overrides(|var| std::env::var(var).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `TRIPWIRE_*` overrides using `lookup` to read variables.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(account) = lookup("TRIPWIRE_SERVICE_ACCOUNT") {
            self.service_account = account.trim().to_string();
        }
        if let Some(list) = lookup("TRIPWIRE_RETEST_ALLOWLIST") {
            self.retest_allowlist = list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(raw) = lookup("TRIPWIRE_DEFAULT_TIMEOUT_SECS") {
            self.default_timeout_secs =
                raw.trim()
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue {
                        var: "TRIPWIRE_DEFAULT_TIMEOUT_SECS".to_string(),
                        value: raw.clone(),
                    })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_account.trim().is_empty() {
            return Err(ConfigError::EmptyServiceAccount);
        }
        let mut seen = HashSet::new();
        for backend in &self.backends {
            if !seen.insert(backend.name.as_str()) {
                return Err(ConfigError::DuplicateBackend(backend.name.clone()));
            }
            if backend.enabled && backend.command.is_empty() {
                return Err(ConfigError::EmptyCommand(backend.name.clone()));
            }
        }
        Ok(())
    }

    /// Whether `login` may request retests on changes it did not author.
    pub fn is_allowlisted(&self, login: &str) -> bool {
        self.retest_allowlist
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(login))
    }

    /// Timeout for a backend, falling back to `default_timeout_secs`.
    pub fn timeout_for(&self, backend: &str) -> Duration {
        let secs = self
            .backends
            .iter()
            .find(|b| b.name == backend)
            .and_then(|b| b.timeout_secs)
            .unwrap_or(self.default_timeout_secs);
        Duration::from_secs(secs)
    }

    pub fn enabled_backends(&self) -> impl Iterator<Item = &BackendConfig> {
        self.backends.iter().filter(|b| b.enabled)
    }
}
