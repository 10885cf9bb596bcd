//! Build backend contract and registry.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tripwire_core::{ChangePayload, ChangeType, ServiceConfig};

use crate::command::CommandBackend;
use crate::error::{BackendError, RegistryError};

/// A build system that can test a change.
///
/// The orchestrator drives each backend through: `validate_input`, `prepare`,
/// then `build_proposal` or `build_change` by payload type. The returned JSON
/// must satisfy the build payload schema.
#[async_trait]
pub trait BuildBackend: Send + Sync {
    /// Unique name, used for job records and configuration lookup.
    fn name(&self) -> &str;

    /// Reject changes this backend cannot build.
    fn validate_input(&self, _payload: &ChangePayload) -> Result<(), BackendError> {
        Ok(())
    }

    /// Hook run before the build (checkouts, queue reservations).
    async fn prepare(&self, _payload: &ChangePayload) -> Result<(), BackendError> {
        Ok(())
    }

    /// Build an open pull request.
    async fn build_proposal(&self, payload: &ChangePayload) -> Result<Value, BackendError>;

    /// Build a pushed change.
    async fn build_change(&self, payload: &ChangePayload) -> Result<Value, BackendError>;

    /// Dispatch to `build_proposal` or `build_change` by payload type.
    async fn build(&self, payload: &ChangePayload) -> Result<Value, BackendError> {
        match payload.kind {
            ChangeType::Proposal => self.build_proposal(payload).await,
            ChangeType::Change => self.build_change(payload).await,
        }
    }
}

/// The enabled build backends, in registration order.
#[derive(Default, Clone)]
pub struct BackendRegistry {
    backends: Vec<Arc<dyn BuildBackend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one command backend per enabled `[[backends]]` entry.
    pub fn from_config(config: &ServiceConfig) -> Result<Self, RegistryError> {
        let mut registry = Self::new();
        for backend in config.enabled_backends() {
            let command = CommandBackend::new(backend.name.clone(), backend.command.clone())?;
            registry.register(Arc::new(command))?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, backend: Arc<dyn BuildBackend>) -> Result<(), RegistryError> {
        if self.get(backend.name()).is_some() {
            return Err(RegistryError::Duplicate(backend.name().to_string()));
        }
        self.backends.push(backend);
        Ok(())
    }

    pub fn with(mut self, backend: Arc<dyn BuildBackend>) -> Result<Self, RegistryError> {
        self.register(backend)?;
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn BuildBackend>> {
        self.backends.iter().find(|b| b.name() == name)
    }

    pub fn backends(&self) -> &[Arc<dyn BuildBackend>] {
        &self.backends
    }

    pub fn names(&self) -> Vec<&str> {
        self.backends.iter().map(|b| b.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("backends", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tripwire_core::BackendConfig;

    fn backend(name: &str, enabled: bool) -> BackendConfig {
        BackendConfig {
            name: name.to_string(),
            enabled,
            command: vec!["true".to_string()],
            timeout_secs: None,
        }
    }

    #[test]
    fn test_from_config_skips_disabled() {
        let config = ServiceConfig {
            backends: vec![backend("make", true), backend("lint", false), backend("docs", true)],
            ..ServiceConfig::default()
        };
        let registry = BackendRegistry::from_config(&config).unwrap();
        assert_eq!(registry.names(), vec!["make", "docs"]);
        assert!(registry.get("lint").is_none());
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let make = Arc::new(CommandBackend::new("make", vec!["make".into()]).unwrap());
        let err = BackendRegistry::new()
            .with(make.clone())
            .unwrap()
            .with(make)
            .unwrap_err();
        assert!(matches!(err, RegistryError::Duplicate(ref n) if n == "make"));
    }
}
