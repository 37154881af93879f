//! Registry mapping plugin identifiers to backend factories.

use std::collections::HashMap;

use serde_json::Value;
use tracing::{debug, info};

use super::{Backend, LocalBackend, MemoryBackend};
use crate::error::{Result, SyncError};
use crate::types::Role;

/// Builds a backend from its plugin configuration.
pub type BackendFactory = fn(&Value, Role) -> Result<Box<dyn Backend>>;

/// Identifier-to-factory table resolved once at startup.
#[derive(Default)]
pub struct BackendRegistry {
    factories: HashMap<String, BackendFactory>,
}

impl BackendRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `local` and `memory` plugins.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register("local", build_local);
        registry.register("memory", build_memory);
        registry
    }

    /// Registers or replaces the factory for `name`.
    pub fn register(&mut self, name: &str, factory: BackendFactory) {
        if self.factories.insert(name.to_string(), factory).is_some() {
            debug!("Replaced backend factory: {}", name);
        }
    }

    /// Whether a factory is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered identifiers, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Instantiates the backend registered under `name`.
    pub fn create(&self, name: &str, config: &Value, role: Role) -> Result<Box<dyn Backend>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| SyncError::PluginNotFound {
                name: name.to_string(),
            })?;
        info!("Loading backend plugin: {}", name);
        factory(config, role)
    }
}

fn build_local(config: &Value, role: Role) -> Result<Box<dyn Backend>> {
    let backend: Box<dyn Backend> = Box::new(LocalBackend::from_config(config, role)?);
    Ok(backend)
}

fn build_memory(config: &Value, role: Role) -> Result<Box<dyn Backend>> {
    let backend: Box<dyn Backend> = Box::new(MemoryBackend::from_config(config, role)?);
    Ok(backend)
}
