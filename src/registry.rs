//! Integration registry.
//!
//! The [`Registry`] maps integration names to their instances. It is filled
//! once at start-up and then shared (behind an `Arc`) by every request.
//!
//! Names are listed in lexicographic order, which is also the order events
//! are dispatched in.

use crate::integrations::Integration;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Prefix reserved for integrations registered by tests.
pub const TEST_ONLY_PREFIX: &str = "test-only-integration-";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegistryError {
    #[error("integration '{0}' is already registered")]
    Duplicate(String),
}

/// Thread-safe catalogue of integrations keyed by name.
#[derive(Default)]
pub struct Registry {
    integrations: Mutex<BTreeMap<String, Arc<dyn Integration>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an integration, failing if the name is taken.
    ///
    /// An existing registration is never overwritten.
    pub fn try_register(
        &self,
        name: impl Into<String>,
        integration: Arc<dyn Integration>,
    ) -> Result<(), RegistryError> {
        let name = name.into();
        let mut integrations = self.integrations.lock();

        if integrations.contains_key(&name) {
            return Err(RegistryError::Duplicate(name));
        }

        debug!(integration = %name, "Registering integration");
        integrations.insert(name, integration);
        Ok(())
    }

    /// Register an integration.
    ///
    /// # Panics
    ///
    /// If the name is already registered. A duplicate is a programming error
    /// and the process must not start with an ambiguous registry.
    pub fn register(&self, name: impl Into<String>, integration: Arc<dyn Integration>) {
        if let Err(e) = self.try_register(name, integration) {
            panic!("{}", e);
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Integration>> {
        self.integrations.lock().get(name).cloned()
    }

    /// All registered names, sorted.
    pub fn list(&self) -> Vec<String> {
        self.integrations.lock().keys().cloned().collect()
    }

    /// Remove an integration. Only meant for tests.
    pub fn remove(&self, name: &str) -> Option<Arc<dyn Integration>> {
        if !name.starts_with(TEST_ONLY_PREFIX) {
            warn!(integration = %name, "Removing an integration is only meant for tests");
        }
        self.integrations.lock().remove(name)
    }

    pub fn len(&self) -> usize {
        self.integrations.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.integrations.lock().is_empty()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("integrations", &self.list())
            .finish()
    }
}
