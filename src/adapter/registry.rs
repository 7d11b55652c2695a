//! Backend-type → adapter lookup
//!
//! Populated once at startup and then only read, so the lifecycle manager can
//! stay ignorant of which concrete backends exist.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::join_all;

use super::IsolationAdapter;

/// In-memory map from backend type string to adapter
#[derive(Default, Clone)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn IsolationAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under its own backend type
    ///
    /// A later registration for the same type replaces the earlier one.
    pub fn register(&mut self, adapter: Arc<dyn IsolationAdapter>) {
        let backend = adapter.backend_type().to_string();
        if self.adapters.insert(backend.clone(), adapter).is_some() {
            tracing::warn!(backend = %backend, "adapter re-registered, previous instance replaced");
        }
    }

    pub fn get(&self, backend_type: &str) -> Option<Arc<dyn IsolationAdapter>> {
        self.adapters.get(backend_type).cloned()
    }

    /// Every registered backend type, sorted
    pub fn types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.adapters.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn adapters(&self) -> impl Iterator<Item = &Arc<dyn IsolationAdapter>> {
        self.adapters.values()
    }

    /// Probe every adapter concurrently and return the types that answered yes
    pub async fn available_types(&self) -> Vec<String> {
        let probes = self.adapters.iter().map(|(backend, adapter)| async move {
            let available = adapter.is_available().await;
            tracing::debug!(backend = %backend, available, "availability probe");
            (backend.clone(), available)
        });

        let mut available: Vec<String> = join_all(probes)
            .await
            .into_iter()
            .filter_map(|(backend, ok)| ok.then_some(backend))
            .collect();
        available.sort();
        available
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("types", &self.types())
            .finish()
    }
}
