//
// src/proxy/pool.rs
//

use super::backend::Backend;
use crate::config::BackendConfig;
use std::sync::Arc;

/// Ordered, fixed set of backends. Entries are created once and never added
/// or removed; only their health flags change.
#[derive(Debug, Clone)]
pub struct BackendPool {
    backends: Arc<Vec<Arc<Backend>>>,
}

impl BackendPool {
    pub fn new(configs: Vec<BackendConfig>) -> Self {
        let backends = configs
            .into_iter()
            .map(|config| Arc::new(Backend::new(config.name, config.address)))
            .collect();

        Self {
            backends: Arc::new(backends),
        }
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub fn all_backends(&self) -> &[Arc<Backend>] {
        &self.backends
    }

    pub fn get(&self, index: usize) -> Option<&Arc<Backend>> {
        self.backends.get(index)
    }

    pub fn healthy_count(&self) -> usize {
        self.backends.iter().filter(|b| b.is_healthy()).count()
    }

    /// Circular scan starting one past `cursor`, covering each entry at most
    /// once. Returns the first healthy backend and its index.
    pub fn next_healthy(&self, cursor: usize) -> Option<(Arc<Backend>, usize)> {
        let len = self.backends.len();
        (1..=len)
            .map(|step| (cursor + step) % len)
            .find(|&index| self.backends[index].is_healthy())
            .map(|index| (self.backends[index].clone(), index))
    }

    pub fn set_health(&self, index: usize, healthy: bool) {
        if let Some(backend) = self.backends.get(index) {
            backend.set_healthy(healthy);
        }
    }

    pub fn mark_unhealthy(&self, index: usize) {
        self.set_health(index, false);
    }
}
