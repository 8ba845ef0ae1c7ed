// src/load_balancer/algorithm.rs
use crate::proxy::{Backend, BackendPool};
use std::sync::Arc;

/// Picks the backend for the next forwarded request.
pub trait LoadBalancer: Send + Sync {
    /// Returns the chosen backend with its index in the pool, or `None` when
    /// no backend is currently available.
    fn select_backend(&self, pool: &BackendPool) -> Option<(Arc<Backend>, usize)>;

    fn name(&self) -> &'static str;
}
