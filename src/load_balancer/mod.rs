// src/load_balancer/mod.rs
mod algorithm;
mod round_robin;

pub use algorithm::LoadBalancer;
pub use round_robin::RoundRobinBalancer;

use std::sync::Arc;

pub fn create_load_balancer() -> Arc<dyn LoadBalancer> {
    Arc::new(RoundRobinBalancer::new())
}
