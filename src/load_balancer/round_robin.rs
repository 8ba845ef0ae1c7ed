// src/load_balancer/round_robin.rs
use crate::load_balancer::LoadBalancer;
use crate::proxy::{Backend, BackendPool};
use std::sync::{Arc, Mutex};

/// Round robin that skips unhealthy backends.
///
/// The cursor is the index of the last selection. It only moves when a
/// healthy backend is found, so it always stays inside the pool bounds.
pub struct RoundRobinBalancer {
    cursor: Mutex<usize>,
}

impl RoundRobinBalancer {
    pub fn new() -> Self {
        Self::with_cursor(0)
    }

    pub fn with_cursor(cursor: usize) -> Self {
        Self {
            cursor: Mutex::new(cursor),
        }
    }

    pub fn cursor(&self) -> usize {
        *self.cursor.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for RoundRobinBalancer {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancer for RoundRobinBalancer {
    fn select_backend(&self, pool: &BackendPool) -> Option<(Arc<Backend>, usize)> {
        // Uncontended with a single forwarding worker.
        let mut cursor = self.cursor.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let (backend, index) = pool.next_healthy(*cursor)?;
        *cursor = index;
        Some((backend, index))
    }

    fn name(&self) -> &'static str {
        "round_robin"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;
    use proptest::prelude::*;

    fn pool(n: usize) -> BackendPool {
        BackendPool::new(
            (0..n)
                .map(|i| BackendConfig::new(format!("b{i}"), format!("127.0.0.1:{}", 9000 + i)))
                .collect(),
        )
    }

    #[test]
    fn rotates_through_all_healthy_backends() {
        let pool = pool(3);
        let balancer = RoundRobinBalancer::new();
        let picks: Vec<usize> = (0..6)
            .map(|_| balancer.select_backend(&pool).unwrap().1)
            .collect();
        assert_eq!(picks, vec![1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn keeps_cursor_when_nothing_is_healthy() {
        let pool = pool(2);
        let balancer = RoundRobinBalancer::with_cursor(1);
        pool.mark_unhealthy(0);
        pool.mark_unhealthy(1);
        assert!(balancer.select_backend(&pool).is_none());
        assert_eq!(balancer.cursor(), 1);
    }

    #[test]
    fn failed_backend_leaves_rotation_until_recovered() {
        let pool = pool(3);
        let balancer = RoundRobinBalancer::new();
        pool.mark_unhealthy(2);
        let picks: Vec<usize> = (0..4)
            .map(|_| balancer.select_backend(&pool).unwrap().1)
            .collect();
        assert_eq!(picks, vec![1, 0, 1, 0]);

        pool.set_health(2, true);
        assert_eq!(balancer.select_backend(&pool).unwrap().1, 1);
        assert_eq!(balancer.select_backend(&pool).unwrap().1, 2);
    }

    proptest! {
        #[test]
        fn visits_only_healthy_backends_in_a_fixed_cycle(
            health in prop::collection::vec(any::<bool>(), 1..12),
            start in 0usize..12,
        ) {
            let pool = pool(health.len());
            for (index, healthy) in health.iter().enumerate() {
                pool.set_health(index, *healthy);
            }
            let balancer = RoundRobinBalancer::with_cursor(start % health.len());
            let k = health.iter().filter(|h| **h).count();

            if k == 0 {
                prop_assert!(balancer.select_backend(&pool).is_none());
                return Ok(());
            }

            let picks: Vec<usize> = (0..k * 3)
                .map(|_| balancer.select_backend(&pool).unwrap().1)
                .collect();

            for &index in &picks {
                prop_assert!(health[index]);
                prop_assert!(balancer.cursor() < health.len());
            }
            // First k picks are distinct and the sequence repeats every k.
            let mut first: Vec<usize> = picks[..k].to_vec();
            first.sort_unstable();
            first.dedup();
            prop_assert_eq!(first.len(), k);
            for i in k..picks.len() {
                prop_assert_eq!(picks[i], picks[i - k]);
            }
        }
    }
}
