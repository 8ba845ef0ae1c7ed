// src/proxy/backend.rs
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

/// One upstream target. The health flag is the only state that influences
/// scheduling; it is written by the health checker and by failed forwards.
#[derive(Debug)]
pub struct Backend {
    pub name: String,
    pub address: String,

    // Runtime state
    healthy: AtomicBool,
    total_requests: AtomicU64,
    failed_requests: AtomicU64,
    last_health_check: Mutex<Option<DateTime<Utc>>>,
}

impl Backend {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            healthy: AtomicBool::new(true),
            total_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            last_health_check: Mutex::new(None),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Stores the new flag and returns the previous one.
    pub fn set_healthy(&self, healthy: bool) -> bool {
        self.healthy.swap(healthy, Ordering::AcqRel)
    }

    /// Records a probe verdict along with the time it was taken.
    pub fn record_probe(&self, healthy: bool) -> bool {
        let was_healthy = self.set_healthy(healthy);
        let mut last = self
            .last_health_check
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *last = Some(Utc::now());
        was_healthy
    }

    pub fn last_health_check(&self) -> Option<DateTime<Utc>> {
        *self
            .last_health_check
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record_request(&self, success: bool) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.failed_requests.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn get_metrics(&self) -> BackendMetrics {
        BackendMetrics {
            healthy: self.is_healthy(),
            total_requests: self.total_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendMetrics {
    pub healthy: bool,
    pub total_requests: u64,
    pub failed_requests: u64,
}
