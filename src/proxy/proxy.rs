// ────────────────────────────────
// src/proxy/proxy.rs
// Wires the pool, scheduler, health checker, workers and acceptor together.
// ────────────────────────────────

use crate::config::Config;
use crate::health::HealthChecker;
use crate::load_balancer::{create_load_balancer, LoadBalancer};
use crate::metrics::MetricsCollector;
use crate::proxy::worker::{ForwardingWorker, WorkItem};
use crate::proxy::BackendPool;
use crate::server::{Acceptor, ResponseError};
use anyhow::Result;
use hyper::StatusCode;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tracing::info;

pub struct Proxy {
    config: Config,
    pool: BackendPool,
    balancer: Arc<dyn LoadBalancer>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl Proxy {
    pub fn new(config: Config, pool: BackendPool, metrics: Option<Arc<MetricsCollector>>) -> Self {
        if let Some(metrics) = &metrics {
            metrics.update_backend_counts(pool.healthy_count(), pool.len());
        }
        Self {
            config,
            pool,
            balancer: create_load_balancer(),
            metrics,
        }
    }

    pub fn pool(&self) -> &BackendPool {
        &self.pool
    }

    /// Spawns the background prober unless health checks are disabled.
    pub fn start_health_checker(&self) -> Result<()> {
        if !self.config.health_check.enabled {
            info!("Health checks disabled");
            return Ok(());
        }
        let checker = Arc::new(HealthChecker::new(
            self.config.health_check.clone(),
            self.pool.clone(),
            self.metrics.clone(),
        )?);
        tokio::spawn(checker.start());
        Ok(())
    }

    /// Spawns the forwarding workers and returns the producer side of the
    /// dispatch queue.
    pub fn start_workers(&self) -> mpsc::Sender<WorkItem> {
        let forwarding = &self.config.forwarding;
        let (tx, rx) = mpsc::channel(forwarding.queue_capacity);
        let queue = Arc::new(Mutex::new(rx));

        for id in 0..forwarding.workers {
            let worker = ForwardingWorker::new(
                id,
                self.pool.clone(),
                self.balancer.clone(),
                forwarding.timeout(),
                self.metrics.clone(),
            );
            tokio::spawn(worker.run(queue.clone()));
        }

        info!(
            "Started {} forwarding worker(s) using {} scheduling",
            forwarding.workers,
            self.balancer.name()
        );
        tx
    }

    /// Starts the workers and accepts connections forever.
    pub async fn serve(&self, listener: TcpListener) {
        let dispatch = self.start_workers();
        Acceptor::new(
            dispatch,
            self.config.forwarding.request_read_timeout(),
            self.config.forwarding.max_body_bytes,
            self.metrics.clone(),
        )
        .run(listener)
        .await;
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("No healthy backends available")]
    NoHealthyBackends,

    #[error("Backend error: {0}")]
    BackendError(String),

    #[error("Request timeout")]
    Timeout,

    #[error("Cannot rebuild request: {0}")]
    RequestBuild(String),

    #[error("Client response failed: {0}")]
    Response(#[from] ResponseError),
}

impl ProxyError {
    /// Status and fixed plain-text body the proxy sends for this error.
    pub fn status_and_message(&self) -> (StatusCode, &'static str) {
        match self {
            ProxyError::NoHealthyBackends => {
                (StatusCode::SERVICE_UNAVAILABLE, "No healthy backends available\n")
            }
            ProxyError::Timeout => (StatusCode::GATEWAY_TIMEOUT, "Gateway timeout\n"),
            ProxyError::BackendError(_) | ProxyError::RequestBuild(_) | ProxyError::Response(_) => {
                (StatusCode::BAD_GATEWAY, "Bad gateway\n")
            }
        }
    }
}
