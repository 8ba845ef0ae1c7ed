// src/health/checker.rs
use crate::config::HealthCheckConfig;
use crate::metrics::MetricsCollector;
use crate::proxy::{Backend, BackendPool};
use anyhow::{Context, Result};
use reqwest::Client;
use std::sync::Arc;
use tokio::time::interval;
use tracing::{debug, error, info, warn};
use url::Url;

pub struct HealthChecker {
    config: HealthCheckConfig,
    pool: BackendPool,
    client: Client,
    metrics: Option<Arc<MetricsCollector>>,
}

#[derive(Debug)]
pub struct HealthCheckResult {
    pub backend: String,
    pub healthy: bool,
    pub response_time_ms: u64,
    pub error: Option<String>,
}

impl HealthChecker {
    pub fn new(
        config: HealthCheckConfig,
        pool: BackendPool,
        metrics: Option<Arc<MetricsCollector>>,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .context("Failed to create health check HTTP client")?;

        Ok(Self {
            config,
            pool,
            client,
            metrics,
        })
    }

    /// Probes every backend once per interval, forever. The first cycle runs
    /// immediately.
    pub async fn start(self: Arc<Self>) {
        let mut interval = interval(self.config.interval());

        info!(
            "Starting health checker with interval: {:?}",
            self.config.interval()
        );

        loop {
            interval.tick().await;
            self.check_all_backends().await;
        }
    }

    pub async fn check_all_backends(&self) -> Vec<HealthCheckResult> {
        let checks = self
            .pool
            .all_backends()
            .iter()
            .map(|backend| self.check_backend(backend));
        let results = futures::future::join_all(checks).await;

        let mut healthy_count = 0;
        for (backend, result) in self.pool.all_backends().iter().zip(&results) {
            let stats = backend.get_metrics();
            if result.healthy {
                healthy_count += 1;
                debug!(
                    requests = stats.total_requests,
                    failed = stats.failed_requests,
                    "Backend {} is healthy",
                    result.backend
                );
            } else {
                warn!(
                    "Backend {} is down: {}",
                    result.backend,
                    result.error.as_deref().unwrap_or("unknown error")
                );
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics.update_backend_counts(healthy_count, self.pool.len());
        }

        debug!(
            "Health check complete: {} healthy, {} unhealthy",
            healthy_count,
            results.len() - healthy_count
        );
        results
    }

    /// Any transport-level success counts as healthy; the status code and
    /// body of the probe response are not inspected.
    pub async fn check_backend(&self, backend: &Backend) -> HealthCheckResult {
        let start = std::time::Instant::now();

        let outcome = match self.probe_url(backend) {
            Ok(url) => self
                .client
                .get(url)
                .send()
                .await
                .map(|_| ())
                .map_err(|e| {
                    if e.is_timeout() {
                        format!("probe timed out after {:?}", self.config.timeout())
                    } else {
                        e.to_string()
                    }
                }),
            Err(e) => {
                error!("Cannot build probe URL for {}: {:#}", backend.name, e);
                Err(e.to_string())
            }
        };

        let response_time_ms = start.elapsed().as_millis() as u64;
        let healthy = outcome.is_ok();
        let was_healthy = backend.record_probe(healthy);

        if let Some(metrics) = &self.metrics {
            metrics.update_backend_health(&backend.name, healthy);
        }

        if healthy && !was_healthy {
            info!("Backend {} ({}) is healthy again", backend.name, backend.address);
        } else if !healthy && was_healthy {
            info!("Backend {} ({}) marked unhealthy", backend.name, backend.address);
        }

        HealthCheckResult {
            backend: backend.name.clone(),
            healthy,
            response_time_ms,
            error: outcome.err(),
        }
    }

    fn probe_url(&self, backend: &Backend) -> Result<Url> {
        let base = Url::parse(&format!("http://{}", backend.address))
            .with_context(|| format!("invalid backend address {:?}", backend.address))?;
        Ok(base.join(&self.config.path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;
    use std::time::Duration;

    fn checker(pool: BackendPool, timeout_secs: u64) -> HealthChecker {
        let config = HealthCheckConfig {
            timeout_secs,
            ..HealthCheckConfig::default()
        };
        HealthChecker::new(config, pool, None).unwrap()
    }

    async fn closed_port() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        addr.to_string()
    }

    #[tokio::test]
    async fn reachable_backend_is_healthy_regardless_of_status() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/hc")
            .with_status(500)
            .with_body("not ok")
            .create_async()
            .await;

        let pool = BackendPool::new(vec![BackendConfig::new("a", server.host_with_port())]);
        pool.mark_unhealthy(0);
        let checker = checker(pool.clone(), 5);

        let results = checker.check_all_backends().await;
        mock.assert_async().await;
        assert!(results[0].healthy);
        assert!(results[0].error.is_none());
        assert!(pool.get(0).unwrap().is_healthy());
        assert!(pool.get(0).unwrap().last_health_check().is_some());
    }

    #[tokio::test]
    async fn unreachable_backend_is_marked_unhealthy() {
        let pool = BackendPool::new(vec![BackendConfig::new("gone", closed_port().await)]);
        let checker = checker(pool.clone(), 5);

        let results = checker.check_all_backends().await;
        assert!(!results[0].healthy);
        assert!(results[0].error.is_some());
        assert!(!pool.get(0).unwrap().is_healthy());
    }

    #[tokio::test]
    async fn each_cycle_overwrites_previous_verdict() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server.mock("GET", "/hc").expect_at_least(1).create_async().await;
        let pool = BackendPool::new(vec![
            BackendConfig::new("up", server.host_with_port()),
            BackendConfig::new("down", closed_port().await),
        ]);
        pool.mark_unhealthy(0);
        let checker = checker(pool.clone(), 5);

        checker.check_all_backends().await;
        assert!(pool.get(0).unwrap().is_healthy());
        assert!(!pool.get(1).unwrap().is_healthy());
        assert_eq!(pool.healthy_count(), 1);
    }

    #[tokio::test]
    async fn hung_probe_times_out() {
        // Accepts but never answers.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _hold = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let pool = BackendPool::new(vec![BackendConfig::new("slow", addr.to_string())]);
        let checker = checker(pool.clone(), 1);

        let result = tokio::time::timeout(Duration::from_secs(5), checker.check_all_backends())
            .await
            .expect("probe should respect its own deadline");
        assert!(!result[0].healthy);
        assert!(result[0].error.as_deref().unwrap().contains("timed out"));
    }
}
