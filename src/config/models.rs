// src/config/models.rs
use anyhow::{bail, ensure, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub backends: Vec<BackendConfig>,
    pub health_check: HealthCheckConfig,
    pub forwarding: ForwardingConfig,
    pub metrics: MetricsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 80)),
            backends: vec![
                BackendConfig::new("backend-1", "localhost:8080"),
                BackendConfig::new("backend-2", "localhost:8081"),
            ],
            health_check: HealthCheckConfig::default(),
            forwarding: ForwardingConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        ensure!(!self.backends.is_empty(), "at least one backend must be configured");

        let mut names = HashSet::new();
        for backend in &self.backends {
            ensure!(!backend.name.is_empty(), "backend name must not be empty");
            ensure!(
                names.insert(backend.name.as_str()),
                "duplicate backend name: {}",
                backend.name
            );
            validate_address(&backend.address)?;
        }

        self.health_check.validate()?;
        self.forwarding.validate()?;
        Ok(())
    }
}

/// Accepts `host:port` only; schemes and paths are rejected.
fn validate_address(address: &str) -> Result<()> {
    if address.contains("://") || address.contains('/') {
        bail!("backend address must be host:port, got {address:?}");
    }
    let port_ok = address
        .rsplit_once(':')
        .map(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok())
        .unwrap_or(false);
    ensure!(port_ok, "backend address must be host:port, got {address:?}");

    let url = Url::parse(&format!("http://{address}"))?;
    ensure!(url.host_str().is_some(), "backend address has no host: {address:?}");
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig {
    pub name: String,
    pub address: String,
}

impl BackendConfig {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub enabled: bool,
    pub path: String,
    pub interval_secs: u64,
    pub timeout_secs: u64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: "/hc".to_string(),
            interval_secs: 10,
            timeout_secs: 5,
        }
    }
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    fn validate(&self) -> Result<()> {
        ensure!(self.interval_secs > 0, "health_check.interval_secs must be positive");
        ensure!(self.timeout_secs > 0, "health_check.timeout_secs must be positive");
        ensure!(
            self.path.starts_with('/'),
            "health_check.path must start with '/', got {:?}",
            self.path
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwardingConfig {
    /// Number of forwarding workers draining the dispatch queue. One keeps
    /// strict FIFO forwarding; more trades ordering for concurrency.
    pub workers: usize,
    pub queue_capacity: usize,
    pub timeout_secs: u64,
    pub request_read_timeout_secs: u64,
    /// Largest request body accepted from a client, after chunked decoding.
    pub max_body_bytes: usize,
}

impl Default for ForwardingConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            queue_capacity: 1,
            timeout_secs: 30,
            request_read_timeout_secs: 30,
            max_body_bytes: 10 * 1024 * 1024,
        }
    }
}

impl ForwardingConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn request_read_timeout(&self) -> Duration {
        Duration::from_secs(self.request_read_timeout_secs)
    }

    fn validate(&self) -> Result<()> {
        ensure!(self.workers > 0, "forwarding.workers must be at least 1");
        ensure!(self.queue_capacity > 0, "forwarding.queue_capacity must be at least 1");
        ensure!(self.timeout_secs > 0, "forwarding.timeout_secs must be positive");
        ensure!(
            self.request_read_timeout_secs > 0,
            "forwarding.request_read_timeout_secs must be positive"
        );
        ensure!(self.max_body_bytes > 0, "forwarding.max_body_bytes must be positive");
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9090,
            path: "/metrics".to_string(),
        }
    }
}
