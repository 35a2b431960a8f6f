use serde::{Deserialize, Serialize};
use std::time::Duration;

/// HTTP server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerConfig {
    /// Port for the JSON-RPC surface.
    ///
    /// Default: 4000
    pub http_port: u16,
    /// Bind address.
    pub http_host: String,
    /// Maximum accepted request body size in bytes.
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { http_port: 4000, http_host: "0.0.0.0".to_owned(), max_body_size: 4 * 1024 * 1024 }
    }
}

/// Metrics exporter configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MetricsConfig {
    /// Whether the Prometheus exporter is installed.
    pub enabled: bool,
    /// Exporter port.
    ///
    /// Default: 4001
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true, port: 4001 }
    }
}

/// CORS settings applied by the HTTP surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CorsConfig {
    /// Allowed origins.
    pub allowed_origins: Vec<String>,
    /// Allowed methods.
    pub allowed_methods: Vec<String>,
    /// Allowed headers.
    pub allowed_headers: Vec<String>,
    /// Preflight cache lifetime in seconds.
    pub max_age: u64,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec!["*".to_owned()],
            allowed_methods: ["GET", "POST", "OPTIONS"].map(str::to_owned).to_vec(),
            allowed_headers: ["content-type", "authorization", "x-manifold-secret-token"]
                .map(str::to_owned)
                .to_vec(),
            max_age: 3600,
        }
    }
}

/// Health check surface configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HealthCheckConfig {
    /// Whether `/healthcheck` is served.
    pub enabled: bool,
    /// How stale an upstream's poller state may be before the gateway
    /// reports itself degraded.
    #[serde(with = "humantime_serde")]
    pub max_poller_staleness: Duration,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self { enabled: true, max_poller_staleness: Duration::from_secs(300) }
    }
}
