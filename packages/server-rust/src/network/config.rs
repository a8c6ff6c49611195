//! Network configuration types for the `RowSync` server.

use std::time::Duration;

/// Top-level network configuration for the HTTP adapter.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Bind address for the server.
    pub host: String,
    /// Port to listen on. 0 means OS-assigned.
    pub port: u16,
    /// Allowed CORS origins.
    pub cors_origins: Vec<String>,
    /// Maximum time to wait for a request to complete.
    pub request_timeout: Duration,
    /// Largest accepted request body in bytes.
    pub max_body_bytes: usize,
    /// Maximum time to wait for in-flight requests after shutdown starts.
    pub drain_timeout: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 0,
            cors_origins: vec!["*".to_string()],
            request_timeout: Duration::from_secs(30),
            max_body_bytes: 8 * 1024 * 1024,
            drain_timeout: Duration::from_secs(30),
        }
    }
}

impl NetworkConfig {
    /// `host:port` string for binding.
    #[must_use]
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_config_defaults() {
        let config = NetworkConfig::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 0);
        assert_eq!(config.cors_origins, vec!["*"]);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.max_body_bytes, 8 * 1024 * 1024);
        assert_eq!(config.bind_addr(), "0.0.0.0:0");
    }
}
