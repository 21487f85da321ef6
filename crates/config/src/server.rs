//! Front door and health checking configuration.

use serde::Deserialize;

/// HTTP front door settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "camelCase")]
pub struct ServerConfig {
    /// Bind host.
    pub host: String,
    /// Bind port.
    pub port: u16,
    /// Maximum accepted request body size in bytes.
    pub max_body_bytes: usize,
    /// Per-attempt read timeout in milliseconds.
    pub read_timeout: u64,
    /// Whole-request deadline in milliseconds, including retries.
    pub overall_timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3456,
            max_body_bytes: 10 * 1024 * 1024,
            read_timeout: 60_000,
            overall_timeout: 300_000,
        }
    }
}

/// Health probing and circuit breaker thresholds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "camelCase")]
pub struct HealthCheckConfig {
    /// Consecutive failures that open a provider's circuit.
    pub failure_threshold: u32,
    /// How long an open circuit rejects before probing, in milliseconds.
    pub recovery_time: u64,
    /// Successful half-open probes required to close the circuit.
    pub half_open_retries: u32,
    /// Interval between background health probes, in milliseconds.
    pub check_interval: u64,
    /// Minimum quality score for a provider to count as healthy.
    pub min_quality: f64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_time: 60_000,
            half_open_retries: 2,
            check_interval: 30_000,
            min_quality: 70.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_defaults() {
        let server = ServerConfig::default();

        assert_eq!(server.port, 3456);
        assert_eq!(server.max_body_bytes, 10 * 1024 * 1024);
    }

    #[test]
    fn health_defaults_match_documented_values() {
        let health = HealthCheckConfig::default();

        assert_eq!(health.check_interval, 30_000);
        assert_eq!(health.min_quality, 70.0);
    }
}
